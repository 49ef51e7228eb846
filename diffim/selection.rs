//! Adaptive selection of clean footprints to fit kernels on.
//!
//! Detection runs on the template at a starting threshold. Every candidate is grown by
//! a kernel-sized margin and kept only if the grown region lies inside both images and
//! touches no masked pixel in either. While too few candidates survive, the threshold
//! is scaled down and detection runs again, until the configured floor is reached.

use crate::config::{ConfigError, PsfMatchConfig};
use crate::detection::{Detector, Threshold};
use crate::footprint::{FindSetBits, Footprint};
use crate::image::{ImageError, MaskPixel, MaskedImage, Pixel};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SelectionError {
    #[error(
        "Unable to find any footprints for Psf matching after {iterations} detection passes (threshold fell to {final_threshold:.3})."
    )]
    NoFootprints {
        final_threshold: f64,
        iterations: usize,
    },

    #[error("Invalid footprint selection settings: {0}")]
    Config(#[from] ConfigError),
}

/// The clean footprints of the last detection pass.
#[derive(Debug, Clone, Serialize)]
pub struct FootprintSelection {
    /// Grown footprints in detector order.
    pub footprints: Vec<Footprint>,
    /// Threshold of the pass that produced `footprints`.
    pub threshold: f64,
    /// Detection passes run.
    pub iterations: usize,
}

/// Why a candidate was not kept.
#[derive(Debug)]
enum Rejection {
    TooManyPixels(usize),
    Extraction(ImageError),
    MaskedInTemplate(MaskPixel),
    MaskedInScience(MaskPixel),
}

struct SelectionState {
    threshold: f64,
    clean: usize,
    accepted: Vec<Footprint>,
    iterations: usize,
}

impl SelectionState {
    fn new(threshold: f64) -> Self {
        Self {
            threshold,
            clean: 0,
            accepted: Vec::new(),
            iterations: 0,
        }
    }

    fn wants_another_pass(&self, config: &PsfMatchConfig) -> bool {
        self.clean < config.min_clean_fp && self.threshold > config.det_threshold_min
    }
}

/// Runs the adaptive detection loop and returns the clean, grown footprints.
///
/// Each pass starts from an empty list, so the result holds only the footprints of the
/// final pass. Candidates whose grown region falls outside either image are skipped
/// without counting for or against the pass.
pub fn select_footprints<P, D>(
    template: &MaskedImage<P>,
    science: &MaskedImage<P>,
    config: &PsfMatchConfig,
    detector: &D,
) -> Result<FootprintSelection, SelectionError>
where
    P: Pixel,
    D: Detector<P> + ?Sized,
{
    config.validate()?;
    let grow_pixels = config.grow_pixels();

    let mut template_bits = FindSetBits::new(template.mask());
    let mut science_bits = FindSetBits::new(science.mask());

    let mut state = SelectionState::new(config.det_threshold);
    let mut detected_at = config.det_threshold;
    while state.wants_another_pass(config) {
        state.accepted.clear();
        state.clean = 0;
        state.iterations += 1;
        detected_at = state.threshold;

        let threshold = Threshold::new(state.threshold, config.det_threshold_type);
        let candidates = detector.detect(template, threshold, config.fp_npix_min);
        log::debug!(
            "Found {} total footprints above threshold {:.3}",
            candidates.len(),
            state.threshold
        );

        for candidate in &candidates {
            let screened = screen(
                candidate,
                grow_pixels,
                template,
                science,
                config,
                &mut template_bits,
                &mut science_bits,
            );
            match screened {
                Ok(grown) => {
                    state.accepted.push(grown);
                    state.clean += 1;
                }
                Err(Rejection::TooManyPixels(npix)) => {
                    log::trace!(
                        "Footprint has too many pix: {npix} (max = {})",
                        config.fp_npix_max
                    );
                }
                Err(Rejection::Extraction(e)) => {
                    log::debug!("Exception caught extracting Footprint: {e}");
                }
                Err(Rejection::MaskedInTemplate(bits)) => {
                    log::trace!("Footprint has bad pix in template (mask {bits:#x})");
                }
                Err(Rejection::MaskedInScience(bits)) => {
                    log::trace!("Footprint has bad pix in science image (mask {bits:#x})");
                }
            }
        }

        state.threshold *= config.det_threshold_scaling;
    }

    if state.accepted.is_empty() {
        return Err(SelectionError::NoFootprints {
            final_threshold: state.threshold,
            iterations: state.iterations,
        });
    }

    log::info!(
        "Found {} clean footprints above threshold {:.3}",
        state.accepted.len(),
        detected_at
    );
    Ok(FootprintSelection {
        footprints: state.accepted,
        threshold: detected_at,
        iterations: state.iterations,
    })
}

fn screen<P: Pixel>(
    candidate: &Footprint,
    grow_pixels: usize,
    template: &MaskedImage<P>,
    science: &MaskedImage<P>,
    config: &PsfMatchConfig,
    template_bits: &mut FindSetBits<'_>,
    science_bits: &mut FindSetBits<'_>,
) -> Result<Footprint, Rejection> {
    let npix = candidate.npix();
    if npix > config.fp_npix_max {
        return Err(Rejection::TooManyPixels(npix));
    }

    let grown = candidate.grow(grow_pixels, false);
    let bbox = grown.bbox();
    log::trace!(
        "Footprint {:?} grown by {grow_pixels} pixels to {bbox:?} (center {:?})",
        candidate.bbox(),
        candidate.bbox().center()
    );

    template
        .image()
        .sub_image(&bbox)
        .and_then(|_| science.image().sub_image(&bbox))
        .map_err(Rejection::Extraction)?;

    template_bits.apply(&grown);
    if template_bits.bits() != 0 {
        return Err(Rejection::MaskedInTemplate(template_bits.bits()));
    }
    science_bits.apply(&grown);
    if science_bits.bits() != 0 {
        return Err(Rejection::MaskedInScience(science_bits.bits()));
    }
    Ok(grown)
}
