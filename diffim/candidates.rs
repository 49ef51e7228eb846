//! Kernel fits around the selected footprints.
//!
//! Every footprint is fitted independently, so the fits run in parallel with one
//! [`KernelSolver`] per rayon worker and the basis shared between them.

use crate::basis::KernelBasis;
use crate::config::PsfMatchConfig;
use crate::convolve::{Convolver, convolve_and_subtract};
use crate::footprint::Footprint;
use crate::image::{Image, ImageError, MaskedImage, Pixel};
use crate::solver::{KernelSolver, PsfMatchSolution, SolverError, check_kernel_size};
use crate::statistics::ImageStatistics;
use ndarray::Zip;
use rayon::prelude::*;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CandidateError {
    #[error("Footprint window could not be extracted: {0}")]
    Image(#[from] ImageError),

    #[error("Kernel fit failed: {0}")]
    Solver(#[from] SolverError),
}

/// A kernel fitted on one footprint and the quality of the subtraction it gives.
#[derive(Debug, Clone)]
pub struct KernelCandidate {
    pub footprint: Footprint,
    pub solution: PsfMatchSolution,
    /// Residual statistics of `science - (kernel * template + background)` over the
    /// footprint's bounding box.
    pub statistics: ImageStatistics,
}

impl KernelCandidate {
    /// Fits `solver` on the bounding box of `footprint`.
    ///
    /// The variance estimate is the sum of the two variance planes.
    pub fn fit<P: Pixel, C: Convolver>(
        solver: &mut KernelSolver<C>,
        template: &MaskedImage<P>,
        science: &MaskedImage<P>,
        footprint: &Footprint,
    ) -> Result<Self, CandidateError> {
        let bbox = footprint.bbox();
        let template = template.sub_image(&bbox)?;
        let science = science.sub_image(&bbox)?;

        let variance = Zip::from(&template.variance().view())
            .and(&science.variance().view())
            .map_collect(|&t, &s| {
                let (t, s): (f64, f64) = (t.into(), s.into());
                t + s
            });
        let variance = Image::with_origin(variance, bbox.x0, bbox.y0);

        let solution = solver.apply(template.image(), science.image(), &variance)?;
        let difference = convolve_and_subtract(
            &template,
            &science,
            &solution.kernel,
            &solution.background,
            true,
            solver.convolver(),
        )?;
        let statistics = ImageStatistics::compute(&difference);

        Ok(Self {
            footprint: footprint.clone(),
            solution,
            statistics,
        })
    }
}

/// Fits a kernel around every footprint, in parallel.
///
/// Candidates come back in footprint order. A footprint whose window cannot be
/// extracted or whose fit fails is logged and left out; only a basis that does not
/// match the configured kernel size fails the whole call.
pub fn fit_candidates<P: Pixel>(
    template: &MaskedImage<P>,
    science: &MaskedImage<P>,
    footprints: &[Footprint],
    basis: &Arc<KernelBasis>,
    config: &PsfMatchConfig,
) -> Result<Vec<KernelCandidate>, SolverError> {
    check_kernel_size(basis, config)?;

    let results: Vec<Result<KernelCandidate, CandidateError>> = footprints
        .par_iter()
        .map_init(
            || KernelSolver::new(Arc::clone(basis)),
            |solver, footprint| KernelCandidate::fit(solver, template, science, footprint),
        )
        .collect();

    let mut candidates = Vec::with_capacity(results.len());
    for (footprint, result) in footprints.iter().zip(results) {
        match result {
            Ok(candidate) => candidates.push(candidate),
            Err(e) => log::warn!("Rejecting kernel candidate at {:?}: {e}", footprint.bbox()),
        }
    }
    log::info!(
        "Fitted kernels on {} of {} footprints",
        candidates.len(),
        footprints.len()
    );
    Ok(candidates)
}
