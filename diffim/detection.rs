//! The detection boundary: threshold description and the detector contract the
//! footprint selector drives. No detection algorithm lives in this crate.

use crate::footprint::Footprint;
use crate::image::{MaskedImage, Pixel};
use serde::{Deserialize, Serialize};

/// How a detection threshold is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThresholdType {
    /// Raw pixel value.
    Value,
    /// Multiple of the per-pixel standard deviation.
    Stdev,
    /// Multiple of the per-pixel variance.
    Variance,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Threshold {
    pub value: f64,
    pub kind: ThresholdType,
}

impl Threshold {
    pub fn new(value: f64, kind: ThresholdType) -> Self {
        Self { value, kind }
    }

    /// Pixel value a detection must exceed at a pixel with the given variance.
    pub fn cutoff(&self, variance: f64) -> f64 {
        match self.kind {
            ThresholdType::Value => self.value,
            ThresholdType::Stdev => self.value * variance.sqrt(),
            ThresholdType::Variance => self.value * variance,
        }
    }
}

/// Finds candidate footprints in an image.
///
/// Implementations return footprints of at least `npix_min` pixels above
/// `threshold`, in whatever order they choose; the selector never re-sorts them.
pub trait Detector<P: Pixel> {
    fn detect(&self, image: &MaskedImage<P>, threshold: Threshold, npix_min: usize)
    -> Vec<Footprint>;
}

impl<P, F> Detector<P> for F
where
    P: Pixel,
    F: Fn(&MaskedImage<P>, Threshold, usize) -> Vec<Footprint>,
{
    fn detect(
        &self,
        image: &MaskedImage<P>,
        threshold: Threshold,
        npix_min: usize,
    ) -> Vec<Footprint> {
        self(image, threshold, npix_min)
    }
}
