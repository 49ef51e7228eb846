use crate::image::{MaskedImage, Pixel};
use ndarray::Zip;
use serde::Serialize;

/// Normalized residual statistics of a difference image.
///
/// Each unmasked pixel with positive variance contributes `pixel / sqrt(variance)`;
/// for a good subtraction these are distributed with mean 0 and rms 1.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ImageStatistics {
    pub mean: f64,
    pub rms: f64,
    pub npix: usize,
}

impl ImageStatistics {
    /// Mean and rms are NaN when no pixel qualifies.
    pub fn compute<P: Pixel>(difference: &MaskedImage<P>) -> Self {
        let (sum, sum_sq, npix) = Zip::from(&difference.image().view())
            .and(&difference.mask().view())
            .and(&difference.variance().view())
            .fold((0.0, 0.0, 0usize), |(sum, sum_sq, npix), &pixel, &bits, &var| {
                let (pixel, var): (f64, f64) = (pixel.into(), var.into());
                if bits != 0 || var <= 0.0 {
                    return (sum, sum_sq, npix);
                }
                let residual = pixel / var.sqrt();
                (sum + residual, sum_sq + residual * residual, npix + 1)
            });

        if npix == 0 {
            return Self {
                mean: f64::NAN,
                rms: f64::NAN,
                npix,
            };
        }
        let n = npix as f64;
        let mean = sum / n;
        let rms = (sum_sq / n - mean * mean).max(0.0).sqrt();
        Self { mean, rms, npix }
    }

    /// True when `|mean| <= max_mean` and `rms <= max_std`.
    pub fn evaluate_quality(&self, max_mean: f64, max_std: f64) -> bool {
        if self.npix == 0 {
            return false;
        }
        if self.mean.abs() > max_mean {
            log::trace!("Residual mean {:.3} exceeds {:.3}", self.mean, max_mean);
            return false;
        }
        if self.rms > max_std {
            log::trace!("Residual rms {:.3} exceeds {:.3}", self.rms, max_std);
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{Image, Mask, mask_planes};
    use approx::assert_abs_diff_eq;
    use ndarray::Array2;

    #[test]
    fn residuals_are_normalized_by_sigma() {
        // Alternating +2 / -2 with variance 4: residuals are +1 / -1.
        let image = Image::from_fn(4, 4, |x, y| if (x + y) % 2 == 0 { 2.0 } else { -2.0 });
        let difference = MaskedImage::from_image(image, 4.0f64);
        let stats = ImageStatistics::compute(&difference);
        assert_eq!(stats.npix, 16);
        assert_abs_diff_eq!(stats.mean, 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(stats.rms, 1.0, epsilon = 1e-12);
        assert!(stats.evaluate_quality(0.1, 1.5));
        assert!(!stats.evaluate_quality(0.1, 0.5));
    }

    #[test]
    fn masked_and_zero_variance_pixels_are_skipped() {
        let image = Image::from_elem(3, 1, 6.0f32);
        let mut mask = Mask::new(3, 1);
        mask.set_bits(0, 0, mask_planes::BAD);
        let variance = Image::new(Array2::from_shape_vec((1, 3), vec![1.0, 0.0, 9.0]).unwrap());
        let difference = MaskedImage::new(image, mask, variance).unwrap();

        let stats = ImageStatistics::compute(&difference);
        assert_eq!(stats.npix, 1);
        assert_abs_diff_eq!(stats.mean, 2.0, epsilon = 1e-6);
        assert_abs_diff_eq!(stats.rms, 0.0, epsilon = 1e-6);
        assert!(!stats.evaluate_quality(1.0, 1.0));
    }

    #[test]
    fn empty_statistics_never_pass() {
        let image = Image::from_elem(2, 2, 1.0f64);
        let difference = MaskedImage::from_image(image, 0.0);
        let stats = ImageStatistics::compute(&difference);
        assert_eq!(stats.npix, 0);
        assert!(stats.mean.is_nan());
        assert!(!stats.evaluate_quality(f64::INFINITY, f64::INFINITY));
    }
}
