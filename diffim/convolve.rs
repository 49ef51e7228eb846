//! The convolution contract the solver and the subtraction step are written against,
//! a direct-stencil implementation of it, and the convolve-and-subtract step that
//! turns a fitted kernel into a difference image.

use crate::background::{Background, add_background};
use crate::basis::LinearCombinationKernel;
use crate::image::{Image, ImageError, Mask, MaskPixel, MaskedImage, Pixel, mask_planes};
use ndarray::{Array2, ArrayView2, ArrayViewMut2, Zip, s};
use std::ops::Range;

/// The interior of a convolved image that a kernel fully supports.
///
/// For a kernel of width `w` centered at column `c`, the first usable column is `c`
/// and the end (exclusive) is `width - (w - c) + 1`; rows follow the same rule. With
/// `w = 5`, `c = 2` and a 100 pixel wide image, columns `2..98` are usable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidRegion {
    pub cols: Range<usize>,
    pub rows: Range<usize>,
}

impl ValidRegion {
    /// `None` when the image is too small to hold a single supported pixel.
    pub fn new(
        width: usize,
        height: usize,
        kernel_width: usize,
        kernel_height: usize,
        ctr_x: usize,
        ctr_y: usize,
    ) -> Option<Self> {
        let end_col = width as isize - (kernel_width as isize - ctr_x as isize) + 1;
        let end_row = height as isize - (kernel_height as isize - ctr_y as isize) + 1;
        if end_col <= ctr_x as isize || end_row <= ctr_y as isize {
            return None;
        }
        Some(Self {
            cols: ctr_x..end_col as usize,
            rows: ctr_y..end_row as usize,
        })
    }

    pub fn num_pixels(&self) -> usize {
        self.cols.len() * self.rows.len()
    }

    pub fn contains(&self, col: usize, row: usize) -> bool {
        self.cols.contains(&col) && self.rows.contains(&row)
    }
}

/// Convolution of one plane with one kernel stencil.
///
/// Implementations write `out(x, y) = sum_ij K(i, j) * in(x + i - ctr_x, y + j - ctr_y)`
/// over the [`ValidRegion`] and zero everywhere else. With `normalize`, the kernel is
/// scaled to unit sum first.
pub trait Convolver {
    fn convolve(
        &self,
        output: ArrayViewMut2<'_, f64>,
        input: ArrayView2<'_, f64>,
        kernel: ArrayView2<'_, f64>,
        ctr_x: usize,
        ctr_y: usize,
        normalize: bool,
    );
}

/// Straightforward stencil convolution, `O(pixels * kernel area)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectConvolver;

impl Convolver for DirectConvolver {
    fn convolve(
        &self,
        mut output: ArrayViewMut2<'_, f64>,
        input: ArrayView2<'_, f64>,
        kernel: ArrayView2<'_, f64>,
        ctr_x: usize,
        ctr_y: usize,
        normalize: bool,
    ) {
        debug_assert_eq!(output.dim(), input.dim());
        output.fill(0.0);

        let (height, width) = input.dim();
        let (kernel_height, kernel_width) = kernel.dim();
        let Some(region) =
            ValidRegion::new(width, height, kernel_width, kernel_height, ctr_x, ctr_y)
        else {
            return;
        };

        let scale = match kernel.sum() {
            sum if normalize && sum != 0.0 => 1.0 / sum,
            _ => 1.0,
        };

        for y in region.rows.clone() {
            let top = y - ctr_y;
            for x in region.cols.clone() {
                let left = x - ctr_x;
                let window = input.slice(s![top..top + kernel_height, left..left + kernel_width]);
                let value = Zip::from(&window)
                    .and(&kernel)
                    .fold(0.0, |acc, &pixel, &weight| acc + pixel * weight);
                output[[y, x]] = value * scale;
            }
        }
    }
}

/// Forms the difference image `(K * T + bg) - S`, or its negation when `invert` is
/// set.
///
/// The variance plane is the template variance convolved with the squared kernel
/// plus the science variance. The mask is the template mask convolved through the
/// kernel's non-zero support, ORed with the science mask; outside the supported
/// interior both masks are kept pixel by pixel and [`mask_planes::EDGE`] is set.
pub fn convolve_and_subtract<P, B, C>(
    template: &MaskedImage<P>,
    science: &MaskedImage<P>,
    kernel: &LinearCombinationKernel,
    background: &B,
    invert: bool,
    convolver: &C,
) -> Result<MaskedImage<P>, ImageError>
where
    P: Pixel,
    B: Background + ?Sized,
    C: Convolver + ?Sized,
{
    let expected = template.dimensions();
    if science.dimensions() != expected {
        return Err(ImageError::DimensionMismatch {
            expected,
            found: science.dimensions(),
        });
    }
    let (width, height) = expected;
    let (x0, y0) = (template.x0(), template.y0());
    let (ctr_x, ctr_y) = (kernel.ctr_x(), kernel.ctr_y());

    log::trace!("Convolving {width}x{height} template with a {}x{} kernel", kernel.width(), kernel.height());

    let stencil = kernel.compute_image(false);
    let mut convolved = Array2::<f64>::zeros((height, width));
    convolver.convolve(
        convolved.view_mut(),
        template.image().to_f64().view(),
        stencil.view(),
        ctr_x,
        ctr_y,
        false,
    );
    add_background(convolved.view_mut(), x0, y0, background);

    let sign = if invert { -1.0 } else { 1.0 };
    let science_pixels = science.image().to_f64();
    let difference = Zip::from(&convolved)
        .and(&science_pixels)
        .map_collect(|&model, &observed| P::from_f64(sign * (model - observed)));

    let squared = stencil.mapv(|k| k * k);
    let mut variance = Array2::<f64>::zeros((height, width));
    convolver.convolve(
        variance.view_mut(),
        template.variance().to_f64().view(),
        squared.view(),
        ctr_x,
        ctr_y,
        false,
    );
    let science_variance = science.variance().to_f64();
    let variance = Zip::from(&variance)
        .and(&science_variance)
        .map_collect(|&t, &s| P::from_f64(t + s));

    let region = ValidRegion::new(width, height, kernel.width(), kernel.height(), ctr_x, ctr_y);
    let mut mask = Array2::<MaskPixel>::zeros((height, width));
    if let Some(region) = &region {
        convolve_mask(
            mask.view_mut(),
            template.mask().view(),
            stencil.view(),
            ctr_x,
            ctr_y,
            region,
        );
    }
    Zip::indexed(&mut mask)
        .and(&template.mask().view())
        .and(&science.mask().view())
        .for_each(|(row, col), bits, &t, &s| {
            if region.as_ref().is_some_and(|r| r.contains(col, row)) {
                *bits |= s;
            } else {
                *bits = t | s | mask_planes::EDGE;
            }
        });

    MaskedImage::new(
        Image::with_origin(difference, x0, y0),
        Mask::with_origin(mask, x0, y0),
        Image::with_origin(variance, x0, y0),
    )
}

/// Every supported output pixel collects the bits of each input pixel that feeds it
/// through a non-zero kernel weight.
fn convolve_mask(
    mut output: ArrayViewMut2<'_, MaskPixel>,
    input: ArrayView2<'_, MaskPixel>,
    kernel: ArrayView2<'_, f64>,
    ctr_x: usize,
    ctr_y: usize,
    region: &ValidRegion,
) {
    let support: Vec<(usize, usize)> = kernel
        .indexed_iter()
        .filter(|&(_, &weight)| weight != 0.0)
        .map(|(offset, _)| offset)
        .collect();

    for y in region.rows.clone() {
        let top = y - ctr_y;
        for x in region.cols.clone() {
            let left = x - ctr_x;
            output[[y, x]] = support
                .iter()
                .fold(0, |bits, &(j, i)| bits | input[[top + j, left + i]]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basis::delta_function_basis;
    use ndarray::array;
    use std::sync::Arc;

    #[test]
    fn valid_region_excludes_unsupported_border() {
        let region = ValidRegion::new(100, 40, 5, 3, 2, 1).unwrap();
        assert_eq!(region.cols, 2..98);
        assert_eq!(region.rows, 1..39);
        assert_eq!(region.num_pixels(), 96 * 38);

        assert!(ValidRegion::new(4, 4, 5, 5, 2, 2).is_none());
    }

    #[test]
    fn delta_kernel_convolution_shifts_pixels() {
        let input = Array2::from_shape_fn((5, 6), |(y, x)| (10 * y + x) as f64);
        let mut output = Array2::zeros((5, 6));
        // Unit pixel at (2, 1) in a 3x3 kernel centered at (1, 1): out(x, y) = in(x + 1, y).
        let mut kernel = Array2::zeros((3, 3));
        kernel[[1, 2]] = 1.0;
        DirectConvolver.convolve(output.view_mut(), input.view(), kernel.view(), 1, 1, false);

        assert_eq!(output[[1, 1]], input[[1, 2]]);
        assert_eq!(output[[3, 4]], input[[3, 5]]);
        assert_eq!(output[[0, 0]], 0.0);
        assert_eq!(output[[4, 5]], 0.0);
    }

    #[test]
    fn normalized_convolution_scales_by_kernel_sum() {
        let input = Array2::from_elem((4, 4), 3.0);
        let kernel = array![[1.0, 1.0], [1.0, 1.0]];
        let mut raw = Array2::zeros((4, 4));
        let mut normalized = Array2::zeros((4, 4));
        DirectConvolver.convolve(raw.view_mut(), input.view(), kernel.view(), 0, 0, false);
        DirectConvolver.convolve(normalized.view_mut(), input.view(), kernel.view(), 0, 0, true);

        assert_eq!(raw[[1, 1]], 12.0);
        assert_eq!(normalized[[1, 1]], 3.0);
    }

    #[test]
    fn subtracting_the_true_kernel_leaves_zero_interior() {
        let template = Image::from_fn(12, 10, |x, y| 50.0 + (x * y) as f64);
        let basis = Arc::new(delta_function_basis(3, 3).unwrap());
        let mut coefficients = vec![0.0; 9];
        coefficients[4] = 1.0;
        let kernel = LinearCombinationKernel::new(basis, coefficients).unwrap();

        let science = Image::from_fn(12, 10, |x, y| template.get(x, y) + 2.5);
        let template = MaskedImage::from_image(template, 1.0);
        let science = MaskedImage::from_image(science, 1.0);

        let diff =
            convolve_and_subtract(&template, &science, &kernel, &2.5, false, &DirectConvolver)
                .unwrap();
        for y in 1..9 {
            for x in 1..11 {
                assert_eq!(diff.image().get(x, y), 0.0);
                assert_eq!(diff.mask().get(x, y), 0);
                assert_eq!(diff.variance().get(x, y), 2.0);
            }
        }
        assert_eq!(diff.mask().get(0, 0), mask_planes::EDGE);

        let inverted =
            convolve_and_subtract(&template, &science, &kernel, &0.0, true, &DirectConvolver)
                .unwrap();
        assert_eq!(inverted.image().get(5, 5), 2.5);
    }

    #[test]
    fn template_mask_follows_the_kernel_support() {
        let template = Image::from_fn(12, 10, |x, y| 20.0 + (x + 3 * y) as f64);
        let science = template.clone();
        let mut template = MaskedImage::from_image(template, 1.0);
        template.mask_mut().set_bits(5, 5, mask_planes::BAD);
        let mut science = MaskedImage::from_image(science, 1.0);
        science.mask_mut().set_bits(8, 3, mask_planes::SAT);

        // Unit pixel at stencil [1, 2]: out(x, y) = in(x + 1, y).
        let basis = Arc::new(delta_function_basis(3, 3).unwrap());
        let mut coefficients = vec![0.0; 9];
        coefficients[5] = 1.0;
        let kernel = LinearCombinationKernel::new(basis, coefficients).unwrap();

        let diff =
            convolve_and_subtract(&template, &science, &kernel, &0.0, true, &DirectConvolver)
                .unwrap();
        assert_eq!(diff.mask().get(4, 5), mask_planes::BAD);
        // Zero-weight neighbours do not spread the bit.
        assert_eq!(diff.mask().get(5, 5), 0);
        assert_eq!(diff.mask().get(6, 5), 0);
        assert_eq!(diff.mask().get(4, 4), 0);
        assert_eq!(diff.mask().get(8, 3), mask_planes::SAT);
        assert_eq!(diff.mask().get(0, 5), mask_planes::EDGE);
    }
}
