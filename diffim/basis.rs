use itertools::iproduct;
use ndarray::{Array2, ArrayView2, Zip};
use std::sync::Arc;
use thiserror::Error;

/// Every way a kernel, a basis, or a linear combination over a basis can be malformed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BasisError {
    #[error("Kernel dimensions must be positive, but were {width}x{height}.")]
    InvalidDimensions { width: usize, height: usize },

    #[error("Kernel center ({ctr_x}, {ctr_y}) lies outside a {width}x{height} kernel.")]
    InvalidCenter {
        ctr_x: usize,
        ctr_y: usize,
        width: usize,
        height: usize,
    },

    #[error("A kernel basis needs at least one element.")]
    EmptyBasis,

    #[error(
        "Basis element {index} has geometry {found:?} but the basis uses {expected:?} (width, height, ctr_x, ctr_y)."
    )]
    InconsistentElement {
        index: usize,
        expected: (usize, usize, usize, usize),
        found: (usize, usize, usize, usize),
    },

    #[error("A basis of {expected} kernels needs {expected} coefficients, but {found} were given.")]
    CoefficientCount { expected: usize, found: usize },

    #[error(
        "Gaussian sigma and degree lists must be non-empty and equally long, found {sigmas} sigmas and {degrees} degrees."
    )]
    GaussianSpec { sigmas: usize, degrees: usize },

    #[error("Gaussian sigma must be positive and finite, but was {0}.")]
    InvalidSigma(f64),
}

/// One fixed stencil of a kernel basis together with its center pixel.
#[derive(Debug, Clone, PartialEq)]
pub struct BasisKernel {
    stencil: Array2<f64>,
    ctr_x: usize,
    ctr_y: usize,
}

impl BasisKernel {
    /// Wraps a `[rows, cols]` stencil whose center pixel is `(ctr_x, ctr_y)`.
    pub fn new(stencil: Array2<f64>, ctr_x: usize, ctr_y: usize) -> Result<Self, BasisError> {
        let (height, width) = stencil.dim();
        if width == 0 || height == 0 {
            return Err(BasisError::InvalidDimensions { width, height });
        }
        if ctr_x >= width || ctr_y >= height {
            return Err(BasisError::InvalidCenter {
                ctr_x,
                ctr_y,
                width,
                height,
            });
        }
        Ok(Self {
            stencil,
            ctr_x,
            ctr_y,
        })
    }

    /// Stencil with the conventional center `((width - 1) / 2, (height - 1) / 2)`.
    pub fn centered(stencil: Array2<f64>) -> Result<Self, BasisError> {
        let (height, width) = stencil.dim();
        Self::new(
            stencil,
            width.saturating_sub(1) / 2,
            height.saturating_sub(1) / 2,
        )
    }

    /// A `width` x `height` stencil that is 1.0 at `(x, y)` and 0.0 elsewhere.
    pub fn delta(width: usize, height: usize, x: usize, y: usize) -> Result<Self, BasisError> {
        if width == 0 || height == 0 {
            return Err(BasisError::InvalidDimensions { width, height });
        }
        if x >= width || y >= height {
            return Err(BasisError::InvalidCenter {
                ctr_x: x,
                ctr_y: y,
                width,
                height,
            });
        }
        let mut stencil = Array2::zeros((height, width));
        stencil[[y, x]] = 1.0;
        Self::centered(stencil)
    }

    pub fn width(&self) -> usize {
        self.stencil.ncols()
    }

    pub fn height(&self) -> usize {
        self.stencil.nrows()
    }

    pub fn ctr_x(&self) -> usize {
        self.ctr_x
    }

    pub fn ctr_y(&self) -> usize {
        self.ctr_y
    }

    pub fn stencil(&self) -> ArrayView2<'_, f64> {
        self.stencil.view()
    }

    pub fn sum(&self) -> f64 {
        self.stencil.sum()
    }

    fn geometry(&self) -> (usize, usize, usize, usize) {
        (self.width(), self.height(), self.ctr_x, self.ctr_y)
    }
}

/// Ordered, immutable set of kernels whose weighted sum forms a matching kernel.
///
/// The element order is the index mapping of the normal equations, so it never
/// changes after construction. All elements share one geometry.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelBasis {
    kernels: Vec<BasisKernel>,
}

impl KernelBasis {
    pub fn new(kernels: Vec<BasisKernel>) -> Result<Self, BasisError> {
        let first = kernels.first().ok_or(BasisError::EmptyBasis)?;
        let expected = first.geometry();
        for (index, kernel) in kernels.iter().enumerate().skip(1) {
            let found = kernel.geometry();
            if found != expected {
                return Err(BasisError::InconsistentElement {
                    index,
                    expected,
                    found,
                });
            }
        }
        Ok(Self { kernels })
    }

    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    /// Always false; construction rejects empty bases.
    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, BasisKernel> {
        self.kernels.iter()
    }

    pub fn get(&self, index: usize) -> Option<&BasisKernel> {
        self.kernels.get(index)
    }

    pub fn width(&self) -> usize {
        self.kernels[0].width()
    }

    pub fn height(&self) -> usize {
        self.kernels[0].height()
    }

    pub fn ctr_x(&self) -> usize {
        self.kernels[0].ctr_x()
    }

    pub fn ctr_y(&self) -> usize {
        self.kernels[0].ctr_y()
    }
}

impl<'a> IntoIterator for &'a KernelBasis {
    type Item = &'a BasisKernel;
    type IntoIter = std::slice::Iter<'a, BasisKernel>;

    fn into_iter(self) -> Self::IntoIter {
        self.kernels.iter()
    }
}

/// Generates the delta-function basis: `width * height` kernels, each with a single
/// unit pixel, ordered row by row.
pub fn delta_function_basis(width: usize, height: usize) -> Result<KernelBasis, BasisError> {
    if width == 0 || height == 0 {
        return Err(BasisError::InvalidDimensions { width, height });
    }
    let kernels = iproduct!(0..height, 0..width)
        .map(|(row, col)| BasisKernel::delta(width, height, col, row))
        .collect::<Result<Vec<_>, _>>()?;
    KernelBasis::new(kernels)
}

/// Generates an Alard-Lupton basis of Gaussians modulated by polynomials.
///
/// For every `(sigma, degree)` pair the basis gains one kernel per monomial
/// `u^i v^j` with `i + j <= degree`, where `u` and `v` are the pixel offsets from the
/// center scaled to `[-1, 1]`. Kernels are `2 * half_width + 1` pixels square.
///
/// The first kernel is normalized to unit sum. Every other kernel has the first
/// kernel's multiple subtracted so that its sum is zero, and is then scaled to unit
/// L2 norm; only the first element therefore carries flux.
pub fn alard_lupton_basis(
    half_width: usize,
    sig_gauss: &[f64],
    deg_gauss: &[usize],
) -> Result<KernelBasis, BasisError> {
    if half_width == 0 {
        return Err(BasisError::InvalidDimensions {
            width: 1,
            height: 1,
        });
    }
    if sig_gauss.is_empty() || sig_gauss.len() != deg_gauss.len() {
        return Err(BasisError::GaussianSpec {
            sigmas: sig_gauss.len(),
            degrees: deg_gauss.len(),
        });
    }
    if let Some(&sigma) = sig_gauss.iter().find(|s| !(s.is_finite() && **s > 0.0)) {
        return Err(BasisError::InvalidSigma(sigma));
    }

    let size = 2 * half_width + 1;
    let scale = half_width as f64;
    let mut stencils: Vec<Array2<f64>> = Vec::new();
    for (&sigma, &degree) in sig_gauss.iter().zip(deg_gauss) {
        let two_sigma_sq = 2.0 * sigma * sigma;
        for ix in 0..=degree {
            for iy in 0..=(degree - ix) {
                let stencil = Array2::from_shape_fn((size, size), |(y, x)| {
                    let u = x as f64 - scale;
                    let v = y as f64 - scale;
                    let gauss = (-(u * u + v * v) / two_sigma_sq).exp();
                    gauss * (u / scale).powi(ix as i32) * (v / scale).powi(iy as i32)
                });
                stencils.push(stencil);
            }
        }
    }

    let mut stencils = stencils.into_iter();
    let mut first = match stencils.next() {
        Some(first) => first,
        None => return Err(BasisError::EmptyBasis),
    };
    first /= first.sum();

    let mut kernels = vec![BasisKernel::new(first.clone(), half_width, half_width)?];
    for mut stencil in stencils {
        let flux = stencil.sum();
        if flux != 0.0 {
            Zip::from(&mut stencil)
                .and(&first)
                .for_each(|value, &reference| *value -= flux * reference);
        }
        let norm = stencil.iter().map(|v| v * v).sum::<f64>().sqrt();
        if norm > 0.0 {
            stencil /= norm;
        }
        kernels.push(BasisKernel::new(stencil, half_width, half_width)?);
    }
    KernelBasis::new(kernels)
}

/// A kernel expressed as a weighted sum over a shared basis.
#[derive(Debug, Clone)]
pub struct LinearCombinationKernel {
    basis: Arc<KernelBasis>,
    coefficients: Vec<f64>,
}

impl LinearCombinationKernel {
    pub fn new(basis: Arc<KernelBasis>, coefficients: Vec<f64>) -> Result<Self, BasisError> {
        if coefficients.len() != basis.len() {
            return Err(BasisError::CoefficientCount {
                expected: basis.len(),
                found: coefficients.len(),
            });
        }
        Ok(Self {
            basis,
            coefficients,
        })
    }

    pub fn basis(&self) -> &Arc<KernelBasis> {
        &self.basis
    }

    pub fn coefficients(&self) -> &[f64] {
        &self.coefficients
    }

    pub fn width(&self) -> usize {
        self.basis.width()
    }

    pub fn height(&self) -> usize {
        self.basis.height()
    }

    pub fn ctr_x(&self) -> usize {
        self.basis.ctr_x()
    }

    pub fn ctr_y(&self) -> usize {
        self.basis.ctr_y()
    }

    /// Sum of the kernel image before any normalization.
    pub fn kernel_sum(&self) -> f64 {
        self.basis
            .iter()
            .zip(&self.coefficients)
            .map(|(kernel, &c)| c * kernel.sum())
            .sum()
    }

    /// Evaluates the weighted sum into a `[rows, cols]` image. With `normalize`, the
    /// image is divided by its sum unless that sum is zero.
    pub fn compute_image(&self, normalize: bool) -> Array2<f64> {
        let mut image = Array2::zeros((self.height(), self.width()));
        for (kernel, &c) in self.basis.iter().zip(&self.coefficients) {
            if c != 0.0 {
                image.scaled_add(c, &kernel.stencil());
            }
        }
        if normalize {
            let sum = image.sum();
            if sum != 0.0 {
                image /= sum;
            }
        }
        image
    }
}
