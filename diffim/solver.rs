//! The Alard-Lupton kernel solver.
//!
//! Given a template, a science image and a per-pixel variance estimate on a common
//! grid, [`KernelSolver::apply`] finds the coefficients `a_k` and the background `bg`
//! minimizing
//!
//! ```text
//! sum_xy (S(x, y) - sum_k a_k (B_k * T)(x, y) - bg)^2 / var(x, y)
//! ```
//!
//! over the pixels every basis kernel fully supports. The last parameter of every
//! vector in this module is the background.

use crate::basis::{BasisError, KernelBasis, LinearCombinationKernel};
use crate::config::PsfMatchConfig;
use crate::convolve::{Convolver, DirectConvolver, ValidRegion};
use crate::image::{Image, Pixel};
use crate::linalg::{
    ChainSolution, SolveChainExhausted, SolveStrategy, parameter_variances, solve_with_fallback,
};
use ndarray::{Array1, Array2, ArrayView2, s};
use ndarray_linalg::error::LinalgError;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// Failures of [`KernelSolver::apply`].
///
/// Besides solve and validation failures, the inputs are checked first: every pixel
/// of the fit region must carry a positive, finite variance, and the first one that
/// does not ends the fit with [`SolverError::InvalidVariance`].
#[derive(Error, Debug)]
pub enum SolverError {
    #[error("Template, science and variance images must share dimensions: expected {expected:?}, found {found:?}.")]
    DimensionMismatch {
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error("A {width}x{height} image cannot hold a single pixel fully supported by a {kernel_width}x{kernel_height} kernel.")]
    ImageTooSmall {
        width: usize,
        height: usize,
        kernel_width: usize,
        kernel_height: usize,
    },

    #[error("Configured kernel size {expected:?} does not match the {found:?} basis.")]
    KernelSizeMismatch {
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error("Variance at ({x}, {y}) must be positive and finite, but was {value}.")]
    InvalidVariance { x: usize, y: usize, value: f64 },

    #[error("Unable to determine kernel solution: {0}")]
    SolveFailed(#[from] SolveChainExhausted),

    #[error("Cholesky factorization of the parameter covariance failed: {0}")]
    CovarianceFactorization(LinalgError),

    #[error("Unable to determine kernel solution {index} (nan)")]
    CoefficientNan { index: usize },

    #[error("Unable to determine kernel uncertainty {index} (nan)")]
    UncertaintyNan { index: usize },

    #[error("Unable to determine kernel uncertainty, negative variance {index} ({value:.3e})")]
    NegativeVariance { index: usize, value: f64 },

    #[error("Kernel construction failed: {0}")]
    Basis(#[from] BasisError),
}

/// The symmetric system `M x = B` for `N` basis coefficients plus the background.
#[derive(Debug, Clone)]
pub struct NormalEquations {
    pub m: Array2<f64>,
    pub b: Array1<f64>,
    /// Pixels that contributed.
    pub num_pixels: usize,
}

impl NormalEquations {
    /// Accumulates the system over `region`.
    ///
    /// `convolved[k]` is the template convolved with basis kernel `k`; all planes are
    /// indexed `[row, col]`. Only the upper triangle is accumulated, the lower one is
    /// mirrored from it at the end.
    pub fn build(
        convolved: &[Array2<f64>],
        science: ArrayView2<'_, f64>,
        variance: ArrayView2<'_, f64>,
        region: &ValidRegion,
    ) -> Self {
        let n = convolved.len();
        let bg = n;
        let mut m = Array2::<f64>::zeros((n + 1, n + 1));
        let mut b = Array1::<f64>::zeros(n + 1);
        let mut values = vec![0.0; n];

        for row in region.rows.clone() {
            for col in region.cols.clone() {
                let observed = science[[row, col]];
                let weight = 1.0 / variance[[row, col]];
                for (value, plane) in values.iter_mut().zip(convolved) {
                    *value = plane[[row, col]];
                }

                for (i, &ci) in values.iter().enumerate() {
                    for (j, &cj) in values.iter().enumerate().skip(i) {
                        m[[i, j]] += ci * cj * weight;
                    }
                    b[i] += observed * ci * weight;
                    m[[i, bg]] += ci * weight;
                }
                b[bg] += observed * weight;
                m[[bg, bg]] += weight;
            }
        }

        for i in 0..=n {
            for j in i + 1..=n {
                m[[j, i]] = m[[i, j]];
            }
        }

        Self {
            m,
            b,
            num_pixels: region.num_pixels(),
        }
    }

    /// Number of parameters, `N + 1`.
    pub fn len(&self) -> usize {
        self.b.len()
    }

    pub fn is_empty(&self) -> bool {
        self.b.is_empty()
    }
}

/// Checks every parameter, in index order, for a NaN coefficient, a NaN variance and
/// a negative variance.
pub fn validate_solution(
    coefficients: &Array1<f64>,
    variances: &Array1<f64>,
) -> Result<(), SolverError> {
    for (index, (&coefficient, &variance)) in coefficients.iter().zip(variances).enumerate() {
        if coefficient.is_nan() {
            return Err(SolverError::CoefficientNan { index });
        }
        if variance.is_nan() {
            return Err(SolverError::UncertaintyNan { index });
        }
        if variance < 0.0 {
            return Err(SolverError::NegativeVariance {
                index,
                value: variance,
            });
        }
    }
    Ok(())
}

/// Everything one `apply` call produces.
#[derive(Debug, Clone, Serialize)]
pub struct PsfMatchSolution {
    /// All `N + 1` solved parameters, background last.
    pub coefficients: Array1<f64>,
    /// Diagonal of the propagated error matrix, background last.
    pub variances: Array1<f64>,
    /// Square roots of `variances`.
    pub uncertainties: Array1<f64>,
    /// The decomposition that produced `coefficients`.
    pub strategy: SolveStrategy,
    pub background: f64,
    pub background_error: f64,
    /// Pixels in the fitted region.
    pub num_pixels: usize,
    #[serde(skip)]
    pub kernel: LinearCombinationKernel,
    /// The basis weighted by the coefficient uncertainties.
    #[serde(skip)]
    pub kernel_error: LinearCombinationKernel,
}

/// Fits a PSF-matching kernel over a fixed basis.
///
/// `apply` takes `&mut self`, so one instance serves one call at a time; give each
/// worker its own solver and share the basis. Nothing from a previous call is visible
/// in the next one: the convolved basis images are the only state kept between calls
/// and they are cleared before any work starts.
#[derive(Debug)]
pub struct KernelSolver<C = DirectConvolver> {
    basis: Arc<KernelBasis>,
    convolver: C,
    convolved: Vec<Array2<f64>>,
}

impl KernelSolver<DirectConvolver> {
    pub fn new(basis: Arc<KernelBasis>) -> Self {
        Self::with_convolver(basis, DirectConvolver)
    }

    /// A solver whose basis must agree with the configured kernel size.
    pub fn from_config(
        basis: Arc<KernelBasis>,
        config: &PsfMatchConfig,
    ) -> Result<Self, SolverError> {
        check_kernel_size(&basis, config)?;
        Ok(Self::new(basis))
    }
}

/// Fails unless `basis` has the `kernelCols` x `kernelRows` geometry of `config`.
pub fn check_kernel_size(basis: &KernelBasis, config: &PsfMatchConfig) -> Result<(), SolverError> {
    let expected = (config.kernel_cols, config.kernel_rows);
    let found = (basis.width(), basis.height());
    if expected != found {
        return Err(SolverError::KernelSizeMismatch { expected, found });
    }
    Ok(())
}

impl<C: Convolver> KernelSolver<C> {
    pub fn with_convolver(basis: Arc<KernelBasis>, convolver: C) -> Self {
        let capacity = basis.len();
        Self {
            basis,
            convolver,
            convolved: Vec::with_capacity(capacity),
        }
    }

    pub fn basis(&self) -> &Arc<KernelBasis> {
        &self.basis
    }

    pub fn convolver(&self) -> &C {
        &self.convolver
    }

    fn reset(&mut self) {
        self.convolved.clear();
    }

    /// Solves for the kernel matching `template` to `science`.
    ///
    /// The three images must share dimensions; their origins are ignored and the
    /// pixels are taken as aligned. `variance` may use a different pixel type than the
    /// images, and must be positive and finite over the fit region.
    pub fn apply<P: Pixel, V: Pixel>(
        &mut self,
        template: &Image<P>,
        science: &Image<P>,
        variance: &Image<V>,
    ) -> Result<PsfMatchSolution, SolverError> {
        self.reset();

        let expected = template.dimensions();
        for found in [science.dimensions(), variance.dimensions()] {
            if found != expected {
                return Err(SolverError::DimensionMismatch { expected, found });
            }
        }
        let (width, height) = expected;
        let basis = Arc::clone(&self.basis);
        let region = ValidRegion::new(
            width,
            height,
            basis.width(),
            basis.height(),
            basis.ctr_x(),
            basis.ctr_y(),
        )
        .ok_or(SolverError::ImageTooSmall {
            width,
            height,
            kernel_width: basis.width(),
            kernel_height: basis.height(),
        })?;

        let variance = variance.to_f64();
        for row in region.rows.clone() {
            for col in region.cols.clone() {
                let value = variance[[row, col]];
                if !(value.is_finite() && value > 0.0) {
                    return Err(SolverError::InvalidVariance {
                        x: col,
                        y: row,
                        value,
                    });
                }
            }
        }

        let timer = Instant::now();
        let input = template.to_f64();
        for kernel in basis.iter() {
            let mut output = Array2::<f64>::zeros((height, width));
            self.convolver.convolve(
                output.view_mut(),
                input.view(),
                kernel.stencil(),
                kernel.ctr_x(),
                kernel.ctr_y(),
                false,
            );
            self.convolved.push(output);
        }
        log::debug!(
            "Total compute time to do {} basis convolutions: {:.2?}",
            basis.len(),
            timer.elapsed()
        );

        let timer = Instant::now();
        let science = science.to_f64();
        log::trace!(
            "Image range: {} {} -> {} {}",
            region.cols.start,
            region.rows.start,
            region.cols.end,
            region.rows.end
        );
        let equations =
            NormalEquations::build(&self.convolved, science.view(), variance.view(), &region);
        log::debug!(
            "Total compute time to step through {} pixels: {:.2?}",
            equations.num_pixels,
            timer.elapsed()
        );

        let timer = Instant::now();
        let ChainSolution { solution, strategy } = solve_with_fallback(&equations.m, &equations.b)?;
        if strategy != SolveStrategy::Ldlt {
            log::warn!("Kernel solution required fallback to {strategy}");
        }
        let variances =
            parameter_variances(&equations.m).map_err(SolverError::CovarianceFactorization)?;
        log::debug!(
            "Total compute time to do matrix math: {:.2?}",
            timer.elapsed()
        );

        validate_solution(&solution, &variances)?;
        let uncertainties = variances.mapv(f64::sqrt);

        let n = basis.len();
        let kernel =
            LinearCombinationKernel::new(Arc::clone(&basis), solution.slice(s![..n]).to_vec())?;
        let kernel_error =
            LinearCombinationKernel::new(basis, uncertainties.slice(s![..n]).to_vec())?;

        Ok(PsfMatchSolution {
            background: solution[n],
            background_error: uncertainties[n],
            coefficients: solution,
            variances,
            uncertainties,
            strategy,
            num_pixels: equations.num_pixels,
            kernel,
            kernel_error,
        })
    }
}
