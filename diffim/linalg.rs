//! Dense linear algebra for the normal equations: the ordered chain of solve
//! strategies and the parameter-uncertainty propagation.

use ndarray::{Array1, Array2};
use ndarray_linalg::error::LinalgError;
use ndarray_linalg::{Cholesky, Eigh, Inverse, Solve, SolveC, SolveH, UPLO};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Decompositions tried, in order, to solve `M x = B`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SolveStrategy {
    /// Symmetric indefinite LDL^T (Bunch-Kaufman). Tolerates semi-definite systems.
    Ldlt,
    /// Cholesky LL^T; requires positive definiteness.
    Llt,
    /// General LU with partial pivoting.
    Lu,
    /// `V diag(1/lambda) V^T B` over the non-zero eigenvalues.
    EigenPseudoInverse,
}

impl fmt::Display for SolveStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SolveStrategy::Ldlt => "Cholesky LDL^T",
            SolveStrategy::Llt => "Cholesky LL^T",
            SolveStrategy::Lu => "LU",
            SolveStrategy::EigenPseudoInverse => "eigen-values",
        };
        f.write_str(name)
    }
}

/// Why a single strategy was rejected.
#[derive(Error, Debug)]
pub enum StrategyError {
    #[error("decomposition failed: {0}")]
    Decomposition(#[from] LinalgError),

    #[error("solution entry {index} is not finite ({value})")]
    NonFinite { index: usize, value: f64 },
}

/// Every strategy in the chain failed.
#[derive(Error, Debug)]
#[error("all {} solve strategies failed", .failures.len())]
pub struct SolveChainExhausted {
    pub failures: Vec<(SolveStrategy, StrategyError)>,
}

pub type StrategyFn = fn(&Array2<f64>, &Array1<f64>) -> Result<Array1<f64>, LinalgError>;

/// The fallback order used by the kernel solver.
pub const SOLVE_CHAIN: [(SolveStrategy, StrategyFn); 4] = [
    (SolveStrategy::Ldlt, solve_ldlt),
    (SolveStrategy::Llt, solve_llt),
    (SolveStrategy::Lu, solve_lu),
    (SolveStrategy::EigenPseudoInverse, solve_eigen_pseudo_inverse),
];

pub fn solve_ldlt(m: &Array2<f64>, b: &Array1<f64>) -> Result<Array1<f64>, LinalgError> {
    m.solveh(b)
}

pub fn solve_llt(m: &Array2<f64>, b: &Array1<f64>) -> Result<Array1<f64>, LinalgError> {
    m.solvec(b)
}

pub fn solve_lu(m: &Array2<f64>, b: &Array1<f64>) -> Result<Array1<f64>, LinalgError> {
    m.solve(b)
}

/// Zero eigenvalues are dropped from the inverse; everything else is inverted as is.
pub fn solve_eigen_pseudo_inverse(
    m: &Array2<f64>,
    b: &Array1<f64>,
) -> Result<Array1<f64>, LinalgError> {
    let (eigenvalues, eigenvectors) = m.eigh(UPLO::Upper)?;
    let inverted = eigenvalues.mapv(|lambda| if lambda != 0.0 { 1.0 / lambda } else { 0.0 });
    let projected = eigenvectors.t().dot(b) * &inverted;
    Ok(eigenvectors.dot(&projected))
}

/// A solution and the strategy that produced it.
#[derive(Debug, Clone)]
pub struct ChainSolution {
    pub solution: Array1<f64>,
    pub strategy: SolveStrategy,
}

fn first_non_finite(values: &Array1<f64>) -> Option<(usize, f64)> {
    values
        .iter()
        .enumerate()
        .find(|(_, v)| !v.is_finite())
        .map(|(i, &v)| (i, v))
}

/// Tries each strategy of `chain` in order and returns the first finite solution.
pub fn solve_with_chain(
    chain: &[(SolveStrategy, StrategyFn)],
    m: &Array2<f64>,
    b: &Array1<f64>,
) -> Result<ChainSolution, SolveChainExhausted> {
    let mut failures = Vec::new();
    for &(strategy, solve) in chain {
        let attempt = solve(m, b)
            .map_err(StrategyError::from)
            .and_then(|solution| match first_non_finite(&solution) {
                Some((index, value)) => Err(StrategyError::NonFinite { index, value }),
                None => Ok(solution),
            });
        match attempt {
            Ok(solution) => {
                if !failures.is_empty() {
                    log::debug!("Kernel solution determined via {strategy} after {} failed attempts", failures.len());
                }
                return Ok(ChainSolution { solution, strategy });
            }
            Err(e) => {
                log::debug!("Unable to determine kernel via {strategy}: {e}");
                failures.push((strategy, e));
            }
        }
    }
    Err(SolveChainExhausted { failures })
}

/// Solves `M x = B` with [`SOLVE_CHAIN`].
pub fn solve_with_fallback(
    m: &Array2<f64>,
    b: &Array1<f64>,
) -> Result<ChainSolution, SolveChainExhausted> {
    solve_with_chain(&SOLVE_CHAIN, m, b)
}

/// Per-parameter variances from the normal matrix.
///
/// Forms `Cov = M^T M`, factors `Cov = L L^T` and returns the diagonal of
/// `(L^T)^-1 L^-1`. Note this is the diagonal of `(M^T M)^-1`, not of `M^-1`.
pub fn parameter_variances(m: &Array2<f64>) -> Result<Array1<f64>, LinalgError> {
    let cov = m.t().dot(m);
    let lower = cov.cholesky(UPLO::Lower)?;
    let lower_inv = lower.inv()?;
    let error2 = lower_inv.t().dot(&lower_inv);
    Ok(error2.diag().to_owned())
}
