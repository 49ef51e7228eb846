use ndarray::ArrayViewMut2;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackgroundError {
    #[error("A polynomial background of order {order} needs {expected} coefficients, but {found} were given.")]
    CoefficientCount {
        order: usize,
        expected: usize,
        found: usize,
    },
}

/// A differential background added to the convolved template: either a constant or
/// a smooth function of parent-frame position.
pub trait Background: Sync {
    fn value_at(&self, x: f64, y: f64) -> f64;

    /// `Some` when the background does not depend on position.
    fn as_constant(&self) -> Option<f64> {
        None
    }
}

impl Background for f64 {
    #[inline]
    fn value_at(&self, _x: f64, _y: f64) -> f64 {
        *self
    }

    fn as_constant(&self) -> Option<f64> {
        Some(*self)
    }
}

/// 2-D polynomial `sum c_k x^i y^j`, terms ordered by total degree and then by
/// descending power of `x`: `1, x, y, x^2, xy, y^2, ...`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolynomialBackground {
    order: usize,
    coefficients: Vec<f64>,
}

impl PolynomialBackground {
    pub fn new(order: usize, coefficients: Vec<f64>) -> Result<Self, BackgroundError> {
        let expected = Self::num_terms(order);
        if coefficients.len() != expected {
            return Err(BackgroundError::CoefficientCount {
                order,
                expected,
                found: coefficients.len(),
            });
        }
        Ok(Self {
            order,
            coefficients,
        })
    }

    pub fn num_terms(order: usize) -> usize {
        (order + 1) * (order + 2) / 2
    }

    pub fn order(&self) -> usize {
        self.order
    }

    pub fn coefficients(&self) -> &[f64] {
        &self.coefficients
    }
}

impl Background for PolynomialBackground {
    fn value_at(&self, x: f64, y: f64) -> f64 {
        let mut terms = self.coefficients.iter();
        let mut total = 0.0;
        for degree in 0..=self.order {
            for x_power in (0..=degree).rev() {
                let y_power = degree - x_power;
                if let Some(&c) = terms.next() {
                    total += c * x.powi(x_power as i32) * y.powi(y_power as i32);
                }
            }
        }
        total
    }

    fn as_constant(&self) -> Option<f64> {
        (self.order == 0).then(|| self.coefficients[0])
    }
}

/// Adds `background` to a plane whose first pixel sits at parent `(x0, y0)`.
pub fn add_background<B: Background + ?Sized>(
    mut pixels: ArrayViewMut2<'_, f64>,
    x0: i32,
    y0: i32,
    background: &B,
) {
    match background.as_constant() {
        Some(value) if value == 0.0 => {}
        Some(value) => pixels += value,
        None => {
            for ((row, col), value) in pixels.indexed_iter_mut() {
                let x = f64::from(x0) + col as f64;
                let y = f64::from(y0) + row as f64;
                *value += background.value_at(x, y);
            }
        }
    }
}
