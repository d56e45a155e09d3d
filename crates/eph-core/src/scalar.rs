//! Numeric abstraction shared by the encoder, the state predictor and the controller.
//!
//! Everything on the perception and prediction path is written against [`Scalar`] so the
//! same code runs on plain `f64` during the tick and on [`Dual`] numbers when the
//! controller needs `∂F/∂u` for a two-dimensional action.

use std::fmt::Debug;
use std::ops::{Add, Div, Mul, Neg, Sub};

/// Number of independent tangent directions carried by [`Dual`] (one per action axis).
pub const TANGENTS: usize = 2;

/// Arithmetic required by the differentiable pipeline.
pub trait Scalar:
    Copy
    + Debug
    + Send
    + Sync
    + PartialOrd
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + Neg<Output = Self>
    + Add<f64, Output = Self>
    + Sub<f64, Output = Self>
    + Mul<f64, Output = Self>
    + Div<f64, Output = Self>
    + 'static
{
    /// Lift a constant (zero derivative).
    fn constant(value: f64) -> Self;
    /// Primal value.
    fn value(self) -> f64;
    fn exp(self) -> Self;
    fn ln(self) -> Self;
    /// Square root; the derivative is defined as zero at the origin.
    fn sqrt(self) -> Self;
    fn sin(self) -> Self;
    fn cos(self) -> Self;
    /// Four-quadrant arctangent of `self / x`.
    fn atan2(self, x: Self) -> Self;
    /// True when the primal value and all tangents are finite.
    fn is_finite(self) -> bool;

    fn max(self, other: Self) -> Self {
        if self.value() >= other.value() {
            self
        } else {
            other
        }
    }

    fn min(self, other: Self) -> Self {
        if self.value() <= other.value() {
            self
        } else {
            other
        }
    }

    fn zero() -> Self {
        Self::constant(0.0)
    }
}

impl Scalar for f64 {
    #[inline]
    fn constant(value: f64) -> Self {
        value
    }

    #[inline]
    fn value(self) -> f64 {
        self
    }

    #[inline]
    fn exp(self) -> Self {
        f64::exp(self)
    }

    #[inline]
    fn ln(self) -> Self {
        f64::ln(self)
    }

    #[inline]
    fn sqrt(self) -> Self {
        f64::sqrt(self)
    }

    #[inline]
    fn sin(self) -> Self {
        f64::sin(self)
    }

    #[inline]
    fn cos(self) -> Self {
        f64::cos(self)
    }

    #[inline]
    fn atan2(self, x: Self) -> Self {
        f64::atan2(self, x)
    }

    #[inline]
    fn is_finite(self) -> bool {
        f64::is_finite(self)
    }
}

/// Forward-mode dual number with two tangent directions.
///
/// Comparisons look at the primal value only, which is what branch selection in the
/// encoder (`max`, `min`, range cut-offs) needs.
#[derive(Debug, Clone, Copy, Default)]
pub struct Dual {
    pub re: f64,
    pub eps: [f64; TANGENTS],
}

impl Dual {
    #[must_use]
    pub const fn new(re: f64, eps: [f64; TANGENTS]) -> Self {
        Self { re, eps }
    }

    /// Seed an independent variable along tangent `index`.
    #[must_use]
    pub fn variable(value: f64, index: usize) -> Self {
        let mut eps = [0.0; TANGENTS];
        if let Some(slot) = eps.get_mut(index) {
            *slot = 1.0;
        }
        Self { re: value, eps }
    }

    /// Gradient with respect to the seeded variables.
    #[must_use]
    pub const fn gradient(self) -> [f64; TANGENTS] {
        self.eps
    }

    #[inline]
    fn chain(self, re: f64, slope: f64) -> Self {
        Self {
            re,
            eps: [self.eps[0] * slope, self.eps[1] * slope],
        }
    }
}

impl PartialEq for Dual {
    fn eq(&self, other: &Self) -> bool {
        self.re == other.re
    }
}

impl PartialOrd for Dual {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        self.re.partial_cmp(&other.re)
    }
}

impl Add for Dual {
    type Output = Self;
    #[inline]
    fn add(self, rhs: Self) -> Self {
        Self {
            re: self.re + rhs.re,
            eps: [self.eps[0] + rhs.eps[0], self.eps[1] + rhs.eps[1]],
        }
    }
}

impl Sub for Dual {
    type Output = Self;
    #[inline]
    fn sub(self, rhs: Self) -> Self {
        Self {
            re: self.re - rhs.re,
            eps: [self.eps[0] - rhs.eps[0], self.eps[1] - rhs.eps[1]],
        }
    }
}

impl Mul for Dual {
    type Output = Self;
    #[inline]
    fn mul(self, rhs: Self) -> Self {
        Self {
            re: self.re * rhs.re,
            eps: [
                self.eps[0] * rhs.re + self.re * rhs.eps[0],
                self.eps[1] * rhs.re + self.re * rhs.eps[1],
            ],
        }
    }
}

impl Div for Dual {
    type Output = Self;
    #[inline]
    fn div(self, rhs: Self) -> Self {
        let inv_sq = 1.0 / (rhs.re * rhs.re);
        Self {
            re: self.re / rhs.re,
            eps: [
                (self.eps[0] * rhs.re - self.re * rhs.eps[0]) * inv_sq,
                (self.eps[1] * rhs.re - self.re * rhs.eps[1]) * inv_sq,
            ],
        }
    }
}

impl Neg for Dual {
    type Output = Self;
    #[inline]
    fn neg(self) -> Self {
        Self {
            re: -self.re,
            eps: [-self.eps[0], -self.eps[1]],
        }
    }
}

impl Add<f64> for Dual {
    type Output = Self;
    #[inline]
    fn add(self, rhs: f64) -> Self {
        Self {
            re: self.re + rhs,
            eps: self.eps,
        }
    }
}

impl Sub<f64> for Dual {
    type Output = Self;
    #[inline]
    fn sub(self, rhs: f64) -> Self {
        Self {
            re: self.re - rhs,
            eps: self.eps,
        }
    }
}

impl Mul<f64> for Dual {
    type Output = Self;
    #[inline]
    fn mul(self, rhs: f64) -> Self {
        self.chain(self.re * rhs, rhs)
    }
}

impl Div<f64> for Dual {
    type Output = Self;
    #[inline]
    fn div(self, rhs: f64) -> Self {
        self.chain(self.re / rhs, 1.0 / rhs)
    }
}

impl Scalar for Dual {
    #[inline]
    fn constant(value: f64) -> Self {
        Self {
            re: value,
            eps: [0.0; TANGENTS],
        }
    }

    #[inline]
    fn value(self) -> f64 {
        self.re
    }

    fn exp(self) -> Self {
        let e = self.re.exp();
        self.chain(e, e)
    }

    fn ln(self) -> Self {
        self.chain(self.re.ln(), 1.0 / self.re)
    }

    fn sqrt(self) -> Self {
        let s = self.re.sqrt();
        if s > 0.0 {
            self.chain(s, 0.5 / s)
        } else {
            Self::constant(s)
        }
    }

    fn sin(self) -> Self {
        self.chain(self.re.sin(), self.re.cos())
    }

    fn cos(self) -> Self {
        self.chain(self.re.cos(), -self.re.sin())
    }

    fn atan2(self, x: Self) -> Self {
        let y = self;
        let denom = x.re * x.re + y.re * y.re;
        let re = y.re.atan2(x.re);
        if denom <= 0.0 {
            return Self::constant(re);
        }
        Self {
            re,
            eps: [
                (x.re * y.eps[0] - y.re * x.eps[0]) / denom,
                (x.re * y.eps[1] - y.re * x.eps[1]) / denom,
            ],
        }
    }

    fn is_finite(self) -> bool {
        self.re.is_finite() && self.eps.iter().all(|e| e.is_finite())
    }
}
