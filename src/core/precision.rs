//! Floating point precision of the numeric core.
//!
//! Every tensor helper is generic over [`Scalar`], so the precision is
//! chosen by the element type a caller instantiates with. [`FloatX`] is the
//! default used across the crate when nothing else is asked for.

use ndarray::NdFloat;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Process-wide default element type.
pub type FloatX = f64;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    Single,
    Double,
}

impl Precision {
    pub fn bits(&self) -> usize {
        match self {
            Self::Single => 32,
            Self::Double => 64,
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "float{}", self.bits())
    }
}

pub trait Scalar: NdFloat {
    const PRECISION: Precision;

    /// Converts an `f64` constant into this precision.
    fn scal(x: f64) -> Self;

    fn to_f64(self) -> f64;
}

impl Scalar for f32 {
    const PRECISION: Precision = Precision::Single;

    fn scal(x: f64) -> Self {
        x as f32
    }

    fn to_f64(self) -> f64 {
        self as f64
    }
}

impl Scalar for f64 {
    const PRECISION: Precision = Precision::Double;

    fn scal(x: f64) -> Self {
        x
    }

    fn to_f64(self) -> f64 {
        self
    }
}
