pub mod core;
pub mod error;
pub mod models;
pub mod prelude;
pub mod utils;

// Re-export types
pub use crate::core::{
    Activation, ConvLayer, ConvMode, ConvolutionOp, DenseLayer, FlattenLayer, LayerTrait,
    Loss, MaxPoolOp, PoolLayer, PoolMask, Precision, Scalar,
};
pub use crate::core::gradient_check::{
    gradient_check, GradientCheckConfig, GradientCheckReport, Verdict,
};
pub use crate::models::{Network, Sequential};
