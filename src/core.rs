// src/core.rs
pub mod activations;
pub mod gradient_check;
pub mod layers;
pub mod losses;
pub mod precision;
pub mod tensor_ops;

// Re-export commonly used items
pub use activations::{softmax_jacobian_backward, Activation, DerivativeArg};
pub use gradient_check::{
    gradient_check, gradient_check_par, gradient_check_with, DiagnosticDisplay,
    GradientCheckConfig, GradientCheckReport, TracingDisplay, Verdict,
};
pub use layers::{ConvLayer, DenseLayer, FlattenLayer, LayerTrait, PoolLayer};
pub use losses::Loss;
pub use precision::{FloatX, Precision, Scalar};
pub use tensor_ops::{ConvMode, ConvolutionOp, MaxPoolOp, PoolMask};
