use thiserror::Error;

#[derive(Debug, Error)]
pub enum NNError {
    // Model related errors
    #[error("Invalid layer configuration: {0}")]
    InvalidLayerConfiguration(String),
    #[error("Layer shape mismatch: {0}")]
    LayerShapeMismatch(String),
    #[error("Model has no layers")]
    EmptyModel,

    // Tensor related errors
    #[error("Invalid input shape: {0}")]
    InvalidInputShape(String),
    #[error("Invalid weight shape: {0}")]
    InvalidWeightShape(String),

    #[error("Invalid loss function: {0}")]
    InvalidLoss(String),

    #[error("Invalid activation function: {0}")]
    InvalidActivation(String),

    // Computation errors
    #[error("Computation error: {0}")]
    ComputationError(String),

    #[error("Shape error: {0}")]
    ShapeError(#[from] ndarray::ShapeError),
}

pub type Result<T> = std::result::Result<T, NNError>;
