use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ForgeError {
    #[error("Input file not found: {0}")]
    InputNotFound(PathBuf),

    #[error("Safetensors error: {0}")]
    SafeTensor(#[from] safetensors::SafeTensorError),

    #[error("Invalid safetensors header: {0}")]
    InvalidHeader(String),

    #[error("Unsupported dtype: {0}")]
    UnsupportedDtype(String),

    #[error("Tensor data length mismatch: expected {expected} bytes, got {actual}")]
    DataLength { expected: usize, actual: usize },

    #[error("Shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),

    #[error("Invalid rule: {0}")]
    InvalidRule(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Two source keys map to the same output key: {key}")]
    KeyCollision { key: String },

    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Decomposition failed: {0}")]
    Decomposition(String),

    #[error("Nothing to write: {0}")]
    NothingToWrite(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ForgeError>;
