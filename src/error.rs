//! Error types for depth-diffusion.

use burn::record::RecorderError;

/// Result type alias using [`DiffusionError`].
pub type Result<T, E = DiffusionError> = std::result::Result<T, E>;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum DiffusionError {
    /// Invalid or unsupported combination of hyperparameters. Raised before
    /// any training happens.
    #[error("config: {0}")]
    Config(String),

    /// The training loss became NaN or infinite.
    #[error("non-finite loss {value} at epoch {epoch}, step {step}")]
    NumericInstability { epoch: usize, step: usize, value: f64 },

    /// Checkpoint record could not be written or read.
    #[error("record: {0}")]
    Record(String),

    /// Image encoding or decoding error.
    #[error("image: {0}")]
    Image(#[from] image::ImageError),

    /// I/O error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl DiffusionError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        DiffusionError::Config(msg.into())
    }
}

impl From<RecorderError> for DiffusionError {
    fn from(error: RecorderError) -> Self {
        DiffusionError::Record(format!("{error:?}"))
    }
}
