use thiserror::Error;

/// A result type for BCM likelihood and prediction
pub type Result<T> = std::result::Result<T, BcmError>;

/// An error when using [`MultiSharedBcm`](crate::MultiSharedBcm) or a [`BcmPredictor`](crate::BcmPredictor)
#[derive(Error, Debug)]
pub enum BcmError {
    #[error(transparent)]
    /// When linear algebra computation fails
    LinalgError(#[from] linfa_linalg::LinalgError),
    /// When serializing the engine state fails
    #[cfg(feature = "persistent")]
    #[error("Save error: {0}")]
    SaveError(#[from] serde_json::Error),
    /// When writing the saved file fails
    #[error("Save IO error: {0}")]
    SaveIoError(std::io::Error),
    /// When reading the file to load fails
    #[error("Load IO error: {0}")]
    LoadIoError(#[from] std::io::Error),
    /// When the loaded content is not a valid engine state
    #[error("Load error: {0}")]
    LoadError(String),
    /// When error due to a bad value
    #[error("InvalidValue error: {0}")]
    InvalidValueError(String),
}
