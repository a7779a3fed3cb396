use thiserror::Error;

/// Failures surfaced by model loading, inference and attribution.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("no model loaded")]
    NoModelLoaded,

    #[error("model `{0}` is still loading")]
    LoadInProgress(String),

    /// Missing or inconsistent model/tokenizer configuration.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{0}")]
    WrongMode(String),

    /// The explainer produced values in a layout no reduction is defined for.
    #[error("unexpected attribution values shape {0:?}")]
    UnexpectedShape(Vec<usize>),

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    /// Device placement or allocation failure while installing a model.
    #[error("resource error: {0}")]
    Resource(String),

    #[error("model error: {0}")]
    Model(#[from] candle_core::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CoreError {
    pub fn tokenizer(err: impl std::fmt::Display) -> Self {
        CoreError::Tokenizer(err.to_string())
    }

    /// Whether the failure was caused by the request rather than the service.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            CoreError::NoModelLoaded
                | CoreError::Config(_)
                | CoreError::InvalidInput(_)
                | CoreError::WrongMode(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
