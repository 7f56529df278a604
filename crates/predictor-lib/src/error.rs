//! Error types for the prediction path and artifact fetches

use thiserror::Error;

/// Client-caused request problems
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("invalid value for {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("malformed request: {0}")]
    Malformed(String),
}

impl ValidationError {
    /// Name of the offending field, when known
    pub fn field(&self) -> Option<&'static str> {
        match self {
            Self::MissingField { field } | Self::InvalidField { field, .. } => Some(field),
            Self::Malformed(_) => None,
        }
    }
}

/// Errors surfaced by the prediction service
#[derive(Error, Debug)]
pub enum PredictionError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("batch item {index}: {source}")]
    BatchItem {
        index: usize,
        #[source]
        source: ValidationError,
    },

    #[error("inference failed: {0}")]
    Inference(String),
}

impl PredictionError {
    /// True when the caller sent a bad request
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::BatchItem { .. })
    }

    /// Validation details for client errors
    pub fn validation(&self) -> Option<&ValidationError> {
        match self {
            Self::Validation(e) | Self::BatchItem { source: e, .. } => Some(e),
            Self::Inference(_) => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::BatchItem { .. } => "batch_validation",
            Self::Inference(_) => "inference",
        }
    }
}

/// Failures while fetching an artifact from the store.
///
/// Never shown to callers directly; the provider turns them into a fallback
/// model selection.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("artifact not found: {0}")]
    NotFound(String),

    #[error("permission denied for {0}")]
    PermissionDenied(String),

    #[error("fetch timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("store returned status {status} for {key}")]
    Status { status: u16, key: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid registry manifest: {0}")]
    Manifest(String),

    #[error("artifact {key} is larger than {limit} bytes")]
    TooLarge { key: String, limit: usize },
}

impl FetchError {
    /// Whether another attempt could plausibly succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Transport(_) => true,
            Self::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        FetchError::Transport(e.to_string())
    }
}
