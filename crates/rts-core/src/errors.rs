//! Error types for the rts-core library.

/// Top-level error enum for the rts-core library.
#[derive(Debug, thiserror::Error)]
pub enum RtsError {
    /// A compiled unit could not be located or read.
    #[error("Artifact error: {0}")]
    Artifact(String),

    /// A compiled unit was located but its bytes are not a valid class file.
    #[error("Class format error in {unit}: {message}")]
    ClassFormat { unit: String, message: String },

    #[error("Store error: {0}")]
    Store(String),

    /// An inconsistency that must never reach the persisted store.
    #[error("Invariant violation: {0}")]
    Invariant(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RtsError {
    pub(crate) fn class_format(unit: &str, message: impl Into<String>) -> Self {
        RtsError::ClassFormat {
            unit: unit.to_string(),
            message: message.into(),
        }
    }

    /// Whether the error is recovered locally (unit or record skipped)
    /// rather than aborting the run.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            RtsError::Artifact(_) | RtsError::ClassFormat { .. } | RtsError::Store(_)
        )
    }
}

pub type RtsResult<T> = Result<T, RtsError>;
