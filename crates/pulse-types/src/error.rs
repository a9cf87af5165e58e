use uuid::Uuid;

/// Error taxonomy for the messaging core.
///
/// Validation and unknown-recipient failures are local to one request and
/// leave the connection open; persistence failures mean the message was NOT
/// committed and must be surfaced to the caller, never swallowed.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("unknown recipient: {0}")]
    UnknownRecipient(Uuid),

    #[error("persistence failure: {0}")]
    Persistence(#[from] anyhow::Error),
}

impl CoreError {
    /// Stable machine-readable code carried in wire-level error frames.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::UnknownRecipient(_) => "unknown_recipient",
            Self::Persistence(_) => "persistence",
        }
    }
}

pub type CoreResult<T> = std::result::Result<T, CoreError>;
