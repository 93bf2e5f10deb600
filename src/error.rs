use serde_json::Value;
use time::OffsetDateTime;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid request: {0}")]
    Validation(String),
    #[error("Scoring oracle timed out")]
    OracleTimeout,
    #[error("Scoring oracle failed: {0}")]
    Oracle(String),
    /// Wrong section index, or a unit that is already scored. `existing` holds
    /// the stored result so that a duplicate retry is harmless.
    #[error("Out of sequence: {message}")]
    SequenceViolation {
        message: String,
        existing: Option<Value>,
    },
    #[error("Insufficient gems: balance {balance}, requested {requested}")]
    InsufficientBalance { balance: i64, requested: i64 },
    #[error("A submission for this unit is already being scored")]
    SubmissionInProgress,
    #[error("Chapter is locked")]
    ChapterLocked {
        available_at: Option<OffsetDateTime>,
    },
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Unauthorized")]
    Unauthorized,
    #[error("Forbidden: {0}")]
    Forbidden(String),
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Fatal error: {0}")]
    Fatal(#[from] anyhow::Error),
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn sequence(message: impl Into<String>, existing: Option<Value>) -> Self {
        Self::SequenceViolation {
            message: message.into(),
            existing,
        }
    }

    /// Stable identifier surfaced to API callers.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::OracleTimeout => "ORACLE_TIMEOUT",
            Error::Oracle(_) => "ORACLE_ERROR",
            Error::SequenceViolation { .. } => "SEQUENCE_VIOLATION",
            Error::InsufficientBalance { .. } => "INSUFFICIENT_BALANCE",
            Error::SubmissionInProgress => "SUBMISSION_IN_PROGRESS",
            Error::ChapterLocked { .. } => "CHAPTER_LOCKED",
            Error::NotFound(_) => "NOT_FOUND",
            Error::Unauthorized => "UNAUTHORIZED",
            Error::Forbidden(_) => "FORBIDDEN",
            Error::Database(_) => "DATABASE_ERROR",
            Error::Fatal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether the caller may simply try again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::OracleTimeout
                | Error::Oracle(_)
                | Error::SubmissionInProgress
                | Error::ChapterLocked { .. }
        )
    }

    pub fn is_infrastructure(&self) -> bool {
        matches!(self, Error::Database(_) | Error::Fatal(_))
    }
}
