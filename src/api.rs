pub mod learn;
pub mod manager;
pub mod public;
pub mod user;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use serde_json::Value;
use tower_sessions::Session;
use tracing::error;
use utoipa::ToSchema;

use crate::{
    error::{Error, Result},
    gamification::Rank,
    server::AppState,
};

pub const STUDENT_KEY: &str = "student_id";

/// Body of every failed request.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    pub success: bool,
    pub code: String,
    pub error: String,
    /// Stored result returned with a duplicate submission.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub existing: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available_at: Option<String>,
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::OracleTimeout => StatusCode::GATEWAY_TIMEOUT,
            Error::Oracle(_) => StatusCode::BAD_GATEWAY,
            Error::SequenceViolation { .. } | Error::SubmissionInProgress => StatusCode::CONFLICT,
            Error::InsufficientBalance { .. } => StatusCode::PAYMENT_REQUIRED,
            Error::ChapterLocked { .. } => StatusCode::LOCKED,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Unauthorized => StatusCode::UNAUTHORIZED,
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::Database(_) | Error::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = if self.is_infrastructure() {
            error!("request failed: {self}");
            "Internal server error".to_string()
        } else {
            self.to_string()
        };
        let available_at = match &self {
            Error::ChapterLocked { available_at } => available_at.and_then(|at| {
                at.format(&time::format_description::well_known::Rfc3339).ok()
            }),
            _ => None,
        };
        let code = self.kind().to_string();
        let existing = match self {
            Error::SequenceViolation { existing, .. } => existing,
            _ => None,
        };
        let body = ErrorBody {
            success: false,
            code,
            error: message,
            existing,
            available_at,
        };
        (status, Json(body)).into_response()
    }
}

pub async fn current_student(session: &Session) -> Result<i64> {
    match session.get::<i64>(STUDENT_KEY).await {
        Ok(Some(id)) => Ok(id),
        _ => Err(Error::Unauthorized),
    }
}

/// Signed-in student holding the 管理者 rank.
pub async fn require_admin(state: &AppState, session: &Session) -> Result<i64> {
    let id = current_student(session).await?;
    if state.economy.rank(id).await? != Rank::Admin {
        return Err(Error::Forbidden("administrators only".to_string()));
    }
    Ok(id)
}
