//! Request-level error taxonomy.

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

pub const SESSION_ID_HEADER: &str = "x-session-id";

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("validation failed: {0}")]
    ValidationFailed(String),

    #[error("session not found")]
    SessionNotFound,

    #[error("document '{source_name}' could not be processed: {reason}")]
    DocumentProcessingFailed { source_name: String, reason: String },

    #[error("model call failed: {0}")]
    ModelCallFailed(String),

    #[error("analysis output could not be parsed: {0}")]
    AnalysisParseFailed(String),

    #[error("persistence failed: {0}")]
    PersistenceFailed(String),

    #[error("session store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("request timed out: {0}")]
    TimedOut(String),
}

impl ChatError {
    /// Stable machine-readable code reported in error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            ChatError::AuthenticationFailed(_) => "authentication_failed",
            ChatError::ValidationFailed(_) => "validation_failed",
            ChatError::SessionNotFound => "session_not_found",
            ChatError::DocumentProcessingFailed { .. } => "document_processing_failed",
            ChatError::ModelCallFailed(_) => "model_call_failed",
            ChatError::AnalysisParseFailed(_) => "analysis_parse_failed",
            ChatError::PersistenceFailed(_) => "persistence_failed",
            ChatError::StoreUnavailable(_) => "store_unavailable",
            ChatError::TimedOut(_) => "timed_out",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ChatError::AuthenticationFailed(_) => StatusCode::UNAUTHORIZED,
            ChatError::ValidationFailed(_) => StatusCode::BAD_REQUEST,
            ChatError::SessionNotFound => StatusCode::NOT_FOUND,
            ChatError::DocumentProcessingFailed { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            ChatError::ModelCallFailed(_) | ChatError::AnalysisParseFailed(_) => StatusCode::BAD_GATEWAY,
            ChatError::PersistenceFailed(_) | ChatError::StoreUnavailable(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ChatError::TimedOut(_) => StatusCode::GATEWAY_TIMEOUT,
        }
    }
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": {
                "code": self.code(),
                "message": self.to_string(),
            }
        });
        (self.status(), Json(body)).into_response()
    }
}

/// A failure that happened after a session id was already known to the
/// caller-facing side of the request.
#[derive(Debug)]
pub struct TurnFailure {
    pub session_id: Option<String>,
    pub error: ChatError,
}

impl TurnFailure {
    pub fn new(session_id: Option<String>, error: ChatError) -> Self {
        Self { session_id, error }
    }
}

impl From<ChatError> for TurnFailure {
    fn from(error: ChatError) -> Self {
        Self { session_id: None, error }
    }
}

impl IntoResponse for TurnFailure {
    fn into_response(self) -> Response {
        let mut response = self.error.into_response();
        if let Some(id) = self.session_id {
            if let Ok(value) = HeaderValue::from_str(&id) {
                response.headers_mut().insert(SESSION_ID_HEADER, value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(ChatError::SessionNotFound.code(), "session_not_found");
        assert_eq!(ChatError::ModelCallFailed("x".into()).code(), "model_call_failed");
        assert_eq!(ChatError::TimedOut("slow".into()).code(), "timed_out");
        assert_eq!(ChatError::TimedOut("slow".into()).status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            ChatError::DocumentProcessingFailed { source_name: "a.pdf".into(), reason: "bad".into() }
                .to_string(),
            "document 'a.pdf' could not be processed: bad"
        );
    }

    #[test]
    fn test_turn_failure_carries_session_header() {
        let response = TurnFailure::new(
            Some("abc".to_string()),
            ChatError::ModelCallFailed("down".into()),
        )
        .into_response();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(response.headers().get(SESSION_ID_HEADER).unwrap(), "abc");
    }

    #[test]
    fn test_turn_failure_without_session_has_no_header() {
        let response = TurnFailure::from(ChatError::StoreUnavailable("db".into())).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(response.headers().get(SESSION_ID_HEADER).is_none());
    }
}
