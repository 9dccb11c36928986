//! Streaming chat endpoint.
//!
//! Flow: authenticate → orchestrator resolves the session, extracts documents
//! and opens the model stream → the session id goes out as a header → the
//! answer is streamed as plain text while the turn finishes in a spawned task.

use axum::{
    body::Body,
    extract::{rejection::JsonRejection, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info};
use validator::Validate;

use crate::auth::AuthUser;
use crate::context_engine::{TurnOutcome, TurnRequest};
use crate::error::{ChatError, SESSION_ID_HEADER};
use crate::metrics;
use crate::shared_state::UnifiedAppState;

/// Chunks buffered between the relay and the HTTP body.
const STREAM_BUFFER: usize = 64;

#[derive(Debug, Deserialize, Validate)]
pub struct SendMessageRequest {
    #[validate(length(min = 1, message = "prompt must not be empty"))]
    pub prompt: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub file_paths: Vec<String>,
    #[serde(default)]
    pub include_images: bool,
}

/// POST /chat/stream
pub async fn send_message(
    State(state): State<UnifiedAppState>,
    user: AuthUser,
    payload: Result<Json<SendMessageRequest>, JsonRejection>,
) -> Response {
    let request_num = state.counters.inc_total_requests();

    let req = match parse_request(payload, state.config.max_files_per_request) {
        Ok(req) => req,
        Err(e) => {
            state.counters.inc_failed_requests();
            metrics::inc_request("chat_stream", e.code());
            return e.into_response();
        }
    };
    info!(
        "Chat request #{} from {} ({} file(s), session {:?})",
        request_num,
        user.user_id,
        req.file_paths.len(),
        req.session_id
    );

    let turn = match state
        .orchestrator
        .begin_turn(TurnRequest {
            owner_id: user.user_id,
            caller_token: user.token,
            prompt: req.prompt,
            session_id: req.session_id,
            file_paths: req.file_paths,
            include_images: req.include_images,
        })
        .await
    {
        Ok(turn) => turn,
        Err(failure) => {
            state.counters.inc_failed_requests();
            metrics::inc_request("chat_stream", failure.error.code());
            return failure.into_response();
        }
    };

    let session_id = turn.session_id().to_string();
    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    tokio::spawn(async move {
        match turn.run(tx).await {
            TurnOutcome::Persisted { session, .. } => {
                debug!("Turn persisted; session {} has {} messages", session.id, session.messages.len())
            }
            TurnOutcome::Discarded { reason } | TurnOutcome::PersistFailed { reason } => {
                debug!("Turn ended without update: {}", reason)
            }
        }
    });
    metrics::inc_request("chat_stream", "ok");

    let mut response = (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(ReceiverStream::new(rx)),
    )
        .into_response();
    if let Ok(value) = HeaderValue::from_str(&session_id) {
        response.headers_mut().insert(SESSION_ID_HEADER, value);
    }
    response
}

fn parse_request(
    payload: Result<Json<SendMessageRequest>, JsonRejection>,
    max_files: usize,
) -> Result<SendMessageRequest, ChatError> {
    let Json(req) = payload.map_err(|e| ChatError::ValidationFailed(e.body_text()))?;
    req.validate()
        .map_err(|e| ChatError::ValidationFailed(e.to_string()))?;
    if req.file_paths.len() > max_files {
        return Err(ChatError::ValidationFailed(format!(
            "at most {} files may be attached per request",
            max_files
        )));
    }
    if req.file_paths.iter().any(|p| p.trim().is_empty()) {
        return Err(ChatError::ValidationFailed("file paths must not be empty".to_string()));
    }
    Ok(req)
}
