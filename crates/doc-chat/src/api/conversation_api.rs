//! API endpoints for reading the caller's sessions

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;
use tracing::info;

use crate::auth::AuthUser;
use crate::document::DocumentContext;
use crate::error::ChatError;
use crate::message::Message;
use crate::session_store::Session;
use crate::shared_state::UnifiedAppState;

#[derive(Debug, Serialize)]
pub struct SessionsResponse {
    pub sessions: Vec<SessionSummary>,
}

/// Summary of a session for listings
#[derive(Debug, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub title: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub message_count: usize,
    pub document_count: usize,
}

impl From<&Session> for SessionSummary {
    fn from(session: &Session) -> Self {
        Self {
            id: session.id.clone(),
            title: session.title.clone(),
            created_at: session.created_at.to_rfc3339(),
            updated_at: session.updated_at.to_rfc3339(),
            message_count: session.messages.len(),
            document_count: session.documents.len(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DocumentSummary {
    pub source_name: String,
    pub page_count: u32,
    pub processed_bytes: u64,
    pub created_at: String,
}

impl From<&DocumentContext> for DocumentSummary {
    fn from(document: &DocumentContext) -> Self {
        Self {
            source_name: document.source_name.clone(),
            page_count: document.page_count,
            processed_bytes: document.processed_bytes,
            created_at: document.created_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SessionDetailResponse {
    pub id: String,
    pub title: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub messages: Vec<Message>,
    pub documents: Vec<DocumentSummary>,
}

/// GET /sessions
pub async fn list_sessions(
    State(state): State<UnifiedAppState>,
    user: AuthUser,
) -> Result<Json<SessionsResponse>, ChatError> {
    let sessions = state.orchestrator.list_sessions(&user.user_id).await?;
    info!("Found {} sessions for {}", sessions.len(), user.user_id);
    Ok(Json(SessionsResponse {
        sessions: sessions.iter().map(SessionSummary::from).collect(),
    }))
}

/// GET /sessions/:id
pub async fn get_session(
    State(state): State<UnifiedAppState>,
    user: AuthUser,
    Path(session_id): Path<String>,
) -> Result<Json<SessionDetailResponse>, ChatError> {
    let session = state.orchestrator.get_session(&user.user_id, &session_id).await?;
    Ok(Json(SessionDetailResponse {
        documents: session.documents.iter().map(DocumentSummary::from).collect(),
        id: session.id,
        title: session.title,
        created_at: session.created_at.to_rfc3339(),
        updated_at: session.updated_at.to_rfc3339(),
        messages: session.messages,
    }))
}
