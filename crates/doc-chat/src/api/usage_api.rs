use axum::{extract::State, Json};
use serde::Serialize;

use crate::auth::AuthUser;
use crate::error::ChatError;
use crate::shared_state::UnifiedAppState;

#[derive(Debug, Serialize)]
pub struct UsageResponse {
    pub owner_id: String,
    pub chat_tokens: u64,
    pub analysis_tokens: u64,
    pub total_tokens: u64,
    pub entries: u64,
}

/// GET /usage
pub async fn get_usage(
    State(state): State<UnifiedAppState>,
    user: AuthUser,
) -> Result<Json<UsageResponse>, ChatError> {
    let totals = state.orchestrator.usage_totals(&user.user_id).await?;
    Ok(Json(UsageResponse {
        total_tokens: totals.chat_tokens + totals.analysis_tokens,
        chat_tokens: totals.chat_tokens,
        analysis_tokens: totals.analysis_tokens,
        entries: totals.entries,
        owner_id: user.user_id,
    }))
}
