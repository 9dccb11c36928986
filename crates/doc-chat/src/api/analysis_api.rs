//! Document analysis endpoint.

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Deserialize;
use tracing::info;
use validator::Validate;

use crate::auth::AuthUser;
use crate::context_engine::AnalysisReport;
use crate::error::ChatError;
use crate::metrics;
use crate::shared_state::UnifiedAppState;

#[derive(Debug, Default, Deserialize, Validate)]
pub struct AnalyzeRequest {
    #[serde(default)]
    #[validate(length(max = 4000, message = "extra_prompt is too long"))]
    pub extra_prompt: Option<String>,
}

/// POST /sessions/:id/analyze. The body is optional.
pub async fn analyze_session(
    State(state): State<UnifiedAppState>,
    user: AuthUser,
    Path(session_id): Path<String>,
    payload: Option<Json<AnalyzeRequest>>,
) -> Result<Json<AnalysisReport>, ChatError> {
    state.counters.inc_total_requests();
    let req = payload.map(|Json(req)| req).unwrap_or_default();
    req.validate()
        .map_err(|e| ChatError::ValidationFailed(e.to_string()))?;

    info!("Analysis requested for session {} by {}", session_id, user.user_id);
    let result = state
        .orchestrator
        .analyze_session(&user.user_id, &session_id, req.extra_prompt.as_deref())
        .await;

    match result {
        Ok(report) => {
            metrics::inc_request("analyze", "ok");
            Ok(Json(report))
        }
        Err(e) => {
            state.counters.inc_failed_requests();
            metrics::inc_request("analyze", e.code());
            Err(e)
        }
    }
}
