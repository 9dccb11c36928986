//! Structured findings returned by the document-analysis call.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ChatError;
use crate::session_store::UsageInfo;

/// Appended to the merged context as the final user message of an analysis.
pub const ANALYZE_INSTRUCTION: &str =
    "Analyze the documents above and report your findings as a JSON array.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FindingLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub level: FindingLevel,
    pub description: String,
    #[serde(default, alias = "locationHint")]
    pub location_hint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisReport {
    pub session_id: String,
    pub findings: Vec<Finding>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageInfo>,
}

/// Parse the model's answer. Anything other than a JSON array of well-formed
/// findings is an error; an empty array is a valid "nothing found".
pub fn parse_findings(json_text: &str) -> Result<Vec<Finding>, ChatError> {
    let value: Value = serde_json::from_str(json_text.trim())
        .map_err(|e| ChatError::AnalysisParseFailed(format!("invalid JSON: {}", e)))?;

    if !value.is_array() {
        return Err(ChatError::AnalysisParseFailed("expected a JSON array of findings".to_string()));
    }

    serde_json::from_value(value).map_err(|e| ChatError::AnalysisParseFailed(e.to_string()))
}
