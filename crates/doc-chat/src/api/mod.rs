//! API module - HTTP handlers over the session orchestrator

pub mod analysis_api;
pub mod conversation_api;
pub mod stream_api;
pub mod usage_api;

pub use analysis_api::{analyze_session, AnalyzeRequest};
pub use conversation_api::{get_session, list_sessions};
pub use stream_api::{send_message, SendMessageRequest};
pub use usage_api::get_usage;
