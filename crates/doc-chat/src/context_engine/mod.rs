//! Context engine module - builds model context from sessions and documents
//! and drives streamed chat turns.

pub mod analysis;
pub mod context_builder;
pub mod document_extractor;
pub mod orchestrator;
pub mod stream_relay;

pub use analysis::{parse_findings, AnalysisReport, Finding, FindingLevel};
pub use context_builder::{document_message, merge, normalize_image_data};
pub use document_extractor::DocumentExtractor;
pub use orchestrator::{
    ActiveTurn, OrchestratorConfig, SessionOrchestrator, TurnOutcome, TurnRequest, TurnStage,
};
pub use stream_relay::{relay, ChunkSender, RelayError, RelayOutcome};
