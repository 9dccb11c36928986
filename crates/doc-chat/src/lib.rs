// doc-chat/crates/doc-chat/src/lib.rs

pub mod api;
pub mod auth;
pub mod config;
pub mod context_engine;
pub mod document;
pub mod error;
pub mod memory_db;
pub mod message;
pub mod metrics;
pub mod providers;
pub mod server;
pub mod session_store;
pub mod shared_state;
pub mod telemetry;

// Public API exports
pub use config::Config;
pub use context_engine::{SessionOrchestrator, TurnOutcome, TurnRequest};
pub use document::DocumentContext;
pub use error::{ChatError, TurnFailure};
pub use message::{Message, Role};
pub use server::{build_router, run_server};
pub use session_store::{InMemorySessionStore, Session, SessionStore};
