//! State shared by every request handler.
//!
//! Nothing here caches sessions: each request re-resolves its session from
//! the store, so any number of server instances can share one database.

use axum::extract::FromRef;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::auth::JwtVerifier;
use crate::config::Config;
use crate::context_engine::SessionOrchestrator;

/// Atomic counters for request bookkeeping
#[derive(Default)]
pub struct AtomicCounters {
    pub total_requests: AtomicUsize,
    pub failed_requests: AtomicUsize,
}

impl AtomicCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_total_requests(&self) -> usize {
        self.total_requests.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn inc_failed_requests(&self) -> usize {
        self.failed_requests.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[derive(Clone)]
pub struct UnifiedAppState {
    pub orchestrator: Arc<SessionOrchestrator>,
    pub verifier: Arc<JwtVerifier>,
    pub config: Arc<Config>,
    pub counters: Arc<AtomicCounters>,
}

impl UnifiedAppState {
    pub fn new(orchestrator: Arc<SessionOrchestrator>, verifier: Arc<JwtVerifier>, config: Arc<Config>) -> Self {
        Self {
            orchestrator,
            verifier,
            config,
            counters: Arc::new(AtomicCounters::new()),
        }
    }
}

impl FromRef<UnifiedAppState> for Arc<JwtVerifier> {
    fn from_ref(state: &UnifiedAppState) -> Self {
        state.verifier.clone()
    }
}
