//! Session store adapter: owner-scoped durable sessions and the usage ledger.
//!
//! `SessionStore` is the seam the orchestrator talks to. The SQLite
//! implementation lives in `memory_db`; the DashMap-backed one here serves
//! tests and single-process runs without a database file.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::document::DocumentContext;
use crate::message::{Message, Role};

const TITLE_MAX_CHARS: usize = 60;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub owner_id: String,
    pub title: Option<String>,
    pub messages: Vec<Message>,
    pub documents: Vec<DocumentContext>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new_empty(owner_id: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            owner_id: owner_id.to_string(),
            title: None,
            messages: Vec::new(),
            documents: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Title derived from the first user prompt: first line, trimmed, bounded.
pub fn derive_title(messages: &[Message]) -> Option<String> {
    let first = messages.iter().find(|m| m.role == Role::User)?;
    let text = first.content.as_text();
    let line = text.lines().map(str::trim).find(|l| !l.is_empty())?;
    let title: String = line.chars().take(TITLE_MAX_CHARS).collect();
    Some(title)
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Returns `None` both for unknown ids and for sessions owned by someone else.
    async fn resolve(&self, session_id: &str, owner_id: &str) -> anyhow::Result<Option<Session>>;

    async fn create_empty(&self, owner_id: &str) -> anyhow::Result<Session>;

    async fn append_exchange(
        &self,
        session_id: &str,
        owner_id: &str,
        new_messages: Vec<Message>,
        new_documents: Vec<DocumentContext>,
    ) -> anyhow::Result<Session>;

    /// Most recently updated first.
    async fn list_for_owner(&self, owner_id: &str) -> anyhow::Result<Vec<Session>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageKind {
    Chat,
    Analysis,
}

impl UsageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UsageKind::Chat => "chat",
            UsageKind::Analysis => "analysis",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "chat" => Some(UsageKind::Chat),
            "analysis" => Some(UsageKind::Analysis),
            _ => None,
        }
    }
}

/// Token accounting reported by the model provider for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UsageInfo {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub owner_id: String,
    pub kind: UsageKind,
    pub token_count: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub session_id: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl UsageRecord {
    pub fn new(owner_id: &str, kind: UsageKind, usage: UsageInfo, session_id: Option<&str>) -> Self {
        Self {
            owner_id: owner_id.to_string(),
            kind,
            token_count: usage.total_tokens,
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            session_id: session_id.map(str::to_string),
            recorded_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageTotals {
    pub chat_tokens: u64,
    pub analysis_tokens: u64,
    pub entries: u64,
}

/// Append-only token ledger, separate from session content.
#[async_trait]
pub trait UsageLedger: Send + Sync {
    async fn record(&self, record: UsageRecord) -> anyhow::Result<()>;
    async fn totals_for_owner(&self, owner_id: &str) -> anyhow::Result<UsageTotals>;
}

#[derive(Clone, Default)]
pub struct InMemorySessionStore {
    sessions: Arc<DashMap<String, Session>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a session as-is, replacing any existing one with the same id.
    pub fn insert(&self, session: Session) {
        self.sessions.insert(session.id.clone(), session);
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn resolve(&self, session_id: &str, owner_id: &str) -> anyhow::Result<Option<Session>> {
        Ok(self
            .sessions
            .get(session_id)
            .filter(|s| s.owner_id == owner_id)
            .map(|s| s.clone()))
    }

    async fn create_empty(&self, owner_id: &str) -> anyhow::Result<Session> {
        let session = Session::new_empty(owner_id);
        self.sessions.insert(session.id.clone(), session.clone());
        Ok(session)
    }

    async fn append_exchange(
        &self,
        session_id: &str,
        owner_id: &str,
        new_messages: Vec<Message>,
        new_documents: Vec<DocumentContext>,
    ) -> anyhow::Result<Session> {
        let mut entry = self
            .sessions
            .get_mut(session_id)
            .filter(|s| s.owner_id == owner_id)
            .ok_or_else(|| anyhow::anyhow!("Session {} not found", session_id))?;

        entry.messages.extend(new_messages);
        entry.documents.extend(new_documents);
        if entry.title.is_none() {
            entry.title = derive_title(&entry.messages);
        }
        entry.updated_at = Utc::now();
        Ok(entry.clone())
    }

    async fn list_for_owner(&self, owner_id: &str) -> anyhow::Result<Vec<Session>> {
        let mut sessions: Vec<Session> = self
            .sessions
            .iter()
            .filter(|s| s.owner_id == owner_id)
            .map(|s| s.clone())
            .collect();
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(sessions)
    }
}

#[derive(Clone, Default)]
pub struct InMemoryUsageLedger {
    records: Arc<DashMap<String, Vec<UsageRecord>>>,
}

impl InMemoryUsageLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UsageLedger for InMemoryUsageLedger {
    async fn record(&self, record: UsageRecord) -> anyhow::Result<()> {
        self.records.entry(record.owner_id.clone()).or_default().push(record);
        Ok(())
    }

    async fn totals_for_owner(&self, owner_id: &str) -> anyhow::Result<UsageTotals> {
        let mut totals = UsageTotals::default();
        if let Some(records) = self.records.get(owner_id) {
            for record in records.iter() {
                match record.kind {
                    UsageKind::Chat => totals.chat_tokens += record.token_count,
                    UsageKind::Analysis => totals.analysis_tokens += record.token_count,
                }
                totals.entries += 1;
            }
        }
        Ok(totals)
    }
}
