use async_trait::async_trait;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::memory_db::schema::format_timestamp;
use crate::memory_db::with_connection;
use crate::session_store::{UsageKind, UsageLedger, UsageRecord, UsageTotals};

/// SQLite-backed append-only `UsageLedger`.
#[derive(Clone)]
pub struct UsageStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl UsageStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UsageLedger for UsageStore {
    async fn record(&self, record: UsageRecord) -> anyhow::Result<()> {
        with_connection(&self.pool, move |conn| {
            conn.execute(
                "INSERT INTO usage_ledger
                 (owner_id, kind, token_count, prompt_tokens, completion_tokens, session_id, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    record.owner_id,
                    record.kind.as_str(),
                    record.token_count as i64,
                    record.prompt_tokens as i64,
                    record.completion_tokens as i64,
                    record.session_id,
                    format_timestamp(&record.recorded_at),
                ],
            )?;
            debug!("Recorded {} {} tokens for {}", record.token_count, record.kind.as_str(), record.owner_id);
            Ok(())
        })
        .await
    }

    async fn totals_for_owner(&self, owner_id: &str) -> anyhow::Result<UsageTotals> {
        let owner_id = owner_id.to_string();
        with_connection(&self.pool, move |conn| {
            let mut stmt = conn.prepare(
                "SELECT kind, COALESCE(SUM(token_count), 0), COUNT(*)
                 FROM usage_ledger WHERE owner_id = ?1 GROUP BY kind",
            )?;
            let rows = stmt.query_map([&owner_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?))
            })?;

            let mut totals = UsageTotals::default();
            for row in rows {
                let (kind, tokens, entries) = row?;
                match UsageKind::parse(&kind) {
                    Some(UsageKind::Chat) => totals.chat_tokens += tokens.max(0) as u64,
                    Some(UsageKind::Analysis) => totals.analysis_tokens += tokens.max(0) as u64,
                    None => {
                        warn!("Ignoring usage rows with unknown kind {}", kind);
                        continue;
                    }
                }
                totals.entries += entries.max(0) as u64;
            }
            Ok(totals)
        })
        .await
    }
}
