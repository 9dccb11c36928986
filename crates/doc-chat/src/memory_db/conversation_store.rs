use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Arc;
use tracing::{debug, info};

use crate::document::{DocumentContext, Page};
use crate::memory_db::schema::{format_timestamp, parse_timestamp};
use crate::memory_db::with_connection;
use crate::message::{Message, MessageContent, Role};
use crate::session_store::{derive_title, Session, SessionStore};

/// SQLite-backed `SessionStore`.
#[derive(Clone)]
pub struct ConversationStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl ConversationStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionStore for ConversationStore {
    async fn resolve(&self, session_id: &str, owner_id: &str) -> anyhow::Result<Option<Session>> {
        let session_id = session_id.to_string();
        let owner_id = owner_id.to_string();
        with_connection(&self.pool, move |conn| load_session(conn, &session_id, &owner_id)).await
    }

    async fn create_empty(&self, owner_id: &str) -> anyhow::Result<Session> {
        let session = Session::new_empty(owner_id);
        let row = session.clone();
        with_connection(&self.pool, move |conn| {
            conn.execute(
                "INSERT INTO sessions (id, owner_id, title, created_at, updated_at)
                 VALUES (?1, ?2, NULL, ?3, ?4)",
                params![
                    row.id,
                    row.owner_id,
                    format_timestamp(&row.created_at),
                    format_timestamp(&row.updated_at),
                ],
            )?;
            Ok(())
        })
        .await?;
        info!("Created session {} for {}", session.id, session.owner_id);
        Ok(session)
    }

    async fn append_exchange(
        &self,
        session_id: &str,
        owner_id: &str,
        new_messages: Vec<Message>,
        new_documents: Vec<DocumentContext>,
    ) -> anyhow::Result<Session> {
        let session_id = session_id.to_string();
        let owner_id = owner_id.to_string();
        with_connection(&self.pool, move |conn| {
            append_with_tx(conn, &session_id, &owner_id, &new_messages, &new_documents)?;
            load_session(conn, &session_id, &owner_id)?
                .with_context(|| format!("Session {} vanished after append", session_id))
        })
        .await
    }

    async fn list_for_owner(&self, owner_id: &str) -> anyhow::Result<Vec<Session>> {
        let owner_id = owner_id.to_string();
        with_connection(&self.pool, move |conn| {
            let ids: Vec<String> = {
                let mut stmt = conn.prepare(
                    "SELECT id FROM sessions WHERE owner_id = ?1 ORDER BY updated_at DESC, id",
                )?;
                let rows = stmt.query_map([&owner_id], |row| row.get(0))?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            };

            let mut sessions = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(session) = load_session(conn, &id, &owner_id)? {
                    sessions.push(session);
                }
            }
            Ok(sessions)
        })
        .await
    }
}

fn append_with_tx(
    conn: &mut Connection,
    session_id: &str,
    owner_id: &str,
    new_messages: &[Message],
    new_documents: &[DocumentContext],
) -> anyhow::Result<()> {
    let now = format_timestamp(&Utc::now());
    let tx = conn.transaction()?;

    let owned: Option<String> = tx
        .query_row(
            "SELECT id FROM sessions WHERE id = ?1 AND owner_id = ?2",
            params![session_id, owner_id],
            |row| row.get(0),
        )
        .optional()?;
    if owned.is_none() {
        anyhow::bail!("Session {} not found", session_id);
    }

    let next_message: i64 = tx.query_row(
        "SELECT COALESCE(MAX(message_index), -1) + 1 FROM messages WHERE session_id = ?1",
        [session_id],
        |row| row.get(0),
    )?;
    for (offset, message) in new_messages.iter().enumerate() {
        tx.execute(
            "INSERT INTO messages (session_id, message_index, role, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                session_id,
                next_message + offset as i64,
                message.role.as_str(),
                serde_json::to_string(&message.content)?,
                &now,
            ],
        )?;
    }

    let next_document: i64 = tx.query_row(
        "SELECT COALESCE(MAX(document_index), -1) + 1 FROM documents WHERE session_id = ?1",
        [session_id],
        |row| row.get(0),
    )?;
    for (offset, document) in new_documents.iter().enumerate() {
        tx.execute(
            "INSERT INTO documents
             (session_id, document_index, source_name, page_count, processed_bytes, pages, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                session_id,
                next_document + offset as i64,
                document.source_name,
                document.page_count,
                document.processed_bytes as i64,
                serde_json::to_string(&document.pages)?,
                format_timestamp(&document.created_at),
            ],
        )?;
    }

    tx.execute(
        "UPDATE sessions SET title = COALESCE(title, ?1), updated_at = ?2 WHERE id = ?3",
        params![derive_title(new_messages), &now, session_id],
    )?;

    tx.commit()?;
    debug!(
        "Appended {} message(s) and {} document(s) to session {}",
        new_messages.len(),
        new_documents.len(),
        session_id
    );
    Ok(())
}

fn load_session(conn: &Connection, session_id: &str, owner_id: &str) -> anyhow::Result<Option<Session>> {
    let row = conn
        .query_row(
            "SELECT id, owner_id, title, created_at, updated_at
             FROM sessions WHERE id = ?1 AND owner_id = ?2",
            params![session_id, owner_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            },
        )
        .optional()?;

    let Some((id, owner_id, title, created_at, updated_at)) = row else {
        return Ok(None);
    };

    Ok(Some(Session {
        messages: load_messages(conn, &id)?,
        documents: load_documents(conn, &id)?,
        id,
        owner_id,
        title,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    }))
}

fn load_messages(conn: &Connection, session_id: &str) -> anyhow::Result<Vec<Message>> {
    let mut stmt = conn.prepare(
        "SELECT role, content FROM messages WHERE session_id = ?1 ORDER BY message_index",
    )?;
    let rows = stmt.query_map([session_id], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;

    let mut messages = Vec::new();
    for row in rows {
        let (role, content) = row?;
        let role = Role::parse(&role).with_context(|| format!("Unknown message role {}", role))?;
        let content: MessageContent = serde_json::from_str(&content)
            .with_context(|| format!("Corrupt message content in session {}", session_id))?;
        messages.push(Message { role, content });
    }
    Ok(messages)
}

fn load_documents(conn: &Connection, session_id: &str) -> anyhow::Result<Vec<DocumentContext>> {
    let mut stmt = conn.prepare(
        "SELECT source_name, page_count, processed_bytes, pages, created_at
         FROM documents WHERE session_id = ?1 ORDER BY document_index",
    )?;
    let rows = stmt.query_map([session_id], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, u32>(1)?,
            row.get::<_, i64>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, String>(4)?,
        ))
    })?;

    let mut documents = Vec::new();
    for row in rows {
        let (source_name, page_count, processed_bytes, pages, created_at) = row?;
        let pages: Vec<Page> = serde_json::from_str(&pages)
            .with_context(|| format!("Corrupt pages for document {}", source_name))?;
        documents.push(DocumentContext {
            source_name,
            pages,
            page_count,
            processed_bytes: processed_bytes.max(0) as u64,
            created_at: parse_timestamp(&created_at)?,
        });
    }
    Ok(documents)
}
