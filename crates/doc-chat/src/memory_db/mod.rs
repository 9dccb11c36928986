//! Memory database module - SQLite-based storage for sessions, documents and token usage
pub mod conversation_store;
pub mod migration;
pub mod schema;
pub mod usage_store;

pub use conversation_store::ConversationStore;
pub use migration::MigrationManager;
pub use usage_store::UsageStore;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

pub struct MemoryDatabase {
    pub sessions: ConversationStore,
    pub usage: UsageStore,
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl MemoryDatabase {
    pub fn new(db_path: &Path) -> anyhow::Result<Self> {
        info!("Opening session database at: {}", db_path.display());
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let manager = SqliteConnectionManager::file(db_path)
            .with_flags(
                rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                    | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                    | rusqlite::OpenFlags::SQLITE_OPEN_FULL_MUTEX,
            )
            .with_init(|conn| {
                conn.execute_batch(
                    "PRAGMA foreign_keys = ON;
                     PRAGMA synchronous = NORMAL;
                     PRAGMA busy_timeout = 5000;",
                )
            });
        let pool = Pool::builder()
            .max_size(10)
            .build(manager)
            .map_err(|e| anyhow::anyhow!("Failed to create connection pool: {}", e))?;

        {
            let mut conn = pool.get()?;
            conn.execute_batch("PRAGMA journal_mode = WAL;")?;
            MigrationManager::new(&mut conn).initialize_database()?;
        }
        info!("Session database initialized successfully");
        Ok(Self::from_pool(pool))
    }

    /// Every in-memory connection is its own database, so the pool holds one.
    pub fn new_in_memory() -> anyhow::Result<Self> {
        let manager = SqliteConnectionManager::memory()
            .with_init(|conn| conn.execute_batch("PRAGMA foreign_keys = ON;"));
        let pool = Pool::builder().max_size(1).build(manager)?;
        {
            let mut conn = pool.get()?;
            MigrationManager::new(&mut conn).initialize_database()?;
        }
        Ok(Self::from_pool(pool))
    }

    fn from_pool(pool: Pool<SqliteConnectionManager>) -> Self {
        let pool = Arc::new(pool);
        Self {
            sessions: ConversationStore::new(Arc::clone(&pool)),
            usage: UsageStore::new(Arc::clone(&pool)),
            pool,
        }
    }
}

impl Drop for MemoryDatabase {
    fn drop(&mut self) {
        if let Ok(conn) = self.pool.get() {
            let _ = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);");
        }
    }
}

/// Run blocking SQLite work on the blocking pool with one pooled connection.
pub(crate) async fn with_connection<T, F>(pool: &Arc<Pool<SqliteConnectionManager>>, f: F) -> anyhow::Result<T>
where
    F: FnOnce(&mut Connection) -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let pool = Arc::clone(pool);
    tokio::task::spawn_blocking(move || {
        let mut conn = pool
            .get()
            .map_err(|e| anyhow::anyhow!("Failed to get connection from pool: {}", e))?;
        f(&mut conn)
    })
    .await
    .map_err(|e| anyhow::anyhow!("Database task failed: {}", e))?
}
