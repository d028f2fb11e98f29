//! Fingerprint records kept between synchronization runs.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use rusqlite::OptionalExtension;

pub const DEFAULT_DB_PATH: &str = ".sync.db";

const SCHEMA: &str =
    "CREATE TABLE IF NOT EXISTS fingerprint_records (filepath TEXT UNIQUE, fingerprint TEXT)";

/// Last fingerprint synchronized for each source identity.
#[async_trait]
pub trait FingerprintStore: Send + Sync {
    async fn get_last(&self, identity: &str) -> anyhow::Result<Option<String>>;

    async fn save(&self, identity: &str, fingerprint: &str) -> anyhow::Result<()>;

    /// Releases the underlying resources, later calls fail.
    fn close(&self) -> anyhow::Result<()>;
}

/// SQLite backed store, durable across runs.
///
/// All statements run on the blocking pool and are serialized by one connection lock.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    conn: Arc<std::sync::Mutex<Option<rusqlite::Connection>>>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let conn = rusqlite::Connection::open(path)
            .with_context(|| format!("failed opening fingerprint database {path:?}"))?;
        tracing::debug!("opened fingerprint database {:?}", path);
        Self::initialize(conn)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        Self::initialize(rusqlite::Connection::open_in_memory()?)
    }

    fn initialize(conn: rusqlite::Connection) -> anyhow::Result<Self> {
        conn.execute(SCHEMA, [])
            .context("failed creating fingerprint_records table")?;
        Ok(Self {
            conn: Arc::new(std::sync::Mutex::new(Some(conn))),
        })
    }

    async fn with_conn<T, F>(&self, op: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&rusqlite::Connection) -> anyhow::Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let conn = guard
                .as_ref()
                .ok_or_else(|| anyhow!("fingerprint database is closed"))?;
            op(conn)
        })
        .await?
    }
}

#[async_trait]
impl FingerprintStore for SqliteStore {
    async fn get_last(&self, identity: &str) -> anyhow::Result<Option<String>> {
        let identity = identity.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT fingerprint FROM fingerprint_records WHERE filepath = ?1",
                rusqlite::params![&identity],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("failed reading fingerprint of {identity:?}"))
        })
        .await
    }

    async fn save(&self, identity: &str, fingerprint: &str) -> anyhow::Result<()> {
        let identity = identity.to_string();
        let fingerprint = fingerprint.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "REPLACE INTO fingerprint_records (filepath, fingerprint) VALUES (?1, ?2)",
                rusqlite::params![&identity, &fingerprint],
            )
            .with_context(|| format!("failed saving fingerprint of {identity:?}"))?;
            Ok(())
        })
        .await
    }

    fn close(&self) -> anyhow::Result<()> {
        let conn = self
            .conn
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(conn) = conn {
            conn.close()
                .map_err(|(_, error)| error)
                .context("failed closing fingerprint database")?;
        }
        Ok(())
    }
}

/// Non-durable store, the records live as long as the instance.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: std::sync::Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl FingerprintStore for MemoryStore {
    async fn get_last(&self, identity: &str) -> anyhow::Result<Option<String>> {
        Ok(self.lock().get(identity).cloned())
    }

    async fn save(&self, identity: &str, fingerprint: &str) -> anyhow::Result<()> {
        self.lock()
            .insert(identity.to_string(), fingerprint.to_string());
        Ok(())
    }

    fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
