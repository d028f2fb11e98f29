//! Cache of shared backend connections.
//!
//! Backends that talk to a remote service (or, for the in-memory backend, to a shared store)
//! obtain their connection through a [`ConnectionRegistry`]. There is at most one live connection
//! per key: the first caller for a key constructs it and every concurrent caller waits for that
//! construction instead of racing it. All connections are closed exactly once by
//! [`ConnectionRegistry::close_all`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use sha2::Digest;

/// Derives a cache key that does not leak the connection parameters (which may hold
/// credentials).
pub fn hashed_key(params: &str) -> String {
    hex::encode(sha2::Sha256::digest(params.as_bytes()))
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: Send + Sync + 'static;

    fn key(&self, params: &str) -> String {
        hashed_key(params)
    }

    async fn connect(&self, params: &str) -> anyhow::Result<Self::Connection>;

    fn close(&self, _connection: &Self::Connection) -> anyhow::Result<()> {
        Ok(())
    }
}

type Slot<T> = Arc<tokio::sync::OnceCell<Arc<T>>>;

pub struct ConnectionRegistry<C: Connector> {
    connector: C,
    connections: std::sync::Mutex<HashMap<String, Slot<C::Connection>>>,
    closed: AtomicBool,
}

impl<C: Connector> ConnectionRegistry<C> {
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            connections: std::sync::Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Slot<C::Connection>>> {
        self.connections
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub async fn connect(&self, params: &str) -> anyhow::Result<Arc<C::Connection>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(anyhow::anyhow!("connection registry is already closed"));
        }
        let key = self.connector.key(params);
        let slot = self.lock().entry(key.clone()).or_default().clone();
        let connection = slot
            .get_or_try_init(|| async {
                tracing::debug!("opening connection {}", &key);
                self.connector.connect(params).await.map(Arc::new)
            })
            .await?;
        Ok(connection.clone())
    }

    /// Number of established connections.
    pub fn len(&self) -> usize {
        self.lock()
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Closes every cached connection. Only the first call has any effect, failures are logged.
    pub fn close_all(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let connections: Vec<_> = self.lock().drain().collect();
        for (key, slot) in connections {
            if let Some(connection) = slot.get() {
                tracing::debug!("closing connection {}", &key);
                if let Err(error) = self.connector.close(connection) {
                    tracing::error!("failed closing connection {}: {:#}", &key, &error);
                }
            }
        }
    }
}

impl<C: Connector> Drop for ConnectionRegistry<C> {
    fn drop(&mut self) {
        self.close_all();
    }
}

impl<C: Connector> std::fmt::Debug for ConnectionRegistry<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connections", &self.len())
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tracing_test::traced_test;

    #[derive(Default)]
    struct CountingConnector {
        opened: Arc<AtomicUsize>,
        closed: Arc<AtomicUsize>,
        fail_close: bool,
    }

    #[async_trait]
    impl Connector for CountingConnector {
        type Connection = String;

        async fn connect(&self, params: &str) -> anyhow::Result<String> {
            // give concurrent callers a chance to pile up on the same key
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(format!("connection to {params}"))
        }

        fn close(&self, _connection: &String) -> anyhow::Result<()> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            if self.fail_close {
                return Err(anyhow::anyhow!("close failed"));
            }
            Ok(())
        }
    }

    #[test]
    fn key_does_not_contain_params() {
        let key = hashed_key("user:secret@host");
        assert!(!key.contains("secret"));
        assert_eq!(key, hashed_key("user:secret@host"));
        assert_ne!(key, hashed_key("user:other@host"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[traced_test]
    async fn concurrent_first_use_shares_one_connection() -> anyhow::Result<()> {
        let connector = CountingConnector::default();
        let opened = connector.opened.clone();
        let registry = Arc::new(ConnectionRegistry::new(connector));
        let mut join_set = tokio::task::JoinSet::new();
        for _ in 0..16 {
            let registry = registry.clone();
            join_set.spawn(async move { registry.connect("sftp://host").await });
        }
        let mut connections = vec![];
        while let Some(res) = join_set.join_next().await {
            connections.push(res??);
        }
        assert_eq!(opened.load(Ordering::SeqCst), 1);
        assert!(connections.iter().all(|c| Arc::ptr_eq(c, &connections[0])));
        assert_eq!(registry.len(), 1);
        registry.connect("sftp://other").await?;
        assert_eq!(opened.load(Ordering::SeqCst), 2);
        assert_eq!(registry.len(), 2);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn close_all_runs_once_and_logs_failures() -> anyhow::Result<()> {
        let connector = CountingConnector {
            fail_close: true,
            ..Default::default()
        };
        let closed = connector.closed.clone();
        let registry = ConnectionRegistry::new(connector);
        registry.connect("a").await?;
        registry.connect("b").await?;
        registry.close_all();
        registry.close_all();
        assert_eq!(closed.load(Ordering::SeqCst), 2);
        assert!(registry.is_empty());
        assert!(registry.connect("a").await.is_err());
        drop(registry);
        assert_eq!(closed.load(Ordering::SeqCst), 2);
        assert!(logs_contain("failed closing connection"));
        Ok(())
    }
}
