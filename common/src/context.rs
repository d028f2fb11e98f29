//! Runtime context shared by every operation.
//!
//! The context owns what would otherwise be process-wide state: the location resolver and the
//! connection registries behind it, the transfer limit, the I/O throttle and the scheduler used
//! by the blocking facade. Everything is created by [`Context::new`] and released by
//! [`Context::shutdown`] (or on drop).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context as _, anyhow};

use crate::backends::local::LocalFactory;
use crate::backends::memory::{MemoryConnector, MemoryFactory, MemoryRegistry, MemoryStore};
use crate::config::{ThrottleConfig, TransferConfig};
use crate::descriptor::Descriptor;
use crate::error::Result;
use crate::resolver::{BackendFactory, Resolver};

pub const LOCAL_WEIGHT: i32 = 0;
pub const MEMORY_WEIGHT: i32 = 100;

pub struct Context {
    resolver: Resolver,
    memory: Arc<MemoryRegistry>,
    transfer_limit: Arc<throttle::TransferLimit>,
    iops: Arc<throttle::IopsThrottle>,
    transfer_config: TransferConfig,
    // created on first use, drives blocking calls and background tasks
    scheduler: std::sync::OnceLock<tokio::runtime::Runtime>,
    closed: AtomicBool,
}

impl Context {
    pub fn new(throttle_config: ThrottleConfig, transfer_config: TransferConfig) -> anyhow::Result<Self> {
        transfer_config.validate().map_err(|error| anyhow!(error))?;
        let memory = Arc::new(MemoryRegistry::new(MemoryConnector));
        let resolver = Resolver::new();
        resolver.register(Arc::new(LocalFactory), LOCAL_WEIGHT);
        resolver.register(Arc::new(MemoryFactory::new(memory.clone())), MEMORY_WEIGHT);
        let ctx = Self {
            resolver,
            memory,
            transfer_limit: Arc::new(throttle::TransferLimit::new(throttle_config.max_transfers)),
            iops: Arc::new(throttle::IopsThrottle::new(throttle_config.iops_throttle)),
            transfer_config,
            scheduler: std::sync::OnceLock::new(),
            closed: AtomicBool::new(false),
        };
        if ctx.iops.is_enabled() {
            let (replenish, interval) = throttle_config.iops_replenish();
            tracing::debug!("throttling to {} chunks every {:?}", replenish, interval);
            let iops = ctx.iops.clone();
            ctx.scheduler()?
                .spawn(async move { iops.run_replenish_thread(replenish, interval).await });
        }
        Ok(ctx)
    }

    pub fn with_defaults() -> anyhow::Result<Self> {
        Self::new(ThrottleConfig::default(), TransferConfig::default())
    }

    fn scheduler(&self) -> anyhow::Result<&tokio::runtime::Runtime> {
        if let Some(runtime) = self.scheduler.get() {
            return Ok(runtime);
        }
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("uio-scheduler")
            .enable_all()
            .build()
            .context("failed building the context scheduler")?;
        if let Err(runtime) = self.scheduler.set(runtime) {
            // another thread got there first
            runtime.shutdown_background();
        }
        self.scheduler
            .get()
            .ok_or_else(|| anyhow!("context scheduler is not available"))
    }

    /// Runs `future` to completion on the context's scheduler.
    ///
    /// Must not be called from within an async context.
    pub fn block_on<F: std::future::Future>(&self, future: F) -> anyhow::Result<F::Output> {
        Ok(self.scheduler()?.block_on(future))
    }

    /// Adds a backend, factories are consulted in ascending weight order.
    pub fn register(&self, factory: Arc<dyn BackendFactory>, weight: i32) {
        self.resolver.register(factory, weight);
    }

    pub fn resolve(&self, location: &str) -> Result<Descriptor> {
        let backend = self.resolver.resolve(location)?;
        Ok(Descriptor::with_throttle(backend, self.iops.clone()))
    }

    /// Shared store behind `memory://<bucket>`.
    pub async fn memory_store(&self, bucket: &str) -> anyhow::Result<Arc<MemoryStore>> {
        self.memory.connect(bucket).await
    }

    pub fn transfer_limit(&self) -> &Arc<throttle::TransferLimit> {
        &self.transfer_limit
    }

    pub fn transfer_config(&self) -> &TransferConfig {
        &self.transfer_config
    }

    pub fn copy_settings(&self) -> crate::copy::Settings {
        self.transfer_config.copy_settings()
    }

    /// Closes every backend connection, only the first call has an effect.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!("shutting down context");
        self.resolver.close();
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(runtime) = self.scheduler.take() {
            // safe to call from within an async context, unlike dropping the runtime
            runtime.shutdown_background();
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("resolver", &self.resolver)
            .field("memory", &self.memory)
            .field("transfer_limit", &self.transfer_limit.size())
            .field("transfer_config", &self.transfer_config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use tracing_test::traced_test;

    #[test]
    #[traced_test]
    fn default_backends_are_registered() -> anyhow::Result<()> {
        let ctx = Context::with_defaults()?;
        assert!(ctx.resolve("/tmp/foo")?.location().as_path().is_some());
        assert!(ctx.resolve("file:///tmp/foo")?.location().as_path().is_some());
        assert_eq!(
            ctx.resolve("memory://bucket/a")?.identity(),
            "memory://bucket/a"
        );
        assert!(matches!(
            ctx.resolve("sftp://host/a"),
            Err(Error::UnsupportedLocation(_))
        ));
        assert_eq!(ctx.transfer_limit().size(), Some(throttle::DEFAULT_MAX_TRANSFERS));
        Ok(())
    }

    #[test]
    #[traced_test]
    fn shutdown_closes_connections() -> anyhow::Result<()> {
        let ctx = Context::with_defaults()?;
        let store = ctx.block_on(ctx.memory_store("bucket"))??;
        store.put("a.txt", bytes::Bytes::from_static(b"a"))?;
        assert!(ctx.block_on(ctx.resolve("memory://bucket/a.txt")?.exists())??);
        ctx.shutdown();
        ctx.shutdown();
        assert!(ctx.block_on(ctx.memory_store("bucket"))?.is_err());
        Ok(())
    }

    #[test]
    #[traced_test]
    fn invalid_transfer_config_is_rejected() {
        let transfer = TransferConfig {
            chunk_size: 0,
            ..Default::default()
        };
        assert!(Context::new(ThrottleConfig::default(), transfer).is_err());
    }

    #[tokio::test]
    #[traced_test]
    async fn can_be_dropped_inside_a_runtime() -> anyhow::Result<()> {
        let ctx = Context::new(
            ThrottleConfig {
                iops_throttle: 100,
                ..Default::default()
            },
            TransferConfig::default(),
        )?;
        let file = ctx.resolve("memory://bucket/f")?;
        assert!(!file.exists().await?);
        drop(ctx);
        Ok(())
    }
}
