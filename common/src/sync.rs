//! Fingerprint based one-way directory synchronization.
//!
//! Every source file whose fingerprint is unknown, whose target is missing, or whose fingerprint
//! differs from the one recorded after the previous successful copy is copied onto its mirror
//! below the target. Unchanged files are left alone and files that only exist on the target are
//! never deleted.

use std::sync::Arc;

use anyhow::Context as _;
use futures::StreamExt;
use tracing::instrument;

use crate::config::StoreConfig;
use crate::context::Context;
use crate::copy;
use crate::crawl;
use crate::descriptor::Descriptor;
use crate::dirs;
use crate::engine::{Engine, EngineError, JobStatus, OnComplete};
use crate::error::{Error as DescriptorError, ResourceKind};
use crate::fingerprint::{self, HashAlgorithm};
use crate::store::{FingerprintStore, MemoryStore, SqliteStore};

/// Error type for synchronization that tracks what was updated before the failure.
///
/// Log with `{:#}` or `{:?}` to see the full chain of causes.
#[derive(Debug, thiserror::Error)]
#[error("{source:#}")]
pub struct Error {
    #[source]
    pub source: anyhow::Error,
    pub summary: Summary,
}

impl Error {
    #[must_use]
    pub fn new(source: anyhow::Error, summary: Summary) -> Self {
        Error { source, summary }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Summary {
    pub files_checked: usize,
    pub files_updated: usize,
    pub files_unchanged: usize,
    pub directories_created: usize,
    pub bytes_copied: u64,
}

impl std::ops::Add for Summary {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self {
            files_checked: self.files_checked + other.files_checked,
            files_updated: self.files_updated + other.files_updated,
            files_unchanged: self.files_unchanged + other.files_unchanged,
            directories_created: self.directories_created + other.directories_created,
            bytes_copied: self.bytes_copied + other.bytes_copied,
        }
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "files checked: {}\n\
            files updated: {}\n\
            files unchanged: {}\n\
            directories created: {}\n\
            bytes copied: {}",
            self.files_checked,
            self.files_updated,
            self.files_unchanged,
            self.directories_created,
            bytesize::ByteSize(self.bytes_copied),
        )
    }
}

pub struct DirectorySynchronizer {
    source: Descriptor,
    target: Descriptor,
    store: Arc<dyn FingerprintStore>,
    transfer_limit: Arc<throttle::TransferLimit>,
    settings: copy::Settings,
    hash_algorithm: HashAlgorithm,
}

type CopyTasks = tokio::task::JoinSet<anyhow::Result<u64>>;

impl DirectorySynchronizer {
    pub fn new(
        source: Descriptor,
        target: Descriptor,
        store: Arc<dyn FingerprintStore>,
        ctx: &Context,
    ) -> Self {
        let settings = copy::Settings {
            allow_overwrite: true,
            use_partial_file: true,
            ..ctx.copy_settings()
        };
        Self {
            source,
            target,
            store,
            transfer_limit: ctx.transfer_limit().clone(),
            settings,
            hash_algorithm: ctx.transfer_config().hash_algorithm,
        }
    }

    /// Synchronizes the whole tree. Copies run concurrently, bounded by the transfer limit; the
    /// first failure is reported once every started copy has finished.
    #[instrument(skip(self), fields(source = %self.source, target = %self.target))]
    pub async fn sync_all(&self) -> Result<Summary, Error> {
        tracing::info!("synchronizing {} into {}", &self.source, &self.target);
        let mut summary = Summary::default();
        let mut copies = CopyTasks::new();
        let mut first_error = self.schedule(&mut summary, &mut copies).await.err();
        while let Some(res) = copies.join_next().await {
            match res.map_err(anyhow::Error::from).and_then(|res| res) {
                Ok(bytes) => {
                    summary.files_updated += 1;
                    summary.bytes_copied += bytes;
                }
                Err(error) => {
                    tracing::error!("{:#}", &error);
                    if first_error.is_none() {
                        first_error = Some(error);
                    }
                }
            }
        }
        match first_error {
            Some(error) => Err(Error::new(error, summary)),
            None => {
                tracing::info!("{} synchronized", &self.target);
                Ok(summary)
            }
        }
    }

    async fn schedule(&self, summary: &mut Summary, copies: &mut CopyTasks) -> anyhow::Result<()> {
        let source_stat = self.source.stat().await?;
        if !source_stat.exists() {
            return Err(DescriptorError::NotFound(self.source.identity()).into());
        }
        if !source_stat.is_dir() {
            return Err(DescriptorError::wrong_type(&self.source, ResourceKind::Directory).into());
        }
        if !self.target.is_dir().await? {
            dirs::mkdir(&self.target, true).await?;
            summary.directories_created += 1;
        }
        let mut pairs = crawl::crawl(&self.source, &self.target, true, true);
        while let Some(pair) = pairs.next().await {
            let (src, dst) = pair?;
            if src.is_dir().await? {
                // crawl yields a parent before its children, so the target parent already exists
                if !dst.is_dir().await? {
                    dirs::mkdir(&dst, false).await?;
                    summary.directories_created += 1;
                }
                continue;
            }
            summary.files_checked += 1;
            let fingerprint =
                fingerprint::fingerprint_with(&src, self.hash_algorithm, self.settings.chunk_size)
                    .await?;
            tracing::debug!("checking {} ({:?})", &src, &fingerprint);
            if !self.needs_copy(&src, &dst, fingerprint.as_deref()).await? {
                summary.files_unchanged += 1;
                continue;
            }
            let store = self.store.clone();
            let transfer_limit = self.transfer_limit.clone();
            let settings = self.settings;
            copies.spawn(async move {
                let _permit = transfer_limit.permit().await;
                tracing::debug!("copying {} to {}", &src, &dst);
                let copied = copy::copy(&src, &dst, &settings)
                    .await
                    .with_context(|| format!("failed copying {} to {}", &src, &dst))?;
                if let Some(fingerprint) = fingerprint {
                    tracing::trace!("saving fingerprint for {}", &src);
                    store.save(&src.identity(), &fingerprint).await?;
                }
                anyhow::Ok(copied.bytes_copied)
            });
        }
        Ok(())
    }

    async fn needs_copy(
        &self,
        src: &Descriptor,
        dst: &Descriptor,
        fingerprint: Option<&str>,
    ) -> anyhow::Result<bool> {
        // an unknown fingerprint can't tell us whether the file changed
        let Some(fingerprint) = fingerprint else {
            return Ok(true);
        };
        if !dst.exists().await? {
            return Ok(true);
        }
        let last = self.store.get_last(&src.identity()).await?;
        Ok(last.as_deref() != Some(fingerprint))
    }
}

pub fn open_store(config: &StoreConfig) -> anyhow::Result<Arc<dyn FingerprintStore>> {
    Ok(match config {
        StoreConfig::Sqlite(path) => Arc::new(SqliteStore::open(path)?),
        StoreConfig::InMemory => Arc::new(MemoryStore::new()),
    })
}

/// Runs synchronizations in the background, sharing one fingerprint store that is closed once
/// the engine completes.
pub struct DirectorySync {
    ctx: Arc<Context>,
    store: Arc<dyn FingerprintStore>,
    engine: Engine<Summary>,
}

impl DirectorySync {
    pub fn new(ctx: Arc<Context>, store: Arc<dyn FingerprintStore>) -> Result<Self, EngineError> {
        let on_complete: OnComplete = {
            let store = store.clone();
            Box::new(move || {
                if let Err(error) = store.close() {
                    tracing::error!("failed closing fingerprint store: {:#}", &error);
                }
            })
        };
        Ok(Self {
            ctx,
            store,
            engine: Engine::start("uio-sync", Some(on_complete))?,
        })
    }

    /// Queues a synchronization of `src` into `dst` and returns the job name.
    pub fn sync_dir(&self, src: &str, dst: &str, name: Option<&str>) -> Result<String, EngineError> {
        let name = name
            .map(str::to_string)
            .unwrap_or_else(|| format!("sync_{src}_to_{dst}"));
        let ctx = self.ctx.clone();
        let store = self.store.clone();
        let (src, dst) = (src.to_string(), dst.to_string());
        self.engine.submit(&name, async move {
            let source = ctx.resolve(&src)?;
            let target = ctx.resolve(&dst)?;
            let synchronizer = DirectorySynchronizer::new(source, target, store, &ctx);
            anyhow::Ok(synchronizer.sync_all().await?)
        })?;
        Ok(name)
    }

    pub fn is_complete(&self, name: &str) -> bool {
        self.engine.is_complete(name)
    }

    pub fn result(&self, name: &str) -> JobStatus<Summary> {
        self.engine.result(name)
    }

    pub fn wait_for_job(&self, name: &str) -> JobStatus<Summary> {
        self.engine.wait_for(name)
    }

    /// Waits for every queued job, after which no more jobs are accepted.
    pub fn wait_for_all(&self) {
        self.engine.drain();
    }
}
