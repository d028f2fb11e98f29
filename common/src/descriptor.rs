//! Resource descriptors and the backend capability contract.
//!
//! A [`Backend`] implements a small set of primitives for one addressable resource: a `stat`
//! probe, one-level `list`, chunked `reader`/`writer`, `remove` and one-level directory
//! creation/removal. Optionally it can recognize another backend as "local" and offer a native
//! copy/rename path.
//!
//! A [`Descriptor`] wraps a backend together with a per-instance probe cache. All of the generic
//! algorithms (copy, move, mkdir, rmdir, crawl, fingerprint) are written against descriptors and
//! only ever call the primitives, so they behave identically on every backend.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;

use crate::error::{Error, ResourceKind, Result};
use crate::location::Location;

/// Result of a single `stat` probe.
///
/// Timestamps and size are optional, not every backend can report them cheaply.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct Stat {
    pub kind: Option<ResourceKind>,
    pub size: Option<u64>,
    pub mtime: Option<chrono::DateTime<chrono::Utc>>,
    pub atime: Option<chrono::DateTime<chrono::Utc>>,
    pub crtime: Option<chrono::DateTime<chrono::Utc>>,
}

impl Stat {
    #[must_use]
    pub fn missing() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn directory() -> Self {
        Self {
            kind: Some(ResourceKind::Directory),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn file(size: Option<u64>) -> Self {
        Self {
            kind: Some(ResourceKind::File),
            size,
            ..Default::default()
        }
    }

    pub fn exists(&self) -> bool {
        self.kind.is_some()
    }

    pub fn is_file(&self) -> bool {
        self.kind == Some(ResourceKind::File)
    }

    pub fn is_dir(&self) -> bool {
        self.kind == Some(ResourceKind::Directory)
    }
}

/// Native strategy a backend offers for a pair of descriptors it considers local to each other.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FastPath {
    /// The backend can copy a file to the target without streaming it through the client.
    NativeCopy,
    /// As `NativeCopy`, and the source can also be renamed onto the target.
    NativeCopyAndRename,
}

impl FastPath {
    pub fn can_rename(&self) -> bool {
        matches!(self, FastPath::NativeCopyAndRename)
    }
}

#[async_trait]
pub trait ChunkReader: Send {
    /// Returns `None` once the resource is exhausted.
    async fn read_chunk(&mut self, chunk_size: usize) -> Result<Option<Bytes>>;
}

#[async_trait]
pub trait ChunkWriter: Send {
    async fn write_chunk(&mut self, chunk: Bytes) -> Result<()>;

    /// Commits the written data. A writer dropped without `finish` releases its resources but
    /// the backend is free to discard whatever was written.
    async fn finish(self: Box<Self>) -> Result<()>;
}

/// Capability contract every storage backend implements.
#[async_trait]
pub trait Backend: Send + Sync + std::fmt::Debug {
    fn location(&self) -> &Location;

    /// Identifier of the storage domain this resource lives in. Two resources in the same domain
    /// can be handed to `native_copy`/`native_rename` of each other.
    fn domain(&self) -> String;

    /// A resource on the same backend (and same connection) at another location.
    fn with_location(&self, location: Location) -> Arc<dyn Backend>;

    async fn stat(&self) -> Result<Stat>;

    /// Immediate children of a directory, in no particular order.
    async fn list(&self) -> Result<BoxStream<'static, Result<Location>>>;

    async fn reader(&self) -> Result<Box<dyn ChunkReader>>;

    async fn writer(&self) -> Result<Box<dyn ChunkWriter>>;

    /// Removes a single file.
    async fn remove(&self) -> Result<()>;

    /// Creates this directory, the parent must already exist.
    async fn create_dir(&self) -> Result<()>;

    /// Removes this directory, it must already be empty.
    async fn remove_dir(&self) -> Result<()>;

    fn locality(&self, _other: &dyn Backend) -> Option<FastPath> {
        None
    }

    async fn native_copy(&self, _target: &Location) -> Result<()> {
        Err(Error::unsupported(self.location(), "native copy"))
    }

    async fn native_rename(&self, _target: &Location) -> Result<()> {
        Err(Error::unsupported(self.location(), "native rename"))
    }

    fn supports_fast_rename(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Default)]
struct ProbeCache {
    stat: Option<Stat>,
    content_hash: Option<(crate::fingerprint::HashAlgorithm, String)>,
}

/// Handle to one addressable resource.
///
/// Probe results are cached for the lifetime of the instance; any mutation made through the
/// descriptor clears the cache. Mutations made behind its back (by another descriptor or another
/// process) are only observed after [`Descriptor::clear_cache`].
pub struct Descriptor {
    backend: Arc<dyn Backend>,
    cache: std::sync::Mutex<ProbeCache>,
    iops: Arc<throttle::IopsThrottle>,
}

impl Descriptor {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self::with_throttle(backend, Arc::new(throttle::IopsThrottle::disabled()))
    }

    pub fn with_throttle(backend: Arc<dyn Backend>, iops: Arc<throttle::IopsThrottle>) -> Self {
        Self {
            backend,
            cache: std::sync::Mutex::new(ProbeCache::default()),
            iops,
        }
    }

    fn derive(&self, location: Location) -> Self {
        Self::with_throttle(self.backend.with_location(location), self.iops.clone())
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub(crate) fn iops(&self) -> &throttle::IopsThrottle {
        &self.iops
    }

    pub fn location(&self) -> &Location {
        self.backend.location()
    }

    /// Canonical identity, used as the key of fingerprint records.
    pub fn identity(&self) -> String {
        self.location().to_string()
    }

    pub fn basename(&self) -> Option<String> {
        self.location().basename()
    }

    pub fn parent(&self) -> Option<Descriptor> {
        self.location()
            .parent()
            .map(|location| self.derive(location))
    }

    pub fn child(&self, name: &str) -> Descriptor {
        self.derive(self.location().child(name))
    }

    pub(crate) fn with_suffix(&self, suffix: &str) -> Descriptor {
        self.derive(self.location().with_suffix(suffix))
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, ProbeCache> {
        // the cache holds plain data, a panic while holding the lock cannot leave it inconsistent
        self.cache
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn clear_cache(&self) {
        *self.lock_cache() = ProbeCache::default();
    }

    pub(crate) fn cached_hash(
        &self,
        algorithm: crate::fingerprint::HashAlgorithm,
    ) -> Option<String> {
        match &self.lock_cache().content_hash {
            Some((cached, hash)) if *cached == algorithm => Some(hash.clone()),
            _ => None,
        }
    }

    pub(crate) fn cache_hash(&self, algorithm: crate::fingerprint::HashAlgorithm, hash: String) {
        self.lock_cache().content_hash = Some((algorithm, hash));
    }

    pub async fn stat(&self) -> Result<Stat> {
        if let Some(stat) = self.lock_cache().stat {
            return Ok(stat);
        }
        let stat = self.backend.stat().await?;
        tracing::trace!("stat {}: {:?}", self, &stat);
        self.lock_cache().stat = Some(stat);
        Ok(stat)
    }

    pub async fn exists(&self) -> Result<bool> {
        Ok(self.stat().await?.exists())
    }

    pub async fn is_file(&self) -> Result<bool> {
        Ok(self.stat().await?.is_file())
    }

    pub async fn is_dir(&self) -> Result<bool> {
        Ok(self.stat().await?.is_dir())
    }

    pub async fn size(&self) -> Result<Option<u64>> {
        Ok(self.stat().await?.size)
    }

    pub async fn mtime(&self) -> Result<Option<chrono::DateTime<chrono::Utc>>> {
        Ok(self.stat().await?.mtime)
    }

    pub async fn atime(&self) -> Result<Option<chrono::DateTime<chrono::Utc>>> {
        Ok(self.stat().await?.atime)
    }

    pub async fn crtime(&self) -> Result<Option<chrono::DateTime<chrono::Utc>>> {
        Ok(self.stat().await?.crtime)
    }

    /// Lazily lists the children of a directory.
    pub async fn list(&self) -> Result<BoxStream<'static, Result<Descriptor>>> {
        let stat = self.stat().await?;
        if !stat.exists() {
            return Err(Error::NotFound(self.identity()));
        }
        if !stat.is_dir() {
            return Err(Error::wrong_type(self, ResourceKind::Directory));
        }
        let backend = self.backend.clone();
        let iops = self.iops.clone();
        let children = self.backend.list().await?.map(move |location| {
            location.map(|location| {
                Descriptor::with_throttle(backend.with_location(location), iops.clone())
            })
        });
        Ok(children.boxed())
    }

    pub async fn reader(&self) -> Result<Box<dyn ChunkReader>> {
        self.backend.reader().await
    }

    pub async fn writer(&self) -> Result<Box<dyn ChunkWriter>> {
        self.clear_cache();
        self.backend.writer().await
    }

    /// Removes a single file.
    pub async fn remove(&self) -> Result<()> {
        let stat = self.stat().await?;
        if !stat.exists() {
            return Err(Error::NotFound(self.identity()));
        }
        if !stat.is_file() {
            return Err(Error::wrong_type(self, ResourceKind::File));
        }
        let result = self.backend.remove().await;
        self.clear_cache();
        result
    }

    /// Fast path the backend offers for copying or moving this resource onto `other`.
    pub fn locality(&self, other: &Descriptor) -> Option<FastPath> {
        self.backend.locality(other.backend.as_ref())
    }

    pub fn supports_fast_rename(&self) -> bool {
        self.backend.supports_fast_rename()
    }

    /// Blocking view of this descriptor, driven by the context's scheduler.
    pub fn blocking<'a>(
        &'a self,
        ctx: &'a crate::context::Context,
    ) -> crate::blocking::BlockingDescriptor<'a> {
        crate::blocking::BlockingDescriptor::new(self, ctx)
    }
}

impl Clone for Descriptor {
    /// A clone is a separate instance that starts from a snapshot of this instance's cache.
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            cache: std::sync::Mutex::new(self.lock_cache().clone()),
            iops: self.iops.clone(),
        }
    }
}

impl std::fmt::Display for Descriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.location())
    }
}

impl std::fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Descriptor")
            .field("backend", &self.backend)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::local::LocalBackend;
    use crate::testutils;
    use tracing_test::traced_test;

    #[tokio::test]
    #[traced_test]
    async fn probes_are_cached_until_cleared() -> anyhow::Result<()> {
        let tmp_dir = testutils::create_temp_dir().await?;
        let path = tmp_dir.join("probe.txt");
        let descriptor = Descriptor::new(LocalBackend::new(&path));
        assert!(!descriptor.exists().await?);
        tokio::fs::write(&path, "probe").await?;
        // still served from the cache
        assert!(!descriptor.exists().await?);
        descriptor.clear_cache();
        assert!(descriptor.exists().await?);
        assert!(descriptor.is_file().await?);
        assert!(!descriptor.is_dir().await?);
        assert_eq!(descriptor.size().await?, Some(5));
        assert!(descriptor.mtime().await?.is_some());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn list_rejects_files_and_missing() -> anyhow::Result<()> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let file = Descriptor::new(LocalBackend::new(tmp_dir.join("foo").join("0.txt")));
        assert!(matches!(file.list().await, Err(Error::WrongType { .. })));
        let missing = Descriptor::new(LocalBackend::new(tmp_dir.join("missing")));
        assert!(matches!(missing.list().await, Err(Error::NotFound(_))));
        let dir = Descriptor::new(LocalBackend::new(tmp_dir.join("foo")));
        let mut names: Vec<String> = dir
            .list()
            .await?
            .map(|child| child.map(|c| c.basename().unwrap_or_default()))
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect::<Result<_>>()?;
        names.sort();
        assert_eq!(names, vec!["0.txt", "bar", "baz"]);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn remove_clears_the_cache() -> anyhow::Result<()> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let file = Descriptor::new(LocalBackend::new(tmp_dir.join("foo").join("0.txt")));
        assert!(file.exists().await?);
        file.remove().await?;
        assert!(!file.exists().await?);
        assert!(matches!(file.remove().await, Err(Error::NotFound(_))));
        Ok(())
    }
}
