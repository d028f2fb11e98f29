//! In-process object store addressed as `memory://<bucket>/<path>`.
//!
//! Every bucket is one shared [`MemoryStore`] obtained through the context's connection
//! registry, so two descriptors naming the same bucket see the same data. Stores can hide their
//! metadata (size and timestamps), which makes them behave like a backend without cheap `stat`
//! support.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use futures::stream::BoxStream;

use crate::descriptor::{Backend, ChunkReader, ChunkWriter, FastPath, Stat};
use crate::error::{Error, ResourceKind, Result};
use crate::location::Location;
use crate::registry::{ConnectionRegistry, Connector};
use crate::resolver::BackendFactory;

pub const SCHEME: &str = "memory";

#[derive(Debug, Clone)]
enum Entry {
    Directory {
        mtime: chrono::DateTime<chrono::Utc>,
    },
    File {
        data: Bytes,
        mtime: chrono::DateTime<chrono::Utc>,
    },
}

/// Contents of one bucket. Keys are `/`-joined paths relative to the bucket root, the root
/// itself is the empty key and always exists.
#[derive(Debug)]
pub struct MemoryStore {
    entries: std::sync::Mutex<BTreeMap<String, Entry>>,
    expose_metadata: AtomicBool,
}

fn parent_key(key: &str) -> Option<&str> {
    if key.is_empty() {
        return None;
    }
    Some(key.rsplit_once('/').map_or("", |(parent, _)| parent))
}

fn child_prefix(key: &str) -> String {
    if key.is_empty() {
        String::new()
    } else {
        format!("{key}/")
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entries: std::sync::Mutex::new(BTreeMap::new()),
            expose_metadata: AtomicBool::new(true),
        }
    }

    /// When disabled `stat` only reports existence and type.
    pub fn set_expose_metadata(&self, expose: bool) {
        self.expose_metadata.store(expose, Ordering::Release);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Entry>> {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn is_dir(entries: &BTreeMap<String, Entry>, key: &str) -> bool {
        key.is_empty() || matches!(entries.get(key), Some(Entry::Directory { .. }))
    }

    fn require_parent(entries: &BTreeMap<String, Entry>, key: &str) -> anyhow::Result<()> {
        match parent_key(key) {
            Some(parent) if Self::is_dir(entries, parent) => Ok(()),
            _ => Err(anyhow!("no parent directory for {key:?}")),
        }
    }

    fn stat(&self, key: &str) -> Stat {
        let entries = self.lock();
        let mut stat = if key.is_empty() {
            Stat::directory()
        } else {
            match entries.get(key) {
                None => return Stat::missing(),
                Some(Entry::Directory { mtime }) => Stat {
                    mtime: Some(*mtime),
                    ..Stat::directory()
                },
                Some(Entry::File { data, mtime }) => Stat {
                    mtime: Some(*mtime),
                    ..Stat::file(Some(data.len() as u64))
                },
            }
        };
        if !self.expose_metadata.load(Ordering::Acquire) {
            stat = Stat {
                kind: stat.kind,
                ..Default::default()
            };
        }
        stat
    }

    fn children(&self, key: &str) -> anyhow::Result<Vec<String>> {
        let entries = self.lock();
        if !Self::is_dir(&entries, key) {
            return Err(anyhow!("{key:?} is not a directory"));
        }
        let prefix = child_prefix(key);
        Ok(entries
            .range(prefix.clone()..)
            .take_while(|(name, _)| name.starts_with(&prefix))
            .filter(|(name, _)| !name.is_empty() && !name[prefix.len()..].contains('/'))
            .map(|(name, _)| name.clone())
            .collect())
    }

    fn read(&self, key: &str) -> anyhow::Result<Bytes> {
        match self.lock().get(key) {
            Some(Entry::File { data, .. }) => Ok(data.clone()),
            Some(Entry::Directory { .. }) => Err(anyhow!("{key:?} is a directory")),
            None => Err(anyhow!("{key:?} does not exist")),
        }
    }

    pub fn put(&self, key: &str, data: Bytes) -> anyhow::Result<()> {
        let mut entries = self.lock();
        Self::require_parent(&entries, key)?;
        if Self::is_dir(&entries, key) {
            return Err(anyhow!("{key:?} is a directory"));
        }
        entries.insert(
            key.to_string(),
            Entry::File {
                data,
                mtime: chrono::Utc::now(),
            },
        );
        Ok(())
    }

    fn remove(&self, key: &str) -> anyhow::Result<()> {
        let mut entries = self.lock();
        match entries.get(key) {
            Some(Entry::File { .. }) => {
                entries.remove(key);
                Ok(())
            }
            Some(Entry::Directory { .. }) => Err(anyhow!("{key:?} is a directory")),
            None => Err(anyhow!("{key:?} does not exist")),
        }
    }

    fn create_dir(&self, key: &str) -> anyhow::Result<()> {
        let mut entries = self.lock();
        if key.is_empty() || entries.contains_key(key) {
            return Err(anyhow!("{key:?} already exists"));
        }
        Self::require_parent(&entries, key)?;
        entries.insert(
            key.to_string(),
            Entry::Directory {
                mtime: chrono::Utc::now(),
            },
        );
        Ok(())
    }

    fn remove_dir(&self, key: &str) -> anyhow::Result<()> {
        let mut entries = self.lock();
        if !matches!(entries.get(key), Some(Entry::Directory { .. })) {
            return Err(anyhow!("{key:?} is not a directory"));
        }
        let prefix = child_prefix(key);
        if entries
            .range(prefix.clone()..)
            .next()
            .is_some_and(|(name, _)| name.starts_with(&prefix))
        {
            return Err(anyhow!("directory {key:?} is not empty"));
        }
        entries.remove(key);
        Ok(())
    }

    fn copy(&self, from: &str, to: &str) -> anyhow::Result<()> {
        let data = self.read(from)?;
        self.put(to, data)
    }

    fn rename(&self, from: &str, to: &str) -> anyhow::Result<()> {
        let mut entries = self.lock();
        Self::require_parent(&entries, to)?;
        let entry = entries
            .get(from)
            .cloned()
            .ok_or_else(|| anyhow!("{from:?} does not exist"))?;
        match entry {
            Entry::File { .. } => {
                if Self::is_dir(&entries, to) {
                    return Err(anyhow!("{to:?} is a directory"));
                }
                entries.remove(from);
                entries.insert(to.to_string(), entry);
            }
            Entry::Directory { .. } => {
                if entries.contains_key(to) {
                    return Err(anyhow!("{to:?} already exists"));
                }
                let prefix = child_prefix(from);
                let moved: Vec<String> = entries
                    .range(prefix.clone()..)
                    .take_while(|(name, _)| name.starts_with(&prefix))
                    .map(|(name, _)| name.clone())
                    .collect();
                for name in moved {
                    if let Some(child) = entries.remove(&name) {
                        entries.insert(format!("{to}/{}", &name[prefix.len()..]), child);
                    }
                }
                entries.remove(from);
                entries.insert(to.to_string(), entry);
            }
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Opens one [`MemoryStore`] per bucket.
#[derive(Debug, Default)]
pub struct MemoryConnector;

#[async_trait]
impl Connector for MemoryConnector {
    type Connection = MemoryStore;

    async fn connect(&self, _bucket: &str) -> anyhow::Result<MemoryStore> {
        Ok(MemoryStore::new())
    }

    fn close(&self, store: &MemoryStore) -> anyhow::Result<()> {
        store.lock().clear();
        Ok(())
    }
}

pub type MemoryRegistry = ConnectionRegistry<MemoryConnector>;

#[derive(Debug)]
pub struct MemoryBackend {
    location: Location,
    bucket: String,
    key: String,
    registry: Arc<MemoryRegistry>,
}

impl MemoryBackend {
    pub fn new(location: Location, registry: Arc<MemoryRegistry>) -> Result<Arc<Self>> {
        let bucket = match (location.scheme(), location.host()) {
            (SCHEME, Some(bucket)) => bucket.to_string(),
            _ => return Err(Error::UnsupportedLocation(location.to_string())),
        };
        let key = location.segments().join("/");
        Ok(Arc::new(Self {
            location,
            bucket,
            key,
            registry,
        }))
    }

    async fn store(&self) -> Result<Arc<MemoryStore>> {
        Ok(self.registry.connect(&self.bucket).await?)
    }

    fn target_key(&self, target: &Location) -> Result<String> {
        if target.scheme() != SCHEME || target.host() != Some(self.bucket.as_str()) {
            return Err(Error::unsupported(target, "native transfer across buckets"));
        }
        Ok(target.segments().join("/"))
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn location(&self) -> &Location {
        &self.location
    }

    fn domain(&self) -> String {
        format!("{SCHEME}://{}", self.bucket)
    }

    fn with_location(&self, location: Location) -> Arc<dyn Backend> {
        let key = location.segments().join("/");
        let bucket = location
            .host()
            .map(str::to_string)
            .unwrap_or_else(|| self.bucket.clone());
        Arc::new(Self {
            location,
            bucket,
            key,
            registry: self.registry.clone(),
        })
    }

    async fn stat(&self) -> Result<Stat> {
        Ok(self.store().await?.stat(&self.key))
    }

    async fn list(&self) -> Result<BoxStream<'static, Result<Location>>> {
        let children = self.store().await?.children(&self.key)?;
        let root = self.location.clone();
        let prefix_len = child_prefix(&self.key).len();
        Ok(futures::stream::iter(
            children
                .into_iter()
                .map(move |name| Ok(root.child(&name[prefix_len..]))),
        )
        .boxed())
    }

    async fn reader(&self) -> Result<Box<dyn ChunkReader>> {
        let data = self.store().await?.read(&self.key)?;
        Ok(Box::new(MemoryReader { data }))
    }

    async fn writer(&self) -> Result<Box<dyn ChunkWriter>> {
        let store = self.store().await?;
        {
            let entries = store.lock();
            MemoryStore::require_parent(&entries, &self.key)?;
        }
        Ok(Box::new(MemoryWriter {
            store,
            key: self.key.clone(),
            buffer: BytesMut::new(),
        }))
    }

    async fn remove(&self) -> Result<()> {
        Ok(self.store().await?.remove(&self.key)?)
    }

    async fn create_dir(&self) -> Result<()> {
        Ok(self.store().await?.create_dir(&self.key)?)
    }

    async fn remove_dir(&self) -> Result<()> {
        Ok(self.store().await?.remove_dir(&self.key)?)
    }

    fn locality(&self, other: &dyn Backend) -> Option<FastPath> {
        if other.domain() == self.domain() {
            Some(FastPath::NativeCopyAndRename)
        } else {
            None
        }
    }

    async fn native_copy(&self, target: &Location) -> Result<()> {
        let target = self.target_key(target)?;
        Ok(self.store().await?.copy(&self.key, &target)?)
    }

    async fn native_rename(&self, target: &Location) -> Result<()> {
        let target = self.target_key(target)?;
        Ok(self.store().await?.rename(&self.key, &target)?)
    }

    fn supports_fast_rename(&self) -> bool {
        true
    }
}

struct MemoryReader {
    data: Bytes,
}

#[async_trait]
impl ChunkReader for MemoryReader {
    async fn read_chunk(&mut self, chunk_size: usize) -> Result<Option<Bytes>> {
        if self.data.is_empty() {
            return Ok(None);
        }
        let len = std::cmp::min(chunk_size, self.data.len());
        Ok(Some(self.data.split_to(len)))
    }
}

/// Buffers everything and publishes the object on `finish`, an abandoned writer leaves no trace.
struct MemoryWriter {
    store: Arc<MemoryStore>,
    key: String,
    buffer: BytesMut,
}

#[async_trait]
impl ChunkWriter for MemoryWriter {
    async fn write_chunk(&mut self, chunk: Bytes) -> Result<()> {
        self.buffer.extend_from_slice(&chunk);
        Ok(())
    }

    async fn finish(self: Box<Self>) -> Result<()> {
        let MemoryWriter { store, key, buffer } = *self;
        Ok(store.put(&key, buffer.freeze())?)
    }
}

pub struct MemoryFactory {
    registry: Arc<MemoryRegistry>,
}

impl MemoryFactory {
    pub fn new(registry: Arc<MemoryRegistry>) -> Self {
        Self { registry }
    }
}

impl BackendFactory for MemoryFactory {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn matches(&self, location: &str) -> bool {
        location
            .to_lowercase()
            .starts_with(&format!("{SCHEME}://"))
    }

    fn create(&self, location: &str) -> Result<Arc<dyn Backend>> {
        Ok(MemoryBackend::new(
            Location::parse(location)?,
            self.registry.clone(),
        )?)
    }

    fn close(&self) {
        self.registry.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::Descriptor;
    use tracing_test::traced_test;

    fn descriptor(registry: &Arc<MemoryRegistry>, location: &str) -> anyhow::Result<Descriptor> {
        Ok(Descriptor::new(MemoryBackend::new(
            Location::parse(location)?,
            registry.clone(),
        )?))
    }

    #[tokio::test]
    #[traced_test]
    async fn buckets_are_shared_through_the_registry() -> anyhow::Result<()> {
        let registry = Arc::new(MemoryRegistry::new(MemoryConnector));
        let root = descriptor(&registry, "memory://bucket")?;
        assert!(root.is_dir().await?);
        let file = descriptor(&registry, "memory://bucket/a.txt")?;
        let mut writer = file.writer().await?;
        writer.write_chunk(Bytes::from_static(b"hello")).await?;
        writer.finish().await?;
        let again = descriptor(&registry, "memory://bucket/a.txt")?;
        assert!(again.is_file().await?);
        assert_eq!(again.size().await?, Some(5));
        let other = descriptor(&registry, "memory://other/a.txt")?;
        assert!(!other.exists().await?);
        assert_eq!(registry.len(), 2);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn abandoned_writer_publishes_nothing() -> anyhow::Result<()> {
        let registry = Arc::new(MemoryRegistry::new(MemoryConnector));
        let file = descriptor(&registry, "memory://bucket/a.txt")?;
        let mut writer = file.writer().await?;
        writer.write_chunk(Bytes::from_static(b"partial")).await?;
        drop(writer);
        assert!(!file.exists().await?);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn directory_listing_is_one_level() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        store.create_dir("a")?;
        store.create_dir("a/b")?;
        store.put("a/1.txt", Bytes::from_static(b"1"))?;
        store.put("a/b/2.txt", Bytes::from_static(b"2"))?;
        store.put("ab.txt", Bytes::from_static(b"x"))?;
        assert_eq!(store.children("a")?, vec!["a/1.txt", "a/b"]);
        assert_eq!(store.children("")?, vec!["a", "ab.txt"]);
        assert!(store.put("missing/1.txt", Bytes::new()).is_err());
        assert!(store.remove_dir("a").is_err());
        store.rename("a", "c")?;
        assert_eq!(store.children("c/b")?, vec!["c/b/2.txt"]);
        assert!(store.stat("a").kind.is_none());
        Ok(())
    }

    #[test]
    fn hidden_metadata_only_reports_type() {
        let store = MemoryStore::new();
        store
            .put("f.txt", Bytes::from_static(b"data"))
            .expect("root always exists");
        assert_eq!(store.stat("f.txt").size, Some(4));
        store.set_expose_metadata(false);
        let stat = store.stat("f.txt");
        assert!(stat.is_file());
        assert_eq!(stat.size, None);
        assert_eq!(stat.mtime, None);
    }
}
