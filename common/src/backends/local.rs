use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::descriptor::{Backend, ChunkReader, ChunkWriter, FastPath, Stat};
use crate::error::{Error, ResourceKind, Result};
use crate::location::Location;
use crate::resolver::BackendFactory;

/// Local filesystem backend.
#[derive(Debug)]
pub struct LocalBackend {
    path: std::path::PathBuf,
    location: Location,
}

impl LocalBackend {
    pub fn new(path: impl AsRef<std::path::Path>) -> Arc<Self> {
        let path = path.as_ref().to_path_buf();
        Arc::new(Self {
            location: Location::Path(path.clone()),
            path,
        })
    }

    fn path(&self) -> &std::path::Path {
        &self.path
    }
}

fn to_utc(time: std::io::Result<std::time::SystemTime>) -> Option<chrono::DateTime<chrono::Utc>> {
    time.ok().map(chrono::DateTime::<chrono::Utc>::from)
}

#[async_trait]
impl Backend for LocalBackend {
    fn location(&self) -> &Location {
        &self.location
    }

    fn domain(&self) -> String {
        "file://".to_string()
    }

    fn with_location(&self, location: Location) -> Arc<dyn Backend> {
        match location {
            Location::Path(path) => LocalBackend::new(path),
            Location::Uri(uri) => match uri.to_file_path() {
                Ok(path) => LocalBackend::new(path),
                Err(()) => LocalBackend::new(uri.path()),
            },
        }
    }

    async fn stat(&self) -> Result<Stat> {
        let metadata = match tokio::fs::metadata(self.path()).await {
            Ok(metadata) => metadata,
            Err(error)
                if matches!(
                    error.kind(),
                    std::io::ErrorKind::NotFound | std::io::ErrorKind::NotADirectory
                ) =>
            {
                return Ok(Stat::missing());
            }
            Err(error) => {
                return Err(anyhow::Error::new(error)
                    .context(format!("failed reading metadata from {:?}", self.path()))
                    .into());
            }
        };
        let kind = if metadata.is_dir() {
            ResourceKind::Directory
        } else {
            ResourceKind::File
        };
        Ok(Stat {
            kind: Some(kind),
            size: if metadata.is_file() {
                Some(metadata.len())
            } else {
                None
            },
            mtime: to_utc(metadata.modified()),
            atime: to_utc(metadata.accessed()),
            crtime: to_utc(metadata.created()),
        })
    }

    async fn list(&self) -> Result<BoxStream<'static, Result<Location>>> {
        let path = self.path().to_path_buf();
        let entries = tokio::fs::read_dir(&path)
            .await
            .with_context(|| format!("cannot open directory {path:?} for reading"))?;
        let stream = futures::stream::unfold(Some(entries), move |entries| {
            let path = path.clone();
            async move {
                let mut entries = entries?;
                match entries.next_entry().await {
                    Ok(Some(entry)) => Some((Ok(Location::Path(entry.path())), Some(entries))),
                    Ok(None) => None,
                    Err(error) => Some((
                        Err(anyhow::Error::new(error)
                            .context(format!("failed traversing directory {path:?}"))
                            .into()),
                        None,
                    )),
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn reader(&self) -> Result<Box<dyn ChunkReader>> {
        let file = tokio::fs::File::open(self.path())
            .await
            .with_context(|| format!("cannot open {:?} for reading", self.path()))?;
        Ok(Box::new(LocalReader {
            path: self.path().to_path_buf(),
            file,
        }))
    }

    async fn writer(&self) -> Result<Box<dyn ChunkWriter>> {
        let file = tokio::fs::File::create(self.path())
            .await
            .with_context(|| format!("cannot open {:?} for writing", self.path()))?;
        Ok(Box::new(LocalWriter {
            path: self.path().to_path_buf(),
            file,
        }))
    }

    async fn remove(&self) -> Result<()> {
        tokio::fs::remove_file(self.path())
            .await
            .with_context(|| format!("failed removing {:?}", self.path()))?;
        Ok(())
    }

    async fn create_dir(&self) -> Result<()> {
        tokio::fs::create_dir(self.path())
            .await
            .with_context(|| format!("cannot create directory {:?}", self.path()))?;
        Ok(())
    }

    async fn remove_dir(&self) -> Result<()> {
        tokio::fs::remove_dir(self.path())
            .await
            .with_context(|| format!("failed removing directory {:?}", self.path()))?;
        Ok(())
    }

    fn locality(&self, other: &dyn Backend) -> Option<FastPath> {
        if other.domain() == self.domain() && other.location().as_path().is_some() {
            Some(FastPath::NativeCopyAndRename)
        } else {
            None
        }
    }

    async fn native_copy(&self, target: &Location) -> Result<()> {
        let target = target
            .as_path()
            .ok_or_else(|| Error::unsupported(target, "native copy from a local file"))?;
        tokio::fs::copy(self.path(), target)
            .await
            .with_context(|| format!("failed copying {:?} to {:?}", self.path(), target))?;
        Ok(())
    }

    async fn native_rename(&self, target: &Location) -> Result<()> {
        let target = target
            .as_path()
            .ok_or_else(|| Error::unsupported(target, "native rename from a local file"))?;
        tokio::fs::rename(self.path(), target)
            .await
            .with_context(|| format!("failed renaming {:?} to {:?}", self.path(), target))?;
        Ok(())
    }

    fn supports_fast_rename(&self) -> bool {
        true
    }
}

struct LocalReader {
    path: std::path::PathBuf,
    file: tokio::fs::File,
}

#[async_trait]
impl ChunkReader for LocalReader {
    async fn read_chunk(&mut self, chunk_size: usize) -> Result<Option<Bytes>> {
        let mut buffer = vec![0u8; chunk_size];
        let mut filled = 0;
        while filled < chunk_size {
            let read = self
                .file
                .read(&mut buffer[filled..])
                .await
                .with_context(|| format!("failed reading from {:?}", &self.path))?;
            if read == 0 {
                break;
            }
            filled += read;
        }
        if filled == 0 {
            return Ok(None);
        }
        buffer.truncate(filled);
        Ok(Some(Bytes::from(buffer)))
    }
}

struct LocalWriter {
    path: std::path::PathBuf,
    file: tokio::fs::File,
}

#[async_trait]
impl ChunkWriter for LocalWriter {
    async fn write_chunk(&mut self, chunk: Bytes) -> Result<()> {
        self.file
            .write_all(&chunk)
            .await
            .with_context(|| format!("failed writing to {:?}", &self.path))?;
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> Result<()> {
        self.file
            .flush()
            .await
            .with_context(|| format!("failed flushing {:?}", &self.path))?;
        Ok(())
    }
}

/// Matches plain paths and `file://` URIs.
#[derive(Debug, Default)]
pub struct LocalFactory;

impl BackendFactory for LocalFactory {
    fn name(&self) -> &'static str {
        "local"
    }

    fn matches(&self, location: &str) -> bool {
        !location.contains("://") || location.to_lowercase().starts_with("file://")
    }

    fn create(&self, location: &str) -> Result<Arc<dyn Backend>> {
        let path = match Location::parse(location)? {
            Location::Path(path) => path,
            Location::Uri(uri) => uri
                .to_file_path()
                .map_err(|()| Error::UnsupportedLocation(location.to_string()))?,
        };
        let path = std::path::absolute(&path)
            .with_context(|| format!("failed resolving absolute path of {path:?}"))?;
        Ok(LocalBackend::new(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::Descriptor;
    use crate::testutils;
    use tracing_test::traced_test;

    #[tokio::test]
    #[traced_test]
    async fn stat_reports_type_and_size() -> anyhow::Result<()> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let dir = LocalBackend::new(tmp_dir.join("foo"));
        let stat = dir.stat().await?;
        assert!(stat.is_dir());
        assert_eq!(stat.size, None);
        let file = LocalBackend::new(tmp_dir.join("foo").join("0.txt"));
        let stat = file.stat().await?;
        assert!(stat.is_file());
        assert_eq!(stat.size, Some(1));
        assert!(stat.mtime.is_some());
        let missing = LocalBackend::new(tmp_dir.join("nope"));
        assert_eq!(missing.stat().await?, Stat::missing());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn reader_returns_chunks_of_requested_size() -> anyhow::Result<()> {
        let tmp_dir = testutils::create_temp_dir().await?;
        let path = tmp_dir.join("data.bin");
        tokio::fs::write(&path, vec![7u8; 10]).await?;
        let mut reader = LocalBackend::new(&path).reader().await?;
        let mut sizes = vec![];
        while let Some(chunk) = reader.read_chunk(4).await? {
            sizes.push(chunk.len());
        }
        assert_eq!(sizes, vec![4, 4, 2]);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn local_descriptors_are_local_to_each_other() -> anyhow::Result<()> {
        let a = Descriptor::new(LocalBackend::new("/tmp/a"));
        let b = Descriptor::new(LocalBackend::new("/tmp/b"));
        assert_eq!(a.locality(&b), Some(FastPath::NativeCopyAndRename));
        Ok(())
    }

    #[test]
    fn factory_matches_paths_and_file_uris() -> anyhow::Result<()> {
        let factory = LocalFactory;
        assert!(factory.matches("/tmp/foo"));
        assert!(factory.matches("relative/path"));
        assert!(factory.matches("file:///tmp/foo"));
        assert!(!factory.matches("memory://bucket/foo"));
        let backend = factory.create("file:///tmp/foo")?;
        assert_eq!(backend.location(), &Location::Path("/tmp/foo".into()));
        let backend = factory.create("relative")?;
        assert!(
            backend
                .location()
                .as_path()
                .is_some_and(|path| path.is_absolute())
        );
        Ok(())
    }
}
