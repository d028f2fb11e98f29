//! Cheap change detection for files.
//!
//! A fingerprint is `YYYYMMDDHHMMSS_<size>` (UTC modification time and size) whenever the
//! backend reports both. Otherwise the file content is hashed; the hash is cached on the
//! descriptor so repeated calls on the same instance read the content only once.

use sha2::Digest;
use tracing::instrument;

use crate::descriptor::Descriptor;
use crate::error::{Error, Result};

pub const TIME_FORMAT: &str = "%Y%m%d%H%M%S";

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum HashAlgorithm {
    #[default]
    Sha256,
    Blake2b512,
}

impl std::fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            HashAlgorithm::Sha256 => write!(f, "sha256"),
            HashAlgorithm::Blake2b512 => write!(f, "blake2b512"),
        }
    }
}

pub fn metadata_fingerprint(mtime: chrono::DateTime<chrono::Utc>, size: u64) -> String {
    format!("{}_{}", mtime.format(TIME_FORMAT), size)
}

async fn hash_with<D: Digest + Send>(file: &Descriptor, chunk_size: usize) -> Result<String> {
    let mut hasher = D::new();
    let mut reader = file.reader().await?;
    while let Some(chunk) = reader.read_chunk(chunk_size).await? {
        file.iops().get_chunk_token().await;
        hasher.update(&chunk);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Hashes the full content of `file`, bypassing the descriptor's cache.
pub async fn content_hash(
    file: &Descriptor,
    algorithm: HashAlgorithm,
    chunk_size: usize,
) -> Result<String> {
    match algorithm {
        HashAlgorithm::Sha256 => hash_with::<sha2::Sha256>(file, chunk_size).await,
        HashAlgorithm::Blake2b512 => hash_with::<blake2::Blake2b512>(file, chunk_size).await,
    }
}

/// Fingerprint using the default hash algorithm and chunk size.
pub async fn fingerprint(file: &Descriptor) -> Result<Option<String>> {
    fingerprint_with(file, HashAlgorithm::default(), crate::copy::DEFAULT_CHUNK_SIZE).await
}

/// `None` when no fingerprint can be produced (not a file, or the backend can't provide the
/// data), callers must then assume the file changed.
#[instrument(skip(chunk_size))]
pub async fn fingerprint_with(
    file: &Descriptor,
    algorithm: HashAlgorithm,
    chunk_size: usize,
) -> Result<Option<String>> {
    let stat = match file.stat().await {
        Ok(stat) => stat,
        Err(Error::UnsupportedOperation { .. }) => return Ok(None),
        Err(error) => return Err(error),
    };
    if !stat.is_file() {
        return Ok(None);
    }
    if let (Some(mtime), Some(size)) = (stat.mtime, stat.size) {
        return Ok(Some(metadata_fingerprint(mtime, size)));
    }
    if let Some(hash) = file.cached_hash(algorithm) {
        return Ok(Some(hash));
    }
    tracing::debug!("no metadata for {}, hashing content with {}", file, algorithm);
    let hash = match content_hash(file, algorithm, chunk_size).await {
        Ok(hash) => hash,
        Err(Error::UnsupportedOperation { .. }) => return Ok(None),
        Err(error) => return Err(error),
    };
    file.cache_hash(algorithm, hash.clone());
    Ok(Some(hash))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::local::LocalBackend;
    use crate::context::Context;
    use crate::testutils;
    use bytes::Bytes;
    use tracing_test::traced_test;

    #[tokio::test]
    #[traced_test]
    async fn metadata_fingerprint_uses_utc_mtime_and_size() -> anyhow::Result<()> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let path = tmp_dir.join("foo").join("0.txt");
        // 2024-01-02 03:04:05 UTC
        filetime::set_file_mtime(&path, filetime::FileTime::from_unix_time(1_704_164_645, 0))?;
        let file = Descriptor::new(LocalBackend::new(&path));
        assert_eq!(
            fingerprint(&file).await?.as_deref(),
            Some("20240102030405_1")
        );
        let dir = Descriptor::new(LocalBackend::new(tmp_dir.join("foo")));
        assert_eq!(fingerprint(&dir).await?, None);
        let missing = Descriptor::new(LocalBackend::new(tmp_dir.join("nope")));
        assert_eq!(fingerprint(&missing).await?, None);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn hidden_metadata_falls_back_to_cached_content_hash() -> anyhow::Result<()> {
        let ctx = Context::with_defaults()?;
        let store = ctx.memory_store("hashes").await?;
        store.set_expose_metadata(false);
        store.put("f.bin", Bytes::from_static(b"data"))?;
        let file = ctx.resolve("memory://hashes/f.bin")?;
        let expected = hex::encode(sha2::Sha256::digest(b"data"));
        assert_eq!(fingerprint(&file).await?, Some(expected.clone()));
        // the content changes behind the descriptor's back, the cached hash is still served
        store.put("f.bin", Bytes::from_static(b"other"))?;
        assert_eq!(fingerprint(&file).await?, Some(expected));
        let fresh = ctx.resolve("memory://hashes/f.bin")?;
        assert_eq!(
            fingerprint(&fresh).await?,
            Some(hex::encode(sha2::Sha256::digest(b"other")))
        );
        assert_eq!(
            fingerprint_with(&fresh, HashAlgorithm::Blake2b512, 2).await?,
            Some(hex::encode(blake2::Blake2b512::digest(b"other")))
        );
        Ok(())
    }
}
