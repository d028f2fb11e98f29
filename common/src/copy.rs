use futures::StreamExt;
use tracing::instrument;

use crate::crawl;
use crate::descriptor::Descriptor;
use crate::dirs;
use crate::error::{Error, ResourceKind, Result};

pub const DEFAULT_CHUNK_SIZE: usize = 5 * 1024 * 1024;
pub const PARTIAL_SUFFIX: &str = ".partial";

#[derive(Debug, Copy, Clone)]
pub struct Settings {
    pub allow_overwrite: bool,
    /// Stream into a `.partial` sibling and rename it into place once complete.
    pub use_partial_file: bool,
    pub chunk_size: usize,
    /// Maximum number of file copies running at once within one directory copy.
    pub max_width: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            allow_overwrite: false,
            use_partial_file: false,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_width: throttle::DEFAULT_MAX_TRANSFERS,
        }
    }
}

impl Settings {
    #[must_use]
    pub fn overwrite(self, allow_overwrite: bool) -> Self {
        Self {
            allow_overwrite,
            ..self
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Summary {
    pub bytes_copied: u64,
    pub files_copied: usize,
    pub directories_created: usize,
    pub directories_unchanged: usize,
    pub native_copies: usize,
}

impl std::ops::Add for Summary {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self {
            bytes_copied: self.bytes_copied + other.bytes_copied,
            files_copied: self.files_copied + other.files_copied,
            directories_created: self.directories_created + other.directories_created,
            directories_unchanged: self.directories_unchanged + other.directories_unchanged,
            native_copies: self.native_copies + other.native_copies,
        }
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "bytes copied: {}\n\
            files copied: {}\n\
            directories created: {}\n\
            directories unchanged: {}\n\
            native copies: {}",
            bytesize::ByteSize(self.bytes_copied),
            self.files_copied,
            self.directories_created,
            self.directories_unchanged,
            self.native_copies,
        )
    }
}

async fn stream_file(src: &Descriptor, dst: &Descriptor, chunk_size: usize) -> Result<u64> {
    let mut reader = src.reader().await?;
    let mut writer = dst.writer().await?;
    let mut bytes = 0;
    while let Some(chunk) = reader.read_chunk(chunk_size).await? {
        src.iops().get_chunk_token().await;
        bytes += chunk.len() as u64;
        writer.write_chunk(chunk).await?;
    }
    writer.finish().await?;
    Ok(bytes)
}

async fn stream_via_partial(src: &Descriptor, dst: &Descriptor, chunk_size: usize) -> Result<u64> {
    let partial = dst.with_suffix(PARTIAL_SUFFIX);
    tracing::debug!("streaming into {}", &partial);
    let streamed = match stream_file(src, &partial, chunk_size).await {
        Ok(bytes) => bytes,
        Err(error) => {
            partial.clear_cache();
            if partial.exists().await.unwrap_or(false) {
                if let Err(rm_error) = partial.remove().await {
                    tracing::warn!("failed cleaning up {}: {:#}", &partial, &rm_error);
                }
            }
            return Err(error);
        }
    };
    partial
        .backend()
        .native_rename(dst.location())
        .await?;
    Ok(streamed)
}

/// Copies a single file, the caller has already established that `src` is a file.
#[instrument(skip(settings))]
pub async fn copy_file(src: &Descriptor, dst: &Descriptor, settings: &Settings) -> Result<Summary> {
    let dst_stat = dst.stat().await?;
    if dst_stat.is_dir() {
        return Err(Error::wrong_type(dst, ResourceKind::File));
    }
    if dst_stat.exists() && !settings.allow_overwrite {
        return Err(Error::AlreadyExists(dst.identity()));
    }
    let mut summary = Summary {
        files_copied: 1,
        ..Default::default()
    };
    if src.locality(dst).is_some() {
        tracing::debug!("using native copy");
        let size = src.size().await?.unwrap_or_default();
        src.iops()
            .get_file_iops_tokens(settings.chunk_size as u64, size)
            .await;
        src.backend().native_copy(dst.location()).await?;
        summary.bytes_copied = size;
        summary.native_copies = 1;
    } else if settings.use_partial_file && dst.supports_fast_rename() {
        summary.bytes_copied = stream_via_partial(src, dst, settings.chunk_size).await?;
    } else {
        summary.bytes_copied = stream_file(src, dst, settings.chunk_size).await?;
    }
    dst.clear_cache();
    Ok(summary)
}

async fn copy_dir(src: &Descriptor, dst: &Descriptor, settings: &Settings) -> Result<Summary> {
    let dst_stat = dst.stat().await?;
    let mut summary = Summary::default();
    if dst_stat.exists() {
        if !dst_stat.is_dir() {
            return Err(Error::wrong_type(dst, ResourceKind::Directory));
        }
        if !settings.allow_overwrite {
            return Err(Error::AlreadyExists(dst.identity()));
        }
        summary.directories_unchanged += 1;
    } else {
        dirs::mkdir(dst, false).await?;
        summary.directories_created += 1;
    }
    // directories are created serially, in crawl order a parent always precedes its children
    let mut files = vec![];
    let mut pairs = crawl::crawl(src, dst, true, true);
    while let Some(pair) = pairs.next().await {
        let (src_entry, dst_entry) = pair?;
        if src_entry.is_dir().await? {
            let dst_entry_stat = dst_entry.stat().await?;
            if dst_entry_stat.is_dir() {
                summary.directories_unchanged += 1;
                continue;
            }
            if dst_entry_stat.exists() {
                return Err(Error::wrong_type(&dst_entry, ResourceKind::Directory));
            }
            dirs::mkdir(&dst_entry, false).await?;
            summary.directories_created += 1;
        } else {
            files.push((src_entry, dst_entry));
        }
    }
    tracing::debug!("copying {} files", files.len());
    let mut join_set = tokio::task::JoinSet::new();
    let mut first_error = None;
    let max_width = std::cmp::max(1, settings.max_width);
    for (src_file, dst_file) in files {
        if join_set.len() >= max_width {
            if let Some(res) = join_set.join_next().await {
                collect(res, &mut summary, &mut first_error);
            }
        }
        let settings = *settings;
        join_set.spawn(async move { copy_file(&src_file, &dst_file, &settings).await });
    }
    // never abandon in-flight siblings, surface the failure once all of them are done
    while let Some(res) = join_set.join_next().await {
        collect(res, &mut summary, &mut first_error);
    }
    match first_error {
        Some(error) => Err(error),
        None => Ok(summary),
    }
}

fn collect(
    res: std::result::Result<Result<Summary>, tokio::task::JoinError>,
    summary: &mut Summary,
    first_error: &mut Option<Error>,
) {
    let error = match res {
        Ok(Ok(file_summary)) => {
            *summary = *summary + file_summary;
            return;
        }
        Ok(Err(error)) => error,
        Err(join_error) => Error::Backend(join_error.into()),
    };
    tracing::error!("{:#}", &error);
    if first_error.is_none() {
        *first_error = Some(error);
    }
}

/// Fails when `dst` is `src` or lies below it.
fn check_overlap(src: &Descriptor, dst: &Descriptor) -> Result<()> {
    let (resource, target) = (src.identity(), dst.identity());
    let prefix = if resource.ends_with('/') {
        resource.clone()
    } else {
        format!("{resource}/")
    };
    if target == resource || target.starts_with(&prefix) {
        return Err(Error::Overlapping { resource, target });
    }
    Ok(())
}

/// Copies a file or a whole directory tree onto `dst`.
#[instrument(skip(settings))]
pub async fn copy(src: &Descriptor, dst: &Descriptor, settings: &Settings) -> Result<Summary> {
    check_overlap(src, dst)?;
    let src_stat = src.stat().await?;
    if !src_stat.exists() {
        return Err(Error::NotFound(src.identity()));
    }
    let summary = if src_stat.is_file() {
        copy_file(src, dst, settings).await?
    } else {
        copy_dir(src, dst, settings).await?
    };
    tracing::debug!("copy: {} -> {} succeeded!", src, dst);
    Ok(summary)
}

/// Moves `src` onto `dst`: a native rename when the backend offers one, copy and delete
/// otherwise.
#[instrument(skip(settings))]
pub async fn move_to(src: &Descriptor, dst: &Descriptor, settings: &Settings) -> Result<Summary> {
    check_overlap(src, dst)?;
    let src_stat = src.stat().await?;
    if !src_stat.exists() {
        return Err(Error::NotFound(src.identity()));
    }
    let dst_stat = dst.stat().await?;
    if dst_stat.exists() && !settings.allow_overwrite {
        return Err(Error::AlreadyExists(dst.identity()));
    }
    let can_rename = src
        .locality(dst)
        .is_some_and(|fast_path| fast_path.can_rename())
        && src.supports_fast_rename()
        && (!dst_stat.exists() || (src_stat.is_file() && dst_stat.is_file()));
    if can_rename {
        match src.backend().native_rename(dst.location()).await {
            Ok(()) => {
                src.clear_cache();
                dst.clear_cache();
                return Ok(Summary {
                    bytes_copied: src_stat.size.unwrap_or_default(),
                    files_copied: usize::from(src_stat.is_file()),
                    native_copies: 1,
                    ..Default::default()
                });
            }
            // e.g. a rename across filesystems, the generic path still works
            Err(error) => tracing::debug!("native rename failed, falling back to copy: {:#}", &error),
        }
    }
    let summary = copy(src, dst, settings).await?;
    if src_stat.is_dir() {
        dirs::rmdir(src, true).await?;
    } else {
        src.remove().await?;
    }
    Ok(summary)
}
