use async_recursion::async_recursion;
use futures::TryStreamExt;
use tracing::instrument;

use crate::descriptor::Descriptor;
use crate::error::{Error, ResourceKind, Result};

/// Creates `dir`. Existing directories are left alone; with `recursive` missing parents are
/// created first.
#[async_recursion]
#[instrument]
pub async fn mkdir(dir: &Descriptor, recursive: bool) -> Result<()> {
    let stat = dir.stat().await?;
    if stat.is_dir() {
        tracing::debug!("'{}' already exists", dir);
        return Ok(());
    }
    if stat.exists() {
        return Err(Error::wrong_type(dir, ResourceKind::Directory));
    }
    if let Some(parent) = dir.parent() {
        let parent_stat = parent.stat().await?;
        if !parent_stat.exists() {
            if !recursive {
                return Err(Error::MissingParent(dir.identity()));
            }
            mkdir(&parent, true).await?;
        } else if !parent_stat.is_dir() {
            return Err(Error::wrong_type(&parent, ResourceKind::Directory));
        }
    }
    let result = dir.backend().create_dir().await;
    dir.clear_cache();
    if let Err(error) = result {
        // lost a race against a concurrent mkdir of the same directory
        if dir.is_dir().await.unwrap_or(false) {
            return Ok(());
        }
        return Err(error);
    }
    Ok(())
}

/// Removes `dir`. Missing directories are a no-op; with `recursive` all children are removed
/// concurrently first and the first failure is surfaced once every child has been handled.
#[async_recursion]
#[instrument]
pub async fn rmdir(dir: &Descriptor, recursive: bool) -> Result<()> {
    let stat = dir.stat().await?;
    if !stat.exists() {
        tracing::debug!("'{}' does not exist", dir);
        return Ok(());
    }
    if !stat.is_dir() {
        return Err(Error::wrong_type(dir, ResourceKind::Directory));
    }
    let children: Vec<Descriptor> = dir.list().await?.try_collect().await?;
    if !children.is_empty() {
        if !recursive {
            return Err(Error::DirectoryNotEmpty(dir.identity()));
        }
        let mut join_set = tokio::task::JoinSet::new();
        for child in children {
            join_set.spawn(async move {
                if child.is_dir().await? {
                    rmdir(&child, true).await
                } else {
                    child.remove().await
                }
            });
        }
        let mut first_error = None;
        while let Some(res) = join_set.join_next().await {
            let error = match res {
                Ok(Ok(())) => continue,
                Ok(Err(error)) => error,
                Err(join_error) => Error::Backend(join_error.into()),
            };
            tracing::error!("{:#}", &error);
            if first_error.is_none() {
                first_error = Some(error);
            }
        }
        if let Some(error) = first_error {
            return Err(error);
        }
    }
    let result = dir.backend().remove_dir().await;
    dir.clear_cache();
    result
}
