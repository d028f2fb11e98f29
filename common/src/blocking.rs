//! Blocking forms of the descriptor operations.
//!
//! Each call runs the async operation to completion on the context's scheduler, so these must
//! only be used from plain threads, never from within an async context.

use futures::TryStreamExt;

use crate::context::Context;
use crate::descriptor::Descriptor;
use crate::error::Result;

pub struct BlockingDescriptor<'a> {
    descriptor: &'a Descriptor,
    ctx: &'a Context,
}

impl<'a> BlockingDescriptor<'a> {
    pub fn new(descriptor: &'a Descriptor, ctx: &'a Context) -> Self {
        Self { descriptor, ctx }
    }

    fn run<T>(&self, future: impl std::future::Future<Output = Result<T>>) -> Result<T> {
        self.ctx.block_on(future)?
    }

    pub fn exists(&self) -> Result<bool> {
        self.run(self.descriptor.exists())
    }

    pub fn is_file(&self) -> Result<bool> {
        self.run(self.descriptor.is_file())
    }

    pub fn is_dir(&self) -> Result<bool> {
        self.run(self.descriptor.is_dir())
    }

    pub fn size(&self) -> Result<Option<u64>> {
        self.run(self.descriptor.size())
    }

    pub fn mtime(&self) -> Result<Option<chrono::DateTime<chrono::Utc>>> {
        self.run(self.descriptor.mtime())
    }

    pub fn atime(&self) -> Result<Option<chrono::DateTime<chrono::Utc>>> {
        self.run(self.descriptor.atime())
    }

    pub fn crtime(&self) -> Result<Option<chrono::DateTime<chrono::Utc>>> {
        self.run(self.descriptor.crtime())
    }

    /// Children of a directory, collected eagerly.
    pub fn list(&self) -> Result<Vec<Descriptor>> {
        self.run(async {
            let children: Vec<Descriptor> = self.descriptor.list().await?.try_collect().await?;
            Ok::<_, crate::error::Error>(children)
        })
    }

    pub fn mkdir(&self, recursive: bool) -> Result<()> {
        self.run(crate::dirs::mkdir(self.descriptor, recursive))
    }

    pub fn rmdir(&self, recursive: bool) -> Result<()> {
        self.run(crate::dirs::rmdir(self.descriptor, recursive))
    }

    pub fn remove(&self) -> Result<()> {
        self.run(self.descriptor.remove())
    }

    pub fn copy(&self, target: &Descriptor, allow_overwrite: bool) -> Result<crate::copy::Summary> {
        let settings = self.ctx.copy_settings().overwrite(allow_overwrite);
        self.run(crate::copy::copy(self.descriptor, target, &settings))
    }

    pub fn move_to(&self, target: &Descriptor, allow_overwrite: bool) -> Result<crate::copy::Summary> {
        let settings = self.ctx.copy_settings().overwrite(allow_overwrite);
        self.run(crate::copy::move_to(self.descriptor, target, &settings))
    }

    pub fn fingerprint(&self) -> Result<Option<String>> {
        let chunk_size = self.ctx.copy_settings().chunk_size;
        let algorithm = self.ctx.transfer_config().hash_algorithm;
        self.run(crate::fingerprint::fingerprint_with(
            self.descriptor,
            algorithm,
            chunk_size,
        ))
    }
}
