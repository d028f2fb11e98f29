//! Fire-and-forget copies executed by a background engine.

use std::sync::Arc;

use crate::context::Context;
use crate::copy;
use crate::engine::{Engine, EngineError, JobStatus};

pub struct BatchCopy {
    ctx: Arc<Context>,
    engine: Engine<copy::Summary>,
}

impl BatchCopy {
    pub fn new(ctx: Arc<Context>) -> Result<Self, EngineError> {
        Ok(Self {
            ctx,
            engine: Engine::start("uio-batch-copy", None)?,
        })
    }

    /// Queues a copy of `src` onto `dst` and returns the job name, `copy_<src>_to_<dst>` unless
    /// one is given. Both locations are resolved when the job runs.
    pub fn queue_copy(
        &self,
        src: &str,
        dst: &str,
        name: Option<&str>,
        allow_overwrite: bool,
    ) -> Result<String, EngineError> {
        let name = name
            .map(str::to_string)
            .unwrap_or_else(|| format!("copy_{src}_to_{dst}"));
        let ctx = self.ctx.clone();
        let (src, dst) = (src.to_string(), dst.to_string());
        self.engine.submit(&name, async move {
            let src = ctx.resolve(&src)?;
            let dst = ctx.resolve(&dst)?;
            let _permit = ctx.transfer_limit().permit().await;
            let settings = ctx.copy_settings().overwrite(allow_overwrite);
            anyhow::Ok(copy::copy(&src, &dst, &settings).await?)
        })?;
        Ok(name)
    }

    pub fn is_complete(&self, name: &str) -> bool {
        self.engine.is_complete(name)
    }

    pub fn result(&self, name: &str) -> JobStatus<copy::Summary> {
        self.engine.result(name)
    }

    pub fn wait_for_job(&self, name: &str) -> JobStatus<copy::Summary> {
        self.engine.wait_for(name)
    }

    /// Waits for every queued copy, after which no more copies are accepted.
    pub fn wait_for_all(&self) {
        self.engine.drain();
    }
}
