//! Background execution engine.
//!
//! An [`Engine`] owns one dedicated worker thread running a single-threaded tokio runtime with a
//! `LocalSet`. Any thread can submit named jobs; they run as cooperatively scheduled tasks on the
//! worker and their outcome is recorded by name. Submission order is FIFO, completion order is
//! not.
//!
//! Lifecycle: `Idle` until the worker is up, `Running` while accepting jobs, `Draining` once
//! halted (in-flight and already queued jobs still finish), `Stopped` after the worker exited and
//! the completion callback fired.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::mpsc;

/// Bounded wait while jobs are in flight, used to report progress.
pub const REAP_INTERVAL: std::time::Duration = std::time::Duration::from_millis(100);
/// Bounded wait for new submissions while there is no work.
pub const IDLE_WAIT: std::time::Duration = std::time::Duration::from_secs(1);
/// Polling interval of [`Engine::wait_for`].
pub const POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(50);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Running,
    Draining,
    Stopped,
}

impl EngineState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => EngineState::Idle,
            1 => EngineState::Running,
            2 => EngineState::Draining,
            _ => EngineState::Stopped,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("engine {0:?} no longer accepts jobs")]
    Halted(String),
    #[error("failed spawning engine worker thread")]
    Spawn(#[from] std::io::Error),
}

/// Outcome of a job as seen from outside the engine.
#[derive(Debug, Clone)]
pub enum JobStatus<T> {
    /// Never submitted, or still running.
    Unknown,
    Succeeded(T),
    Failed(Arc<anyhow::Error>),
}

impl<T> JobStatus<T> {
    pub fn is_complete(&self) -> bool {
        !matches!(self, JobStatus::Unknown)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, JobStatus::Succeeded(_))
    }
}

type Job<T> = BoxFuture<'static, anyhow::Result<T>>;
type Completions<T> = Arc<std::sync::Mutex<HashMap<String, JobStatus<T>>>>;
pub type OnComplete = Box<dyn FnOnce() + Send + 'static>;

pub struct Engine<T: Clone + Send + 'static> {
    name: String,
    // dropping the sender is the halt signal, queued jobs are still delivered
    sender: std::sync::Mutex<Option<mpsc::UnboundedSender<(String, Job<T>)>>>,
    state: Arc<AtomicU8>,
    completions: Completions<T>,
    worker: std::sync::Mutex<Option<std::thread::JoinHandle<()>>>,
}

fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl<T: Clone + Send + 'static> Engine<T> {
    /// Spawns the worker thread. `on_complete` runs on the worker, exactly once, after the last
    /// job finished.
    pub fn start(name: &str, on_complete: Option<OnComplete>) -> Result<Self, EngineError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let state = Arc::new(AtomicU8::new(EngineState::Idle as u8));
        let completions: Completions<T> = Default::default();
        let worker = {
            let state = state.clone();
            let completions = completions.clone();
            let name = name.to_string();
            std::thread::Builder::new()
                .name(name.clone())
                .spawn(move || run_worker(&name, receiver, state, completions, on_complete))?
        };
        tracing::debug!("engine {:?} started", name);
        Ok(Self {
            name: name.to_string(),
            sender: std::sync::Mutex::new(Some(sender)),
            state,
            completions,
            worker: std::sync::Mutex::new(Some(worker)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> EngineState {
        EngineState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Queues `job` under `name`, a job submitted under a name already in use replaces the
    /// recorded outcome of the previous one.
    pub fn submit<F>(&self, name: &str, job: F) -> Result<(), EngineError>
    where
        F: std::future::Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let sender = lock(&self.sender);
        let Some(sender) = sender.as_ref() else {
            return Err(EngineError::Halted(self.name.clone()));
        };
        lock(&self.completions).remove(name);
        tracing::debug!("engine {:?}: queueing {:?}", &self.name, name);
        sender
            .send((name.to_string(), job.boxed()))
            .map_err(|_| EngineError::Halted(self.name.clone()))
    }

    pub fn is_complete(&self, name: &str) -> bool {
        self.result(name).is_complete()
    }

    pub fn result(&self, name: &str) -> JobStatus<T> {
        lock(&self.completions)
            .get(name)
            .cloned()
            .unwrap_or(JobStatus::Unknown)
    }

    /// Blocks until the job completes. Returns `Unknown` if the engine stopped without ever
    /// running a job under that name.
    pub fn wait_for(&self, name: &str) -> JobStatus<T> {
        loop {
            let status = self.result(name);
            if status.is_complete() {
                return status;
            }
            if self.state() == EngineState::Stopped {
                return self.result(name);
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Stops accepting jobs and blocks until every submitted job finished and the worker exited.
    pub fn drain(&self) {
        if lock(&self.sender).take().is_some() {
            tracing::debug!("engine {:?}: draining", &self.name);
            // the worker may already be stopped (e.g. its runtime failed to build)
            let _ = self
                .state
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
                    (state < EngineState::Draining as u8).then_some(EngineState::Draining as u8)
                });
        }
        let Some(worker) = lock(&self.worker).take() else {
            return;
        };
        if worker.thread().id() == std::thread::current().id() {
            // drained from one of our own jobs, the worker exits on its own
            return;
        }
        if worker.join().is_err() {
            tracing::error!("engine {:?}: worker thread panicked", &self.name);
            self.state.store(EngineState::Stopped as u8, Ordering::Release);
        }
    }
}

impl<T: Clone + Send + 'static> Drop for Engine<T> {
    fn drop(&mut self) {
        self.drain();
    }
}

impl<T: Clone + Send + 'static> std::fmt::Debug for Engine<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

fn run_worker<T: Clone + Send + 'static>(
    name: &str,
    receiver: mpsc::UnboundedReceiver<(String, Job<T>)>,
    state: Arc<AtomicU8>,
    completions: Completions<T>,
    on_complete: Option<OnComplete>,
) {
    match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => {
            let local = tokio::task::LocalSet::new();
            local.block_on(
                &runtime,
                process_queue(name, receiver, state.clone(), completions),
            );
        }
        Err(error) => {
            tracing::error!("engine {:?}: failed building runtime: {:#}", name, &error);
        }
    }
    state.store(EngineState::Stopped as u8, Ordering::Release);
    tracing::debug!("engine {:?} stopped", name);
    if let Some(on_complete) = on_complete {
        on_complete();
    }
}

async fn process_queue<T: Clone + Send + 'static>(
    name: &str,
    mut receiver: mpsc::UnboundedReceiver<(String, Job<T>)>,
    state: Arc<AtomicU8>,
    completions: Completions<T>,
) {
    let _ = state.compare_exchange(
        EngineState::Idle as u8,
        EngineState::Running as u8,
        Ordering::AcqRel,
        Ordering::Acquire,
    );
    let mut tasks = tokio::task::JoinSet::new();
    let mut names = HashMap::<tokio::task::Id, String>::new();
    let mut halted = false;
    loop {
        if halted && tasks.is_empty() {
            break;
        }
        tokio::select! {
            biased;
            submission = receiver.recv(), if !halted => match submission {
                Some((job_name, job)) => {
                    tracing::debug!("engine {:?}: starting {:?}", name, &job_name);
                    let handle = tasks.spawn_local(job);
                    names.insert(handle.id(), job_name);
                }
                None => {
                    tracing::debug!("engine {:?}: halted with {} jobs in flight", name, tasks.len());
                    halted = true;
                }
            },
            Some(joined) = tasks.join_next_with_id(), if !tasks.is_empty() => {
                record(name, joined, &mut names, &completions);
            }
            _ = tokio::time::sleep(REAP_INTERVAL), if !tasks.is_empty() => {
                tracing::trace!("engine {:?}: {} jobs in flight", name, tasks.len());
            }
            _ = tokio::time::sleep(IDLE_WAIT), if tasks.is_empty() && !halted => {
                tracing::trace!("engine {:?}: idle", name);
            }
        }
    }
}

fn record<T>(
    name: &str,
    joined: Result<(tokio::task::Id, anyhow::Result<T>), tokio::task::JoinError>,
    names: &mut HashMap<tokio::task::Id, String>,
    completions: &Completions<T>,
) {
    let (id, status) = match joined {
        Ok((id, Ok(value))) => (id, JobStatus::Succeeded(value)),
        Ok((id, Err(error))) => (id, JobStatus::Failed(Arc::new(error))),
        Err(join_error) => {
            let error = if join_error.is_panic() {
                anyhow::anyhow!("job panicked")
            } else {
                anyhow::anyhow!("job was cancelled")
            };
            (join_error.id(), JobStatus::Failed(Arc::new(error)))
        }
    };
    let job_name = names.remove(&id).unwrap_or_else(|| id.to_string());
    match &status {
        JobStatus::Failed(error) => {
            tracing::error!("engine {:?}: {:?} failed: {:#}", name, &job_name, error);
        }
        _ => tracing::debug!("engine {:?}: {:?} succeeded", name, &job_name),
    }
    lock(completions).insert(job_name, status);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use tracing_test::traced_test;

    fn explode() -> anyhow::Result<u32> {
        panic!("job went wrong")
    }

    #[test]
    #[traced_test]
    fn outcomes_are_recorded_by_name() -> anyhow::Result<()> {
        let completed = Arc::new(AtomicUsize::new(0));
        let engine = {
            let completed = completed.clone();
            Engine::<u32>::start(
                "outcomes",
                Some(Box::new(move || {
                    completed.fetch_add(1, Ordering::SeqCst);
                })),
            )?
        };
        engine.submit("ok", async { anyhow::Ok(1) })?;
        engine.submit("fails", async { Err::<u32, _>(anyhow::anyhow!("boom")) })?;
        engine.submit("panics", async { explode() })?;
        engine.drain();
        assert_eq!(engine.state(), EngineState::Stopped);
        assert!(matches!(engine.result("ok"), JobStatus::Succeeded(1)));
        match engine.result("fails") {
            JobStatus::Failed(error) => assert_eq!(error.to_string(), "boom"),
            other => panic!("unexpected status {other:?}"),
        }
        assert!(matches!(engine.result("panics"), JobStatus::Failed(_)));
        assert!(matches!(engine.result("never"), JobStatus::Unknown));
        assert_eq!(completed.load(Ordering::SeqCst), 1);
        engine.drain();
        drop(engine);
        assert_eq!(completed.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    #[traced_test]
    fn submissions_after_drain_are_rejected() -> anyhow::Result<()> {
        let engine = Engine::<()>::start("halted", None)?;
        engine.drain();
        assert!(matches!(
            engine.submit("late", async { anyhow::Ok(()) }),
            Err(EngineError::Halted(_))
        ));
        assert!(!engine.is_complete("late"));
        assert!(matches!(engine.wait_for("late"), JobStatus::Unknown));
        Ok(())
    }

    #[test]
    #[traced_test]
    fn jobs_are_scheduled_cooperatively() -> anyhow::Result<()> {
        let engine = Engine::<()>::start("cooperative", None)?;
        // both jobs only finish if they run interleaved on the single worker thread
        let barrier = Arc::new(tokio::sync::Barrier::new(2));
        for name in ["left", "right"] {
            let barrier = barrier.clone();
            engine.submit(name, async move {
                barrier.wait().await;
                anyhow::Ok(())
            })?;
        }
        assert!(engine.wait_for("left").is_success());
        assert!(engine.wait_for("right").is_success());
        assert_eq!(engine.state(), EngineState::Running);
        Ok(())
    }

    #[test]
    #[traced_test]
    fn wait_for_blocks_until_complete() -> anyhow::Result<()> {
        let engine = Engine::<&'static str>::start("waiting", None)?;
        engine.submit("slow", async {
            tokio::time::sleep(std::time::Duration::from_millis(150)).await;
            anyhow::Ok("done")
        })?;
        assert!(!engine.is_complete("slow"));
        assert!(matches!(engine.wait_for("slow"), JobStatus::Succeeded("done")));
        assert!(engine.is_complete("slow"));
        Ok(())
    }

    #[test]
    #[traced_test]
    fn dropping_the_engine_drains_it() -> anyhow::Result<()> {
        let finished = Arc::new(AtomicBool::new(false));
        let engine = Engine::<()>::start("dropped", None)?;
        {
            let finished = finished.clone();
            engine.submit("slow", async move {
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                finished.store(true, Ordering::SeqCst);
                anyhow::Ok(())
            })?;
        }
        drop(engine);
        assert!(finished.load(Ordering::SeqCst));
        Ok(())
    }
}
