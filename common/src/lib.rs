//! Common library for the uio tools: uniform resource descriptors over storage backends and the
//! transfer machinery built on top of them.
//!
//! # Overview
//!
//! A [`Descriptor`] is a handle to one file or directory on some backend (the local filesystem,
//! an in-memory object store, or anything registered with the [`Context`]). The generic
//! algorithms only use the backend primitives, so they work the same on every backend and across
//! any pair of backends:
//!
//! - [`copy::copy`] / [`copy::move_to`] - file and tree transfers, natively when the backend can
//! - [`dirs::mkdir`] / [`dirs::rmdir`] - directory creation and (recursive) removal
//! - [`crawl::crawl`] - lazy tree traversal paired with a mirrored target
//! - [`fingerprint::fingerprint`] - cheap change detection
//!
//! On top of those sit the background [`engine::Engine`], the [`batch::BatchCopy`] facade and the
//! fingerprint based [`sync::DirectorySynchronizer`].
//!
//! # Error Handling
//!
//! Descriptor operations return [`Error`], which names the resource for every structural failure
//! and passes backend failures through as `anyhow::Error`. Operations that do partial work
//! (directory synchronization) return an error carrying a summary of what was done before the
//! failure. Log errors with `{:#}` to see the whole chain of causes.
//!
//! # Configuration
//!
//! See [`config`]: throttling, transfer and output settings are plain structs populated by the
//! command line tools.

pub mod backends;
pub mod batch;
pub mod blocking;
pub mod config;
pub mod context;
pub mod copy;
pub mod crawl;
pub mod descriptor;
pub mod dirs;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod location;
pub mod registry;
pub mod resolver;
pub mod store;
pub mod sync;

#[cfg(test)]
mod testutils;

pub use config::{OutputConfig, RuntimeConfig, StoreConfig, ThrottleConfig, TransferConfig};
pub use context::Context;
pub use descriptor::Descriptor;
pub use error::{Error, Result};
pub use location::Location;

/// Installs the global tracing subscriber, `RUST_LOG` overrides the verbosity flags.
pub fn setup_tracing(output: &OutputConfig) {
    let level = if output.quiet {
        "off"
    } else {
        match output.verbose {
            0 => "error",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(output.verbose > 1)
        .with_thread_ids(output.verbose > 2)
        .finish();
    if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("failed to install tracing subscriber: {error:#}");
    }
}

/// Runs `func` on a freshly built multi-threaded runtime.
///
/// Errors are printed (unless quiet) and turned into `None`, on success the summary is printed
/// when requested.
pub fn run<Fut, Summary>(
    output: OutputConfig,
    runtime: RuntimeConfig,
    func: impl FnOnce() -> Fut,
) -> Option<Summary>
where
    Summary: std::fmt::Display,
    Fut: std::future::Future<Output = anyhow::Result<Summary>>,
{
    setup_tracing(&output);
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if runtime.max_workers > 0 {
        builder.worker_threads(runtime.max_workers);
    }
    if runtime.max_blocking_threads > 0 {
        builder.max_blocking_threads(runtime.max_blocking_threads);
    }
    let tokio_runtime = match builder.build() {
        Ok(tokio_runtime) => tokio_runtime,
        Err(error) => {
            if !output.quiet {
                eprintln!("failed to start the tokio runtime: {error:#}");
            }
            return None;
        }
    };
    let res = tokio_runtime.block_on(func());
    match res {
        Ok(summary) => {
            if output.print_summary {
                println!("{summary}");
            }
            Some(summary)
        }
        Err(error) => {
            if !output.quiet {
                eprintln!("{error:#}");
            }
            None
        }
    }
}
