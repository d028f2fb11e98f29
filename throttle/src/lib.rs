//! Transfer concurrency limits and I/O rate limiting
//!
//! This crate provides the two backpressure mechanisms used by the uio transfer engine:
//!
//! 1. **Transfer Limit** - Caps the number of simultaneously running transfer bodies (queued copy
//!    jobs, per-file sync copies). Each holder keeps its permit for the duration of its transfer,
//!    so no more than N transfers are in flight at once.
//! 2. **I/O Operations Throttle** - Token bucket that limits the number of chunks streamed per
//!    interval, useful for bandwidth control.
//!
//! Both limits are owned by the runtime context and shared through `Arc`; nothing here is a
//! process-wide singleton. A size of `0` disables a limit.
//!
//! # Transfer Limit
//!
//! ```rust,no_run
//! use throttle::TransferLimit;
//!
//! # async fn example() {
//! let limit = TransferLimit::new(5);
//! let _permit = limit.permit().await;
//! // transfer here - permit is released when dropped
//! # }
//! ```
//!
//! # I/O Operations Throttle
//!
//! ```rust,no_run
//! use throttle::IopsThrottle;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() {
//! let iops = Arc::new(IopsThrottle::new(100));
//! let replenish = iops.clone();
//! tokio::spawn(async move { replenish.run_replenish_thread(100, Duration::from_millis(100)).await });
//!
//! // one token per streamed chunk
//! iops.get_chunk_token().await;
//! # }
//! ```
//!
//! For a whole file the number of tokens is calculated as:
//!
//! ```text
//! tokens = ⌈file_size / chunk_size⌉
//! ```

mod semaphore;

/// Default number of concurrently running transfers.
pub const DEFAULT_MAX_TRANSFERS: usize = 5;

#[derive(Debug)]
pub struct TransferLimit {
    sem: semaphore::Semaphore,
    size: usize,
}

#[derive(Debug)]
pub struct TransferPermit<'a> {
    _permit: Option<tokio::sync::SemaphorePermit<'a>>,
}

impl TransferLimit {
    pub fn new(max_transfers: usize) -> Self {
        Self {
            sem: semaphore::Semaphore::new(max_transfers),
            size: max_transfers,
        }
    }

    /// Maximum number of concurrent transfers, `None` when unbounded.
    pub fn size(&self) -> Option<usize> {
        if self.sem.is_enabled() {
            Some(self.size)
        } else {
            None
        }
    }

    pub fn available(&self) -> Option<usize> {
        if self.sem.is_enabled() {
            Some(self.sem.available_permits())
        } else {
            None
        }
    }

    pub async fn permit(&self) -> TransferPermit<'_> {
        TransferPermit {
            _permit: self.sem.acquire().await,
        }
    }
}

impl Default for TransferLimit {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TRANSFERS)
    }
}

#[derive(Debug)]
pub struct IopsThrottle {
    sem: semaphore::Semaphore,
}

impl IopsThrottle {
    pub fn new(iops_tokens: usize) -> Self {
        Self {
            sem: semaphore::Semaphore::new(iops_tokens),
        }
    }

    pub fn disabled() -> Self {
        Self::new(0)
    }

    pub fn is_enabled(&self) -> bool {
        self.sem.is_enabled()
    }

    pub async fn get_chunk_token(&self) {
        self.sem.consume().await;
    }

    pub async fn get_file_iops_tokens(&self, chunk_size: u64, file_size: u64) {
        if chunk_size > 0 {
            let tokens = 1 + (std::cmp::max(1, file_size) - 1) / chunk_size;
            match u32::try_from(tokens) {
                Ok(tokens) => self.sem.consume_many(tokens).await,
                Err(_) => tracing::error!(
                    "chunk size: {} is too small to limit throughput for files this big, size: {}",
                    chunk_size,
                    file_size,
                ),
            }
        }
    }

    pub async fn run_replenish_thread(&self, replenish: usize, interval: std::time::Duration) {
        self.sem.run_replenish_thread(replenish, interval).await;
    }
}
