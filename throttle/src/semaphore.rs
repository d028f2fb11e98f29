use std::sync::atomic::{AtomicBool, Ordering};

/// Counting semaphore that can be switched off entirely (a size of 0 means "no limit").
#[derive(Debug)]
pub struct Semaphore {
    flag: AtomicBool,
    sem: tokio::sync::Semaphore,
}

impl Semaphore {
    pub fn new(value: usize) -> Self {
        let sem = Self {
            flag: AtomicBool::new(false),
            sem: tokio::sync::Semaphore::const_new(0),
        };
        sem.setup(value);
        sem
    }

    pub fn setup(&self, value: usize) {
        self.flag.store(value > 0, Ordering::Release);
        if value == 0 {
            return;
        }
        self.sem.forget_permits(self.sem.available_permits());
        self.sem.add_permits(value);
    }

    pub fn is_enabled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    pub fn available_permits(&self) -> usize {
        self.sem.available_permits()
    }

    pub async fn acquire(&self) -> Option<tokio::sync::SemaphorePermit<'_>> {
        if self.is_enabled() {
            // the semaphore is never closed so acquire can only succeed
            self.sem.acquire().await.ok()
        } else {
            None
        }
    }

    pub async fn consume(&self) {
        if self.is_enabled() {
            if let Ok(permit) = self.sem.acquire().await {
                permit.forget();
            }
        }
    }

    pub async fn consume_many(&self, value: u32) {
        if self.is_enabled() {
            if let Ok(permit) = self.sem.acquire_many(value).await {
                permit.forget();
            }
        }
    }

    pub async fn run_replenish_thread(&self, replenish: usize, interval: std::time::Duration) {
        if !self.is_enabled() {
            return;
        }
        loop {
            tokio::time::sleep(interval).await;
            let curr_permits = self.sem.available_permits();
            if curr_permits >= replenish {
                continue;
            }
            self.sem.add_permits(replenish - curr_permits);
        }
    }
}
