//! Bounded pool of tokio tasks with a running-state guard.
//!
//! `spawn` never blocks: the task is created immediately and waits for one
//! of `size` permits before running its body. Once `shutdown` is called no
//! new work is accepted, and `drain` waits for what is already queued.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::core::error::{panic_message, ErrorSink, ListenerError};

#[derive(Debug)]
pub struct WorkerPool {
    name: &'static str,
    permits: Arc<Semaphore>,
    running: AtomicBool,
    tasks: Mutex<JoinSet<()>>,
    errors: ErrorSink,
}

impl WorkerPool {
    pub fn new(name: &'static str, size: usize, errors: ErrorSink) -> Self {
        Self {
            name,
            permits: Arc::new(Semaphore::new(size.max(1))),
            running: AtomicBool::new(true),
            tasks: Mutex::new(JoinSet::new()),
            errors,
        }
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Reopens a pool that was shut down.
    pub fn restart(&self) {
        self.running.store(true, Ordering::Release);
    }

    /// Queues `fut` on the pool. Returns `false` if the pool is shut down.
    pub fn spawn<F>(&self, fut: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if !self.is_running() {
            return false;
        }

        let permits = Arc::clone(&self.permits);
        let mut tasks = self.tasks.lock();
        while let Some(res) = tasks.try_join_next() {
            self.observe(res);
        }
        tasks.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            fut.await;
        });
        true
    }

    /// Stops accepting new work.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Waits for queued work to finish. Whatever is still running after
    /// `grace` is aborted and reported as `PoolShutdownTimeout`.
    pub async fn drain(&self, grace: Duration) -> Result<(), ListenerError> {
        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        if tasks.is_empty() {
            return Ok(());
        }
        debug!(pool = self.name, tasks = tasks.len(), "draining worker pool");

        let finished = tokio::time::timeout(grace, async {
            while let Some(res) = tasks.join_next().await {
                self.observe(res);
            }
        })
        .await;

        match finished {
            Ok(()) => Ok(()),
            Err(_) => {
                warn!(pool = self.name, remaining = tasks.len(), "aborting unfinished tasks");
                tasks.abort_all();
                Err(ListenerError::PoolShutdownTimeout(self.name))
            }
        }
    }

    fn observe(&self, res: Result<(), tokio::task::JoinError>) {
        if let Err(e) = res {
            if e.is_panic() {
                let reason = panic_message(e.into_panic().as_ref());
                self.errors.report(ListenerError::Internal(format!(
                    "task on {} pool panicked: {reason}",
                    self.name
                )));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn pool(size: usize) -> (WorkerPool, flume::Receiver<ListenerError>) {
        let (errors, rx) = ErrorSink::new(16);
        (WorkerPool::new("test", size, errors), rx)
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let (pool, _rx) = pool(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for _ in 0..8 {
            let (running, peak) = (Arc::clone(&running), Arc::clone(&peak));
            assert!(pool.spawn(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            }));
        }

        pool.drain(Duration::from_secs(5)).await.unwrap();
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(running.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn shutdown_rejects_new_work() {
        let (pool, _rx) = pool(1);
        pool.shutdown();
        assert!(!pool.spawn(async {}));
        pool.restart();
        assert!(pool.spawn(async {}));
    }

    #[tokio::test(start_paused = true)]
    async fn drain_times_out_and_aborts() {
        let (pool, _rx) = pool(1);
        pool.spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        pool.shutdown();
        let err = pool.drain(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ListenerError::PoolShutdownTimeout("test")));
    }

    #[tokio::test]
    async fn panics_are_reported() {
        let (pool, rx) = pool(1);
        pool.spawn(async { panic!("boom") });
        pool.drain(Duration::from_secs(5)).await.unwrap();
        let err = rx.try_recv().unwrap();
        assert!(err.to_string().contains("boom"));
    }
}
