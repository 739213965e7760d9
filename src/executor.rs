//! Task Executors.
//!
//! Three pools with distinct discipline, built on the one `tokio` runtime
//! the embedding application already owns (this crate never starts its
//! own runtime):
//!
//! - `server`: unbounded, one `tokio::spawn` per submitted long-lived
//!   task — used for receive loops (the same `tokio::spawn(listen_task(...))`
//!   / `broadcast_task` style used elsewhere in this crate).
//! - `io`: bounded concurrency via a `tokio::sync::Semaphore`, used for
//!   outbound sends and short descriptor fetches — the same
//!   `Semaphore`-gated shape as `tcp_proxy.rs`'s
//!   `MAX_CONCURRENT_CONNECTIONS` guard.
//! - `callback`: a single background task draining an unbounded
//!   `tokio::sync::mpsc` channel, which gives FIFO delivery of user
//!   notifications for free.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, warn};
use tokio::sync::{mpsc, Semaphore};

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Default bound for the I/O pool: `min(cpu*2, 8)`.
fn default_io_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get() * 2)
        .unwrap_or(4)
        .min(8)
}

struct CallbackWorker {
    tx: mpsc::UnboundedSender<BoxFuture>,
}

/// The three task pools: server, I/O, and callback.
pub struct Executors {
    io_semaphore: Arc<Semaphore>,
    callback: CallbackWorker,
    terminated: Arc<AtomicBool>,
    _callback_task: tokio::task::JoinHandle<()>,
}

impl Executors {
    /// Create the pools. Must be called from within a `tokio` runtime
    /// context (the embedding application's), since it spawns the
    /// callback worker immediately.
    pub fn new() -> Self {
        Self::with_io_concurrency(default_io_concurrency())
    }

    pub fn with_io_concurrency(io_concurrency: usize) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<BoxFuture>();

        let callback_task = tokio::spawn(async move {
            while let Some(fut) = rx.recv().await {
                fut.await;
            }
            debug!(target: "upnp", "Callback worker exiting, channel closed.");
        });

        Executors {
            io_semaphore: Arc::new(Semaphore::new(io_concurrency.max(1))),
            callback: CallbackWorker { tx },
            terminated: Arc::new(AtomicBool::new(false)),
            _callback_task: callback_task,
        }
    }

    /// Submit a long-lived task (a receive loop) to the server pool.
    /// Unbounded: every submission gets its own OS-scheduled task.
    pub fn submit_server<F>(&self, task: F) -> tokio::task::JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(task)
    }

    /// Submit a short task to the bounded I/O pool. Returns `false`
    /// (without running `task`) if the executors have been terminated.
    /// If the pool is saturated, the submission waits for a free slot —
    /// callers that want "reject if saturated" semantics should use
    /// `try_submit_io`.
    pub fn submit_io<F>(&self, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.terminated.load(Ordering::Acquire) {
            return false;
        }
        let semaphore = self.io_semaphore.clone();
        tokio::spawn(async move {
            let _permit = semaphore.acquire().await;
            task.await;
        });
        true
    }

    /// Like `submit_io`, but rejects immediately (logging and dropping
    /// the task) instead of queueing when the pool is saturated.
    pub fn try_submit_io<F>(&self, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.terminated.load(Ordering::Acquire) {
            return false;
        }
        match self.io_semaphore.clone().try_acquire_owned() {
            Ok(permit) => {
                tokio::spawn(async move {
                    let _permit = permit;
                    task.await;
                });
                true
            }
            Err(_) => {
                warn!(target: "upnp", "I/O pool saturated, dropping submission.");
                false
            }
        }
    }

    /// Submit a callback to the single-worker FIFO pool. Returns `false`
    /// if the executors have been terminated.
    pub fn submit_callback<F>(&self, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.terminated.load(Ordering::Acquire) {
            return false;
        }
        self.callback.tx.send(Box::pin(task)).is_ok()
    }

    /// After `terminate`, all submissions silently return `false`.
    pub fn terminate(&self) {
        self.terminated.store(true, Ordering::Release);
    }
}

impl Default for Executors {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn callback_pool_preserves_order() {
        let exec = Executors::new();
        let order = Arc::new(tokio::sync::Mutex::new(Vec::new()));

        for i in 0..10 {
            let order = order.clone();
            exec.submit_callback(async move {
                order.lock().await.push(i);
            });
        }

        // Give the single worker a chance to drain.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert_eq!(*order.lock().await, (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn terminate_rejects_further_submissions() {
        let exec = Executors::new();
        exec.terminate();

        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        assert!(!exec.submit_callback(async move {
            ran2.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(!exec.submit_io(async {}));

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn io_pool_bounds_concurrency() {
        let exec = Executors::with_io_concurrency(1);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let in_flight = in_flight.clone();
            let max_seen = max_seen.clone();
            exec.submit_io(async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
            });
        }

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }
}
