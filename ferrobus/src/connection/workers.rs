/*
 * Copyright (c) 2024. Govcraft
 *
 * Licensed under either of
 *   * Apache License, Version 2.0 (the "License");
 *     you may not use this file except in compliance with the License.
 *     You may obtain a copy of the License at http://www.apache.org/licenses/LICENSE-2.0
 *   * MIT license: http://opensource.org/licenses/MIT
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the applicable License for the specific language governing permissions and
 * limitations under that License.
 */

//! Resizable pool of worker tasks running application callbacks.

use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace, warn};

/// A unit of work that runs at most once.
struct Unit {
    job: Mutex<Option<BoxFuture<'static, ()>>>,
}

impl Unit {
    fn take(&self) -> Option<BoxFuture<'static, ()>> {
        self.job.lock().take()
    }
}

#[derive(Default)]
struct RunQueue {
    units: Mutex<VecDeque<Arc<Unit>>>,
    notify: Notify,
}

/// Workers pulling units from a shared FIFO.
pub(crate) struct WorkerPool {
    queue: Arc<RunQueue>,
    workers: Mutex<Vec<CancellationToken>>,
    next_id: AtomicUsize,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers.lock().len())
            .field("queued", &self.queue.units.lock().len())
            .finish()
    }
}

impl WorkerPool {
    /// Start `count` workers (at least one). Must be called inside a runtime.
    pub(crate) fn new(count: usize) -> Self {
        let pool = Self {
            queue: Arc::new(RunQueue::default()),
            workers: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(0),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        };
        pool.resize(count);
        pool
    }

    /// Queue a unit of work.
    ///
    /// Once the pool is shut down the workers may already be gone, so the
    /// unit runs on its own task instead of waiting in the queue.
    pub(crate) fn submit<F>(&self, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.shutdown.is_cancelled() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    trace!("worker pool stopped, running unit detached");
                    handle.spawn(async move {
                        if AssertUnwindSafe(job).catch_unwind().await.is_err() {
                            warn!("callback panicked");
                        }
                    });
                }
                Err(_) => trace!("worker pool stopped outside a runtime, dropping unit"),
            }
            return;
        }
        self.queue.units.lock().push_back(Arc::new(Unit {
            job: Mutex::new(Some(job.boxed())),
        }));
        self.queue.notify.notify_one();
    }

    /// Current number of workers.
    pub(crate) fn count(&self) -> usize {
        self.workers.lock().len()
    }

    /// Grow or shrink to `count` workers (at least one).
    ///
    /// Removed workers finish the unit they are running before exiting.
    pub(crate) fn resize(&self, count: usize) {
        let count = count.max(1);
        let mut workers = self.workers.lock();
        while workers.len() > count {
            if let Some(stop) = workers.pop() {
                stop.cancel();
            }
        }
        while workers.len() < count && !self.shutdown.is_cancelled() {
            let stop = CancellationToken::new();
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            self.tracker.spawn(worker_loop(
                id,
                Arc::clone(&self.queue),
                stop.clone(),
                self.shutdown.clone(),
            ));
            workers.push(stop);
        }
        debug!(workers = workers.len(), "worker pool resized");
    }

    /// Stop accepting new workers and let the current ones drain the queue.
    pub(crate) fn shutdown(&self) {
        self.shutdown.cancel();
        self.tracker.close();
        self.queue.notify.notify_waiters();
    }

    /// Wait until every worker has exited.
    pub(crate) async fn wait(&self) {
        self.tracker.wait().await;
    }
}

async fn worker_loop(
    id: usize,
    queue: Arc<RunQueue>,
    stop: CancellationToken,
    shutdown: CancellationToken,
) {
    trace!(worker = id, "worker started");
    loop {
        if stop.is_cancelled() {
            break;
        }
        let unit = queue.units.lock().pop_front();
        if let Some(unit) = unit {
            if let Some(job) = unit.take() {
                if AssertUnwindSafe(job).catch_unwind().await.is_err() {
                    warn!(worker = id, "callback panicked");
                }
            }
            continue;
        }
        if shutdown.is_cancelled() {
            break;
        }
        tokio::select! {
            () = queue.notify.notified() => {}
            () = stop.cancelled() => break,
            () = shutdown.cancelled() => {}
        }
    }
    trace!(worker = id, "worker stopped");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;

    #[tokio::test]
    async fn test_units_run_and_panics_are_contained() {
        let pool = WorkerPool::new(2);
        let (tx, mut rx) = mpsc::unbounded_channel();

        pool.submit(async { panic!("boom") });
        for n in 0..10 {
            let tx = tx.clone();
            pool.submit(async move {
                let _ = tx.send(n);
            });
        }

        let mut seen = Vec::new();
        for _ in 0..10 {
            seen.push(rx.recv().await.unwrap());
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_resize_and_drain() {
        let pool = WorkerPool::new(4);
        assert_eq!(pool.count(), 4);
        pool.resize(1);
        assert_eq!(pool.count(), 1);
        pool.resize(0);
        assert_eq!(pool.count(), 1);

        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let counter = Arc::clone(&counter);
            pool.submit(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.shutdown();
        pool.wait().await;
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_unit_submitted_after_shutdown_still_runs() {
        let pool = WorkerPool::new(1);
        pool.shutdown();
        pool.wait().await;

        let (tx, rx) = tokio::sync::oneshot::channel();
        pool.submit(async move {
            let _ = tx.send("late");
        });
        let value = tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .expect("late unit ran")
            .unwrap();
        assert_eq!(value, "late");
    }
}
