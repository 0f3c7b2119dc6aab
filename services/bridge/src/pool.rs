//! Bounded worker pools.
//!
//! Dispatch and binding work run on pools that are constructed and owned by
//! their caller; nothing here is global. A pool bounds concurrency to its
//! size and never blocks the submitter.
//!
//! Two orderings:
//! - [`DispatchOrdering::Unordered`]: every job is its own task and waits for
//!   one of `size` permits, so jobs for the same object may finish out of order
//! - [`DispatchOrdering::PerObject`]: `size` sequential lanes; a job's key is
//!   hashed to a fixed lane so jobs for one object run in submission order

use std::collections::hash_map::DefaultHasher;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::FutureExt;
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// How a pool orders jobs that share a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchOrdering {
    #[default]
    Unordered,
    PerObject,
}

impl FromStr for DispatchOrdering {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "unordered" => Ok(DispatchOrdering::Unordered),
            "per_object" | "per-object" => Ok(DispatchOrdering::PerObject),
            other => Err(format!("unknown dispatch ordering: {other}")),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("worker pool {0} is shut down")]
    Closed(String),
}

/// What happened to the pool's jobs by the end of a shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShutdownReport {
    /// Jobs that ran to completion over the pool's lifetime.
    pub completed: usize,

    /// Jobs cancelled, running or queued, when the timeout expired.
    pub aborted: usize,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicUsize,
    finished: AtomicUsize,
    in_flight: AtomicUsize,
}

struct RunningGuard<'a>(&'a Counters);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

struct Inner {
    closed: bool,
    tasks: JoinSet<()>,
    lanes: Vec<Option<mpsc::UnboundedSender<Job>>>,
}

/// A named, bounded pool of async workers.
pub struct WorkerPool {
    name: Arc<str>,
    size: usize,
    ordering: DispatchOrdering,
    permits: Arc<Semaphore>,
    counters: Arc<Counters>,
    inner: Mutex<Inner>,
}

impl WorkerPool {
    /// Create a pool. A size of zero is treated as one.
    pub fn new(name: impl Into<String>, size: usize, ordering: DispatchOrdering) -> Self {
        let size = size.max(1);
        let lanes = match ordering {
            DispatchOrdering::Unordered => Vec::new(),
            DispatchOrdering::PerObject => (0..size).map(|_| None).collect(),
        };

        Self {
            name: Arc::from(name.into()),
            size,
            ordering,
            permits: Arc::new(Semaphore::new(size)),
            counters: Arc::new(Counters::default()),
            inner: Mutex::new(Inner {
                closed: false,
                tasks: JoinSet::new(),
                lanes,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn ordering(&self) -> DispatchOrdering {
        self.ordering
    }

    /// Jobs currently running.
    pub fn in_flight(&self) -> usize {
        self.counters.in_flight.load(Ordering::SeqCst)
    }

    /// Jobs that have run to completion.
    pub fn completed(&self) -> usize {
        self.counters.finished.load(Ordering::SeqCst)
    }

    /// Queue a job. `key` selects the lane under per-object ordering and is
    /// ignored otherwise. Must be called from within a tokio runtime.
    pub fn submit<F>(&self, key: &str, job: F) -> Result<(), PoolError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| PoolError::Closed(self.name.to_string()))?;
        if inner.closed {
            return Err(PoolError::Closed(self.name.to_string()));
        }

        // Reap finished tasks so the set does not grow without bound.
        while let Some(result) = inner.tasks.try_join_next() {
            self.log_join_error(result);
        }

        self.counters.submitted.fetch_add(1, Ordering::SeqCst);
        let job: Job = Box::pin(job);

        match self.ordering {
            DispatchOrdering::Unordered => {
                let permits = self.permits.clone();
                let counters = self.counters.clone();
                let name = self.name.clone();
                inner.tasks.spawn(async move {
                    // The semaphore is never closed.
                    let Ok(_permit) = permits.acquire_owned().await else {
                        return;
                    };
                    run_job(&name, &counters, job).await;
                });
            }
            DispatchOrdering::PerObject => {
                let lane = lane_for(key, self.size);
                let existing = inner.lanes[lane].clone();
                let tx = match existing {
                    Some(tx) => tx,
                    None => {
                        let (tx, rx) = mpsc::unbounded_channel();
                        inner
                            .tasks
                            .spawn(run_lane(self.name.clone(), lane, self.counters.clone(), rx));
                        inner.lanes[lane] = Some(tx.clone());
                        tx
                    }
                };
                if tx.send(job).is_err() {
                    self.counters.submitted.fetch_sub(1, Ordering::SeqCst);
                    return Err(PoolError::Closed(self.name.to_string()));
                }
            }
        }

        Ok(())
    }

    /// Stop accepting work, wait up to `timeout` for queued and running jobs,
    /// then abort whatever remains. Calling it again reports the same totals.
    pub async fn shutdown(&self, timeout: Duration) -> ShutdownReport {
        let mut tasks = {
            let Ok(mut inner) = self.inner.lock() else {
                return self.report();
            };
            inner.closed = true;
            // Dropping the senders lets each lane drain and exit.
            inner.lanes.iter_mut().for_each(|lane| *lane = None);
            std::mem::take(&mut inner.tasks)
        };

        info!(pool = %self.name, in_flight = self.in_flight(), "Shutting down worker pool");

        let drained = tokio::time::timeout(timeout, async {
            while let Some(result) = tasks.join_next().await {
                self.log_join_error(result);
            }
        })
        .await;

        if drained.is_err() {
            warn!(pool = %self.name, remaining = tasks.len(), "Shutdown timed out; aborting jobs");
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }

        let report = self.report();
        info!(
            pool = %self.name,
            completed = report.completed,
            aborted = report.aborted,
            "Worker pool stopped"
        );
        report
    }

    fn report(&self) -> ShutdownReport {
        let submitted = self.counters.submitted.load(Ordering::SeqCst);
        let finished = self.counters.finished.load(Ordering::SeqCst);
        ShutdownReport {
            completed: finished,
            aborted: submitted.saturating_sub(finished),
        }
    }

    fn log_join_error(&self, result: Result<(), tokio::task::JoinError>) {
        if let Err(e) = result {
            if !e.is_cancelled() {
                error!(pool = %self.name, error = %e, "Worker task failed");
            }
        }
    }
}

fn lane_for(key: &str, lanes: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % lanes as u64) as usize
}

async fn run_job(pool: &str, counters: &Counters, job: Job) {
    counters.in_flight.fetch_add(1, Ordering::SeqCst);
    let _running = RunningGuard(counters);

    // A panicking job is logged and counted; it never takes a worker down.
    if AssertUnwindSafe(job).catch_unwind().await.is_err() {
        error!(pool = %pool, "Job panicked");
    }
    counters.finished.fetch_add(1, Ordering::SeqCst);
}

async fn run_lane(
    pool: Arc<str>,
    lane: usize,
    counters: Arc<Counters>,
    mut rx: mpsc::UnboundedReceiver<Job>,
) {
    debug!(pool = %pool, lane, "Lane started");
    while let Some(job) = rx.recv().await {
        run_job(&pool, &counters, job).await;
    }
    debug!(pool = %pool, lane, "Lane drained");
}
