//! Task dispatcher
//!
//! Units of work are a closed set of [`Task`] variants. [`route`] decides
//! whether a unit runs inline on the caller or on the pool matching its
//! phase. Pools are a fixed number of tokio workers sharing an unbounded
//! queue, so submitting never waits on a busy pool and no unit ever blocks
//! on another one.

use crate::error::VerdictError;
use crate::types::{PageId, ParamId, SessionId, TabId};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Unit of work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Task {
    /// Collect one common parameter
    CollectCommon { session: SessionId, param: ParamId },
    /// Dispatch the tabs of a page
    CollectPage { session: SessionId, page: PageId },
    /// Dispatch the parameters of a tab
    CollectTab { session: SessionId, tab: TabId },
    /// Collect one source-under-test parameter
    CollectParameter { session: SessionId, param: ParamId },
    /// Validate one collected parameter
    ValidateParameter { session: SessionId, param: ParamId },
}

impl Task {
    /// Session the unit belongs to
    #[must_use]
    pub fn session(&self) -> SessionId {
        match *self {
            Self::CollectCommon { session, .. }
            | Self::CollectPage { session, .. }
            | Self::CollectTab { session, .. }
            | Self::CollectParameter { session, .. }
            | Self::ValidateParameter { session, .. } => session,
        }
    }

    /// Phase the unit runs in
    #[must_use]
    pub fn phase(&self) -> Phase {
        match self {
            Self::ValidateParameter { .. } => Phase::Validation,
            _ => Phase::Collection,
        }
    }

    /// Short name for logs
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::CollectCommon { .. } => "collect_common",
            Self::CollectPage { .. } => "collect_page",
            Self::CollectTab { .. } => "collect_tab",
            Self::CollectParameter { .. } => "collect_parameter",
            Self::ValidateParameter { .. } => "validate_parameter",
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CollectCommon { session, param }
            | Self::CollectParameter { session, param }
            | Self::ValidateParameter { session, param } => {
                write!(f, "{}[{session}/{param}]", self.name())
            }
            Self::CollectPage { session, page } => write!(f, "{}[{session}/{page}]", self.name()),
            Self::CollectTab { session, tab } => write!(f, "{}[{session}/{tab}]", self.name()),
        }
    }
}

/// Execution phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    /// Gathering values from data sources
    Collection,
    /// Comparing collected values with expectations
    Validation,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Collection => write!(f, "collection"),
            Self::Validation => write!(f, "validation"),
        }
    }
}

/// Where a unit runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    /// On the caller, before returning
    Inline,
    /// On the pool of the given phase
    Pool(Phase),
}

/// Facts the routing decision depends on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouteContext {
    /// Session runs preconfigured values only
    pub preconfigured_only: bool,
    /// Unit (and, for pages and tabs, every descendant) is synchronous
    pub synchronous: bool,
}

/// Decide where a unit runs
#[inline]
#[must_use]
pub fn route(task: &Task, ctx: RouteContext) -> Mode {
    if ctx.preconfigured_only || ctx.synchronous {
        Mode::Inline
    } else {
        Mode::Pool(task.phase())
    }
}

/// Boxed unit body handed to a pool
pub type Job = BoxFuture<'static, ()>;

#[derive(Debug, Default)]
struct PoolCounters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

/// Pool statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Phase served
    pub phase: Phase,
    /// Worker count
    pub workers: usize,
    /// Jobs accepted
    pub submitted: u64,
    /// Jobs finished, including failed ones
    pub completed: u64,
    /// Jobs that panicked
    pub failed: u64,
}

impl PoolStats {
    /// Jobs accepted but not yet finished
    #[inline]
    #[must_use]
    pub fn in_flight(&self) -> u64 {
        self.submitted.saturating_sub(self.completed)
    }
}

/// Fixed-size worker pool over an unbounded queue
#[derive(Debug)]
pub struct WorkerPool {
    phase: Phase,
    size: usize,
    sender: parking_lot::Mutex<Option<mpsc::UnboundedSender<Job>>>,
    workers: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<PoolCounters>,
}

impl WorkerPool {
    /// Start `size` workers on the current tokio runtime
    ///
    /// # Panics
    /// Panics when called outside a tokio runtime
    #[must_use]
    pub fn start(phase: Phase, size: usize) -> Self {
        let size = size.max(1);
        let (tx, rx) = mpsc::unbounded_channel();
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let counters = Arc::new(PoolCounters::default());

        let workers = (0..size)
            .map(|index| tokio::spawn(worker_loop(phase, index, rx.clone(), counters.clone())))
            .collect();

        tracing::debug!(%phase, workers = size, "worker pool started");
        Self {
            phase,
            size,
            sender: parking_lot::Mutex::new(Some(tx)),
            workers: parking_lot::Mutex::new(workers),
            counters,
        }
    }

    /// Queue a job
    ///
    /// # Errors
    /// Returns `Shutdown` once the pool has been shut down
    pub fn submit(&self, job: Job) -> Result<(), VerdictError> {
        let sender = self.sender.lock();
        let sender = sender.as_ref().ok_or(VerdictError::Shutdown)?;
        sender.send(job).map_err(|_| VerdictError::Shutdown)?;
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Stop accepting jobs, drain the queue and wait for the workers
    pub async fn shutdown(&self) {
        drop(self.sender.lock().take());
        let workers: Vec<_> = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if let Err(e) = worker.await {
                tracing::error!(phase = %self.phase, error = %e, "worker terminated abnormally");
            }
        }
        tracing::debug!(phase = %self.phase, "worker pool stopped");
    }

    /// Whether the pool still accepts jobs
    #[inline]
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.sender.lock().is_some()
    }

    /// Current statistics
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            phase: self.phase,
            workers: self.size,
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}

async fn worker_loop(
    phase: Phase,
    index: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Job>>>,
    counters: Arc<PoolCounters>,
) {
    loop {
        let job = { rx.lock().await.recv().await };
        let Some(job) = job else { break };

        // Units guard themselves; this only keeps the worker alive.
        if AssertUnwindSafe(job).catch_unwind().await.is_err() {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            tracing::error!(%phase, worker = index, "job panicked past its guard");
        }
        counters.completed.fetch_add(1, Ordering::Relaxed);
    }
    tracing::trace!(%phase, worker = index, "worker exiting");
}

/// The collection and validation pools
#[derive(Debug)]
pub struct Dispatcher {
    collection: WorkerPool,
    validation: WorkerPool,
}

impl Dispatcher {
    /// Start both pools
    ///
    /// # Panics
    /// Panics when called outside a tokio runtime
    #[must_use]
    pub fn start(collection_workers: usize, validation_workers: usize) -> Self {
        Self {
            collection: WorkerPool::start(Phase::Collection, collection_workers),
            validation: WorkerPool::start(Phase::Validation, validation_workers),
        }
    }

    /// Pool serving `phase`
    #[inline]
    #[must_use]
    pub fn pool(&self, phase: Phase) -> &WorkerPool {
        match phase {
            Phase::Collection => &self.collection,
            Phase::Validation => &self.validation,
        }
    }

    /// Queue a job on the pool serving `phase`
    ///
    /// # Errors
    /// Returns `Shutdown` once the dispatcher has been shut down
    #[inline]
    pub fn submit(&self, phase: Phase, job: Job) -> Result<(), VerdictError> {
        self.pool(phase).submit(job)
    }

    /// Statistics of both pools
    #[must_use]
    pub fn stats(&self) -> [PoolStats; 2] {
        [self.collection.stats(), self.validation.stats()]
    }

    /// Shut down both pools
    pub async fn shutdown(&self) {
        self.collection.shutdown().await;
        self.validation.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn tasks() -> Vec<Task> {
        let session = SessionId::new();
        vec![
            Task::CollectCommon { session, param: ParamId::new() },
            Task::CollectPage { session, page: PageId::new() },
            Task::CollectTab { session, tab: TabId::new() },
            Task::CollectParameter { session, param: ParamId::new() },
            Task::ValidateParameter { session, param: ParamId::new() },
        ]
    }

    #[test]
    fn routes_by_phase() {
        let async_unit = RouteContext::default();
        let modes: Vec<_> = tasks().iter().map(|t| route(t, async_unit)).collect();
        assert_eq!(
            modes,
            vec![
                Mode::Pool(Phase::Collection),
                Mode::Pool(Phase::Collection),
                Mode::Pool(Phase::Collection),
                Mode::Pool(Phase::Collection),
                Mode::Pool(Phase::Validation),
            ]
        );
    }

    #[test]
    fn synchronous_or_preconfigured_runs_inline() {
        for task in tasks() {
            let sync = RouteContext { preconfigured_only: false, synchronous: true };
            let preconfigured = RouteContext { preconfigured_only: true, synchronous: false };
            assert_eq!(route(&task, sync), Mode::Inline);
            assert_eq!(route(&task, preconfigured), Mode::Inline);
        }
    }

    #[tokio::test]
    async fn pool_runs_jobs_and_counts() {
        let pool = WorkerPool::start(Phase::Collection, 3);
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..50 {
            let done = done.clone();
            pool.submit(
                async move {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    done.fetch_add(1, Ordering::SeqCst);
                }
                .boxed(),
            )
            .unwrap();
        }

        pool.shutdown().await;
        assert_eq!(done.load(Ordering::SeqCst), 50);

        let stats = pool.stats();
        assert_eq!(stats.submitted, 50);
        assert_eq!(stats.completed, 50);
        assert_eq!(stats.in_flight(), 0);
    }

    #[tokio::test]
    async fn panicking_job_does_not_kill_worker() {
        let pool = WorkerPool::start(Phase::Validation, 1);
        let done = Arc::new(AtomicUsize::new(0));

        pool.submit(async { panic!("unit exploded") }.boxed()).unwrap();
        let counter = done.clone();
        pool.submit(
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            .boxed(),
        )
        .unwrap();

        pool.shutdown().await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().failed, 1);
    }

    #[tokio::test]
    async fn submit_after_shutdown_fails() {
        let dispatcher = Dispatcher::start(1, 1);
        dispatcher.shutdown().await;

        assert!(!dispatcher.pool(Phase::Collection).is_running());
        let err = dispatcher.submit(Phase::Collection, async {}.boxed()).unwrap_err();
        assert!(matches!(err, VerdictError::Shutdown));
    }

    #[tokio::test]
    async fn jobs_may_submit_more_jobs() {
        let dispatcher = Arc::new(Dispatcher::start(1, 1));
        let (tx, rx) = tokio::sync::oneshot::channel();

        let inner = dispatcher.clone();
        dispatcher
            .submit(
                Phase::Collection,
                async move {
                    inner
                        .submit(
                            Phase::Validation,
                            async move {
                                let _ = tx.send(());
                            }
                            .boxed(),
                        )
                        .unwrap();
                }
                .boxed(),
            )
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), rx).await.unwrap().unwrap();
        dispatcher.shutdown().await;
    }
}
