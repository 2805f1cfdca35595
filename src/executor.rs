//! Scheduled executors for delayed work: asynchronous redelivery and half-open timers.
//!
//! A job scheduled through a [`ScheduledExecutor`] returns a [`ScheduledTask`] handle. A task
//! either fires or is cancelled, never both: the two outcomes race on one atomic state, so a
//! `cancel()` that returns `true` guarantees the job will not run.

use crate::error::{ConfigError, ReferenceKind};
use crate::sleeper::{Sleeper, TokioSleeper};
use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;

const PENDING: u8 = 0;
const FIRED: u8 = 1;
const CANCELLED: u8 = 2;

/// Name of the executor used for asynchronous redelivery when none is configured.
pub const DEFAULT_REDELIVERY_EXECUTOR: &str = "ErrorHandlerRedeliveryTask";

#[derive(Debug)]
struct TaskState {
    state: AtomicU8,
    abort: Mutex<Option<AbortHandle>>,
}

/// Handle to a scheduled job. Clones refer to the same job.
#[derive(Debug, Clone)]
pub struct ScheduledTask {
    inner: Arc<TaskState>,
}

impl ScheduledTask {
    fn new() -> Self {
        Self {
            inner: Arc::new(TaskState { state: AtomicU8::new(PENDING), abort: Mutex::new(None) }),
        }
    }

    /// Cancel the job if it has not fired yet. Idempotent; returns `true` only for the call
    /// that actually prevented the job from running.
    pub fn cancel(&self) -> bool {
        let won = self
            .inner
            .state
            .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            if let Some(handle) = self.inner.abort.lock().take() {
                handle.abort();
            }
        }
        won
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == CANCELLED
    }

    pub fn has_fired(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == FIRED
    }

    fn try_fire(&self) -> bool {
        self.inner
            .state
            .compare_exchange(PENDING, FIRED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn attach(&self, handle: AbortHandle) {
        let mut slot = self.inner.abort.lock();
        if self.is_cancelled() {
            handle.abort();
        } else {
            *slot = Some(handle);
        }
    }
}

/// Runs jobs after a delay.
pub trait ScheduledExecutor: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Run `job` once `delay` has elapsed unless the returned task is cancelled first.
    fn schedule(&self, delay: Duration, job: BoxFuture<'static, ()>) -> ScheduledTask;
}

/// Executor spawning one tokio task per job; waiting goes through the configured [`Sleeper`].
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    name: String,
    sleeper: Arc<dyn Sleeper>,
}

impl TokioScheduler {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_sleeper(name, Arc::new(TokioSleeper))
    }

    pub fn with_sleeper(name: impl Into<String>, sleeper: Arc<dyn Sleeper>) -> Self {
        Self { name: name.into(), sleeper }
    }
}

impl ScheduledExecutor for TokioScheduler {
    fn name(&self) -> &str {
        &self.name
    }

    fn schedule(&self, delay: Duration, job: BoxFuture<'static, ()>) -> ScheduledTask {
        let task = ScheduledTask::new();
        let fire = task.clone();
        let sleep = self.sleeper.sleep(delay);
        let handle = tokio::spawn(async move {
            sleep.await;
            if fire.try_fire() {
                job.await;
            }
        });
        task.attach(handle.abort_handle());
        task
    }
}

/// Named executors, resolvable by reference.
#[derive(Debug)]
pub struct ExecutorManager {
    executors: DashMap<String, Arc<dyn ScheduledExecutor>>,
    sleeper: Arc<dyn Sleeper>,
}

impl Default for ExecutorManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutorManager {
    pub fn new() -> Self {
        Self::with_sleeper(Arc::new(TokioSleeper))
    }

    /// Executors created on demand wait through `sleeper`.
    pub fn with_sleeper(sleeper: Arc<dyn Sleeper>) -> Self {
        Self { executors: DashMap::new(), sleeper }
    }

    pub fn register(&self, executor: Arc<dyn ScheduledExecutor>) {
        self.executors.insert(executor.name().to_string(), executor);
    }

    /// Look up a registered executor; unknown names are a configuration error.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn ScheduledExecutor>, ConfigError> {
        self.executors.get(name).map(|e| Arc::clone(e.value())).ok_or_else(|| {
            ConfigError::UnresolvedReference {
                kind: ReferenceKind::ExecutorService,
                name: name.to_string(),
            }
        })
    }

    /// Registered executor with this name, created with the manager's sleeper if missing.
    pub fn get_or_create(&self, name: &str) -> Arc<dyn ScheduledExecutor> {
        let entry = self.executors.entry(name.to_string()).or_insert_with(|| {
            tracing::debug!(target: "routeguard::executor", executor = %name, "creating scheduled executor");
            Arc::new(TokioScheduler::with_sleeper(name, Arc::clone(&self.sleeper)))
        });
        Arc::clone(entry.value())
    }
}
