//! The runtime: ready queue, analysis workers, and collaborator wiring.
//!
//! Operations are driven through their lifecycle by three classes of
//! workers: the issuing thread (dependence analysis), the analysis
//! workers serviced here (deferred `trigger_*` calls), and event
//! callbacks. The runtime owns the ready queue the analysis workers
//! drain, hands out unique operation ids, and wires the two external
//! collaborators (region forest and mapper) into the pipeline.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use crate::config::RuntimeConfig;
use crate::context::TaskContext;
use crate::error::Result;
use crate::forest::{DefaultForest, RegionForest};
use crate::mapper::{DefaultMapper, Mapper};
use crate::tracing_compat::debug;
use crate::types::{ProcessorId, UniqueOpId};

type Job = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct QueueState {
    jobs: VecDeque<Job>,
    shutdown: bool,
}

struct JobQueue {
    state: Mutex<QueueState>,
    cond: Condvar,
}

impl JobQueue {
    fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, job: Job) {
        let mut state = self.lock();
        if state.shutdown {
            return;
        }
        state.jobs.push_back(job);
        drop(state);
        self.cond.notify_one();
    }

    /// Blocks until a job is available or shutdown is requested with an
    /// empty queue.
    fn pop(&self) -> Option<Job> {
        let mut state = self.lock();
        loop {
            if let Some(job) = state.jobs.pop_front() {
                return Some(job);
            }
            if state.shutdown {
                return None;
            }
            state = self
                .cond
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn shutdown(&self) {
        self.lock().shutdown = true;
        self.cond.notify_all();
    }
}

/// The opstream runtime.
///
/// Created once per process (or per test); hands out task contexts via
/// [`Runtime::create_context`]. Dropping the runtime drains the ready
/// queue and joins the workers.
pub struct Runtime {
    config: RuntimeConfig,
    queue: Arc<JobQueue>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    forest: Arc<dyn RegionForest>,
    mapper: Arc<dyn Mapper>,
    processors: Vec<ProcessorId>,
    next_op_id: AtomicU64,
}

impl Runtime {
    /// Creates a runtime with the default forest and mapper.
    pub fn new(config: RuntimeConfig) -> Result<Arc<Self>> {
        let processors: Vec<ProcessorId> = (0..config.processors as u64)
            .map(ProcessorId::from_raw)
            .collect();
        let forest: Arc<dyn RegionForest> = Arc::new(DefaultForest::new());
        let mapper: Arc<dyn Mapper> = Arc::new(DefaultMapper::new(processors.clone()));
        Self::with_collaborators(config, forest, mapper)
    }

    /// Creates a runtime with explicit collaborators.
    pub fn with_collaborators(
        config: RuntimeConfig,
        forest: Arc<dyn RegionForest>,
        mapper: Arc<dyn Mapper>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let processors: Vec<ProcessorId> = (0..config.processors as u64)
            .map(ProcessorId::from_raw)
            .collect();
        let queue = Arc::new(JobQueue::new());

        let mut workers = Vec::new();
        if !config.inline_execution {
            for index in 0..config.worker_threads {
                let queue = Arc::clone(&queue);
                let handle = std::thread::Builder::new()
                    .name(format!("opstream-worker-{index}"))
                    .spawn(move || {
                        while let Some(job) = queue.pop() {
                            job();
                        }
                    })
                    .expect("failed to spawn analysis worker");
                workers.push(handle);
            }
        }

        Ok(Arc::new(Self {
            config,
            queue,
            workers: Mutex::new(workers),
            forest,
            mapper,
            processors,
            next_op_id: AtomicU64::new(1),
        }))
    }

    /// Creates a new top-level task context on this runtime.
    #[must_use]
    pub fn create_context(self: &Arc<Self>, name: impl Into<String>) -> Arc<TaskContext> {
        TaskContext::new(Arc::clone(self), name.into())
    }

    /// Schedules a deferred trigger on the ready queue.
    ///
    /// In inline mode the job runs immediately on the calling thread;
    /// callers therefore must not hold operation locks across this call.
    pub fn defer(&self, job: impl FnOnce() + Send + 'static) {
        if self.config.inline_execution {
            job();
        } else {
            self.queue.push(Box::new(job));
        }
    }

    /// Returns the runtime configuration.
    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Returns the region forest collaborator.
    #[must_use]
    pub fn forest(&self) -> &Arc<dyn RegionForest> {
        &self.forest
    }

    /// Returns the mapper collaborator.
    #[must_use]
    pub fn mapper(&self) -> &Arc<dyn Mapper> {
        &self.mapper
    }

    /// Returns the processors the mapper can target.
    #[must_use]
    pub fn processors(&self) -> &[ProcessorId] {
        &self.processors
    }

    /// Hands out the next unique operation id.
    pub(crate) fn next_unique_id(&self) -> UniqueOpId {
        UniqueOpId::from_raw(self.next_op_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Stops the workers once the queue drains.
    pub fn shutdown(&self) {
        self.queue.shutdown();
        let workers = {
            let mut guard = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *guard)
        };
        for handle in workers {
            if handle.join().is_err() {
                debug!("analysis worker panicked during shutdown");
            }
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.config)
            .field("processors", &self.processors.len())
            .finish_non_exhaustive()
    }
}
