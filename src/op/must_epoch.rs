//! Must-epoch launches.
//!
//! A must-epoch coordinates a set of tasks that must map and execute
//! concurrently: no serialising edge between members is acceptable.
//! Dependences discovered inside the epoch are recorded instead of
//! serialised and later checked against the mapper's constraints; the
//! member tasks are analysed, mapped and launched collectively by the
//! triggerer/mapper/distributor helpers. The epoch completes only when
//! every member has completed, and commits only when every member has
//! committed.

use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::context::TaskContext;
use crate::error::{Error, ErrorKind};
use crate::event::UserEvent;
use crate::future::FutureMap;
use crate::mapper::MapDecision;
use crate::op::task::{TaskLauncher, TaskOp};
use crate::op::{OpCore, OpKind, Operation};
use crate::runtime::Runtime;
use crate::tracing_compat::{debug, warn};
use crate::types::DependenceKind;

/// Everything needed to launch a must-epoch.
#[derive(Clone)]
pub struct MustEpochLauncher {
    /// The member tasks.
    pub tasks: Vec<TaskLauncher>,
}

impl MustEpochLauncher {
    /// Creates an empty launcher.
    #[must_use]
    pub fn new() -> Self {
        Self { tasks: Vec::new() }
    }

    /// Adds a member task.
    #[must_use]
    pub fn with_task(mut self, task: TaskLauncher) -> Self {
        self.tasks.push(task);
        self
    }
}

impl Default for MustEpochLauncher {
    fn default() -> Self {
        Self::new()
    }
}

/// A cross-member dependence discovered during the epoch's analysis.
///
/// Recorded instead of serialised; checked against the mapping
/// constraints to detect unsatisfiable must-concurrent groups.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DependenceRecord {
    /// The earlier member's index in the epoch.
    pub op1_index: usize,
    /// The later member's index in the epoch.
    pub op2_index: usize,
    /// The region index on the earlier member.
    pub reg1_index: usize,
    /// The region index on the later member.
    pub reg2_index: usize,
    /// The dependence kind between the pair.
    pub dtype: DependenceKind,
}

#[derive(Default)]
struct EpochData {
    tasks: Vec<Arc<TaskOp>>,
    records: Vec<DependenceRecord>,
    result_map: Option<FutureMap>,
    ready_remaining: usize,
    ready_seen: Vec<bool>,
    execution_pending: bool,
    remaining_completes: usize,
    remaining_commits: usize,
    complete_requested: bool,
    commit_requested: bool,
    launch_gate: Option<UserEvent>,
}

/// The meta-operation coordinating a must-concurrent task group.
pub struct MustEpochOp {
    core: OpCore,
    state: Mutex<EpochData>,
}

impl MustEpochOp {
    pub(crate) fn new(runtime: &Arc<Runtime>) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let self_ref: Weak<dyn Operation> = weak.clone();
            Self {
                core: OpCore::new(Arc::clone(runtime), self_ref),
                state: Mutex::new(EpochData::default()),
            }
        })
    }

    fn lock(&self) -> MutexGuard<'_, EpochData> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn initialize(
        self: &Arc<Self>,
        ctx: &Arc<TaskContext>,
        launcher: &MustEpochLauncher,
    ) -> FutureMap {
        let count = launcher.tasks.len();
        let gate = UserEvent::new();

        // Members are created untracked: the epoch, not the context,
        // drives them through mapping and launch.
        let mut tasks = Vec::with_capacity(count);
        let mut futures = Vec::with_capacity(count);
        for task_launcher in &launcher.tasks {
            let task = ctx.create_epoch_task(task_launcher);
            futures.push(
                task.result()
                    .expect("freshly initialized task has a future"),
            );
            task.set_launch_gate(gate.event());
            tasks.push(task);
        }
        let result_map = FutureMap::from_futures(futures);

        {
            let mut data = self.lock();
            data.tasks = tasks;
            data.records.clear();
            data.result_map = Some(result_map.clone());
            data.ready_remaining = count;
            data.ready_seen = vec![false; count];
            data.execution_pending = false;
            data.remaining_completes = count;
            data.remaining_commits = count;
            data.complete_requested = false;
            data.commit_requested = false;
            data.launch_gate = Some(gate);
        }
        self.core.initialize_operation(ctx, true, 0);

        // The epoch link routes intra-epoch dependences into the record
        // list and member mapping through the epoch.
        let epoch_gen = self.core.generation();
        let tasks = self.lock().tasks.clone();
        for (index, task) in tasks.iter().enumerate() {
            task.core()
                .set_must_epoch(Arc::clone(self), epoch_gen, index);
        }
        result_map
    }

    /// Records an intra-epoch dependence instead of serialising it.
    pub(crate) fn record_dependence(
        &self,
        op1_index: usize,
        op2_index: usize,
        reg1_index: usize,
        reg2_index: usize,
        dtype: DependenceKind,
    ) {
        let record = DependenceRecord {
            op1_index,
            op2_index,
            reg1_index,
            reg2_index,
            dtype,
        };
        let mut data = self.lock();
        if !data.records.contains(&record) {
            debug!(?record, "intra-epoch dependence recorded");
            data.records.push(record);
        }
    }

    /// A member's mapping dependences have all resolved.
    pub(crate) fn notify_task_ready(&self, index: usize) {
        let launch = {
            let mut data = self.lock();
            if data.ready_seen.get(index).copied().unwrap_or(true) {
                return;
            }
            data.ready_seen[index] = true;
            data.ready_remaining -= 1;
            data.ready_remaining == 0 && data.execution_pending
        };
        if launch {
            self.core.schedule_execution();
        }
    }

    /// A member completed.
    pub(crate) fn notify_subop_complete(&self, _index: usize) {
        let fire = {
            let mut data = self.lock();
            data.remaining_completes = data.remaining_completes.saturating_sub(1);
            data.remaining_completes == 0 && data.complete_requested
        };
        if fire {
            self.core.complete_operation();
        }
    }

    /// A member committed.
    pub(crate) fn notify_subop_commit(&self, _index: usize) {
        let fire = {
            let mut data = self.lock();
            data.remaining_commits = data.remaining_commits.saturating_sub(1);
            data.remaining_commits == 0 && data.commit_requested
        };
        if fire {
            self.core.commit_operation();
        }
    }

    /// The epoch's recorded intra-member dependences.
    #[must_use]
    pub fn dependence_records(&self) -> Vec<DependenceRecord> {
        self.lock().records.clone()
    }

    fn fail_epoch(&self, error: &Error) {
        warn!(op = %self.core.unique_id(), %error, "must-epoch infeasible");
        let (tasks, result_map) = {
            let data = self.lock();
            (data.tasks.clone(), data.result_map.clone())
        };
        if let Some(map) = result_map {
            map.poison_all(error);
        }
        for task in &tasks {
            task.fail_epoch(error);
        }
        self.core.complete_execution();
    }

    fn proceed_with_epoch(&self) {
        let (tasks, records) = {
            let data = self.lock();
            (data.tasks.clone(), data.records.clone())
        };

        // Verify the records against the mapping constraints and map
        // every member, or fail the whole epoch.
        let ids: Vec<_> = tasks.iter().map(|t| t.core().unique_id()).collect();
        let decisions = match self
            .core
            .runtime()
            .mapper()
            .map_must_epoch(&ids, &records)
        {
            Ok(decisions) => decisions,
            Err(error) => {
                let error = error.with_op(self.core.unique_id());
                self.fail_epoch(&error);
                return;
            }
        };
        debug_assert_eq!(decisions.len(), tasks.len());

        let mapper = MustEpochMapper::new(self);
        if !mapper.map_tasks(&tasks, &decisions) {
            let error = Error::new(ErrorKind::MustEpochInfeasible)
                .with_op(self.core.unique_id())
                .with_context("member mapping failed");
            self.fail_epoch(&error);
            return;
        }

        let distributor = MustEpochDistributor::new(self);
        let gate = self.lock().launch_gate.clone();
        distributor.distribute_tasks(&tasks, gate);
        self.core.complete_execution();
    }
}

impl Operation for MustEpochOp {
    fn core(&self) -> &OpCore {
        &self.core
    }

    fn kind(&self) -> OpKind {
        OpKind::MustEpoch
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
    }

    fn trigger_dependence_analysis(&self) {
        self.core.begin_dependence_analysis();
        if !self.core.replay_trace_dependences() {
            let tasks = self.lock().tasks.clone();
            let triggerer = MustEpochTriggerer::new(self);
            triggerer.trigger_tasks(&tasks);
        }
        self.core.end_dependence_analysis();
    }

    fn trigger_execution(&self) {
        let wait = {
            let mut data = self.lock();
            if data.ready_remaining > 0 {
                data.execution_pending = true;
                true
            } else {
                data.execution_pending = false;
                false
            }
        };
        if !wait {
            self.proceed_with_epoch();
        }
    }

    fn trigger_complete(&self) {
        let fire = {
            let mut data = self.lock();
            data.complete_requested = true;
            data.remaining_completes == 0
        };
        if fire {
            self.core.complete_operation();
        }
    }

    fn trigger_commit(&self) {
        let fire = {
            let mut data = self.lock();
            data.commit_requested = true;
            data.remaining_commits == 0
        };
        if fire {
            self.core.commit_operation();
        }
    }
}

/// Runs the members' dependence analyses in parallel.
pub(crate) struct MustEpochTriggerer<'a> {
    owner: &'a MustEpochOp,
}

impl<'a> MustEpochTriggerer<'a> {
    fn new(owner: &'a MustEpochOp) -> Self {
        Self { owner }
    }

    fn trigger_tasks(&self, tasks: &[Arc<TaskOp>]) {
        // Scoped workers rather than the ready queue: the caller blocks
        // until every member's analysis is done, which must not starve
        // the analysis pool.
        debug!(
            epoch = %self.owner.core.unique_id(),
            members = tasks.len(),
            "triggering epoch members"
        );
        std::thread::scope(|scope| {
            for task in tasks {
                let task = Arc::clone(task);
                scope.spawn(move || task.trigger_dependence_analysis());
            }
        });
    }
}

/// Maps the members in parallel under a shared success flag.
pub(crate) struct MustEpochMapper<'a> {
    owner: &'a MustEpochOp,
}

impl<'a> MustEpochMapper<'a> {
    fn new(owner: &'a MustEpochOp) -> Self {
        Self { owner }
    }

    fn map_tasks(&self, tasks: &[Arc<TaskOp>], decisions: &[MapDecision]) -> bool {
        debug!(
            epoch = %self.owner.core.unique_id(),
            members = tasks.len(),
            "mapping epoch members"
        );
        let (done, joined) = mpsc::channel::<bool>();
        std::thread::scope(|scope| {
            for (task, decision) in tasks.iter().zip(decisions.iter().copied()) {
                let task = Arc::clone(task);
                let done = done.clone();
                scope.spawn(move || {
                    task.apply_epoch_decision(decision);
                    let _ = done.send(true);
                });
            }
        });
        drop(done);
        let mut success = true;
        let mut finished = 0;
        while let Ok(ok) = joined.recv() {
            success &= ok;
            finished += 1;
        }
        success && finished == tasks.len()
    }
}

/// Launches the members collectively once every one of them has mapped.
pub(crate) struct MustEpochDistributor<'a> {
    owner: &'a MustEpochOp,
}

impl<'a> MustEpochDistributor<'a> {
    fn new(owner: &'a MustEpochOp) -> Self {
        Self { owner }
    }

    fn distribute_tasks(&self, tasks: &[Arc<TaskOp>], gate: Option<UserEvent>) {
        // Opening the gate before enqueueing keeps the launches
        // collective: every execution job exists before any body runs.
        if let Some(gate) = gate {
            gate.trigger();
        }
        let runtime = self.owner.core.runtime();
        for task in tasks {
            let task = Arc::clone(task);
            runtime.defer(move || task.trigger_execution());
        }
    }
}
