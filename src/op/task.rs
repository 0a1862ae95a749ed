//! Task launch operations.
//!
//! A task is the application-visible unit of work: a body with a set of
//! region requirements, optionally predicated. Tasks go through the
//! standard pipeline; inside a must-epoch the epoch coordinates their
//! mapping and launch instead of the task driving itself.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::context::TaskContext;
use crate::error::Error;
use crate::event::Event;
use crate::future::FutureValue;
use crate::mapper::{MapDecision, MapRequest};
use crate::op::predicate::{Predicate, PredicateWaiter};
use crate::op::speculative::{self, SpecCore, Speculative};
use crate::op::{OpCore, OpKind, Operation};
use crate::runtime::Runtime;
use crate::types::{Generation, ProcessorId, RegionRequirement};

/// The body a task runs when it executes; its bytes complete the task's
/// future.
pub type TaskBody = Arc<dyn Fn() -> Vec<u8> + Send + Sync>;

/// Everything needed to launch a task.
#[derive(Clone)]
pub struct TaskLauncher {
    /// A user-chosen task function id, for logging and mapping.
    pub task_id: u64,
    /// The regions the task accesses.
    pub regions: Vec<RegionRequirement>,
    /// The task's predicate.
    pub predicate: Predicate,
    /// The body run at execution; `None` completes with no payload.
    pub body: Option<TaskBody>,
}

impl TaskLauncher {
    /// Creates a launcher for a task function with no regions.
    #[must_use]
    pub fn new(task_id: u64) -> Self {
        Self {
            task_id,
            regions: Vec::new(),
            predicate: Predicate::TRUE,
            body: None,
        }
    }

    /// Adds a region requirement.
    #[must_use]
    pub fn with_region(mut self, requirement: RegionRequirement) -> Self {
        self.regions.push(requirement);
        self
    }

    /// Sets the predicate.
    #[must_use]
    pub fn with_predicate(mut self, predicate: Predicate) -> Self {
        self.predicate = predicate;
        self
    }

    /// Sets the body.
    #[must_use]
    pub fn with_body(mut self, body: impl Fn() -> Vec<u8> + Send + Sync + 'static) -> Self {
        self.body = Some(Arc::new(body));
        self
    }
}

#[derive(Default)]
struct TaskData {
    task_id: u64,
    regions: Vec<RegionRequirement>,
    body: Option<TaskBody>,
    future: Option<FutureValue>,
    decisions: Vec<MapDecision>,
    /// Set for epoch members: execution waits on the collective launch.
    launch_gate: Option<Event>,
}

/// A single task launch.
pub struct TaskOp {
    core: OpCore,
    spec: SpecCore,
    state: Mutex<TaskData>,
}

impl TaskOp {
    pub(crate) fn new(runtime: &Arc<Runtime>) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let self_ref: Weak<dyn Operation> = weak.clone();
            Self {
                core: OpCore::new(Arc::clone(runtime), self_ref),
                spec: SpecCore::new(),
                state: Mutex::new(TaskData::default()),
            }
        })
    }

    fn lock(&self) -> MutexGuard<'_, TaskData> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn arc_self(&self) -> Arc<Self> {
        self.core
            .handle()
            .into_arc()
            .as_any_arc()
            .downcast::<Self>()
            .expect("task op type")
    }

    /// Wires the launcher into the operation and returns the result
    /// future. `track` is false for must-epoch members, which the epoch
    /// drives through mapping and launch.
    pub(crate) fn initialize(
        self: &Arc<Self>,
        ctx: &Arc<TaskContext>,
        launcher: &TaskLauncher,
        track: bool,
    ) -> FutureValue {
        let future = FutureValue::new();
        {
            let mut data = self.lock();
            data.task_id = launcher.task_id;
            data.regions = launcher.regions.clone();
            data.body = launcher.body.clone();
            data.future = Some(future.clone());
            data.decisions.clear();
            data.launch_gate = None;
        }
        speculative::initialize_speculation(
            self,
            ctx,
            track,
            launcher.regions.len(),
            &launcher.predicate,
        );
        future
    }

    /// The task's result future.
    #[must_use]
    pub fn result(&self) -> Option<FutureValue> {
        self.lock().future.clone()
    }

    /// Blocks until the task's predicate resolves and returns its value.
    #[must_use]
    pub fn predicate_value(&self, proc: ProcessorId) -> bool {
        speculative::get_predicate_value(self, proc)
    }

    fn check_privileges(&self, ctx: &Arc<TaskContext>) -> Result<(), Error> {
        let regions = self.lock().regions.clone();
        for (index, requirement) in regions.iter().enumerate() {
            ctx.check_region_privilege(requirement)
                .map_err(|e| e.with_op(self.core.unique_id()).with_context(format!(
                    "task region requirement {index}"
                )))?;
        }
        Ok(())
    }

    fn run_body(&self) {
        let (body, future, gate) = {
            let data = self.lock();
            (data.body.clone(), data.future.clone(), data.launch_gate.clone())
        };
        debug_assert!(gate.is_none() || gate.as_ref().is_some_and(Event::has_triggered));
        let payload = body.map_or_else(Vec::new, |body| body());
        if let Some(future) = future {
            future.complete(payload);
        }
        self.core.complete_execution();
    }

    // ── Must-epoch hooks ─────────────────────────────────────────────

    /// Applies the epoch-chosen mapping decision and completes mapping.
    pub(crate) fn apply_epoch_decision(&self, decision: MapDecision) {
        {
            let mut data = self.lock();
            let count = data.regions.len().max(1);
            data.decisions = vec![decision; count];
        }
        self.core.resolve_speculation();
        self.core.complete_mapping();
    }

    /// Installs the collective launch gate before execution.
    pub(crate) fn set_launch_gate(&self, gate: Event) {
        self.lock().launch_gate = Some(gate);
    }

    /// Completes the task as a no-op after its epoch failed.
    pub(crate) fn fail_epoch(&self, error: &Error) {
        if let Some(future) = self.lock().future.clone() {
            future.poison(error.clone());
        }
        self.core.resolve_speculation();
        self.core.complete_as_noop();
    }
}

impl Operation for TaskOp {
    fn core(&self) -> &OpCore {
        &self.core
    }

    fn kind(&self) -> OpKind {
        OpKind::Task
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
    }

    fn trigger_dependence_analysis(&self) {
        self.core.begin_dependence_analysis();
        if !self.core.replay_trace_dependences() {
            if let Some(ctx) = self.core.parent() {
                if let Err(error) = self.check_privileges(&ctx) {
                    ctx.record_error(error);
                } else {
                    speculative::register_predicate_dependence(self);
                    let regions = self.lock().regions.clone();
                    for (index, requirement) in regions.iter().enumerate() {
                        self.core
                            .analyze_region_requirement(index, requirement, None);
                    }
                }
            }
        }
        self.core.end_dependence_analysis();
    }

    fn trigger_mapping(&self) {
        if let Some(link) = self.core.must_epoch_link() {
            link.epoch.notify_task_ready(link.index);
            return;
        }
        speculative::trigger_mapping(&self.arc_self());
    }

    fn trigger_resolution(&self) {
        speculative::trigger_resolution(self);
    }

    fn trigger_execution(&self) {
        // Wait for the collective launch gate (epoch members) and the
        // execution preconditions (upstream completions) before the body
        // runs.
        let gate = self.lock().launch_gate.clone();
        let precondition = self.core.execution_precondition();
        let pending = [gate, Some(precondition)]
            .into_iter()
            .flatten()
            .find(|event| !event.has_triggered());
        match pending {
            Some(event) => {
                let handle = self.core.handle();
                let runtime = Arc::clone(self.core.runtime());
                event.subscribe(move || {
                    runtime.defer(move || handle.trigger_execution());
                });
            }
            None => self.run_body(),
        }
    }
}

impl Speculative for TaskOp {
    fn spec_core(&self) -> &SpecCore {
        &self.spec
    }

    fn speculate(&self) -> Option<bool> {
        let runtime = self.core.runtime();
        runtime
            .mapper()
            .speculate(self.core.unique_id(), OpKind::Task)
    }

    fn resolve_true(&self) {
        // Map every region requirement, then launch.
        let regions = self.lock().regions.clone();
        let mapper = Arc::clone(self.core.runtime().mapper());
        let mut decisions = Vec::with_capacity(regions.len());
        for (index, requirement) in regions.iter().enumerate() {
            decisions.push(mapper.map_operation(&MapRequest {
                op: self.core.unique_id(),
                kind: OpKind::Task,
                req_index: index,
                requirement,
            }));
        }
        self.lock().decisions = decisions;
        self.core.complete_mapping();
        self.core.schedule_execution();
    }

    fn resolve_false(&self) {
        if let Some(future) = self.lock().future.clone() {
            future.complete_empty();
        }
        self.core.complete_as_noop();
    }
}

impl PredicateWaiter for TaskOp {
    fn notify_predicate_value(&self, gen: Generation, value: bool) {
        speculative::notify_predicate_value(&self.arc_self(), gen, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::error::ErrorKind;
    use crate::types::{CoherenceMode, FieldId, PrivilegeMode};

    fn setup() -> (Arc<Runtime>, Arc<TaskContext>) {
        let rt = Runtime::new(RuntimeConfig::inline()).expect("runtime");
        let ctx = rt.create_context("tasks");
        (rt, ctx)
    }

    #[test]
    fn task_without_regions_completes() {
        let (_rt, ctx) = setup();
        let future = ctx
            .issue_task(TaskLauncher::new(1).with_body(|| vec![7]))
            .expect("issue");
        assert_eq!(future.get().expect("result"), vec![7]);
    }

    #[test]
    fn task_with_region_maps_and_completes() {
        let (_rt, ctx) = setup();
        let field = FieldId::new(0);
        let region = ctx.create_region(&[field]);
        let launcher = TaskLauncher::new(2).with_region(RegionRequirement::new(
            region,
            region,
            [field],
            PrivilegeMode::ReadWrite,
            CoherenceMode::Exclusive,
        ));
        let future = ctx.issue_task(launcher).expect("issue");
        future.get().expect("result");
    }

    #[test]
    fn predicate_false_task_completes_empty() {
        let (_rt, ctx) = setup();
        let launcher = TaskLauncher::new(3)
            .with_predicate(Predicate::FALSE)
            .with_body(|| vec![1, 2, 3]);
        let future = ctx.issue_task(launcher).expect("issue");
        // The body must not run on the false path.
        assert_eq!(future.get().expect("result"), Vec::<u8>::new());
    }

    #[test]
    fn unknown_region_is_a_privilege_error() {
        let (_rt, ctx) = setup();
        let bogus = crate::types::RegionHandle::new_for_test(999);
        let launcher = TaskLauncher::new(4).with_region(RegionRequirement::new(
            bogus,
            bogus,
            [FieldId::new(0)],
            PrivilegeMode::ReadOnly,
            CoherenceMode::Exclusive,
        ));
        let _ = ctx.issue_task(launcher);
        let error = ctx.take_error().expect("privilege error recorded");
        assert_eq!(error.kind(), ErrorKind::PrivilegeViolation);
    }
}
