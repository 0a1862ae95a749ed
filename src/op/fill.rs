//! Fill operations.
//!
//! A fill writes a constant over the fields of a logical region. The
//! constant is either an immediate byte buffer or a future value. Fills
//! are speculative, and their speculation hook always guesses `true`: a
//! fill can be elided safely when its predicate turns out false.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::context::TaskContext;
use crate::error::Error;
use crate::event::Event;
use crate::future::FutureValue;
use crate::mapper::MapRequest;
use crate::op::predicate::{Predicate, PredicateWaiter};
use crate::op::speculative::{self, SpecCore, Speculative};
use crate::op::{OpCore, OpKind, Operation};
use crate::runtime::Runtime;
use crate::types::{Generation, RegionRequirement};

/// The value a fill writes.
#[derive(Clone, Debug)]
pub enum FillValue {
    /// An immediate byte buffer.
    Immediate(Vec<u8>),
    /// A future resolved before the fill executes.
    Future(FutureValue),
}

/// Everything needed to launch a fill.
#[derive(Clone, Debug)]
pub struct FillLauncher {
    /// The requirement written; must carry a write privilege.
    pub requirement: RegionRequirement,
    /// The value written.
    pub value: FillValue,
    /// The fill's predicate.
    pub predicate: Predicate,
}

impl FillLauncher {
    /// Creates a launcher writing immediate bytes.
    #[must_use]
    pub fn new(requirement: RegionRequirement, value: impl Into<Vec<u8>>) -> Self {
        Self {
            requirement,
            value: FillValue::Immediate(value.into()),
            predicate: Predicate::TRUE,
        }
    }

    /// Creates a launcher writing a future's payload.
    #[must_use]
    pub fn from_future(requirement: RegionRequirement, future: FutureValue) -> Self {
        Self {
            requirement,
            value: FillValue::Future(future),
            predicate: Predicate::TRUE,
        }
    }

    /// Sets the predicate.
    #[must_use]
    pub fn with_predicate(mut self, predicate: Predicate) -> Self {
        self.predicate = predicate;
        self
    }
}

#[derive(Default)]
struct FillData {
    requirement: Option<RegionRequirement>,
    value: Option<FillValue>,
}

/// A constant fill over a logical region.
pub struct FillOp {
    core: OpCore,
    spec: SpecCore,
    state: Mutex<FillData>,
}

impl FillOp {
    pub(crate) fn new(runtime: &Arc<Runtime>) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let self_ref: Weak<dyn Operation> = weak.clone();
            Self {
                core: OpCore::new(Arc::clone(runtime), self_ref),
                spec: SpecCore::new(),
                state: Mutex::new(FillData::default()),
            }
        })
    }

    fn lock(&self) -> MutexGuard<'_, FillData> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn arc_self(&self) -> Arc<Self> {
        self.core
            .handle()
            .into_arc()
            .as_any_arc()
            .downcast::<Self>()
            .expect("fill op type")
    }

    pub(crate) fn initialize(
        self: &Arc<Self>,
        ctx: &Arc<TaskContext>,
        launcher: &FillLauncher,
    ) -> Event {
        {
            let mut data = self.lock();
            data.requirement = Some(launcher.requirement.clone());
            data.value = Some(launcher.value.clone());
        }
        speculative::initialize_speculation(self, ctx, true, 1, &launcher.predicate);
        self.core.completion_event()
    }

    fn check_privileges(&self, ctx: &Arc<TaskContext>) -> Result<(), Error> {
        let requirement = self.lock().requirement.clone();
        let Some(requirement) = requirement else {
            return Ok(());
        };
        if !requirement.privilege.is_write() {
            return Err(Error::new(crate::error::ErrorKind::PrivilegeViolation)
                .with_op(self.core.unique_id())
                .with_context("fill requirement must be writable"));
        }
        ctx.check_region_privilege(&requirement)
            .map_err(|e| e.with_op(self.core.unique_id()))
    }
}

impl Operation for FillOp {
    fn core(&self) -> &OpCore {
        &self.core
    }

    fn kind(&self) -> OpKind {
        OpKind::Fill
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
    }

    fn trigger_dependence_analysis(&self) {
        self.core.begin_dependence_analysis();
        if !self.core.replay_trace_dependences() {
            if let Some(ctx) = self.core.parent() {
                match self.check_privileges(&ctx) {
                    Ok(()) => {
                        speculative::register_predicate_dependence(self);
                        let requirement = self.lock().requirement.clone();
                        if let Some(requirement) = requirement {
                            self.core.analyze_region_requirement(0, &requirement, None);
                        }
                    }
                    Err(error) => ctx.record_error(error),
                }
            }
        }
        self.core.end_dependence_analysis();
    }

    fn trigger_mapping(&self) {
        speculative::trigger_mapping(&self.arc_self());
    }

    fn trigger_resolution(&self) {
        speculative::trigger_resolution(self);
    }

    fn trigger_execution(&self) {
        let value = self.lock().value.clone();
        let mut pending = vec![self.core.execution_precondition()];
        if let Some(FillValue::Future(future)) = value {
            // The fill byte pattern arrives with the future.
            pending.push(future.ready_event());
        }
        let merged = Event::merge(pending);
        if merged.has_triggered() {
            self.core.complete_execution();
        } else {
            let handle = self.core.handle();
            let runtime = Arc::clone(self.core.runtime());
            merged.subscribe(move || {
                runtime.defer(move || handle.core().complete_execution());
            });
        }
    }
}

impl Speculative for FillOp {
    fn spec_core(&self) -> &SpecCore {
        &self.spec
    }

    /// A fill can always be elided on predicate-false, so speculation is
    /// always safe.
    fn speculate(&self) -> Option<bool> {
        Some(true)
    }

    fn resolve_true(&self) {
        let requirement = self.lock().requirement.clone();
        if let Some(requirement) = requirement {
            let _ = self.core.runtime().mapper().map_operation(&MapRequest {
                op: self.core.unique_id(),
                kind: OpKind::Fill,
                req_index: 0,
                requirement: &requirement,
            });
        }
        self.core.complete_mapping();
        self.core.schedule_execution();
    }

    fn resolve_false(&self) {
        self.core.complete_as_noop();
    }
}

impl PredicateWaiter for FillOp {
    fn notify_predicate_value(&self, gen: Generation, value: bool) {
        speculative::notify_predicate_value(&self.arc_self(), gen, value);
    }
}
