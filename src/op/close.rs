//! Runtime-inserted close operations.
//!
//! Closes flush the region tree. An intermediate close is injected when
//! a later operation needs access incompatible with the currently open
//! children; a post close is emitted when a mapped region is given back
//! so its instance is flushed to the parent. Both are ordinary members
//! of the dependence graph and run the standard lifecycle.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::context::TaskContext;
use crate::forest::RegionUser;
use crate::op::inline::MappedRegion;
use crate::op::{OpCore, OpHandle, OpKind, Operation};
use crate::runtime::Runtime;
use crate::types::{Generation, RegionHandle, RegionRequirement};

#[derive(Default)]
struct InterCloseData {
    requirement: Option<RegionRequirement>,
    target_children: BTreeSet<RegionHandle>,
    leave_open: bool,
    /// The operation the close was issued for; edges back onto it are
    /// suppressed.
    create_op: Option<(OpHandle, Generation)>,
}

/// An intermediate close, issued while a context is still running.
pub struct InterCloseOp {
    core: OpCore,
    state: Mutex<InterCloseData>,
}

impl InterCloseOp {
    pub(crate) fn new(runtime: &Arc<Runtime>) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let self_ref: Weak<dyn Operation> = weak.clone();
            Self {
                core: OpCore::new(Arc::clone(runtime), self_ref),
                state: Mutex::new(InterCloseData::default()),
            }
        })
    }

    fn lock(&self) -> MutexGuard<'_, InterCloseData> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn initialize(
        self: &Arc<Self>,
        ctx: &Arc<TaskContext>,
        requirement: RegionRequirement,
        target_children: BTreeSet<RegionHandle>,
        leave_open: bool,
        create_op: (OpHandle, Generation),
    ) {
        {
            let mut data = self.lock();
            data.requirement = Some(requirement);
            data.target_children = target_children;
            data.leave_open = leave_open;
            data.create_op = Some(create_op);
        }
        self.core.initialize_operation(ctx, true, 1);
    }

    /// The children this close flushes.
    #[must_use]
    pub fn target_children(&self) -> BTreeSet<RegionHandle> {
        self.lock().target_children.clone()
    }

    /// Whether the flushed children remain open for reading.
    #[must_use]
    pub fn leave_open(&self) -> bool {
        self.lock().leave_open
    }
}

impl Operation for InterCloseOp {
    fn core(&self) -> &OpCore {
        &self.core
    }

    fn kind(&self) -> OpKind {
        OpKind::InterClose
    }

    fn is_close_op(&self) -> bool {
        true
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
    }

    fn trigger_dependence_analysis(&self) {
        self.core.begin_dependence_analysis();
        let (requirement, children, leave_open, create_op) = {
            let data = self.lock();
            (
                data.requirement.clone(),
                data.target_children.clone(),
                data.leave_open,
                data.create_op.clone(),
            )
        };
        if let Some(requirement) = requirement {
            let forest = Arc::clone(self.core.runtime().forest());
            let user = RegionUser {
                op: self.core.handle(),
                gen: self.core.generation(),
                req_index: 0,
                requirement,
            };
            for prior in forest.apply_close(user, &children, leave_open) {
                if let Some((creator, creator_gen)) = &create_op {
                    if prior.op == *creator && prior.gen == *creator_gen {
                        continue;
                    }
                }
                self.core.register_region_dependence(
                    0,
                    &prior.op,
                    prior.gen,
                    prior.req_index,
                    prior.dtype,
                    prior.validates,
                );
            }
        }
        self.core.end_dependence_analysis();
    }

    fn trigger_execution(&self) {
        // The flush happens once the flushed producers are done.
        let precondition = self.core.execution_precondition();
        if precondition.has_triggered() {
            self.core.complete_execution();
        } else {
            let handle = self.core.handle();
            let runtime = Arc::clone(self.core.runtime());
            precondition.subscribe(move || {
                runtime.defer(move || handle.core().complete_execution());
            });
        }
    }
}

#[derive(Default)]
struct PostCloseData {
    requirement: Option<RegionRequirement>,
    parent_index: usize,
}

/// A close emitted when a mapped instance is handed back, flushing it to
/// the parent region.
pub struct PostCloseOp {
    core: OpCore,
    state: Mutex<PostCloseData>,
}

impl PostCloseOp {
    pub(crate) fn new(runtime: &Arc<Runtime>) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let self_ref: Weak<dyn Operation> = weak.clone();
            Self {
                core: OpCore::new(Arc::clone(runtime), self_ref),
                state: Mutex::new(PostCloseData::default()),
            }
        })
    }

    fn lock(&self) -> MutexGuard<'_, PostCloseData> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn initialize(
        self: &Arc<Self>,
        ctx: &Arc<TaskContext>,
        parent_index: usize,
        reference: &MappedRegion,
    ) {
        {
            let mut data = self.lock();
            data.requirement = Some(reference.requirement().localized());
            data.parent_index = parent_index;
        }
        self.core.initialize_operation(ctx, true, 1);
    }
}

impl Operation for PostCloseOp {
    fn core(&self) -> &OpCore {
        &self.core
    }

    fn kind(&self) -> OpKind {
        OpKind::PostClose
    }

    fn is_close_op(&self) -> bool {
        true
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
    }

    fn find_parent_index(&self, _idx: usize) -> usize {
        self.lock().parent_index
    }

    fn trigger_dependence_analysis(&self) {
        self.core.begin_dependence_analysis();
        if !self.core.replay_trace_dependences() {
            let requirement = self.lock().requirement.clone();
            if let Some(requirement) = requirement {
                self.core.analyze_region_requirement(0, &requirement, None);
            }
        }
        self.core.end_dependence_analysis();
    }

    fn trigger_execution(&self) {
        let precondition = self.core.execution_precondition();
        if precondition.has_triggered() {
            self.core.complete_execution();
        } else {
            let handle = self.core.handle();
            let runtime = Arc::clone(self.core.runtime());
            precondition.subscribe(move || {
                runtime.defer(move || handle.core().complete_execution());
            });
        }
    }
}
