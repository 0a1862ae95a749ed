//! Fence and frame operations.
//!
//! A fence orders a context's operation stream: a mapping fence keeps
//! later operations from mapping before everything earlier has mapped,
//! an execution fence additionally waits for the completion events of
//! everything earlier, and a mixed fence does both. A frame is an
//! execution-fence derivative applications use to bound the amount of
//! outstanding work in a context.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::event::Event;
use crate::op::{OpCore, OpKind, Operation};
use crate::runtime::Runtime;

/// Which guarantee a fence enforces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FenceKind {
    /// Later operations may not map before earlier ones have mapped.
    #[default]
    Mapping,
    /// The fence does not complete before earlier operations complete.
    Execution,
    /// Both guarantees.
    Mixed,
}

#[derive(Default)]
struct FenceData {
    kind: FenceKind,
    previous_completions: Vec<Event>,
}

/// A fence over the parent context's operation stream.
pub struct FenceOp {
    core: OpCore,
    state: Mutex<FenceData>,
}

impl FenceOp {
    pub(crate) fn new(runtime: &Arc<Runtime>) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let self_ref: Weak<dyn Operation> = weak.clone();
            Self {
                core: OpCore::new(Arc::clone(runtime), self_ref),
                state: Mutex::new(FenceData::default()),
            }
        })
    }

    fn lock(&self) -> MutexGuard<'_, FenceData> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn initialize(
        self: &Arc<Self>,
        ctx: &Arc<crate::context::TaskContext>,
        kind: FenceKind,
    ) {
        {
            let mut data = self.lock();
            data.kind = kind;
            data.previous_completions.clear();
        }
        self.core.initialize_operation(ctx, true, 0);
    }

    /// The fence kind.
    #[must_use]
    pub fn fence_kind(&self) -> FenceKind {
        self.lock().kind
    }

    /// Registers dependences on every outstanding operation in the
    /// context and becomes the context's current fence. Shared with the
    /// trace-completion fence.
    pub(crate) fn perform_fence_analysis(&self) {
        let Some(parent) = self.core.parent() else {
            return;
        };
        let handle = self.core.handle();
        let mut completions = Vec::new();
        for (op, gen) in parent.outstanding_ops() {
            if op.ptr_id() == handle.ptr_id() {
                continue;
            }
            let pruned = self.core.register_dependence(&op, gen);
            if !pruned {
                completions.push(op.core().completion_event());
            }
        }
        self.lock().previous_completions = completions;
        parent.update_current_fence(&handle, self.core.generation());
    }
}

impl Operation for FenceOp {
    fn core(&self) -> &OpCore {
        &self.core
    }

    fn kind(&self) -> OpKind {
        OpKind::Fence
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
    }

    fn trigger_dependence_analysis(&self) {
        self.core.begin_dependence_analysis();
        if !self.core.replay_trace_dependences() {
            self.perform_fence_analysis();
        } else if let Some(parent) = self.core.parent() {
            // Replayed fences still reset the context's fence point.
            parent.update_current_fence(&self.core.handle(), self.core.generation());
        }
        self.core.end_dependence_analysis();
    }

    fn trigger_execution(&self) {
        let (kind, completions) = {
            let data = self.lock();
            (data.kind, data.previous_completions.clone())
        };
        match kind {
            FenceKind::Mapping => self.core.complete_execution(),
            FenceKind::Execution | FenceKind::Mixed => {
                let merged = Event::merge(completions);
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
    }
}

/// A frame marker: an execution fence applications use to bound the
/// number of outstanding frames in flight.
pub struct FrameOp {
    core: OpCore,
    state: Mutex<FenceData>,
}

impl FrameOp {
    pub(crate) fn new(runtime: &Arc<Runtime>) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let self_ref: Weak<dyn Operation> = weak.clone();
            Self {
                core: OpCore::new(Arc::clone(runtime), self_ref),
                state: Mutex::new(FenceData {
                    kind: FenceKind::Execution,
                    previous_completions: Vec::new(),
                }),
            }
        })
    }

    fn lock(&self) -> MutexGuard<'_, FenceData> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn initialize(self: &Arc<Self>, ctx: &Arc<crate::context::TaskContext>) {
        self.lock().previous_completions.clear();
        self.core.initialize_operation(ctx, true, 0);
        ctx.on_frame_issued();
    }
}

impl Operation for FrameOp {
    fn core(&self) -> &OpCore {
        &self.core
    }

    fn kind(&self) -> OpKind {
        OpKind::Frame
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
    }

    fn trigger_dependence_analysis(&self) {
        self.core.begin_dependence_analysis();
        if !self.core.replay_trace_dependences() {
            let Some(parent) = self.core.parent() else {
                self.core.end_dependence_analysis();
                return;
            };
            let handle = self.core.handle();
            let mut completions = Vec::new();
            for (op, gen) in parent.outstanding_ops() {
                if op.ptr_id() == handle.ptr_id() {
                    continue;
                }
                if !self.core.register_dependence(&op, gen) {
                    completions.push(op.core().completion_event());
                }
            }
            self.lock().previous_completions = completions;
        }
        self.core.end_dependence_analysis();
    }

    fn trigger_execution(&self) {
        let completions = self.lock().previous_completions.clone();
        let merged = Event::merge(completions);
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

    fn trigger_complete(&self) {
        if let Some(parent) = self.core.parent() {
            parent.on_frame_completed();
        }
        self.core.complete_operation();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;

    #[test]
    fn fence_kind_default_is_mapping() {
        assert_eq!(FenceKind::default(), FenceKind::Mapping);
    }

    #[test]
    fn fence_on_empty_context_completes() {
        let rt = Runtime::new(RuntimeConfig::inline()).expect("runtime");
        let ctx = rt.create_context("fence");
        let done = ctx.issue_fence(FenceKind::Mixed);
        assert!(done.has_triggered());
    }

    #[test]
    fn frame_counters_balance() {
        let rt = Runtime::new(RuntimeConfig::inline()).expect("runtime");
        let ctx = rt.create_context("frames");
        let done = ctx.issue_frame();
        assert!(done.has_triggered());
        assert_eq!(ctx.outstanding_frames(), 0);
    }
}
