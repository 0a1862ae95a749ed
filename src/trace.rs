//! Trace memoization of dependence analysis.
//!
//! A trace records the dependence graph of a fragment of the operation
//! stream during its first execution; once fixed, subsequent executions
//! of the same fragment replay the recorded edges verbatim instead of
//! walking the region tree. A [`TraceCaptureOp`] is injected at the end
//! of the first execution to fix the trace; a [`TraceCompleteOp`], a
//! fence derivative, ends each subsequent execution and becomes the
//! context's new current fence.
//!
//! Divergence (the next issued operation not matching the next trace
//! entry) is a caller error: the trace is abandoned with a warning and
//! live analysis resumes for the rest of the context.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use thiserror::Error as ThisError;

use crate::context::TaskContext;
use crate::op::{OpCore, OpHandle, OpKind, Operation};
use crate::runtime::Runtime;
use crate::tracing_compat::{debug, warn};
use crate::types::{DependenceKind, Generation, TraceId};

/// A recorded edge in positional form: the predecessor's index in the
/// trace plus the region information needed to re-issue it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TraceDependence {
    /// Index of the predecessor operation within the trace.
    pub prev_index: usize,
    /// The requirement index on the recording operation.
    pub source_idx: Option<usize>,
    /// The validated region index on the predecessor, when the edge came
    /// from region analysis.
    pub target_idx: Option<usize>,
    /// The dependence kind.
    pub dtype: DependenceKind,
    /// Whether the recording operation validates the predecessor region.
    pub validates: bool,
}

/// Why a replay diverged from the recorded stream.
#[derive(Debug, ThisError)]
pub enum TraceDivergence {
    /// More operations were issued than the trace recorded.
    #[error("operation {index} issued beyond the {recorded} recorded entries")]
    LengthExceeded {
        /// Index of the excess operation.
        index: usize,
        /// Number of recorded entries.
        recorded: usize,
    },
    /// An operation kind did not match the recorded entry.
    #[error("operation {index} is a {actual} but the trace recorded a {expected}")]
    KindMismatch {
        /// Index of the mismatched operation.
        index: usize,
        /// The recorded kind name.
        expected: &'static str,
        /// The issued kind name.
        actual: &'static str,
    },
}

struct TraceState {
    fixed: bool,
    tracing: bool,
    diverged: bool,
    kinds: Vec<OpKind>,
    /// The current execution's `(operation, generation)` sequence.
    operations: Vec<(OpHandle, Generation)>,
    /// Reverse lookup from `(operation, generation)` to trace index.
    op_map: HashMap<(usize, Generation), usize>,
    /// Positional edges per recorded operation.
    dependences: Vec<Vec<TraceDependence>>,
    replays: u64,
}

/// A memoized dependence graph for a fragment of the operation stream.
pub struct Trace {
    tid: TraceId,
    state: Mutex<TraceState>,
}

impl Trace {
    pub(crate) fn new(tid: TraceId) -> Arc<Self> {
        Arc::new(Self {
            tid,
            state: Mutex::new(TraceState {
                fixed: false,
                tracing: true,
                diverged: false,
                kinds: Vec::new(),
                operations: Vec::new(),
                op_map: HashMap::new(),
                dependences: Vec::new(),
                replays: 0,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, TraceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The user-chosen trace id.
    #[must_use]
    pub fn id(&self) -> TraceId {
        self.tid
    }

    /// True once capture has finished; the trace may then be replayed
    /// any number of times.
    #[must_use]
    pub fn is_fixed(&self) -> bool {
        self.lock().fixed
    }

    /// True only during the first execution of the trace.
    #[must_use]
    pub fn is_tracing(&self) -> bool {
        self.lock().tracing
    }

    /// True once a replay mismatch abandoned the trace.
    #[must_use]
    pub fn is_diverged(&self) -> bool {
        self.lock().diverged
    }

    /// Number of operations the capture recorded.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().kinds.len()
    }

    /// True when the capture recorded nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().kinds.is_empty()
    }

    /// Number of completed replays.
    #[must_use]
    pub fn replay_count(&self) -> u64 {
        self.lock().replays
    }

    /// Appends an operation during capture.
    pub(crate) fn register_operation(&self, op: &OpHandle, gen: Generation) {
        let mut state = self.lock();
        if !state.tracing || state.fixed {
            return;
        }
        let index = state.operations.len();
        state.kinds.push(op.kind());
        state.operations.push((op.clone(), gen));
        state.op_map.insert((op.ptr_id(), gen), index);
        state.dependences.push(Vec::new());
    }

    /// Records an edge during capture, in positional form.
    ///
    /// Edges with an endpoint outside the trace are not recorded; the
    /// boundary fences order those.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn record_dependence(
        &self,
        target: &OpHandle,
        target_gen: Generation,
        source: &OpHandle,
        source_gen: Generation,
        source_idx: Option<usize>,
        target_idx: Option<usize>,
        dtype: DependenceKind,
        validates: bool,
    ) {
        let mut state = self.lock();
        if !state.tracing || state.fixed {
            return;
        }
        let Some(&target_pos) = state.op_map.get(&(target.ptr_id(), target_gen)) else {
            return;
        };
        let Some(&source_pos) = state.op_map.get(&(source.ptr_id(), source_gen)) else {
            return;
        };
        if source_pos == target_pos {
            return;
        }
        let entry = TraceDependence {
            prev_index: target_pos,
            source_idx,
            target_idx,
            dtype,
            validates,
        };
        let edges = &mut state.dependences[source_pos];
        match edges
            .iter_mut()
            .find(|e| e.prev_index == target_pos && e.target_idx == target_idx)
        {
            Some(existing) => {
                if dtype > existing.dtype {
                    existing.dtype = dtype;
                }
                existing.validates |= validates;
            }
            None => edges.push(entry),
        }
    }

    /// Ends the capture: the trace becomes fixed and replayable.
    pub(crate) fn end_trace_capture(&self) {
        let mut state = self.lock();
        debug_assert!(state.tracing && !state.fixed);
        state.tracing = false;
        state.fixed = true;
        // The capture instances are done; replays rebuild the sequence.
        state.operations.clear();
        state.op_map.clear();
        debug!(trace = %self.tid, recorded = state.kinds.len(), "trace capture fixed");
    }

    /// Starts a replay execution.
    pub(crate) fn begin_replay(&self) {
        let mut state = self.lock();
        debug_assert!(state.fixed);
        state.diverged = false;
        state.operations.clear();
        state.op_map.clear();
    }

    /// Ends a replay execution.
    pub(crate) fn end_trace_execution(&self) {
        let mut state = self.lock();
        if !state.diverged && state.operations.len() != state.kinds.len() {
            warn!(
                trace = %self.tid,
                replayed = state.operations.len(),
                recorded = state.kinds.len(),
                "trace replay ended early"
            );
        }
        state.replays += 1;
        state.operations.clear();
        state.op_map.clear();
    }

    /// Registers an operation during replay and re-issues its recorded
    /// edges.
    ///
    /// Returns true when replay supplied the edges; false when the trace
    /// has diverged and the caller must fall back to live analysis.
    pub(crate) fn replay_operation(&self, op: &OpHandle, gen: Generation) -> bool {
        let edges = {
            let mut state = self.lock();
            if state.diverged || !state.fixed {
                return false;
            }
            let index = state.operations.len();
            let divergence = if index >= state.kinds.len() {
                Some(TraceDivergence::LengthExceeded {
                    index,
                    recorded: state.kinds.len(),
                })
            } else if state.kinds[index] != op.kind() {
                Some(TraceDivergence::KindMismatch {
                    index,
                    expected: state.kinds[index].name(),
                    actual: op.kind().name(),
                })
            } else {
                None
            };
            if let Some(divergence) = divergence {
                state.diverged = true;
                warn!(trace = %self.tid, %divergence, "trace diverged, reverting to live analysis");
                return false;
            }
            state.operations.push((op.clone(), gen));
            state.op_map.insert((op.ptr_id(), gen), index);

            // Resolve predecessors to this execution's instances before
            // releasing the trace lock; edge registration takes the
            // operations' own locks.
            state.dependences[index]
                .iter()
                .map(|dep| (state.operations[dep.prev_index].clone(), *dep))
                .collect::<Vec<_>>()
        };

        for ((target, target_gen), dep) in edges {
            match (dep.source_idx, dep.target_idx) {
                (Some(source_idx), Some(target_idx)) => {
                    op.core().register_region_dependence(
                        source_idx,
                        &target,
                        target_gen,
                        target_idx,
                        dep.dtype,
                        dep.validates,
                    );
                }
                _ => {
                    op.core().register_dependence(&target, target_gen);
                }
            }
        }
        true
    }
}

impl std::fmt::Debug for Trace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("Trace")
            .field("tid", &self.tid)
            .field("fixed", &state.fixed)
            .field("tracing", &state.tracing)
            .field("recorded", &state.kinds.len())
            .field("replays", &state.replays)
            .finish()
    }
}

/// Marker injected at the end of a capture; fixing the trace happens in
/// its dependence analysis, on the analysis thread.
pub struct TraceCaptureOp {
    core: OpCore,
    trace: Mutex<Option<Arc<Trace>>>,
}

impl TraceCaptureOp {
    pub(crate) fn new(runtime: &Arc<Runtime>) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let self_ref: Weak<dyn Operation> = weak.clone();
            Self {
                core: OpCore::new(Arc::clone(runtime), self_ref),
                trace: Mutex::new(None),
            }
        })
    }

    pub(crate) fn initialize(self: &Arc<Self>, ctx: &Arc<TaskContext>, trace: Arc<Trace>) {
        *self.trace.lock().unwrap_or_else(PoisonError::into_inner) = Some(trace);
        self.core.initialize_operation(ctx, true, 0);
    }
}

impl Operation for TraceCaptureOp {
    fn core(&self) -> &OpCore {
        &self.core
    }

    fn kind(&self) -> OpKind {
        OpKind::TraceCapture
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
    }

    fn trigger_dependence_analysis(&self) {
        self.core.begin_dependence_analysis();
        let trace = self
            .trace
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(trace) = trace {
            trace.end_trace_capture();
        }
        self.core.end_dependence_analysis();
    }
}

/// Fence derivative ending each replay: registers dependences on every
/// operation in the trace and becomes the context's new current fence.
pub struct TraceCompleteOp {
    core: OpCore,
    trace: Mutex<Option<Arc<Trace>>>,
}

impl TraceCompleteOp {
    pub(crate) fn new(runtime: &Arc<Runtime>) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let self_ref: Weak<dyn Operation> = weak.clone();
            Self {
                core: OpCore::new(Arc::clone(runtime), self_ref),
                trace: Mutex::new(None),
            }
        })
    }

    pub(crate) fn initialize(self: &Arc<Self>, ctx: &Arc<TaskContext>, trace: Arc<Trace>) {
        *self.trace.lock().unwrap_or_else(PoisonError::into_inner) = Some(trace);
        self.core.initialize_operation(ctx, true, 0);
    }
}

impl Operation for TraceCompleteOp {
    fn core(&self) -> &OpCore {
        &self.core
    }

    fn kind(&self) -> OpKind {
        OpKind::TraceComplete
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
    }

    fn trigger_dependence_analysis(&self) {
        self.core.begin_dependence_analysis();
        let trace = self
            .trace
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(trace) = trace {
            trace.end_trace_execution();
        }
        // Fence over the whole stream, then take over as current fence.
        if let Some(parent) = self.core.parent() {
            let handle = self.core.handle();
            for (op, gen) in parent.outstanding_ops() {
                if op.ptr_id() != handle.ptr_id() {
                    self.core.register_dependence(&op, gen);
                }
            }
            parent.update_current_fence(&handle, self.core.generation());
        }
        self.core.end_dependence_analysis();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::op::testing::ProbeOp;

    fn probe(rt: &Arc<Runtime>) -> (OpHandle, Generation) {
        let op = ProbeOp::new(rt);
        op.core().activate();
        let handle = op.core().handle();
        let gen = handle.generation();
        (handle, gen)
    }

    #[test]
    fn capture_records_operations_and_edges() {
        let rt = Runtime::new(RuntimeConfig::inline()).expect("runtime");
        let trace = Trace::new(TraceId::new(1));
        let (a, a_gen) = probe(&rt);
        let (b, b_gen) = probe(&rt);

        trace.register_operation(&a, a_gen);
        trace.register_operation(&b, b_gen);
        trace.record_dependence(&a, a_gen, &b, b_gen, Some(0), Some(0), DependenceKind::True, true);
        assert_eq!(trace.len(), 2);

        trace.end_trace_capture();
        assert!(trace.is_fixed());
        assert!(!trace.is_tracing());
    }

    #[test]
    fn duplicate_capture_edges_keep_strongest() {
        let rt = Runtime::new(RuntimeConfig::inline()).expect("runtime");
        let trace = Trace::new(TraceId::new(1));
        let (a, a_gen) = probe(&rt);
        let (b, b_gen) = probe(&rt);
        trace.register_operation(&a, a_gen);
        trace.register_operation(&b, b_gen);
        trace.record_dependence(&a, a_gen, &b, b_gen, Some(0), Some(0), DependenceKind::Anti, false);
        trace.record_dependence(&a, a_gen, &b, b_gen, Some(0), Some(0), DependenceKind::True, true);

        let state = trace.lock();
        assert_eq!(state.dependences[1].len(), 1);
        assert_eq!(state.dependences[1][0].dtype, DependenceKind::True);
        assert!(state.dependences[1][0].validates);
    }

    #[test]
    fn edges_outside_the_trace_are_ignored() {
        let rt = Runtime::new(RuntimeConfig::inline()).expect("runtime");
        let trace = Trace::new(TraceId::new(1));
        let (a, a_gen) = probe(&rt);
        let (outside, outside_gen) = probe(&rt);
        trace.register_operation(&a, a_gen);
        trace.record_dependence(
            &outside,
            outside_gen,
            &a,
            a_gen,
            Some(0),
            Some(0),
            DependenceKind::True,
            false,
        );
        assert!(trace.lock().dependences[0].is_empty());
    }

    #[test]
    fn replay_reissues_recorded_edges() {
        let rt = Runtime::new(RuntimeConfig::inline()).expect("runtime");
        let trace = Trace::new(TraceId::new(7));
        let (a, a_gen) = probe(&rt);
        let (b, b_gen) = probe(&rt);
        trace.register_operation(&a, a_gen);
        trace.register_operation(&b, b_gen);
        trace.record_dependence(&a, a_gen, &b, b_gen, Some(0), Some(0), DependenceKind::True, false);
        trace.end_trace_capture();

        trace.begin_replay();
        let (a2, a2_gen) = probe(&rt);
        let (b2, b2_gen) = probe(&rt);
        assert!(trace.replay_operation(&a2, a2_gen));

        b2.core().begin_dependence_analysis();
        assert!(trace.replay_operation(&b2, b2_gen));
        b2.core().end_dependence_analysis();

        // The replayed edge holds b2 until a2 maps.
        assert!(!b2.core().is_mapped());
        a2.core().complete_mapping();
        assert!(b2.core().is_mapped());

        trace.end_trace_execution();
        assert_eq!(trace.replay_count(), 1);
    }

    #[test]
    fn kind_mismatch_diverges_and_falls_back() {
        let rt = Runtime::new(RuntimeConfig::inline()).expect("runtime");
        let trace = Trace::new(TraceId::new(9));
        let (a, a_gen) = probe(&rt);
        trace.register_operation(&a, a_gen);
        trace.end_trace_capture();

        trace.begin_replay();
        let fence = crate::op::fence::FenceOp::new(&rt);
        fence.core().activate();
        let handle = fence.core().handle();
        // The trace recorded a probe (Fence kind comes from ProbeOp too),
        // so mismatch needs a different kind: use a task op.
        let task = crate::op::task::TaskOp::new(&rt);
        task.core().activate();
        let task_handle = task.core().handle();
        assert!(!trace.replay_operation(&task_handle, task_handle.generation()));
        assert!(trace.is_diverged());
        // Once diverged, even matching operations fall back to live
        // analysis.
        assert!(!trace.replay_operation(&handle, handle.generation()));
    }

    #[test]
    fn length_exceeded_diverges() {
        let rt = Runtime::new(RuntimeConfig::inline()).expect("runtime");
        let trace = Trace::new(TraceId::new(3));
        trace.end_trace_capture();
        trace.begin_replay();
        let (a, a_gen) = probe(&rt);
        assert!(!trace.replay_operation(&a, a_gen));
        assert!(trace.is_diverged());
    }
}
