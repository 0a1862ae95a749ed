//! The task context: the issuing surface of the pipeline.
//!
//! A context owns the operations it issues: it appends them to the
//! stream in program order, drives their dependence analysis on the
//! issuing thread, holds a mapping reference on each until it completes,
//! tracks the current fence and the current trace, and recycles
//! committed operations through per-kind free-lists.
//!
//! Fatal errors (privilege violations, aliased requirements) are
//! recorded against the context; once failed, the context refuses
//! further issues.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use crate::error::{Error, ErrorKind, Result};
use crate::event::Event;
use crate::forest::{
    CloseRequest, DependentPartitionKind, PartitionComputation,
};
use crate::future::{FutureMap, FutureValue};
use crate::op::attach::{AttachLauncher, AttachOp, DetachOp};
use crate::op::close::{InterCloseOp, PostCloseOp};
use crate::op::coherence::{AcquireOp, CoherenceLauncher, ReleaseOp};
use crate::op::collective::{DynamicCollective, DynamicCollectiveOp};
use crate::op::copy::{CopyLauncher, CopyOp};
use crate::op::deletion::{DeletionKind, DeletionOp};
use crate::op::fence::{FenceKind, FenceOp, FrameOp};
use crate::op::fill::{FillLauncher, FillOp};
use crate::op::inline::{InlineLauncher, MapOp, MappedRegion};
use crate::op::must_epoch::{MustEpochLauncher, MustEpochOp};
use crate::op::partition::{DependentPartitionOp, PendingPartitionOp, PendingPartitionThunk};
use crate::op::predicate::{
    AndPredOp, FuturePredOp, NotPredOp, OrPredOp, Predicate, PredicateRef,
};
use crate::op::task::{TaskLauncher, TaskOp};
use crate::op::{OpHandle, OpKind, Operation};
use crate::runtime::Runtime;
use crate::trace::{Trace, TraceCaptureOp, TraceCompleteOp};
use crate::tracing_compat::{debug, trace};
use crate::types::{
    CoherenceMode, FieldId, Generation, PartitionHandle, PrivilegeMode, RegionHandle,
    RegionRequirement, TraceId,
};

struct CtxState {
    /// Outstanding (uncommitted) tracked operations in issue order.
    stream: Vec<(OpHandle, Generation)>,
    current_fence: Option<(OpHandle, Generation)>,
    current_trace: Option<Arc<Trace>>,
    traces: HashMap<TraceId, Arc<Trace>>,
    free_lists: HashMap<OpKind, Vec<OpHandle>>,
    /// Regions this context created and therefore holds privileges for.
    regions: HashMap<RegionHandle, BTreeSet<FieldId>>,
    error: Option<Error>,
    outstanding_frames: usize,
}

/// The enclosing context operations are issued from.
pub struct TaskContext {
    runtime: Arc<Runtime>,
    name: String,
    state: Mutex<CtxState>,
    quiescence: Condvar,
}

impl TaskContext {
    pub(crate) fn new(runtime: Arc<Runtime>, name: String) -> Arc<Self> {
        debug!(context = %name, "context created");
        Arc::new(Self {
            runtime,
            name,
            state: Mutex::new(CtxState {
                stream: Vec::new(),
                current_fence: None,
                current_trace: None,
                traces: HashMap::new(),
                free_lists: HashMap::new(),
                regions: HashMap::new(),
                error: None,
                outstanding_frames: 0,
            }),
            quiescence: Condvar::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, CtxState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The owning runtime.
    #[must_use]
    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    /// The context's name, for logging.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The event for when this context's children have mapped.
    ///
    /// Top-level contexts inherit no such constraint.
    #[must_use]
    pub fn children_mapped_event(&self) -> Event {
        Event::none()
    }

    // ── Regions and privileges ───────────────────────────────────────

    /// Creates a top-level region with the given fields; the context
    /// holds full privileges on it.
    #[must_use]
    pub fn create_region(&self, fields: &[FieldId]) -> RegionHandle {
        let region = self.runtime.forest().create_region(fields);
        self.lock()
            .regions
            .insert(region, fields.iter().copied().collect());
        region
    }

    /// Checks that a requirement names a live region this context has
    /// privileges for.
    pub fn check_region_privilege(&self, requirement: &RegionRequirement) -> Result<()> {
        let forest = self.runtime.forest();
        if !forest.region_exists(requirement.region) {
            return Err(Error::new(ErrorKind::PrivilegeViolation)
                .with_context(format!("no privilege for region {}", requirement.region)));
        }
        if !forest.has_fields(requirement.region, &requirement.fields) {
            return Err(Error::new(ErrorKind::FieldNotFound)
                .with_context(format!("missing fields on {}", requirement.region)));
        }
        if !forest.is_ancestor(requirement.parent, requirement.region) {
            return Err(Error::new(ErrorKind::PrivilegeViolation).with_context(format!(
                "{} is not an ancestor of {}",
                requirement.parent, requirement.region
            )));
        }
        let owned = {
            let state = self.lock();
            state.regions.keys().copied().collect::<Vec<_>>()
        };
        if !owned
            .iter()
            .any(|root| forest.is_ancestor(*root, requirement.region))
        {
            return Err(Error::new(ErrorKind::PrivilegeViolation).with_context(format!(
                "context {} holds no privileges over {}",
                self.name, requirement.region
            )));
        }
        Ok(())
    }

    // ── Error handling ───────────────────────────────────────────────

    /// Records an error against the context. Fatal errors poison
    /// subsequent issues.
    pub fn record_error(&self, error: Error) {
        crate::tracing_compat::error!(context = %self.name, %error, "context error");
        let mut state = self.lock();
        if state.error.is_none() {
            state.error = Some(error);
        }
    }

    /// Takes the recorded error, clearing it.
    #[must_use]
    pub fn take_error(&self) -> Option<Error> {
        self.lock().error.take()
    }

    fn check_healthy(&self) -> Result<()> {
        let state = self.lock();
        match &state.error {
            Some(error) if error.is_fatal() => Err(error.clone()),
            _ => Ok(()),
        }
    }

    // ── Operation registration and lifecycle callbacks ───────────────

    /// Appends an operation to the stream: program order is the only
    /// serialisation before dependence analysis.
    pub(crate) fn register_operation(&self, op: &OpHandle, track: bool) {
        if !track {
            return;
        }
        let gen = op.generation();
        let trace_link = {
            let mut state = self.lock();
            state.stream.push((op.clone(), gen));
            state.current_trace.clone()
        };
        // The context's mapping reference keeps the op recyclable only
        // after it completes.
        op.core().add_mapping_reference(gen);
        if let Some(trace_obj) = trace_link {
            op.core().set_trace(Arc::clone(&trace_obj), trace_obj.is_tracing());
        }
        trace!(context = %self.name, op = %op.core().unique_id(), "operation registered");
    }

    /// Orders an operation after the context's current fence.
    pub(crate) fn register_fence_dependence(&self, op: &OpHandle) {
        let fence = self.lock().current_fence.clone();
        if let Some((fence_op, fence_gen)) = fence {
            if fence_op.ptr_id() != op.ptr_id() {
                op.core().register_dependence(&fence_op, fence_gen);
            }
        }
    }

    /// Installs a new current fence.
    pub(crate) fn update_current_fence(&self, op: &OpHandle, gen: Generation) {
        self.lock().current_fence = Some((op.clone(), gen));
    }

    /// Snapshot of the outstanding tracked operations, in issue order.
    #[must_use]
    pub fn outstanding_ops(&self) -> Vec<(OpHandle, Generation)> {
        self.lock().stream.clone()
    }

    /// Issues the close operations a new user's analysis requires.
    pub(crate) fn issue_close_operations(
        self: &Arc<Self>,
        closes: Vec<CloseRequest>,
        creator: &OpHandle,
        creator_gen: Generation,
    ) {
        for request in closes {
            let requirement = RegionRequirement::new(
                request.parent,
                request.parent,
                request.fields.iter().copied(),
                PrivilegeMode::ReadWrite,
                CoherenceMode::Exclusive,
            );
            let close = self.get_available(OpKind::InterClose, || InterCloseOp::new(&self.runtime));
            close.initialize(
                self,
                requirement,
                request.children.clone(),
                request.leave_open,
                (creator.clone(), creator_gen),
            );
            // During capture the close's edges belong to its creator;
            // replays do not re-issue closes.
            close
                .core()
                .set_trace_attribution(creator.clone(), creator_gen);
            close.trigger_dependence_analysis();
        }
    }

    /// A tracked child finished mapping.
    pub(crate) fn on_child_mapped(&self, op: &OpHandle, _gen: Generation) {
        trace!(context = %self.name, op = %op.core().unique_id(), "child mapped");
    }

    /// A tracked child completed; the context releases its mapping
    /// reference so commit can proceed.
    pub(crate) fn on_child_complete(&self, op: &OpHandle, gen: Generation) {
        op.core().remove_mapping_reference(gen);
    }

    /// A child committed: prune it from the stream and recycle the
    /// object through the free-list, bumping its generation.
    pub(crate) fn on_child_commit(&self, op: &OpHandle, gen: Generation, track: bool) {
        if track {
            let mut state = self.lock();
            state
                .stream
                .retain(|(other, other_gen)| !(other == op && *other_gen == gen));
            if let Some((fence_op, fence_gen)) = &state.current_fence {
                if fence_op == op && *fence_gen == gen {
                    state.current_fence = None;
                }
            }
            drop(state);
            self.quiescence.notify_all();
        }
        op.core().deactivate();
        self.lock()
            .free_lists
            .entry(op.kind())
            .or_default()
            .push(op.clone());
    }

    /// Frame accounting.
    pub(crate) fn on_frame_issued(&self) {
        self.lock().outstanding_frames += 1;
    }

    pub(crate) fn on_frame_completed(&self) {
        let mut state = self.lock();
        state.outstanding_frames = state.outstanding_frames.saturating_sub(1);
    }

    /// Number of frames issued but not yet completed.
    #[must_use]
    pub fn outstanding_frames(&self) -> usize {
        self.lock().outstanding_frames
    }

    /// Blocks until every tracked operation has committed.
    pub fn drain(&self) {
        let mut state = self.lock();
        while !state.stream.is_empty() {
            state = self
                .quiescence
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    // ── Free-lists ───────────────────────────────────────────────────

    fn get_available<T: Operation>(
        self: &Arc<Self>,
        kind: OpKind,
        make: impl FnOnce() -> Arc<T>,
    ) -> Arc<T> {
        let recycled = {
            let mut state = self.lock();
            state.free_lists.get_mut(&kind).and_then(Vec::pop)
        };
        let op = match recycled {
            Some(handle) => match handle.into_arc().as_any_arc().downcast::<T>() {
                Ok(concrete) => concrete,
                Err(_) => make(),
            },
            None => make(),
        };
        op.core().activate();
        op
    }

    fn launch(&self, op: &OpHandle) {
        // Dependence analysis runs on the issuing thread; everything
        // after it is driven by the analysis workers and callbacks.
        op.trigger_dependence_analysis();
    }

    // ── Issue surface ────────────────────────────────────────────────

    /// Launches a task; the returned future carries its result.
    pub fn issue_task(self: &Arc<Self>, launcher: TaskLauncher) -> Result<FutureValue> {
        self.check_healthy()?;
        let op = self.get_available(OpKind::Task, || TaskOp::new(&self.runtime));
        let future = op.initialize(self, &launcher, true);
        self.launch(&op.core().handle());
        Ok(future)
    }

    /// Creates an untracked member task for a must-epoch.
    pub(crate) fn create_epoch_task(self: &Arc<Self>, launcher: &TaskLauncher) -> Arc<TaskOp> {
        let op = self.get_available(OpKind::Task, || TaskOp::new(&self.runtime));
        let _ = op.initialize(self, launcher, false);
        op
    }

    /// Issues a copy; the returned event fires at completion.
    pub fn issue_copy(self: &Arc<Self>, launcher: CopyLauncher) -> Result<Event> {
        self.check_healthy()?;
        let op = self.get_available(OpKind::Copy, || CopyOp::new(&self.runtime));
        let completion = op.initialize(self, &launcher)?;
        self.launch(&op.core().handle());
        Ok(completion)
    }

    /// Issues a fill; the returned event fires at completion.
    pub fn issue_fill(self: &Arc<Self>, launcher: FillLauncher) -> Result<Event> {
        self.check_healthy()?;
        let op = self.get_available(OpKind::Fill, || FillOp::new(&self.runtime));
        let completion = op.initialize(self, &launcher);
        self.launch(&op.core().handle());
        Ok(completion)
    }

    /// Maps a region inline, giving the context a physical instance.
    pub fn inline_map(self: &Arc<Self>, launcher: InlineLauncher) -> Result<MappedRegion> {
        self.check_healthy()?;
        let op = self.get_available(OpKind::Map, || MapOp::new(&self.runtime));
        let region = op.initialize(self, &launcher);
        self.launch(&op.core().handle());
        Ok(region)
    }

    /// Re-maps a previously mapped region.
    pub fn remap_region(self: &Arc<Self>, region: &MappedRegion) -> Result<Event> {
        self.check_healthy()?;
        let op = self.get_available(OpKind::Map, || MapOp::new(&self.runtime));
        op.initialize_remap(self, region);
        self.launch(&op.core().handle());
        Ok(op.core().completion_event())
    }

    /// Issues a fence over the stream.
    pub fn issue_fence(self: &Arc<Self>, kind: FenceKind) -> Event {
        let op = self.get_available(OpKind::Fence, || FenceOp::new(&self.runtime));
        op.initialize(self, kind);
        self.launch(&op.core().handle());
        op.core().completion_event()
    }

    /// Issues a frame marker.
    pub fn issue_frame(self: &Arc<Self>) -> Event {
        let op = self.get_available(OpKind::Frame, || FrameOp::new(&self.runtime));
        op.initialize(self);
        self.launch(&op.core().handle());
        op.core().completion_event()
    }

    /// Issues a post close flushing a mapped instance to its parent.
    pub fn issue_post_close(
        self: &Arc<Self>,
        parent_index: usize,
        reference: &MappedRegion,
    ) -> Result<Event> {
        self.check_healthy()?;
        let op = self.get_available(OpKind::PostClose, || PostCloseOp::new(&self.runtime));
        op.initialize(self, parent_index, reference);
        self.launch(&op.core().handle());
        Ok(op.core().completion_event())
    }

    /// Issues an acquire lifting a restriction.
    pub fn issue_acquire(self: &Arc<Self>, launcher: CoherenceLauncher) -> Result<Event> {
        self.check_healthy()?;
        let op = self.get_available(OpKind::Acquire, || AcquireOp::new(&self.runtime));
        let completion = op.initialize(self, &launcher);
        self.launch(&op.core().handle());
        Ok(completion)
    }

    /// Issues a release restoring a restriction.
    pub fn issue_release(self: &Arc<Self>, launcher: CoherenceLauncher) -> Result<Event> {
        self.check_healthy()?;
        let op = self.get_available(OpKind::Release, || ReleaseOp::new(&self.runtime));
        let completion = op.initialize(self, &launcher);
        self.launch(&op.core().handle());
        Ok(completion)
    }

    /// Attaches an external file to a region as a restricted instance.
    pub fn attach_file(self: &Arc<Self>, launcher: AttachLauncher) -> Result<Event> {
        self.check_healthy()?;
        let op = self.get_available(OpKind::Attach, || AttachOp::new(&self.runtime));
        op.initialize(self, &launcher);
        self.launch(&op.core().handle());
        Ok(op.core().completion_event())
    }

    /// Detaches the restricted instance from a region.
    pub fn detach_region(
        self: &Arc<Self>,
        region: RegionHandle,
        fields: impl IntoIterator<Item = FieldId>,
    ) -> Result<Event> {
        self.check_healthy()?;
        let op = self.get_available(OpKind::Detach, || DetachOp::new(&self.runtime));
        op.initialize(self, region, fields);
        self.launch(&op.core().handle());
        Ok(op.core().completion_event())
    }

    /// Issues a deferred deletion of a region.
    pub fn issue_region_deletion(self: &Arc<Self>, region: RegionHandle) -> Result<Event> {
        self.check_healthy()?;
        let fields = self
            .lock()
            .regions
            .get(&region)
            .cloned()
            .unwrap_or_default();
        self.issue_deletion(DeletionKind::Region(region), fields)
    }

    /// Issues a deferred deletion of fields.
    pub fn issue_field_deletion(
        self: &Arc<Self>,
        region: RegionHandle,
        fields: impl IntoIterator<Item = FieldId>,
    ) -> Result<Event> {
        self.check_healthy()?;
        let fields: BTreeSet<FieldId> = fields.into_iter().collect();
        self.issue_deletion(
            DeletionKind::Fields {
                region,
                fields: fields.clone(),
            },
            fields,
        )
    }

    /// Issues a deferred deletion of a partition.
    pub fn issue_partition_deletion(
        self: &Arc<Self>,
        partition: PartitionHandle,
        parent: RegionHandle,
    ) -> Result<Event> {
        self.check_healthy()?;
        let fields = self
            .lock()
            .regions
            .get(&parent)
            .cloned()
            .unwrap_or_default();
        self.issue_deletion(DeletionKind::Partition { partition, parent }, fields)
    }

    fn issue_deletion(
        self: &Arc<Self>,
        kind: DeletionKind,
        fields: BTreeSet<FieldId>,
    ) -> Result<Event> {
        let op = self.get_available(OpKind::Deletion, || DeletionOp::new(&self.runtime));
        op.initialize(self, kind, fields);
        self.launch(&op.core().handle());
        Ok(op.core().completion_event())
    }

    // ── Partitions ───────────────────────────────────────────────────

    /// Creates a disjoint partition computed as equal pieces.
    pub fn create_equal_partition(
        self: &Arc<Self>,
        region: RegionHandle,
        colors: u32,
        granularity: usize,
    ) -> Result<(PartitionHandle, Event)> {
        self.pending_partition(
            region,
            colors,
            true,
            |_| PartitionComputation::Equal { granularity },
        )
    }

    /// Creates a disjoint partition computed from per-color weights.
    pub fn create_weighted_partition(
        self: &Arc<Self>,
        region: RegionHandle,
        colors: u32,
        granularity: usize,
        weights: std::collections::BTreeMap<u32, u32>,
    ) -> Result<(PartitionHandle, Event)> {
        self.pending_partition(region, colors, true, move |_| {
            PartitionComputation::Weighted {
                granularity,
                weights,
            }
        })
    }

    /// Creates a partition from a set operation over other partitions.
    pub fn create_partition_by_op(
        self: &Arc<Self>,
        region: RegionHandle,
        colors: u32,
        computation: PartitionComputation,
    ) -> Result<(PartitionHandle, Event)> {
        self.pending_partition(region, colors, false, move |_| computation)
    }

    fn pending_partition(
        self: &Arc<Self>,
        region: RegionHandle,
        colors: u32,
        disjoint: bool,
        computation: impl FnOnce(PartitionHandle) -> PartitionComputation,
    ) -> Result<(PartitionHandle, Event)> {
        self.check_healthy()?;
        let forest = self.runtime.forest();
        if !forest.region_exists(region) {
            return Err(Error::new(ErrorKind::RegionNotFound)
                .with_context(format!("cannot partition {region}")));
        }
        let partition = forest.create_partition(region, colors, disjoint);
        let thunk = PendingPartitionThunk::new(Some(partition), computation(partition));
        let op = self.get_available(OpKind::PendingPartition, || {
            PendingPartitionOp::new(&self.runtime)
        });
        let ready = op.initialize(self, thunk);
        self.launch(&op.core().handle());
        Ok((partition, ready))
    }

    /// Computes a pending index-space union/intersection/difference.
    pub fn compute_pending_space(
        self: &Arc<Self>,
        computation: PartitionComputation,
    ) -> Result<Event> {
        self.check_healthy()?;
        let thunk = PendingPartitionThunk::new(None, computation);
        let op = self.get_available(OpKind::PendingPartition, || {
            PendingPartitionOp::new(&self.runtime)
        });
        let ready = op.initialize(self, thunk);
        self.launch(&op.core().handle());
        Ok(ready)
    }

    /// Partitions a region by the values of one of its fields.
    pub fn create_partition_by_field(
        self: &Arc<Self>,
        region: RegionHandle,
        colors: u32,
        field: FieldId,
    ) -> Result<(PartitionHandle, Event)> {
        self.dependent_partition(
            region,
            colors,
            true,
            field,
            DependentPartitionKind::ByField { field },
        )
    }

    /// Partitions by the image of a pointer field through a projection.
    pub fn create_partition_by_image(
        self: &Arc<Self>,
        region: RegionHandle,
        colors: u32,
        projection: PartitionHandle,
        field: FieldId,
    ) -> Result<(PartitionHandle, Event)> {
        self.dependent_partition(
            region,
            colors,
            false,
            field,
            DependentPartitionKind::ByImage { projection, field },
        )
    }

    /// Partitions by the preimage of a pointer field through a
    /// projection.
    pub fn create_partition_by_preimage(
        self: &Arc<Self>,
        region: RegionHandle,
        colors: u32,
        projection: PartitionHandle,
        field: FieldId,
    ) -> Result<(PartitionHandle, Event)> {
        self.dependent_partition(
            region,
            colors,
            false,
            field,
            DependentPartitionKind::ByPreimage { projection, field },
        )
    }

    fn dependent_partition(
        self: &Arc<Self>,
        region: RegionHandle,
        colors: u32,
        disjoint: bool,
        field: FieldId,
        computation: DependentPartitionKind,
    ) -> Result<(PartitionHandle, Event)> {
        self.check_healthy()?;
        let forest = self.runtime.forest();
        if !forest.region_exists(region) {
            return Err(Error::new(ErrorKind::RegionNotFound)
                .with_context(format!("cannot partition {region}")));
        }
        let partition = forest.create_partition(region, colors, disjoint);
        let op = self.get_available(OpKind::DependentPartition, || {
            DependentPartitionOp::new(&self.runtime)
        });
        let ready = op.initialize(self, partition, region, field, computation);
        self.launch(&op.core().handle());
        Ok((partition, ready))
    }

    // ── Collectives and predicates ───────────────────────────────────

    /// Defers reading a dynamic collective into a future.
    pub fn defer_dynamic_collective(
        self: &Arc<Self>,
        collective: DynamicCollective,
    ) -> Result<FutureValue> {
        self.check_healthy()?;
        let op = self.get_available(OpKind::DynamicCollective, || {
            DynamicCollectiveOp::new(&self.runtime)
        });
        let future = op.initialize(self, collective);
        self.launch(&op.core().handle());
        Ok(future)
    }

    /// Creates a predicate from a boolean future.
    pub fn create_future_predicate(self: &Arc<Self>, future: &FutureValue) -> Predicate {
        let op = self.get_available(OpKind::FuturePred, || FuturePredOp::new(&self.runtime));
        op.initialize(self, future.clone());
        let reference = PredicateRef::new(op.core().handle(), op.core().generation());
        self.launch(&op.core().handle());
        Predicate::Op(reference)
    }

    /// Creates the negation of a predicate.
    pub fn create_not_predicate(self: &Arc<Self>, input: &Predicate) -> Predicate {
        let op = self.get_available(OpKind::NotPred, || NotPredOp::new(&self.runtime));
        op.initialize(self, input);
        let reference = PredicateRef::new(op.core().handle(), op.core().generation());
        self.launch(&op.core().handle());
        Predicate::Op(reference)
    }

    /// Creates the conjunction of two predicates.
    pub fn create_and_predicate(
        self: &Arc<Self>,
        left: &Predicate,
        right: &Predicate,
    ) -> Predicate {
        let op = self.get_available(OpKind::AndPred, || AndPredOp::new(&self.runtime));
        op.initialize(self, left, right);
        let reference = PredicateRef::new(op.core().handle(), op.core().generation());
        self.launch(&op.core().handle());
        Predicate::Op(reference)
    }

    /// Creates the disjunction of two predicates.
    pub fn create_or_predicate(
        self: &Arc<Self>,
        left: &Predicate,
        right: &Predicate,
    ) -> Predicate {
        let op = self.get_available(OpKind::OrPred, || OrPredOp::new(&self.runtime));
        op.initialize(self, left, right);
        let reference = PredicateRef::new(op.core().handle(), op.core().generation());
        self.launch(&op.core().handle());
        Predicate::Op(reference)
    }

    /// Launches a must-epoch: tasks that map and run concurrently.
    pub fn execute_must_epoch(self: &Arc<Self>, launcher: MustEpochLauncher) -> Result<FutureMap> {
        self.check_healthy()?;
        let op = self.get_available(OpKind::MustEpoch, || MustEpochOp::new(&self.runtime));
        let map = op.initialize(self, &launcher);
        self.launch(&op.core().handle());
        Ok(map)
    }

    // ── Traces ───────────────────────────────────────────────────────

    /// Begins capturing or replaying the trace with the given id.
    pub fn begin_trace(self: &Arc<Self>, tid: TraceId) -> Result<()> {
        self.check_healthy()?;
        let existing = {
            let state = self.lock();
            if state.current_trace.is_some() {
                return Err(Error::new(ErrorKind::TraceInUse)
                    .with_context("a trace is already in progress"));
            }
            state.traces.get(&tid).cloned()
        };
        let trace_obj = match existing {
            Some(trace_obj) => {
                if !trace_obj.is_fixed() {
                    return Err(Error::new(ErrorKind::TraceInUse)
                        .with_context(format!("{tid} is still capturing")));
                }
                trace_obj.begin_replay();
                debug!(context = %self.name, %tid, "trace replay started");
                trace_obj
            }
            None => {
                let trace_obj = Trace::new(tid);
                self.lock().traces.insert(tid, Arc::clone(&trace_obj));
                debug!(context = %self.name, %tid, "trace capture started");
                trace_obj
            }
        };
        self.lock().current_trace = Some(trace_obj);
        Ok(())
    }

    /// Ends the trace in progress, injecting the capture or completion
    /// marker.
    pub fn end_trace(self: &Arc<Self>, tid: TraceId) -> Result<()> {
        let trace_obj = {
            let mut state = self.lock();
            let Some(trace_obj) = state.current_trace.take() else {
                return Err(
                    Error::new(ErrorKind::InvalidState).with_context("no trace in progress")
                );
            };
            if trace_obj.id() != tid {
                let current = trace_obj.id();
                state.current_trace = Some(trace_obj);
                return Err(Error::new(ErrorKind::InvalidState)
                    .with_context(format!("{tid} is not the trace in progress ({current})")));
            }
            trace_obj
        };

        if trace_obj.is_fixed() {
            let op = self.get_available(OpKind::TraceComplete, || {
                TraceCompleteOp::new(&self.runtime)
            });
            op.initialize(self, trace_obj);
            self.launch(&op.core().handle());
        } else {
            let op =
                self.get_available(OpKind::TraceCapture, || TraceCaptureOp::new(&self.runtime));
            op.initialize(self, trace_obj);
            self.launch(&op.core().handle());
        }
        Ok(())
    }

    /// The trace registered under an id, if any.
    #[must_use]
    pub fn find_trace(&self, tid: TraceId) -> Option<Arc<Trace>> {
        self.lock().traces.get(&tid).cloned()
    }
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("TaskContext")
            .field("name", &self.name)
            .field("outstanding", &state.stream.len())
            .field("traces", &state.traces.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;

    fn setup() -> Arc<TaskContext> {
        let rt = Runtime::new(RuntimeConfig::inline()).expect("runtime");
        rt.create_context("ctx")
    }

    #[test]
    fn create_region_grants_privileges() {
        let ctx = setup();
        let field = FieldId::new(0);
        let region = ctx.create_region(&[field]);
        let requirement = RegionRequirement::new(
            region,
            region,
            [field],
            PrivilegeMode::ReadWrite,
            CoherenceMode::Exclusive,
        );
        ctx.check_region_privilege(&requirement).expect("owned");
    }

    #[test]
    fn foreign_region_is_rejected() {
        let ctx = setup();
        let other = setup();
        let field = FieldId::new(0);
        let region = other.create_region(&[field]);
        let requirement = RegionRequirement::new(
            region,
            region,
            [field],
            PrivilegeMode::ReadWrite,
            CoherenceMode::Exclusive,
        );
        // A different runtime's forest does not know the region at all.
        let err = ctx.check_region_privilege(&requirement).expect_err("foreign");
        assert_eq!(err.kind(), ErrorKind::PrivilegeViolation);
    }

    #[test]
    fn fatal_error_poisons_issues() {
        let ctx = setup();
        ctx.record_error(Error::new(ErrorKind::PrivilegeViolation));
        let err = ctx
            .issue_task(TaskLauncher::new(1))
            .expect_err("poisoned context");
        assert_eq!(err.kind(), ErrorKind::PrivilegeViolation);
        // Clearing the error restores the context.
        let _ = ctx.take_error();
        ctx.issue_task(TaskLauncher::new(1)).expect("healthy again");
    }

    #[test]
    fn committed_ops_are_recycled() {
        let ctx = setup();
        ctx.issue_task(TaskLauncher::new(1)).expect("task");
        ctx.drain();
        let pooled = {
            let state = ctx.lock();
            state
                .free_lists
                .get(&OpKind::Task)
                .map_or(0, Vec::len)
        };
        assert_eq!(pooled, 1);

        // The next task reuses the pooled object on a fresh generation.
        ctx.issue_task(TaskLauncher::new(2)).expect("task");
        ctx.drain();
        let pooled = {
            let state = ctx.lock();
            state
                .free_lists
                .get(&OpKind::Task)
                .map_or(0, Vec::len)
        };
        assert_eq!(pooled, 1);
    }

    #[test]
    fn stream_drains_to_empty() {
        let ctx = setup();
        for id in 0..5 {
            ctx.issue_task(TaskLauncher::new(id)).expect("task");
        }
        ctx.drain();
        assert!(ctx.outstanding_ops().is_empty());
    }

    #[test]
    fn begin_trace_twice_is_an_error() {
        let ctx = setup();
        ctx.begin_trace(TraceId::new(1)).expect("begin");
        let err = ctx.begin_trace(TraceId::new(2)).expect_err("nested");
        assert_eq!(err.kind(), ErrorKind::TraceInUse);
        ctx.end_trace(TraceId::new(1)).expect("end");
    }

    #[test]
    fn end_trace_checks_id() {
        let ctx = setup();
        ctx.begin_trace(TraceId::new(1)).expect("begin");
        let err = ctx.end_trace(TraceId::new(9)).expect_err("wrong id");
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        ctx.end_trace(TraceId::new(1)).expect("end");
    }

    #[test]
    fn end_trace_without_begin_is_an_error() {
        let ctx = setup();
        let err = ctx.end_trace(TraceId::new(1)).expect_err("no trace");
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }
}
