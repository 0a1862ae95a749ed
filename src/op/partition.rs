//! Partition operations.
//!
//! A pending partition defers the computation of a partition's
//! subregions off the application thread; the scheme is captured as a
//! thunk so the operation itself is uniform. A dependent partition
//! computes a partition from field values in a region and therefore owns
//! a real region requirement and goes through mapping first. Both
//! surface a user-triggerable `handle_ready` event.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::context::TaskContext;
use crate::event::{Event, UserEvent};
use crate::forest::{DependentPartitionKind, PartitionComputation, RegionForest};
use crate::mapper::MapRequest;
use crate::op::{OpCore, OpKind, Operation};
use crate::runtime::Runtime;
use crate::types::{
    CoherenceMode, FieldId, PartitionHandle, PrivilegeMode, RegionHandle, RegionRequirement,
};

/// A deferred partition computation: the target partition plus the
/// scheme that fills in its subregions.
pub struct PendingPartitionThunk {
    partition: Option<PartitionHandle>,
    computation: PartitionComputation,
}

impl PendingPartitionThunk {
    /// Captures a computation against a target partition; pending-space
    /// schemes carry no partition.
    #[must_use]
    pub fn new(partition: Option<PartitionHandle>, computation: PartitionComputation) -> Self {
        Self {
            partition,
            computation,
        }
    }

    /// The target partition.
    #[must_use]
    pub fn partition(&self) -> Option<PartitionHandle> {
        self.partition
    }

    fn perform(&self, forest: &Arc<dyn RegionForest>) -> Event {
        forest.compute_partition(self.partition, &self.computation)
    }
}

#[derive(Default)]
struct PendingData {
    thunk: Option<Arc<PendingPartitionThunk>>,
    handle_ready: Option<UserEvent>,
}

/// Deferred computation of a partition by one of the uniform schemes.
pub struct PendingPartitionOp {
    core: OpCore,
    state: Mutex<PendingData>,
}

impl PendingPartitionOp {
    pub(crate) fn new(runtime: &Arc<Runtime>) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let self_ref: Weak<dyn Operation> = weak.clone();
            Self {
                core: OpCore::new(Arc::clone(runtime), self_ref),
                state: Mutex::new(PendingData::default()),
            }
        })
    }

    fn lock(&self) -> MutexGuard<'_, PendingData> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn initialize(
        self: &Arc<Self>,
        ctx: &Arc<TaskContext>,
        thunk: PendingPartitionThunk,
    ) -> Event {
        let ready = UserEvent::new();
        {
            let mut data = self.lock();
            data.thunk = Some(Arc::new(thunk));
            data.handle_ready = Some(ready.clone());
        }
        self.core.initialize_operation(ctx, true, 0);
        ready.event()
    }

    /// The event surfaced to the caller before the partition is computed.
    #[must_use]
    pub fn handle_ready(&self) -> Option<Event> {
        self.lock().handle_ready.as_ref().map(UserEvent::event)
    }
}

impl Operation for PendingPartitionOp {
    fn core(&self) -> &OpCore {
        &self.core
    }

    fn kind(&self) -> OpKind {
        OpKind::PendingPartition
    }

    fn is_partition_op(&self) -> bool {
        true
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
    }

    fn trigger_execution(&self) {
        let (thunk, ready) = {
            let data = self.lock();
            (data.thunk.clone(), data.handle_ready.clone())
        };
        if let Some(thunk) = thunk {
            let forest = Arc::clone(self.core.runtime().forest());
            let computed = thunk.perform(&forest);
            let handle = self.core.handle();
            let runtime = Arc::clone(self.core.runtime());
            computed.subscribe(move || {
                if let Some(ready) = ready {
                    ready.trigger();
                }
                runtime.defer(move || handle.core().complete_execution());
            });
        } else {
            self.core.complete_execution();
        }
    }
}

#[derive(Default)]
struct DependentData {
    partition: Option<PartitionHandle>,
    computation: Option<DependentPartitionKind>,
    requirement: Option<RegionRequirement>,
    handle_ready: Option<UserEvent>,
}

/// A partition computed from field values in a region.
pub struct DependentPartitionOp {
    core: OpCore,
    state: Mutex<DependentData>,
}

impl DependentPartitionOp {
    pub(crate) fn new(runtime: &Arc<Runtime>) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let self_ref: Weak<dyn Operation> = weak.clone();
            Self {
                core: OpCore::new(Arc::clone(runtime), self_ref),
                state: Mutex::new(DependentData::default()),
            }
        })
    }

    fn lock(&self) -> MutexGuard<'_, DependentData> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn initialize(
        self: &Arc<Self>,
        ctx: &Arc<TaskContext>,
        partition: PartitionHandle,
        region: RegionHandle,
        field: FieldId,
        computation: DependentPartitionKind,
    ) -> Event {
        let ready = UserEvent::new();
        {
            let mut data = self.lock();
            data.partition = Some(partition);
            data.computation = Some(computation);
            data.requirement = Some(RegionRequirement::new(
                region,
                region,
                [field],
                PrivilegeMode::ReadOnly,
                CoherenceMode::Exclusive,
            ));
            data.handle_ready = Some(ready.clone());
        }
        self.core.initialize_operation(ctx, true, 1);
        ready.event()
    }

    /// The event surfaced to the caller before the partition is computed.
    #[must_use]
    pub fn handle_ready(&self) -> Option<Event> {
        self.lock().handle_ready.as_ref().map(UserEvent::event)
    }
}

impl Operation for DependentPartitionOp {
    fn core(&self) -> &OpCore {
        &self.core
    }

    fn kind(&self) -> OpKind {
        OpKind::DependentPartition
    }

    fn is_partition_op(&self) -> bool {
        true
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
    }

    fn trigger_dependence_analysis(&self) {
        self.core.begin_dependence_analysis();
        if !self.core.replay_trace_dependences() {
            let requirement = self.lock().requirement.clone();
            if let Some(requirement) = requirement {
                if let Some(ctx) = self.core.parent() {
                    match ctx.check_region_privilege(&requirement) {
                        Ok(()) => self.core.analyze_region_requirement(0, &requirement, None),
                        Err(error) => ctx.record_error(error.with_op(self.core.unique_id())),
                    }
                }
            }
        }
        self.core.end_dependence_analysis();
    }

    fn trigger_execution(&self) {
        // The partition computation reads field data, so an instance is
        // mapped first.
        let (partition, computation, requirement, ready) = {
            let data = self.lock();
            (
                data.partition,
                data.computation.clone(),
                data.requirement.clone(),
                data.handle_ready.clone(),
            )
        };
        if let (Some(partition), Some(computation)) = (partition, computation) {
            if let Some(requirement) = requirement {
                let _ = self.core.runtime().mapper().map_operation(&MapRequest {
                    op: self.core.unique_id(),
                    kind: OpKind::DependentPartition,
                    req_index: 0,
                    requirement: &requirement,
                });
            }
            let forest = Arc::clone(self.core.runtime().forest());
            let computed = forest.compute_dependent_partition(partition, &computation);
            let handle = self.core.handle();
            let runtime = Arc::clone(self.core.runtime());
            computed.subscribe(move || {
                if let Some(ready) = ready {
                    ready.trigger();
                }
                runtime.defer(move || handle.core().complete_execution());
            });
        } else {
            self.core.complete_execution();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;

    fn setup() -> Arc<TaskContext> {
        let rt = Runtime::new(RuntimeConfig::inline()).expect("runtime");
        rt.create_context("partition")
    }

    #[test]
    fn equal_partition_surfaces_handle_ready() {
        let ctx = setup();
        let field = FieldId::new(0);
        let region = ctx.create_region(&[field]);
        let (partition, ready) = ctx
            .create_equal_partition(region, 4, 1)
            .expect("partition");
        assert!(ready.has_triggered());
        assert!(ctx
            .runtime()
            .forest()
            .subregion(partition, 3)
            .is_some());
    }

    #[test]
    fn set_operation_partitions() {
        let ctx = setup();
        let field = FieldId::new(0);
        let region = ctx.create_region(&[field]);
        let (left, _) = ctx.create_equal_partition(region, 2, 1).expect("left");
        let (right, _) = ctx.create_equal_partition(region, 2, 1).expect("right");

        let (_union, ready) = ctx
            .create_partition_by_op(region, 2, PartitionComputation::Union { left, right })
            .expect("union");
        assert!(ready.has_triggered());
    }

    #[test]
    fn partition_by_field_maps_region() {
        let ctx = setup();
        let field = FieldId::new(0);
        let region = ctx.create_region(&[field]);
        let (partition, ready) = ctx
            .create_partition_by_field(region, 3, field)
            .expect("by-field");
        assert!(ready.has_triggered());
        assert!(ctx.runtime().forest().subregion(partition, 0).is_some());
    }
}
