//! Deferred deletion operations.
//!
//! Deletions are deferred until every earlier operation using the doomed
//! resource is done with it: the deletion orders after all current users
//! and performs the forest-side removal only when it commits.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::context::TaskContext;
use crate::op::{OpCore, OpKind, Operation};
use crate::runtime::Runtime;
use crate::types::{
    CoherenceMode, FieldId, PartitionHandle, PrivilegeMode, RegionHandle, RegionRequirement,
};

/// What a deletion removes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeletionKind {
    /// A logical region and its subtree.
    Region(RegionHandle),
    /// A partition of a region.
    Partition {
        /// The doomed partition.
        partition: PartitionHandle,
        /// The partition's parent region.
        parent: RegionHandle,
    },
    /// A set of fields on a region.
    Fields {
        /// The region losing fields.
        region: RegionHandle,
        /// The doomed fields.
        fields: BTreeSet<FieldId>,
    },
}

#[derive(Default)]
struct DeletionData {
    kind: Option<DeletionKind>,
    requirement: Option<RegionRequirement>,
}

/// A deferred deletion.
pub struct DeletionOp {
    core: OpCore,
    state: Mutex<DeletionData>,
}

impl DeletionOp {
    pub(crate) fn new(runtime: &Arc<Runtime>) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let self_ref: Weak<dyn Operation> = weak.clone();
            Self {
                core: OpCore::new(Arc::clone(runtime), self_ref),
                state: Mutex::new(DeletionData::default()),
            }
        })
    }

    fn lock(&self) -> MutexGuard<'_, DeletionData> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn initialize(
        self: &Arc<Self>,
        ctx: &Arc<TaskContext>,
        kind: DeletionKind,
        fields: BTreeSet<FieldId>,
    ) {
        let region = match &kind {
            DeletionKind::Region(region) => *region,
            DeletionKind::Partition { parent, .. } => *parent,
            DeletionKind::Fields { region, .. } => *region,
        };
        {
            let mut data = self.lock();
            data.requirement = Some(RegionRequirement::new(
                region,
                region,
                fields,
                PrivilegeMode::WriteDiscard,
                CoherenceMode::Exclusive,
            ));
            data.kind = Some(kind);
        }
        self.core.initialize_operation(ctx, true, 1);
    }

    /// What this deletion removes.
    #[must_use]
    pub fn deletion_kind(&self) -> Option<DeletionKind> {
        self.lock().kind.clone()
    }
}

impl Operation for DeletionOp {
    fn core(&self) -> &OpCore {
        &self.core
    }

    fn kind(&self) -> OpKind {
        OpKind::Deletion
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
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

    fn trigger_commit(&self) {
        // The removal happens only once nothing can still reach the
        // resource.
        let kind = self.lock().kind.clone();
        if let Some(kind) = kind {
            let forest = self.core.runtime().forest();
            match kind {
                DeletionKind::Region(region) => forest.destroy_region(region),
                DeletionKind::Partition { partition, parent: _ } => {
                    forest.destroy_partition(partition);
                }
                DeletionKind::Fields { region, fields } => {
                    forest.destroy_fields(region, &fields);
                }
            }
        }
        self.core.commit_operation();
    }
}
