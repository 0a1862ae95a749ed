//! The region-forest contract and its default in-memory implementation.
//!
//! The operation pipeline does not walk region trees itself; it asks the
//! forest collaborator for the prior users a new requirement interferes
//! with and for the close operations that must be injected first. This
//! module defines that contract ([`RegionForest`]) plus a flat-but-real
//! implementation ([`DefaultForest`]) that tracks regions, one level of
//! partitions, per-field user epochs, open children, and restrictions
//! for attach/detach.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::event::Event;
use crate::op::OpHandle;
use crate::tracing_compat::trace;
use crate::types::{
    check_dependence, CoherenceMode, DependenceKind, FieldId, Generation, InstanceId,
    PartitionHandle, PrivilegeMode, RegionHandle, RegionRequirement,
};

/// A new region user entering the analysis.
#[derive(Clone)]
pub struct RegionUser {
    /// The operation being analysed.
    pub op: OpHandle,
    /// The operation's generation at analysis time.
    pub gen: Generation,
    /// The requirement's index within the operation.
    pub req_index: usize,
    /// The requirement itself.
    pub requirement: RegionRequirement,
}

/// A prior user the new operation must order against.
#[derive(Clone)]
pub struct PriorUser {
    /// The prior operation.
    pub op: OpHandle,
    /// The prior operation's generation at its analysis time.
    pub gen: Generation,
    /// The requirement index on the prior operation.
    pub req_index: usize,
    /// The dependence kind between the pair.
    pub dtype: DependenceKind,
    /// Whether the new operation validates the prior's region.
    pub validates: bool,
}

/// A close the runtime must inject before a new user may proceed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseRequest {
    /// The region being flushed into.
    pub parent: RegionHandle,
    /// The fields being flushed.
    pub fields: BTreeSet<FieldId>,
    /// The open children being closed.
    pub children: BTreeSet<RegionHandle>,
    /// Whether the children remain open (read-only consumers).
    pub leave_open: bool,
}

/// A deferred partition computation scheme.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PartitionComputation {
    /// Split the parent into equal pieces.
    Equal {
        /// Minimum granularity of each piece.
        granularity: usize,
    },
    /// Split the parent by per-color weights.
    Weighted {
        /// Minimum granularity of each piece.
        granularity: usize,
        /// Weight per color.
        weights: BTreeMap<u32, u32>,
    },
    /// Color-wise union of two partitions.
    Union {
        /// Left operand.
        left: PartitionHandle,
        /// Right operand.
        right: PartitionHandle,
    },
    /// Color-wise intersection of two partitions.
    Intersection {
        /// Left operand.
        left: PartitionHandle,
        /// Right operand.
        right: PartitionHandle,
    },
    /// Color-wise difference of two partitions.
    Difference {
        /// Left operand.
        left: PartitionHandle,
        /// Right operand.
        right: PartitionHandle,
    },
    /// Cross product of two partitions.
    CrossProduct {
        /// The partition supplying the outer colors.
        base: PartitionHandle,
        /// The partition supplying the inner colors.
        source: PartitionHandle,
    },
    /// Union of pending spaces into a target region.
    PendingSpaceUnion {
        /// The region receiving the result.
        target: RegionHandle,
        /// The spaces being combined.
        handles: Vec<RegionHandle>,
    },
    /// Intersection of pending spaces into a target region.
    PendingSpaceIntersection {
        /// The region receiving the result.
        target: RegionHandle,
        /// The spaces being combined.
        handles: Vec<RegionHandle>,
    },
    /// Difference of pending spaces from an initial space.
    PendingSpaceDifference {
        /// The region receiving the result.
        target: RegionHandle,
        /// The space subtracted from.
        initial: RegionHandle,
        /// The spaces being subtracted.
        handles: Vec<RegionHandle>,
    },
}

/// A partition computed from field data.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DependentPartitionKind {
    /// Partition points by the value of a field.
    ByField {
        /// The coloring field.
        field: FieldId,
    },
    /// Partition by the image of a pointer field through a projection.
    ByImage {
        /// The projection partition.
        projection: PartitionHandle,
        /// The pointer field.
        field: FieldId,
    },
    /// Partition by the preimage of a pointer field through a projection.
    ByPreimage {
        /// The projection partition.
        projection: PartitionHandle,
        /// The pointer field.
        field: FieldId,
    },
}

/// The region-tree collaborator the pipeline calls into.
pub trait RegionForest: Send + Sync {
    /// Creates a top-level region with the given fields.
    fn create_region(&self, fields: &[FieldId]) -> RegionHandle;

    /// Creates a partition of `parent` with `colors` subregions.
    fn create_partition(&self, parent: RegionHandle, colors: u32, disjoint: bool)
        -> PartitionHandle;

    /// The subregion of a partition at a color.
    fn subregion(&self, partition: PartitionHandle, color: u32) -> Option<RegionHandle>;

    /// True if the region exists (has not been deleted).
    fn region_exists(&self, region: RegionHandle) -> bool;

    /// True if every field exists on the region's field space.
    fn has_fields(&self, region: RegionHandle, fields: &BTreeSet<FieldId>) -> bool;

    /// True if `ancestor` is the region itself or one of its ancestors.
    fn is_ancestor(&self, ancestor: RegionHandle, region: RegionHandle) -> bool;

    /// True if the two regions can name overlapping data.
    fn regions_alias(&self, a: RegionHandle, b: RegionHandle) -> bool;

    /// The close operations a new user requires, without recording it.
    fn preview_closes(&self, user: &RegionUser) -> Vec<CloseRequest>;

    /// Records a new user and returns the prior users it must order
    /// against.
    fn analyze_user(&self, user: RegionUser) -> Vec<PriorUser>;

    /// Records a close operation over the given children and returns the
    /// users it flushes.
    fn apply_close(
        &self,
        close: RegionUser,
        children: &BTreeSet<RegionHandle>,
        leave_open: bool,
    ) -> Vec<PriorUser>;

    /// Binds an external instance to a region, restricting it.
    fn attach_restriction(&self, region: RegionHandle, instance: InstanceId);

    /// Removes a restriction, returning the bound instance.
    fn detach_restriction(&self, region: RegionHandle) -> Option<InstanceId>;

    /// Marks a restriction acquired (true) or released (false).
    ///
    /// Returns false if the region carries no restriction.
    fn set_restriction_acquired(&self, region: RegionHandle, acquired: bool) -> bool;

    /// True if the region is currently restricted and not acquired.
    fn is_restricted(&self, region: RegionHandle) -> bool;

    /// Deletes a region and every descendant region reachable through
    /// its partitions.
    fn destroy_region(&self, region: RegionHandle);

    /// Deletes a partition: its subregions (and their subtrees) die and
    /// the partition's color lookup goes away. The parent region
    /// survives.
    fn destroy_partition(&self, partition: PartitionHandle);

    /// Deletes fields from a region's field space.
    fn destroy_fields(&self, region: RegionHandle, fields: &BTreeSet<FieldId>);

    /// Runs a deferred partition computation; the returned event fires
    /// when the result is valid. Pending-space schemes target regions
    /// rather than a partition.
    fn compute_partition(
        &self,
        partition: Option<PartitionHandle>,
        computation: &PartitionComputation,
    ) -> Event;

    /// Runs a data-dependent partition computation.
    fn compute_dependent_partition(
        &self,
        partition: PartitionHandle,
        kind: &DependentPartitionKind,
    ) -> Event;
}

// ── Default implementation ───────────────────────────────────────────

struct RegionRecord {
    parent: Option<(PartitionHandle, RegionHandle)>,
    root: RegionHandle,
    fields: BTreeSet<FieldId>,
    live: bool,
}

struct PartitionRecord {
    parent: RegionHandle,
    disjoint: bool,
    children: BTreeMap<u32, RegionHandle>,
    computed: bool,
}

struct RecordedUser {
    op: OpHandle,
    gen: Generation,
    req_index: usize,
    region: RegionHandle,
    privilege: PrivilegeMode,
    coherence: CoherenceMode,
    redop: Option<u32>,
}

impl RecordedUser {
    fn as_requirement(&self) -> RegionRequirement {
        RegionRequirement {
            region: self.region,
            parent: self.region,
            fields: BTreeSet::new(),
            privilege: self.privilege,
            coherence: self.coherence,
            redop: self.redop,
        }
    }
}

#[derive(Default)]
struct FieldState {
    users: Vec<RecordedUser>,
    open_children: BTreeSet<RegionHandle>,
}

struct Restriction {
    instance: InstanceId,
    acquired: bool,
}

#[derive(Default)]
struct ForestState {
    regions: HashMap<RegionHandle, RegionRecord>,
    partitions: HashMap<PartitionHandle, PartitionRecord>,
    field_states: HashMap<(RegionHandle, FieldId), FieldState>,
    restrictions: HashMap<RegionHandle, Restriction>,
    next_handle: u64,
}

/// The default in-memory region forest.
#[derive(Default)]
pub struct DefaultForest {
    state: Mutex<ForestState>,
}

impl DefaultForest {
    /// Creates an empty forest.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ForestState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ForestState {
    fn fresh_handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn root_of(&self, region: RegionHandle) -> RegionHandle {
        self.regions
            .get(&region)
            .map_or(region, |record| record.root)
    }

    /// The direct child of the root on the path down to `region`, or
    /// `None` when the region is the root itself.
    fn top_child(&self, region: RegionHandle) -> Option<RegionHandle> {
        let mut current = region;
        let mut top = None;
        while let Some(record) = self.regions.get(&current) {
            match record.parent {
                Some((_, parent_region)) => {
                    top = Some(current);
                    current = parent_region;
                }
                None => break,
            }
        }
        top
    }

    fn alias(&self, a: RegionHandle, b: RegionHandle) -> bool {
        if a == b {
            return true;
        }
        let (Some(ra), Some(rb)) = (self.regions.get(&a), self.regions.get(&b)) else {
            return false;
        };
        if ra.root != rb.root {
            return false;
        }
        // Walk both paths to the root and compare where they diverge.
        let path = |mut region: RegionHandle| {
            let mut chain = vec![region];
            while let Some(record) = self.regions.get(&region) {
                match record.parent {
                    Some((_, parent)) => {
                        chain.push(parent);
                        region = parent;
                    }
                    None => break,
                }
            }
            chain.reverse();
            chain
        };
        let pa = path(a);
        let pb = path(b);
        let shared = pa.iter().zip(pb.iter()).take_while(|(x, y)| x == y).count();
        if shared == pa.len() || shared == pb.len() {
            // Ancestor/descendant relationship.
            return true;
        }
        // Both paths continue below the last shared region. The two
        // divergent children alias unless they are distinct colors of
        // the same disjoint partition.
        let ca = pa[shared];
        let cb = pb[shared];
        let part_a = self.regions.get(&ca).and_then(|r| r.parent.map(|p| p.0));
        let part_b = self.regions.get(&cb).and_then(|r| r.parent.map(|p| p.0));
        match (part_a, part_b) {
            (Some(pa_handle), Some(pb_handle)) if pa_handle == pb_handle => self
                .partitions
                .get(&pa_handle)
                .map_or(true, |record| !record.disjoint),
            // Different partitions of the same region may overlap.
            _ => true,
        }
    }

    /// True when `region` lies inside the subtree rooted at `child`.
    fn subtree_contains(&self, child: RegionHandle, region: RegionHandle) -> bool {
        let mut current = region;
        loop {
            if current == child {
                return true;
            }
            match self.regions.get(&current).and_then(|r| r.parent) {
                Some((_, parent)) => current = parent,
                None => return false,
            }
        }
    }

    fn prune_stale_users(state: &mut FieldState) {
        state
            .users
            .retain(|user| user.op.generation() == user.gen);
    }

    /// Marks `root` and every region in its subtree dead.
    fn kill_subtree(&mut self, root: RegionHandle) {
        let doomed: Vec<RegionHandle> = self
            .regions
            .iter()
            .filter(|(handle, record)| record.live && self.subtree_contains(root, **handle))
            .map(|(handle, _)| *handle)
            .collect();
        for handle in doomed {
            if let Some(record) = self.regions.get_mut(&handle) {
                record.live = false;
            }
        }
    }
}

impl RegionForest for DefaultForest {
    fn create_region(&self, fields: &[FieldId]) -> RegionHandle {
        let mut state = self.lock();
        let handle = RegionHandle::from_raw(state.fresh_handle());
        state.regions.insert(
            handle,
            RegionRecord {
                parent: None,
                root: handle,
                fields: fields.iter().copied().collect(),
                live: true,
            },
        );
        handle
    }

    fn create_partition(
        &self,
        parent: RegionHandle,
        colors: u32,
        disjoint: bool,
    ) -> PartitionHandle {
        let mut state = self.lock();
        let handle = PartitionHandle::from_raw(state.fresh_handle());
        let (root, fields) = state
            .regions
            .get(&parent)
            .map_or((parent, BTreeSet::new()), |record| {
                (record.root, record.fields.clone())
            });
        let mut children = BTreeMap::new();
        for color in 0..colors {
            let child = RegionHandle::from_raw(state.fresh_handle());
            state.regions.insert(
                child,
                RegionRecord {
                    parent: Some((handle, parent)),
                    root,
                    fields: fields.clone(),
                    live: true,
                },
            );
            children.insert(color, child);
        }
        state.partitions.insert(
            handle,
            PartitionRecord {
                parent,
                disjoint,
                children,
                computed: false,
            },
        );
        handle
    }

    fn subregion(&self, partition: PartitionHandle, color: u32) -> Option<RegionHandle> {
        self.lock()
            .partitions
            .get(&partition)
            .and_then(|record| record.children.get(&color).copied())
    }

    fn region_exists(&self, region: RegionHandle) -> bool {
        self.lock()
            .regions
            .get(&region)
            .is_some_and(|record| record.live)
    }

    fn has_fields(&self, region: RegionHandle, fields: &BTreeSet<FieldId>) -> bool {
        self.lock()
            .regions
            .get(&region)
            .is_some_and(|record| fields.is_subset(&record.fields))
    }

    fn is_ancestor(&self, ancestor: RegionHandle, region: RegionHandle) -> bool {
        let state = self.lock();
        let mut current = region;
        loop {
            if current == ancestor {
                return true;
            }
            match state.regions.get(&current).and_then(|r| r.parent) {
                Some((_, parent)) => current = parent,
                None => return false,
            }
        }
    }

    fn regions_alias(&self, a: RegionHandle, b: RegionHandle) -> bool {
        self.lock().alias(a, b)
    }

    fn preview_closes(&self, user: &RegionUser) -> Vec<CloseRequest> {
        let state = self.lock();
        let root = state.root_of(user.requirement.region);
        let user_top = state.top_child(user.requirement.region);
        let leave_open = user.requirement.privilege == PrivilegeMode::ReadOnly;

        let mut requests: Vec<CloseRequest> = Vec::new();
        for field in &user.requirement.fields {
            let Some(field_state) = state.field_states.get(&(root, *field)) else {
                continue;
            };
            let closing: BTreeSet<RegionHandle> = field_state
                .open_children
                .iter()
                .copied()
                .filter(|child| {
                    Some(*child) != user_top && state.alias(*child, user.requirement.region)
                })
                .collect();
            if closing.is_empty() {
                continue;
            }
            match requests
                .iter_mut()
                .find(|r| r.children == closing && r.leave_open == leave_open)
            {
                Some(request) => {
                    request.fields.insert(*field);
                }
                None => requests.push(CloseRequest {
                    parent: root,
                    fields: BTreeSet::from([*field]),
                    children: closing,
                    leave_open,
                }),
            }
        }
        requests
    }

    fn analyze_user(&self, user: RegionUser) -> Vec<PriorUser> {
        let mut state = self.lock();
        let root = state.root_of(user.requirement.region);
        let user_top = state.top_child(user.requirement.region);
        let is_write = user.requirement.privilege.is_write();

        // Deduplicate edges across fields, keeping the strongest kind.
        let mut edges: BTreeMap<(usize, Generation, usize), PriorUser> = BTreeMap::new();

        for field in user.requirement.fields.clone() {
            // Snapshot the pruned prior users, then compute interference
            // without holding the field-state borrow.
            let priors: Vec<RecordedUser> = {
                let field_state = state.field_states.entry((root, field)).or_default();
                ForestState::prune_stale_users(field_state);
                std::mem::take(&mut field_state.users)
            };

            let mut kept: Vec<RecordedUser> = Vec::new();
            for prior in priors {
                if prior.op == user.op || !state.alias(prior.region, user.requirement.region) {
                    kept.push(prior);
                    continue;
                }
                let dtype = check_dependence(&prior.as_requirement(), &user.requirement);
                if dtype.is_ordering() {
                    let validates = dtype == DependenceKind::True
                        && prior.region == user.requirement.region;
                    let key = (prior.op.ptr_id(), prior.gen, prior.req_index);
                    match edges.get_mut(&key) {
                        Some(existing) => {
                            if dtype > existing.dtype {
                                existing.dtype = dtype;
                            }
                            existing.validates |= validates;
                        }
                        None => {
                            edges.insert(
                                key,
                                PriorUser {
                                    op: prior.op.clone(),
                                    gen: prior.gen,
                                    req_index: prior.req_index,
                                    dtype,
                                    validates,
                                },
                            );
                        }
                    }
                    // A writer opens a new epoch over the region: prior
                    // users of the same region are transitively ordered
                    // through it and can be retired.
                    if is_write && prior.region == user.requirement.region {
                        continue;
                    }
                }
                kept.push(prior);
            }

            let field_state = state
                .field_states
                .get_mut(&(root, field))
                .expect("field state created above");
            field_state.users = kept;
            field_state.users.push(RecordedUser {
                op: user.op.clone(),
                gen: user.gen,
                req_index: user.req_index,
                region: user.requirement.region,
                privilege: user.requirement.privilege,
                coherence: user.requirement.coherence,
                redop: user.requirement.redop,
            });
            if let Some(top) = user_top {
                field_state.open_children.insert(top);
            }
        }

        trace!(
            op = %user.op.core().unique_id(),
            region = %user.requirement.region,
            edges = edges.len(),
            "region analysis"
        );
        edges.into_values().collect()
    }


    fn apply_close(
        &self,
        close: RegionUser,
        children: &BTreeSet<RegionHandle>,
        leave_open: bool,
    ) -> Vec<PriorUser> {
        let mut state = self.lock();
        let root = state.root_of(close.requirement.region);
        let mut edges: BTreeMap<(usize, Generation, usize), PriorUser> = BTreeMap::new();

        for field in close.requirement.fields.clone() {
            let priors: Vec<RecordedUser> = match state.field_states.get_mut(&(root, field)) {
                Some(field_state) => {
                    ForestState::prune_stale_users(field_state);
                    std::mem::take(&mut field_state.users)
                }
                None => continue,
            };

            // The close orders after every user inside the children being
            // flushed and replaces them as the current user of the root.
            let mut kept: Vec<RecordedUser> = Vec::new();
            for prior in priors {
                let inside = children
                    .iter()
                    .any(|child| state.subtree_contains(*child, prior.region));
                if inside {
                    let key = (prior.op.ptr_id(), prior.gen, prior.req_index);
                    edges.entry(key).or_insert_with(|| PriorUser {
                        op: prior.op.clone(),
                        gen: prior.gen,
                        req_index: prior.req_index,
                        dtype: DependenceKind::True,
                        validates: false,
                    });
                    if leave_open {
                        kept.push(prior);
                    }
                } else {
                    kept.push(prior);
                }
            }

            let field_state = state
                .field_states
                .get_mut(&(root, field))
                .expect("field state present above");
            field_state.users = kept;
            field_state.users.push(RecordedUser {
                op: close.op.clone(),
                gen: close.gen,
                req_index: close.req_index,
                region: close.requirement.region,
                privilege: close.requirement.privilege,
                coherence: close.requirement.coherence,
                redop: None,
            });
            if !leave_open {
                for child in children {
                    field_state.open_children.remove(child);
                }
            }
        }
        edges.into_values().collect()
    }


    fn attach_restriction(&self, region: RegionHandle, instance: InstanceId) {
        self.lock().restrictions.insert(
            region,
            Restriction {
                instance,
                acquired: false,
            },
        );
    }

    fn detach_restriction(&self, region: RegionHandle) -> Option<InstanceId> {
        self.lock()
            .restrictions
            .remove(&region)
            .map(|r| r.instance)
    }

    fn set_restriction_acquired(&self, region: RegionHandle, acquired: bool) -> bool {
        match self.lock().restrictions.get_mut(&region) {
            Some(restriction) => {
                restriction.acquired = acquired;
                true
            }
            None => false,
        }
    }

    fn is_restricted(&self, region: RegionHandle) -> bool {
        self.lock()
            .restrictions
            .get(&region)
            .is_some_and(|r| !r.acquired)
    }

    fn destroy_region(&self, region: RegionHandle) {
        let mut state = self.lock();
        state.kill_subtree(region);
    }

    fn destroy_partition(&self, partition: PartitionHandle) {
        let mut state = self.lock();
        let Some(record) = state.partitions.remove(&partition) else {
            return;
        };
        let children: Vec<RegionHandle> = record.children.values().copied().collect();
        for child in children {
            state.kill_subtree(child);
        }
    }

    fn destroy_fields(&self, region: RegionHandle, fields: &BTreeSet<FieldId>) {
        let mut state = self.lock();
        let root = state.root_of(region);
        if let Some(record) = state.regions.get_mut(&region) {
            for field in fields {
                record.fields.remove(field);
            }
        }
        for field in fields {
            state.field_states.remove(&(root, *field));
        }
    }

    fn compute_partition(
        &self,
        partition: Option<PartitionHandle>,
        computation: &PartitionComputation,
    ) -> Event {
        let mut state = self.lock();
        if let Some(partition) = partition {
            if let Some(record) = state.partitions.get_mut(&partition) {
                record.computed = true;
            }
        }
        trace!(?partition, ?computation, "partition computed");
        Event::none()
    }

    fn compute_dependent_partition(
        &self,
        partition: PartitionHandle,
        kind: &DependentPartitionKind,
    ) -> Event {
        let mut state = self.lock();
        if let Some(record) = state.partitions.get_mut(&partition) {
            record.computed = true;
        }
        trace!(%partition, ?kind, "dependent partition computed");
        Event::none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::op::testing::ProbeOp;
    use crate::op::Operation;
    use crate::runtime::Runtime;
    use std::sync::Arc;

    fn probe_user(
        rt: &Arc<Runtime>,
        region: RegionHandle,
        fields: &[FieldId],
        privilege: PrivilegeMode,
    ) -> RegionUser {
        let op = ProbeOp::new(rt);
        op.core().activate();
        let handle = op.core().handle();
        let gen = handle.generation();
        RegionUser {
            op: handle,
            gen,
            req_index: 0,
            requirement: RegionRequirement::new(
                region,
                region,
                fields.iter().copied(),
                privilege,
                CoherenceMode::Exclusive,
            ),
        }
    }

    fn setup() -> (Arc<Runtime>, DefaultForest) {
        let rt = Runtime::new(RuntimeConfig::inline()).expect("runtime");
        (rt, DefaultForest::new())
    }

    #[test]
    fn regions_and_fields() {
        let (_rt, forest) = setup();
        let f0 = FieldId::new(0);
        let f1 = FieldId::new(1);
        let region = forest.create_region(&[f0, f1]);
        assert!(forest.region_exists(region));
        assert!(forest.has_fields(region, &BTreeSet::from([f0])));
        assert!(!forest.has_fields(region, &BTreeSet::from([FieldId::new(9)])));

        forest.destroy_region(region);
        assert!(!forest.region_exists(region));
    }

    #[test]
    fn partition_children_inherit_fields() {
        let (_rt, forest) = setup();
        let f0 = FieldId::new(0);
        let region = forest.create_region(&[f0]);
        let partition = forest.create_partition(region, 4, true);
        let child = forest.subregion(partition, 2).expect("child");
        assert!(forest.has_fields(child, &BTreeSet::from([f0])));
        assert!(forest.is_ancestor(region, child));
        assert!(!forest.is_ancestor(child, region));
    }

    #[test]
    fn disjoint_siblings_do_not_alias() {
        let (_rt, forest) = setup();
        let region = forest.create_region(&[FieldId::new(0)]);
        let partition = forest.create_partition(region, 2, true);
        let a = forest.subregion(partition, 0).expect("a");
        let b = forest.subregion(partition, 1).expect("b");
        assert!(!forest.regions_alias(a, b));
        assert!(forest.regions_alias(a, region));
        assert!(forest.regions_alias(region, b));
    }

    #[test]
    fn aliased_siblings_alias() {
        let (_rt, forest) = setup();
        let region = forest.create_region(&[FieldId::new(0)]);
        let partition = forest.create_partition(region, 2, false);
        let a = forest.subregion(partition, 0).expect("a");
        let b = forest.subregion(partition, 1).expect("b");
        assert!(forest.regions_alias(a, b));
    }

    #[test]
    fn writer_then_reader_produces_true_dependence() {
        let (rt, forest) = setup();
        let field = FieldId::new(0);
        let region = forest.create_region(&[field]);

        let writer = probe_user(&rt, region, &[field], PrivilegeMode::ReadWrite);
        let writer_op = writer.op.clone();
        assert!(forest.analyze_user(writer).is_empty());

        let reader = probe_user(&rt, region, &[field], PrivilegeMode::ReadOnly);
        let deps = forest.analyze_user(reader);
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].op, writer_op);
        assert_eq!(deps[0].dtype, DependenceKind::True);
        assert!(deps[0].validates);
    }

    #[test]
    fn disjoint_fields_are_independent() {
        let (rt, forest) = setup();
        let f0 = FieldId::new(0);
        let f1 = FieldId::new(1);
        let region = forest.create_region(&[f0, f1]);

        let a = probe_user(&rt, region, &[f0], PrivilegeMode::ReadWrite);
        assert!(forest.analyze_user(a).is_empty());
        let b = probe_user(&rt, region, &[f1], PrivilegeMode::ReadWrite);
        assert!(forest.analyze_user(b).is_empty());
    }

    #[test]
    fn writer_supersedes_prior_users_of_same_region() {
        let (rt, forest) = setup();
        let field = FieldId::new(0);
        let region = forest.create_region(&[field]);

        let first = probe_user(&rt, region, &[field], PrivilegeMode::ReadWrite);
        forest.analyze_user(first);
        let second = probe_user(&rt, region, &[field], PrivilegeMode::ReadWrite);
        let second_op = second.op.clone();
        assert_eq!(forest.analyze_user(second).len(), 1);

        // The third writer depends only on the second; the first was
        // superseded.
        let third = probe_user(&rt, region, &[field], PrivilegeMode::ReadWrite);
        let deps = forest.analyze_user(third);
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].op, second_op);
    }

    #[test]
    fn stale_generations_are_pruned() {
        let (rt, forest) = setup();
        let field = FieldId::new(0);
        let region = forest.create_region(&[field]);

        let user = probe_user(&rt, region, &[field], PrivilegeMode::ReadWrite);
        let op = user.op.clone();
        forest.analyze_user(user);

        // Commit-equivalent: bump the generation.
        op.core().deactivate();
        op.core().activate();

        let reader = probe_user(&rt, region, &[field], PrivilegeMode::ReadOnly);
        assert!(forest.analyze_user(reader).is_empty());
    }

    #[test]
    fn open_child_triggers_close_for_parent_user() {
        let (rt, forest) = setup();
        let field = FieldId::new(0);
        let region = forest.create_region(&[field]);
        let partition = forest.create_partition(region, 2, true);
        let child = forest.subregion(partition, 0).expect("child");

        let child_writer = probe_user(&rt, child, &[field], PrivilegeMode::ReadWrite);
        forest.analyze_user(child_writer);

        let parent_reader = probe_user(&rt, region, &[field], PrivilegeMode::ReadOnly);
        let closes = forest.preview_closes(&parent_reader);
        assert_eq!(closes.len(), 1);
        assert_eq!(closes[0].children, BTreeSet::from([child]));
        assert!(closes[0].leave_open);
    }

    #[test]
    fn sibling_user_in_disjoint_partition_needs_no_close() {
        let (rt, forest) = setup();
        let field = FieldId::new(0);
        let region = forest.create_region(&[field]);
        let partition = forest.create_partition(region, 2, true);
        let a = forest.subregion(partition, 0).expect("a");
        let b = forest.subregion(partition, 1).expect("b");

        forest.analyze_user(probe_user(&rt, a, &[field], PrivilegeMode::ReadWrite));
        let sibling = probe_user(&rt, b, &[field], PrivilegeMode::ReadWrite);
        assert!(forest.preview_closes(&sibling).is_empty());
    }

    #[test]
    fn apply_close_flushes_children() {
        let (rt, forest) = setup();
        let field = FieldId::new(0);
        let region = forest.create_region(&[field]);
        let partition = forest.create_partition(region, 2, true);
        let child = forest.subregion(partition, 0).expect("child");

        let writer = probe_user(&rt, child, &[field], PrivilegeMode::ReadWrite);
        let writer_op = writer.op.clone();
        forest.analyze_user(writer);

        let close = probe_user(&rt, region, &[field], PrivilegeMode::ReadWrite);
        let flushed = forest.apply_close(close, &BTreeSet::from([child]), false);
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].op, writer_op);

        // After the close, a parent user needs no further close.
        let reader = probe_user(&rt, region, &[field], PrivilegeMode::ReadOnly);
        assert!(forest.preview_closes(&reader).is_empty());
    }

    #[test]
    fn destroy_region_cascades_to_descendants() {
        let (_rt, forest) = setup();
        let field = FieldId::new(0);
        let region = forest.create_region(&[field]);
        let partition = forest.create_partition(region, 2, true);
        let child = forest.subregion(partition, 0).expect("child");
        let nested = forest.create_partition(child, 2, true);
        let grandchild = forest.subregion(nested, 1).expect("grandchild");

        forest.destroy_region(region);
        assert!(!forest.region_exists(region));
        assert!(!forest.region_exists(child));
        assert!(!forest.region_exists(grandchild));
    }

    #[test]
    fn destroy_partition_spares_the_parent() {
        let (_rt, forest) = setup();
        let field = FieldId::new(0);
        let region = forest.create_region(&[field]);
        let partition = forest.create_partition(region, 2, true);
        let child = forest.subregion(partition, 0).expect("child");
        let nested = forest.create_partition(child, 2, true);
        let grandchild = forest.subregion(nested, 0).expect("grandchild");

        forest.destroy_partition(partition);
        assert!(forest.region_exists(region), "parent region survives");
        assert!(!forest.region_exists(child));
        assert!(!forest.region_exists(grandchild));
        assert!(forest.subregion(partition, 0).is_none());
    }

    #[test]
    fn restrictions_lifecycle() {
        let (_rt, forest) = setup();
        let region = forest.create_region(&[FieldId::new(0)]);
        let instance = InstanceId::new_for_test(7);

        assert!(!forest.is_restricted(region));
        forest.attach_restriction(region, instance);
        assert!(forest.is_restricted(region));

        assert!(forest.set_restriction_acquired(region, true));
        assert!(!forest.is_restricted(region));
        assert!(forest.set_restriction_acquired(region, false));
        assert!(forest.is_restricted(region));

        assert_eq!(forest.detach_restriction(region), Some(instance));
        assert!(!forest.is_restricted(region));
    }
}
