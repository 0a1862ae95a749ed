//! Region requirements and the dependence-kind lattice.
//!
//! A [`RegionRequirement`] names the data an operation touches: a region,
//! a set of fields, a privilege (how the data is accessed) and a
//! coherence mode (what other accesses may run concurrently). Dependence
//! analysis compares the requirement of a new operation against prior
//! users of overlapping data and produces a [`DependenceKind`] for each
//! pair.

use std::collections::BTreeSet;

use crate::types::id::{FieldId, RegionHandle};

/// How an operation accesses the fields of a region requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrivilegeMode {
    /// No access; used for placeholder requirements.
    NoAccess,
    /// Read-only access.
    ReadOnly,
    /// Read-write access.
    ReadWrite,
    /// Write access where prior contents are discarded.
    WriteDiscard,
    /// Reduction access with a reduction operator.
    Reduce,
}

impl PrivilegeMode {
    /// Returns true if the privilege can observe prior data.
    #[must_use]
    pub const fn is_read(self) -> bool {
        matches!(self, Self::ReadOnly | Self::ReadWrite)
    }

    /// Returns true if the privilege mutates data.
    #[must_use]
    pub const fn is_write(self) -> bool {
        matches!(self, Self::ReadWrite | Self::WriteDiscard | Self::Reduce)
    }
}

/// What other accesses may run concurrently with a requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoherenceMode {
    /// No concurrent access to interfering data.
    Exclusive,
    /// Concurrent access allowed if serialisable (atomic pairs).
    Atomic,
    /// Concurrent access allowed, application manages coherence.
    Simultaneous,
    /// No ordering guarantees at all.
    Relaxed,
}

/// The kind of a dependence edge between two operations.
///
/// Variants are ordered by strength: when several edges target the same
/// peer on the same region, only the strongest survives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DependenceKind {
    /// No dependence; the pair may run in any order.
    NoDependence,
    /// Both requirements use simultaneous coherence; ordering is advisory.
    Simultaneous,
    /// Both requirements use atomic coherence; accesses must serialise
    /// but in either order.
    Atomic,
    /// Write-after-read, or a write whose prior contents are discarded.
    Anti,
    /// Read-after-write or write-after-write; a true data dependence.
    True,
}

impl DependenceKind {
    /// Returns true if the edge actually orders the pair.
    #[must_use]
    pub const fn is_ordering(self) -> bool {
        !matches!(self, Self::NoDependence)
    }

    /// Returns true if the edge forbids concurrent execution, which is
    /// what makes a must-epoch infeasible.
    #[must_use]
    pub const fn is_serialising(self) -> bool {
        matches!(self, Self::True | Self::Anti)
    }
}

/// Computes the dependence kind between a prior requirement and a new one
/// on overlapping data.
///
/// The rules follow the classic privilege table, refined by coherence:
/// read-after-read never depends; a reduction depends on another
/// reduction only when their operators differ; matching atomic or
/// simultaneous coherence downgrades a data dependence to the
/// corresponding relaxed kind; relaxed coherence on either side erases
/// the dependence entirely.
#[must_use]
pub fn check_dependence(prev: &RegionRequirement, next: &RegionRequirement) -> DependenceKind {
    use PrivilegeMode::{NoAccess, ReadOnly, Reduce};

    if prev.privilege == NoAccess || next.privilege == NoAccess {
        return DependenceKind::NoDependence;
    }
    if prev.privilege == ReadOnly && next.privilege == ReadOnly {
        return DependenceKind::NoDependence;
    }
    if prev.privilege == Reduce && next.privilege == Reduce && prev.redop == next.redop {
        return DependenceKind::NoDependence;
    }

    // At least one side writes, so the pair interferes; coherence decides
    // how strongly.
    match (prev.coherence, next.coherence) {
        (CoherenceMode::Relaxed, _) | (_, CoherenceMode::Relaxed) => DependenceKind::NoDependence,
        (CoherenceMode::Atomic, CoherenceMode::Atomic) => DependenceKind::Atomic,
        (CoherenceMode::Simultaneous, CoherenceMode::Simultaneous) => DependenceKind::Simultaneous,
        _ => {
            if next.privilege == PrivilegeMode::WriteDiscard
                || (prev.privilege == ReadOnly && next.privilege.is_write())
            {
                DependenceKind::Anti
            } else {
                DependenceKind::True
            }
        }
    }
}

/// The data an operation touches: region, fields, privilege, coherence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionRequirement {
    /// The region being accessed.
    pub region: RegionHandle,
    /// The parent region through which privileges were obtained.
    pub parent: RegionHandle,
    /// The fields accessed.
    pub fields: BTreeSet<FieldId>,
    /// How the fields are accessed.
    pub privilege: PrivilegeMode,
    /// What may run concurrently.
    pub coherence: CoherenceMode,
    /// Reduction operator id, set iff `privilege` is [`PrivilegeMode::Reduce`].
    pub redop: Option<u32>,
}

impl RegionRequirement {
    /// Creates a requirement on a region with the given fields.
    #[must_use]
    pub fn new(
        region: RegionHandle,
        parent: RegionHandle,
        fields: impl IntoIterator<Item = FieldId>,
        privilege: PrivilegeMode,
        coherence: CoherenceMode,
    ) -> Self {
        Self {
            region,
            parent,
            fields: fields.into_iter().collect(),
            privilege,
            coherence,
            redop: None,
        }
    }

    /// Creates a reduction requirement with the given operator.
    #[must_use]
    pub fn reduction(
        region: RegionHandle,
        parent: RegionHandle,
        fields: impl IntoIterator<Item = FieldId>,
        redop: u32,
        coherence: CoherenceMode,
    ) -> Self {
        Self {
            region,
            parent,
            fields: fields.into_iter().collect(),
            privilege: PrivilegeMode::Reduce,
            coherence,
            redop: Some(redop),
        }
    }

    /// Localizes the requirement to its parent: the region becomes the
    /// parent region and coherence becomes exclusive. Used when flushing
    /// a child's state back into the enclosing context.
    #[must_use]
    pub fn localized(&self) -> Self {
        Self {
            region: self.parent,
            parent: self.parent,
            fields: self.fields.clone(),
            privilege: self.privilege,
            coherence: CoherenceMode::Exclusive,
            redop: self.redop,
        }
    }

    /// Returns true if the two requirements share at least one field.
    #[must_use]
    pub fn fields_overlap(&self, other: &Self) -> bool {
        self.fields.intersection(&other.fields).next().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(privilege: PrivilegeMode, coherence: CoherenceMode) -> RegionRequirement {
        RegionRequirement::new(
            RegionHandle::new_for_test(1),
            RegionHandle::new_for_test(1),
            [FieldId::new(0)],
            privilege,
            coherence,
        )
    }

    #[test]
    fn read_after_read_is_independent() {
        let a = req(PrivilegeMode::ReadOnly, CoherenceMode::Exclusive);
        let b = req(PrivilegeMode::ReadOnly, CoherenceMode::Exclusive);
        assert_eq!(check_dependence(&a, &b), DependenceKind::NoDependence);
    }

    #[test]
    fn read_after_write_is_true() {
        let w = req(PrivilegeMode::ReadWrite, CoherenceMode::Exclusive);
        let r = req(PrivilegeMode::ReadOnly, CoherenceMode::Exclusive);
        assert_eq!(check_dependence(&w, &r), DependenceKind::True);
    }

    #[test]
    fn write_after_read_is_anti() {
        let r = req(PrivilegeMode::ReadOnly, CoherenceMode::Exclusive);
        let w = req(PrivilegeMode::ReadWrite, CoherenceMode::Exclusive);
        assert_eq!(check_dependence(&r, &w), DependenceKind::Anti);
    }

    #[test]
    fn write_discard_is_anti() {
        let w1 = req(PrivilegeMode::ReadWrite, CoherenceMode::Exclusive);
        let w2 = req(PrivilegeMode::WriteDiscard, CoherenceMode::Exclusive);
        assert_eq!(check_dependence(&w1, &w2), DependenceKind::Anti);
    }

    #[test]
    fn matching_reductions_are_independent() {
        let region = RegionHandle::new_for_test(1);
        let a = RegionRequirement::reduction(
            region,
            region,
            [FieldId::new(0)],
            3,
            CoherenceMode::Exclusive,
        );
        let b = a.clone();
        assert_eq!(check_dependence(&a, &b), DependenceKind::NoDependence);

        let c = RegionRequirement::reduction(
            region,
            region,
            [FieldId::new(0)],
            4,
            CoherenceMode::Exclusive,
        );
        assert_eq!(check_dependence(&a, &c), DependenceKind::True);
    }

    #[test]
    fn coherence_downgrades() {
        let a = req(PrivilegeMode::ReadWrite, CoherenceMode::Atomic);
        let b = req(PrivilegeMode::ReadWrite, CoherenceMode::Atomic);
        assert_eq!(check_dependence(&a, &b), DependenceKind::Atomic);

        let c = req(PrivilegeMode::ReadWrite, CoherenceMode::Simultaneous);
        let d = req(PrivilegeMode::ReadWrite, CoherenceMode::Simultaneous);
        assert_eq!(check_dependence(&c, &d), DependenceKind::Simultaneous);

        let e = req(PrivilegeMode::ReadWrite, CoherenceMode::Relaxed);
        let f = req(PrivilegeMode::ReadWrite, CoherenceMode::Exclusive);
        assert_eq!(check_dependence(&e, &f), DependenceKind::NoDependence);
    }

    #[test]
    fn strength_ordering_matches_spec() {
        assert!(DependenceKind::True > DependenceKind::Anti);
        assert!(DependenceKind::Anti > DependenceKind::Atomic);
        assert!(DependenceKind::Atomic > DependenceKind::Simultaneous);
        assert!(DependenceKind::Simultaneous > DependenceKind::NoDependence);
    }

    #[test]
    fn localized_targets_parent_exclusively() {
        let parent = RegionHandle::new_for_test(1);
        let child = RegionHandle::new_for_test(2);
        let r = RegionRequirement::new(
            child,
            parent,
            [FieldId::new(0)],
            PrivilegeMode::ReadWrite,
            CoherenceMode::Simultaneous,
        );
        let l = r.localized();
        assert_eq!(l.region, parent);
        assert_eq!(l.coherence, CoherenceMode::Exclusive);
    }
}
