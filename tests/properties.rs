//! Property tests for the dependence lattice, event merging, and the
//! issue/drain idempotence of the pipeline.

mod common;

use common::{init_test_logging, inline_runtime, test_proptest_config};
use opstream::types::check_dependence;
use opstream::{
    CoherenceMode, DependenceKind, Event, FieldId, PrivilegeMode, RegionHandle, RegionRequirement,
    TaskLauncher, UserEvent,
};
use proptest::prelude::*;

fn arb_privilege() -> impl Strategy<Value = PrivilegeMode> {
    prop_oneof![
        Just(PrivilegeMode::NoAccess),
        Just(PrivilegeMode::ReadOnly),
        Just(PrivilegeMode::ReadWrite),
        Just(PrivilegeMode::WriteDiscard),
        Just(PrivilegeMode::Reduce),
    ]
}

fn arb_coherence() -> impl Strategy<Value = CoherenceMode> {
    prop_oneof![
        Just(CoherenceMode::Exclusive),
        Just(CoherenceMode::Atomic),
        Just(CoherenceMode::Simultaneous),
        Just(CoherenceMode::Relaxed),
    ]
}

fn arb_requirement() -> impl Strategy<Value = RegionRequirement> {
    (arb_privilege(), arb_coherence(), proptest::option::of(0u32..4)).prop_map(
        |(privilege, coherence, redop)| {
            let region = RegionHandle::new_for_test(1);
            let mut requirement = RegionRequirement::new(
                region,
                region,
                [FieldId::new(0)],
                privilege,
                coherence,
            );
            if privilege == PrivilegeMode::Reduce {
                requirement.redop = redop.or(Some(0));
            }
            requirement
        },
    )
}

proptest! {
    #![proptest_config(test_proptest_config(256))]

    /// Two read-only requirements never interfere.
    #[test]
    fn reads_never_depend(coh1 in arb_coherence(), coh2 in arb_coherence()) {
        init_test_logging();
        let region = RegionHandle::new_for_test(1);
        let a = RegionRequirement::new(
            region, region, [FieldId::new(0)], PrivilegeMode::ReadOnly, coh1,
        );
        let b = RegionRequirement::new(
            region, region, [FieldId::new(0)], PrivilegeMode::ReadOnly, coh2,
        );
        prop_assert_eq!(check_dependence(&a, &b), DependenceKind::NoDependence);
    }

    /// Relaxed coherence on either side erases any dependence.
    #[test]
    fn relaxed_erases_dependence(prev in arb_requirement(), next in arb_requirement()) {
        init_test_logging();
        let mut prev = prev;
        prev.coherence = CoherenceMode::Relaxed;
        prop_assert_eq!(check_dependence(&prev, &next), DependenceKind::NoDependence);
    }

    /// An ordering dependence requires a writer somewhere in the pair.
    #[test]
    fn ordering_implies_a_writer(prev in arb_requirement(), next in arb_requirement()) {
        init_test_logging();
        let dtype = check_dependence(&prev, &next);
        if dtype.is_ordering() {
            prop_assert!(prev.privilege.is_write() || next.privilege.is_write());
        }
    }

    /// Serialising kinds are exactly true and anti dependences.
    #[test]
    fn serialising_matches_strength(prev in arb_requirement(), next in arb_requirement()) {
        init_test_logging();
        let dtype = check_dependence(&prev, &next);
        prop_assert_eq!(
            dtype.is_serialising(),
            dtype >= DependenceKind::Anti && dtype.is_ordering()
        );
    }

    /// A merged event fires exactly when all inputs have fired.
    #[test]
    fn merge_waits_for_every_input(count in 1usize..8) {
        init_test_logging();
        let users: Vec<UserEvent> = (0..count).map(|_| UserEvent::new()).collect();
        let merged = Event::merge(users.iter().map(UserEvent::event));
        for (index, user) in users.iter().enumerate() {
            prop_assert!(!merged.has_triggered(), "input {index} still pending");
            user.trigger();
        }
        prop_assert!(merged.has_triggered());
    }

    /// Issuing any number of independent tasks drains to an empty
    /// context with every future completed.
    #[test]
    fn issue_and_drain_reaches_quiescence(count in 1usize..24) {
        init_test_logging();
        let rt = inline_runtime();
        let ctx = rt.create_context("prop");
        let futures: Vec<_> = (0..count)
            .map(|id| {
                ctx.issue_task(TaskLauncher::new(id as u64).with_body(move || vec![id as u8]))
                    .expect("task")
            })
            .collect();
        ctx.drain();
        prop_assert!(ctx.outstanding_ops().is_empty());
        for (id, future) in futures.iter().enumerate() {
            prop_assert_eq!(future.get().expect("result"), vec![id as u8]);
        }
    }

    /// A straight-line chain over one field drains regardless of length.
    #[test]
    fn dependent_chain_reaches_quiescence(count in 1usize..16) {
        init_test_logging();
        let rt = inline_runtime();
        let ctx = rt.create_context("prop-chain");
        let field = FieldId::new(0);
        let region = ctx.create_region(&[field]);
        for id in 0..count {
            let requirement = RegionRequirement::new(
                region,
                region,
                [field],
                PrivilegeMode::ReadWrite,
                CoherenceMode::Exclusive,
            );
            ctx.issue_task(TaskLauncher::new(id as u64).with_region(requirement))
                .expect("task");
        }
        ctx.drain();
        prop_assert!(ctx.outstanding_ops().is_empty());
    }
}
