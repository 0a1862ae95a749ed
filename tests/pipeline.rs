//! End-to-end pipeline scenarios: chains, independent pairs, fences,
//! predicate-false completion, and commit ordering.

mod common;

use std::time::Duration;

use common::{init_test_logging, inline_runtime, settle, threaded_runtime, wait_for};
use opstream::{
    CoherenceMode, FenceKind, FieldId, FillLauncher, Predicate, PrivilegeMode, RegionHandle,
    RegionRequirement, TaskLauncher, UserEvent,
};

fn write_req(region: RegionHandle, field: FieldId) -> RegionRequirement {
    RegionRequirement::new(
        region,
        region,
        [field],
        PrivilegeMode::ReadWrite,
        CoherenceMode::Exclusive,
    )
}

fn read_req(region: RegionHandle, field: FieldId) -> RegionRequirement {
    RegionRequirement::new(
        region,
        region,
        [field],
        PrivilegeMode::ReadOnly,
        CoherenceMode::Exclusive,
    )
}

/// Three tasks writing the same field form a chain: completions fire in
/// issue order and nothing commits until the tail completes.
#[test]
fn linear_chain_completes_in_order_and_commits_after_tail() {
    init_test_logging();
    let rt = threaded_runtime();
    let ctx = rt.create_context("chain");
    let field = FieldId::new(0);
    let region = ctx.create_region(&[field]);

    let tail_gate = UserEvent::new();
    let gate_event = tail_gate.event();

    let fa = ctx
        .issue_task(TaskLauncher::new(1).with_region(write_req(region, field)))
        .expect("task a");
    let fb = ctx
        .issue_task(TaskLauncher::new(2).with_region(write_req(region, field)))
        .expect("task b");
    let fc = ctx
        .issue_task(
            TaskLauncher::new(3)
                .with_region(write_req(region, field))
                .with_body(move || {
                    gate_event.wait();
                    Vec::new()
                }),
        )
        .expect("task c");

    // A and B complete while C is still held by its body.
    assert!(wait_for(Duration::from_secs(5), || fb.is_ready()));
    assert!(fa.is_ready(), "a completes before b");
    settle();
    assert!(!fc.is_ready(), "c is gated");

    // Commit cannot fire anywhere until the tail completes: every op is
    // still outstanding.
    assert_eq!(ctx.outstanding_ops().len(), 3);

    tail_gate.trigger();
    assert!(wait_for(Duration::from_secs(5), || fc.is_ready()));
    ctx.drain();
    assert!(ctx.outstanding_ops().is_empty());
}

/// Readers of disjoint fields are independent: either may complete and
/// commit without the other.
#[test]
fn independent_pair_commits_independently() {
    init_test_logging();
    let rt = threaded_runtime();
    let ctx = rt.create_context("pair");
    let f = FieldId::new(0);
    let g = FieldId::new(1);
    let region = ctx.create_region(&[f, g]);

    let x_gate = UserEvent::new();
    let gate_event = x_gate.event();

    let fx = ctx
        .issue_task(
            TaskLauncher::new(1)
                .with_region(read_req(region, f))
                .with_body(move || {
                    gate_event.wait();
                    Vec::new()
                }),
        )
        .expect("task x");
    let fy = ctx
        .issue_task(TaskLauncher::new(2).with_region(read_req(region, g)))
        .expect("task y");

    // Y completes and commits while X is still gated.
    assert!(wait_for(Duration::from_secs(5), || ctx
        .outstanding_ops()
        .len()
        == 1));
    assert!(fy.is_ready());
    assert!(!fx.is_ready());

    x_gate.trigger();
    assert!(wait_for(Duration::from_secs(5), || fx.is_ready()));
    ctx.drain();
}

/// A predicate-false fill completes as a no-op: its completion event
/// fires with nothing written and commit follows.
#[test]
fn predicate_false_fill_completes_and_commits() {
    init_test_logging();
    let rt = inline_runtime();
    let ctx = rt.create_context("pred-false");
    let field = FieldId::new(0);
    let region = ctx.create_region(&[field]);

    let done = ctx
        .issue_fill(
            FillLauncher::new(write_req(region, field), vec![0xFF; 4])
                .with_predicate(Predicate::FALSE),
        )
        .expect("fill");
    assert!(done.has_triggered());
    ctx.drain();
    assert!(ctx.outstanding_ops().is_empty());
}

/// An execution fence holds later work until earlier completions fire.
#[test]
fn execution_fence_orders_unrelated_work() {
    init_test_logging();
    let rt = threaded_runtime();
    let ctx = rt.create_context("fence");
    let f = FieldId::new(0);
    let g = FieldId::new(1);
    let region = ctx.create_region(&[f, g]);

    let gate = UserEvent::new();
    let gate_event = gate.event();

    let _before = ctx
        .issue_task(
            TaskLauncher::new(1)
                .with_region(write_req(region, f))
                .with_body(move || {
                    gate_event.wait();
                    Vec::new()
                }),
        )
        .expect("gated writer");

    let fence_done = ctx.issue_fence(FenceKind::Execution);

    // The fence waits on the gated writer even though a later task
    // touches a disjoint field.
    let after = ctx
        .issue_task(TaskLauncher::new(2).with_region(write_req(region, g)))
        .expect("after");
    settle();
    assert!(!fence_done.has_triggered());

    gate.trigger();
    assert!(wait_for(Duration::from_secs(5), || fence_done
        .has_triggered()));
    assert!(wait_for(Duration::from_secs(5), || after.is_ready()));
    ctx.drain();
}

/// A chain of a thousand tasks, each awaiting the previous result,
/// completes in issue order and drains to nothing.
#[test]
fn thousand_op_chain_drains() {
    init_test_logging();
    let rt = inline_runtime();
    let ctx = rt.create_context("thousand");

    let mut previous: Option<opstream::FutureValue> = None;
    for id in 0..1000u64 {
        let prior = previous.clone();
        let future = ctx
            .issue_task(TaskLauncher::new(id).with_body(move || {
                if let Some(prior) = &prior {
                    prior.get().expect("previous result");
                }
                id.to_le_bytes().to_vec()
            }))
            .expect("task");
        previous = Some(future);
    }

    let last = previous.expect("issued");
    assert_eq!(
        last.get().expect("tail result"),
        999u64.to_le_bytes().to_vec()
    );
    ctx.drain();
    assert!(ctx.outstanding_ops().is_empty());
}

/// Attach/acquire/release/detach interleave with ordinary operations.
#[test]
fn restricted_region_round_trip() {
    init_test_logging();
    let rt = inline_runtime();
    let ctx = rt.create_context("restricted");
    let field = FieldId::new(0);
    let region = ctx.create_region(&[field]);

    ctx.attach_file(
        opstream::AttachLauncher::new(region, "checkpoint.h5").with_dataset(field, "/chk/f0"),
    )
    .expect("attach");
    assert!(rt.forest().is_restricted(region));

    ctx.issue_acquire(opstream::CoherenceLauncher::new(region, [field]))
        .expect("acquire");
    let fill = ctx
        .issue_fill(FillLauncher::new(write_req(region, field), vec![0u8; 8]))
        .expect("fill while acquired");
    assert!(fill.has_triggered());

    ctx.issue_release(opstream::CoherenceLauncher::new(region, [field]))
        .expect("release");
    ctx.detach_region(region, [field]).expect("detach");
    assert!(!rt.forest().is_restricted(region));
    ctx.drain();
}

/// Subregion writers are flushed by a runtime-inserted close before a
/// parent-level reader runs.
#[test]
fn close_is_injected_between_child_writer_and_parent_reader() {
    init_test_logging();
    let rt = threaded_runtime();
    let ctx = rt.create_context("close");
    let field = FieldId::new(0);
    let region = ctx.create_region(&[field]);
    let (partition, ready) = ctx.create_equal_partition(region, 2, 1).expect("partition");
    assert!(wait_for(Duration::from_secs(5), || ready.has_triggered()));
    let child = rt.forest().subregion(partition, 0).expect("child");

    let gate = UserEvent::new();
    let gate_event = gate.event();
    let child_req = RegionRequirement::new(
        child,
        region,
        [field],
        PrivilegeMode::ReadWrite,
        CoherenceMode::Exclusive,
    );
    let _writer = ctx
        .issue_task(
            TaskLauncher::new(1)
                .with_region(child_req)
                .with_body(move || {
                    gate_event.wait();
                    Vec::new()
                }),
        )
        .expect("child writer");

    let reader = ctx
        .issue_task(TaskLauncher::new(2).with_region(read_req(region, field)))
        .expect("parent reader");

    settle();
    assert!(
        !reader.is_ready(),
        "the close chains the reader behind the gated child writer"
    );

    gate.trigger();
    assert!(wait_for(Duration::from_secs(5), || reader.is_ready()));
    ctx.drain();
}
