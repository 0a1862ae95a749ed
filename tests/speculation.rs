//! Predicate and speculation scenarios: predicate trees, blocking
//! samplers, speculation confirmation and mismatch quash, and the
//! must-epoch end-to-end behaviour.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Duration;

use common::{init_test_logging, inline_runtime, settle, threaded_runtime, wait_for};
use opstream::error::Result;
use opstream::forest::DefaultForest;
use opstream::mapper::{DefaultMapper, MapDecision, MapRequest, Mapper};
use opstream::op::must_epoch::DependenceRecord;
use opstream::types::ProcessorId;
use opstream::{
    CoherenceMode, CopyLauncher, ErrorKind, FieldId, FutureValue, MustEpochLauncher, OpKind,
    Predicate, PrivilegeMode, RegionHandle, RegionRequirement, Runtime, RuntimeConfig,
    TaskLauncher, UniqueOpId,
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

/// A mapper that always guesses `true` for unresolved predicates.
struct SpeculatingMapper {
    inner: DefaultMapper,
    speculations: AtomicUsize,
}

impl SpeculatingMapper {
    fn new(processors: Vec<ProcessorId>) -> Self {
        Self {
            inner: DefaultMapper::new(processors),
            speculations: AtomicUsize::new(0),
        }
    }
}

impl Mapper for SpeculatingMapper {
    fn map_operation(&self, request: &MapRequest<'_>) -> MapDecision {
        self.inner.map_operation(request)
    }

    fn select_processor(&self, op: UniqueOpId, kind: OpKind) -> ProcessorId {
        self.inner.select_processor(op, kind)
    }

    fn speculate(&self, _op: UniqueOpId, _kind: OpKind) -> Option<bool> {
        self.speculations.fetch_add(1, Ordering::SeqCst);
        Some(true)
    }

    fn map_must_epoch(
        &self,
        tasks: &[UniqueOpId],
        dependences: &[DependenceRecord],
    ) -> Result<Vec<MapDecision>> {
        self.inner.map_must_epoch(tasks, dependences)
    }
}

fn speculative_runtime() -> (Arc<Runtime>, Arc<SpeculatingMapper>) {
    let mapper = Arc::new(SpeculatingMapper::new(
        (0..4).map(ProcessorId::new_for_test).collect(),
    ));
    let runtime = Runtime::with_collaborators(
        RuntimeConfig::inline(),
        Arc::new(DefaultForest::new()),
        Arc::clone(&mapper) as Arc<dyn Mapper>,
    )
    .expect("runtime");
    (runtime, mapper)
}

/// A speculated copy whose predicate later resolves `true` confirms the
/// speculation and completes normally.
#[test]
fn speculation_match_rolls_forward() {
    init_test_logging();
    let (rt, mapper) = speculative_runtime();
    let ctx = rt.create_context("confirm");
    let field = FieldId::new(0);
    let src = ctx.create_region(&[field]);
    let dst = ctx.create_region(&[field]);

    let future = FutureValue::new();
    let predicate = ctx.create_future_predicate(&future);
    let done = ctx
        .issue_copy(
            CopyLauncher::new()
                .with_pair(read_req(src, field), write_req(dst, field))
                .with_predicate(predicate),
        )
        .expect("copy");

    // The copy mapped speculatively but cannot complete unresolved.
    assert_eq!(mapper.speculations.load(Ordering::SeqCst), 1);
    assert!(!done.has_triggered());

    future.complete(vec![1]);
    assert!(done.has_triggered());
    ctx.drain();
}

/// A speculated copy whose predicate resolves `false` is quashed: its
/// fresh generation completes the predicate-false path, and a dependent
/// operation sees the old edge as satisfied.
#[test]
fn speculation_mismatch_quashes_and_reissues() {
    init_test_logging();
    let (rt, mapper) = speculative_runtime();
    let ctx = rt.create_context("mismatch");
    let field = FieldId::new(0);
    let src = ctx.create_region(&[field]);
    let dst = ctx.create_region(&[field]);

    let future = FutureValue::new();
    let predicate = ctx.create_future_predicate(&future);
    let speculated = ctx
        .issue_copy(
            CopyLauncher::new()
                .with_pair(read_req(src, field), write_req(dst, field))
                .with_predicate(predicate),
        )
        .expect("speculated copy");
    assert_eq!(mapper.speculations.load(Ordering::SeqCst), 1);

    // A downstream copy registers an edge on the speculated generation.
    let downstream = ctx
        .issue_copy(CopyLauncher::new().with_pair(read_req(dst, field), write_req(src, field)))
        .expect("downstream copy");
    assert!(!speculated.has_triggered());
    assert!(!downstream.has_triggered());

    // Predicate resolves opposite to the guess: quash, then the fresh
    // generation completes as a no-op and the downstream edge unblocks.
    future.complete(vec![0]);
    assert!(speculated.has_triggered());
    assert!(downstream.has_triggered());
    ctx.drain();
}

/// A parked predicated task (no speculation hint) runs only when its
/// predicate resolves.
#[test]
fn parked_task_waits_for_predicate() {
    init_test_logging();
    let rt = threaded_runtime();
    let ctx = rt.create_context("parked");

    let future = FutureValue::new();
    let predicate = ctx.create_future_predicate(&future);
    let ran = Arc::new(AtomicUsize::new(0));
    let body_ran = Arc::clone(&ran);
    let result = ctx
        .issue_task(
            TaskLauncher::new(1)
                .with_predicate(predicate)
                .with_body(move || {
                    body_ran.fetch_add(1, Ordering::SeqCst);
                    vec![42]
                }),
        )
        .expect("task");

    settle();
    assert_eq!(ran.load(Ordering::SeqCst), 0, "task must stay parked");
    assert!(!result.is_ready());

    future.complete(vec![1]);
    assert!(wait_for(Duration::from_secs(5), || result.is_ready()));
    assert_eq!(ran.load(Ordering::SeqCst), 1);
    assert_eq!(result.get().expect("result"), vec![42]);
    ctx.drain();
}

/// The false branch of a parked predicated task elides the body.
#[test]
fn parked_task_false_elides_body() {
    init_test_logging();
    let rt = threaded_runtime();
    let ctx = rt.create_context("parked-false");

    let future = FutureValue::new();
    let predicate = ctx.create_future_predicate(&future);
    let ran = Arc::new(AtomicUsize::new(0));
    let body_ran = Arc::clone(&ran);
    let result = ctx
        .issue_task(
            TaskLauncher::new(1)
                .with_predicate(predicate)
                .with_body(move || {
                    body_ran.fetch_add(1, Ordering::SeqCst);
                    vec![42]
                }),
        )
        .expect("task");

    future.complete(vec![0]);
    assert!(wait_for(Duration::from_secs(5), || result.is_ready()));
    assert_eq!(ran.load(Ordering::SeqCst), 0, "false path skips the body");
    assert_eq!(result.get().expect("result"), Vec::<u8>::new());
    ctx.drain();
}

/// Compound predicates gate work through the waiter protocol.
#[test]
fn compound_predicate_gates_fill() {
    init_test_logging();
    let rt = inline_runtime();
    let ctx = rt.create_context("compound");
    let field = FieldId::new(0);
    let region = ctx.create_region(&[field]);

    let left = FutureValue::new();
    let right = FutureValue::new();
    let l = ctx.create_future_predicate(&left);
    let r = ctx.create_future_predicate(&right);
    let and = ctx.create_and_predicate(&l, &r);
    let not = ctx.create_not_predicate(&and);

    let done = ctx
        .issue_fill(
            opstream::FillLauncher::new(write_req(region, field), vec![1u8]).with_predicate(not),
        )
        .expect("fill");

    // `not(and(l, r))` is unresolved until `and` resolves; fills
    // speculate true, so the fill proceeds but cannot complete.
    assert!(!done.has_triggered());
    left.complete(vec![1]);
    right.complete(vec![1]);
    // and = true, not = false: the speculated-true fill is quashed onto
    // its false path and completes as a no-op.
    assert!(done.has_triggered());
    ctx.drain();
}

/// Blocking sampler: `wait_for_value` parks the caller until resolution.
#[test]
fn predicate_value_sampling_blocks() {
    init_test_logging();
    let rt = threaded_runtime();
    let ctx = rt.create_context("sampler");

    let future = FutureValue::new();
    let predicate = ctx.create_future_predicate(&future);
    let Predicate::Op(reference) = predicate else {
        panic!("expected predicate op");
    };

    let waiter = {
        let reference = reference.clone();
        std::thread::spawn(move || {
            let core = reference
                .handle()
                .predicate_core()
                .expect("predicate core");
            core.wait_for_value(ProcessorId::new_for_test(0))
        })
    };
    settle();
    future.complete(vec![1]);
    assert!(waiter.join().expect("sampler thread"));
    ctx.drain();
}

/// Must-epoch members really run concurrently: each body blocks on a
/// barrier the other must also reach.
#[test]
fn must_epoch_members_run_concurrently() {
    init_test_logging();
    let rt = threaded_runtime();
    let ctx = rt.create_context("epoch-e2e");
    let field = FieldId::new(0);
    let ra = ctx.create_region(&[field]);
    let rb = ctx.create_region(&[field]);

    let barrier = Arc::new(Barrier::new(2));
    let barrier_a = Arc::clone(&barrier);
    let barrier_b = Arc::clone(&barrier);

    let launcher = MustEpochLauncher::new()
        .with_task(
            TaskLauncher::new(1)
                .with_region(write_req(ra, field))
                .with_body(move || {
                    barrier_a.wait();
                    vec![b'a']
                }),
        )
        .with_task(
            TaskLauncher::new(2)
                .with_region(write_req(rb, field))
                .with_body(move || {
                    barrier_b.wait();
                    vec![b'b']
                }),
        );

    let map = ctx.execute_must_epoch(launcher).expect("epoch");
    assert!(wait_for(Duration::from_secs(5), || map
        .all_ready_event()
        .has_triggered()));
    map.wait_all_results().expect("both members completed");
    ctx.drain();
}

/// An epoch with a serialising dependence fails as a unit: every member
/// future is poisoned with the infeasibility error.
#[test]
fn infeasible_epoch_poisons_all_members() {
    init_test_logging();
    let rt = threaded_runtime();
    let ctx = rt.create_context("epoch-fail");
    let field = FieldId::new(0);
    let region = ctx.create_region(&[field]);

    let launcher = MustEpochLauncher::new()
        .with_task(TaskLauncher::new(1).with_region(write_req(region, field)))
        .with_task(TaskLauncher::new(2).with_region(write_req(region, field)));
    let map = ctx.execute_must_epoch(launcher).expect("launch");

    assert!(wait_for(Duration::from_secs(5), || map
        .all_ready_event()
        .has_triggered()));
    for point in 0..map.len() {
        let err = map
            .future(point)
            .expect("point")
            .get()
            .expect_err("poisoned");
        assert_eq!(err.kind(), ErrorKind::MustEpochInfeasible);
    }
    ctx.drain();
}
