//! Predicate operations.
//!
//! A predicate is an operation exposing a boolean value other operations
//! can sample. Samplers either get the resolved value back or register
//! as waiters and are notified when the predicate resolves. Compound
//! predicates (`not`, `and`, `or`) are themselves waiters on their
//! inputs and resolve by the usual short-circuit rules; a future
//! predicate resolves when its backing future becomes ready.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::context::TaskContext;
use crate::event::UserEvent;
use crate::future::FutureValue;
use crate::op::{OpCore, OpHandle, OpKind, Operation};
use crate::runtime::Runtime;
use crate::tracing_compat::trace;
use crate::types::{Generation, ProcessorId};

/// Interface for operations that need to learn a predicate's value.
pub trait PredicateWaiter: Send + Sync {
    /// Delivers the resolved value for the waiter generation that
    /// registered.
    fn notify_predicate_value(&self, gen: Generation, value: bool);
}

/// A user-facing predicate: a constant or a predicate operation.
#[derive(Clone, Debug)]
pub enum Predicate {
    /// A compile-time constant predicate.
    Const(bool),
    /// A predicate operation sampled at runtime.
    Op(PredicateRef),
}

impl Predicate {
    /// The always-true predicate.
    pub const TRUE: Self = Self::Const(true);
    /// The always-false predicate.
    pub const FALSE: Self = Self::Const(false);

    /// Returns true when the predicate is the constant `true`.
    #[must_use]
    pub fn is_const_true(&self) -> bool {
        matches!(self, Self::Const(true))
    }
}

/// A reference to a predicate operation at a specific generation.
///
/// Holds a mapping reference on the predicate for as long as any clone
/// is alive, so the predicate cannot commit and be recycled while a
/// holder may still sample it.
#[derive(Clone)]
pub struct PredicateRef {
    handle: OpHandle,
    gen: Generation,
    _guard: Arc<PredicateGuard>,
}

struct PredicateGuard {
    handle: OpHandle,
    gen: Generation,
}

impl Drop for PredicateGuard {
    fn drop(&mut self) {
        self.handle.core().remove_mapping_reference(self.gen);
    }
}

impl PredicateRef {
    pub(crate) fn new(handle: OpHandle, gen: Generation) -> Self {
        handle.core().add_mapping_reference(gen);
        Self {
            handle: handle.clone(),
            gen,
            _guard: Arc::new(PredicateGuard { handle, gen }),
        }
    }

    /// The underlying operation handle.
    #[must_use]
    pub fn handle(&self) -> &OpHandle {
        &self.handle
    }

    /// The generation at which the reference was taken.
    #[must_use]
    pub fn generation(&self) -> Generation {
        self.gen
    }

    pub(crate) fn predicate_core(&self) -> &PredicateCore {
        self.handle
            .predicate_core()
            .expect("predicate reference to non-predicate operation")
    }
}

impl std::fmt::Debug for PredicateRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PredicateRef({}@{})", self.handle.kind().name(), self.gen)
    }
}

struct PredState {
    resolved: bool,
    value: bool,
    waiters: Vec<(Weak<dyn PredicateWaiter>, Generation)>,
    waiter_event: Option<UserEvent>,
}

/// The value-plumbing shared by every predicate operation kind.
pub struct PredicateCore {
    state: Mutex<PredState>,
}

impl PredicateCore {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(PredState {
                resolved: false,
                value: false,
                waiters: Vec::new(),
                waiter_event: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PredState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn reset(&self) {
        let mut state = self.lock();
        state.resolved = false;
        state.value = false;
        state.waiters.clear();
        state.waiter_event = None;
    }

    /// Returns the resolved value, or registers the waiter and returns
    /// `None`.
    pub fn register_waiter(
        &self,
        waiter: Weak<dyn PredicateWaiter>,
        gen: Generation,
    ) -> Option<bool> {
        let mut state = self.lock();
        if state.resolved {
            Some(state.value)
        } else {
            state.waiters.push((waiter, gen));
            None
        }
    }

    /// Returns the resolved value without registering, if available.
    #[must_use]
    pub fn peek_value(&self) -> Option<bool> {
        let state = self.lock();
        state.resolved.then_some(state.value)
    }

    /// Resolves the predicate and notifies the registered waiters.
    ///
    /// Resolution is sticky: later calls are ignored.
    pub(crate) fn set_resolved_value(&self, owner: &OpCore, value: bool) {
        let (waiters, event) = {
            let mut state = self.lock();
            if state.resolved {
                return;
            }
            state.resolved = true;
            state.value = value;
            (
                std::mem::take(&mut state.waiters),
                state.waiter_event.take(),
            )
        };
        trace!(op = %owner.unique_id(), value, "predicate resolved");
        for (waiter, gen) in waiters {
            if let Some(waiter) = waiter.upgrade() {
                waiter.notify_predicate_value(gen, value);
            }
        }
        if let Some(event) = event {
            event.trigger();
        }
        // The predicate's own pipeline finishes at resolution.
        owner.complete_execution();
    }

    /// Samples the predicate from an application thread, blocking until
    /// it resolves. Must not be called with operation locks held.
    pub fn wait_for_value(&self, proc: ProcessorId) -> bool {
        let event = {
            let mut state = self.lock();
            if state.resolved {
                return state.value;
            }
            state
                .waiter_event
                .get_or_insert_with(UserEvent::new)
                .clone()
        };
        trace!(%proc, "waiting for predicate value");
        event.event().wait();
        let state = self.lock();
        debug_assert!(state.resolved);
        state.value
    }
}

/// A predicate backed by a future value.
///
/// Resolution happens when the future becomes ready; the payload's first
/// byte is the boolean.
pub struct FuturePredOp {
    core: OpCore,
    predicate: PredicateCore,
    state: Mutex<Option<FutureValue>>,
}

impl FuturePredOp {
    pub(crate) fn new(runtime: &Arc<Runtime>) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let self_ref: Weak<dyn Operation> = weak.clone();
            Self {
                core: OpCore::new(Arc::clone(runtime), self_ref),
                predicate: PredicateCore::new(),
                state: Mutex::new(None),
            }
        })
    }

    pub(crate) fn initialize(self: &Arc<Self>, ctx: &Arc<TaskContext>, future: FutureValue) {
        self.predicate.reset();
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = Some(future);
        self.core.initialize_operation(ctx, true, 0);
    }

    fn resolve_future_predicate(self: &Arc<Self>) {
        let future = self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(future) = future {
            let value = future.get_bool().unwrap_or(false);
            self.predicate.set_resolved_value(&self.core, value);
        }
    }
}

impl Operation for FuturePredOp {
    fn core(&self) -> &OpCore {
        &self.core
    }

    fn kind(&self) -> OpKind {
        OpKind::FuturePred
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
    }

    fn predicate_core(&self) -> Option<&PredicateCore> {
        Some(&self.predicate)
    }

    fn trigger_mapping(&self) {
        self.core.complete_mapping();
        self.core.resolve_speculation();
        // Execution completes when the future resolves the predicate.
        let future = self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(future) = future else {
            self.core.complete_execution();
            return;
        };
        let weak = Arc::downgrade(&self.core.handle().into_arc());
        let runtime = Arc::clone(self.core.runtime());
        future.ready_event().subscribe(move || {
            let Some(op) = weak.upgrade() else { return };
            runtime.defer(move || {
                let this = op
                    .as_any_arc()
                    .downcast::<FuturePredOp>()
                    .expect("future predicate type");
                this.resolve_future_predicate();
            });
        });
    }
}

/// Negation of another predicate.
pub struct NotPredOp {
    core: OpCore,
    predicate: PredicateCore,
    input: Mutex<Option<PredicateRef>>,
}

impl NotPredOp {
    pub(crate) fn new(runtime: &Arc<Runtime>) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let self_ref: Weak<dyn Operation> = weak.clone();
            Self {
                core: OpCore::new(Arc::clone(runtime), self_ref),
                predicate: PredicateCore::new(),
                input: Mutex::new(None),
            }
        })
    }

    pub(crate) fn initialize(
        self: &Arc<Self>,
        ctx: &Arc<TaskContext>,
        input: &Predicate,
    ) {
        self.predicate.reset();
        self.core.initialize_operation(ctx, true, 0);
        match input {
            Predicate::Const(v) => {
                *self.input.lock().unwrap_or_else(PoisonError::into_inner) = None;
                self.predicate.set_resolved_value(&self.core, !v);
            }
            Predicate::Op(pred) => {
                *self.input.lock().unwrap_or_else(PoisonError::into_inner) = Some(pred.clone());
                let waiter: Weak<dyn PredicateWaiter> =
                    Arc::downgrade(&(self.clone() as Arc<dyn PredicateWaiter>));
                if let Some(value) = pred
                    .predicate_core()
                    .register_waiter(waiter, self.core.generation())
                {
                    self.predicate.set_resolved_value(&self.core, !value);
                }
            }
        }
    }
}

impl Operation for NotPredOp {
    fn core(&self) -> &OpCore {
        &self.core
    }

    fn kind(&self) -> OpKind {
        OpKind::NotPred
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
    }

    fn predicate_core(&self) -> Option<&PredicateCore> {
        Some(&self.predicate)
    }

    fn trigger_dependence_analysis(&self) {
        self.core.begin_dependence_analysis();
        if !self.core.replay_trace_dependences() {
            let input = self
                .input
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            if let Some(pred) = input {
                self.core
                    .register_dependence(pred.handle(), pred.generation());
            }
        }
        self.core.end_dependence_analysis();
    }

    fn trigger_mapping(&self) {
        self.core.complete_mapping();
        self.core.resolve_speculation();
        // Execution completes at predicate resolution.
        if self.predicate.peek_value().is_some() {
            self.core.complete_execution();
        }
    }
}

impl PredicateWaiter for NotPredOp {
    fn notify_predicate_value(&self, _gen: Generation, value: bool) {
        self.predicate.set_resolved_value(&self.core, !value);
    }
}

macro_rules! binary_pred_op {
    ($(#[$meta:meta])* $name:ident, $kind:expr, $short_value:literal) => {
        $(#[$meta])*
        pub struct $name {
            core: OpCore,
            predicate: PredicateCore,
            inputs: Mutex<BinaryInputs>,
        }

        impl $name {
            pub(crate) fn new(runtime: &Arc<Runtime>) -> Arc<Self> {
                Arc::new_cyclic(|weak: &Weak<Self>| {
                    let self_ref: Weak<dyn Operation> = weak.clone();
                    Self {
                        core: OpCore::new(Arc::clone(runtime), self_ref),
                        predicate: PredicateCore::new(),
                        inputs: Mutex::new(BinaryInputs::default()),
                    }
                })
            }

            pub(crate) fn initialize(
                self: &Arc<Self>,
                ctx: &Arc<TaskContext>,
                left: &Predicate,
                right: &Predicate,
            ) {
                self.predicate.reset();
                {
                    let mut inputs =
                        self.inputs.lock().unwrap_or_else(PoisonError::into_inner);
                    *inputs = BinaryInputs::default();
                    if let Predicate::Op(p) = left {
                        inputs.left = Some(p.clone());
                    }
                    if let Predicate::Op(p) = right {
                        inputs.right = Some(p.clone());
                    }
                }
                self.core.initialize_operation(ctx, true, 0);
                if let Predicate::Const(v) = left {
                    self.input_resolved(Side::Left, *v);
                }
                if let Predicate::Const(v) = right {
                    self.input_resolved(Side::Right, *v);
                }
                let gen = self.core.generation();
                let pending: Vec<(Side, PredicateRef)> = {
                    let inputs =
                        self.inputs.lock().unwrap_or_else(PoisonError::into_inner);
                    [
                        (Side::Left, inputs.left.clone()),
                        (Side::Right, inputs.right.clone()),
                    ]
                    .into_iter()
                    .filter_map(|(side, p)| p.map(|p| (side, p)))
                    .collect()
                };
                for (side, pred) in pending {
                    let waiter: Weak<dyn PredicateWaiter> =
                        Arc::downgrade(&(self.clone() as Arc<dyn PredicateWaiter>));
                    if let Some(value) =
                        pred.predicate_core().register_waiter(waiter, gen)
                    {
                        self.input_resolved(side, value);
                    }
                }
            }

            fn input_resolved(&self, side: Side, value: bool) {
                let decision = {
                    let mut inputs =
                        self.inputs.lock().unwrap_or_else(PoisonError::into_inner);
                    match side {
                        Side::Left => {
                            inputs.left_value = Some(value);
                        }
                        Side::Right => {
                            inputs.right_value = Some(value);
                        }
                    }
                    // Short-circuit on the dominating value, otherwise
                    // wait for both.
                    if value == $short_value {
                        Some($short_value)
                    } else {
                        match (inputs.left_value, inputs.right_value) {
                            (Some(l), Some(r)) => Some(if $short_value { l || r } else { l && r }),
                            _ => None,
                        }
                    }
                };
                if let Some(value) = decision {
                    self.predicate.set_resolved_value(&self.core, value);
                }
            }
        }

        impl Operation for $name {
            fn core(&self) -> &OpCore {
                &self.core
            }

            fn kind(&self) -> OpKind {
                $kind
            }

            fn as_any_arc(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
                self
            }

            fn predicate_core(&self) -> Option<&PredicateCore> {
                Some(&self.predicate)
            }

            fn trigger_dependence_analysis(&self) {
                self.core.begin_dependence_analysis();
                if !self.core.replay_trace_dependences() {
                    let (left, right) = {
                        let inputs =
                            self.inputs.lock().unwrap_or_else(PoisonError::into_inner);
                        (inputs.left.clone(), inputs.right.clone())
                    };
                    for pred in [left, right].into_iter().flatten() {
                        self.core
                            .register_dependence(pred.handle(), pred.generation());
                    }
                }
                self.core.end_dependence_analysis();
            }

            fn trigger_mapping(&self) {
                self.core.complete_mapping();
                self.core.resolve_speculation();
                if self.predicate.peek_value().is_some() {
                    self.core.complete_execution();
                }
            }
        }

        impl PredicateWaiter for $name {
            fn notify_predicate_value(&self, _gen: Generation, value: bool) {
                // Which side resolved does not matter for the lattice;
                // record it on the first unresolved side.
                let side = {
                    let inputs =
                        self.inputs.lock().unwrap_or_else(PoisonError::into_inner);
                    if inputs.left_value.is_none() {
                        Side::Left
                    } else {
                        Side::Right
                    }
                };
                self.input_resolved(side, value);
            }
        }
    };
}

#[derive(Clone, Copy)]
enum Side {
    Left,
    Right,
}

#[derive(Default)]
struct BinaryInputs {
    left: Option<PredicateRef>,
    right: Option<PredicateRef>,
    left_value: Option<bool>,
    right_value: Option<bool>,
}

binary_pred_op!(
    /// Conjunction of two predicates: resolves `false` on the first
    /// `false` input, otherwise once both inputs have resolved.
    AndPredOp,
    OpKind::AndPred,
    false
);

binary_pred_op!(
    /// Disjunction of two predicates: resolves `true` on the first
    /// `true` input, otherwise once both inputs have resolved.
    OrPredOp,
    OpKind::OrPred,
    true
);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;

    fn setup() -> (Arc<Runtime>, Arc<TaskContext>) {
        let rt = Runtime::new(RuntimeConfig::inline()).expect("runtime");
        let ctx = rt.create_context("predicates");
        (rt, ctx)
    }

    #[test]
    fn future_pred_resolves_from_future() {
        let (_rt, ctx) = setup();
        let future = FutureValue::new();
        let pred = ctx.create_future_predicate(&future);
        let Predicate::Op(pred) = pred else {
            panic!("expected predicate op");
        };
        assert_eq!(pred.predicate_core().peek_value(), None);

        future.complete(vec![1]);
        assert_eq!(pred.predicate_core().peek_value(), Some(true));
    }

    #[test]
    fn future_pred_false_payload() {
        let (_rt, ctx) = setup();
        let future = FutureValue::new();
        let pred = ctx.create_future_predicate(&future);
        let Predicate::Op(pred) = pred else {
            panic!("expected predicate op");
        };
        future.complete(vec![0]);
        assert_eq!(pred.predicate_core().peek_value(), Some(false));
    }

    #[test]
    fn not_pred_inverts() {
        let (_rt, ctx) = setup();
        let future = FutureValue::new();
        let inner = ctx.create_future_predicate(&future);
        let not = ctx.create_not_predicate(&inner);
        let Predicate::Op(not) = not else {
            panic!("expected predicate op");
        };
        assert_eq!(not.predicate_core().peek_value(), None);
        future.complete(vec![1]);
        assert_eq!(not.predicate_core().peek_value(), Some(false));
    }

    #[test]
    fn and_pred_short_circuits_on_false() {
        let (_rt, ctx) = setup();
        let left = FutureValue::new();
        let right = FutureValue::new();
        let l = ctx.create_future_predicate(&left);
        let r = ctx.create_future_predicate(&right);
        let and = ctx.create_and_predicate(&l, &r);
        let Predicate::Op(and) = and else {
            panic!("expected predicate op");
        };
        left.complete(vec![0]);
        // Right never resolves, yet the conjunction is already false.
        assert_eq!(and.predicate_core().peek_value(), Some(false));
    }

    #[test]
    fn and_pred_waits_for_both_on_true() {
        let (_rt, ctx) = setup();
        let left = FutureValue::new();
        let right = FutureValue::new();
        let l = ctx.create_future_predicate(&left);
        let r = ctx.create_future_predicate(&right);
        let and = ctx.create_and_predicate(&l, &r);
        let Predicate::Op(and) = and else {
            panic!("expected predicate op");
        };
        left.complete(vec![1]);
        assert_eq!(and.predicate_core().peek_value(), None);
        right.complete(vec![1]);
        assert_eq!(and.predicate_core().peek_value(), Some(true));
    }

    #[test]
    fn or_pred_short_circuits_on_true() {
        let (_rt, ctx) = setup();
        let left = FutureValue::new();
        let right = FutureValue::new();
        let l = ctx.create_future_predicate(&left);
        let r = ctx.create_future_predicate(&right);
        let or = ctx.create_or_predicate(&l, &r);
        let Predicate::Op(or) = or else {
            panic!("expected predicate op");
        };
        right.complete(vec![1]);
        assert_eq!(or.predicate_core().peek_value(), Some(true));
    }

    #[test]
    fn or_pred_false_needs_both() {
        let (_rt, ctx) = setup();
        let left = FutureValue::new();
        let right = FutureValue::new();
        let l = ctx.create_future_predicate(&left);
        let r = ctx.create_future_predicate(&right);
        let or = ctx.create_or_predicate(&l, &r);
        let Predicate::Op(or) = or else {
            panic!("expected predicate op");
        };
        left.complete(vec![0]);
        assert_eq!(or.predicate_core().peek_value(), None);
        right.complete(vec![0]);
        assert_eq!(or.predicate_core().peek_value(), Some(false));
    }

    #[test]
    fn compound_of_constants_resolves_immediately() {
        let (_rt, ctx) = setup();
        let and = ctx.create_and_predicate(&Predicate::TRUE, &Predicate::FALSE);
        let Predicate::Op(and) = and else {
            panic!("expected predicate op");
        };
        assert_eq!(and.predicate_core().peek_value(), Some(false));

        let not = ctx.create_not_predicate(&Predicate::FALSE);
        let Predicate::Op(not) = not else {
            panic!("expected predicate op");
        };
        assert_eq!(not.predicate_core().peek_value(), Some(true));
    }
}
