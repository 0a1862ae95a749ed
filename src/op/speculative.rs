//! The speculation state machine layered over the operation base.
//!
//! A speculative operation is predicated: before mapping it samples its
//! predicate. If the predicate has resolved, the operation takes the
//! matching resolve path. If not, the kind-specific `speculate` hook may
//! guess a value and continue; a later mismatch quashes the operation
//! (bumping its generation so downstream edges read as satisfied) and
//! re-runs the correct path on the fresh generation.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::context::TaskContext;
use crate::op::predicate::{Predicate, PredicateRef, PredicateWaiter};
use crate::op::Operation;
use crate::tracing_compat::{debug, trace};
use crate::types::{Generation, ProcessorId};

/// The five speculation states between dependence analysis and mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecState {
    /// Waiting to map; the predicate has not been consulted or did not
    /// permit progress.
    PendingMap,
    /// Proceeding on a guessed `true` before the predicate resolved.
    SpeculateTrue,
    /// Proceeding on a guessed `false` before the predicate resolved.
    SpeculateFalse,
    /// The predicate resolved `true`.
    ResolveTrue,
    /// The predicate resolved `false`.
    ResolveFalse,
}

struct SpecData {
    state: SpecState,
    predicate: Option<PredicateRef>,
    received_trigger_resolution: bool,
}

/// The speculation bookkeeping embedded in each predicated operation.
pub struct SpecCore {
    state: Mutex<SpecData>,
}

impl SpecCore {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(SpecData {
                state: SpecState::PendingMap,
                predicate: None,
                received_trigger_resolution: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SpecData> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The current speculation state.
    #[must_use]
    pub fn state(&self) -> SpecState {
        self.lock().state
    }

    /// True when the operation was issued with a real predicate.
    #[must_use]
    pub fn is_predicated(&self) -> bool {
        self.lock().predicate.is_some()
    }
}

/// A predicated operation: the speculation hooks the base pipeline calls.
pub trait Speculative: Operation {
    /// The speculation bookkeeping.
    fn spec_core(&self) -> &SpecCore;

    /// Asks the kind whether to speculate while the predicate is
    /// unresolved. Returning `None` declines and parks the operation.
    fn speculate(&self) -> Option<bool> {
        None
    }

    /// Proceed along the predicate-true path (normal mapping).
    fn resolve_true(&self);

    /// Complete along the predicate-false path (no-op with
    /// predicate-false results).
    fn resolve_false(&self);
}

/// Wires the predicate into a freshly initialized speculative operation.
///
/// Registers a dependence on the predicate operation during analysis is
/// the caller's job; this installs the value plumbing.
pub(crate) fn initialize_speculation<T>(
    op: &Arc<T>,
    ctx: &Arc<TaskContext>,
    track: bool,
    regions: usize,
    predicate: &Predicate,
) where
    T: Speculative + PredicateWaiter,
{
    {
        let mut data = op.spec_core().lock();
        data.state = SpecState::PendingMap;
        data.received_trigger_resolution = false;
        data.predicate = match predicate {
            Predicate::Op(p) => Some(p.clone()),
            Predicate::Const(_) => None,
        };
    }
    op.core().initialize_operation(ctx, track, regions);
    if let Predicate::Const(false) = predicate {
        // Constant-false predicates resolve immediately; the op will
        // take the resolve_false path at mapping.
        op.spec_core().lock().state = SpecState::ResolveFalse;
    } else if let Predicate::Const(true) = predicate {
        op.spec_core().lock().state = SpecState::ResolveTrue;
    }
}

/// Registers the analysis-time dependence on the predicate operation,
/// keeping the predicate alive until this operation resolves.
pub(crate) fn register_predicate_dependence(op: &dyn Speculative) {
    let predicate = op.spec_core().lock().predicate.clone();
    if let Some(pred) = predicate {
        op.core()
            .register_dependence(pred.handle(), pred.generation());
    }
}

/// Resolution trigger for speculative kinds: resolution is driven by
/// the predicate, so the trigger only records that it arrived.
pub(crate) fn trigger_resolution(op: &dyn Speculative) {
    let mut data = op.spec_core().lock();
    data.received_trigger_resolution = true;
    if data.predicate.is_none() {
        drop(data);
        op.core().resolve_speculation();
    }
}

/// The mapping gate: consult the predicate and choose a path.
///
/// Replaces the default `trigger_mapping` for speculative kinds.
pub(crate) fn trigger_mapping<T>(op: &Arc<T>)
where
    T: Speculative + PredicateWaiter,
{
    let decision = {
        let core = op.spec_core();
        let mut data = core.lock();
        match data.state {
            SpecState::ResolveTrue => Decision::ResolveTrue,
            SpecState::ResolveFalse => Decision::ResolveFalse,
            SpecState::SpeculateTrue | SpecState::SpeculateFalse => {
                debug_assert!(false, "mapping gate entered twice");
                return;
            }
            SpecState::PendingMap => match data.predicate.clone() {
                None => {
                    // Unpredicated: resolve immediately.
                    data.state = SpecState::ResolveTrue;
                    Decision::ResolveTrue
                }
                Some(pred) => {
                    drop(data);
                    let waiter: Weak<dyn PredicateWaiter> =
                        Arc::downgrade(&(op.clone() as Arc<dyn PredicateWaiter>));
                    let gen = op.core().generation();
                    match pred.predicate_core().register_waiter(waiter, gen) {
                        Some(value) => {
                            let mut data = core.lock();
                            data.state = if value {
                                SpecState::ResolveTrue
                            } else {
                                SpecState::ResolveFalse
                            };
                            if value {
                                Decision::ResolveTrue
                            } else {
                                Decision::ResolveFalse
                            }
                        }
                        None => match op.speculate() {
                            Some(guess) => {
                                let mut data = core.lock();
                                // The predicate may have resolved while
                                // the hook ran; the waiter notification
                                // already drove the op in that case.
                                if data.state == SpecState::PendingMap {
                                    data.state = if guess {
                                        SpecState::SpeculateTrue
                                    } else {
                                        SpecState::SpeculateFalse
                                    };
                                    if guess {
                                        Decision::SpeculateTrue
                                    } else {
                                        Decision::SpeculateFalse
                                    }
                                } else {
                                    Decision::Park
                                }
                            }
                            None => Decision::Park,
                        },
                    }
                }
            },
        }
    };

    match decision {
        Decision::ResolveTrue => {
            op.spec_core().lock().predicate = None;
            op.core().resolve_speculation();
            op.resolve_true();
        }
        Decision::ResolveFalse => {
            op.spec_core().lock().predicate = None;
            op.core().resolve_speculation();
            op.resolve_false();
        }
        Decision::SpeculateTrue => {
            trace!(op = %op.core().unique_id(), "speculating true");
            op.resolve_true();
        }
        Decision::SpeculateFalse => {
            trace!(op = %op.core().unique_id(), "speculating false");
            op.resolve_false();
        }
        Decision::Park => {
            trace!(op = %op.core().unique_id(), "parked awaiting predicate");
        }
    }
}

enum Decision {
    ResolveTrue,
    ResolveFalse,
    SpeculateTrue,
    SpeculateFalse,
    Park,
}

/// Delivery of the predicate's resolved value.
///
/// Drives parked operations forward, confirms matching speculation, and
/// quashes mismatched speculation onto a fresh generation.
pub(crate) fn notify_predicate_value<T>(op: &Arc<T>, gen: Generation, value: bool)
where
    T: Speculative + PredicateWaiter,
{
    let current_gen = op.core().generation();
    if gen != current_gen {
        return;
    }
    let action = {
        let mut data = op.spec_core().lock();
        match data.state {
            SpecState::PendingMap => {
                data.state = if value {
                    SpecState::ResolveTrue
                } else {
                    SpecState::ResolveFalse
                };
                Action::Drive
            }
            SpecState::SpeculateTrue | SpecState::SpeculateFalse => {
                let guessed = data.state == SpecState::SpeculateTrue;
                data.state = if value {
                    SpecState::ResolveTrue
                } else {
                    SpecState::ResolveFalse
                };
                if guessed == value {
                    Action::Confirm
                } else {
                    Action::Quash
                }
            }
            SpecState::ResolveTrue | SpecState::ResolveFalse => Action::Ignore,
        }
    };

    match action {
        Action::Drive => {
            op.spec_core().lock().predicate = None;
            op.core().resolve_speculation();
            if value {
                op.resolve_true();
            } else {
                op.resolve_false();
            }
        }
        Action::Confirm => {
            trace!(op = %op.core().unique_id(), value, "speculation confirmed");
            op.spec_core().lock().predicate = None;
            op.core().resolve_speculation();
        }
        Action::Quash => {
            debug!(op = %op.core().unique_id(), value, "speculation mismatch, quashing");
            op.spec_core().lock().predicate = None;
            op.core().quash_operation(current_gen, value);
            if value {
                // Restart re-enters the mapping gate, which now sees the
                // resolved state and runs the true path.
            } else {
                op.core().resolve_speculation();
                op.resolve_false();
            }
        }
        Action::Ignore => {}
    }
}

enum Action {
    Drive,
    Confirm,
    Quash,
    Ignore,
}

/// Samples the predicate value from an application thread, blocking
/// until it resolves. Mirrors the waiter protocol predicates expose.
pub(crate) fn get_predicate_value(op: &dyn Speculative, proc: ProcessorId) -> bool {
    let predicate = op.spec_core().lock().predicate.clone();
    match predicate {
        None => true,
        Some(pred) => pred.predicate_core().wait_for_value(proc),
    }
}
