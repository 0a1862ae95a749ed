//! Acquire and release operations for user-level coherence.
//!
//! A restricted region (one bound to an external instance, or owned with
//! simultaneous coherence) cannot have its contents silently moved. An
//! acquire lifts the restriction for the issuing context; the matching
//! release restores it and flushes. Both are speculative operations.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::context::TaskContext;
use crate::error::{Error, ErrorKind};
use crate::event::Event;
use crate::op::predicate::{Predicate, PredicateWaiter};
use crate::op::speculative::{self, SpecCore, Speculative};
use crate::op::{OpCore, OpKind, Operation};
use crate::runtime::Runtime;
use crate::types::{
    CoherenceMode, FieldId, Generation, PrivilegeMode, RegionHandle, RegionRequirement,
};

/// Everything needed to launch an acquire or release.
#[derive(Clone, Debug)]
pub struct CoherenceLauncher {
    /// The restricted region.
    pub region: RegionHandle,
    /// The fields covered.
    pub fields: Vec<FieldId>,
    /// The operation's predicate.
    pub predicate: Predicate,
}

impl CoherenceLauncher {
    /// Creates a launcher over a region's fields.
    #[must_use]
    pub fn new(region: RegionHandle, fields: impl IntoIterator<Item = FieldId>) -> Self {
        Self {
            region,
            fields: fields.into_iter().collect(),
            predicate: Predicate::TRUE,
        }
    }

    /// Sets the predicate.
    #[must_use]
    pub fn with_predicate(mut self, predicate: Predicate) -> Self {
        self.predicate = predicate;
        self
    }

    fn requirement(&self) -> RegionRequirement {
        RegionRequirement::new(
            self.region,
            self.region,
            self.fields.iter().copied(),
            PrivilegeMode::ReadWrite,
            CoherenceMode::Exclusive,
        )
    }
}

macro_rules! coherence_op {
    ($(#[$meta:meta])* $name:ident, $kind:expr, $acquired:literal, $missing:literal) => {
        $(#[$meta])*
        pub struct $name {
            core: OpCore,
            spec: SpecCore,
            state: Mutex<Option<RegionRequirement>>,
        }

        impl $name {
            pub(crate) fn new(runtime: &Arc<Runtime>) -> Arc<Self> {
                Arc::new_cyclic(|weak: &Weak<Self>| {
                    let self_ref: Weak<dyn Operation> = weak.clone();
                    Self {
                        core: OpCore::new(Arc::clone(runtime), self_ref),
                        spec: SpecCore::new(),
                        state: Mutex::new(None),
                    }
                })
            }

            fn lock(&self) -> MutexGuard<'_, Option<RegionRequirement>> {
                self.state.lock().unwrap_or_else(PoisonError::into_inner)
            }

            fn arc_self(&self) -> Arc<Self> {
                self.core
                    .handle()
                    .into_arc()
                    .as_any_arc()
                    .downcast::<Self>()
                    .expect("coherence op type")
            }

            pub(crate) fn initialize(
                self: &Arc<Self>,
                ctx: &Arc<TaskContext>,
                launcher: &CoherenceLauncher,
            ) -> Event {
                *self.lock() = Some(launcher.requirement());
                speculative::initialize_speculation(self, ctx, true, 1, &launcher.predicate);
                self.core.completion_event()
            }

            fn check_privileges(&self, ctx: &Arc<TaskContext>) -> Result<(), Error> {
                let requirement = self.lock().clone();
                let Some(requirement) = requirement else {
                    return Ok(());
                };
                ctx.check_region_privilege(&requirement)
                    .map_err(|e| e.with_op(self.core.unique_id()))?;
                // The region must carry a restriction to acquire from or
                // release back to.
                let forest = self.core.runtime().forest();
                if forest.is_restricted(requirement.region) != $acquired {
                    return Err(Error::new(ErrorKind::PrivilegeViolation)
                        .with_op(self.core.unique_id())
                        .with_context($missing));
                }
                Ok(())
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

            fn trigger_dependence_analysis(&self) {
                self.core.begin_dependence_analysis();
                if !self.core.replay_trace_dependences() {
                    if let Some(ctx) = self.core.parent() {
                        match self.check_privileges(&ctx) {
                            Ok(()) => {
                                speculative::register_predicate_dependence(self);
                                let requirement = self.lock().clone();
                                if let Some(requirement) = requirement {
                                    self.core
                                        .analyze_region_requirement(0, &requirement, None);
                                }
                            }
                            Err(error) => ctx.record_error(error),
                        }
                    }
                }
                self.core.end_dependence_analysis();
            }

            fn trigger_mapping(&self) {
                speculative::trigger_mapping(&self.arc_self());
            }

            fn trigger_resolution(&self) {
                speculative::trigger_resolution(self);
            }

            fn trigger_execution(&self) {
                let requirement = self.lock().clone();
                if let Some(requirement) = requirement {
                    let forest = self.core.runtime().forest();
                    forest.set_restriction_acquired(requirement.region, $acquired);
                }
                self.core.complete_execution();
            }
        }

        impl Speculative for $name {
            fn spec_core(&self) -> &SpecCore {
                &self.spec
            }

            fn speculate(&self) -> Option<bool> {
                self.core
                    .runtime()
                    .mapper()
                    .speculate(self.core.unique_id(), $kind)
            }

            fn resolve_true(&self) {
                self.core.complete_mapping();
                self.core.schedule_execution();
            }

            fn resolve_false(&self) {
                self.core.complete_as_noop();
            }
        }

        impl PredicateWaiter for $name {
            fn notify_predicate_value(&self, gen: Generation, value: bool) {
                speculative::notify_predicate_value(&self.arc_self(), gen, value);
            }
        }
    };
}

coherence_op!(
    /// Lifts the restriction on a region for the issuing context.
    AcquireOp,
    OpKind::Acquire,
    true,
    "acquire requires a restricted region"
);

coherence_op!(
    /// Restores the restriction an acquire lifted.
    ReleaseOp,
    OpKind::Release,
    false,
    "release requires an acquired region"
);
