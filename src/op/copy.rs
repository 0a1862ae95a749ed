//! Region-to-region copy operations.
//!
//! A copy moves data between matched pairs of source and destination
//! requirements. Copies are speculative: under an unresolved predicate
//! the mapper may let the copy proceed on a guess, and a predicate-false
//! resolution elides the copy entirely.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::context::TaskContext;
use crate::error::{Error, ErrorKind};
use crate::event::Event;
use crate::mapper::{MapDecision, MapRequest};
use crate::op::predicate::{Predicate, PredicateWaiter};
use crate::op::speculative::{self, SpecCore, Speculative};
use crate::op::{OpCore, OpKind, Operation};
use crate::runtime::Runtime;
use crate::types::{Generation, PrivilegeMode, RegionRequirement};

/// Everything needed to launch a copy.
#[derive(Clone, Debug)]
pub struct CopyLauncher {
    /// Source requirements; read privileges.
    pub src_requirements: Vec<RegionRequirement>,
    /// Destination requirements; write privileges. Paired with sources
    /// by position.
    pub dst_requirements: Vec<RegionRequirement>,
    /// The copy's predicate.
    pub predicate: Predicate,
}

impl CopyLauncher {
    /// Creates an empty launcher.
    #[must_use]
    pub fn new() -> Self {
        Self {
            src_requirements: Vec::new(),
            dst_requirements: Vec::new(),
            predicate: Predicate::TRUE,
        }
    }

    /// Adds a source/destination pair.
    #[must_use]
    pub fn with_pair(mut self, src: RegionRequirement, dst: RegionRequirement) -> Self {
        self.src_requirements.push(src);
        self.dst_requirements.push(dst);
        self
    }

    /// Sets the predicate.
    #[must_use]
    pub fn with_predicate(mut self, predicate: Predicate) -> Self {
        self.predicate = predicate;
        self
    }
}

impl Default for CopyLauncher {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
struct CopyData {
    src: Vec<RegionRequirement>,
    dst: Vec<RegionRequirement>,
    decisions: Vec<MapDecision>,
}

/// A region-to-region copy.
pub struct CopyOp {
    core: OpCore,
    spec: SpecCore,
    state: Mutex<CopyData>,
}

impl CopyOp {
    pub(crate) fn new(runtime: &Arc<Runtime>) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let self_ref: Weak<dyn Operation> = weak.clone();
            Self {
                core: OpCore::new(Arc::clone(runtime), self_ref),
                spec: SpecCore::new(),
                state: Mutex::new(CopyData::default()),
            }
        })
    }

    fn lock(&self) -> MutexGuard<'_, CopyData> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn arc_self(&self) -> Arc<Self> {
        self.core
            .handle()
            .into_arc()
            .as_any_arc()
            .downcast::<Self>()
            .expect("copy op type")
    }

    pub(crate) fn initialize(
        self: &Arc<Self>,
        ctx: &Arc<TaskContext>,
        launcher: &CopyLauncher,
    ) -> Result<Event, Error> {
        if launcher.src_requirements.len() != launcher.dst_requirements.len() {
            return Err(Error::new(ErrorKind::InvalidState)
                .with_context("copy source and destination counts differ"));
        }
        {
            let mut data = self.lock();
            data.src = launcher.src_requirements.clone();
            data.dst = launcher.dst_requirements.clone();
            data.decisions.clear();
        }
        let regions = launcher.src_requirements.len() * 2;
        speculative::initialize_speculation(self, ctx, true, regions, &launcher.predicate);
        Ok(self.core.completion_event())
    }

    fn check_privileges(&self, ctx: &Arc<TaskContext>) -> Result<(), Error> {
        let (src, dst) = {
            let data = self.lock();
            (data.src.clone(), data.dst.clone())
        };
        for (index, requirement) in src.iter().enumerate() {
            if requirement.privilege.is_write() {
                return Err(Error::new(ErrorKind::PrivilegeViolation)
                    .with_op(self.core.unique_id())
                    .with_context(format!("copy source {index} must be read-only")));
            }
            ctx.check_region_privilege(requirement)
                .map_err(|e| e.with_op(self.core.unique_id()))?;
        }
        for (index, requirement) in dst.iter().enumerate() {
            if !requirement.privilege.is_write() {
                return Err(Error::new(ErrorKind::PrivilegeViolation)
                    .with_op(self.core.unique_id())
                    .with_context(format!("copy destination {index} must be writable")));
            }
            ctx.check_region_privilege(requirement)
                .map_err(|e| e.with_op(self.core.unique_id()))?;
        }
        Ok(())
    }

    /// Destination pairs naming overlapping data are a caller error the
    /// mapper did not flag.
    fn check_aliased_destinations(&self) {
        let dst = self.lock().dst.clone();
        let forest = Arc::clone(self.core.runtime().forest());
        let base = dst.len();
        for i in 0..dst.len() {
            for j in (i + 1)..dst.len() {
                if forest.regions_alias(dst[i].region, dst[j].region)
                    && dst[i].fields_overlap(&dst[j])
                {
                    self.report_aliased_requirements(base + i, base + j);
                }
            }
        }
    }
}

impl Operation for CopyOp {
    fn core(&self) -> &OpCore {
        &self.core
    }

    fn kind(&self) -> OpKind {
        OpKind::Copy
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
                        self.check_aliased_destinations();
                        speculative::register_predicate_dependence(self);
                        let (src, dst) = {
                            let data = self.lock();
                            (data.src.clone(), data.dst.clone())
                        };
                        let base = src.len();
                        for (index, requirement) in src.iter().enumerate() {
                            self.core
                                .analyze_region_requirement(index, requirement, None);
                        }
                        for (index, requirement) in dst.iter().enumerate() {
                            self.core
                                .analyze_region_requirement(base + index, requirement, None);
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
        // The byte movement itself belongs to the external runtime; the
        // pipeline's job ends once the copy is ordered behind the
        // completions it consumes.
        let precondition = self.core.execution_precondition();
        if precondition.has_triggered() {
            self.core.complete_execution();
        } else {
            let handle = self.core.handle();
            let runtime = Arc::clone(self.core.runtime());
            precondition.subscribe(move || {
                runtime.defer(move || handle.core().complete_execution());
            });
        }
    }
}

impl Speculative for CopyOp {
    fn spec_core(&self) -> &SpecCore {
        &self.spec
    }

    fn speculate(&self) -> Option<bool> {
        self.core
            .runtime()
            .mapper()
            .speculate(self.core.unique_id(), OpKind::Copy)
    }

    fn resolve_true(&self) {
        let dst = self.lock().dst.clone();
        let mapper = Arc::clone(self.core.runtime().mapper());
        let mut decisions = Vec::with_capacity(dst.len());
        for (index, requirement) in dst.iter().enumerate() {
            decisions.push(mapper.map_operation(&MapRequest {
                op: self.core.unique_id(),
                kind: OpKind::Copy,
                req_index: index,
                requirement,
            }));
        }
        self.lock().decisions = decisions;
        self.core.complete_mapping();
        self.core.schedule_execution();
    }

    fn resolve_false(&self) {
        self.core.complete_as_noop();
    }
}

impl PredicateWaiter for CopyOp {
    fn notify_predicate_value(&self, gen: Generation, value: bool) {
        speculative::notify_predicate_value(&self.arc_self(), gen, value);
    }
}
