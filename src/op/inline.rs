//! Inline mapping operations.
//!
//! An inline mapping gives the issuing context direct access to a
//! physical instance of a region. The operation maps, publishes the
//! instance through its [`MappedRegion`], and completes; the region
//! stays valid until the application terminates it (or remaps).

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::context::TaskContext;
use crate::event::{Event, UserEvent};
use crate::mapper::{MapDecision, MapRequest};
use crate::op::{OpCore, OpKind, Operation};
use crate::runtime::Runtime;
use crate::types::{InstanceId, RegionHandle, RegionRequirement};

/// Everything needed for an inline mapping.
#[derive(Clone, Debug)]
pub struct InlineLauncher {
    /// The requirement to map.
    pub requirement: RegionRequirement,
}

impl InlineLauncher {
    /// Creates a launcher for the given requirement.
    #[must_use]
    pub fn new(requirement: RegionRequirement) -> Self {
        Self { requirement }
    }
}

struct MappedRegionInner {
    requirement: RegionRequirement,
    decision: Mutex<Option<MapDecision>>,
    ready: Mutex<Event>,
    termination: UserEvent,
}

/// The application-visible result of an inline mapping.
#[derive(Clone)]
pub struct MappedRegion {
    inner: Arc<MappedRegionInner>,
}

impl MappedRegion {
    fn new(requirement: RegionRequirement) -> Self {
        Self {
            inner: Arc::new(MappedRegionInner {
                requirement,
                decision: Mutex::new(None),
                ready: Mutex::new(Event::none()),
                termination: UserEvent::new(),
            }),
        }
    }

    /// The mapped region.
    #[must_use]
    pub fn region(&self) -> RegionHandle {
        self.inner.requirement.region
    }

    /// The requirement the mapping satisfied.
    #[must_use]
    pub fn requirement(&self) -> &RegionRequirement {
        &self.inner.requirement
    }

    /// The physical instance, once mapping has finished.
    #[must_use]
    pub fn instance(&self) -> Option<InstanceId> {
        self.inner
            .decision
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .map(|d| d.instance)
    }

    /// Fires when the instance is valid.
    #[must_use]
    pub fn ready_event(&self) -> Event {
        self.inner
            .ready
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Signals that the application is done with the instance.
    pub fn terminate(&self) {
        self.inner.termination.trigger();
    }

    /// The event the application triggers at termination.
    #[must_use]
    pub fn termination_event(&self) -> Event {
        self.inner.termination.event()
    }

    fn set_ready_event(&self, event: Event) {
        *self
            .inner
            .ready
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = event;
    }

    fn set_decision(&self, decision: MapDecision) {
        *self
            .inner
            .decision
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(decision);
    }
}

#[derive(Default)]
struct MapData {
    requirement: Option<RegionRequirement>,
    region: Option<MappedRegion>,
    remap: bool,
}

/// The inline mapping operation.
pub struct MapOp {
    core: OpCore,
    state: Mutex<MapData>,
}

impl MapOp {
    pub(crate) fn new(runtime: &Arc<Runtime>) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let self_ref: Weak<dyn Operation> = weak.clone();
            Self {
                core: OpCore::new(Arc::clone(runtime), self_ref),
                state: Mutex::new(MapData::default()),
            }
        })
    }

    fn lock(&self) -> MutexGuard<'_, MapData> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn initialize(
        self: &Arc<Self>,
        ctx: &Arc<TaskContext>,
        launcher: &InlineLauncher,
    ) -> MappedRegion {
        let region = MappedRegion::new(launcher.requirement.clone());
        {
            let mut data = self.lock();
            data.requirement = Some(launcher.requirement.clone());
            data.region = Some(region.clone());
            data.remap = false;
        }
        self.core.initialize_operation(ctx, true, 1);
        region.set_ready_event(self.core.completion_event());
        region
    }

    /// Re-maps an existing mapped region after the application released
    /// it.
    pub(crate) fn initialize_remap(
        self: &Arc<Self>,
        ctx: &Arc<TaskContext>,
        region: &MappedRegion,
    ) {
        {
            let mut data = self.lock();
            data.requirement = Some(region.requirement().clone());
            data.region = Some(region.clone());
            data.remap = true;
        }
        self.core.initialize_operation(ctx, true, 1);
        region.set_ready_event(self.core.completion_event());
    }

    /// The mapped-region handle this operation fills in.
    #[must_use]
    pub fn mapped_region(&self) -> Option<MappedRegion> {
        self.lock().region.clone()
    }
}

impl Operation for MapOp {
    fn core(&self) -> &OpCore {
        &self.core
    }

    fn kind(&self) -> OpKind {
        OpKind::Map
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
    }

    fn trigger_dependence_analysis(&self) {
        self.core.begin_dependence_analysis();
        if !self.core.replay_trace_dependences() {
            let requirement = self.lock().requirement.clone();
            if let (Some(requirement), Some(ctx)) = (requirement, self.core.parent()) {
                match ctx.check_region_privilege(&requirement) {
                    Ok(()) => {
                        self.core.analyze_region_requirement(0, &requirement, None);
                    }
                    Err(error) => ctx.record_error(error.with_op(self.core.unique_id())),
                }
            }
        }
        self.core.end_dependence_analysis();
    }

    fn trigger_execution(&self) {
        let (requirement, region) = {
            let data = self.lock();
            (data.requirement.clone(), data.region.clone())
        };
        if let (Some(requirement), Some(region)) = (requirement, region) {
            let decision = self.core.runtime().mapper().map_operation(&MapRequest {
                op: self.core.unique_id(),
                kind: OpKind::Map,
                req_index: 0,
                requirement: &requirement,
            });
            region.set_decision(decision);
        }
        self.core.complete_execution();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::types::{CoherenceMode, FieldId, PrivilegeMode};

    #[test]
    fn inline_map_publishes_instance() {
        let rt = Runtime::new(RuntimeConfig::inline()).expect("runtime");
        let ctx = rt.create_context("inline");
        let field = FieldId::new(0);
        let region = ctx.create_region(&[field]);

        let mapped = ctx
            .inline_map(InlineLauncher::new(RegionRequirement::new(
                region,
                region,
                [field],
                PrivilegeMode::ReadWrite,
                CoherenceMode::Exclusive,
            )))
            .expect("map");

        assert!(mapped.ready_event().has_triggered());
        assert!(mapped.instance().is_some());
        assert_eq!(mapped.region(), region);
    }

    #[test]
    fn remap_reuses_requirement() {
        let rt = Runtime::new(RuntimeConfig::inline()).expect("runtime");
        let ctx = rt.create_context("remap");
        let field = FieldId::new(0);
        let region = ctx.create_region(&[field]);

        let mapped = ctx
            .inline_map(InlineLauncher::new(RegionRequirement::new(
                region,
                region,
                [field],
                PrivilegeMode::ReadWrite,
                CoherenceMode::Exclusive,
            )))
            .expect("map");
        let first = mapped.instance().expect("instance");
        mapped.terminate();

        ctx.remap_region(&mapped).expect("remap");
        let second = mapped.instance().expect("instance");
        assert_ne!(first, second);
    }
}
