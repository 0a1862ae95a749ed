//! Attach and detach operations for external instances.
//!
//! An attach binds an external file view (a field→dataset map) to a
//! logical region as a restricted physical instance: its contents must
//! not silently move until the matching detach removes the binding.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::context::TaskContext;
use crate::error::{Error, ErrorKind};
use crate::mapper::MapRequest;
use crate::op::{OpCore, OpKind, Operation};
use crate::runtime::Runtime;
use crate::types::{
    CoherenceMode, FieldId, PrivilegeMode, RegionHandle, RegionRequirement,
};

/// How an attached file is opened.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum FileMode {
    /// Existing file, read-only view.
    #[default]
    ReadOnly,
    /// Existing file, read-write view.
    ReadWrite,
    /// Create the file.
    Create,
}

/// Everything needed to attach an external file.
#[derive(Clone, Debug)]
pub struct AttachLauncher {
    /// The region the file backs.
    pub region: RegionHandle,
    /// The file path.
    pub file_name: String,
    /// Field to dataset-path mapping.
    pub field_map: BTreeMap<FieldId, String>,
    /// How the file is opened.
    pub mode: FileMode,
}

impl AttachLauncher {
    /// Creates a launcher binding a file to a region.
    #[must_use]
    pub fn new(region: RegionHandle, file_name: impl Into<String>) -> Self {
        Self {
            region,
            file_name: file_name.into(),
            field_map: BTreeMap::new(),
            mode: FileMode::ReadWrite,
        }
    }

    /// Maps a field to a dataset path inside the file.
    #[must_use]
    pub fn with_dataset(mut self, field: FieldId, dataset: impl Into<String>) -> Self {
        self.field_map.insert(field, dataset.into());
        self
    }

    /// Sets the file mode.
    #[must_use]
    pub fn with_mode(mut self, mode: FileMode) -> Self {
        self.mode = mode;
        self
    }

    fn requirement(&self) -> RegionRequirement {
        RegionRequirement::new(
            self.region,
            self.region,
            self.field_map.keys().copied(),
            PrivilegeMode::ReadWrite,
            CoherenceMode::Exclusive,
        )
    }
}

#[derive(Default)]
struct AttachData {
    launcher: Option<AttachLauncher>,
}

/// Binds an external file to a region as a restricted instance.
pub struct AttachOp {
    core: OpCore,
    state: Mutex<AttachData>,
}

impl AttachOp {
    pub(crate) fn new(runtime: &Arc<Runtime>) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let self_ref: Weak<dyn Operation> = weak.clone();
            Self {
                core: OpCore::new(Arc::clone(runtime), self_ref),
                state: Mutex::new(AttachData::default()),
            }
        })
    }

    fn lock(&self) -> MutexGuard<'_, AttachData> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn initialize(self: &Arc<Self>, ctx: &Arc<TaskContext>, launcher: &AttachLauncher) {
        self.lock().launcher = Some(launcher.clone());
        self.core.initialize_operation(ctx, true, 1);
    }

    fn check_privileges(&self, ctx: &Arc<TaskContext>) -> Result<(), Error> {
        let Some(launcher) = self.lock().launcher.clone() else {
            return Ok(());
        };
        if launcher.file_name.is_empty() || launcher.field_map.is_empty() {
            return Err(Error::new(ErrorKind::ExternalResource)
                .with_op(self.core.unique_id())
                .with_context("attach needs a file name and a field map"));
        }
        if self
            .core
            .runtime()
            .forest()
            .is_restricted(launcher.region)
        {
            return Err(Error::new(ErrorKind::PrivilegeViolation)
                .with_op(self.core.unique_id())
                .with_context("region already carries a restricted instance"));
        }
        ctx.check_region_privilege(&launcher.requirement())
            .map_err(|e| e.with_op(self.core.unique_id()))
    }
}

impl Operation for AttachOp {
    fn core(&self) -> &OpCore {
        &self.core
    }

    fn kind(&self) -> OpKind {
        OpKind::Attach
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
                        let requirement = self.lock().launcher.as_ref().map(AttachLauncher::requirement);
                        if let Some(requirement) = requirement {
                            self.core.analyze_region_requirement(0, &requirement, None);
                        }
                    }
                    Err(error) => ctx.record_error(error),
                }
            }
        }
        self.core.end_dependence_analysis();
    }

    fn trigger_execution(&self) {
        let launcher = self.lock().launcher.clone();
        if let Some(launcher) = launcher {
            let requirement = launcher.requirement();
            let decision = self.core.runtime().mapper().map_operation(&MapRequest {
                op: self.core.unique_id(),
                kind: OpKind::Attach,
                req_index: 0,
                requirement: &requirement,
            });
            self.core
                .runtime()
                .forest()
                .attach_restriction(launcher.region, decision.instance);
        }
        self.core.complete_execution();
    }
}

#[derive(Default)]
struct DetachData {
    region: Option<RegionHandle>,
    requirement: Option<RegionRequirement>,
}

/// Removes the restricted instance an attach installed.
pub struct DetachOp {
    core: OpCore,
    state: Mutex<DetachData>,
}

impl DetachOp {
    pub(crate) fn new(runtime: &Arc<Runtime>) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let self_ref: Weak<dyn Operation> = weak.clone();
            Self {
                core: OpCore::new(Arc::clone(runtime), self_ref),
                state: Mutex::new(DetachData::default()),
            }
        })
    }

    fn lock(&self) -> MutexGuard<'_, DetachData> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn initialize(
        self: &Arc<Self>,
        ctx: &Arc<TaskContext>,
        region: RegionHandle,
        fields: impl IntoIterator<Item = FieldId>,
    ) {
        {
            let mut data = self.lock();
            data.region = Some(region);
            data.requirement = Some(RegionRequirement::new(
                region,
                region,
                fields,
                PrivilegeMode::ReadWrite,
                CoherenceMode::Exclusive,
            ));
        }
        self.core.initialize_operation(ctx, true, 1);
    }
}

impl Operation for DetachOp {
    fn core(&self) -> &OpCore {
        &self.core
    }

    fn kind(&self) -> OpKind {
        OpKind::Detach
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
    }

    fn trigger_dependence_analysis(&self) {
        self.core.begin_dependence_analysis();
        if !self.core.replay_trace_dependences() {
            let (region, requirement) = {
                let data = self.lock();
                (data.region, data.requirement.clone())
            };
            if let Some(region) = region {
                if !self.core.runtime().forest().is_restricted(region) {
                    if let Some(ctx) = self.core.parent() {
                        ctx.record_error(
                            Error::new(ErrorKind::InvalidState)
                                .with_op(self.core.unique_id())
                                .with_context("detach of an unrestricted region"),
                        );
                    }
                }
            }
            if let Some(requirement) = requirement {
                self.core.analyze_region_requirement(0, &requirement, None);
            }
        }
        self.core.end_dependence_analysis();
    }

    fn trigger_execution(&self) {
        let region = self.lock().region;
        if let Some(region) = region {
            self.core.runtime().forest().detach_restriction(region);
        }
        self.core.complete_execution();
    }
}
