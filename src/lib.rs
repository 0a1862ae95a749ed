//! Opstream: the operation pipeline and dependence graph of a
//! task-based parallel runtime.
//!
//! # Overview
//!
//! Programs are expressed as a stream of asynchronous operations
//! (tasks, copies, fences, fills, partition computations, acquires and
//! releases, predicates, must-epochs) issued from a parent context.
//! The pipeline orders them by their data dependences, maps them onto
//! processors and memories through the mapper collaborator, and drives
//! them through a multi-phase lifecycle toward completion and
//! reclamation.
//!
//! # Core pieces
//!
//! - **Operations** are generation-versioned nodes of a distributed
//!   dependence graph, recycled through per-kind free-lists. A stale
//!   `(operation, generation)` reference reads as "already satisfied".
//! - **Predicates and speculation** let predicated operations proceed
//!   before their predicate resolves, rolling forward on a correct
//!   guess and quashing onto a fresh generation on a mismatch.
//! - **Traces** memoize the dependence analysis of a fragment of the
//!   stream and replay the recorded edges verbatim on later executions.
//! - **Must-epochs** coordinate groups of tasks that must map and run
//!   concurrently, failing cleanly when no concurrent mapping exists.
//!
//! # Module Structure
//!
//! - [`types`]: identifiers, region requirements, the dependence lattice
//! - [`event`]: the one-shot event primitives the pipeline consumes
//! - [`future`]: deferred values produced by operations
//! - [`op`]: the operation base and the concrete operation family
//! - [`trace`]: trace capture and replay
//! - [`context`]: the issuing surface
//! - [`runtime`]: ready queue, analysis workers, collaborator wiring
//! - [`forest`]: the region-tree collaborator contract
//! - [`mapper`]: the mapping collaborator contract
//! - [`config`]: runtime configuration
//! - [`error`]: error types
//! - [`tracing_compat`]: structured-logging facade

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::doc_markdown)]

pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod forest;
pub mod future;
pub mod mapper;
pub mod op;
pub mod runtime;
pub mod trace;
pub mod tracing_compat;
pub mod types;

// Re-exports for convenient access to the issue surface.
pub use config::RuntimeConfig;
pub use context::TaskContext;
pub use error::{Error, ErrorKind, Result, ResultExt};
pub use event::{Event, UserEvent};
pub use future::{FutureMap, FutureValue};
pub use op::attach::{AttachLauncher, FileMode};
pub use op::coherence::CoherenceLauncher;
pub use op::collective::DynamicCollective;
pub use op::copy::CopyLauncher;
pub use op::fence::FenceKind;
pub use op::fill::{FillLauncher, FillValue};
pub use op::inline::{InlineLauncher, MappedRegion};
pub use op::must_epoch::MustEpochLauncher;
pub use op::predicate::Predicate;
pub use op::task::TaskLauncher;
pub use op::{OpHandle, OpKind, Operation};
pub use runtime::Runtime;
pub use types::{
    CoherenceMode, DependenceKind, FieldId, PrivilegeMode, RegionHandle, RegionRequirement,
    TraceId, UniqueOpId,
};
