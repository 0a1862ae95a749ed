//! Core types for the opstream runtime.
//!
//! This module contains the fundamental types used throughout the runtime:
//!
//! - [`id`]: Identifier types (`UniqueOpId`, `TraceId`, `ProcessorId`,
//!   region/partition/field/instance handles)
//! - [`requirement`]: Region requirements, privilege and coherence modes,
//!   and the dependence-kind lattice used by the analysis

pub mod id;
pub mod requirement;

pub use id::{
    FieldId, Generation, InstanceId, PartitionHandle, ProcessorId, RegionHandle, TraceId,
    UniqueOpId,
};
pub use requirement::{
    check_dependence, CoherenceMode, DependenceKind, PrivilegeMode, RegionRequirement,
};
