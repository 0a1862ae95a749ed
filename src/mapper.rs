//! The mapper contract and its default implementation.
//!
//! Mapping turns a logical region requirement into a physical instance
//! and a processor choice. The pipeline only needs a narrow slice of the
//! mapper interface: instance/processor selection for mappable
//! operations, an optional speculation hint for predicated operations,
//! and constraint checking for must-epoch launches.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::error::{Error, ErrorKind, Result};
use crate::op::must_epoch::DependenceRecord;
use crate::op::OpKind;
use crate::types::{InstanceId, ProcessorId, RegionRequirement, UniqueOpId};

/// A request to map one region requirement of an operation.
#[derive(Debug)]
pub struct MapRequest<'a> {
    /// The operation being mapped.
    pub op: UniqueOpId,
    /// The operation's kind.
    pub kind: OpKind,
    /// The requirement's index within the operation.
    pub req_index: usize,
    /// The requirement being mapped.
    pub requirement: &'a RegionRequirement,
}

/// The mapper's answer: where the data lives and where the work runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapDecision {
    /// The physical instance backing the requirement.
    pub instance: InstanceId,
    /// The processor the operation runs on.
    pub processor: ProcessorId,
}

/// The mapping collaborator the pipeline calls into.
pub trait Mapper: Send + Sync {
    /// Maps one region requirement of an operation.
    fn map_operation(&self, request: &MapRequest<'_>) -> MapDecision;

    /// Selects a target processor for an operation without requirements.
    fn select_processor(&self, op: UniqueOpId, kind: OpKind) -> ProcessorId;

    /// Speculation hint for a predicated operation whose predicate has
    /// not resolved: `Some(guess)` speculates, `None` waits.
    fn speculate(&self, _op: UniqueOpId, _kind: OpKind) -> Option<bool> {
        None
    }

    /// Maps a must-epoch: every task must get a distinct processor and
    /// no serialising dependence may exist among the members.
    ///
    /// Returns one decision per task, in task order.
    fn map_must_epoch(
        &self,
        tasks: &[UniqueOpId],
        dependences: &[DependenceRecord],
    ) -> Result<Vec<MapDecision>>;
}

/// Round-robin mapper used when the embedder supplies nothing better.
pub struct DefaultMapper {
    processors: Vec<ProcessorId>,
    next_processor: AtomicUsize,
    next_instance: AtomicU64,
}

impl DefaultMapper {
    /// Creates a mapper over the given processors.
    #[must_use]
    pub fn new(processors: Vec<ProcessorId>) -> Self {
        debug_assert!(!processors.is_empty());
        Self {
            processors,
            next_processor: AtomicUsize::new(0),
            next_instance: AtomicU64::new(1),
        }
    }

    fn fresh_instance(&self) -> InstanceId {
        InstanceId::from_raw(self.next_instance.fetch_add(1, Ordering::Relaxed))
    }

    fn round_robin(&self) -> ProcessorId {
        let index = self.next_processor.fetch_add(1, Ordering::Relaxed);
        self.processors[index % self.processors.len()]
    }
}

impl Mapper for DefaultMapper {
    fn map_operation(&self, _request: &MapRequest<'_>) -> MapDecision {
        MapDecision {
            instance: self.fresh_instance(),
            processor: self.round_robin(),
        }
    }

    fn select_processor(&self, _op: UniqueOpId, _kind: OpKind) -> ProcessorId {
        self.round_robin()
    }

    fn map_must_epoch(
        &self,
        tasks: &[UniqueOpId],
        dependences: &[DependenceRecord],
    ) -> Result<Vec<MapDecision>> {
        if let Some(record) = dependences.iter().find(|r| r.dtype.is_serialising()) {
            return Err(Error::new(ErrorKind::MustEpochInfeasible).with_context(format!(
                "serialising dependence between epoch members {} and {}",
                record.op1_index, record.op2_index
            )));
        }
        if tasks.len() > self.processors.len() {
            return Err(Error::new(ErrorKind::MustEpochInfeasible).with_context(format!(
                "{} tasks cannot map concurrently onto {} processors",
                tasks.len(),
                self.processors.len()
            )));
        }
        Ok(tasks
            .iter()
            .enumerate()
            .map(|(index, _)| MapDecision {
                instance: self.fresh_instance(),
                processor: self.processors[index],
            })
            .collect())
    }
}
