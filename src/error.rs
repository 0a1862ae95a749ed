//! Error types and error handling strategy for opstream.
//!
//! This module defines the core error types used throughout the runtime.
//! Error handling follows these principles:
//!
//! - Errors are explicit and typed (no stringly-typed errors)
//! - Fatal conditions (privilege violations, aliased requirements) carry
//!   the unique id of the offending operation
//! - Recoverable conditions (trace divergence, speculation mismatch) are
//!   handled inside the pipeline and never surface as user errors

use core::fmt;
use std::sync::Arc;

use crate::types::UniqueOpId;

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    // === Privileges and requirements ===
    /// An operation references a region the context lacks privilege for.
    PrivilegeViolation,
    /// Two region requirements of the same operation alias in a way the
    /// mapper did not flag.
    AliasedRequirements,
    /// The named region does not exist in the forest.
    RegionNotFound,
    /// The named field does not exist on the region.
    FieldNotFound,

    // === Pipeline ===
    /// A serialising dependence exists among must-epoch members, or the
    /// epoch could not be mapped under its constraints.
    MustEpochInfeasible,
    /// The next issued operation did not match the next trace entry.
    TraceDivergence,
    /// A trace with the same id is already being captured or replayed.
    TraceInUse,
    /// An invalid lifecycle transition was attempted.
    InvalidState,

    // === External collaborators ===
    /// An external resource (attached file, collective) failed.
    ExternalResource,
    /// A future was consumed before its producer resolved it.
    FutureUnresolved,

    // === Ambient ===
    /// Configuration error.
    Config,
    /// Internal runtime error (bug).
    Internal,
}

/// The main error type for opstream operations.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    op: Option<UniqueOpId>,
    context: Option<String>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Creates a new error with the given kind.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            op: None,
            context: None,
            source: None,
        }
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the unique id of the offending operation, if known.
    #[must_use]
    pub const fn op(&self) -> Option<UniqueOpId> {
        self.op
    }

    /// Returns true if this error is fatal to the enclosing task context.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::PrivilegeViolation
                | ErrorKind::AliasedRequirements
                | ErrorKind::ExternalResource
                | ErrorKind::Internal
        )
    }

    /// Attaches the unique id of the offending operation.
    #[must_use]
    pub const fn with_op(mut self, op: UniqueOpId) -> Self {
        self.op = Some(op);
        self
    }

    /// Adds deterministic context text to the error.
    #[must_use]
    pub fn with_context(mut self, ctx: impl Into<String>) -> Self {
        self.context = Some(ctx.into());
        self
    }

    /// Adds a source error to the chain.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(op) = self.op {
            write!(f, " [{op}]")?;
        }
        if let Some(ctx) = &self.context {
            write!(f, ": {ctx}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as _)
    }
}

/// Extension trait for adding context to Results.
pub trait ResultExt<T> {
    /// Attach a context string on error.
    fn context(self, ctx: impl Into<String>) -> Result<T>;
    /// Attach context computed lazily on error.
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for core::result::Result<T, E> {
    fn context(self, ctx: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().with_context(ctx))
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|e| e.into().with_context(f()))
    }
}

/// A specialized Result type for opstream operations.
pub type Result<T> = core::result::Result<T, Error>;
