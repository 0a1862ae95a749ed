//! Identifier types for runtime entities.
//!
//! These types provide type-safe identifiers for operations, traces,
//! processors, and the handles the region forest deals in. All of them
//! are cheap `Copy` newtypes; none of them is ever reused within a
//! runtime instance except region/partition handles, whose lifetime is
//! governed by deletion operations.

use core::fmt;

/// Generation counter on an operation.
///
/// The `(operation, generation)` pair names a logical node in the
/// dependence graph even across object reuse from a free-list. A stored
/// generation older than the operation's current one means the edge it
/// described is already satisfied.
pub type Generation = u64;

/// A unique identifier for an operation.
///
/// Assigned monotonically by the runtime when an operation is
/// initialized; never reused, even when the operation object itself is
/// recycled through a free-list.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UniqueOpId(u64);

impl UniqueOpId {
    /// Creates an id from a raw counter value (internal use).
    #[must_use]
    pub(crate) const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw counter value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Creates an op id for testing purposes.
    #[doc(hidden)]
    #[must_use]
    pub const fn new_for_test(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Debug for UniqueOpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UniqueOpId({})", self.0)
    }
}

impl fmt::Display for UniqueOpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A user-chosen identifier naming a trace within its context.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TraceId(u32);

impl TraceId {
    /// Creates a trace id from a user-chosen value.
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TraceId({})", self.0)
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "trace{}", self.0)
    }
}

macro_rules! handle_type {
    ($(#[$meta:meta])* $name:ident, $short:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(u64);

        impl $name {
            /// Creates a handle from a raw value (internal use).
            #[must_use]
            pub(crate) const fn from_raw(raw: u64) -> Self {
                Self(raw)
            }

            /// Returns the raw value.
            #[must_use]
            pub const fn as_u64(self) -> u64 {
                self.0
            }

            /// Creates a handle for testing purposes.
            #[doc(hidden)]
            #[must_use]
            pub const fn new_for_test(raw: u64) -> Self {
                Self(raw)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($short, "{}"), self.0)
            }
        }
    };
}

handle_type!(
    /// A handle naming a logical region in the forest.
    RegionHandle,
    "R"
);
handle_type!(
    /// A handle naming a partition of a region into subregions.
    PartitionHandle,
    "P"
);
handle_type!(
    /// A handle naming a physical instance produced by the mapper.
    InstanceId,
    "I"
);
handle_type!(
    /// A handle naming a processor the mapper can target.
    ProcessorId,
    "proc"
);

/// A field identifier within a region's field space.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FieldId(u32);

impl FieldId {
    /// Creates a field id from a user-chosen value.
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for FieldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FieldId({})", self.0)
    }
}

impl fmt::Display for FieldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "f{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn op_id_display() {
        let id = UniqueOpId::new_for_test(42);
        assert_eq!(id.to_string(), "#42");
        assert_eq!(format!("{id:?}"), "UniqueOpId(42)");
    }

    #[test]
    fn handle_display() {
        assert_eq!(RegionHandle::new_for_test(3).to_string(), "R3");
        assert_eq!(PartitionHandle::new_for_test(1).to_string(), "P1");
        assert_eq!(ProcessorId::new_for_test(0).to_string(), "proc0");
        assert_eq!(FieldId::new(9).to_string(), "f9");
    }

    #[test]
    fn handle_ordering_and_hash() {
        use std::collections::HashSet;
        let a = RegionHandle::new_for_test(1);
        let b = RegionHandle::new_for_test(2);
        assert!(a < b);
        let mut set = HashSet::new();
        set.insert(a);
        set.insert(b);
        set.insert(RegionHandle::new_for_test(1));
        assert_eq!(set.len(), 2);
    }
}
