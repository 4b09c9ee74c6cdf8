//! Identity types for the escape-analysis IR
//!
//! Every entity the pass keys a map on (functions, declarations, temporaries,
//! expressions, flow-graph nodes) gets its own lightweight `u32` newtype so
//! the different id spaces cannot be mixed up.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, Ordering};

/// Trait for ID types that can be created and validated
pub trait IdType: Copy + Clone + PartialEq + Eq + std::hash::Hash + fmt::Debug {
    /// Create a new ID from a raw u32 value
    fn from_raw(raw: u32) -> Self;

    /// Get the raw u32 value of this ID
    fn as_raw(self) -> u32;

    /// Check if this ID is valid (not a sentinel value)
    fn is_valid(self) -> bool;

    /// Get an invalid/null sentinel value
    fn invalid() -> Self;
}

/// Macro to define ID types with consistent behavior
macro_rules! define_id_type {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub(crate) u32);

        impl $name {
            /// Create a new ID from a raw u32 value
            pub const fn from_raw(raw: u32) -> Self {
                Self(raw)
            }

            /// Get the raw u32 value of this ID
            pub const fn as_raw(self) -> u32 {
                self.0
            }

            /// Index form, for arena lookups
            pub const fn index(self) -> usize {
                self.0 as usize
            }

            pub const fn is_valid(self) -> bool {
                self.0 != u32::MAX
            }

            pub const fn invalid() -> Self {
                Self(u32::MAX)
            }
        }

        impl IdType for $name {
            fn from_raw(raw: u32) -> Self {
                Self::from_raw(raw)
            }

            fn as_raw(self) -> u32 {
                self.as_raw()
            }

            fn is_valid(self) -> bool {
                self.is_valid()
            }

            fn invalid() -> Self {
                Self::invalid()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::invalid()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                if self.is_valid() {
                    write!(f, "{}({})", stringify!($name), self.0)
                } else {
                    write!(f, "{}(<invalid>)", stringify!($name))
                }
            }
        }

        impl From<u32> for $name {
            fn from(raw: u32) -> Self {
                Self::from_raw(raw)
            }
        }
    };
}

define_id_type! {
    /// Unique identifier for a function (named function, method or closure body)
    FunctionId
}

define_id_type! {
    /// Unique identifier for a declaration: local variables and formal parameters
    ///
    /// Declarations are numbered program-wide, so a `DeclId` never collides
    /// between two functions of the same SCC.
    DeclId
}

define_id_type! {
    /// Unique identifier for a compiler temporary
    TempId
}

define_id_type! {
    /// Unique identifier for an expression node
    ExprId
}

define_id_type! {
    /// Index of a node in an analysis context's object-flow graph
    NodeId
}

/// Generator for creating unique IDs of a specific type
///
/// Thread-safe, so a generator can be shared by builders running on
/// different threads.
#[derive(Debug)]
pub struct IdGenerator<T: IdType> {
    next_id: AtomicU32,
    _phantom: PhantomData<T>,
}

impl<T: IdType> IdGenerator<T> {
    /// Create a new ID generator starting from the first valid ID
    pub const fn new() -> Self {
        Self {
            next_id: AtomicU32::new(0),
            _phantom: PhantomData,
        }
    }

    /// Create a new ID generator starting from a specific ID
    pub const fn with_start(start_id: u32) -> Self {
        Self {
            next_id: AtomicU32::new(start_id),
            _phantom: PhantomData,
        }
    }

    /// Generate the next unique ID
    ///
    /// Panics if we run out of valid IDs (after 2^32 - 2 allocations).
    pub fn next(&self) -> T {
        let raw_id = self.next_id.fetch_add(1, Ordering::Relaxed);

        // u32::MAX is reserved as the invalid sentinel
        if raw_id == u32::MAX {
            panic!(
                "ID generator overflow: exhausted all valid IDs for {}",
                std::any::type_name::<T>()
            );
        }

        T::from_raw(raw_id)
    }

    /// Get the number of IDs generated so far
    pub fn count(&self) -> u32 {
        self.next_id.load(Ordering::Relaxed)
    }
}

impl<T: IdType> Default for IdGenerator<T> {
    fn default() -> Self {
        Self::new()
    }
}
