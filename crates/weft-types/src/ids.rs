//! Identifier newtypes shared across the analysis core.
//!
//! Each id is a transparent wrapper so that region handles, operation ids,
//! and distributed ids cannot be confused at call sites. Ids that travel on
//! the wire expose their raw integer through `get`/`raw`.

use std::fmt;
use std::num::{NonZeroU32, NonZeroU64};

/// Unique id assigned to every operation at creation, never recycled.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct OpUniqueId(pub u64);

impl fmt::Display for OpUniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

/// Generation counter of an operation slot.
///
/// Operation objects are recycled; a recorded `(op, generation)` pair is
/// stale once the operation's current generation has advanced past it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct GenerationId(pub u64);

impl GenerationId {
    /// First generation of a freshly created operation slot.
    pub const FIRST: Self = Self(0);

    /// The generation after this one.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

/// Dense per-node index of an analysis context.
///
/// Contexts index the per-node logical and version state arrays; they are
/// small integers local to one address space.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct ContextId(pub u32);

/// Globally unique id of an analysis context, stable across address spaces.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct ContextUid(pub u64);

impl fmt::Display for ContextUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx#{}", self.0)
    }
}

/// Address space (node) id within the distributed runtime.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
#[repr(transparent)]
pub struct AddressSpaceId(pub u32);

/// Globally stable id of a distributed collectable (equivalence sets,
/// physical managers).
///
/// Domain: `1..=u64::MAX`; zero is reserved as the "no id" wire sentinel.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct DistributedId(NonZeroU64);

impl DistributedId {
    /// Construct a `DistributedId` if `raw` is non-zero.
    #[inline]
    pub const fn new(raw: u64) -> Option<Self> {
        match NonZeroU64::new(raw) {
            Some(nz) => Some(Self(nz)),
            None => None,
        }
    }

    /// Get the raw u64 value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for DistributedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "did#{}", self.get())
    }
}

impl TryFrom<u64> for DistributedId {
    type Error = InvalidDistributedId;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Self::new(value).ok_or(InvalidDistributedId)
    }
}

/// Error returned when decoding a zero distributed id off the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidDistributedId;

impl fmt::Display for InvalidDistributedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("invalid DistributedId 0 (reserved sentinel)")
    }
}

impl std::error::Error for InvalidDistributedId {}

/// Color of a child within a partition (linearized point).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct Color(pub u64);

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// Index of a field within its field space; always `< MAX_FIELDS`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct FieldId(pub u32);

/// Reduction operator id. Zero is not a reduction; use `Option<RedopId>`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct RedopId(NonZeroU32);

impl RedopId {
    /// Construct a `RedopId` if `raw` is non-zero.
    #[inline]
    pub const fn new(raw: u32) -> Option<Self> {
        match NonZeroU32::new(raw) {
            Some(nz) => Some(Self(nz)),
            None => None,
        }
    }

    /// Get the raw u32 value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0.get()
    }
}

impl fmt::Display for RedopId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "redop{}", self.get())
    }
}

/// Region tree id; one per top-level region.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct TreeId(pub u32);

/// Id of a registered projection function.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct ProjectionId(pub u32);

/// Monotonically advancing epoch tag for projection launches, per field.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct ProjectionEpochId(pub u64);

impl ProjectionEpochId {
    /// Epoch assigned to the first projection launch over a field.
    pub const FIRST: Self = Self(0);

    /// The epoch after this one.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

/// Wire handle naming a region node: `(tree, index_space, field_space)`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct RegionHandle {
    pub tree_id: TreeId,
    pub index_space: u64,
    pub field_space: u32,
}

/// Wire handle naming a partition node: `(tree, index_partition, field_space)`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct PartitionHandle {
    pub tree_id: TreeId,
    pub index_partition: u64,
    pub field_space: u32,
}
