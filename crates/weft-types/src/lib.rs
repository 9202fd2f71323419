//! Foundational types for the weft region-tree analysis core.
//!
//! This crate defines the cross-cutting identifier newtypes, the dense
//! [`FieldMask`] bit-set, region usage descriptors, and the little-endian
//! encoding helpers used by every normative wire format. Heavier machinery
//! (the region forest, the analyzers) lives in the crates built on top.

pub mod encoding;
pub mod field_mask;
pub mod ids;
pub mod usage;

pub use encoding::{
    append_bool, append_u16_le, append_u32_le, append_u64_le, read_bool, read_u16_le, read_u32_le,
    read_u64_le,
};
pub use field_mask::{FieldMask, FieldMaskIter, MAX_FIELDS};
pub use ids::{
    AddressSpaceId, Color, ContextId, ContextUid, DistributedId, FieldId, GenerationId,
    InvalidDistributedId, OpUniqueId, PartitionHandle, ProjectionEpochId, ProjectionId, RedopId,
    RegionHandle, TreeId,
};
pub use usage::{usages_conflict, Coherence, Privilege, RegionUsage};
