//! Region usage descriptors: privilege, coherence, reduction operator.
//!
//! The conflict test between two usages is the heart of dependence analysis;
//! it lives here so that every layer (logical, versioning, restrictions)
//! agrees on one definition.

use std::fmt;

use crate::ids::RedopId;

/// Access privilege requested by a region requirement.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(u8)]
pub enum Privilege {
    /// No data access (metadata-only requirement).
    NoAccess = 0,
    ReadOnly = 1,
    ReadWrite = 2,
    /// Write where prior contents may be discarded.
    WriteDiscard = 3,
    /// Reduction access; the operator is carried in [`RegionUsage::redop`].
    Reduce = 4,
}

/// Coherence annotation on a region requirement.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(u8)]
pub enum Coherence {
    Exclusive = 0,
    Atomic = 1,
    Simultaneous = 2,
    Relaxed = 3,
}

/// One operation's declared access to a field-sub-region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct RegionUsage {
    pub privilege: Privilege,
    pub coherence: Coherence,
    /// Reduction operator; `Some` iff `privilege == Reduce`.
    pub redop: Option<RedopId>,
}

impl RegionUsage {
    /// Plain read-only exclusive usage.
    #[must_use]
    pub const fn read_only() -> Self {
        Self {
            privilege: Privilege::ReadOnly,
            coherence: Coherence::Exclusive,
            redop: None,
        }
    }

    /// Plain read-write exclusive usage.
    #[must_use]
    pub const fn read_write() -> Self {
        Self {
            privilege: Privilege::ReadWrite,
            coherence: Coherence::Exclusive,
            redop: None,
        }
    }

    /// Write-discard exclusive usage.
    #[must_use]
    pub const fn write_discard() -> Self {
        Self {
            privilege: Privilege::WriteDiscard,
            coherence: Coherence::Exclusive,
            redop: None,
        }
    }

    /// Reduction usage with the given operator.
    #[must_use]
    pub const fn reduce(redop: RedopId) -> Self {
        Self {
            privilege: Privilege::Reduce,
            coherence: Coherence::Exclusive,
            redop: Some(redop),
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_no_access(&self) -> bool {
        matches!(self.privilege, Privilege::NoAccess)
    }

    #[inline]
    #[must_use]
    pub const fn is_read_only(&self) -> bool {
        matches!(self.privilege, Privilege::ReadOnly)
    }

    /// Whether this usage mutates data in a way that must drain readers
    /// (reductions are handled separately).
    #[inline]
    #[must_use]
    pub const fn is_write(&self) -> bool {
        matches!(self.privilege, Privilege::ReadWrite | Privilege::WriteDiscard)
    }

    #[inline]
    #[must_use]
    pub const fn is_reduce(&self) -> bool {
        matches!(self.privilege, Privilege::Reduce)
    }
}

impl fmt::Display for RegionUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.privilege, self.redop) {
            (Privilege::Reduce, Some(redop)) => write!(f, "reduce({redop})"),
            (privilege, _) => write!(f, "{privilege:?}"),
        }
    }
}

/// Whether two usages on overlapping fields and overlapping sub-regions
/// force a happens-before edge.
///
/// Read-read never conflicts; two reductions with the same operator commute;
/// everything else conflicts. Anti-dependences are not distinguished from
/// true dependences: the answer is simply "must wait".
#[must_use]
pub fn usages_conflict(earlier: &RegionUsage, later: &RegionUsage) -> bool {
    if earlier.is_no_access() || later.is_no_access() {
        return false;
    }
    if earlier.is_read_only() && later.is_read_only() {
        return false;
    }
    if let (Some(a), Some(b)) = (earlier.redop, later.redop) {
        if earlier.is_reduce() && later.is_reduce() {
            return a != b;
        }
    }
    true
}
