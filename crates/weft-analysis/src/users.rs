//! Per-operation user records.
//!
//! A user associates an operation with the usage and field mask it holds on
//! one node. Logical users live in the per-node epoch lists; physical users
//! cross address spaces and carry their index-space expression by value.

use weft_forest::IndexSpaceExpr;
use weft_types::{
    Color, FieldMask, GenerationId, OpUniqueId, Privilege, RegionUsage, append_bool, append_u32_le,
    append_u64_le, read_bool, read_u32_le, read_u64_le,
};

use crate::operation::OpHandle;

/// Epoch-filter passes a logical user survives in the current epoch before
/// being shifted to the previous one.
pub const LOGICAL_USER_TIMEOUT: u32 = 32;

/// Usage and mask, without operation identity.
#[derive(Debug, Clone)]
pub struct GenericUser {
    pub usage: RegionUsage,
    pub field_mask: FieldMask,
}

/// A logical user: one `(operation, requirement)` registered at a node.
#[derive(Clone)]
pub struct LogicalUser {
    pub op: OpHandle,
    pub gen: GenerationId,
    pub idx: u32,
    pub usage: RegionUsage,
    pub field_mask: FieldMask,
    /// Epoch-filter heuristic, not wall-clock; see `LOGICAL_USER_TIMEOUT`.
    pub timeout: u32,
}

impl LogicalUser {
    #[must_use]
    pub fn new(op: OpHandle, idx: u32, usage: RegionUsage, field_mask: FieldMask) -> Self {
        let gen = op.generation();
        Self {
            op,
            gen,
            idx,
            usage,
            field_mask,
            timeout: LOGICAL_USER_TIMEOUT,
        }
    }

    /// Whether the operation slot has been recycled past this record.
    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.op.generation() > self.gen
    }

    #[inline]
    #[must_use]
    pub fn op_id(&self) -> OpUniqueId {
        self.op.unique_op_id()
    }
}

impl std::fmt::Debug for LogicalUser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogicalUser")
            .field("op", &self.op.unique_op_id())
            .field("gen", &self.gen)
            .field("idx", &self.idx)
            .field("usage", &self.usage)
            .field("mask", &self.field_mask)
            .finish()
    }
}

/// A physical user: the view-level record shipped between address spaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalUser {
    pub usage: RegionUsage,
    /// Child color below the view's node, if the access went below it.
    pub child: Option<Color>,
    pub op_id: OpUniqueId,
    pub index: u32,
    pub expr: IndexSpaceExpr,
}

impl PhysicalUser {
    /// Append the wire encoding: expression, child, privilege, coherence,
    /// redop, op id, requirement index. Field order is normative.
    pub fn pack(&self, buf: &mut Vec<u8>) {
        self.expr.pack(buf);
        match self.child {
            Some(color) => {
                append_bool(buf, true);
                append_u64_le(buf, color.0);
            }
            None => append_bool(buf, false),
        }
        append_u32_le(buf, self.usage.privilege as u32);
        append_u32_le(buf, self.usage.coherence as u32);
        append_u32_le(buf, self.usage.redop.map_or(0, weft_types::RedopId::get));
        append_u64_le(buf, self.op_id.0);
        append_u32_le(buf, self.index);
    }

    /// Read the wire encoding written by [`PhysicalUser::pack`].
    #[must_use]
    pub fn unpack(buf: &[u8], offset: &mut usize) -> Option<Self> {
        let expr = IndexSpaceExpr::unpack(buf, offset)?;
        let child = if read_bool(buf, offset)? {
            Some(Color(read_u64_le(buf, offset)?))
        } else {
            None
        };
        let privilege = match read_u32_le(buf, offset)? {
            0 => Privilege::NoAccess,
            1 => Privilege::ReadOnly,
            2 => Privilege::ReadWrite,
            3 => Privilege::WriteDiscard,
            4 => Privilege::Reduce,
            _ => return None,
        };
        let coherence = match read_u32_le(buf, offset)? {
            0 => weft_types::Coherence::Exclusive,
            1 => weft_types::Coherence::Atomic,
            2 => weft_types::Coherence::Simultaneous,
            3 => weft_types::Coherence::Relaxed,
            _ => return None,
        };
        let redop = weft_types::RedopId::new(read_u32_le(buf, offset)?);
        let op_id = OpUniqueId(read_u64_le(buf, offset)?);
        let index = read_u32_le(buf, offset)?;
        Some(Self {
            usage: RegionUsage {
                privilege,
                coherence,
                redop,
            },
            child,
            op_id,
            index,
            expr,
        })
    }
}
