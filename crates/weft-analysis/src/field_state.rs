//! Field states: how a node's children are open for a sub-mask of fields.

use std::collections::BTreeMap;

use tracing::debug;
use weft_types::{Color, FieldMask, RedopId, RegionUsage};

use crate::projection::{ProjectionFunction, ProjectionInfo};
use crate::users::GenericUser;

/// The ten ways a set of fields can be open below a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpenState {
    NotOpen,
    OpenReadOnly,
    OpenReadWrite,
    OpenSingleReduce,
    OpenMultiReduce,
    OpenReadOnlyProj,
    OpenReadWriteProj,
    /// Depth-zero projection onto a disjoint partition: every launch point
    /// maps to a unique disjoint child.
    OpenReadWriteProjDisjointShallow,
    OpenReduceProj,
    OpenReduceProjDirty,
}

impl OpenState {
    /// Whether this state was opened by a projection launch.
    #[inline]
    #[must_use]
    pub fn is_projection(self) -> bool {
        matches!(
            self,
            Self::OpenReadOnlyProj
                | Self::OpenReadWriteProj
                | Self::OpenReadWriteProjDisjointShallow
                | Self::OpenReduceProj
                | Self::OpenReduceProjDirty
        )
    }

    /// Whether this state carries a reduction operator.
    #[inline]
    #[must_use]
    pub fn is_reduction(self) -> bool {
        matches!(
            self,
            Self::OpenSingleReduce
                | Self::OpenMultiReduce
                | Self::OpenReduceProj
                | Self::OpenReduceProjDirty
        )
    }
}

/// Summary of how children are open for `valid_fields`.
///
/// For non-projection states `valid_fields` equals the union of the open
/// child masks; projection states track no children (the launch frontier
/// stops here).
#[derive(Debug, Clone)]
pub struct FieldState {
    pub valid_fields: FieldMask,
    pub open_state: OpenState,
    pub redop: Option<RedopId>,
    pub projection: Option<ProjectionFunction>,
    pub projection_domain: Option<weft_forest::IndexSpaceExpr>,
    pub open_children: BTreeMap<Color, FieldMask>,
    pub rebuild_timeout: u32,
}

impl FieldState {
    /// Open a child for a non-projection user.
    #[must_use]
    pub fn new(user: &GenericUser, mask: FieldMask, child: Color) -> Self {
        let (open_state, redop) = if user.usage.is_read_only() {
            (OpenState::OpenReadOnly, None)
        } else if user.usage.is_reduce() {
            (OpenState::OpenSingleReduce, user.usage.redop)
        } else {
            (OpenState::OpenReadWrite, None)
        };
        let mut open_children = BTreeMap::new();
        open_children.insert(child, mask);
        Self {
            valid_fields: mask,
            open_state,
            redop,
            projection: None,
            projection_domain: None,
            open_children,
            rebuild_timeout: 1,
        }
    }

    /// Open a projection frontier at this node.
    #[must_use]
    pub fn new_projection(
        usage: &RegionUsage,
        mask: FieldMask,
        info: &ProjectionInfo,
        all_children_disjoint: bool,
        dirty_reduction: bool,
    ) -> Self {
        let (open_state, redop) = if usage.is_read_only() {
            (OpenState::OpenReadOnlyProj, None)
        } else if usage.is_reduce() {
            let state = if dirty_reduction {
                OpenState::OpenReduceProjDirty
            } else {
                OpenState::OpenReduceProj
            };
            (state, usage.redop)
        } else if all_children_disjoint && info.function.depth == 0 {
            (OpenState::OpenReadWriteProjDisjointShallow, None)
        } else {
            (OpenState::OpenReadWriteProj, None)
        };
        Self {
            valid_fields: mask,
            open_state,
            redop,
            projection: Some(info.function),
            projection_domain: Some(info.launch_domain.clone()),
            open_children: BTreeMap::new(),
            rebuild_timeout: 1,
        }
    }

    /// Whether `self` and `rhs` may be merged into one state.
    #[must_use]
    pub fn overlaps(&self, rhs: &Self) -> bool {
        if self.redop != rhs.redop {
            return false;
        }
        if self.projection != rhs.projection {
            return false;
        }
        if self.projection.is_some() && self.projection_domain != rhs.projection_domain {
            return false;
        }
        if self.redop.is_none() {
            self.open_state == rhs.open_state
        } else {
            // Reduction states merge only with exactly matching masks,
            // which are single fields in practice.
            self.valid_fields == rhs.valid_fields
        }
    }

    /// Merge `rhs` into `self`. Callers must have checked
    /// [`FieldState::overlaps`] first.
    pub fn merge(&mut self, rhs: Self, all_children_disjoint: bool) {
        debug_assert_eq!(self.redop, rhs.redop);
        debug_assert_eq!(self.projection, rhs.projection);
        self.valid_fields |= rhs.valid_fields;
        for (color, mask) in rhs.open_children {
            *self
                .open_children
                .entry(color)
                .or_insert(FieldMask::EMPTY) |= mask;
        }
        if self.redop.is_some() && !self.open_state.is_projection() {
            if self.open_children.is_empty() {
                // Node-local reduction record, no children to distinguish.
                self.open_state = OpenState::OpenSingleReduce;
            } else if all_children_disjoint {
                // Disjoint children make the reduction modes
                // indistinguishable from plain read-write below.
                self.open_state = OpenState::OpenReadWrite;
                self.redop = None;
            } else if self.open_children.len() == 1 {
                self.open_state = OpenState::OpenSingleReduce;
            } else {
                self.open_state = OpenState::OpenMultiReduce;
            }
        }
    }

    /// Whether this projection state's launch domain contains `next`.
    #[must_use]
    pub fn projection_domain_dominates(&self, next: &weft_forest::IndexSpaceExpr) -> bool {
        match &self.projection_domain {
            Some(domain) => domain.dominates(next),
            None => false,
        }
    }

    /// Remove `mask` from this state and its children, dropping emptied
    /// child entries. Returns whether the state itself is now empty.
    /// Projection frontiers and childless reduction records live on their
    /// own mask rather than their children.
    pub fn filter(&mut self, mask: FieldMask) -> bool {
        self.valid_fields -= mask;
        self.open_children.retain(|_, child_mask| {
            *child_mask -= mask;
            !child_mask.is_empty()
        });
        if self.valid_fields.is_empty() {
            return true;
        }
        !self.open_state.is_projection()
            && !self.open_state.is_reduction()
            && self.open_children.is_empty()
    }

    /// Emit this state through `tracing` for diagnostics.
    pub fn dump(&self, capture_mask: &FieldMask) {
        debug!(
            state = ?self.open_state,
            redop = self.redop.map(RedopId::get),
            fields = %self.valid_fields,
            children = self.open_children.len(),
            "field state"
        );
        for (color, mask) in &self.open_children {
            let overlap = *mask & *capture_mask;
            if overlap.is_empty() {
                continue;
            }
            debug!(color = color.0, mask = %overlap, "open child");
        }
    }
}
