//! Projection launches and their epochs.
//!
//! An index launch names a projection function and a launch domain instead
//! of a concrete sub-region. Per-field projection epochs let structurally
//! identical launches coexist without replaying dependence analysis; any
//! interfering access advances the epoch.

use std::collections::HashSet;

use weft_forest::IndexSpaceExpr;
use weft_types::{FieldMask, ProjectionEpochId, ProjectionId};

/// A registered projection function.
///
/// Depth is the number of tree levels the function descends below the
/// requirement's node; depth zero onto a disjoint partition means every
/// launch point maps to a unique disjoint child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProjectionFunction {
    pub id: ProjectionId,
    pub depth: u32,
}

/// The projection part of a region requirement, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectionInfo {
    pub function: ProjectionFunction,
    pub launch_domain: IndexSpaceExpr,
}

impl ProjectionInfo {
    #[must_use]
    pub fn new(function: ProjectionFunction, launch_domain: IndexSpaceExpr) -> Self {
        Self {
            function,
            launch_domain,
        }
    }
}

/// One epoch of structurally compatible projection launches over a set of
/// fields.
#[derive(Debug, Clone)]
pub struct ProjectionEpoch {
    pub epoch_id: ProjectionEpochId,
    pub valid_fields: FieldMask,
    /// The `(function, launch domain)` pairs captured in this epoch.
    write_projections: HashSet<(ProjectionFunction, IndexSpaceExpr)>,
}

impl ProjectionEpoch {
    #[must_use]
    pub fn new(epoch_id: ProjectionEpochId, valid_fields: FieldMask) -> Self {
        debug_assert!(!valid_fields.is_empty());
        Self {
            epoch_id,
            valid_fields,
            write_projections: HashSet::new(),
        }
    }

    /// Capture a launch into this epoch.
    pub fn insert(&mut self, info: &ProjectionInfo) {
        debug_assert!(!self.valid_fields.is_empty());
        self.write_projections
            .insert((info.function, info.launch_domain.clone()));
    }

    /// Whether the epoch has captured this exact launch shape.
    #[must_use]
    pub fn contains(&self, info: &ProjectionInfo) -> bool {
        self.write_projections
            .contains(&(info.function, info.launch_domain.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_types::FieldId;

    fn f0() -> FieldMask {
        FieldMask::single(FieldId(0))
    }

    #[test]
    fn test_epoch_captures_launch_shapes() {
        let mut epoch = ProjectionEpoch::new(ProjectionEpochId::FIRST, f0());
        let info = ProjectionInfo::new(
            ProjectionFunction {
                id: ProjectionId(0),
                depth: 0,
            },
            IndexSpaceExpr::interval(0, 7),
        );
        assert!(!epoch.contains(&info));
        epoch.insert(&info);
        assert!(epoch.contains(&info));
        let narrower = ProjectionInfo::new(info.function, IndexSpaceExpr::interval(0, 3));
        assert!(!epoch.contains(&narrower));
    }
}
