//! Per-node, per-context logical state.
//!
//! A `LogicalState` aggregates the node's field states, the two epochs of
//! user lists, outstanding reduction modes, and projection epochs. All
//! mutation happens behind the node's analysis lock; the state itself is
//! plain data.

use std::collections::HashMap;

use tracing::trace;
use weft_types::{FieldMask, ProjectionEpochId, RedopId};

use crate::field_state::FieldState;
use crate::projection::{ProjectionEpoch, ProjectionInfo};
use crate::users::LogicalUser;

/// Logical analysis state hung off one region-tree node.
#[derive(Default)]
pub struct LogicalState {
    pub field_states: Vec<FieldState>,
    pub curr_epoch_users: Vec<LogicalUser>,
    pub prev_epoch_users: Vec<LogicalUser>,
    /// Fields with an outstanding reduction mode at this node.
    pub reduction_fields: FieldMask,
    pub outstanding_reductions: HashMap<RedopId, FieldMask>,
    pub projection_epochs: Vec<ProjectionEpoch>,
}

impl LogicalState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Debug check that the state is pristine.
    pub fn check_init(&self) {
        debug_assert!(self.field_states.is_empty());
        debug_assert!(self.curr_epoch_users.is_empty());
        debug_assert!(self.prev_epoch_users.is_empty());
        debug_assert!(self.projection_epochs.is_empty());
        debug_assert!(self.reduction_fields.is_empty());
    }

    /// Drop both epoch user lists, releasing their mapping references.
    pub fn clear_logical_users(&mut self) {
        for user in self.curr_epoch_users.drain(..) {
            user.op.remove_mapping_reference(user.gen);
        }
        for user in self.prev_epoch_users.drain(..) {
            user.op.remove_mapping_reference(user.gen);
        }
    }

    /// Return the state to pristine.
    pub fn reset(&mut self) {
        self.field_states.clear();
        self.clear_logical_users();
        self.reduction_fields = FieldMask::EMPTY;
        self.outstanding_reductions.clear();
        self.projection_epochs.clear();
    }

    /// Strip a deleted field mask from every structure, dropping emptied
    /// entries.
    pub fn clear_deleted_state(&mut self, deleted_mask: FieldMask) {
        self.field_states.retain_mut(|fs| !fs.filter(deleted_mask));
        self.reduction_fields -= deleted_mask;
        self.outstanding_reductions.retain(|_, mask| {
            *mask -= deleted_mask;
            !mask.is_empty()
        });
    }

    /// Move every projection epoch overlapping `advance_mask` to its
    /// successor id, coalescing epochs that land on the same id.
    pub fn advance_projection_epochs(&mut self, advance_mask: FieldMask) {
        let mut to_add: Vec<ProjectionEpoch> = Vec::new();
        self.projection_epochs.retain_mut(|epoch| {
            let overlap = epoch.valid_fields & advance_mask;
            if overlap.is_empty() {
                return true;
            }
            let next_id = epoch.epoch_id.next();
            if let Some(pos) = to_add.iter().position(|next| next.epoch_id == next_id) {
                to_add[pos].valid_fields |= overlap;
            } else {
                to_add.push(ProjectionEpoch::new(next_id, overlap));
            }
            epoch.valid_fields -= overlap;
            !epoch.valid_fields.is_empty()
        });
        self.projection_epochs.extend(to_add);
    }

    /// Capture a projection launch into the epochs covering `capture_mask`,
    /// starting a first epoch for any uncovered fields.
    pub fn update_projection_epochs(&mut self, capture_mask: FieldMask, info: &ProjectionInfo) {
        debug_assert!(!capture_mask.is_empty());
        let mut remaining = capture_mask;
        for epoch in &mut self.projection_epochs {
            let overlap = epoch.valid_fields & remaining;
            if overlap.is_empty() {
                continue;
            }
            epoch.insert(info);
            remaining -= overlap;
            if remaining.is_empty() {
                return;
            }
        }
        let mut epoch = ProjectionEpoch::new(ProjectionEpochId::FIRST, remaining);
        epoch.insert(info);
        self.projection_epochs.push(epoch);
    }

    /// Current epoch id for `field_mask`, if one projection epoch covers it.
    #[must_use]
    pub fn projection_epoch_for(&self, field_mask: FieldMask) -> Option<ProjectionEpochId> {
        self.projection_epochs
            .iter()
            .find(|epoch| !(epoch.valid_fields & field_mask).is_empty())
            .map(|epoch| epoch.epoch_id)
    }

    /// Record an outstanding reduction mode.
    pub fn record_reduction(&mut self, redop: RedopId, mask: FieldMask) {
        debug_assert!(
            self.outstanding_reductions
                .iter()
                .all(|(&other, other_mask)| other == redop || other_mask.is_disjoint(&mask)),
            "two reduction operators outstanding on one field"
        );
        self.reduction_fields |= mask;
        *self
            .outstanding_reductions
            .entry(redop)
            .or_insert(FieldMask::EMPTY) |= mask;
    }

    /// Clear outstanding reductions for `mask`.
    pub fn clear_reductions(&mut self, mask: FieldMask) {
        if self.reduction_fields.is_disjoint(&mask) {
            return;
        }
        self.reduction_fields -= mask;
        self.outstanding_reductions.retain(|_, redop_mask| {
            *redop_mask -= mask;
            !redop_mask.is_empty()
        });
    }

    /// Add `new_state`, merging it into an existing compatible state.
    pub fn merge_new_field_state(&mut self, new_state: FieldState, all_children_disjoint: bool) {
        for existing in &mut self.field_states {
            if existing.overlaps(&new_state) {
                let was_stale = existing.rebuild_timeout == 0;
                existing.merge(new_state, all_children_disjoint);
                if was_stale {
                    // Incremental merging stopped converging; rebuild from
                    // the merged form.
                    existing.rebuild_timeout = 1;
                }
                return;
            }
        }
        self.field_states.push(new_state);
    }

    /// Coalesce any field states that became mergeable.
    pub fn coalesce_field_states(&mut self, all_children_disjoint: bool) {
        let mut idx = 0;
        while idx < self.field_states.len() {
            let mut other = idx + 1;
            while other < self.field_states.len() {
                if self.field_states[idx].overlaps(&self.field_states[other]) {
                    let absorbed = self.field_states.remove(other);
                    self.field_states[idx].merge(absorbed, all_children_disjoint);
                } else {
                    other += 1;
                }
            }
            idx += 1;
        }
    }

    /// Strip `filter_mask` from the previous-epoch users, dropping emptied
    /// records.
    pub fn filter_prev_epoch_users(&mut self, filter_mask: FieldMask) {
        self.prev_epoch_users.retain_mut(|user| {
            user.field_mask -= filter_mask;
            if user.field_mask.is_empty() {
                user.op.remove_mapping_reference(user.gen);
                false
            } else {
                true
            }
        });
    }

    /// Move the `filter_mask` portion of every current-epoch user to the
    /// previous epoch.
    pub fn filter_curr_epoch_users(&mut self, filter_mask: FieldMask) {
        let mut moved: Vec<LogicalUser> = Vec::new();
        self.curr_epoch_users.retain_mut(|user| {
            let overlap = user.field_mask & filter_mask;
            if overlap.is_empty() {
                return true;
            }
            let mut shifted = user.clone();
            shifted.field_mask = overlap;
            shifted.op.add_mapping_reference(shifted.gen);
            moved.push(shifted);
            user.field_mask -= overlap;
            if user.field_mask.is_empty() {
                user.op.remove_mapping_reference(user.gen);
                false
            } else {
                true
            }
        });
        self.prev_epoch_users.extend(moved);
    }

    /// Emit the state through `tracing` for diagnostics.
    pub fn dump_state(&self, capture_mask: &FieldMask) {
        trace!(
            states = self.field_states.len(),
            curr_users = self.curr_epoch_users.len(),
            prev_users = self.prev_epoch_users.len(),
            reductions = %self.reduction_fields,
            "logical state"
        );
        for fs in &self.field_states {
            if fs.valid_fields.is_disjoint(capture_mask) {
                continue;
            }
            fs.dump(capture_mask);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::projection::ProjectionFunction;
    use weft_forest::IndexSpaceExpr;
    use weft_types::{FieldId, ProjectionId};

    fn mask_of(bits: &[u32]) -> FieldMask {
        bits.iter().map(|&b| FieldId(b)).collect()
    }

    fn info() -> ProjectionInfo {
        ProjectionInfo::new(
            ProjectionFunction {
                id: ProjectionId(0),
                depth: 0,
            },
            IndexSpaceExpr::interval(0, 7),
        )
    }

    #[test]
    fn test_update_then_advance_projection_epochs() {
        let mut state = LogicalState::new();
        let m01 = mask_of(&[0, 1]);
        state.update_projection_epochs(m01, &info());
        assert_eq!(
            state.projection_epoch_for(mask_of(&[0])),
            Some(ProjectionEpochId::FIRST)
        );
        // Advance only field 0; field 1 stays in the first epoch.
        state.advance_projection_epochs(mask_of(&[0]));
        assert_eq!(
            state.projection_epoch_for(mask_of(&[0])),
            Some(ProjectionEpochId(1))
        );
        assert_eq!(
            state.projection_epoch_for(mask_of(&[1])),
            Some(ProjectionEpochId::FIRST)
        );
        // Advancing both coalesces onto epoch 1 then 2 for field 0.
        state.advance_projection_epochs(m01);
        assert_eq!(
            state.projection_epoch_for(mask_of(&[0])),
            Some(ProjectionEpochId(2))
        );
        assert_eq!(
            state.projection_epoch_for(mask_of(&[1])),
            Some(ProjectionEpochId(1))
        );
    }

    #[test]
    fn test_record_and_clear_reductions() {
        let mut state = LogicalState::new();
        let redop = RedopId::new(3).unwrap();
        state.record_reduction(redop, mask_of(&[0]));
        state.record_reduction(redop, mask_of(&[1]));
        assert_eq!(state.reduction_fields, mask_of(&[0, 1]));
        state.clear_reductions(mask_of(&[0]));
        assert_eq!(state.reduction_fields, mask_of(&[1]));
        state.clear_reductions(mask_of(&[1]));
        assert!(state.outstanding_reductions.is_empty());
    }

    #[test]
    fn test_clear_deleted_state_drops_empty_field_states() {
        let mut state = LogicalState::new();
        let user = crate::users::GenericUser {
            usage: weft_types::RegionUsage::read_write(),
            field_mask: mask_of(&[0, 1]),
        };
        state.merge_new_field_state(
            FieldState::new(&user, mask_of(&[0, 1]), weft_types::Color(0)),
            false,
        );
        state.clear_deleted_state(mask_of(&[0]));
        assert_eq!(state.field_states.len(), 1);
        state.clear_deleted_state(mask_of(&[1]));
        assert!(state.field_states.is_empty());
    }
}
