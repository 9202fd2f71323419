//! Builder for the synthetic close operations emitted by one analysis step.
//!
//! A closer accumulates the fields being closed and the prior users under
//! the closed children. Once siphoning finishes it materializes a single
//! merge-close operation that inherits the closed users' dependences and
//! takes their place in the parent node's current epoch.

use std::sync::Arc;

use tracing::debug;
use weft_error::{WeftError, WeftResult};
use weft_forest::NodeId;
use weft_types::{FieldMask, RegionUsage, usages_conflict};

use crate::context::AnalysisContext;
use crate::logical::LogicalState;
use crate::operation::{MergeCloseOp, Operation};
use crate::users::LogicalUser;

/// Accumulates close decisions during one per-node analysis step.
pub struct LogicalCloser {
    root: NodeId,
    close_mask: FieldMask,
    closed_users: Vec<LogicalUser>,
    close_op: Option<Arc<MergeCloseOp>>,
}

impl LogicalCloser {
    #[must_use]
    pub fn new(root: NodeId) -> Self {
        Self {
            root,
            close_mask: FieldMask::EMPTY,
            closed_users: Vec::new(),
            close_op: None,
        }
    }

    /// Record that `mask` must be closed at the root node.
    pub fn record_close_operation(&mut self, mask: FieldMask) {
        debug_assert!(!mask.is_empty());
        self.close_mask |= mask;
    }

    /// Record a prior user found under a closed child. `mask` restricts the
    /// record to the closed fields; the record carries its own mapping
    /// reference until [`LogicalCloser::perform_dependence_analysis`] runs.
    pub fn record_closed_user(&mut self, mut user: LogicalUser, mask: FieldMask) {
        user.field_mask = mask;
        user.op.add_mapping_reference(user.gen);
        self.closed_users.push(user);
    }

    #[inline]
    #[must_use]
    pub fn has_close_operations(&self) -> bool {
        !self.close_mask.is_empty()
    }

    /// Fields being closed so far.
    #[must_use]
    pub fn close_mask(&self) -> &FieldMask {
        &self.close_mask
    }

    /// Create the merge-close operation for the accumulated mask.
    pub fn initialize_close_operations(&mut self, ctx: &AnalysisContext, creator: &LogicalUser) {
        debug_assert!(!self.close_mask.is_empty());
        debug_assert!(self.close_op.is_none());
        let close_op = ctx.create_close_op(creator.op_id(), self.root, self.close_mask);
        debug!(
            close_op = %close_op.unique_op_id(),
            creator = %creator.op_id(),
            mask = %self.close_mask,
            "emitting merge close"
        );
        self.close_op = Some(close_op);
    }

    /// Register the close operation's happens-before edges: one on every
    /// closed user, and one on every user at the root node it conflicts
    /// with. Fails if the incoming operation closed over itself, which
    /// means its requirement reached aliased children of a non-disjoint
    /// partition.
    pub fn perform_dependence_analysis(
        &mut self,
        ctx: &AnalysisContext,
        current: &LogicalUser,
        state: &mut LogicalState,
    ) -> WeftResult<()> {
        let close_op = self.close_op.as_ref().expect("close op not initialized");
        let mut aliased = FieldMask::EMPTY;
        for closed in &self.closed_users {
            if closed.op_id() == current.op_id() && closed.gen == current.gen {
                aliased |= closed.field_mask;
                continue;
            }
            close_op.register_dependence(closed.op_id(), closed.gen);
        }
        if !aliased.is_empty() {
            for closed in self.closed_users.drain(..) {
                closed.op.remove_mapping_reference(closed.gen);
            }
            return Err(WeftError::AliasedInterferingChildren {
                op_id: current.op_id(),
                task_name: current.op.task_name().to_string(),
                context_uid: ctx.context_uid(),
            });
        }
        let close_usage = RegionUsage::read_write();
        for prior in state
            .curr_epoch_users
            .iter()
            .chain(&state.prev_epoch_users)
        {
            if prior.field_mask.is_disjoint(&self.close_mask) {
                continue;
            }
            if usages_conflict(&prior.usage, &close_usage) {
                close_op.register_dependence(prior.op_id(), prior.gen);
            }
        }
        for closed in self.closed_users.drain(..) {
            closed.op.remove_mapping_reference(closed.gen);
        }
        Ok(())
    }

    /// Retire the closed fields from the root node's epoch lists and
    /// reduction bookkeeping.
    pub fn update_state(&self, state: &mut LogicalState) {
        state.filter_prev_epoch_users(self.close_mask);
        state.filter_curr_epoch_users(self.close_mask);
        state.clear_reductions(self.close_mask);
    }

    /// Append the close operation to the root node's current epoch, where
    /// it stands in for everything it closed.
    pub fn register_close_operation(&self, state: &mut LogicalState) {
        let close_op = self.close_op.as_ref().expect("close op not initialized");
        let user = LogicalUser::new(
            Arc::clone(close_op) as Arc<dyn Operation>,
            0,
            RegionUsage::read_write(),
            self.close_mask,
        );
        user.op.add_mapping_reference(user.gen);
        state.curr_epoch_users.push(user);
    }

    /// The emitted close operation, if any.
    #[must_use]
    pub fn close_op(&self) -> Option<&Arc<MergeCloseOp>> {
        self.close_op.as_ref()
    }
}
