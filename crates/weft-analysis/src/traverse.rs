//! Tree traversers.
//!
//! Two traversal patterns cover every maintenance walk the analyzers need:
//! along a path (one child per depth) or over a whole sub-tree. The
//! visitors are a closed tagged variant rather than a trait hierarchy; the
//! shared drivers decide path-versus-subtree and child enumeration.

use weft_forest::{NodeId, RegionTreePath};
use weft_types::FieldMask;

use crate::context::AnalysisContext;
use crate::users::LogicalUser;

/// The closed set of tree visitors.
pub enum NodeVisitor<'a> {
    /// Register dependences for `user` along a path, fanning out over the
    /// sub-tree below the path's bottom.
    LogicalPathRegistrar {
        ctx: &'a AnalysisContext,
        user: &'a LogicalUser,
        path: &'a RegionTreePath,
    },
    /// Register dependences for `user` against every user of the visited
    /// node, regardless of usage (deletions conflict with everything).
    LogicalRegistrar {
        ctx: &'a AnalysisContext,
        user: &'a LogicalUser,
        dominate: bool,
    },
    /// Check that freshly initialized logical states are pristine.
    CurrentInitializer { ctx: &'a AnalysisContext },
    /// Reset the logical state of every visited node.
    CurrentInvalidator {
        ctx: &'a AnalysisContext,
        users_only: bool,
    },
    /// Strip a deleted field mask from every visited node.
    DeletionInvalidator {
        ctx: &'a AnalysisContext,
        deletion_mask: FieldMask,
    },
    /// Reset the version manager of every visited node.
    VersioningInvalidator { ctx: &'a AnalysisContext },
}

impl NodeVisitor<'_> {
    /// Visit a region node; returns whether to continue below it.
    pub fn visit_region(&mut self, node: NodeId) -> bool {
        self.visit(node)
    }

    /// Visit a partition node; returns whether to continue below it.
    pub fn visit_partition(&mut self, node: NodeId) -> bool {
        self.visit(node)
    }

    fn visit(&mut self, node: NodeId) -> bool {
        match self {
            Self::LogicalPathRegistrar { ctx, user, path } => {
                let ctx: &AnalysisContext = *ctx;
                let user: &LogicalUser = *user;
                register_node_dependences(ctx, node, user, false);
                let depth = ctx.forest().depth(node);
                if !path.has_child(depth) {
                    // Bottom of the path: fan out over everything below.
                    let mut registrar = NodeVisitor::LogicalRegistrar {
                        ctx,
                        user,
                        dominate: false,
                    };
                    for (_, child) in ctx.forest().children(node) {
                        traverse_subtree(ctx, child, &mut registrar);
                    }
                }
                true
            }
            Self::LogicalRegistrar {
                ctx,
                user,
                dominate,
            } => {
                register_node_dependences(ctx, node, user, *dominate);
                true
            }
            Self::CurrentInitializer { ctx } => {
                if let Some(state) = ctx.try_logical_state(node) {
                    state.lock().check_init();
                }
                true
            }
            Self::CurrentInvalidator { ctx, users_only } => {
                if let Some(state) = ctx.try_logical_state(node) {
                    let mut state = state.lock();
                    if *users_only {
                        state.clear_logical_users();
                    } else {
                        state.reset();
                    }
                }
                true
            }
            Self::DeletionInvalidator { ctx, deletion_mask } => {
                if let Some(state) = ctx.try_logical_state(node) {
                    state.lock().clear_deleted_state(*deletion_mask);
                }
                true
            }
            Self::VersioningInvalidator { ctx } => {
                if let Some(manager) = ctx.try_version_manager(node) {
                    manager.reset();
                }
                true
            }
        }
    }
}

/// Drive a visitor along a path starting at `start`.
pub fn traverse_path(
    ctx: &AnalysisContext,
    start: NodeId,
    path: &RegionTreePath,
    visitor: &mut NodeVisitor<'_>,
) {
    let mut node = start;
    loop {
        let keep_going = if ctx.forest().is_region(node) {
            visitor.visit_region(node)
        } else {
            visitor.visit_partition(node)
        };
        if !keep_going {
            return;
        }
        let depth = ctx.forest().depth(node);
        match path.get_child(depth) {
            Some(color) => match ctx.forest().get_tree_child(node, color) {
                Some(child) => node = child,
                None => return,
            },
            None => return,
        }
    }
}

/// Drive a visitor over the whole sub-tree rooted at `node`, parents first.
pub fn traverse_subtree(ctx: &AnalysisContext, node: NodeId, visitor: &mut NodeVisitor<'_>) {
    let keep_going = if ctx.forest().is_region(node) {
        visitor.visit_region(node)
    } else {
        visitor.visit_partition(node)
    };
    if !keep_going {
        return;
    }
    for (_, child) in ctx.forest().children(node) {
        traverse_subtree(ctx, child, visitor);
    }
}

/// Register `user` against every user of `node` for its field mask. With
/// `dominate` the touched records are filtered from the epoch lists.
fn register_node_dependences(ctx: &AnalysisContext, node: NodeId, user: &LogicalUser, dominate: bool) {
    let Some(state_arc) = ctx.try_logical_state(node) else {
        return;
    };
    let mut state = state_arc.lock();
    let mask = user.field_mask;
    let mut registered = FieldMask::EMPTY;
    for prior in state
        .curr_epoch_users
        .iter()
        .chain(&state.prev_epoch_users)
    {
        let overlap = prior.field_mask & mask;
        if overlap.is_empty() {
            continue;
        }
        if prior.op_id() == user.op_id() && prior.gen == user.gen {
            continue;
        }
        user.op.register_dependence(prior.op_id(), prior.gen);
        registered |= overlap;
    }
    if dominate && !registered.is_empty() {
        state.filter_prev_epoch_users(registered);
        state.filter_curr_epoch_users(registered);
    }
}
