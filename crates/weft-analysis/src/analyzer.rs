//! The logical dependence analyzer.
//!
//! One `(operation, requirement)` step walks the requirement's path from
//! its parent node down to the requested node (or projection frontier).
//! At every node it siphons the open children against the incoming access,
//! emits a merge close where the open/close rules demand one, performs the
//! two-epoch dependence checks, and finally registers the user.

use tracing::trace;
use weft_error::WeftResult;
use weft_forest::{NodeId, RegionTreePath};
use weft_types::{Color, FieldMask, usages_conflict};

use crate::closer::LogicalCloser;
use crate::context::AnalysisContext;
use crate::field_state::{FieldState, OpenState};
use crate::logical::LogicalState;
use crate::projection::ProjectionInfo;
use crate::users::{GenericUser, LogicalUser};

/// Walk the requirement's path, running one analysis step per node.
pub(crate) fn register_logical_user(
    ctx: &AnalysisContext,
    start: NodeId,
    user: &LogicalUser,
    path: &RegionTreePath,
    proj: Option<&ProjectionInfo>,
) -> WeftResult<()> {
    let mut node = start;
    loop {
        let depth = ctx.forest().depth(node);
        let next_child = path.get_child(depth);
        analyze_node(ctx, node, user, next_child, proj)?;
        match next_child {
            Some(color) => {
                node = ctx
                    .forest()
                    .get_tree_child(node, color)
                    .expect("path names a missing child");
            }
            None => return Ok(()),
        }
    }
}

/// One per-node analysis step.
fn analyze_node(
    ctx: &AnalysisContext,
    node: NodeId,
    user: &LogicalUser,
    next_child: Option<Color>,
    proj: Option<&ProjectionInfo>,
) -> WeftResult<()> {
    let arrived = next_child.is_none();
    let state_arc = ctx.logical_state(node);
    let mut state = state_arc.lock();
    trace!(node = node.0, op = %user.op_id(), arrived, "logical analysis step");

    let mut closer = LogicalCloser::new(node);
    siphon_open_children(ctx, &mut state, node, user, next_child, proj, &mut closer);

    if closer.has_close_operations() {
        closer.initialize_close_operations(ctx, user);
        closer.perform_dependence_analysis(ctx, user, &mut state)?;
        closer.update_state(&mut state);
        closer.register_close_operation(&mut state);
        if let Some(close_op) = closer.close_op() {
            ctx.record_emitted_close(close_op.clone());
        }
    }

    if arrived {
        let dominator_mask = perform_current_checks(user, &mut state, user.field_mask, true);
        // The previous epoch is checked on the full mask: the timeout
        // heuristic can park users there whose fields the current epoch no
        // longer covers, and their edges must still be found.
        perform_previous_checks(user, &mut state, user.field_mask);
        if !dominator_mask.is_empty() {
            state.filter_prev_epoch_users(dominator_mask);
            state.filter_curr_epoch_users(dominator_mask);
            if !user.usage.is_reduce() {
                state.clear_reductions(dominator_mask);
            }
        }
        if user.usage.is_reduce() {
            if let Some(redop) = user.usage.redop {
                state.record_reduction(redop, user.field_mask);
            }
        }
        if let Some(info) = proj {
            state.update_projection_epochs(user.field_mask, info);
        }
        user.op.add_mapping_reference(user.gen);
        state.curr_epoch_users.push(user.clone());
    } else {
        perform_current_checks(user, &mut state, user.field_mask, false);
        perform_previous_checks(user, &mut state, user.field_mask);
    }
    if tracing::enabled!(tracing::Level::TRACE) {
        state.dump_state(&user.field_mask);
    }
    Ok(())
}

/// Dependence checks against the current epoch. With `track_dom` the
/// returned mask covers the fields whose entire epoch the user dominated
/// (every overlapping prior either conflicted or was the same operation).
fn perform_current_checks(
    user: &LogicalUser,
    state: &mut LogicalState,
    check_mask: FieldMask,
    track_dom: bool,
) -> FieldMask {
    let mut dominator_mask = check_mask;
    let mut idx = 0;
    while idx < state.curr_epoch_users.len() {
        let prior = &mut state.curr_epoch_users[idx];
        let overlap = prior.field_mask & check_mask;
        if overlap.is_empty() {
            // Epoch-filter heuristic: untouched users age out of the
            // current epoch.
            if prior.timeout == 0 {
                let shifted = prior.clone();
                state.curr_epoch_users.remove(idx);
                state.prev_epoch_users.push(shifted);
                continue;
            }
            prior.timeout -= 1;
            idx += 1;
            continue;
        }
        let same_op = prior.op_id() == user.op_id() && prior.gen == user.gen;
        if !same_op {
            if usages_conflict(&prior.usage, &user.usage) {
                user.op.register_dependence(prior.op_id(), prior.gen);
            } else {
                dominator_mask -= overlap;
            }
        }
        idx += 1;
    }
    if track_dom { dominator_mask } else { FieldMask::EMPTY }
}

/// Dependence checks against the previous epoch. Conflicting entries are
/// filtered after use.
fn perform_previous_checks(user: &LogicalUser, state: &mut LogicalState, check_mask: FieldMask) {
    let mut idx = 0;
    while idx < state.prev_epoch_users.len() {
        let prior = &mut state.prev_epoch_users[idx];
        let overlap = prior.field_mask & check_mask;
        if overlap.is_empty() {
            idx += 1;
            continue;
        }
        let same_op = prior.op_id() == user.op_id() && prior.gen == user.gen;
        if !same_op && usages_conflict(&prior.usage, &user.usage) {
            user.op.register_dependence(prior.op_id(), prior.gen);
            prior.field_mask -= overlap;
            if prior.field_mask.is_empty() {
                prior.op.remove_mapping_reference(prior.gen);
                state.prev_epoch_users.remove(idx);
                continue;
            }
        }
        idx += 1;
    }
}

/// Drive the open/close transition rules for one incoming access, then
/// open the node for the access itself.
#[allow(clippy::too_many_lines)]
fn siphon_open_children(
    ctx: &AnalysisContext,
    state: &mut LogicalState,
    node: NodeId,
    user: &LogicalUser,
    next_child: Option<Color>,
    proj: Option<&ProjectionInfo>,
    closer: &mut LogicalCloser,
) {
    let current_mask = user.field_mask;
    let all_disjoint = ctx.forest().are_all_children_disjoint(node);
    // Fields already open along the descent child; they need no reopen.
    let mut open_below = FieldMask::EMPTY;

    // Dirty-reduction test: a reduction projection issued over fields that
    // already hold write state at this node goes to the dirty variant.
    let dirty_fields: FieldMask = state
        .field_states
        .iter()
        .filter(|fs| {
            matches!(
                fs.open_state,
                OpenState::OpenReadWrite
                    | OpenState::OpenReadWriteProj
                    | OpenState::OpenReadWriteProjDisjointShallow
            )
        })
        .fold(FieldMask::EMPTY, |acc, fs| acc | fs.valid_fields);

    let mut idx = 0;
    while idx < state.field_states.len() {
        let overlap = state.field_states[idx].valid_fields & current_mask;
        if overlap.is_empty() {
            idx += 1;
            continue;
        }
        let open_state = state.field_states[idx].open_state;
        let mut remove_state = false;
        match open_state {
            OpenState::NotOpen => {
                remove_state = true;
            }
            OpenState::OpenReadOnly => {
                if user.usage.is_read_only() {
                    // Readers coexist across children and launches alike.
                    if let Some(color) = next_child {
                        if let Some(child_mask) =
                            state.field_states[idx].open_children.get(&color)
                        {
                            open_below |= *child_mask & current_mask;
                        }
                    }
                } else {
                    // Writers and reducers retire the open readers; the
                    // child being descended into upgrades in place without
                    // a flush.
                    remove_state = close_children(
                        ctx,
                        state,
                        idx,
                        node,
                        current_mask,
                        next_child,
                        closer,
                        TargetPolicy::UpgradeInPlace,
                    );
                }
            }
            OpenState::OpenReadWrite => {
                remove_state = close_children(
                    ctx,
                    state,
                    idx,
                    node,
                    current_mask,
                    next_child,
                    closer,
                    TargetPolicy::StayOpen,
                );
                if !remove_state {
                    if let Some(color) = next_child {
                        if let Some(child_mask) =
                            state.field_states[idx].open_children.get(&color)
                        {
                            open_below |= *child_mask & current_mask;
                        }
                    }
                }
            }
            OpenState::OpenSingleReduce | OpenState::OpenMultiReduce => {
                let same_redop =
                    user.usage.is_reduce() && user.usage.redop == state.field_states[idx].redop;
                if same_redop {
                    if let Some(color) = next_child {
                        if let Some(child_mask) =
                            state.field_states[idx].open_children.get(&color)
                        {
                            open_below |= *child_mask & current_mask;
                        }
                        // A new sibling joins through the merge below,
                        // flipping single to multi.
                    }
                } else {
                    remove_state = close_reduction_state(ctx, state, idx, node, overlap, closer);
                }
            }
            OpenState::OpenReadOnlyProj => {
                let compatible = user.usage.is_read_only() && proj.is_some();
                if !compatible {
                    // Readers need no flush: retire the launch frontier and
                    // advance the epoch without a close operation.
                    state.advance_projection_epochs(overlap);
                    remove_state = state.field_states[idx].filter(overlap);
                }
            }
            OpenState::OpenReadWriteProj | OpenState::OpenReadWriteProjDisjointShallow => {
                let compatible = match proj {
                    Some(info) => {
                        let fs = &state.field_states[idx];
                        fs.projection == Some(info.function)
                            && (fs.projection_domain.as_ref() == Some(&info.launch_domain)
                                || (open_state == OpenState::OpenReadWriteProjDisjointShallow
                                    && fs.projection_domain_dominates(&info.launch_domain)))
                    }
                    None => false,
                };
                if compatible {
                    let fs = &mut state.field_states[idx];
                    fs.rebuild_timeout = fs.rebuild_timeout.saturating_sub(1);
                } else {
                    closer.record_close_operation(overlap);
                    state.advance_projection_epochs(overlap);
                    remove_state = state.field_states[idx].filter(overlap);
                }
            }
            OpenState::OpenReduceProj | OpenState::OpenReduceProjDirty => {
                let compatible = match proj {
                    Some(info) => {
                        let fs = &state.field_states[idx];
                        user.usage.is_reduce()
                            && user.usage.redop == fs.redop
                            && fs.projection == Some(info.function)
                            && (fs.projection_domain.as_ref() == Some(&info.launch_domain)
                                || fs.projection_domain_dominates(&info.launch_domain))
                    }
                    None => false,
                };
                if compatible {
                    let fs = &mut state.field_states[idx];
                    fs.rebuild_timeout = fs.rebuild_timeout.saturating_sub(1);
                } else {
                    closer.record_close_operation(overlap);
                    state.advance_projection_epochs(overlap);
                    remove_state = state.field_states[idx].filter(overlap);
                }
            }
        }
        if remove_state {
            state.field_states.remove(idx);
        } else {
            idx += 1;
        }
    }

    // Open the node for the incoming access.
    if let Some(color) = next_child {
        let open_mask = current_mask - open_below;
        if !open_mask.is_empty() {
            let generic = GenericUser {
                usage: user.usage,
                field_mask: open_mask,
            };
            state.merge_new_field_state(FieldState::new(&generic, open_mask, color), all_disjoint);
        }
    } else if let Some(info) = proj {
        let dirty_reduction = user.usage.is_reduce() && !(dirty_fields & current_mask).is_empty();
        state.merge_new_field_state(
            FieldState::new_projection(
                &user.usage,
                current_mask,
                info,
                all_disjoint,
                dirty_reduction,
            ),
            all_disjoint,
        );
    } else if user.usage.is_reduce() {
        // Reductions at the node itself keep a childless state so that a
        // later non-matching access knows to flush them.
        let mut fs = FieldState::new(
            &GenericUser {
                usage: user.usage,
                field_mask: current_mask,
            },
            current_mask,
            Color(0),
        );
        fs.open_children.clear();
        state.merge_new_field_state(fs, all_disjoint);
    }
    state.coalesce_field_states(all_disjoint);
}

/// How the descent target child is treated while closing a field state.
#[derive(Clone, Copy, PartialEq, Eq)]
enum TargetPolicy {
    /// The target keeps its open entry (the access continues into it).
    StayOpen,
    /// The target's fields are stripped without a flush and reopen in the
    /// incoming mode (read-only upgrade).
    UpgradeInPlace,
}

/// Close the overlapping open children of `state.field_states[idx]`,
/// subject to the target policy and sibling disjointness. Returns whether
/// the field state emptied out.
#[allow(clippy::too_many_arguments)]
fn close_children(
    ctx: &AnalysisContext,
    state: &mut LogicalState,
    idx: usize,
    node: NodeId,
    current_mask: FieldMask,
    next_child: Option<Color>,
    closer: &mut LogicalCloser,
    target_policy: TargetPolicy,
) -> bool {
    let colors: Vec<Color> = state.field_states[idx]
        .open_children
        .keys()
        .copied()
        .collect();
    for color in colors {
        let child_overlap = state.field_states[idx]
            .open_children
            .get(&color)
            .map_or(FieldMask::EMPTY, |m| *m & current_mask);
        if child_overlap.is_empty() {
            continue;
        }
        if next_child == Some(color) {
            match target_policy {
                TargetPolicy::StayOpen => {}
                TargetPolicy::UpgradeInPlace => {
                    if let Some(child_mask) =
                        state.field_states[idx].open_children.get_mut(&color)
                    {
                        *child_mask -= child_overlap;
                    }
                }
            }
            continue;
        }
        if let Some(descent) = next_child {
            if children_disjoint(ctx, node, color, descent) {
                continue;
            }
        }
        closer.record_close_operation(child_overlap);
        if let Some(child_node) = ctx.forest().get_tree_child(node, color) {
            close_logical_subtree(ctx, child_node, child_overlap, closer);
        }
        if let Some(child_mask) = state.field_states[idx].open_children.get_mut(&color) {
            *child_mask -= child_overlap;
        }
    }
    prune_field_state(&mut state.field_states[idx])
}

/// Close every overlapping child of a reduction state (including a
/// childless node-local reduction record).
fn close_reduction_state(
    ctx: &AnalysisContext,
    state: &mut LogicalState,
    idx: usize,
    node: NodeId,
    overlap: FieldMask,
    closer: &mut LogicalCloser,
) -> bool {
    closer.record_close_operation(overlap);
    let colors: Vec<Color> = state.field_states[idx]
        .open_children
        .keys()
        .copied()
        .collect();
    for color in colors {
        let child_overlap = state.field_states[idx]
            .open_children
            .get(&color)
            .map_or(FieldMask::EMPTY, |m| *m & overlap);
        if child_overlap.is_empty() {
            continue;
        }
        if let Some(child_node) = ctx.forest().get_tree_child(node, color) {
            close_logical_subtree(ctx, child_node, child_overlap, closer);
        }
        if let Some(child_mask) = state.field_states[idx].open_children.get_mut(&color) {
            *child_mask -= child_overlap;
        }
    }
    let fs = &mut state.field_states[idx];
    fs.valid_fields -= overlap;
    fs.open_children.retain(|_, mask| !mask.is_empty());
    fs.valid_fields.is_empty()
}

/// Drop emptied child entries and recompute validity. Returns whether the
/// state is empty. Projection frontiers and childless reduction records
/// keep their own mask.
fn prune_field_state(fs: &mut FieldState) -> bool {
    fs.open_children.retain(|_, mask| !mask.is_empty());
    if fs.open_state.is_projection() {
        return fs.valid_fields.is_empty();
    }
    if fs.open_state.is_reduction() && fs.open_children.is_empty() {
        return fs.valid_fields.is_empty();
    }
    fs.valid_fields = fs
        .open_children
        .values()
        .fold(FieldMask::EMPTY, |acc, mask| acc | *mask);
    fs.valid_fields.is_empty()
}

/// Whether two children of `node` cover disjoint index points.
fn children_disjoint(ctx: &AnalysisContext, node: NodeId, a: Color, b: Color) -> bool {
    if a == b {
        return false;
    }
    if ctx.forest().are_all_children_disjoint(node) {
        return true;
    }
    match (
        ctx.forest().get_tree_child(node, a),
        ctx.forest().get_tree_child(node, b),
    ) {
        (Some(left), Some(right)) => !ctx.forest().intersects_with(left, right),
        _ => false,
    }
}

/// Flush one closed child sub-tree: record and retire every user below,
/// clear the open states and reductions, and advance projection epochs for
/// the closed fields.
fn close_logical_subtree(
    ctx: &AnalysisContext,
    node: NodeId,
    close_mask: FieldMask,
    closer: &mut LogicalCloser,
) {
    let Some(state_arc) = ctx.try_logical_state(node) else {
        return;
    };
    {
        let mut state = state_arc.lock();
        extract_closed_users(&mut state.curr_epoch_users, close_mask, closer);
        extract_closed_users(&mut state.prev_epoch_users, close_mask, closer);
        state.field_states.retain_mut(|fs| !fs.filter(close_mask));
        state.clear_reductions(close_mask);
        state.advance_projection_epochs(close_mask);
    }
    for (_, child) in ctx.forest().children(node) {
        close_logical_subtree(ctx, child, close_mask, closer);
    }
}

fn extract_closed_users(
    users: &mut Vec<LogicalUser>,
    close_mask: FieldMask,
    closer: &mut LogicalCloser,
) {
    users.retain_mut(|user| {
        let overlap = user.field_mask & close_mask;
        if overlap.is_empty() {
            return true;
        }
        closer.record_closed_user(user.clone(), overlap);
        user.field_mask -= overlap;
        if user.field_mask.is_empty() {
            user.op.remove_mapping_reference(user.gen);
            false
        } else {
            true
        }
    });
}
