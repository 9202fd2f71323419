//! Error taxonomy for the weft analysis core.
//!
//! Every user-facing variant carries the offending operation's unique id,
//! its task name, and the unique id of the enclosing context so that a
//! failure can be attributed without a debugger. Recoverable mask
//! refinements and user retirements are normal state transitions and are
//! never represented here.

use thiserror::Error;
use weft_types::{ContextUid, OpUniqueId};

/// Primary error type for analysis operations.
#[derive(Error, Debug)]
pub enum WeftError {
    /// An acquire's mask crosses a node that does not dominate the
    /// restriction it targets.
    #[error(
        "illegal partial acquire operation ({op_id}) performed in task {task_name} ({context_uid})"
    )]
    PartialAcquire {
        op_id: OpUniqueId,
        task_name: String,
        context_uid: ContextUid,
    },

    /// An attach under an acquisition where the attach node does not
    /// dominate the acquisition.
    #[error(
        "illegal partial restriction performed by attach operation ({op_id}) in task {task_name} ({context_uid})"
    )]
    PartialRestriction {
        op_id: OpUniqueId,
        task_name: String,
        context_uid: ContextUid,
    },

    /// An attach that overlaps a restriction in a sibling sub-tree.
    #[error(
        "illegal interfering restriction performed by attach operation ({op_id}) in task {task_name} ({context_uid})"
    )]
    InterferingRestriction {
        op_id: OpUniqueId,
        task_name: String,
        context_uid: ContextUid,
    },

    /// An acquire overlapping another outstanding acquire on the same fields.
    #[error(
        "illegal interfering acquire performed by acquire operation ({op_id}) in task {task_name} ({context_uid})"
    )]
    InterferingAcquire {
        op_id: OpUniqueId,
        task_name: String,
        context_uid: ContextUid,
    },

    /// An acquire naming fields with no restriction to acquire.
    #[error(
        "acquire operation ({op_id}) in task {task_name} ({context_uid}) targets fields with no restriction"
    )]
    UnrestrictedAcquire {
        op_id: OpUniqueId,
        task_name: String,
        context_uid: ContextUid,
    },

    /// A release whose mask does not exactly match an outstanding
    /// acquisition.
    #[error(
        "release operation ({op_id}) in task {task_name} ({context_uid}) does not match an outstanding acquire"
    )]
    UnmatchedRelease {
        op_id: OpUniqueId,
        task_name: String,
        context_uid: ContextUid,
    },

    /// A detach whose mask does not exactly match an outstanding
    /// restriction.
    #[error(
        "detach operation ({op_id}) in task {task_name} ({context_uid}) does not match an outstanding restriction"
    )]
    UnmatchedDetach {
        op_id: OpUniqueId,
        task_name: String,
        context_uid: ContextUid,
    },

    /// A requirement's path reached two children of a non-disjoint
    /// partition on overlapping fields and the closer could not resolve it.
    #[error(
        "aliased interfering children for operation ({op_id}) in task {task_name} ({context_uid})"
    )]
    AliasedInterferingChildren {
        op_id: OpUniqueId,
        task_name: String,
        context_uid: ContextUid,
    },

    /// Internal invariant violation observed in a release build.
    #[error("corrupted analysis state: {detail}")]
    CorruptedState { detail: String },

    /// Malformed bytes while unpacking a wire message.
    #[error("malformed wire message: {detail}")]
    MalformedMessage { detail: String },
}

/// Convenience alias used throughout the workspace.
pub type WeftResult<T> = Result<T, WeftError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_carry_attribution() {
        let err = WeftError::PartialAcquire {
            op_id: OpUniqueId(42),
            task_name: "stencil".to_string(),
            context_uid: ContextUid(7),
        };
        let message = err.to_string();
        assert!(message.contains("op#42"));
        assert!(message.contains("stencil"));
        assert!(message.contains("ctx#7"));
    }
}
