//! The operation boundary.
//!
//! Operations are external collaborators: the analyzer only needs to ask
//! their identity, their slot generation, and to record happens-before
//! edges on them. Synthetic merge-close operations are the one operation
//! kind the analysis core creates itself.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;
use weft_forest::NodeId;
use weft_types::{FieldMask, GenerationId, OpUniqueId};

/// What the analyzer may ask of an operation.
pub trait Operation: Send + Sync {
    /// Unique id assigned at creation, never recycled.
    fn unique_op_id(&self) -> OpUniqueId;

    /// Current generation of the operation's slot.
    fn generation(&self) -> GenerationId;

    /// Name of the enclosing task, used in error attribution.
    fn task_name(&self) -> &str;

    /// Record a mapping dependence on `(prior, prior_gen)`. Returns whether
    /// the edge was newly added (stale generations return `false`).
    fn register_dependence(&self, prior: OpUniqueId, prior_gen: GenerationId) -> bool;

    /// Pin the operation's slot at `gen` while a user record references it.
    fn add_mapping_reference(&self, gen: GenerationId);

    /// Release the pin taken by [`Operation::add_mapping_reference`].
    fn remove_mapping_reference(&self, gen: GenerationId);
}

/// Shared handle to an operation.
pub type OpHandle = Arc<dyn Operation>;

/// Synthetic operation that flushes a closed sub-tree.
///
/// A merge-close op stands in for the users it closed: it depends on every
/// closed user, and later operations that would have depended on them
/// depend on the close instead.
pub struct MergeCloseOp {
    uid: OpUniqueId,
    gen: GenerationId,
    creator: OpUniqueId,
    root: NodeId,
    close_mask: FieldMask,
    dependences: Mutex<Vec<(OpUniqueId, GenerationId)>>,
    mapping_refs: AtomicU32,
}

impl MergeCloseOp {
    #[must_use]
    pub fn new(uid: OpUniqueId, creator: OpUniqueId, root: NodeId, close_mask: FieldMask) -> Self {
        Self {
            uid,
            gen: GenerationId::FIRST,
            creator,
            root,
            close_mask,
            dependences: Mutex::new(Vec::new()),
            mapping_refs: AtomicU32::new(0),
        }
    }

    /// The operation whose analysis emitted this close.
    #[must_use]
    pub fn creator(&self) -> OpUniqueId {
        self.creator
    }

    /// Root node of the closed sub-tree.
    #[must_use]
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Fields being closed.
    #[must_use]
    pub fn close_mask(&self) -> &FieldMask {
        &self.close_mask
    }

    /// Snapshot of the recorded happens-before edges.
    #[must_use]
    pub fn dependences(&self) -> Vec<(OpUniqueId, GenerationId)> {
        self.dependences.lock().clone()
    }
}

impl Operation for MergeCloseOp {
    fn unique_op_id(&self) -> OpUniqueId {
        self.uid
    }

    fn generation(&self) -> GenerationId {
        self.gen
    }

    fn task_name(&self) -> &str {
        "merge_close"
    }

    fn register_dependence(&self, prior: OpUniqueId, prior_gen: GenerationId) -> bool {
        let mut deps = self.dependences.lock();
        if deps.contains(&(prior, prior_gen)) {
            return false;
        }
        deps.push((prior, prior_gen));
        true
    }

    fn add_mapping_reference(&self, _gen: GenerationId) {
        self.mapping_refs.fetch_add(1, Ordering::AcqRel);
    }

    fn remove_mapping_reference(&self, _gen: GenerationId) {
        let prev = self.mapping_refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "mapping reference underflow");
    }
}
