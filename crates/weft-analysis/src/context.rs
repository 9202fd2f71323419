//! The per-context analysis front door.
//!
//! An `AnalysisContext` owns every per-node logical state and version
//! manager for one context, the restriction tracker, the equivalence-set
//! registry, and the distributed plumbing for remote version managers. The
//! inbound API matches the runtime boundary: `analyze_logical`,
//! `analyze_version`, the attach/acquire/release/detach quartet,
//! `find_restrictions`, and `invalidate_context`.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{debug, warn};
use weft_error::{WeftError, WeftResult};
use weft_forest::{NodeId, RegionTreeForest};
use weft_rt::{Event, MessageHandler, Transport, UserEvent, defer};
use weft_types::{
    AddressSpaceId, ContextId, ContextUid, DistributedId, FieldMask, OpUniqueId, RegionUsage,
};

use crate::analyzer::register_logical_user;
use crate::instances::PhysicalManager;
use crate::logical::LogicalState;
use crate::operation::{MergeCloseOp, OpHandle};
use crate::projection::ProjectionInfo;
use crate::restrict::{OpAttribution, RestrictInfo, RestrictionTracker};
use crate::traverse::{NodeVisitor, traverse_path, traverse_subtree};
use crate::users::LogicalUser;
use crate::version::{
    EquivalenceSet, EquivalenceSetRegistry, ManagerStart, VersionInfo, VersionManager, WireHandle,
    decode_equivalence_set_response, decode_version_manager_request,
    decode_version_manager_response, encode_equivalence_set_response,
    encode_version_manager_request, encode_version_manager_response,
};

/// One region requirement as submitted by an operation.
#[derive(Clone)]
pub struct RegionRequirement {
    /// Node the privileges derive from; the analysis walks from here.
    pub parent: NodeId,
    /// Requested node (or the projection upper bound).
    pub region: NodeId,
    pub usage: RegionUsage,
    pub fields: FieldMask,
    pub projection: Option<ProjectionInfo>,
}

/// Trace plumbing handed through logical analysis.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogicalTraceInfo {
    pub already_traced: bool,
}

// Message tags for the context's virtual channel.
const MSG_VM_REQUEST: u8 = 0;
const MSG_VM_RESPONSE: u8 = 1;
const MSG_EQ_SET_REQUEST: u8 = 2;
const MSG_EQ_SET_RESPONSE: u8 = 3;

/// Merge-close uids live above every application operation id.
const CLOSE_UID_BASE: u64 = 1 << 62;

type OwnerFn = dyn Fn(NodeId) -> AddressSpaceId + Send + Sync;

/// Per-context analysis state and inbound API.
pub struct AnalysisContext {
    ctx_id: ContextId,
    ctx_uid: ContextUid,
    local_space: AddressSpaceId,
    forest: Arc<RegionTreeForest>,
    transport: Arc<dyn Transport>,
    version_owner: Box<OwnerFn>,
    logical: Mutex<HashMap<NodeId, Arc<Mutex<LogicalState>>>>,
    versions: Mutex<HashMap<NodeId, Arc<VersionManager>>>,
    restrictions: Mutex<RestrictionTracker>,
    sets: Mutex<HashMap<u64, Arc<EquivalenceSet>>>,
    manager_tokens: Mutex<HashMap<u64, Arc<VersionManager>>>,
    next_did: AtomicU64,
    next_close_uid: AtomicU64,
    next_token: AtomicU64,
    emitted_closes: Mutex<Vec<Arc<MergeCloseOp>>>,
    self_ref: Mutex<std::sync::Weak<AnalysisContext>>,
}

impl AnalysisContext {
    /// Create a context. `version_owner` is the per-context assignment of
    /// version-manager ownership to address spaces.
    #[must_use]
    pub fn new(
        ctx_id: ContextId,
        ctx_uid: ContextUid,
        local_space: AddressSpaceId,
        forest: Arc<RegionTreeForest>,
        transport: Arc<dyn Transport>,
        version_owner: Box<OwnerFn>,
    ) -> Arc<Self> {
        let ctx = Arc::new(Self {
            ctx_id,
            ctx_uid,
            local_space,
            forest,
            transport,
            version_owner,
            logical: Mutex::new(HashMap::new()),
            versions: Mutex::new(HashMap::new()),
            restrictions: Mutex::new(RestrictionTracker::new()),
            sets: Mutex::new(HashMap::new()),
            manager_tokens: Mutex::new(HashMap::new()),
            // Space-tagged so two spaces never mint the same id.
            next_did: AtomicU64::new((u64::from(local_space.0) << 48) | 1),
            next_close_uid: AtomicU64::new(CLOSE_UID_BASE),
            next_token: AtomicU64::new(1),
            emitted_closes: Mutex::new(Vec::new()),
            self_ref: Mutex::new(std::sync::Weak::new()),
        });
        *ctx.self_ref.lock() = Arc::downgrade(&ctx);
        ctx
    }

    #[inline]
    #[must_use]
    pub fn forest(&self) -> &Arc<RegionTreeForest> {
        &self.forest
    }

    #[inline]
    #[must_use]
    pub fn context_id(&self) -> ContextId {
        self.ctx_id
    }

    #[inline]
    #[must_use]
    pub fn context_uid(&self) -> ContextUid {
        self.ctx_uid
    }

    #[inline]
    #[must_use]
    pub fn local_space(&self) -> AddressSpaceId {
        self.local_space
    }

    // -----------------------------------------------------------------
    // inbound API
    // -----------------------------------------------------------------

    /// Logical dependence analysis for one requirement, top to bottom.
    ///
    /// Returns the applied events callers must observe before declaring
    /// the operation's analysis visible (empty when everything completed
    /// inline).
    pub fn analyze_logical(
        &self,
        op: &OpHandle,
        req_index: u32,
        req: &RegionRequirement,
        _trace: &LogicalTraceInfo,
    ) -> WeftResult<Vec<Event>> {
        let path = self
            .forest
            .initialize_path(req.region, req.parent)
            .ok_or_else(|| WeftError::CorruptedState {
                detail: format!(
                    "requirement parent {} does not dominate region {}",
                    req.parent.0, req.region.0
                ),
            })?;
        let user = LogicalUser::new(Arc::clone(op), req_index, req.usage, req.fields);
        debug!(
            op = %user.op_id(),
            region = req.region.0,
            mask = %req.fields,
            usage = %req.usage,
            "analyze logical"
        );
        register_logical_user(self, req.parent, &user, &path, req.projection.as_ref())?;
        Ok(Vec::new())
    }

    /// Versioning analysis for one requirement: populates `version_info`
    /// and acquires the sets, returning `(ready_events, applied_events)`.
    pub fn analyze_version(
        &self,
        op: &OpHandle,
        _req_index: u32,
        req: &RegionRequirement,
        version_info: &mut VersionInfo,
    ) -> WeftResult<(Vec<Event>, Vec<UserEvent>)> {
        let manager = self.version_manager(req.region);
        self.ensure_manager_ready(&manager, req.region)?;
        let request_expr = self.forest.expr(req.region);
        for set in manager.equivalence_sets() {
            set.perform_versioning_analysis(&request_expr, version_info);
        }
        debug!(
            op = %op.unique_op_id(),
            region = req.region.0,
            sets = version_info.equivalence_sets().len(),
            "analyze version"
        );
        Ok(version_info.make_ready(&req.usage, req.fields))
    }

    /// Record an attach restriction.
    pub fn record_attach(
        &self,
        op: &OpHandle,
        node: NodeId,
        manager: &Arc<dyn PhysicalManager>,
        fields: FieldMask,
    ) -> WeftResult<()> {
        let attr = self.attribution(op);
        self.restrictions
            .lock()
            .record_attach(&self.forest, attr, node, manager, fields)
    }

    /// Record an acquire over restricted fields.
    pub fn record_acquire(&self, op: &OpHandle, node: NodeId, fields: FieldMask) -> WeftResult<()> {
        let attr = self.attribution(op);
        self.restrictions
            .lock()
            .record_acquire(&self.forest, attr, node, fields)
    }

    /// Record a release closing the matching acquire.
    pub fn record_release(&self, op: &OpHandle, node: NodeId, fields: FieldMask) -> WeftResult<()> {
        let attr = self.attribution(op);
        self.restrictions
            .lock()
            .record_release(&self.forest, attr, node, fields)
    }

    /// Record a detach removing the matching restriction.
    pub fn record_detach(&self, op: &OpHandle, node: NodeId, fields: FieldMask) -> WeftResult<()> {
        let attr = self.attribution(op);
        self.restrictions
            .lock()
            .record_detach(&self.forest, attr, node, fields)
    }

    /// The managers that must be kept coherent for one requirement.
    #[must_use]
    pub fn find_restrictions(&self, req: &RegionRequirement) -> RestrictInfo {
        self.restrictions
            .lock()
            .find_restrictions(&self.forest, req.region, req.fields)
    }

    /// Whether any restriction is outstanding.
    #[must_use]
    pub fn has_restrictions(&self) -> bool {
        !self.restrictions.lock().is_empty()
    }

    /// Dependence analysis for a deletion: the deleter waits on every user
    /// along the path and below the deleted node, then the deleted fields
    /// are stripped from the sub-tree.
    pub fn analyze_deletion(
        &self,
        op: &OpHandle,
        node: NodeId,
        mask: FieldMask,
    ) -> WeftResult<()> {
        let root = self.tree_root(node);
        let path = self
            .forest
            .initialize_path(node, root)
            .ok_or_else(|| WeftError::CorruptedState {
                detail: format!("node {} detached from its tree root", node.0),
            })?;
        let user = LogicalUser::new(Arc::clone(op), 0, RegionUsage::read_write(), mask);
        let mut registrar = NodeVisitor::LogicalPathRegistrar {
            ctx: self,
            user: &user,
            path: &path,
        };
        traverse_path(self, root, &path, &mut registrar);
        let mut invalidator = NodeVisitor::DeletionInvalidator {
            ctx: self,
            deletion_mask: mask,
        };
        traverse_subtree(self, node, &mut invalidator);
        Ok(())
    }

    /// Debug pass over a freshly created or invalidated context checking
    /// that every per-node state is pristine.
    pub fn initialize_context(&self) {
        for root in self.forest.roots() {
            let mut initializer = NodeVisitor::CurrentInitializer { ctx: self };
            traverse_subtree(self, root, &mut initializer);
        }
    }

    /// Clear every logical state and version manager of this context.
    /// Idempotent: a second call is a no-op.
    pub fn invalidate_context(&self) {
        for root in self.forest.roots() {
            let mut invalidator = NodeVisitor::CurrentInvalidator {
                ctx: self,
                users_only: false,
            };
            traverse_subtree(self, root, &mut invalidator);
            let mut versioning = NodeVisitor::VersioningInvalidator { ctx: self };
            traverse_subtree(self, root, &mut versioning);
        }
        self.sets.lock().clear();
        self.emitted_closes.lock().clear();
        debug!(ctx = %self.ctx_uid, "invalidated context");
    }

    /// Close operations emitted since the last call.
    #[must_use]
    pub fn take_emitted_close_ops(&self) -> Vec<Arc<MergeCloseOp>> {
        std::mem::take(&mut *self.emitted_closes.lock())
    }

    /// Diagnostic snapshot of a node's field states.
    #[must_use]
    pub fn node_field_states(&self, node: NodeId) -> Vec<crate::field_state::FieldState> {
        self.try_logical_state(node)
            .map(|state| state.lock().field_states.clone())
            .unwrap_or_default()
    }

    /// Diagnostic: the projection epoch covering `mask` at `node`.
    #[must_use]
    pub fn node_projection_epoch(
        &self,
        node: NodeId,
        mask: FieldMask,
    ) -> Option<weft_types::ProjectionEpochId> {
        self.try_logical_state(node)
            .and_then(|state| state.lock().projection_epoch_for(mask))
    }

    // -----------------------------------------------------------------
    // state plumbing
    // -----------------------------------------------------------------

    pub(crate) fn logical_state(&self, node: NodeId) -> Arc<Mutex<LogicalState>> {
        Arc::clone(
            self.logical
                .lock()
                .entry(node)
                .or_insert_with(|| Arc::new(Mutex::new(LogicalState::new()))),
        )
    }

    pub(crate) fn try_logical_state(&self, node: NodeId) -> Option<Arc<Mutex<LogicalState>>> {
        self.logical.lock().get(&node).cloned()
    }

    /// The version manager for `node`, created on first use.
    #[must_use]
    pub fn version_manager(&self, node: NodeId) -> Arc<VersionManager> {
        Arc::clone(
            self.versions
                .lock()
                .entry(node)
                .or_insert_with(|| Arc::new(VersionManager::new(node, self.ctx_id))),
        )
    }

    pub(crate) fn try_version_manager(&self, node: NodeId) -> Option<Arc<VersionManager>> {
        self.versions.lock().get(&node).cloned()
    }

    pub(crate) fn create_close_op(
        &self,
        creator: OpUniqueId,
        root: NodeId,
        close_mask: FieldMask,
    ) -> Arc<MergeCloseOp> {
        let uid = OpUniqueId(self.next_close_uid.fetch_add(1, Ordering::Relaxed));
        Arc::new(MergeCloseOp::new(uid, creator, root, close_mask))
    }

    pub(crate) fn record_emitted_close(&self, close_op: Arc<MergeCloseOp>) {
        self.emitted_closes.lock().push(close_op);
    }

    fn attribution<'a>(&self, op: &'a OpHandle) -> OpAttribution<'a> {
        OpAttribution {
            op_id: op.unique_op_id(),
            task_name: op.task_name(),
            context_uid: self.ctx_uid,
        }
    }

    fn tree_root(&self, node: NodeId) -> NodeId {
        let mut current = node;
        while let Some(parent) = self.forest.get_parent(current) {
            current = parent;
        }
        current
    }

    // -----------------------------------------------------------------
    // versioning state machine
    // -----------------------------------------------------------------

    /// Drive a manager to `Ready`, computing locally or requesting from
    /// the owner space.
    fn ensure_manager_ready(&self, manager: &Arc<VersionManager>, node: NodeId) -> WeftResult<()> {
        loop {
            let owner = (self.version_owner)(node);
            match manager.begin_analysis(owner, self.local_space) {
                ManagerStart::Ready => return Ok(()),
                ManagerStart::Compute => {
                    let sets = self.compute_equivalence_sets(node)?;
                    manager.finalize_sets(sets);
                    return Ok(());
                }
                ManagerStart::Request(owner_space) => {
                    self.send_version_manager_request(manager, node, owner_space);
                    if let Some(ready) = manager.ready_event() {
                        ready.wait();
                    }
                }
                ManagerStart::Wait(ready) => {
                    ready.wait();
                }
            }
        }
    }

    /// Compute this node's equivalence sets from its parent's, splitting
    /// parent sets that partially overlap. The root of a tree starts with
    /// one set covering its whole expression.
    fn compute_equivalence_sets(&self, node: NodeId) -> WeftResult<Vec<Arc<EquivalenceSet>>> {
        match self.forest.get_parent(node) {
            Some(parent) => {
                let parent_manager = self.version_manager(parent);
                self.ensure_manager_ready(&parent_manager, parent)?;
                let node_expr = self.forest.expr(node);
                let mut result: Vec<Arc<EquivalenceSet>> = Vec::new();
                for set in parent_manager.equivalence_sets() {
                    for piece in set.refine_for(&node_expr, self) {
                        if !result.iter().any(|s| s.did() == piece.did()) {
                            result.push(piece);
                        }
                    }
                }
                Ok(result)
            }
            None => {
                let set = EquivalenceSet::new(
                    self.allocate_did(),
                    self.local_space,
                    self.forest.expr(node),
                );
                self.register_set(Arc::clone(&set));
                Ok(vec![set])
            }
        }
    }

    fn send_version_manager_request(
        &self,
        manager: &Arc<VersionManager>,
        node: NodeId,
        owner_space: AddressSpaceId,
    ) {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.manager_tokens.lock().insert(token, Arc::clone(manager));
        let handle = if self.forest.is_region(node) {
            WireHandle::Region(self.forest.region_handle(node).expect("region handle"))
        } else {
            WireHandle::Partition(self.forest.partition_handle(node).expect("partition handle"))
        };
        let mut bytes = vec![MSG_VM_REQUEST];
        bytes.extend(encode_version_manager_request(token, self.ctx_uid, handle));
        debug!(node = node.0, owner = owner_space.0, token, "requesting version manager");
        self.transport.send(owner_space, bytes);
    }

    fn resolve_wire_handle(&self, handle: WireHandle) -> Option<NodeId> {
        match handle {
            WireHandle::Region(region) => self.forest.find_region(region),
            WireHandle::Partition(partition) => self.forest.find_partition(partition),
        }
    }

    fn send_version_manager_response(&self, manager: &Arc<VersionManager>, token: u64, target: AddressSpaceId) {
        let dids: Vec<DistributedId> = manager
            .equivalence_sets()
            .iter()
            .map(|set| set.did())
            .collect();
        let mut bytes = vec![MSG_VM_RESPONSE];
        bytes.extend(encode_version_manager_response(token, &dids));
        self.transport.send(target, bytes);
    }

    fn handle_vm_request(&self, source: AddressSpaceId, payload: &[u8]) {
        let Some((token, context_uid, handle)) = decode_version_manager_request(payload) else {
            warn!("malformed version manager request");
            return;
        };
        debug_assert_eq!(context_uid, self.ctx_uid);
        let Some(node) = self.resolve_wire_handle(handle) else {
            warn!("version manager request for unknown node");
            return;
        };
        let manager = self.version_manager(node);
        if manager.has_equivalence_sets() {
            self.send_version_manager_response(&manager, token, source);
            return;
        }
        if let Some(ready) = manager.ready_event() {
            // A computation is in flight: defer the response rather than
            // blocking the virtual channel.
            let weak = self.self_ref.lock().clone();
            let manager = Arc::clone(&manager);
            defer(&ready, move |_| {
                if let Some(ctx) = weak.upgrade() {
                    ctx.send_version_manager_response(&manager, token, source);
                }
            });
            return;
        }
        match self.ensure_manager_ready(&manager, node) {
            Ok(()) => self.send_version_manager_response(&manager, token, source),
            Err(err) => warn!(error = %err, "owner failed to compute equivalence sets"),
        }
    }

    fn handle_vm_response(&self, source: AddressSpaceId, payload: &[u8]) {
        let Some((token, dids)) = decode_version_manager_response(payload) else {
            warn!("malformed version manager response");
            return;
        };
        let Some(manager) = self.manager_tokens.lock().remove(&token) else {
            warn!(token, "version manager response for unknown token");
            return;
        };
        let mut sets = Vec::with_capacity(dids.len());
        for did in dids {
            if self.find_set(did).is_none() {
                // First sighting: pull the set's expression from the owner.
                let mut bytes = vec![MSG_EQ_SET_REQUEST];
                weft_types::append_u64_le(&mut bytes, did.get());
                self.transport.send(source, bytes);
            }
            match self.find_set(did) {
                Some(set) => sets.push(set),
                None => warn!(%did, "equivalence set unavailable after request"),
            }
        }
        manager.finalize_sets(sets);
    }

    fn handle_eq_set_request(&self, source: AddressSpaceId, payload: &[u8]) {
        let mut offset = 0;
        let Some(raw) = weft_types::read_u64_le(payload, &mut offset) else {
            warn!("malformed equivalence set request");
            return;
        };
        let Some(did) = DistributedId::new(raw) else {
            warn!("equivalence set request with zero id");
            return;
        };
        let Some(set) = self.find_set(did) else {
            warn!(%did, "equivalence set request for unknown set");
            return;
        };
        let mut bytes = vec![MSG_EQ_SET_RESPONSE];
        bytes.extend(encode_equivalence_set_response(did, set.expr()));
        self.transport.send(source, bytes);
    }

    fn handle_eq_set_response(&self, source: AddressSpaceId, payload: &[u8]) {
        let Some((did, expr)) = decode_equivalence_set_response(payload) else {
            warn!("malformed equivalence set response");
            return;
        };
        let mut sets = self.sets.lock();
        sets.entry(did.get())
            .or_insert_with(|| EquivalenceSet::new(did, source, expr));
    }
}

impl EquivalenceSetRegistry for AnalysisContext {
    fn allocate_did(&self) -> DistributedId {
        DistributedId::new(self.next_did.fetch_add(1, Ordering::Relaxed))
            .expect("did counter wrapped")
    }

    fn register_set(&self, set: Arc<EquivalenceSet>) {
        self.sets.lock().insert(set.did().get(), set);
    }

    fn find_set(&self, did: DistributedId) -> Option<Arc<EquivalenceSet>> {
        self.sets.lock().get(&did.get()).cloned()
    }
}

impl MessageHandler for AnalysisContext {
    fn handle_message(&self, source: AddressSpaceId, bytes: &[u8]) {
        let Some((&tag, payload)) = bytes.split_first() else {
            warn!("empty message");
            return;
        };
        match tag {
            MSG_VM_REQUEST => self.handle_vm_request(source, payload),
            MSG_VM_RESPONSE => self.handle_vm_response(source, payload),
            MSG_EQ_SET_REQUEST => self.handle_eq_set_request(source, payload),
            MSG_EQ_SET_RESPONSE => self.handle_eq_set_response(source, payload),
            other => warn!(tag = other, "unknown message tag"),
        }
    }
}
