//! Equivalence-set based versioning.
//!
//! An equivalence set names a sub-region within which every point shares
//! the same set of version-equivalent data copies. A per-node
//! `VersionManager` lazily computes the sets covering its node by
//! intersecting and splitting its parent's sets; operations snapshot the
//! relevant sets into a `VersionInfo` and acquire them shared or exclusive
//! per field usage.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::{debug, trace};
use weft_forest::{IndexSpaceExpr, NodeId};
use weft_rt::{Event, UserEvent, merge_events};
use weft_types::{
    AddressSpaceId, ContextId, ContextUid, DistributedId, FieldMask, PartitionHandle,
    RegionHandle, RegionUsage, append_bool, append_u32_le, append_u64_le, read_bool, read_u32_le,
    read_u64_le,
};

/// Allocation and lookup of equivalence sets within one context.
pub trait EquivalenceSetRegistry: Send + Sync {
    fn allocate_did(&self) -> DistributedId;
    fn register_set(&self, set: Arc<EquivalenceSet>);
    fn find_set(&self, did: DistributedId) -> Option<Arc<EquivalenceSet>>;
}

struct SetUser {
    mask: FieldMask,
    exclusive: bool,
    applied: Event,
}

#[derive(Default)]
struct SetState {
    /// Non-empty once this set has been split; analysis descends into the
    /// pieces and this set no longer takes requests itself.
    refinements: Vec<Arc<EquivalenceSet>>,
    /// Outstanding requests, oldest first; drained entries are pruned.
    users: Vec<SetUser>,
    /// Valid data copies per field, by manager id.
    valid_views: HashMap<DistributedId, FieldMask>,
    /// Committed (non-poisoned) write count, per observable version.
    version: u64,
}

/// A unit of version-equivalent sub-region with a fine-grained lock.
pub struct EquivalenceSet {
    did: DistributedId,
    owner_space: AddressSpaceId,
    expr: IndexSpaceExpr,
    state: Mutex<SetState>,
}

impl EquivalenceSet {
    #[must_use]
    pub fn new(did: DistributedId, owner_space: AddressSpaceId, expr: IndexSpaceExpr) -> Arc<Self> {
        Arc::new(Self {
            did,
            owner_space,
            expr,
            state: Mutex::new(SetState::default()),
        })
    }

    #[inline]
    #[must_use]
    pub fn did(&self) -> DistributedId {
        self.did
    }

    #[inline]
    #[must_use]
    pub fn owner_space(&self) -> AddressSpaceId {
        self.owner_space
    }

    #[inline]
    #[must_use]
    pub fn expr(&self) -> &IndexSpaceExpr {
        &self.expr
    }

    /// Committed write version, for observability and tests.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.state.lock().version
    }

    /// Record a valid data copy for `mask`.
    pub fn record_valid_view(&self, manager: DistributedId, mask: FieldMask) {
        let mut state = self.state.lock();
        *state.valid_views.entry(manager).or_insert(FieldMask::EMPTY) |= mask;
    }

    /// Managers holding valid data overlapping `mask`.
    #[must_use]
    pub fn find_valid_views(&self, mask: &FieldMask) -> Vec<(DistributedId, FieldMask)> {
        let state = self.state.lock();
        state
            .valid_views
            .iter()
            .filter_map(|(&did, &fields)| {
                let overlap = fields & *mask;
                (!overlap.is_empty()).then_some((did, overlap))
            })
            .collect()
    }

    /// Leaf sets covering `request` below this set, splitting this set if
    /// its expression only partially overlaps.
    ///
    /// Splitting replaces this set with pieces that still cover its whole
    /// expression; readers of the non-overlap piece are unaffected.
    pub fn refine_for(
        self: &Arc<Self>,
        request: &IndexSpaceExpr,
        registry: &dyn EquivalenceSetRegistry,
    ) -> Vec<Arc<Self>> {
        let overlap = self.expr.intersection(request);
        if overlap.is_empty() {
            return Vec::new();
        }
        let mut state = self.state.lock();
        if !state.refinements.is_empty() {
            let pieces = state.refinements.clone();
            drop(state);
            let mut result = Vec::new();
            for piece in pieces {
                result.extend(piece.refine_for(request, registry));
            }
            return result;
        }
        if overlap == self.expr {
            return vec![Arc::clone(self)];
        }
        let remainder = self.expr.difference(request);
        debug_assert!(!remainder.is_empty());
        let inside = Self::new(registry.allocate_did(), self.owner_space, overlap);
        let outside = Self::new(registry.allocate_did(), self.owner_space, remainder);
        debug!(
            set = %self.did,
            inside = %inside.did,
            outside = %outside.did,
            "splitting equivalence set"
        );
        registry.register_set(Arc::clone(&inside));
        registry.register_set(Arc::clone(&outside));
        state.refinements = vec![Arc::clone(&inside), outside];
        vec![inside]
    }

    /// Record the leaf sets below this one into `version_info`.
    pub fn perform_versioning_analysis(
        self: &Arc<Self>,
        request: &IndexSpaceExpr,
        version_info: &mut VersionInfo,
    ) {
        if !self.expr.intersects(request) {
            return;
        }
        let pieces = {
            let state = self.state.lock();
            state.refinements.clone()
        };
        if pieces.is_empty() {
            version_info.record_equivalence_set(self);
        } else {
            for piece in pieces {
                piece.perform_versioning_analysis(request, version_info);
            }
        }
    }

    /// Acquire this set for one request.
    ///
    /// Exclusive requests (writes) wait for every outstanding request on
    /// the overlapping fields to drain; shared requests wait only for the
    /// outstanding exclusives. The returned applied event must be triggered
    /// by the operation once its effects are visible; triggering it
    /// poisoned counts as no observable write.
    pub fn request_valid_copy(&self, mask: FieldMask, exclusive: bool) -> (Vec<Event>, UserEvent) {
        let mut state = self.state.lock();
        state.users.retain(|user| !user.applied.has_triggered());
        let ready: Vec<Event> = state
            .users
            .iter()
            .filter(|user| !user.mask.is_disjoint(&mask) && (exclusive || user.exclusive))
            .map(|user| user.applied.clone())
            .collect();
        let applied = UserEvent::new();
        state.users.push(SetUser {
            mask,
            exclusive,
            applied: applied.event(),
        });
        drop(state);
        trace!(set = %self.did, exclusive, waits = ready.len(), "versioning request");
        (ready, applied)
    }
}

/// Bump the committed version of `set` when `applied` fires clean.
pub fn observe_write_on(set: &Arc<EquivalenceSet>, applied: &Event) {
    let set = Arc::clone(set);
    applied.subscribe(move |poisoned| {
        if poisoned {
            trace!(set = %set.did, "write cancelled, no observable version");
            return;
        }
        set.state.lock().version += 1;
    });
}

/// Per-operation snapshot of the equivalence sets for one requirement.
///
/// Most requirements land on a single set, so storage stays inline for
/// that case.
#[derive(Default)]
pub struct VersionInfo {
    sets: smallvec::SmallVec<[Arc<EquivalenceSet>; 1]>,
}

impl VersionInfo {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a set, deduplicating by id.
    pub fn record_equivalence_set(&mut self, set: &Arc<EquivalenceSet>) {
        if self.sets.iter().any(|s| s.did() == set.did()) {
            return;
        }
        self.sets.push(Arc::clone(set));
    }

    #[must_use]
    pub fn equivalence_sets(&self) -> &[Arc<EquivalenceSet>] {
        &self.sets
    }

    /// Acquire every recorded set for `(usage, mask)`.
    ///
    /// Returns the events to wait on before mapping and the applied events
    /// the operation must trigger when its effects are visible.
    #[must_use]
    pub fn make_ready(&self, usage: &RegionUsage, mask: FieldMask) -> (Vec<Event>, Vec<UserEvent>) {
        let exclusive = usage.is_write();
        let mut ready_events = Vec::new();
        let mut applied_events = Vec::new();
        for set in &self.sets {
            let (ready, applied) = set.request_valid_copy(mask, exclusive);
            ready_events.extend(ready);
            if exclusive {
                observe_write_on(set, &applied.event());
            }
            applied_events.push(applied);
        }
        (ready_events, applied_events)
    }

    pub fn clear(&mut self) {
        self.sets.clear();
    }
}

struct ManagerState {
    owner_space: Option<AddressSpaceId>,
    sets: Vec<Arc<EquivalenceSet>>,
    ready: Option<Event>,
    ready_trigger: Option<UserEvent>,
}

/// Per-(node, context) owner of the equivalence sets covering the node.
pub struct VersionManager {
    node: NodeId,
    ctx_id: ContextId,
    has_sets: AtomicBool,
    state: Mutex<ManagerState>,
}

/// What the caller of [`VersionManager::begin_analysis`] must do next.
pub(crate) enum ManagerStart {
    /// Sets are cached; proceed.
    Ready,
    /// This call won the race to compute locally.
    Compute,
    /// This call won the race and must request from the owner space.
    Request(AddressSpaceId),
    /// Another call is computing; wait for the event.
    Wait(Event),
}

impl VersionManager {
    #[must_use]
    pub fn new(node: NodeId, ctx_id: ContextId) -> Self {
        Self {
            node,
            ctx_id,
            has_sets: AtomicBool::new(false),
            state: Mutex::new(ManagerState {
                owner_space: None,
                sets: Vec::new(),
                ready: None,
                ready_trigger: None,
            }),
        }
    }

    #[inline]
    #[must_use]
    pub fn node(&self) -> NodeId {
        self.node
    }

    #[inline]
    #[must_use]
    pub fn context_id(&self) -> ContextId {
        self.ctx_id
    }

    #[must_use]
    pub fn has_equivalence_sets(&self) -> bool {
        self.has_sets.load(Ordering::Acquire)
    }

    /// Resolve the manager's state machine for one analysis call.
    pub(crate) fn begin_analysis(
        &self,
        owner_space: AddressSpaceId,
        local_space: AddressSpaceId,
    ) -> ManagerStart {
        if self.has_equivalence_sets() {
            return ManagerStart::Ready;
        }
        let mut state = self.state.lock();
        if self.has_equivalence_sets() {
            return ManagerStart::Ready;
        }
        state.owner_space.get_or_insert(owner_space);
        if let Some(ready) = &state.ready {
            return ManagerStart::Wait(ready.clone());
        }
        let trigger = UserEvent::new();
        state.ready = Some(trigger.event());
        state.ready_trigger = Some(trigger);
        if owner_space == local_space {
            ManagerStart::Compute
        } else {
            ManagerStart::Request(owner_space)
        }
    }

    /// The readiness event, if a computation or request is in flight.
    #[must_use]
    pub fn ready_event(&self) -> Option<Event> {
        self.state.lock().ready.clone()
    }

    /// Install the computed or received sets and wake waiters.
    pub fn finalize_sets(&self, sets: Vec<Arc<EquivalenceSet>>) {
        let trigger = {
            let mut state = self.state.lock();
            state.sets = sets;
            state.ready_trigger.take()
        };
        self.has_sets.store(true, Ordering::Release);
        if let Some(trigger) = trigger {
            trigger.trigger(false);
        }
    }

    /// Snapshot of the cached sets.
    #[must_use]
    pub fn equivalence_sets(&self) -> Vec<Arc<EquivalenceSet>> {
        self.state.lock().sets.clone()
    }

    /// Drop all cached state, returning the manager to uninitialized.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        self.has_sets.store(false, Ordering::Release);
        state.owner_space = None;
        state.sets.clear();
        state.ready = None;
        state.ready_trigger = None;
    }
}

// ---------------------------------------------------------------------------
// Wire payloads (field order is normative)
// ---------------------------------------------------------------------------

/// `EquivalenceSetResponse`: `did || expression`.
#[must_use]
pub fn encode_equivalence_set_response(did: DistributedId, expr: &IndexSpaceExpr) -> Vec<u8> {
    let mut buf = Vec::new();
    append_u64_le(&mut buf, did.get());
    expr.pack(&mut buf);
    buf
}

/// Decode an `EquivalenceSetResponse`.
#[must_use]
pub fn decode_equivalence_set_response(buf: &[u8]) -> Option<(DistributedId, IndexSpaceExpr)> {
    let mut offset = 0;
    let did = DistributedId::new(read_u64_le(buf, &mut offset)?)?;
    let expr = IndexSpaceExpr::unpack(buf, &mut offset)?;
    Some((did, expr))
}

/// Node handle carried by a `VersionManagerRequest`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireHandle {
    Region(RegionHandle),
    Partition(PartitionHandle),
}

/// `VersionManagerRequest`: `remote_manager_ptr || context_uid || is_region
/// || handle`.
#[must_use]
pub fn encode_version_manager_request(
    remote_manager: u64,
    context_uid: ContextUid,
    handle: WireHandle,
) -> Vec<u8> {
    let mut buf = Vec::new();
    append_u64_le(&mut buf, remote_manager);
    append_u64_le(&mut buf, context_uid.0);
    match handle {
        WireHandle::Region(region) => {
            append_bool(&mut buf, true);
            append_u32_le(&mut buf, region.tree_id.0);
            append_u64_le(&mut buf, region.index_space);
            append_u32_le(&mut buf, region.field_space);
        }
        WireHandle::Partition(partition) => {
            append_bool(&mut buf, false);
            append_u32_le(&mut buf, partition.tree_id.0);
            append_u64_le(&mut buf, partition.index_partition);
            append_u32_le(&mut buf, partition.field_space);
        }
    }
    buf
}

/// Decode a `VersionManagerRequest`.
#[must_use]
pub fn decode_version_manager_request(buf: &[u8]) -> Option<(u64, ContextUid, WireHandle)> {
    let mut offset = 0;
    let remote_manager = read_u64_le(buf, &mut offset)?;
    let context_uid = ContextUid(read_u64_le(buf, &mut offset)?);
    let is_region = read_bool(buf, &mut offset)?;
    let tree_id = weft_types::TreeId(read_u32_le(buf, &mut offset)?);
    let index = read_u64_le(buf, &mut offset)?;
    let field_space = read_u32_le(buf, &mut offset)?;
    let handle = if is_region {
        WireHandle::Region(RegionHandle {
            tree_id,
            index_space: index,
            field_space,
        })
    } else {
        WireHandle::Partition(PartitionHandle {
            tree_id,
            index_partition: index,
            field_space,
        })
    };
    Some((remote_manager, context_uid, handle))
}

/// `VersionManagerResponse`: `remote_manager_ptr || count || dids`.
#[must_use]
pub fn encode_version_manager_response(remote_manager: u64, dids: &[DistributedId]) -> Vec<u8> {
    let mut buf = Vec::new();
    append_u64_le(&mut buf, remote_manager);
    append_u64_le(&mut buf, dids.len() as u64);
    for did in dids {
        append_u64_le(&mut buf, did.get());
    }
    buf
}

/// Decode a `VersionManagerResponse`.
#[must_use]
pub fn decode_version_manager_response(buf: &[u8]) -> Option<(u64, Vec<DistributedId>)> {
    let mut offset = 0;
    let remote_manager = read_u64_le(buf, &mut offset)?;
    let count = read_u64_le(buf, &mut offset)?;
    let mut dids = Vec::with_capacity(count.min(1024) as usize);
    for _ in 0..count {
        dids.push(DistributedId::new(read_u64_le(buf, &mut offset)?)?);
    }
    Some((remote_manager, dids))
}

/// Pending readiness set merged into one waitable event.
#[must_use]
pub fn merge_ready_events(events: Vec<Event>) -> Event {
    merge_events(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;
    use std::sync::atomic::AtomicU64;
    use weft_types::FieldId;

    struct TestRegistry {
        next: AtomicU64,
        sets: PlMutex<HashMap<u64, Arc<EquivalenceSet>>>,
    }

    impl TestRegistry {
        fn new() -> Self {
            Self {
                next: AtomicU64::new(100),
                sets: PlMutex::new(HashMap::new()),
            }
        }
    }

    impl EquivalenceSetRegistry for TestRegistry {
        fn allocate_did(&self) -> DistributedId {
            DistributedId::new(self.next.fetch_add(1, Ordering::SeqCst)).unwrap()
        }

        fn register_set(&self, set: Arc<EquivalenceSet>) {
            self.sets.lock().insert(set.did().get(), set);
        }

        fn find_set(&self, did: DistributedId) -> Option<Arc<EquivalenceSet>> {
            self.sets.lock().get(&did.get()).cloned()
        }
    }

    fn mask_of(bits: &[u32]) -> FieldMask {
        bits.iter().map(|&b| FieldId(b)).collect()
    }

    fn new_set(raw_did: u64, lo: u64, hi: u64) -> Arc<EquivalenceSet> {
        EquivalenceSet::new(
            DistributedId::new(raw_did).unwrap(),
            AddressSpaceId(0),
            IndexSpaceExpr::interval(lo, hi),
        )
    }

    #[test]
    fn test_refine_partitions_expression() {
        let registry = TestRegistry::new();
        let set = new_set(1, 0, 99);
        let request = IndexSpaceExpr::interval(0, 49);
        let pieces = set.refine_for(&request, &registry);
        assert_eq!(pieces.len(), 1);
        assert_eq!(pieces[0].expr(), &request);
        // The original now descends into both pieces and still covers
        // everything.
        let mut info = VersionInfo::new();
        set.perform_versioning_analysis(&IndexSpaceExpr::interval(0, 99), &mut info);
        let total: u64 = info
            .equivalence_sets()
            .iter()
            .map(|s| s.expr().volume())
            .sum();
        assert_eq!(total, 100);
        assert_eq!(info.equivalence_sets().len(), 2);
        let (a, b) = (
            info.equivalence_sets()[0].expr().clone(),
            info.equivalence_sets()[1].expr().clone(),
        );
        assert!(!a.intersects(&b));
    }

    #[test]
    fn test_refine_dominated_returns_self() {
        let registry = TestRegistry::new();
        let set = new_set(2, 10, 19);
        let pieces = set.refine_for(&IndexSpaceExpr::interval(0, 99), &registry);
        assert_eq!(pieces.len(), 1);
        assert_eq!(pieces[0].did(), set.did());
    }

    #[test]
    fn test_shared_readers_do_not_wait_on_each_other() {
        let set = new_set(3, 0, 9);
        let mask = mask_of(&[0]);
        let (ready_a, applied_a) = set.request_valid_copy(mask, false);
        assert!(ready_a.is_empty());
        let (ready_b, applied_b) = set.request_valid_copy(mask, false);
        assert!(ready_b.is_empty());
        // A writer drains both readers.
        let (ready_w, applied_w) = set.request_valid_copy(mask, true);
        assert_eq!(ready_w.len(), 2);
        applied_a.trigger(false);
        applied_b.trigger(false);
        assert!(merge_events(ready_w).has_triggered());
        applied_w.trigger(false);
    }

    #[test]
    fn test_reader_waits_on_writer_only() {
        let set = new_set(4, 0, 9);
        let mask = mask_of(&[0]);
        let (_, applied_w) = set.request_valid_copy(mask, true);
        let (ready_r, applied_r) = set.request_valid_copy(mask, false);
        assert_eq!(ready_r.len(), 1);
        assert!(!ready_r[0].has_triggered());
        applied_w.trigger(false);
        assert!(ready_r[0].has_triggered());
        applied_r.trigger(false);
    }

    #[test]
    fn test_disjoint_fields_do_not_interfere() {
        let set = new_set(5, 0, 9);
        let (_, applied_w) = set.request_valid_copy(mask_of(&[0]), true);
        let (ready_r, applied_r) = set.request_valid_copy(mask_of(&[1]), false);
        assert!(ready_r.is_empty());
        applied_w.trigger(false);
        applied_r.trigger(false);
    }

    #[test]
    fn test_poisoned_write_leaves_no_observable_version() {
        let set = new_set(6, 0, 9);
        let mask = mask_of(&[0]);
        let (_, applied_w) = set.request_valid_copy(mask, true);
        observe_write_on(&set, &applied_w.event());
        applied_w.trigger(true);
        assert_eq!(set.version(), 0);
        let (_, applied_w2) = set.request_valid_copy(mask, true);
        observe_write_on(&set, &applied_w2.event());
        applied_w2.trigger(false);
        assert_eq!(set.version(), 1);
    }

    #[test]
    fn test_valid_views_are_field_masked() {
        let set = new_set(9, 0, 9);
        let manager_a = DistributedId::new(50).unwrap();
        let manager_b = DistributedId::new(51).unwrap();
        set.record_valid_view(manager_a, mask_of(&[0, 1]));
        set.record_valid_view(manager_b, mask_of(&[1]));
        let views = set.find_valid_views(&mask_of(&[1]));
        assert_eq!(views.len(), 2);
        let views = set.find_valid_views(&mask_of(&[0]));
        assert_eq!(views, vec![(manager_a, mask_of(&[0]))]);
        assert!(set.find_valid_views(&mask_of(&[7])).is_empty());
    }

    #[test]
    fn test_version_info_dedups_and_clears() {
        let set = new_set(7, 0, 9);
        let mut info = VersionInfo::new();
        info.record_equivalence_set(&set);
        info.record_equivalence_set(&set);
        assert_eq!(info.equivalence_sets().len(), 1);
        info.clear();
        assert!(info.equivalence_sets().is_empty());
    }

    #[test]
    fn test_manager_state_machine() {
        let manager = VersionManager::new(NodeId(0), ContextId(0));
        assert!(!manager.has_equivalence_sets());
        let start = manager.begin_analysis(AddressSpaceId(0), AddressSpaceId(0));
        assert!(matches!(start, ManagerStart::Compute));
        // A racing caller waits.
        let racing = manager.begin_analysis(AddressSpaceId(0), AddressSpaceId(0));
        assert!(matches!(racing, ManagerStart::Wait(_)));
        manager.finalize_sets(vec![new_set(8, 0, 9)]);
        assert!(manager.has_equivalence_sets());
        assert!(matches!(
            manager.begin_analysis(AddressSpaceId(0), AddressSpaceId(0)),
            ManagerStart::Ready
        ));
        manager.reset();
        assert!(!manager.has_equivalence_sets());
        // A non-owner call requests from the owner.
        assert!(matches!(
            manager.begin_analysis(AddressSpaceId(1), AddressSpaceId(0)),
            ManagerStart::Request(AddressSpaceId(1))
        ));
    }

    #[test]
    fn test_wire_round_trips() {
        let expr = IndexSpaceExpr::from_intervals([(0, 9), (20, 29)]);
        let did = DistributedId::new(11).unwrap();
        let buf = encode_equivalence_set_response(did, &expr);
        assert_eq!(decode_equivalence_set_response(&buf), Some((did, expr)));

        let handle = WireHandle::Region(RegionHandle {
            tree_id: weft_types::TreeId(1),
            index_space: 42,
            field_space: 3,
        });
        let buf = encode_version_manager_request(0xABCD, ContextUid(9), handle);
        assert_eq!(
            decode_version_manager_request(&buf),
            Some((0xABCD, ContextUid(9), handle))
        );

        let dids = vec![DistributedId::new(1).unwrap(), DistributedId::new(2).unwrap()];
        let buf = encode_version_manager_response(7, &dids);
        assert_eq!(decode_version_manager_response(&buf), Some((7, dids)));
    }
}
