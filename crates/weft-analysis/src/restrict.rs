//! Restriction and acquisition tracking.
//!
//! Restrictions are user-declared coherence windows: while a restriction is
//! in force, the named physical managers must be kept coherent for the
//! restricted fields. An acquisition carves a hole inside a restriction;
//! restrictions can nest inside acquisitions again, with strictly
//! non-increasing node dominance down the chain.
//!
//! The mutually recursive structure lives in one arena indexed by small
//! integer handles; parents own their children by index and freed slots are
//! tombstoned.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;
use weft_error::{WeftError, WeftResult};
use weft_forest::{NodeId, RegionTreeForest};
use weft_rt::Event;
use weft_types::{ContextUid, FieldMask, OpUniqueId, TreeId, append_u64_le, read_u64_le};

use crate::instances::{InstanceRef, InstanceSet, ManagerResolver, PhysicalManager};

/// Attribution for restriction errors.
#[derive(Clone, Copy)]
pub struct OpAttribution<'a> {
    pub op_id: OpUniqueId,
    pub task_name: &'a str,
    pub context_uid: ContextUid,
}

/// The per-requirement answer to "which managers must stay coherent?".
#[derive(Default)]
pub struct RestrictInfo {
    restrictions: Vec<(Arc<dyn PhysicalManager>, FieldMask)>,
    cached_instances: Option<InstanceSet>,
}

impl RestrictInfo {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn has_restrictions(&self) -> bool {
        !self.restrictions.is_empty()
    }

    /// Record `(manager, mask)`, merging by manager id.
    pub fn record_restriction(&mut self, manager: &Arc<dyn PhysicalManager>, mask: FieldMask) {
        self.cached_instances = None;
        let did = manager.distributed_id();
        for (existing, existing_mask) in &mut self.restrictions {
            if existing.distributed_id() == did {
                *existing_mask |= mask;
                return;
            }
        }
        self.restrictions.push((Arc::clone(manager), mask));
    }

    /// Union the restricted fields into `to_fill`.
    pub fn populate_restrict_fields(&self, to_fill: &mut FieldMask) {
        for (_, mask) in &self.restrictions {
            *to_fill |= *mask;
        }
    }

    /// The restricted managers as an [`InstanceSet`], built lazily.
    pub fn get_instances(&mut self) -> &InstanceSet {
        if self.cached_instances.is_none() {
            let mut set = InstanceSet::new();
            for (manager, mask) in &self.restrictions {
                set.add_instance(InstanceRef::new(Arc::clone(manager), *mask, Event::NO_EVENT));
            }
            self.cached_instances = Some(set);
        }
        self.cached_instances.as_ref().unwrap()
    }

    pub fn clear(&mut self) {
        self.restrictions.clear();
        self.cached_instances = None;
    }

    /// Append the wire encoding: count then `(did, mask)` pairs.
    pub fn pack_info(&self, buf: &mut Vec<u8>) {
        append_u64_le(buf, self.restrictions.len() as u64);
        for (manager, mask) in &self.restrictions {
            append_u64_le(buf, manager.distributed_id().get());
            mask.pack(buf);
        }
    }

    /// Read the wire encoding written by [`RestrictInfo::pack_info`].
    #[must_use]
    pub fn unpack_info(
        buf: &[u8],
        offset: &mut usize,
        resolver: &dyn ManagerResolver,
    ) -> Option<Self> {
        let mut probe = *offset;
        let count = read_u64_le(buf, &mut probe)?;
        let mut info = Self::new();
        for _ in 0..count {
            let did = weft_types::DistributedId::new(read_u64_le(buf, &mut probe)?)?;
            let mask = FieldMask::unpack(buf, &mut probe)?;
            let manager = resolver.find_manager(did)?;
            info.record_restriction(&manager, mask);
        }
        *offset = probe;
        Some(info)
    }
}

type ResIdx = usize;
type AcqIdx = usize;

struct RestrictionNode {
    node: NodeId,
    restricted_fields: FieldMask,
    instances: Vec<(Arc<dyn PhysicalManager>, FieldMask)>,
    acquisitions: Vec<AcqIdx>,
}

struct AcquisitionNode {
    node: NodeId,
    acquired_fields: FieldMask,
    restrictions: Vec<ResIdx>,
}

/// Per-context coordinator owning the top-level restrictions of every
/// region tree.
#[derive(Default)]
pub struct RestrictionTracker {
    restrictions: Vec<Option<RestrictionNode>>,
    acquisitions: Vec<Option<AcquisitionNode>>,
    top_level: HashMap<TreeId, Vec<ResIdx>>,
}

impl RestrictionTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether no restriction is outstanding anywhere.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.top_level.values().all(Vec::is_empty)
    }

    /// Attach: add a restriction at `node` for `fields`, bound to `manager`.
    pub fn record_attach(
        &mut self,
        forest: &RegionTreeForest,
        attr: OpAttribution<'_>,
        node: NodeId,
        manager: &Arc<dyn PhysicalManager>,
        fields: FieldMask,
    ) -> WeftResult<()> {
        let tree = forest.tree_id(node);
        let mut remaining = fields;
        let tops: Vec<ResIdx> = self.top_level.get(&tree).cloned().unwrap_or_default();
        for ridx in tops {
            self.restriction_add_restriction(forest, attr, ridx, node, manager, &mut remaining)?;
            if remaining.is_empty() {
                break;
            }
        }
        if !remaining.is_empty() {
            let ridx = self.alloc_restriction(node, manager, remaining);
            self.top_level.entry(tree).or_default().push(ridx);
        }
        debug!(op = %attr.op_id, node = node.0, mask = %fields, "recorded attach");
        Ok(())
    }

    /// Acquire: carve a hole in the restrictions covering `fields` at `node`.
    pub fn record_acquire(
        &mut self,
        forest: &RegionTreeForest,
        attr: OpAttribution<'_>,
        node: NodeId,
        fields: FieldMask,
    ) -> WeftResult<()> {
        let tree = forest.tree_id(node);
        let mut remaining = fields;
        let tops: Vec<ResIdx> = self.top_level.get(&tree).cloned().unwrap_or_default();
        for ridx in tops {
            self.restriction_add_acquisition(forest, attr, ridx, node, &mut remaining)?;
            if remaining.is_empty() {
                break;
            }
        }
        if !remaining.is_empty() {
            return Err(WeftError::UnrestrictedAcquire {
                op_id: attr.op_id,
                task_name: attr.task_name.to_string(),
                context_uid: attr.context_uid,
            });
        }
        debug!(op = %attr.op_id, node = node.0, mask = %fields, "recorded acquire");
        Ok(())
    }

    /// Release: close the innermost acquisitions matching `node`/`fields`.
    pub fn record_release(
        &mut self,
        forest: &RegionTreeForest,
        attr: OpAttribution<'_>,
        node: NodeId,
        fields: FieldMask,
    ) -> WeftResult<()> {
        let tree = forest.tree_id(node);
        let mut remaining = fields;
        let tops: Vec<ResIdx> = self.top_level.get(&tree).cloned().unwrap_or_default();
        for ridx in tops {
            self.restriction_remove_acquisition(forest, ridx, node, &mut remaining);
            if remaining.is_empty() {
                break;
            }
        }
        if !remaining.is_empty() {
            return Err(WeftError::UnmatchedRelease {
                op_id: attr.op_id,
                task_name: attr.task_name.to_string(),
                context_uid: attr.context_uid,
            });
        }
        debug!(op = %attr.op_id, node = node.0, mask = %fields, "recorded release");
        Ok(())
    }

    /// Detach: remove the restriction matching `node`/`fields` exactly.
    pub fn record_detach(
        &mut self,
        forest: &RegionTreeForest,
        attr: OpAttribution<'_>,
        node: NodeId,
        fields: FieldMask,
    ) -> WeftResult<()> {
        let tree = forest.tree_id(node);
        let mut remaining = fields;
        let tops: Vec<ResIdx> = self.top_level.get(&tree).cloned().unwrap_or_default();
        let mut removed: Vec<ResIdx> = Vec::new();
        for ridx in tops {
            if self.restriction_matches(forest, ridx, node, &mut remaining) {
                removed.push(ridx);
            } else if !remaining.is_empty() {
                self.restriction_remove_restriction(forest, ridx, node, &mut remaining);
            }
            if remaining.is_empty() {
                break;
            }
        }
        if !removed.is_empty() {
            let list = self.top_level.entry(tree).or_default();
            list.retain(|ridx| !removed.contains(ridx));
            for ridx in removed {
                self.free_restriction(ridx);
            }
        }
        if !remaining.is_empty() {
            return Err(WeftError::UnmatchedDetach {
                op_id: attr.op_id,
                task_name: attr.task_name.to_string(),
                context_uid: attr.context_uid,
            });
        }
        debug!(op = %attr.op_id, node = node.0, mask = %fields, "recorded detach");
        Ok(())
    }

    /// For each field of `mask` still restricted at `node`, report the
    /// managers that must be kept coherent.
    #[must_use]
    pub fn find_restrictions(
        &self,
        forest: &RegionTreeForest,
        node: NodeId,
        mask: FieldMask,
    ) -> RestrictInfo {
        let tree = forest.tree_id(node);
        let mut possibly = mask;
        let mut info = RestrictInfo::new();
        if let Some(tops) = self.top_level.get(&tree) {
            for &ridx in tops {
                self.restriction_find(forest, ridx, node, &mut possibly, &mut info);
                if possibly.is_empty() {
                    break;
                }
            }
        }
        info
    }

    // -----------------------------------------------------------------
    // arena plumbing
    // -----------------------------------------------------------------

    fn alloc_restriction(
        &mut self,
        node: NodeId,
        manager: &Arc<dyn PhysicalManager>,
        fields: FieldMask,
    ) -> ResIdx {
        let record = RestrictionNode {
            node,
            restricted_fields: fields,
            instances: vec![(Arc::clone(manager), fields)],
            acquisitions: Vec::new(),
        };
        self.restrictions.push(Some(record));
        self.restrictions.len() - 1
    }

    fn alloc_acquisition(&mut self, node: NodeId, fields: FieldMask) -> AcqIdx {
        self.acquisitions.push(Some(AcquisitionNode {
            node,
            acquired_fields: fields,
            restrictions: Vec::new(),
        }));
        self.acquisitions.len() - 1
    }

    fn free_restriction(&mut self, ridx: ResIdx) {
        if let Some(record) = self.restrictions[ridx].take() {
            for aidx in record.acquisitions {
                self.free_acquisition(aidx);
            }
        }
    }

    fn free_acquisition(&mut self, aidx: AcqIdx) {
        if let Some(record) = self.acquisitions[aidx].take() {
            for ridx in record.restrictions {
                self.free_restriction(ridx);
            }
        }
    }

    fn restriction(&self, ridx: ResIdx) -> &RestrictionNode {
        self.restrictions[ridx].as_ref().expect("freed restriction")
    }

    fn restriction_mut(&mut self, ridx: ResIdx) -> &mut RestrictionNode {
        self.restrictions[ridx].as_mut().expect("freed restriction")
    }

    fn acquisition(&self, aidx: AcqIdx) -> &AcquisitionNode {
        self.acquisitions[aidx].as_ref().expect("freed acquisition")
    }

    fn acquisition_mut(&mut self, aidx: AcqIdx) -> &mut AcquisitionNode {
        self.acquisitions[aidx].as_mut().expect("freed acquisition")
    }

    // -----------------------------------------------------------------
    // attach
    // -----------------------------------------------------------------

    fn restriction_add_restriction(
        &mut self,
        forest: &RegionTreeForest,
        attr: OpAttribution<'_>,
        ridx: ResIdx,
        node: NodeId,
        manager: &Arc<dyn PhysicalManager>,
        remaining: &mut FieldMask,
    ) -> WeftResult<()> {
        let (local, restricted, acqs) = {
            let r = self.restriction(ridx);
            (r.node, r.restricted_fields, r.acquisitions.clone())
        };
        if restricted.is_disjoint(remaining) || !forest.intersects_with(local, node) {
            return Ok(());
        }
        for aidx in acqs {
            self.acquisition_add_restriction(forest, attr, aidx, node, manager, remaining)?;
            if remaining.is_empty() {
                return Ok(());
            }
        }
        Err(WeftError::InterferingRestriction {
            op_id: attr.op_id,
            task_name: attr.task_name.to_string(),
            context_uid: attr.context_uid,
        })
    }

    fn acquisition_add_restriction(
        &mut self,
        forest: &RegionTreeForest,
        attr: OpAttribution<'_>,
        aidx: AcqIdx,
        node: NodeId,
        manager: &Arc<dyn PhysicalManager>,
        remaining: &mut FieldMask,
    ) -> WeftResult<()> {
        let (local, acquired, nested) = {
            let a = self.acquisition(aidx);
            (a.node, a.acquired_fields, a.restrictions.clone())
        };
        let mut overlap = acquired & *remaining;
        if overlap.is_empty() {
            return Ok(());
        }
        if !forest.dominates(local, node) {
            if forest.intersects_with(local, node) {
                return Err(WeftError::PartialRestriction {
                    op_id: attr.op_id,
                    task_name: attr.task_name.to_string(),
                    context_uid: attr.context_uid,
                });
            }
            return Ok(());
        }
        *remaining -= overlap;
        for ridx in nested {
            self.restriction_add_restriction(forest, attr, ridx, node, manager, &mut overlap)?;
            if overlap.is_empty() {
                return Ok(());
            }
        }
        let new_ridx = self.alloc_restriction(node, manager, overlap);
        self.acquisition_mut(aidx).restrictions.push(new_ridx);
        Ok(())
    }

    // -----------------------------------------------------------------
    // acquire
    // -----------------------------------------------------------------

    fn restriction_add_acquisition(
        &mut self,
        forest: &RegionTreeForest,
        attr: OpAttribution<'_>,
        ridx: ResIdx,
        node: NodeId,
        remaining: &mut FieldMask,
    ) -> WeftResult<()> {
        let (local, restricted, acqs) = {
            let r = self.restriction(ridx);
            (r.node, r.restricted_fields, r.acquisitions.clone())
        };
        let mut overlap = restricted & *remaining;
        if overlap.is_empty() {
            return Ok(());
        }
        if !forest.dominates(local, node) {
            if forest.intersects_with(local, node) {
                return Err(WeftError::PartialAcquire {
                    op_id: attr.op_id,
                    task_name: attr.task_name.to_string(),
                    context_uid: attr.context_uid,
                });
            }
            return Ok(());
        }
        *remaining -= overlap;
        for aidx in acqs {
            self.acquisition_add_acquisition(forest, attr, aidx, node, &mut overlap)?;
            if overlap.is_empty() {
                return Ok(());
            }
        }
        let new_aidx = self.alloc_acquisition(node, overlap);
        self.restriction_mut(ridx).acquisitions.push(new_aidx);
        Ok(())
    }

    fn acquisition_add_acquisition(
        &mut self,
        forest: &RegionTreeForest,
        attr: OpAttribution<'_>,
        aidx: AcqIdx,
        node: NodeId,
        remaining: &mut FieldMask,
    ) -> WeftResult<()> {
        let (local, acquired, nested) = {
            let a = self.acquisition(aidx);
            (a.node, a.acquired_fields, a.restrictions.clone())
        };
        if acquired.is_disjoint(remaining) || !forest.intersects_with(local, node) {
            return Ok(());
        }
        for ridx in nested {
            self.restriction_add_acquisition(forest, attr, ridx, node, remaining)?;
            if remaining.is_empty() {
                return Ok(());
            }
        }
        Err(WeftError::InterferingAcquire {
            op_id: attr.op_id,
            task_name: attr.task_name.to_string(),
            context_uid: attr.context_uid,
        })
    }

    // -----------------------------------------------------------------
    // release
    // -----------------------------------------------------------------

    fn restriction_remove_acquisition(
        &mut self,
        forest: &RegionTreeForest,
        ridx: ResIdx,
        node: NodeId,
        remaining: &mut FieldMask,
    ) {
        let (local, restricted, acqs) = {
            let r = self.restriction(ridx);
            (r.node, r.restricted_fields, r.acquisitions.clone())
        };
        if restricted.is_disjoint(remaining) || !forest.intersects_with(local, node) {
            return;
        }
        let mut to_delete: Vec<AcqIdx> = Vec::new();
        for aidx in acqs {
            if self.acquisition_matches(aidx, node, remaining) {
                to_delete.push(aidx);
            } else if !remaining.is_empty() {
                self.acquisition_remove_acquisition(forest, aidx, node, remaining);
            }
            if remaining.is_empty() {
                break;
            }
        }
        if !to_delete.is_empty() {
            self.restriction_mut(ridx)
                .acquisitions
                .retain(|aidx| !to_delete.contains(aidx));
            for aidx in to_delete {
                self.free_acquisition(aidx);
            }
        }
    }

    fn acquisition_matches(&mut self, aidx: AcqIdx, node: NodeId, remaining: &mut FieldMask) -> bool {
        let (local, acquired, nested) = {
            let a = self.acquisition(aidx);
            (a.node, a.acquired_fields, a.restrictions.clone())
        };
        if local != node {
            return false;
        }
        let mut overlap = *remaining & acquired;
        if overlap.is_empty() {
            return false;
        }
        // Fields restricted below cannot be released here.
        for ridx in nested {
            overlap -= self.restriction(ridx).restricted_fields;
            if overlap.is_empty() {
                return false;
            }
        }
        *remaining -= overlap;
        let acq = self.acquisition_mut(aidx);
        acq.acquired_fields -= overlap;
        acq.acquired_fields.is_empty()
    }

    fn acquisition_remove_acquisition(
        &mut self,
        forest: &RegionTreeForest,
        aidx: AcqIdx,
        node: NodeId,
        remaining: &mut FieldMask,
    ) {
        let (local, acquired, nested) = {
            let a = self.acquisition(aidx);
            (a.node, a.acquired_fields, a.restrictions.clone())
        };
        if acquired.is_disjoint(remaining) || !forest.dominates(local, node) {
            return;
        }
        for ridx in nested {
            self.restriction_remove_acquisition(forest, ridx, node, remaining);
            if remaining.is_empty() {
                return;
            }
        }
    }

    // -----------------------------------------------------------------
    // detach
    // -----------------------------------------------------------------

    fn restriction_matches(
        &mut self,
        _forest: &RegionTreeForest,
        ridx: ResIdx,
        node: NodeId,
        remaining: &mut FieldMask,
    ) -> bool {
        let (local, restricted, acqs) = {
            let r = self.restriction(ridx);
            (r.node, r.restricted_fields, r.acquisitions.clone())
        };
        if local != node {
            return false;
        }
        let mut overlap = *remaining & restricted;
        if overlap.is_empty() {
            return false;
        }
        // Acquired fields cannot be detached.
        for aidx in acqs {
            overlap -= self.acquisition(aidx).acquired_fields;
            if overlap.is_empty() {
                return false;
            }
        }
        *remaining -= overlap;
        let record = self.restriction_mut(ridx);
        record.restricted_fields -= overlap;
        if record.restricted_fields.is_empty() {
            return true;
        }
        record.instances.retain_mut(|(_, mask)| {
            *mask -= overlap;
            !mask.is_empty()
        });
        false
    }

    fn restriction_remove_restriction(
        &mut self,
        forest: &RegionTreeForest,
        ridx: ResIdx,
        node: NodeId,
        remaining: &mut FieldMask,
    ) {
        let (local, restricted, acqs) = {
            let r = self.restriction(ridx);
            (r.node, r.restricted_fields, r.acquisitions.clone())
        };
        if restricted.is_disjoint(remaining) || !forest.dominates(local, node) {
            return;
        }
        for aidx in acqs {
            self.acquisition_remove_restriction(forest, aidx, node, remaining);
            if remaining.is_empty() {
                return;
            }
        }
    }

    fn acquisition_remove_restriction(
        &mut self,
        forest: &RegionTreeForest,
        aidx: AcqIdx,
        node: NodeId,
        remaining: &mut FieldMask,
    ) {
        let (local, acquired, nested) = {
            let a = self.acquisition(aidx);
            (a.node, a.acquired_fields, a.restrictions.clone())
        };
        if acquired.is_disjoint(remaining) || !forest.intersects_with(local, node) {
            return;
        }
        let mut to_delete: Vec<ResIdx> = Vec::new();
        for ridx in nested {
            if self.restriction_matches(forest, ridx, node, remaining) {
                to_delete.push(ridx);
            } else if !remaining.is_empty() {
                self.restriction_remove_restriction(forest, ridx, node, remaining);
            }
            if remaining.is_empty() {
                break;
            }
        }
        if !to_delete.is_empty() {
            self.acquisition_mut(aidx)
                .restrictions
                .retain(|ridx| !to_delete.contains(ridx));
            for ridx in to_delete {
                self.free_restriction(ridx);
            }
        }
    }

    // -----------------------------------------------------------------
    // queries
    // -----------------------------------------------------------------

    fn restriction_find(
        &self,
        forest: &RegionTreeForest,
        ridx: ResIdx,
        node: NodeId,
        possibly: &mut FieldMask,
        info: &mut RestrictInfo,
    ) {
        let record = self.restriction(ridx);
        if !forest.intersects_with(record.node, node) {
            return;
        }
        for &aidx in &record.acquisitions {
            self.acquisition_find(forest, aidx, node, possibly, info);
            if possibly.is_empty() {
                return;
            }
        }
        let restricted = *possibly & record.restricted_fields;
        if restricted.is_empty() {
            return;
        }
        for (manager, mask) in &record.instances {
            let overlap = *mask & restricted;
            if overlap.is_empty() {
                continue;
            }
            info.record_restriction(manager, overlap);
        }
        *possibly -= restricted;
    }

    fn acquisition_find(
        &self,
        forest: &RegionTreeForest,
        aidx: AcqIdx,
        node: NodeId,
        possibly: &mut FieldMask,
        info: &mut RestrictInfo,
    ) {
        let record = self.acquisition(aidx);
        if record.acquired_fields.is_disjoint(possibly)
            || !forest.intersects_with(record.node, node)
        {
            return;
        }
        for &ridx in &record.restrictions {
            self.restriction_find(forest, ridx, node, possibly, info);
            if possibly.is_empty() {
                return;
            }
        }
        let overlap = record.acquired_fields & *possibly;
        if !overlap.is_empty() && forest.dominates(record.node, node) {
            *possibly -= overlap;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};
    use weft_forest::IndexSpaceExpr;
    use weft_types::{Color, DistributedId, FieldId, PartitionHandle, RegionHandle};

    struct StubManager {
        did: DistributedId,
        refs: AtomicI64,
    }

    impl StubManager {
        fn new(raw: u64) -> Arc<dyn PhysicalManager> {
            Arc::new(Self {
                did: DistributedId::new(raw).unwrap(),
                refs: AtomicI64::new(0),
            })
        }
    }

    impl PhysicalManager for StubManager {
        fn distributed_id(&self) -> DistributedId {
            self.did
        }

        fn is_virtual_manager(&self) -> bool {
            false
        }

        fn add_valid_ref(&self) {
            self.refs.fetch_add(1, Ordering::SeqCst);
        }

        fn remove_valid_ref(&self) {
            self.refs.fetch_sub(1, Ordering::SeqCst);
        }
    }

    struct StubResolver(Vec<Arc<dyn PhysicalManager>>);

    impl ManagerResolver for StubResolver {
        fn find_manager(&self, did: DistributedId) -> Option<Arc<dyn PhysicalManager>> {
            self.0.iter().find(|m| m.distributed_id() == did).cloned()
        }
    }

    fn mask_of(bits: &[u32]) -> FieldMask {
        bits.iter().map(|&b| FieldId(b)).collect()
    }

    fn attr() -> OpAttribution<'static> {
        OpAttribution {
            op_id: OpUniqueId(1),
            task_name: "window",
            context_uid: ContextUid(1),
        }
    }

    /// Root region with one child region under a partition.
    fn small_forest() -> (RegionTreeForest, NodeId, NodeId) {
        let forest = RegionTreeForest::new();
        let root = forest.create_region_tree(
            RegionHandle {
                tree_id: TreeId(1),
                index_space: 0,
                field_space: 0,
            },
            IndexSpaceExpr::interval(0, 99),
        );
        let part = forest.create_partition(
            root,
            Color(0),
            PartitionHandle {
                tree_id: TreeId(1),
                index_partition: 0,
                field_space: 0,
            },
            true,
        );
        let child = forest.create_child_region(
            part,
            Color(0),
            RegionHandle {
                tree_id: TreeId(1),
                index_space: 1,
                field_space: 0,
            },
            IndexSpaceExpr::interval(0, 49),
        );
        (forest, root, child)
    }

    #[test]
    fn test_restrict_info_wire_round_trip() {
        let manager_a = StubManager::new(5);
        let manager_b = StubManager::new(6);
        let mut info = RestrictInfo::new();
        info.record_restriction(&manager_a, mask_of(&[0, 2]));
        info.record_restriction(&manager_b, mask_of(&[1]));
        info.record_restriction(&manager_a, mask_of(&[3]));

        let mut buf = Vec::new();
        info.pack_info(&mut buf);
        let resolver = StubResolver(vec![manager_a, manager_b]);
        let mut offset = 0;
        let back = RestrictInfo::unpack_info(&buf, &mut offset, &resolver).unwrap();
        assert_eq!(offset, buf.len());
        let mut fields = FieldMask::EMPTY;
        back.populate_restrict_fields(&mut fields);
        assert_eq!(fields, mask_of(&[0, 1, 2, 3]));
    }

    #[test]
    fn test_partial_acquire_below_restriction_reports_error() {
        let (forest, root, child) = small_forest();
        let mut tracker = RestrictionTracker::new();
        let manager = StubManager::new(9);
        // Restriction lives at the child; acquiring at the root crosses it.
        tracker
            .record_attach(&forest, attr(), child, &manager, mask_of(&[0]))
            .unwrap();
        let err = tracker
            .record_acquire(&forest, attr(), root, mask_of(&[0]))
            .unwrap_err();
        assert!(matches!(err, WeftError::PartialAcquire { .. }));
    }

    #[test]
    fn test_interfering_attach_reports_error() {
        let (forest, root, _child) = small_forest();
        let mut tracker = RestrictionTracker::new();
        let manager = StubManager::new(9);
        tracker
            .record_attach(&forest, attr(), root, &manager, mask_of(&[0]))
            .unwrap();
        // A second overlapping attach with no acquisition to nest under.
        let err = tracker
            .record_attach(&forest, attr(), root, &manager, mask_of(&[0]))
            .unwrap_err();
        assert!(matches!(err, WeftError::InterferingRestriction { .. }));
    }

    #[test]
    fn test_attach_nests_under_acquisition() {
        let (forest, root, child) = small_forest();
        let mut tracker = RestrictionTracker::new();
        let outer = StubManager::new(9);
        let inner = StubManager::new(10);
        tracker
            .record_attach(&forest, attr(), root, &outer, mask_of(&[0]))
            .unwrap();
        tracker
            .record_acquire(&forest, attr(), root, mask_of(&[0]))
            .unwrap();
        tracker
            .record_attach(&forest, attr(), child, &inner, mask_of(&[0]))
            .unwrap();
        // The inner restriction is the one visible at the child now.
        let info = tracker.find_restrictions(&forest, child, mask_of(&[0]));
        assert!(info.has_restrictions());
        let mut fields = FieldMask::EMPTY;
        info.populate_restrict_fields(&mut fields);
        assert_eq!(fields, mask_of(&[0]));
        // Unwind: detach inner, release, detach outer.
        tracker
            .record_detach(&forest, attr(), child, mask_of(&[0]))
            .unwrap();
        tracker
            .record_release(&forest, attr(), root, mask_of(&[0]))
            .unwrap();
        tracker
            .record_detach(&forest, attr(), root, mask_of(&[0]))
            .unwrap();
        assert!(tracker.is_empty());
    }
}
