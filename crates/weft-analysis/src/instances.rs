//! Boundary to the physical layer: instance references and sets.
//!
//! Physical managers are opaque collaborators; the analysis core only
//! records counted references to them together with the fields they hold
//! valid and the event that gates their readiness.

use std::sync::Arc;

use smallvec::SmallVec;
use weft_rt::Event;
use weft_types::{DistributedId, FieldMask, append_u64_le, read_u64_le};

/// What the analysis core may ask of a physical instance manager.
pub trait PhysicalManager: Send + Sync {
    /// Stable distributed id of the manager.
    fn distributed_id(&self) -> DistributedId;

    /// Whether this is the virtual manager (no physical backing).
    fn is_virtual_manager(&self) -> bool;

    /// Pin the manager while a reference holds it valid.
    fn add_valid_ref(&self);

    /// Release the pin taken by [`PhysicalManager::add_valid_ref`].
    fn remove_valid_ref(&self);
}

/// Resolves distributed ids back to managers during unpack.
pub trait ManagerResolver {
    fn find_manager(&self, did: DistributedId) -> Option<Arc<dyn PhysicalManager>>;
}

/// A counted reference to a physical manager for a set of fields.
///
/// The valid reference is held for the lifetime of the record; dropping the
/// record releases it.
pub struct InstanceRef {
    manager: Arc<dyn PhysicalManager>,
    valid_fields: FieldMask,
    ready_event: Event,
}

impl InstanceRef {
    #[must_use]
    pub fn new(manager: Arc<dyn PhysicalManager>, valid_fields: FieldMask, ready_event: Event) -> Self {
        manager.add_valid_ref();
        Self {
            manager,
            valid_fields,
            ready_event,
        }
    }

    #[must_use]
    pub fn manager(&self) -> &Arc<dyn PhysicalManager> {
        &self.manager
    }

    #[must_use]
    pub fn valid_fields(&self) -> &FieldMask {
        &self.valid_fields
    }

    #[must_use]
    pub fn ready_event(&self) -> &Event {
        &self.ready_event
    }

    #[must_use]
    pub fn is_virtual(&self) -> bool {
        self.manager.is_virtual_manager()
    }
}

impl Clone for InstanceRef {
    fn clone(&self) -> Self {
        self.manager.add_valid_ref();
        Self {
            manager: Arc::clone(&self.manager),
            valid_fields: self.valid_fields,
            ready_event: self.ready_event.clone(),
        }
    }
}

impl Drop for InstanceRef {
    fn drop(&mut self) {
        self.manager.remove_valid_ref();
    }
}

impl std::fmt::Debug for InstanceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceRef")
            .field("manager", &self.manager.distributed_id())
            .field("fields", &self.valid_fields)
            .finish()
    }
}

/// Copy-on-write collection of instance references.
///
/// The single-element case stays inline; cloning a set shares the storage
/// and the first mutation of a shared set clones it.
#[derive(Clone, Default, Debug)]
pub struct InstanceSet {
    refs: Arc<SmallVec<[InstanceRef; 1]>>,
}

impl InstanceSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.refs.len()
    }

    /// Whether the storage is currently shared with another set.
    #[must_use]
    pub fn is_shared(&self) -> bool {
        Arc::strong_count(&self.refs) > 1
    }

    #[must_use]
    pub fn get(&self, idx: usize) -> Option<&InstanceRef> {
        self.refs.get(idx)
    }

    /// Stable iteration in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &InstanceRef> {
        self.refs.iter()
    }

    /// Add an instance, unsharing first if needed.
    pub fn add_instance(&mut self, instance: InstanceRef) {
        Arc::make_mut(&mut self.refs).push(instance);
    }

    /// Drop every instance, unsharing first if needed.
    pub fn clear(&mut self) {
        Arc::make_mut(&mut self.refs).clear();
    }

    /// Union of all valid fields in the set.
    #[must_use]
    pub fn covered_fields(&self) -> FieldMask {
        self.refs
            .iter()
            .fold(FieldMask::EMPTY, |acc, r| acc | *r.valid_fields())
    }

    /// References whose fields overlap `mask`.
    pub fn find_overlapping<'a>(
        &'a self,
        mask: &'a FieldMask,
    ) -> impl Iterator<Item = &'a InstanceRef> {
        self.refs
            .iter()
            .filter(move |r| !r.valid_fields().is_disjoint(mask))
    }

    /// Append the wire encoding: count then `(did, mask)` per reference.
    /// Readiness events are address-space local and do not travel.
    pub fn pack(&self, buf: &mut Vec<u8>) {
        append_u64_le(buf, self.refs.len() as u64);
        for instance in self.refs.iter() {
            append_u64_le(buf, instance.manager().distributed_id().get());
            instance.valid_fields().pack(buf);
        }
    }

    /// Read the wire encoding written by [`InstanceSet::pack`], resolving
    /// managers through `resolver`.
    #[must_use]
    pub fn unpack(
        buf: &[u8],
        offset: &mut usize,
        resolver: &dyn ManagerResolver,
    ) -> Option<Self> {
        let mut probe = *offset;
        let count = read_u64_le(buf, &mut probe)?;
        let mut refs: SmallVec<[InstanceRef; 1]> = SmallVec::new();
        for _ in 0..count {
            let did = DistributedId::new(read_u64_le(buf, &mut probe)?)?;
            let mask = FieldMask::unpack(buf, &mut probe)?;
            let manager = resolver.find_manager(did)?;
            refs.push(InstanceRef::new(manager, mask, Event::NO_EVENT));
        }
        *offset = probe;
        Some(Self {
            refs: Arc::new(refs),
        })
    }
}
