//! Message transport boundary.
//!
//! The analysis core is transport-agnostic: it hands encoded bytes to a
//! [`Transport`] and receives them through a [`MessageHandler`]. The
//! [`LoopbackHub`] wires several simulated address spaces together inside
//! one process, delivering synchronously in send order per target.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;
use weft_types::AddressSpaceId;

/// Receiver side of the transport.
pub trait MessageHandler: Send + Sync {
    /// Deliver one message from `source`.
    fn handle_message(&self, source: AddressSpaceId, bytes: &[u8]);
}

/// Sender side of the transport.
pub trait Transport: Send + Sync {
    /// Send `bytes` to `target`. Delivery is reliable and ordered per
    /// (sender, target) pair.
    fn send(&self, target: AddressSpaceId, bytes: Vec<u8>);
}

/// In-process router connecting simulated address spaces.
#[derive(Default)]
pub struct LoopbackHub {
    handlers: Mutex<HashMap<AddressSpaceId, Arc<dyn MessageHandler>>>,
}

impl LoopbackHub {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register the handler for one address space, replacing any previous.
    pub fn register(&self, space: AddressSpaceId, handler: Arc<dyn MessageHandler>) {
        self.handlers.lock().insert(space, handler);
    }

    /// An endpoint that sends on behalf of `space`.
    #[must_use]
    pub fn endpoint(self: &Arc<Self>, space: AddressSpaceId) -> LoopbackEndpoint {
        LoopbackEndpoint {
            hub: Arc::clone(self),
            space,
        }
    }

    fn route(&self, source: AddressSpaceId, target: AddressSpaceId, bytes: Vec<u8>) {
        let handler = self.handlers.lock().get(&target).cloned();
        match handler {
            Some(handler) => handler.handle_message(source, &bytes),
            None => warn!(space = target.0, "dropping message for unregistered space"),
        }
    }
}

/// A [`Transport`] bound to one simulated address space.
#[derive(Clone)]
pub struct LoopbackEndpoint {
    hub: Arc<LoopbackHub>,
    space: AddressSpaceId,
}

impl LoopbackEndpoint {
    /// The address space this endpoint sends as.
    #[must_use]
    pub fn space(&self) -> AddressSpaceId {
        self.space
    }
}

impl Transport for LoopbackEndpoint {
    fn send(&self, target: AddressSpaceId, bytes: Vec<u8>) {
        self.hub.route(self.space, target, bytes);
    }
}
