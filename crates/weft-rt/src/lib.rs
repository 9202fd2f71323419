//! Host-runtime boundary for the weft analysis core.
//!
//! The analyzers never park a physical thread while holding analysis state:
//! cross-boundary waits are expressed against the poisonable one-shot
//! [`Event`] defined here, and deferred continuations are scheduled with
//! [`defer`]. Cross-address-space traffic goes through the [`Transport`]
//! trait; tests wire every simulated address space to a [`LoopbackHub`].

pub mod event;
pub mod message;

pub use event::{Event, UserEvent, defer, merge_events};
pub use message::{LoopbackEndpoint, LoopbackHub, MessageHandler, Transport};
