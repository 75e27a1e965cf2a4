//! Signaling relay: wire messages, the durable-store seam, and the per-call
//! consumption rules (ordering, pending-candidate buffering, dedup).
//!
//! The relay is asynchronous and at-least-once: messages can arrive out of
//! order across senders and can be redelivered. Everything above the store
//! seam exists to make that safe for the session layer — candidates buffer
//! until their prerequisite description, duplicate descriptions and
//! candidates are dropped, and subscriptions must be closed on call end.

mod memory;
mod message;
mod relay;
mod store;

pub use memory::MemorySignalingStore;
pub use message::{SignalBody, SignalMessage};
pub use relay::{CallChannel, SignalEvent, SignalingRelay};
pub use store::{
    MeshEvent, MeshFeed, MeshSessionRecord, SessionFeed, SessionUpdate, SessionWatch,
    SignalSubscription, SignalingStore, SubscriptionGuard,
};

use thiserror::Error;

use crate::types::call::CallId;

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("relay write failed: {0}")]
    Backend(String),

    #[error("malformed signal message: {0}")]
    Malformed(String),

    #[error("no offer observed for call {0}")]
    MissingOffer(CallId),

    #[error("unknown call: {0}")]
    UnknownCall(CallId),

    #[error("subscription closed")]
    SubscriptionClosed,
}
