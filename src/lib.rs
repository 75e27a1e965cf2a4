//! Call session orchestration and signaling relay for the Span field app.
//!
//! Clients share no memory and coordinate only through an asynchronous,
//! at-least-once message relay. This crate owns what makes that safe:
//!
//! - [`session::CallSessionManager`]: per-call state machines, one session
//!   object per call id, each owning exactly one peer connection
//! - [`signaling`]: the message protocol, pending-candidate buffering, and
//!   redelivery dedup over the durable-store seam
//! - [`media::MediaController`]: local capture ownership with exact toggles
//!   and release on every exit path
//! - [`mesh::MeshCoordinator`]: N-way calls built from pairwise connections
//! - [`presence::PresenceListener`]: incoming-call surfacing and the
//!   callee-side ring window
//!
//! The platform WebRTC stack and the durable store are external
//! collaborators reached through the [`peer`] and [`signaling`] traits.

pub mod config;
pub mod error;
pub mod media;
pub mod mesh;
pub mod peer;
pub mod presence;
pub mod session;
pub mod signaling;
pub mod types;

pub use config::CallConfig;
pub use error::CallError;
pub use media::{MediaController, MediaDevices, SimulatedMediaDevices};
pub use mesh::MeshCoordinator;
pub use peer::{LoopbackPeerFactory, PeerConnection, PeerConnectionFactory, RtcConfig};
pub use presence::PresenceListener;
pub use session::{CallSessionManager, CallSnapshot};
pub use signaling::{MemorySignalingStore, SignalMessage, SignalingRelay, SignalingStore};
pub use types::call::{CallId, CallSessionRecord, CallStatus, EndReason, MediaKind, UserId};
pub use types::events::EventBus;
