//! Peer-connection seam over the platform WebRTC stack.
//!
//! The platform provides offer/answer/ICE negotiation and the media
//! transport; this crate only orchestrates it. Sessions own their peer
//! connection exclusively — no other component mutates one directly.

mod loopback;

pub use loopback::{LoopbackPeerConnection, LoopbackPeerFactory};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::media::{LocalStream, RemoteTrack};

/// Negotiation role of a session description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

/// A discovered network path the platform may use to reach the counterpart.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_m_line_index: Option<u32>,
}

/// ICE configuration handed to every peer connection. STUN only — no TURN
/// relay is configured, so clients behind symmetric NAT may fail to connect;
/// that failure surfaces as a transport state event, never silently.
#[derive(Debug, Clone)]
pub struct RtcConfig {
    pub ice_servers: Vec<String>,
}

impl Default for RtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
        }
    }
}

/// Connection-level state reported by the platform stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Asynchronous events a peer connection surfaces to its owning session.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A locally gathered candidate that must be relayed to the counterpart.
    IceCandidate(IceCandidate),
    /// A remote track became available.
    RemoteTrack(RemoteTrack),
    /// The transport-level connection state changed.
    StateChanged(PeerConnectionState),
}

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("sdp error: {0}")]
    Sdp(String),

    #[error("ice error: {0}")]
    Ice(String),

    #[error("peer connection closed")]
    Closed,
}

/// One point-to-point connection. Created per call leg and owned exclusively
/// by the session (or mesh participant entry) that created it.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError>;

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError>;

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError>;

    async fn remote_description(&self) -> Option<SessionDescription>;

    /// Apply a relayed candidate. Requires the remote description to already
    /// be set; the relay layer guarantees that ordering.
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError>;

    /// Attach a locally captured stream so its tracks are sent to the
    /// counterpart.
    async fn attach_stream(&self, stream: &LocalStream) -> Result<(), NegotiationError>;

    /// Close the connection and detach everything. Idempotent.
    async fn close(&self);

    async fn is_closed(&self) -> bool;
}

/// Creates peer connections against the platform stack.
pub trait PeerConnectionFactory: Send + Sync {
    /// Create a connection plus the event stream its owning session drains.
    fn create(
        &self,
        config: &RtcConfig,
    ) -> (Arc<dyn PeerConnection>, mpsc::UnboundedReceiver<PeerEvent>);
}
