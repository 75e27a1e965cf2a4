//! Core call identity and record types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Random uppercase-hex string of `len` characters.
pub(crate) fn random_hex(len: usize) -> String {
    use rand::RngCore;
    use std::fmt::Write;

    let mut bytes = vec![0u8; len / 2];
    rand::rng().fill_bytes(&mut bytes);
    let mut out = String::with_capacity(len);
    for b in bytes {
        let _ = write!(out, "{:02X}", b);
    }
    out
}

/// Opaque unique token identifying one call attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh 32-character id.
    pub fn generate() -> Self {
        Self(random_hex(32))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of a client, supplied by the application auth context and
/// trusted as given.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// What a call captures and sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Voice,
    Video,
    ScreenShare,
}

impl MediaKind {
    /// Whether this kind carries a video track in addition to audio.
    pub fn wants_video(&self) -> bool {
        matches!(self, Self::Video | Self::ScreenShare)
    }
}

/// Persisted status of a call session record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Ringing,
    Active,
    Ended,
    Declined,
    Missed,
}

impl CallStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ended | Self::Declined | Self::Missed)
    }
}

/// Why a session reached its terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// Local user hung up (or cancelled while ringing out).
    Hangup,
    /// Remote party hung up, observed through the session record.
    RemoteHangup,
    /// Local user declined the incoming call (or the ring window expired
    /// callee-side).
    Declined,
    /// Remote party declined our call.
    RemoteDeclined,
    /// Nobody answered within the ring window (caller side).
    Missed,
    /// SDP/ICE negotiation or the media transport failed.
    NegotiationFailed,
    /// Call setup aborted because a relay write failed.
    SignalingFailed,
    /// The peer connection dropped without a prior end signal.
    RemoteDisconnected,
}

impl EndReason {
    /// Record status this reason maps onto.
    pub fn status(&self) -> CallStatus {
        match self {
            Self::Declined | Self::RemoteDeclined => CallStatus::Declined,
            Self::Missed => CallStatus::Missed,
            _ => CallStatus::Ended,
        }
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Hangup => "hangup",
            Self::RemoteHangup => "remote_hangup",
            Self::Declined => "declined",
            Self::RemoteDeclined => "remote_declined",
            Self::Missed => "missed",
            Self::NegotiationFailed => "negotiation_failed",
            Self::SignalingFailed => "signaling_failed",
            Self::RemoteDisconnected => "remote_disconnected",
        };
        f.write_str(s)
    }
}

/// Durable record identifying one call attempt, shared between both parties
/// through the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSessionRecord {
    pub id: CallId,
    pub initiator_id: UserId,
    pub target_id: UserId,
    pub media_kind: MediaKind,
    pub status: CallStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<i64>,
}

impl CallSessionRecord {
    pub fn new_ringing(
        id: CallId,
        initiator_id: UserId,
        target_id: UserId,
        media_kind: MediaKind,
    ) -> Self {
        Self {
            id,
            initiator_id,
            target_id,
            media_kind,
            status: CallStatus::Ringing,
            started_at: Utc::now(),
            ended_at: None,
            duration_seconds: None,
        }
    }
}
