//! Typed event bus surfaced to the embedding application.

use std::sync::Arc;
use tokio::sync::broadcast;

use crate::media::RemoteTrack;
use crate::types::call::{CallId, CallStatus, EndReason, MediaKind, UserId};

// The size of the broadcast channel buffer.
const CHANNEL_CAPACITY: usize = 100;

/// A new ringing call addressed to this client. The incoming-call UI and the
/// push-notification system consume this; the core only guarantees it fires
/// while the client is subscribed.
#[derive(Debug, Clone)]
pub struct IncomingCall {
    pub call_id: CallId,
    pub initiator_id: UserId,
    pub media_kind: MediaKind,
}

/// A session's record status changed.
#[derive(Debug, Clone)]
pub struct CallStateChanged {
    pub call_id: CallId,
    pub status: CallStatus,
}

/// A session reached a terminal state, with the reason it got there.
#[derive(Debug, Clone)]
pub struct CallEnded {
    pub call_id: CallId,
    pub reason: EndReason,
    pub duration_seconds: Option<i64>,
}

/// A remote participant's media track became available.
#[derive(Debug, Clone)]
pub struct RemoteStreamAdded {
    pub call_id: CallId,
    pub user_id: UserId,
    pub track: RemoteTrack,
}

/// A participant started or stopped sharing their screen.
#[derive(Debug, Clone)]
pub struct ScreenShareChanged {
    pub session_id: CallId,
    pub user_id: UserId,
    pub sharing: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantChange {
    Joined,
    Left,
}

/// Mesh session membership changed.
#[derive(Debug, Clone)]
pub struct ParticipantUpdate {
    pub session_id: CallId,
    pub user_id: UserId,
    pub change: ParticipantChange,
}

// Macro to generate EventBus fields and constructor
macro_rules! define_event_bus {
    ($(($field:ident, $type:ty)),* $(,)?) => {
        /// Typed event bus that provides separate broadcast channels for each
        /// event type. Subscribers that only care about one event kind don't
        /// pay for the others.
        #[derive(Debug)]
        pub struct EventBus {
            $(
                pub $field: broadcast::Sender<$type>,
            )*
        }

        impl EventBus {
            pub fn new() -> Self {
                Self {
                    $(
                        $field: broadcast::channel(CHANNEL_CAPACITY).0,
                    )*
                }
            }
        }
    };
}

define_event_bus! {
    (incoming_call, Arc<IncomingCall>),
    (call_state, Arc<CallStateChanged>),
    (call_ended, Arc<CallEnded>),
    (remote_stream, Arc<RemoteStreamAdded>),
    (screen_share, Arc<ScreenShareChanged>),
    (participant, Arc<ParticipantUpdate>),
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
