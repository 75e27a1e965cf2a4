//! Per-participant bookkeeping for mesh sessions.

use std::sync::Arc;

use crate::peer::PeerConnection;
use crate::types::call::UserId;

/// One remote participant as seen by the local client: their flags plus the
/// peer connection that reaches them. The connection is owned here
/// exclusively.
pub struct Participant {
    pub user_id: UserId,
    pub is_host: bool,
    pub audio_muted: bool,
    pub video_muted: bool,
    pub sharing_screen: bool,
    pub(crate) peer: Arc<dyn PeerConnection>,
}

impl Participant {
    pub fn new(user_id: UserId, is_host: bool, peer: Arc<dyn PeerConnection>) -> Self {
        Self {
            user_id,
            is_host,
            audio_muted: false,
            video_muted: false,
            sharing_screen: false,
            peer,
        }
    }

    pub fn info(&self) -> ParticipantInfo {
        ParticipantInfo {
            user_id: self.user_id.clone(),
            is_host: self.is_host,
            audio_muted: self.audio_muted,
            video_muted: self.video_muted,
            sharing_screen: self.sharing_screen,
        }
    }
}

/// Flags-only view of a participant.
#[derive(Debug, Clone)]
pub struct ParticipantInfo {
    pub user_id: UserId,
    pub is_host: bool,
    pub audio_muted: bool,
    pub video_muted: bool,
    pub sharing_screen: bool,
}
