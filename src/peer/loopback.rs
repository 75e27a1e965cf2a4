//! In-process peer connections for tests and the demo binary.
//!
//! No network is involved: descriptions are synthesized, candidates are
//! emitted once the local description is set, and the connection reports
//! `Connected` as soon as both descriptions are in place. Applied candidates
//! and closure are recorded so tests can assert on them.

use async_trait::async_trait;
use log::debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, mpsc};

use super::{
    IceCandidate, NegotiationError, PeerConnection, PeerConnectionFactory, PeerConnectionState,
    PeerEvent, RtcConfig, SdpType, SessionDescription,
};
use crate::media::{LocalStream, RemoteTrack, TrackKind};
use crate::types::call::random_hex;

const CANDIDATES_PER_CONNECTION: usize = 2;

#[derive(Default)]
struct Negotiation {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    connected_reported: bool,
}

pub struct LoopbackPeerConnection {
    negotiation: Mutex<Negotiation>,
    applied_candidates: Mutex<Vec<IceCandidate>>,
    attached: Mutex<Vec<LocalStream>>,
    closed: AtomicBool,
    fail_on_connect: AtomicBool,
    events: mpsc::UnboundedSender<PeerEvent>,
}

impl LoopbackPeerConnection {
    fn new(events: mpsc::UnboundedSender<PeerEvent>) -> Self {
        Self {
            negotiation: Mutex::new(Negotiation::default()),
            applied_candidates: Mutex::new(Vec::new()),
            attached: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            fail_on_connect: AtomicBool::new(false),
            events,
        }
    }

    fn synthesize_sdp(&self) -> String {
        format!(
            "v=0\r\no=- {} 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n\
             a=ice-ufrag:{}\r\na=ice-pwd:{}\r\n\
             m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n",
            random_hex(16),
            random_hex(8),
            random_hex(24),
        )
    }

    fn send(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }

    async fn after_description_change(&self) {
        {
            let mut negotiation = self.negotiation.lock().await;
            if negotiation.local.is_none()
                || negotiation.remote.is_none()
                || negotiation.connected_reported
            {
                return;
            }
            negotiation.connected_reported = true;
        }
        let failed = self.fail_on_connect.load(Ordering::SeqCst);
        let has_video = self.attached.lock().await.iter().any(|s| s.has_video());

        if failed {
            self.send(PeerEvent::StateChanged(PeerConnectionState::Failed));
            return;
        }

        self.send(PeerEvent::StateChanged(PeerConnectionState::Connected));
        self.send(PeerEvent::RemoteTrack(RemoteTrack {
            id: random_hex(16),
            kind: TrackKind::Audio,
        }));
        if has_video {
            self.send(PeerEvent::RemoteTrack(RemoteTrack {
                id: random_hex(16),
                kind: TrackKind::Video,
            }));
        }
    }

    /// Make the next negotiation report `Failed` instead of `Connected`.
    pub fn fail_on_connect(&self) {
        self.fail_on_connect.store(true, Ordering::SeqCst);
    }

    /// Simulate the transport dropping without an explicit end signal.
    pub fn simulate_disconnect(&self) {
        self.send(PeerEvent::StateChanged(PeerConnectionState::Disconnected));
    }

    /// Candidates applied so far, in application order.
    pub async fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.applied_candidates.lock().await.clone()
    }

    pub async fn attached_streams(&self) -> Vec<LocalStream> {
        self.attached.lock().await.clone()
    }

    pub async fn local_description(&self) -> Option<SessionDescription> {
        self.negotiation.lock().await.local.clone()
    }

    fn ensure_open(&self) -> Result<(), NegotiationError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(NegotiationError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PeerConnection for LoopbackPeerConnection {
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        self.ensure_open()?;
        Ok(SessionDescription {
            kind: SdpType::Offer,
            sdp: self.synthesize_sdp(),
        })
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        self.ensure_open()?;
        if self.negotiation.lock().await.remote.is_none() {
            return Err(NegotiationError::Sdp(
                "cannot answer without a remote offer".to_string(),
            ));
        }
        Ok(SessionDescription {
            kind: SdpType::Answer,
            sdp: self.synthesize_sdp(),
        })
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.ensure_open()?;
        self.negotiation.lock().await.local = Some(description);

        // The platform gathers candidates once a local description exists.
        for index in 0..CANDIDATES_PER_CONNECTION {
            self.send(PeerEvent::IceCandidate(IceCandidate {
                candidate: format!(
                    "candidate:{} 1 udp {} 127.0.0.1 {} typ host",
                    random_hex(8),
                    2_113_937_151u32 - index as u32,
                    40_000 + index,
                ),
                sdp_mid: Some("0".to_string()),
                sdp_m_line_index: Some(0),
            }));
        }

        self.after_description_change().await;
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.ensure_open()?;
        self.negotiation.lock().await.remote = Some(description);
        self.after_description_change().await;
        Ok(())
    }

    async fn remote_description(&self) -> Option<SessionDescription> {
        self.negotiation.lock().await.remote.clone()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        self.ensure_open()?;
        if self.negotiation.lock().await.remote.is_none() {
            return Err(NegotiationError::Ice(
                "candidate applied before remote description".to_string(),
            ));
        }
        self.applied_candidates.lock().await.push(candidate);
        Ok(())
    }

    async fn attach_stream(&self, stream: &LocalStream) -> Result<(), NegotiationError> {
        self.ensure_open()?;
        self.attached.lock().await.push(stream.clone());
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("loopback peer connection closed");
        self.attached.lock().await.clear();
        self.send(PeerEvent::StateChanged(PeerConnectionState::Closed));
    }

    async fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Factory that keeps every created connection reachable for assertions.
#[derive(Default)]
pub struct LoopbackPeerFactory {
    created: std::sync::Mutex<Vec<Arc<LoopbackPeerConnection>>>,
}

impl LoopbackPeerFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every connection this factory created, in creation order.
    pub fn connections(&self) -> Vec<Arc<LoopbackPeerConnection>> {
        self.created.lock().expect("factory lock poisoned").clone()
    }

    pub async fn open_connection_count(&self) -> usize {
        let mut open = 0;
        for connection in self.connections() {
            if !connection.is_closed().await {
                open += 1;
            }
        }
        open
    }
}

impl PeerConnectionFactory for LoopbackPeerFactory {
    fn create(
        &self,
        _config: &RtcConfig,
    ) -> (Arc<dyn PeerConnection>, mpsc::UnboundedReceiver<PeerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = Arc::new(LoopbackPeerConnection::new(tx));
        self.created
            .lock()
            .expect("factory lock poisoned")
            .push(connection.clone());
        (connection, rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create() -> (
        Arc<LoopbackPeerFactory>,
        Arc<dyn PeerConnection>,
        mpsc::UnboundedReceiver<PeerEvent>,
    ) {
        let factory = LoopbackPeerFactory::new();
        let (connection, events) = factory.create(&RtcConfig::default());
        (factory, connection, events)
    }

    #[tokio::test]
    async fn test_candidates_follow_local_description() {
        let (_, connection, mut events) = create();

        let offer = connection.create_offer().await.unwrap();
        connection.set_local_description(offer).await.unwrap();

        let mut candidates = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, PeerEvent::IceCandidate(_)) {
                candidates += 1;
            }
        }
        assert_eq!(candidates, CANDIDATES_PER_CONNECTION);
    }

    #[tokio::test]
    async fn test_candidate_rejected_before_remote_description() {
        let (_, connection, _events) = create();

        let result = connection
            .add_ice_candidate(IceCandidate {
                candidate: "candidate:0 1 udp 1 127.0.0.1 40000 typ host".to_string(),
                sdp_mid: Some("0".to_string()),
                sdp_m_line_index: Some(0),
            })
            .await;
        assert!(matches!(result, Err(NegotiationError::Ice(_))));
    }

    #[tokio::test]
    async fn test_connected_once_both_descriptions_set() {
        let (_, connection, mut events) = create();

        let offer = connection.create_offer().await.unwrap();
        connection.set_local_description(offer).await.unwrap();
        connection
            .set_remote_description(SessionDescription {
                kind: SdpType::Answer,
                sdp: "v=0\r\n".to_string(),
            })
            .await
            .unwrap();

        let mut connected = false;
        while let Ok(event) = events.try_recv() {
            if matches!(
                event,
                PeerEvent::StateChanged(PeerConnectionState::Connected)
            ) {
                connected = true;
            }
        }
        assert!(connected);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_reported_once() {
        let (factory, connection, mut events) = create();

        connection.close().await;
        connection.close().await;
        assert!(connection.is_closed().await);
        assert_eq!(factory.open_connection_count().await, 0);

        let mut closed_events = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, PeerEvent::StateChanged(PeerConnectionState::Closed)) {
                closed_events += 1;
            }
        }
        assert_eq!(closed_events, 1);
    }
}
