//! Mesh session coordination: join/leave choreography, screen share, and
//! recording.

use dashmap::DashMap;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};

use super::participant::{Participant, ParticipantInfo};
use super::recording::{MixRecorder, RecordingArtifact};
use crate::config::CallConfig;
use crate::error::CallError;
use crate::media::{LocalStream, MediaController, MediaDevices, TrackKind};
use crate::peer::{
    PeerConnection, PeerConnectionFactory, PeerConnectionState, PeerEvent, RtcConfig,
    SessionDescription,
};
use crate::signaling::{
    CallChannel, MeshEvent, MeshFeed, MeshSessionRecord, SignalEvent, SignalMessage,
    SignalingRelay, SignalingStore,
};
use crate::types::call::{CallId, MediaKind, UserId};
use crate::types::events::{
    EventBus, ParticipantChange, ParticipantUpdate, RemoteStreamAdded, ScreenShareChanged,
};

/// The local client's view of one multi-party session.
pub struct MeshSession {
    id: CallId,
    host_id: UserId,
    local_user: UserId,
    media_kind: MediaKind,
    media: MediaController,
    relay: SignalingRelay,
    store: Arc<dyn SignalingStore>,
    peers: Arc<dyn PeerConnectionFactory>,
    events: Arc<EventBus>,
    rtc: RtcConfig,
    participants: AsyncMutex<HashMap<UserId, Participant>>,
    /// Remote audio tracks by owner, feeding the recorder.
    remote_audio: AsyncMutex<Vec<(UserId, String)>>,
    screen: AsyncMutex<Option<LocalStream>>,
    local_sharing: AtomicBool,
    recorder: AsyncMutex<Option<MixRecorder>>,
    peer_events: mpsc::UnboundedSender<(UserId, PeerEvent)>,
    shutdown: watch::Sender<bool>,
    closed: AtomicBool,
}

impl MeshSession {
    #[allow(clippy::too_many_arguments)]
    fn new(
        id: CallId,
        host_id: UserId,
        local_user: UserId,
        media_kind: MediaKind,
        store: Arc<dyn SignalingStore>,
        peers: Arc<dyn PeerConnectionFactory>,
        devices: Arc<dyn MediaDevices>,
        events: Arc<EventBus>,
        rtc: RtcConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<(UserId, PeerEvent)>) {
        let (peer_events, peer_events_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        let session = Arc::new(Self {
            id,
            host_id,
            relay: SignalingRelay::new(store.clone(), local_user.clone()),
            local_user,
            media_kind,
            media: MediaController::new(devices),
            store,
            peers,
            events,
            rtc,
            participants: AsyncMutex::new(HashMap::new()),
            remote_audio: AsyncMutex::new(Vec::new()),
            screen: AsyncMutex::new(None),
            local_sharing: AtomicBool::new(false),
            recorder: AsyncMutex::new(None),
            peer_events,
            shutdown,
            closed: AtomicBool::new(false),
        });
        (session, peer_events_rx)
    }

    pub fn id(&self) -> &CallId {
        &self.id
    }

    pub fn host_id(&self) -> &UserId {
        &self.host_id
    }

    pub fn is_host(&self) -> bool {
        self.local_user == self.host_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_sharing_screen(&self) -> bool {
        self.local_sharing.load(Ordering::SeqCst)
    }

    pub fn media_kind(&self) -> MediaKind {
        self.media_kind
    }

    pub async fn connection_count(&self) -> usize {
        self.participants.lock().await.len()
    }

    pub async fn participants(&self) -> Vec<ParticipantInfo> {
        self.participants
            .lock()
            .await
            .values()
            .map(|p| p.info())
            .collect()
    }

    pub async fn is_recording(&self) -> bool {
        self.recorder.lock().await.is_some()
    }

    /// Create a peer connection toward `remote` with the local stream (and
    /// any active screen share) attached, its events tagged and forwarded to
    /// the driver.
    async fn open_peer(&self, remote: &UserId) -> Result<Arc<dyn PeerConnection>, CallError> {
        let (peer, mut rx) = self.peers.create(&self.rtc);
        if let Some(local) = self.media.current_stream() {
            peer.attach_stream(&local).await?;
        }
        if let Some(screen) = self.screen.lock().await.clone() {
            peer.attach_stream(&screen).await?;
        }

        let forward = self.peer_events.clone();
        let user = remote.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if forward.send((user.clone(), event)).is_err() {
                    break;
                }
            }
        });
        Ok(peer)
    }

    async fn insert_participant(&self, user: UserId, peer: Arc<dyn PeerConnection>) {
        let is_host = user == self.host_id;
        self.participants
            .lock()
            .await
            .insert(user.clone(), Participant::new(user.clone(), is_host, peer));
        let _ = self.events.participant.send(Arc::new(ParticipantUpdate {
            session_id: self.id.clone(),
            user_id: user,
            change: ParticipantChange::Joined,
        }));
    }

    /// Offer a connection to one existing participant (the joiner's side of
    /// the mesh fan-out).
    async fn offer_to(&self, remote: UserId) -> Result<(), CallError> {
        let peer = self.open_peer(&remote).await?;
        let offer = peer.create_offer().await?;
        peer.set_local_description(offer.clone()).await?;
        self.relay
            .publish(SignalMessage::offer(
                self.id.clone(),
                self.local_user.clone(),
                remote.clone(),
                offer,
            ))
            .await?;
        self.insert_participant(remote, peer).await;
        Ok(())
    }

    /// Answer a joiner's offer (the existing participant's side).
    async fn accept_offer(&self, from: UserId, description: SessionDescription) {
        let result: Result<(), CallError> = async {
            let peer = self.open_peer(&from).await?;
            peer.set_remote_description(description).await?;
            let answer = peer.create_answer().await?;
            peer.set_local_description(answer.clone()).await?;
            self.relay
                .publish(SignalMessage::answer(
                    self.id.clone(),
                    self.local_user.clone(),
                    from.clone(),
                    answer,
                ))
                .await?;
            self.insert_participant(from.clone(), peer).await;
            Ok(())
        }
        .await;
        if let Err(e) = result {
            warn!(
                "mesh {}: failed to answer offer from {}: {}",
                self.id, from, e
            );
        }
    }

    /// Close and remove only the connection referencing `user`.
    async fn remove_participant(&self, user: &UserId) {
        let removed = self.participants.lock().await.remove(user);
        let Some(participant) = removed else { return };
        participant.peer.close().await;

        let mut remote_audio = self.remote_audio.lock().await;
        if let Some(recorder) = self.recorder.lock().await.as_mut() {
            for (owner, track_id) in remote_audio.iter() {
                if owner == user {
                    recorder.remove_source(track_id);
                }
            }
        }
        remote_audio.retain(|(owner, _)| owner != user);
        drop(remote_audio);

        debug!("mesh {}: removed participant {}", self.id, user);
        let _ = self.events.participant.send(Arc::new(ParticipantUpdate {
            session_id: self.id.clone(),
            user_id: user.clone(),
            change: ParticipantChange::Left,
        }));
    }

    async fn on_peer_event(&self, user: UserId, event: PeerEvent) {
        match event {
            PeerEvent::IceCandidate(candidate) => {
                let message = SignalMessage::ice_candidate(
                    self.id.clone(),
                    self.local_user.clone(),
                    user.clone(),
                    candidate,
                );
                if let Err(e) = self.relay.publish(message).await {
                    warn!("mesh {}: failed to relay candidate to {}: {}", self.id, user, e);
                }
            }
            PeerEvent::RemoteTrack(track) => {
                if track.kind == TrackKind::Audio {
                    self.remote_audio
                        .lock()
                        .await
                        .push((user.clone(), track.id.clone()));
                    if let Some(recorder) = self.recorder.lock().await.as_mut() {
                        recorder.add_source(track.id.clone());
                    }
                }
                let _ = self.events.remote_stream.send(Arc::new(RemoteStreamAdded {
                    call_id: self.id.clone(),
                    user_id: user,
                    track,
                }));
            }
            PeerEvent::StateChanged(state) => match state {
                PeerConnectionState::Disconnected | PeerConnectionState::Failed => {
                    // That leg dropped without a leave; tear down only the
                    // connections referencing it.
                    warn!("mesh {}: connection to {} dropped", self.id, user);
                    self.remove_participant(&user).await;
                }
                _ => {}
            },
        }
    }

    async fn on_signal_event(&self, event: SignalEvent) {
        match event {
            SignalEvent::RemoteOffer { from, description } => {
                self.accept_offer(from, description).await;
            }
            SignalEvent::RemoteAnswer { from, description } => {
                let peer = {
                    let participants = self.participants.lock().await;
                    participants.get(&from).map(|p| p.peer.clone())
                };
                match peer {
                    Some(peer) => {
                        if let Err(e) = peer.set_remote_description(description).await {
                            warn!("mesh {}: applying answer from {} failed: {}", self.id, from, e);
                            self.remove_participant(&from).await;
                        }
                    }
                    None => debug!("mesh {}: answer from unknown participant {}", self.id, from),
                }
            }
            SignalEvent::RemoteCandidate { from, candidate } => {
                let peer = {
                    let participants = self.participants.lock().await;
                    participants.get(&from).map(|p| p.peer.clone())
                };
                if let Some(peer) = peer
                    && let Err(e) = peer.add_ice_candidate(candidate).await
                {
                    warn!("mesh {}: candidate from {} rejected: {}", self.id, from, e);
                }
            }
        }
    }

    async fn on_mesh_event(&self, event: MeshEvent) -> bool {
        match event {
            MeshEvent::Joined(user) => {
                if user != self.local_user {
                    debug!("mesh {}: {} joined, awaiting their offer", self.id, user);
                }
            }
            MeshEvent::Left(user) => {
                if user != self.local_user {
                    self.remove_participant(&user).await;
                }
            }
            MeshEvent::ScreenShare { user_id, sharing } => {
                if user_id != self.local_user {
                    if let Some(participant) =
                        self.participants.lock().await.get_mut(&user_id)
                    {
                        participant.sharing_screen = sharing;
                    }
                    let _ = self.events.screen_share.send(Arc::new(ScreenShareChanged {
                        session_id: self.id.clone(),
                        user_id,
                        sharing,
                    }));
                }
            }
            MeshEvent::Ended => {
                info!("mesh {}: host ended the session", self.id);
                self.teardown().await;
                return true;
            }
        }
        false
    }

    fn spawn_driver(
        self: &Arc<Self>,
        mut channel: CallChannel,
        mut feed: MeshFeed,
        mut peer_rx: mpsc::UnboundedReceiver<(UserId, PeerEvent)>,
    ) {
        let session = self.clone();
        tokio::spawn(async move {
            let mut shutdown = session.shutdown.subscribe();
            loop {
                tokio::select! {
                    _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break,
                    event = channel.recv() => match event {
                        Some(event) => session.on_signal_event(event).await,
                        None => break,
                    },
                    event = feed.recv() => match event {
                        Some(event) => {
                            if session.on_mesh_event(event).await {
                                break;
                            }
                        }
                        None => break,
                    },
                    event = peer_rx.recv() => match event {
                        Some((user, event)) => session.on_peer_event(user, event).await,
                        None => break,
                    },
                }
            }
            channel.close();
        });
    }

    /// Stop everything local to this client. Idempotent.
    async fn teardown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown.send(true);

        let drained: Vec<Participant> = {
            let mut participants = self.participants.lock().await;
            participants.drain().map(|(_, p)| p).collect()
        };
        for participant in drained {
            participant.peer.close().await;
        }

        if let Some(screen) = self.screen.lock().await.take() {
            screen.stop_all();
        }
        self.local_sharing.store(false, Ordering::SeqCst);
        self.media.release();
        *self.recorder.lock().await = None;
        info!("mesh {}: torn down", self.id);
    }

    async fn start_screen_share_inner(self: &Arc<Self>, stream: LocalStream) {
        {
            let participants = self.participants.lock().await;
            for participant in participants.values() {
                if let Err(e) = participant.peer.attach_stream(&stream).await {
                    warn!(
                        "mesh {}: failed to attach screen share for {}: {}",
                        self.id, participant.user_id, e
                    );
                }
            }
        }

        // The OS ending the capture must run the same stop path as an
        // explicit call.
        if let Some(track) = stream.tracks_of(TrackKind::Video).next() {
            let mut stopped = track.stopped();
            let session = self.clone();
            let mut shutdown = self.shutdown.subscribe();
            tokio::spawn(async move {
                tokio::select! {
                    _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => {}
                    ok = async { stopped.wait_for(|s| *s).await.is_ok() } => {
                        if ok {
                            session.stop_screen_share_inner().await;
                        }
                    }
                }
            });
        }

        *self.screen.lock().await = Some(stream);
        self.local_sharing.store(true, Ordering::SeqCst);
        if let Err(e) = self
            .store
            .announce_screen_share(&self.id, &self.local_user, true)
            .await
        {
            warn!("mesh {}: failed to announce screen share: {}", self.id, e);
        }
        let _ = self.events.screen_share.send(Arc::new(ScreenShareChanged {
            session_id: self.id.clone(),
            user_id: self.local_user.clone(),
            sharing: true,
        }));
        info!("mesh {}: screen share started", self.id);
    }

    async fn stop_screen_share_inner(&self) {
        let Some(stream) = self.screen.lock().await.take() else {
            return;
        };
        stream.stop_all();
        self.local_sharing.store(false, Ordering::SeqCst);
        if !self.is_closed() {
            if let Err(e) = self
                .store
                .announce_screen_share(&self.id, &self.local_user, false)
                .await
            {
                warn!("mesh {}: failed to announce screen share end: {}", self.id, e);
            }
        }
        let _ = self.events.screen_share.send(Arc::new(ScreenShareChanged {
            session_id: self.id.clone(),
            user_id: self.local_user.clone(),
            sharing: false,
        }));
        info!("mesh {}: screen share stopped", self.id);
    }
}

/// Manages this client's mesh sessions, one [`MeshSession`] per session id.
pub struct MeshCoordinator {
    local_user: UserId,
    config: CallConfig,
    store: Arc<dyn SignalingStore>,
    peers: Arc<dyn PeerConnectionFactory>,
    devices: Arc<dyn MediaDevices>,
    events: Arc<EventBus>,
    sessions: DashMap<CallId, Arc<MeshSession>>,
}

impl MeshCoordinator {
    pub fn new(
        local_user: UserId,
        config: CallConfig,
        store: Arc<dyn SignalingStore>,
        peers: Arc<dyn PeerConnectionFactory>,
        devices: Arc<dyn MediaDevices>,
        events: Arc<EventBus>,
    ) -> Arc<Self> {
        Arc::new(Self {
            local_user,
            config,
            store,
            peers,
            devices,
            events,
            sessions: DashMap::new(),
        })
    }

    fn build_session(
        &self,
        id: CallId,
        host_id: UserId,
        media_kind: MediaKind,
    ) -> (Arc<MeshSession>, mpsc::UnboundedReceiver<(UserId, PeerEvent)>) {
        MeshSession::new(
            id,
            host_id,
            self.local_user.clone(),
            media_kind,
            self.store.clone(),
            self.peers.clone(),
            self.devices.clone(),
            self.events.clone(),
            self.config.rtc.clone(),
        )
    }

    /// Start a new session with the local user as host. No peer connections
    /// exist until someone joins.
    pub async fn create_session(&self, media_kind: MediaKind) -> Result<CallId, CallError> {
        let id = CallId::generate();
        let (session, peer_rx) = self.build_session(id.clone(), self.local_user.clone(), media_kind);

        session.media.acquire(media_kind).await?;
        let release_on_abort = scopeguard::guard(session.clone(), |s| s.media.release());

        let record = MeshSessionRecord::new(id.clone(), self.local_user.clone(), media_kind);
        let setup: Result<_, CallError> = async {
            self.store.insert_mesh_session(&record).await?;
            let channel = session.relay.open_channel(&id).await?;
            let feed = self.store.subscribe_mesh(&id).await?;
            self.store.join_mesh(&id, &self.local_user).await?;
            Ok((channel, feed))
        }
        .await;
        let (channel, feed) = match setup {
            Ok(parts) => parts,
            Err(e) => {
                warn!("mesh {}: create aborted: {}", id, e);
                return Err(e);
            }
        };
        let session = scopeguard::ScopeGuard::into_inner(release_on_abort);

        session.spawn_driver(channel, feed, peer_rx);
        self.sessions.insert(id.clone(), session);
        info!("mesh {}: created as host", id);
        Ok(id)
    }

    /// Join an existing session: acquire media, register, and offer one new
    /// connection to every participant already there.
    pub async fn join_session(&self, session_id: &CallId) -> Result<(), CallError> {
        let record = self
            .store
            .fetch_mesh_session(session_id)
            .await?
            .ok_or_else(|| CallError::NotFound(session_id.clone()))?;
        if self.sessions.contains_key(session_id) {
            return Err(CallError::AlreadyExists(session_id.clone()));
        }

        let (session, peer_rx) =
            self.build_session(session_id.clone(), record.host_id.clone(), record.media_kind);

        session.media.acquire(record.media_kind).await?;
        let release_on_abort = scopeguard::guard(session.clone(), |s| s.media.release());

        let setup: Result<_, CallError> = async {
            // Channel and feed first so nothing between join and subscribe is
            // missed.
            let channel = session.relay.open_channel(session_id).await?;
            let feed = self.store.subscribe_mesh(session_id).await?;
            let roster = self.store.join_mesh(session_id, &self.local_user).await?;
            Ok((channel, feed, roster))
        }
        .await;
        let (channel, feed, roster) = match setup {
            Ok(parts) => parts,
            Err(e) => {
                warn!("mesh {}: join aborted: {}", session_id, e);
                return Err(e);
            }
        };
        let session = scopeguard::ScopeGuard::into_inner(release_on_abort);

        info!(
            "mesh {}: joining, offering to {} existing participants",
            session_id,
            roster.len()
        );
        for existing in roster {
            if existing == self.local_user {
                continue;
            }
            if let Err(e) = session.offer_to(existing.clone()).await {
                warn!("mesh {}: offer to {} failed: {}", session_id, existing, e);
            }
        }

        session.spawn_driver(channel, feed, peer_rx);
        self.sessions.insert(session_id.clone(), session);
        Ok(())
    }

    /// Leave a session. A non-host leaver tears down only its own
    /// connections; the host leaving ends the session for everyone.
    pub async fn leave_session(&self, session_id: &CallId) -> Result<(), CallError> {
        let (_, session) = self
            .sessions
            .remove(session_id)
            .ok_or_else(|| CallError::NotFound(session_id.clone()))?;

        if session.is_host() {
            info!("mesh {}: host leaving, ending session", session_id);
            self.store.end_mesh(session_id).await?;
        } else {
            info!("mesh {}: leaving", session_id);
            self.store.leave_mesh(session_id, &self.local_user).await?;
        }
        session.teardown().await;
        Ok(())
    }

    /// Acquire a display capture and broadcast it to every participant.
    /// A no-op when already sharing.
    pub async fn start_screen_share(&self, session_id: &CallId) -> Result<(), CallError> {
        let session = self.session(session_id)?;
        if session.screen.lock().await.is_some() {
            debug!("mesh {}: already sharing, ignoring", session_id);
            return Ok(());
        }
        let stream = self.devices.capture_display().await?;
        session.start_screen_share_inner(stream).await;
        Ok(())
    }

    /// Stop an active screen share. A no-op when not sharing (including when
    /// the capture already ended at the OS level).
    pub async fn stop_screen_share(&self, session_id: &CallId) -> Result<(), CallError> {
        let session = self.session(session_id)?;
        session.stop_screen_share_inner().await;
        Ok(())
    }

    /// Start mixing all participants' audio. A no-op when already recording.
    pub async fn start_recording(&self, session_id: &CallId) -> Result<(), CallError> {
        let session = self.session(session_id)?;
        let mut recorder = session.recorder.lock().await;
        if recorder.is_some() {
            debug!("mesh {}: already recording, ignoring", session_id);
            return Ok(());
        }

        let mut sources: Vec<String> = session
            .media
            .current_stream()
            .map(|s| {
                s.tracks_of(TrackKind::Audio)
                    .map(|t| t.id().to_string())
                    .collect()
            })
            .unwrap_or_default();
        sources.extend(
            session
                .remote_audio
                .lock()
                .await
                .iter()
                .map(|(_, id)| id.clone()),
        );

        info!(
            "mesh {}: recording started ({} sources)",
            session_id,
            sources.len()
        );
        *recorder = Some(MixRecorder::start(sources));
        Ok(())
    }

    /// Stop recording. Returns `None` when no recording was running.
    pub async fn stop_recording(
        &self,
        session_id: &CallId,
    ) -> Result<Option<RecordingArtifact>, CallError> {
        let session = self.session(session_id)?;
        let recorder = session.recorder.lock().await.take();
        Ok(recorder.map(|r| {
            info!("mesh {}: recording stopped", session_id);
            r.finish()
        }))
    }

    pub fn session(&self, session_id: &CallId) -> Result<Arc<MeshSession>, CallError> {
        self.sessions
            .get(session_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| CallError::NotFound(session_id.clone()))
    }
}
