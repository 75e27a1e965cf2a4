//! Per-call session objects and the registry that owns them.
//!
//! One `CallSession` per call id, held in a map — never a shared "current
//! call" field — so a session ending can't corrupt one that is starting.
//! Each session exclusively owns its peer connection, its media, its relay
//! channel, and its ring timer; the driver task is the single consumer of the
//! session's asynchronous inputs.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::{debug, info, warn};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tokio::task::JoinHandle;

use super::state::{InvalidTransition, SessionState, SessionTransition};
use crate::config::CallConfig;
use crate::error::CallError;
use crate::media::{MediaController, MediaDevices};
use crate::peer::{
    PeerConnection, PeerConnectionFactory, PeerConnectionState, PeerEvent, SessionDescription,
};
use crate::signaling::{
    CallChannel, SessionUpdate, SignalEvent, SignalMessage, SignalingError, SignalingRelay,
    SignalingStore,
};
use crate::types::call::{CallId, CallSessionRecord, CallStatus, EndReason, MediaKind, UserId};
use crate::types::events::{CallEnded, CallStateChanged, EventBus, RemoteStreamAdded};

/// Read-only view of one session for the embedding application.
#[derive(Debug, Clone, Serialize)]
pub struct CallSnapshot {
    pub call_id: CallId,
    pub peer_id: UserId,
    pub media_kind: MediaKind,
    pub status: CallStatus,
    pub is_initiator: bool,
    pub started_at: DateTime<Utc>,
}

struct SessionDeps {
    local_user: UserId,
    store: Arc<dyn SignalingStore>,
    devices: Arc<dyn MediaDevices>,
    events: Arc<EventBus>,
}

/// One call's worth of state and resources.
pub struct CallSession {
    id: CallId,
    local_user: UserId,
    remote_user: UserId,
    media_kind: MediaKind,
    is_initiator: bool,
    started_at: DateTime<Utc>,
    state: Mutex<SessionState>,
    media: MediaController,
    relay: SignalingRelay,
    store: Arc<dyn SignalingStore>,
    events: Arc<EventBus>,
    peer: AsyncMutex<Option<Arc<dyn PeerConnection>>>,
    channel: AsyncMutex<Option<CallChannel>>,
    shutdown: watch::Sender<bool>,
    ring_timer: Mutex<Option<JoinHandle<()>>>,
}

impl CallSession {
    fn new(
        id: CallId,
        remote_user: UserId,
        media_kind: MediaKind,
        is_initiator: bool,
        started_at: DateTime<Utc>,
        initial_state: SessionState,
        deps: SessionDeps,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            id,
            relay: SignalingRelay::new(deps.store.clone(), deps.local_user.clone()),
            local_user: deps.local_user,
            remote_user,
            media_kind,
            is_initiator,
            started_at,
            state: Mutex::new(initial_state),
            media: MediaController::new(deps.devices),
            store: deps.store,
            events: deps.events,
            peer: AsyncMutex::new(None),
            channel: AsyncMutex::new(None),
            shutdown,
            ring_timer: Mutex::new(None),
        })
    }

    pub fn id(&self) -> &CallId {
        &self.id
    }

    pub fn status(&self) -> CallStatus {
        self.state.lock().expect("state lock poisoned").status()
    }

    pub fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            call_id: self.id.clone(),
            peer_id: self.remote_user.clone(),
            media_kind: self.media_kind,
            status: self.status(),
            is_initiator: self.is_initiator,
            started_at: self.started_at,
        }
    }

    fn state_snapshot(&self) -> SessionState {
        self.state.lock().expect("state lock poisoned").clone()
    }

    fn transition(&self, transition: SessionTransition) -> Result<CallStatus, InvalidTransition> {
        let mut state = self.state.lock().expect("state lock poisoned");
        let next = state.apply(transition)?;
        *state = next;
        Ok(state.status())
    }

    fn emit_state(&self, status: CallStatus) {
        let _ = self.events.call_state.send(Arc::new(CallStateChanged {
            call_id: self.id.clone(),
            status,
        }));
    }

    fn emit_ended(&self, reason: EndReason, duration_seconds: Option<i64>) {
        let _ = self.events.call_ended.send(Arc::new(CallEnded {
            call_id: self.id.clone(),
            reason,
            duration_seconds,
        }));
    }

    fn arm_ring_timer(self: &Arc<Self>, window: Duration) {
        let session = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            session.ring_timeout_fired().await;
        });
        *self.ring_timer.lock().expect("timer lock poisoned") = Some(handle);
    }

    fn cancel_ring_timer(&self) {
        if let Some(handle) = self.ring_timer.lock().expect("timer lock poisoned").take() {
            handle.abort();
        }
    }

    /// Ring window expired. Only ringing states accept the transition, so a
    /// stale timer racing an answer or an end is a no-op.
    pub(crate) async fn ring_timeout_fired(&self) {
        self.terminate_with(SessionTransition::RingTimeout).await;
    }

    pub(crate) async fn terminate(&self, reason: EndReason) {
        self.terminate_with(SessionTransition::End { reason }).await;
    }

    /// The one teardown path. Idempotent: the first caller wins the terminal
    /// transition, everyone else returns immediately.
    async fn terminate_with(&self, transition: SessionTransition) {
        let outcome = {
            let mut state = self.state.lock().expect("state lock poisoned");
            if state.is_terminal() {
                None
            } else {
                match state.apply(transition) {
                    Ok(next) => {
                        *state = next;
                        if let SessionState::Ended {
                            reason,
                            duration_seconds,
                            ..
                        } = &*state
                        {
                            Some((*reason, *duration_seconds))
                        } else {
                            None
                        }
                    }
                    Err(_) => None,
                }
            }
        };
        let Some((reason, duration_seconds)) = outcome else {
            return;
        };
        let status = reason.status();

        self.cancel_ring_timer();
        let _ = self.shutdown.send(true);

        if let Some(peer) = self.peer.lock().await.take() {
            peer.close().await;
        }
        self.media.release();
        if let Some(channel) = self.channel.lock().await.take() {
            channel.close();
        }

        if let Err(e) = self
            .store
            .update_session(&self.id, SessionUpdate::terminal(status, duration_seconds))
            .await
        {
            warn!("call {}: failed to persist terminal status: {}", self.id, e);
        }

        info!("call {}: {} ({})", self.id, status_str(status), reason);
        self.emit_state(status);
        self.emit_ended(reason, duration_seconds);
    }

    /// Watch the shared record so a terminal write from the other side ends
    /// the call here too. Runs for the whole session lifetime.
    fn spawn_record_watch(self: &Arc<Self>) {
        let session = self.clone();
        tokio::spawn(async move {
            let Ok(mut record_watch) = session.store.watch_session(&session.id).await else {
                warn!("call {}: record watch unavailable", session.id);
                return;
            };
            let mut shutdown = session.shutdown.subscribe();
            loop {
                tokio::select! {
                    // wait_for sees a shutdown that happened before this task
                    // subscribed; changed() would sleep through it.
                    _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break,
                    record = record_watch.changed() => match record {
                        Ok(record) => session.on_record_update(record).await,
                        Err(_) => break,
                    },
                }
            }
        });
    }

    /// Single consumer of the session's asynchronous inputs: peer-connection
    /// events and relayed signals. Owns the relay channel and closes it on
    /// exit — the mandatory unsubscription.
    fn spawn_driver(self: &Arc<Self>, mut peer_rx: mpsc::UnboundedReceiver<PeerEvent>) {
        let session = self.clone();
        tokio::spawn(async move {
            let Some(mut channel) = session.channel.lock().await.take() else {
                return;
            };
            let mut shutdown = session.shutdown.subscribe();
            loop {
                tokio::select! {
                    _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break,
                    event = peer_rx.recv() => match event {
                        Some(event) => session.on_peer_event(event).await,
                        None => break,
                    },
                    event = channel.recv() => match event {
                        Some(event) => session.on_signal_event(event).await,
                        None => break,
                    },
                }
            }
            channel.close();
        });
    }

    async fn on_peer_event(&self, event: PeerEvent) {
        match event {
            PeerEvent::IceCandidate(candidate) => {
                let message = SignalMessage::ice_candidate(
                    self.id.clone(),
                    self.local_user.clone(),
                    self.remote_user.clone(),
                    candidate,
                );
                if let Err(e) = self.relay.publish(message).await {
                    warn!("call {}: failed to relay candidate: {}", self.id, e);
                }
            }
            PeerEvent::RemoteTrack(track) => {
                debug!("call {}: remote {:?} track {}", self.id, track.kind, track.id);
                let _ = self.events.remote_stream.send(Arc::new(RemoteStreamAdded {
                    call_id: self.id.clone(),
                    user_id: self.remote_user.clone(),
                    track,
                }));
            }
            PeerEvent::StateChanged(state) => match state {
                PeerConnectionState::Connected => {
                    debug!("call {}: transport connected", self.id);
                }
                PeerConnectionState::Failed => {
                    warn!("call {}: transport failed", self.id);
                    self.terminate(EndReason::NegotiationFailed).await;
                }
                PeerConnectionState::Disconnected | PeerConnectionState::Closed => {
                    // No prior end signal; treated exactly like a local end.
                    self.terminate(EndReason::RemoteDisconnected).await;
                }
                _ => {}
            },
        }
    }

    async fn on_signal_event(&self, event: SignalEvent) {
        match event {
            SignalEvent::RemoteAnswer { description, .. } => {
                self.on_remote_answer(description).await;
            }
            SignalEvent::RemoteCandidate { candidate, .. } => {
                let peer = self.peer.lock().await.clone();
                if let Some(peer) = peer
                    && let Err(e) = peer.add_ice_candidate(candidate).await
                {
                    warn!("call {}: candidate rejected: {}", self.id, e);
                }
            }
            SignalEvent::RemoteOffer { .. } => {
                // The channel already absorbed redelivery; anything else here
                // is a renegotiation attempt this core doesn't support.
                debug!("call {}: unexpected offer ignored", self.id);
            }
        }
    }

    async fn on_remote_answer(&self, description: SessionDescription) {
        if !self.is_initiator {
            debug!("call {}: answer received on callee side, ignored", self.id);
            return;
        }
        let peer = self.peer.lock().await.clone();
        let Some(peer) = peer else { return };

        if let Err(e) = peer.set_remote_description(description).await {
            warn!("call {}: applying answer failed: {}", self.id, e);
            self.terminate(EndReason::NegotiationFailed).await;
            return;
        }

        match self.transition(SessionTransition::RemoteAnswered) {
            Ok(status) => {
                self.cancel_ring_timer();
                if let Err(e) = self
                    .store
                    .update_session(&self.id, SessionUpdate::status(CallStatus::Active))
                    .await
                {
                    warn!("call {}: failed to persist active status: {}", self.id, e);
                }
                info!("call {}: active", self.id);
                self.emit_state(status);
            }
            Err(e) => debug!("call {}: late answer ignored: {}", self.id, e),
        }
    }

    async fn on_record_update(&self, record: CallSessionRecord) {
        if !record.status.is_terminal() || self.state_snapshot().is_terminal() {
            return;
        }
        let reason = match record.status {
            CallStatus::Declined => {
                if self.is_initiator {
                    EndReason::RemoteDeclined
                } else {
                    EndReason::Declined
                }
            }
            CallStatus::Missed => EndReason::Missed,
            _ => EndReason::RemoteHangup,
        };
        info!(
            "call {}: remote terminal status {}, ending locally",
            self.id,
            status_str(record.status)
        );
        self.terminate(reason).await;
    }
}

fn status_str(status: CallStatus) -> &'static str {
    match status {
        CallStatus::Ringing => "ringing",
        CallStatus::Active => "active",
        CallStatus::Ended => "ended",
        CallStatus::Declined => "declined",
        CallStatus::Missed => "missed",
    }
}

/// Registry of live sessions plus the operations the application calls.
pub struct CallSessionManager {
    local_user: UserId,
    config: CallConfig,
    store: Arc<dyn SignalingStore>,
    peers: Arc<dyn PeerConnectionFactory>,
    devices: Arc<dyn MediaDevices>,
    events: Arc<EventBus>,
    sessions: DashMap<CallId, Arc<CallSession>>,
}

impl CallSessionManager {
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

    pub fn local_user(&self) -> &UserId {
        &self.local_user
    }

    pub fn config(&self) -> &CallConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn SignalingStore> {
        self.store.clone()
    }

    pub fn events(&self) -> Arc<EventBus> {
        self.events.clone()
    }

    fn deps(&self) -> SessionDeps {
        SessionDeps {
            local_user: self.local_user.clone(),
            store: self.store.clone(),
            devices: self.devices.clone(),
            events: self.events.clone(),
        }
    }

    /// Start an outgoing call. When this returns successfully, exactly one
    /// offer has been durably published and the session is ringing out.
    pub async fn start_call(
        &self,
        target: UserId,
        media_kind: MediaKind,
    ) -> Result<CallId, CallError> {
        self.cleanup_ended_calls();
        let active = self
            .sessions
            .iter()
            .filter(|entry| !entry.value().status().is_terminal())
            .count();
        if active >= self.config.max_concurrent_calls {
            return Err(CallError::TooManyCalls);
        }

        let call_id = CallId::generate();
        let session = CallSession::new(
            call_id.clone(),
            target.clone(),
            media_kind,
            true,
            Utc::now(),
            SessionState::Idle,
            self.deps(),
        );

        // Media first: a denied capture must fail before anything is
        // persisted or published.
        let local = session.media.acquire(media_kind).await?;

        let release_on_abort = scopeguard::guard(session.clone(), |s| s.media.release());

        let record = CallSessionRecord::new_ringing(
            call_id.clone(),
            self.local_user.clone(),
            target.clone(),
            media_kind,
        );

        let setup: Result<_, CallError> = async {
            self.store.insert_session(&record).await?;
            let (peer, peer_rx) = self.peers.create(&self.config.rtc);
            peer.attach_stream(&local).await?;
            let offer = peer.create_offer().await?;
            peer.set_local_description(offer.clone()).await?;
            // Subscribe before publishing so the answer can't be missed.
            let channel = session.relay.open_channel(&call_id).await?;
            session
                .relay
                .publish(SignalMessage::offer(
                    call_id.clone(),
                    self.local_user.clone(),
                    target.clone(),
                    offer,
                ))
                .await?;
            Ok((peer, peer_rx, channel))
        }
        .await;

        let (peer, peer_rx, channel) = match setup {
            Ok(parts) => parts,
            Err(e) => {
                warn!("call {}: setup aborted: {}", call_id, e);
                // No phantom ringing row may survive a failed setup.
                let _ = self
                    .store
                    .update_session(&call_id, SessionUpdate::terminal(CallStatus::Ended, None))
                    .await;
                return Err(e);
            }
        };
        let session = scopeguard::ScopeGuard::into_inner(release_on_abort);

        *session.peer.lock().await = Some(peer);
        *session.channel.lock().await = Some(channel);
        session
            .transition(SessionTransition::OfferPublished)
            .map_err(CallError::from)?;

        info!(
            "call {}: ringing out to {} ({:?})",
            call_id, target, media_kind
        );
        session.emit_state(CallStatus::Ringing);
        self.sessions.insert(call_id.clone(), session.clone());
        session.arm_ring_timer(self.config.ring_timeout);
        session.spawn_record_watch();
        session.spawn_driver(peer_rx);
        Ok(call_id)
    }

    /// Register an incoming ringing session observed through the store. Opens
    /// the relay channel immediately so no signal is missed, and arms the
    /// ring timer. Idempotent per call id.
    pub async fn register_incoming(
        &self,
        record: &CallSessionRecord,
    ) -> Result<Arc<CallSession>, CallError> {
        if let Some(existing) = self.sessions.get(&record.id) {
            return Ok(existing.value().clone());
        }

        let session = CallSession::new(
            record.id.clone(),
            record.initiator_id.clone(),
            record.media_kind,
            false,
            record.started_at,
            SessionState::RingingIn {
                received_at: Utc::now(),
            },
            self.deps(),
        );
        let channel = session.relay.open_channel(&record.id).await?;
        *session.channel.lock().await = Some(channel);

        debug!(
            "call {}: incoming from {} ({:?})",
            record.id, record.initiator_id, record.media_kind
        );
        self.sessions.insert(record.id.clone(), session.clone());
        session.arm_ring_timer(self.config.ring_timeout);
        session.spawn_record_watch();
        Ok(session)
    }

    /// Answer an incoming call. Requires that the offer has been observed
    /// through the relay; fails with a signaling error otherwise.
    pub async fn answer_call(&self, call_id: &CallId) -> Result<(), CallError> {
        let session = match self.sessions.get(call_id) {
            Some(entry) => entry.value().clone(),
            None => {
                // Listener not running; fall back to the stored record.
                let record = self
                    .store
                    .fetch_session(call_id)
                    .await?
                    .ok_or_else(|| CallError::NotFound(call_id.clone()))?;
                if record.target_id != self.local_user || record.status != CallStatus::Ringing {
                    return Err(CallError::NotFound(call_id.clone()));
                }
                self.register_incoming(&record).await?
            }
        };

        if !session.state_snapshot().can_answer() {
            return Err(CallError::InvalidTransition(InvalidTransition {
                current_state: format!("{:?}", session.state_snapshot()),
                attempted: "LocalAnswered".to_string(),
            }));
        }

        let Some(mut channel) = session.channel.lock().await.take() else {
            return Err(CallError::Signaling(SignalingError::MissingOffer(
                call_id.clone(),
            )));
        };

        let Some((from, offer)) = channel.take_remote_offer() else {
            *session.channel.lock().await = Some(channel);
            return Err(CallError::Signaling(SignalingError::MissingOffer(
                call_id.clone(),
            )));
        };

        let local = match session.media.acquire(session.media_kind).await {
            Ok(local) => local,
            Err(e) => {
                *session.channel.lock().await = Some(channel);
                return Err(e.into());
            }
        };

        let setup: Result<_, CallError> = async {
            let (peer, peer_rx) = self.peers.create(&self.config.rtc);
            peer.attach_stream(&local).await?;
            peer.set_remote_description(offer).await?;

            // Candidates that raced the offer were queued behind it; apply
            // them now that the remote description exists.
            while let Some(event) = channel.try_next() {
                if let SignalEvent::RemoteCandidate { candidate, .. } = event {
                    peer.add_ice_candidate(candidate).await?;
                }
            }

            let answer = peer.create_answer().await?;
            peer.set_local_description(answer.clone()).await?;
            session
                .relay
                .publish(SignalMessage::answer(
                    call_id.clone(),
                    self.local_user.clone(),
                    from.clone(),
                    answer,
                ))
                .await?;
            Ok((peer, peer_rx))
        }
        .await;

        let (peer, peer_rx) = match setup {
            Ok(parts) => parts,
            Err(e) => {
                warn!("call {}: answer aborted: {}", call_id, e);
                session.media.release();
                *session.channel.lock().await = Some(channel);
                return Err(e);
            }
        };

        *session.peer.lock().await = Some(peer);
        *session.channel.lock().await = Some(channel);

        match session.transition(SessionTransition::LocalAnswered) {
            Ok(status) => {
                session.cancel_ring_timer();
                if let Err(e) = self
                    .store
                    .update_session(call_id, SessionUpdate::status(CallStatus::Active))
                    .await
                {
                    warn!("call {}: failed to persist active status: {}", call_id, e);
                }
                info!("call {}: answered, active", call_id);
                session.emit_state(status);
                session.spawn_driver(peer_rx);
                Ok(())
            }
            Err(e) => {
                // The ring window expired while we were setting up; undo
                // everything the terminate path has already missed.
                if let Some(peer) = session.peer.lock().await.take() {
                    peer.close().await;
                }
                if let Some(channel) = session.channel.lock().await.take() {
                    channel.close();
                }
                session.media.release();
                Err(e.into())
            }
        }
    }

    /// Decline an incoming call. Publishes no media and acquires nothing.
    pub async fn decline_call(&self, call_id: &CallId) -> Result<(), CallError> {
        let session = self
            .sessions
            .get(call_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| CallError::NotFound(call_id.clone()))?;

        if !session.state_snapshot().can_decline() {
            return Err(CallError::InvalidTransition(InvalidTransition {
                current_state: format!("{:?}", session.state_snapshot()),
                attempted: "Declined".to_string(),
            }));
        }

        session.terminate(EndReason::Declined).await;
        Ok(())
    }

    /// End a call. Idempotent: safe from any state, safe to call twice, and a
    /// no-op for calls this client no longer knows.
    pub async fn end_call(&self, call_id: &CallId) -> Result<(), CallError> {
        match self.sessions.get(call_id).map(|entry| entry.value().clone()) {
            Some(session) => {
                session.terminate(EndReason::Hangup).await;
                Ok(())
            }
            None => {
                debug!("end_call for unknown call {} is a no-op", call_id);
                Ok(())
            }
        }
    }

    /// Flip the local audio mute for a call; returns the new muted state.
    pub fn toggle_mute(&self, call_id: &CallId) -> Result<bool, CallError> {
        let session = self
            .sessions
            .get(call_id)
            .ok_or_else(|| CallError::NotFound(call_id.clone()))?;
        Ok(session.media.toggle_mute())
    }

    /// Flip the local video for a call; returns the new video-off state.
    pub fn toggle_video(&self, call_id: &CallId) -> Result<bool, CallError> {
        let session = self
            .sessions
            .get(call_id)
            .ok_or_else(|| CallError::NotFound(call_id.clone()))?;
        Ok(session.media.toggle_video())
    }

    pub fn get_call(&self, call_id: &CallId) -> Option<CallSnapshot> {
        self.sessions.get(call_id).map(|entry| entry.snapshot())
    }

    /// Every session that hasn't reached a terminal state.
    pub fn active_calls(&self) -> Vec<CallSnapshot> {
        self.sessions
            .iter()
            .filter(|entry| !entry.value().status().is_terminal())
            .map(|entry| entry.snapshot())
            .collect()
    }

    pub fn has_active_call(&self) -> bool {
        self.sessions
            .iter()
            .any(|entry| entry.value().status() == CallStatus::Active)
    }

    /// Drop terminal sessions from the registry.
    pub fn cleanup_ended_calls(&self) {
        self.sessions
            .retain(|_, session| !session.status().is_terminal());
    }

    /// Fire a session's ring timeout now. Used by the presence listener's
    /// independent timer; converges on the same idempotent path as the
    /// session's own timer.
    pub(crate) async fn fire_ring_timeout(&self, call_id: &CallId) {
        if let Some(session) = self.sessions.get(call_id).map(|entry| entry.value().clone()) {
            session.ring_timeout_fired().await;
        }
    }
}
