//! Durable-store seam: session records, signal delivery, and change feeds.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{mpsc, watch};

use super::SignalingError;
use super::message::SignalMessage;
use crate::types::call::{CallId, CallSessionRecord, CallStatus, MediaKind, UserId};

/// Fields a client may change on an existing session record.
#[derive(Debug, Clone)]
pub struct SessionUpdate {
    pub status: CallStatus,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
}

impl SessionUpdate {
    pub fn status(status: CallStatus) -> Self {
        Self {
            status,
            ended_at: None,
            duration_seconds: None,
        }
    }

    pub fn terminal(status: CallStatus, duration_seconds: Option<i64>) -> Self {
        Self {
            status,
            ended_at: Some(Utc::now()),
            duration_seconds,
        }
    }
}

/// Membership change on a mesh session.
#[derive(Debug, Clone)]
pub enum MeshEvent {
    Joined(UserId),
    Left(UserId),
    ScreenShare { user_id: UserId, sharing: bool },
    /// The host left; the session is over for everyone.
    Ended,
}

/// Durable record of a multi-party session.
#[derive(Debug, Clone)]
pub struct MeshSessionRecord {
    pub id: CallId,
    pub host_id: UserId,
    pub media_kind: MediaKind,
    pub created_at: DateTime<Utc>,
}

impl MeshSessionRecord {
    pub fn new(id: CallId, host_id: UserId, media_kind: MediaKind) -> Self {
        Self {
            id,
            host_id,
            media_kind,
            created_at: Utc::now(),
        }
    }
}

/// Decrements the backend's live-subscription counter when dropped. Leaked
/// subscriptions after call end are a defect the counter makes visible.
#[derive(Debug)]
pub struct SubscriptionGuard {
    counter: Option<Arc<AtomicUsize>>,
}

impl SubscriptionGuard {
    pub fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self {
            counter: Some(counter),
        }
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if let Some(counter) = self.counter.take() {
            counter.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Live feed of signals addressed to one recipient. Per-sender publish order
/// is preserved; cross-sender order is not.
pub struct SignalSubscription {
    rx: mpsc::UnboundedReceiver<SignalMessage>,
    _guard: SubscriptionGuard,
}

impl SignalSubscription {
    pub fn new(rx: mpsc::UnboundedReceiver<SignalMessage>, guard: SubscriptionGuard) -> Self {
        Self { rx, _guard: guard }
    }

    pub async fn recv(&mut self) -> Option<SignalMessage> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<SignalMessage> {
        self.rx.try_recv().ok()
    }
}

/// Live feed of newly inserted ringing sessions targeting one user.
pub struct SessionFeed {
    rx: mpsc::UnboundedReceiver<CallSessionRecord>,
    _guard: SubscriptionGuard,
}

impl SessionFeed {
    pub fn new(rx: mpsc::UnboundedReceiver<CallSessionRecord>, guard: SubscriptionGuard) -> Self {
        Self { rx, _guard: guard }
    }

    pub async fn recv(&mut self) -> Option<CallSessionRecord> {
        self.rx.recv().await
    }
}

/// Watch over one session record's updates.
pub struct SessionWatch {
    rx: watch::Receiver<CallSessionRecord>,
    _guard: SubscriptionGuard,
}

impl SessionWatch {
    pub fn new(rx: watch::Receiver<CallSessionRecord>, guard: SubscriptionGuard) -> Self {
        Self { rx, _guard: guard }
    }

    /// Waits for the next update and returns the record as of then.
    pub async fn changed(&mut self) -> Result<CallSessionRecord, SignalingError> {
        self.rx
            .changed()
            .await
            .map_err(|_| SignalingError::SubscriptionClosed)?;
        Ok(self.rx.borrow_and_update().clone())
    }

    pub fn current(&self) -> CallSessionRecord {
        self.rx.borrow().clone()
    }
}

/// Live feed of one mesh session's membership events.
pub struct MeshFeed {
    rx: mpsc::UnboundedReceiver<MeshEvent>,
    _guard: SubscriptionGuard,
}

impl MeshFeed {
    pub fn new(rx: mpsc::UnboundedReceiver<MeshEvent>, guard: SubscriptionGuard) -> Self {
        Self { rx, _guard: guard }
    }

    pub async fn recv(&mut self) -> Option<MeshEvent> {
        self.rx.recv().await
    }
}

/// The durable store with change-feed subscription the core runs against.
/// Requires insert/update notification filtered by recipient id and durable
/// writes of [`SignalMessage`] / [`CallSessionRecord`]; no particular schema
/// beyond those shapes.
#[async_trait]
pub trait SignalingStore: Send + Sync {
    async fn insert_session(&self, record: &CallSessionRecord) -> Result<(), SignalingError>;

    /// Apply an update to a session record. Updates against a record already
    /// in a terminal status are ignored — status is monotonic.
    async fn update_session(&self, id: &CallId, update: SessionUpdate)
    -> Result<(), SignalingError>;

    async fn fetch_session(&self, id: &CallId) -> Result<Option<CallSessionRecord>, SignalingError>;

    async fn watch_session(&self, id: &CallId) -> Result<SessionWatch, SignalingError>;

    /// Durably append one signal; delivery to the recipient's feed follows
    /// publish order per sender.
    async fn publish_signal(&self, message: &SignalMessage) -> Result<(), SignalingError>;

    /// Signals addressed to `recipient` for `call_id` published so far.
    async fn fetch_signals(
        &self,
        call_id: &CallId,
        recipient: &UserId,
    ) -> Result<Vec<SignalMessage>, SignalingError>;

    /// Live feed of every signal addressed to `recipient`, across calls.
    async fn subscribe_signals(
        &self,
        recipient: &UserId,
    ) -> Result<SignalSubscription, SignalingError>;

    /// Live feed of new ringing sessions targeting `target`.
    async fn subscribe_incoming_sessions(
        &self,
        target: &UserId,
    ) -> Result<SessionFeed, SignalingError>;

    // Mesh membership registry.

    async fn insert_mesh_session(&self, record: &MeshSessionRecord) -> Result<(), SignalingError>;

    async fn fetch_mesh_session(
        &self,
        id: &CallId,
    ) -> Result<Option<MeshSessionRecord>, SignalingError>;

    /// Register `user` as a participant and return the roster as it was
    /// before the join.
    async fn join_mesh(&self, id: &CallId, user: &UserId) -> Result<Vec<UserId>, SignalingError>;

    async fn leave_mesh(&self, id: &CallId, user: &UserId) -> Result<(), SignalingError>;

    /// End the session for everyone (host teardown).
    async fn end_mesh(&self, id: &CallId) -> Result<(), SignalingError>;

    async fn announce_screen_share(
        &self,
        id: &CallId,
        user: &UserId,
        sharing: bool,
    ) -> Result<(), SignalingError>;

    async fn subscribe_mesh(&self, id: &CallId) -> Result<MeshFeed, SignalingError>;
}
