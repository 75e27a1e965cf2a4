//! In-process signaling store for tests and the demo binary.
//!
//! Keeps the full signal log durably so late subscribers can fetch the
//! backlog, fans live messages out per recipient, and counts open feeds so
//! tests can assert none leak after call end.

use async_trait::async_trait;
use log::debug;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Mutex, mpsc, watch};

use super::SignalingError;
use super::message::SignalMessage;
use super::store::{
    MeshEvent, MeshFeed, MeshSessionRecord, SessionFeed, SessionUpdate, SessionWatch,
    SignalSubscription, SignalingStore, SubscriptionGuard,
};
use crate::types::call::{CallId, CallSessionRecord, CallStatus, UserId};

#[derive(Default)]
struct Inner {
    sessions: HashMap<CallId, CallSessionRecord>,
    session_watchers: HashMap<CallId, Vec<watch::Sender<CallSessionRecord>>>,
    signals: Vec<SignalMessage>,
    signal_subscribers: HashMap<UserId, Vec<mpsc::UnboundedSender<SignalMessage>>>,
    incoming_subscribers: HashMap<UserId, Vec<mpsc::UnboundedSender<CallSessionRecord>>>,
    mesh_sessions: HashMap<CallId, MeshSessionRecord>,
    mesh_members: HashMap<CallId, Vec<UserId>>,
    mesh_subscribers: HashMap<CallId, Vec<mpsc::UnboundedSender<MeshEvent>>>,
}

#[derive(Default)]
pub struct MemorySignalingStore {
    inner: Mutex<Inner>,
    live_subscriptions: Arc<AtomicUsize>,
}

impl MemorySignalingStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of open feeds across all recipients. Zero after every session
    /// ended means no subscription leaked.
    pub fn live_subscription_count(&self) -> usize {
        self.live_subscriptions.load(Ordering::SeqCst)
    }

    /// Redeliver every stored signal addressed to `recipient`, simulating
    /// at-least-once delivery. Receivers must already tolerate this.
    pub async fn redeliver_all(&self, recipient: &UserId) {
        let mut inner = self.inner.lock().await;
        let again: Vec<SignalMessage> = inner
            .signals
            .iter()
            .filter(|m| &m.to_id == recipient)
            .cloned()
            .collect();
        for message in again {
            Self::fan_out_signal(&mut inner, message);
        }
    }

    fn guard(&self) -> SubscriptionGuard {
        SubscriptionGuard::new(self.live_subscriptions.clone())
    }

    fn fan_out_signal(inner: &mut Inner, message: SignalMessage) {
        if let Some(subscribers) = inner.signal_subscribers.get_mut(&message.to_id) {
            subscribers.retain(|tx| tx.send(message.clone()).is_ok());
        }
    }

    fn notify_mesh(inner: &mut Inner, id: &CallId, event: MeshEvent) {
        if let Some(subscribers) = inner.mesh_subscribers.get_mut(id) {
            subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }
}

#[async_trait]
impl SignalingStore for MemorySignalingStore {
    async fn insert_session(&self, record: &CallSessionRecord) -> Result<(), SignalingError> {
        let mut inner = self.inner.lock().await;
        inner.sessions.insert(record.id.clone(), record.clone());
        if record.status == CallStatus::Ringing
            && let Some(subscribers) = inner.incoming_subscribers.get_mut(&record.target_id)
        {
            subscribers.retain(|tx| tx.send(record.clone()).is_ok());
        }
        Ok(())
    }

    async fn update_session(
        &self,
        id: &CallId,
        update: SessionUpdate,
    ) -> Result<(), SignalingError> {
        let mut inner = self.inner.lock().await;
        let record = inner
            .sessions
            .get_mut(id)
            .ok_or_else(|| SignalingError::UnknownCall(id.clone()))?;

        if record.status.is_terminal() {
            debug!(
                "ignoring update to terminal call {} ({:?} -> {:?})",
                id, record.status, update.status
            );
            return Ok(());
        }

        record.status = update.status;
        if update.ended_at.is_some() {
            record.ended_at = update.ended_at;
        }
        if update.duration_seconds.is_some() {
            record.duration_seconds = update.duration_seconds;
        }

        let snapshot = record.clone();
        if let Some(watchers) = inner.session_watchers.get_mut(id) {
            watchers.retain(|tx| tx.send(snapshot.clone()).is_ok());
        }
        Ok(())
    }

    async fn fetch_session(
        &self,
        id: &CallId,
    ) -> Result<Option<CallSessionRecord>, SignalingError> {
        Ok(self.inner.lock().await.sessions.get(id).cloned())
    }

    async fn watch_session(&self, id: &CallId) -> Result<SessionWatch, SignalingError> {
        let mut inner = self.inner.lock().await;
        let current = inner
            .sessions
            .get(id)
            .cloned()
            .ok_or_else(|| SignalingError::UnknownCall(id.clone()))?;
        let (tx, rx) = watch::channel(current);
        inner.session_watchers.entry(id.clone()).or_default().push(tx);
        Ok(SessionWatch::new(rx, self.guard()))
    }

    async fn publish_signal(&self, message: &SignalMessage) -> Result<(), SignalingError> {
        let mut inner = self.inner.lock().await;
        inner.signals.push(message.clone());
        Self::fan_out_signal(&mut inner, message.clone());
        Ok(())
    }

    async fn fetch_signals(
        &self,
        call_id: &CallId,
        recipient: &UserId,
    ) -> Result<Vec<SignalMessage>, SignalingError> {
        Ok(self
            .inner
            .lock()
            .await
            .signals
            .iter()
            .filter(|m| &m.call_id == call_id && &m.to_id == recipient)
            .cloned()
            .collect())
    }

    async fn subscribe_signals(
        &self,
        recipient: &UserId,
    ) -> Result<SignalSubscription, SignalingError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .lock()
            .await
            .signal_subscribers
            .entry(recipient.clone())
            .or_default()
            .push(tx);
        Ok(SignalSubscription::new(rx, self.guard()))
    }

    async fn subscribe_incoming_sessions(
        &self,
        target: &UserId,
    ) -> Result<SessionFeed, SignalingError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .lock()
            .await
            .incoming_subscribers
            .entry(target.clone())
            .or_default()
            .push(tx);
        Ok(SessionFeed::new(rx, self.guard()))
    }

    async fn insert_mesh_session(&self, record: &MeshSessionRecord) -> Result<(), SignalingError> {
        let mut inner = self.inner.lock().await;
        inner.mesh_sessions.insert(record.id.clone(), record.clone());
        inner.mesh_members.entry(record.id.clone()).or_default();
        Ok(())
    }

    async fn fetch_mesh_session(
        &self,
        id: &CallId,
    ) -> Result<Option<MeshSessionRecord>, SignalingError> {
        Ok(self.inner.lock().await.mesh_sessions.get(id).cloned())
    }

    async fn join_mesh(&self, id: &CallId, user: &UserId) -> Result<Vec<UserId>, SignalingError> {
        let mut inner = self.inner.lock().await;
        if !inner.mesh_sessions.contains_key(id) {
            return Err(SignalingError::UnknownCall(id.clone()));
        }
        let members = inner.mesh_members.entry(id.clone()).or_default();
        let roster = members.clone();
        if !members.contains(user) {
            members.push(user.clone());
        }
        Self::notify_mesh(&mut inner, id, MeshEvent::Joined(user.clone()));
        Ok(roster)
    }

    async fn leave_mesh(&self, id: &CallId, user: &UserId) -> Result<(), SignalingError> {
        let mut inner = self.inner.lock().await;
        if let Some(members) = inner.mesh_members.get_mut(id) {
            members.retain(|m| m != user);
        }
        Self::notify_mesh(&mut inner, id, MeshEvent::Left(user.clone()));
        Ok(())
    }

    async fn end_mesh(&self, id: &CallId) -> Result<(), SignalingError> {
        let mut inner = self.inner.lock().await;
        inner.mesh_sessions.remove(id);
        inner.mesh_members.remove(id);
        Self::notify_mesh(&mut inner, id, MeshEvent::Ended);
        inner.mesh_subscribers.remove(id);
        Ok(())
    }

    async fn announce_screen_share(
        &self,
        id: &CallId,
        user: &UserId,
        sharing: bool,
    ) -> Result<(), SignalingError> {
        let mut inner = self.inner.lock().await;
        Self::notify_mesh(
            &mut inner,
            id,
            MeshEvent::ScreenShare {
                user_id: user.clone(),
                sharing,
            },
        );
        Ok(())
    }

    async fn subscribe_mesh(&self, id: &CallId) -> Result<MeshFeed, SignalingError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .lock()
            .await
            .mesh_subscribers
            .entry(id.clone())
            .or_default()
            .push(tx);
        Ok(MeshFeed::new(rx, self.guard()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{SdpType, SessionDescription};
    use crate::types::call::MediaKind;

    fn offer(call: &str, from: &str, to: &str) -> SignalMessage {
        SignalMessage::offer(
            CallId::new(call),
            UserId::new(from),
            UserId::new(to),
            SessionDescription {
                kind: SdpType::Offer,
                sdp: "v=0\r\n".to_string(),
            },
        )
    }

    #[tokio::test]
    async fn test_subscription_filters_by_recipient() {
        let store = MemorySignalingStore::new();
        let mut bob_feed = store.subscribe_signals(&UserId::new("bob")).await.unwrap();

        store.publish_signal(&offer("C1", "alice", "bob")).await.unwrap();
        store.publish_signal(&offer("C2", "alice", "carol")).await.unwrap();

        let delivered = bob_feed.recv().await.unwrap();
        assert_eq!(delivered.call_id, CallId::new("C1"));
        assert!(bob_feed.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_fetch_signals_returns_backlog() {
        let store = MemorySignalingStore::new();
        store.publish_signal(&offer("C1", "alice", "bob")).await.unwrap();

        let backlog = store
            .fetch_signals(&CallId::new("C1"), &UserId::new("bob"))
            .await
            .unwrap();
        assert_eq!(backlog.len(), 1);
    }

    #[tokio::test]
    async fn test_terminal_record_absorbs_updates() {
        let store = MemorySignalingStore::new();
        let record = CallSessionRecord::new_ringing(
            CallId::new("C1"),
            UserId::new("alice"),
            UserId::new("bob"),
            MediaKind::Voice,
        );
        store.insert_session(&record).await.unwrap();

        store
            .update_session(&record.id, SessionUpdate::terminal(CallStatus::Missed, None))
            .await
            .unwrap();
        // The callee racing in with a decline must not overwrite the outcome.
        store
            .update_session(
                &record.id,
                SessionUpdate::terminal(CallStatus::Declined, None),
            )
            .await
            .unwrap();

        let stored = store.fetch_session(&record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, CallStatus::Missed);
    }

    #[tokio::test]
    async fn test_incoming_feed_fires_for_target_only() {
        let store = MemorySignalingStore::new();
        let mut feed = store
            .subscribe_incoming_sessions(&UserId::new("bob"))
            .await
            .unwrap();

        let for_bob = CallSessionRecord::new_ringing(
            CallId::new("C1"),
            UserId::new("alice"),
            UserId::new("bob"),
            MediaKind::Voice,
        );
        let for_carol = CallSessionRecord::new_ringing(
            CallId::new("C2"),
            UserId::new("alice"),
            UserId::new("carol"),
            MediaKind::Voice,
        );
        store.insert_session(&for_carol).await.unwrap();
        store.insert_session(&for_bob).await.unwrap();

        let seen = feed.recv().await.unwrap();
        assert_eq!(seen.id, CallId::new("C1"));
    }

    #[tokio::test]
    async fn test_subscription_count_drops_on_close() {
        let store = MemorySignalingStore::new();
        assert_eq!(store.live_subscription_count(), 0);

        let feed = store.subscribe_signals(&UserId::new("bob")).await.unwrap();
        assert_eq!(store.live_subscription_count(), 1);

        drop(feed);
        assert_eq!(store.live_subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_join_mesh_returns_prior_roster() {
        let store = MemorySignalingStore::new();
        let record = MeshSessionRecord::new(
            CallId::new("M1"),
            UserId::new("host"),
            MediaKind::Video,
        );
        store.insert_mesh_session(&record).await.unwrap();

        assert!(store
            .join_mesh(&record.id, &UserId::new("host"))
            .await
            .unwrap()
            .is_empty());
        let roster = store
            .join_mesh(&record.id, &UserId::new("joiner"))
            .await
            .unwrap();
        assert_eq!(roster, vec![UserId::new("host")]);
    }
}
