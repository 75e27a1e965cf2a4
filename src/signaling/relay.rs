//! Per-call signal consumption: ordering, buffering, and dedup rules.
//!
//! The store delivers at-least-once with no cross-sender ordering, so the
//! channel enforces what the session layer needs: a candidate is never
//! surfaced before the remote description of its leg, redelivered
//! descriptions and candidates are dropped, and buffered candidates drain in
//! arrival order the moment their description is surfaced.

use log::debug;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use super::SignalingError;
use super::message::{SignalBody, SignalMessage};
use super::store::{SignalSubscription, SignalingStore};
use crate::peer::{IceCandidate, SessionDescription};
use crate::types::call::{CallId, UserId};

/// A signal the session layer may apply immediately, in the order received.
#[derive(Debug, Clone)]
pub enum SignalEvent {
    RemoteOffer {
        from: UserId,
        description: SessionDescription,
    },
    RemoteAnswer {
        from: UserId,
        description: SessionDescription,
    },
    RemoteCandidate {
        from: UserId,
        candidate: IceCandidate,
    },
}

/// Negotiation state for one sender's leg.
#[derive(Default)]
struct LegState {
    offer_seen: bool,
    answer_seen: bool,
    /// Set once a remote description for this leg has been surfaced;
    /// candidates buffer until then.
    description_surfaced: bool,
    pending: VecDeque<IceCandidate>,
    seen_candidates: HashSet<IceCandidate>,
}

impl LegState {
    fn accept(&mut self, call_id: &CallId, from: &UserId, body: SignalBody, out: &mut VecDeque<SignalEvent>) {
        match body {
            SignalBody::Offer(description) => {
                if self.offer_seen {
                    debug!("call {}: dropping redelivered offer from {}", call_id, from);
                    return;
                }
                self.offer_seen = true;
                out.push_back(SignalEvent::RemoteOffer {
                    from: from.clone(),
                    description,
                });
                self.surface_pending(from, out);
            }
            SignalBody::Answer(description) => {
                if self.answer_seen {
                    debug!("call {}: dropping redelivered answer from {}", call_id, from);
                    return;
                }
                self.answer_seen = true;
                out.push_back(SignalEvent::RemoteAnswer {
                    from: from.clone(),
                    description,
                });
                self.surface_pending(from, out);
            }
            SignalBody::IceCandidate(candidate) => {
                if self.seen_candidates.contains(&candidate) {
                    debug!(
                        "call {}: dropping redelivered candidate from {}",
                        call_id, from
                    );
                    return;
                }
                self.seen_candidates.insert(candidate.clone());
                if self.description_surfaced {
                    out.push_back(SignalEvent::RemoteCandidate {
                        from: from.clone(),
                        candidate,
                    });
                } else {
                    debug!(
                        "call {}: buffering candidate from {} until remote description",
                        call_id, from
                    );
                    self.pending.push_back(candidate);
                }
            }
        }
    }

    fn surface_pending(&mut self, from: &UserId, out: &mut VecDeque<SignalEvent>) {
        self.description_surfaced = true;
        while let Some(candidate) = self.pending.pop_front() {
            out.push_back(SignalEvent::RemoteCandidate {
                from: from.clone(),
                candidate,
            });
        }
    }
}

/// Publishes signals and opens per-call channels for one local user.
#[derive(Clone)]
pub struct SignalingRelay {
    store: Arc<dyn SignalingStore>,
    local_user: UserId,
}

impl SignalingRelay {
    pub fn new(store: Arc<dyn SignalingStore>, local_user: UserId) -> Self {
        Self { store, local_user }
    }

    pub fn local_user(&self) -> &UserId {
        &self.local_user
    }

    /// Validate and durably publish one signal.
    pub async fn publish(&self, message: SignalMessage) -> Result<(), SignalingError> {
        message.validate()?;
        debug!(
            "call {}: publishing {} to {}",
            message.call_id,
            message.kind_str(),
            message.to_id
        );
        self.store.publish_signal(&message).await
    }

    /// Open the channel for one call: subscribe live first, then fold in the
    /// stored backlog so nothing published before subscription is missed.
    /// Overlap between backlog and feed is absorbed by the dedup rules.
    pub async fn open_channel(&self, call_id: &CallId) -> Result<CallChannel, SignalingError> {
        let subscription = self.store.subscribe_signals(&self.local_user).await?;
        let backlog = self.store.fetch_signals(call_id, &self.local_user).await?;

        let mut channel = CallChannel {
            call_id: call_id.clone(),
            subscription,
            legs: HashMap::new(),
            out: VecDeque::new(),
        };
        for message in backlog {
            channel.ingest(message);
        }
        Ok(channel)
    }
}

/// The per-call consumer half. Closing it is mandatory on call end.
pub struct CallChannel {
    call_id: CallId,
    subscription: SignalSubscription,
    legs: HashMap<UserId, LegState>,
    out: VecDeque<SignalEvent>,
}

impl CallChannel {
    fn ingest(&mut self, message: SignalMessage) {
        if message.call_id != self.call_id {
            // Another call's traffic; its own channel consumes it.
            return;
        }
        if message.validate().is_err() {
            debug!("call {}: dropping malformed signal", self.call_id);
            return;
        }
        let from = message.from_id.clone();
        self.legs
            .entry(from.clone())
            .or_default()
            .accept(&self.call_id, &from, message.body, &mut self.out);
    }

    /// Next applicable signal, waiting for delivery when none is queued.
    /// Returns `None` once the underlying feed is gone.
    pub async fn recv(&mut self) -> Option<SignalEvent> {
        loop {
            if let Some(event) = self.out.pop_front() {
                return Some(event);
            }
            match self.subscription.recv().await {
                Some(message) => self.ingest(message),
                None => return None,
            }
        }
    }

    /// Drain whatever has already been delivered without waiting.
    pub fn try_next(&mut self) -> Option<SignalEvent> {
        loop {
            if let Some(event) = self.out.pop_front() {
                return Some(event);
            }
            match self.subscription.try_recv() {
                Some(message) => self.ingest(message),
                None => return None,
            }
        }
    }

    /// Remove and return the observed remote offer, leaving any other queued
    /// events (its candidates among them) in order.
    pub fn take_remote_offer(&mut self) -> Option<(UserId, SessionDescription)> {
        // Pull in anything already delivered first.
        while let Some(message) = self.subscription.try_recv() {
            self.ingest(message);
        }
        let position = self
            .out
            .iter()
            .position(|e| matches!(e, SignalEvent::RemoteOffer { .. }))?;
        match self.out.remove(position)? {
            SignalEvent::RemoteOffer { from, description } => Some((from, description)),
            _ => None,
        }
    }

    /// Candidates currently buffered for `from`'s leg.
    pub fn pending_candidates(&self, from: &UserId) -> usize {
        self.legs.get(from).map(|l| l.pending.len()).unwrap_or(0)
    }

    /// Unsubscribe. Dropping does the same; the explicit call marks the
    /// mandatory cleanup on the session's end path.
    pub fn close(self) {
        debug!("call {}: channel closed", self.call_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::SdpType;
    use crate::signaling::MemorySignalingStore;

    fn description(kind: SdpType) -> SessionDescription {
        SessionDescription {
            kind,
            sdp: "v=0\r\n".to_string(),
        }
    }

    fn candidate(n: u16) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{n} 1 udp 1 127.0.0.1 {} typ host", 40000 + n),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
        }
    }

    async fn relay_pair() -> (Arc<MemorySignalingStore>, SignalingRelay, SignalingRelay) {
        let store = MemorySignalingStore::new();
        let alice = SignalingRelay::new(store.clone(), UserId::new("alice"));
        let bob = SignalingRelay::new(store.clone(), UserId::new("bob"));
        (store, alice, bob)
    }

    #[tokio::test]
    async fn test_candidate_before_offer_is_buffered_then_drained_in_order() {
        let (_, alice, bob) = relay_pair().await;
        let call_id = CallId::new("C1");
        let mut channel = bob.open_channel(&call_id).await.unwrap();

        // Candidates race ahead of the offer's delivery.
        for n in 0..3 {
            alice
                .publish(SignalMessage::ice_candidate(
                    call_id.clone(),
                    UserId::new("alice"),
                    UserId::new("bob"),
                    candidate(n),
                ))
                .await
                .unwrap();
        }
        assert!(channel.try_next().is_none());
        assert_eq!(channel.pending_candidates(&UserId::new("alice")), 3);

        alice
            .publish(SignalMessage::offer(
                call_id.clone(),
                UserId::new("alice"),
                UserId::new("bob"),
                description(SdpType::Offer),
            ))
            .await
            .unwrap();

        assert!(matches!(
            channel.try_next(),
            Some(SignalEvent::RemoteOffer { .. })
        ));
        for n in 0..3 {
            match channel.try_next() {
                Some(SignalEvent::RemoteCandidate { candidate: c, .. }) => {
                    assert_eq!(c, candidate(n));
                }
                other => panic!("expected candidate {n}, got {other:?}"),
            }
        }
        assert!(channel.try_next().is_none());
    }

    #[tokio::test]
    async fn test_redelivered_offer_and_candidate_are_dropped() {
        let (store, alice, bob) = relay_pair().await;
        let call_id = CallId::new("C1");
        let mut channel = bob.open_channel(&call_id).await.unwrap();

        let offer = SignalMessage::offer(
            call_id.clone(),
            UserId::new("alice"),
            UserId::new("bob"),
            description(SdpType::Offer),
        );
        let cand = SignalMessage::ice_candidate(
            call_id.clone(),
            UserId::new("alice"),
            UserId::new("bob"),
            candidate(1),
        );
        alice.publish(offer).await.unwrap();
        alice.publish(cand).await.unwrap();
        store.redeliver_all(&UserId::new("bob")).await;

        assert!(matches!(
            channel.try_next(),
            Some(SignalEvent::RemoteOffer { .. })
        ));
        assert!(matches!(
            channel.try_next(),
            Some(SignalEvent::RemoteCandidate { .. })
        ));
        assert!(channel.try_next().is_none(), "redelivery must be absorbed");
    }

    #[tokio::test]
    async fn test_backlog_visible_to_late_subscriber() {
        let (_, alice, bob) = relay_pair().await;
        let call_id = CallId::new("C1");

        alice
            .publish(SignalMessage::offer(
                call_id.clone(),
                UserId::new("alice"),
                UserId::new("bob"),
                description(SdpType::Offer),
            ))
            .await
            .unwrap();

        // Channel opened only after the offer was published.
        let mut channel = bob.open_channel(&call_id).await.unwrap();
        let (from, desc) = channel.take_remote_offer().unwrap();
        assert_eq!(from, UserId::new("alice"));
        assert_eq!(desc.kind, SdpType::Offer);
    }

    #[tokio::test]
    async fn test_other_calls_traffic_is_ignored() {
        let (_, alice, bob) = relay_pair().await;
        let mut channel = bob.open_channel(&CallId::new("C1")).await.unwrap();

        alice
            .publish(SignalMessage::offer(
                CallId::new("C2"),
                UserId::new("alice"),
                UserId::new("bob"),
                description(SdpType::Offer),
            ))
            .await
            .unwrap();

        assert!(channel.try_next().is_none());
    }

    #[tokio::test]
    async fn test_candidate_after_description_passes_straight_through() {
        let (_, alice, bob) = relay_pair().await;
        let call_id = CallId::new("C1");
        let mut channel = bob.open_channel(&call_id).await.unwrap();

        alice
            .publish(SignalMessage::offer(
                call_id.clone(),
                UserId::new("alice"),
                UserId::new("bob"),
                description(SdpType::Offer),
            ))
            .await
            .unwrap();
        assert!(matches!(
            channel.try_next(),
            Some(SignalEvent::RemoteOffer { .. })
        ));

        alice
            .publish(SignalMessage::ice_candidate(
                call_id.clone(),
                UserId::new("alice"),
                UserId::new("bob"),
                candidate(7),
            ))
            .await
            .unwrap();
        assert!(matches!(
            channel.try_next(),
            Some(SignalEvent::RemoteCandidate { .. })
        ));
        assert_eq!(channel.pending_candidates(&UserId::new("alice")), 0);
    }

    #[tokio::test]
    async fn test_per_sender_legs_are_independent() {
        // Two senders into one mesh channel: one leg's description must not
        // release the other leg's buffered candidates.
        let store = MemorySignalingStore::new();
        let local = SignalingRelay::new(store.clone(), UserId::new("x"));
        let call_id = CallId::new("M1");
        let mut channel = local.open_channel(&call_id).await.unwrap();

        let y = SignalingRelay::new(store.clone(), UserId::new("y"));
        let z = SignalingRelay::new(store.clone(), UserId::new("z"));

        z.publish(SignalMessage::ice_candidate(
            call_id.clone(),
            UserId::new("z"),
            UserId::new("x"),
            candidate(1),
        ))
        .await
        .unwrap();
        y.publish(SignalMessage::offer(
            call_id.clone(),
            UserId::new("y"),
            UserId::new("x"),
            description(SdpType::Offer),
        ))
        .await
        .unwrap();

        assert!(matches!(
            channel.try_next(),
            Some(SignalEvent::RemoteOffer { from, .. }) if from == UserId::new("y")
        ));
        assert!(channel.try_next().is_none());
        assert_eq!(channel.pending_candidates(&UserId::new("z")), 1);
    }
}
