//! Call session state machine.

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::types::call::{CallStatus, EndReason};

/// Current state of one call session on this client.
#[derive(Debug, Clone, Serialize, Default)]
pub enum SessionState {
    /// Created, nothing published yet.
    #[default]
    Idle,
    /// Outgoing call: offer durably published, waiting for a response.
    RingingOut { offer_published_at: DateTime<Utc> },
    /// Incoming call: ringing locally.
    RingingIn { received_at: DateTime<Utc> },
    /// Negotiated and live.
    Active { connected_at: DateTime<Utc> },
    /// Terminal. No transition ever leaves this state.
    Ended {
        reason: EndReason,
        ended_at: DateTime<Utc>,
        duration_seconds: Option<i64>,
    },
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ended { .. })
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active { .. })
    }

    pub fn is_ringing(&self) -> bool {
        matches!(self, Self::RingingOut { .. } | Self::RingingIn { .. })
    }

    pub fn can_answer(&self) -> bool {
        matches!(self, Self::RingingIn { .. })
    }

    pub fn can_decline(&self) -> bool {
        matches!(self, Self::RingingIn { .. })
    }

    /// Record status this state maps onto.
    pub fn status(&self) -> CallStatus {
        match self {
            Self::Idle | Self::RingingOut { .. } | Self::RingingIn { .. } => CallStatus::Ringing,
            Self::Active { .. } => CallStatus::Active,
            Self::Ended { reason, .. } => reason.status(),
        }
    }

    /// Apply a transition, returning the successor state. Terminal states
    /// reject everything.
    pub fn apply(&self, transition: SessionTransition) -> Result<SessionState, InvalidTransition> {
        let next = match (self, &transition) {
            (Self::Idle, SessionTransition::OfferPublished) => Self::RingingOut {
                offer_published_at: Utc::now(),
            },
            (Self::Idle, SessionTransition::OfferReceived) => Self::RingingIn {
                received_at: Utc::now(),
            },
            (Self::RingingOut { .. }, SessionTransition::RemoteAnswered)
            | (Self::RingingIn { .. }, SessionTransition::LocalAnswered) => Self::Active {
                connected_at: Utc::now(),
            },
            (Self::RingingOut { .. }, SessionTransition::RingTimeout) => Self::Ended {
                reason: EndReason::Missed,
                ended_at: Utc::now(),
                duration_seconds: None,
            },
            (Self::RingingIn { .. }, SessionTransition::RingTimeout) => Self::Ended {
                reason: EndReason::Declined,
                ended_at: Utc::now(),
                duration_seconds: None,
            },
            (Self::Active { connected_at }, SessionTransition::End { reason }) => {
                let duration = Utc::now()
                    .signed_duration_since(*connected_at)
                    .num_seconds();
                Self::Ended {
                    reason: *reason,
                    ended_at: Utc::now(),
                    duration_seconds: Some(duration),
                }
            }
            (
                Self::Idle | Self::RingingOut { .. } | Self::RingingIn { .. },
                SessionTransition::End { reason },
            ) => Self::Ended {
                reason: *reason,
                ended_at: Utc::now(),
                duration_seconds: None,
            },
            (current, attempted) => {
                return Err(InvalidTransition {
                    current_state: format!("{:?}", current),
                    attempted: format!("{:?}", attempted),
                });
            }
        };
        Ok(next)
    }
}

/// State transitions for call sessions.
#[derive(Debug, Clone)]
pub enum SessionTransition {
    OfferPublished,
    OfferReceived,
    RemoteAnswered,
    LocalAnswered,
    RingTimeout,
    End { reason: EndReason },
}

#[derive(Debug, Clone, Error)]
#[error("invalid transition {attempted} in state {current_state}")]
pub struct InvalidTransition {
    pub current_state: String,
    pub attempted: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Flow: Idle → RingingOut → Active → Ended, with duration recorded.
    #[test]
    fn test_outgoing_call_flow() {
        let state = SessionState::Idle;

        let state = state.apply(SessionTransition::OfferPublished).unwrap();
        assert!(state.is_ringing());
        assert_eq!(state.status(), CallStatus::Ringing);

        let state = state.apply(SessionTransition::RemoteAnswered).unwrap();
        assert!(state.is_active());

        let state = state
            .apply(SessionTransition::End {
                reason: EndReason::Hangup,
            })
            .unwrap();
        assert!(state.is_terminal());
        assert_eq!(state.status(), CallStatus::Ended);
        if let SessionState::Ended {
            duration_seconds, ..
        } = state
        {
            assert!(duration_seconds.is_some());
        }
    }

    /// Flow: Idle → RingingIn → Active → Ended.
    #[test]
    fn test_incoming_call_flow() {
        let state = SessionState::Idle
            .apply(SessionTransition::OfferReceived)
            .unwrap();
        assert!(state.can_answer());
        assert!(state.can_decline());

        let state = state.apply(SessionTransition::LocalAnswered).unwrap();
        assert!(state.is_active());

        let state = state
            .apply(SessionTransition::End {
                reason: EndReason::RemoteHangup,
            })
            .unwrap();
        assert!(state.is_terminal());
    }

    #[test]
    fn test_ring_timeout_outgoing_is_missed() {
        let state = SessionState::Idle
            .apply(SessionTransition::OfferPublished)
            .unwrap()
            .apply(SessionTransition::RingTimeout)
            .unwrap();
        assert_eq!(state.status(), CallStatus::Missed);
    }

    #[test]
    fn test_ring_timeout_incoming_is_auto_declined() {
        let state = SessionState::Idle
            .apply(SessionTransition::OfferReceived)
            .unwrap()
            .apply(SessionTransition::RingTimeout)
            .unwrap();
        assert_eq!(state.status(), CallStatus::Declined);
    }

    #[test]
    fn test_remote_decline_ends_outgoing_ring() {
        let state = SessionState::Idle
            .apply(SessionTransition::OfferPublished)
            .unwrap()
            .apply(SessionTransition::End {
                reason: EndReason::RemoteDeclined,
            })
            .unwrap();
        assert_eq!(state.status(), CallStatus::Declined);
        if let SessionState::Ended {
            duration_seconds, ..
        } = state
        {
            assert!(duration_seconds.is_none(), "never active, no duration");
        }
    }

    /// Caller cancelling before an answer is a legal ringing → ended edge.
    #[test]
    fn test_hangup_while_ringing_out() {
        let state = SessionState::Idle
            .apply(SessionTransition::OfferPublished)
            .unwrap()
            .apply(SessionTransition::End {
                reason: EndReason::Hangup,
            })
            .unwrap();
        assert_eq!(state.status(), CallStatus::Ended);
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        assert!(SessionState::Idle
            .apply(SessionTransition::RemoteAnswered)
            .is_err());
        assert!(SessionState::Idle
            .apply(SessionTransition::RingTimeout)
            .is_err());

        let ringing_out = SessionState::Idle
            .apply(SessionTransition::OfferPublished)
            .unwrap();
        assert!(ringing_out
            .apply(SessionTransition::LocalAnswered)
            .is_err());
    }

    #[test]
    fn test_terminal_state_rejects_everything() {
        let ended = SessionState::Idle
            .apply(SessionTransition::OfferReceived)
            .unwrap()
            .apply(SessionTransition::End {
                reason: EndReason::Declined,
            })
            .unwrap();

        assert!(ended.apply(SessionTransition::LocalAnswered).is_err());
        assert!(ended.apply(SessionTransition::RingTimeout).is_err());
        assert!(ended
            .apply(SessionTransition::End {
                reason: EndReason::Hangup,
            })
            .is_err());
    }

    /// Only the documented edges exist: ringing → {active, declined, missed,
    /// ended} and active → ended.
    #[test]
    fn test_status_edges_are_the_documented_ones() {
        let transitions = [
            SessionTransition::RemoteAnswered,
            SessionTransition::LocalAnswered,
            SessionTransition::RingTimeout,
            SessionTransition::End {
                reason: EndReason::Hangup,
            },
            SessionTransition::End {
                reason: EndReason::RemoteDeclined,
            },
        ];

        let starts = [
            SessionState::Idle
                .apply(SessionTransition::OfferPublished)
                .unwrap(),
            SessionState::Idle
                .apply(SessionTransition::OfferReceived)
                .unwrap(),
        ];

        for start in &starts {
            for transition in &transitions {
                if let Ok(next) = start.apply(transition.clone()) {
                    match (start.status(), next.status()) {
                        (CallStatus::Ringing, CallStatus::Active)
                        | (CallStatus::Ringing, CallStatus::Declined)
                        | (CallStatus::Ringing, CallStatus::Missed)
                        | (CallStatus::Ringing, CallStatus::Ended) => {}
                        (from, to) => panic!("unexpected edge {from:?} -> {to:?}"),
                    }
                }
            }
        }

        let active = SessionState::Idle
            .apply(SessionTransition::OfferPublished)
            .unwrap()
            .apply(SessionTransition::RemoteAnswered)
            .unwrap();
        for transition in &transitions {
            if let Ok(next) = active.apply(transition.clone()) {
                assert_eq!(next.status(), CallStatus::Ended);
            }
        }
    }
}
