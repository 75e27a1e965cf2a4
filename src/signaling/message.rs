//! Signal message wire shape and validating decode.

use serde::{Deserialize, Serialize};

use super::SignalingError;
use crate::peer::{IceCandidate, SdpType, SessionDescription};
use crate::types::call::{CallId, UserId};

/// One negotiation step, relayed between exactly two parties. Created once,
/// delivered at least once, never mutated; receivers apply idempotently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalMessage {
    pub call_id: CallId,
    pub from_id: UserId,
    pub to_id: UserId,
    #[serde(flatten)]
    pub body: SignalBody,
}

/// Tagged negotiation payload. The tag is validated against the payload so a
/// mislabeled description is rejected instead of trusted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "kebab-case")]
pub enum SignalBody {
    Offer(SessionDescription),
    Answer(SessionDescription),
    IceCandidate(IceCandidate),
}

impl SignalMessage {
    pub fn offer(
        call_id: CallId,
        from_id: UserId,
        to_id: UserId,
        description: SessionDescription,
    ) -> Self {
        Self {
            call_id,
            from_id,
            to_id,
            body: SignalBody::Offer(description),
        }
    }

    pub fn answer(
        call_id: CallId,
        from_id: UserId,
        to_id: UserId,
        description: SessionDescription,
    ) -> Self {
        Self {
            call_id,
            from_id,
            to_id,
            body: SignalBody::Answer(description),
        }
    }

    pub fn ice_candidate(
        call_id: CallId,
        from_id: UserId,
        to_id: UserId,
        candidate: IceCandidate,
    ) -> Self {
        Self {
            call_id,
            from_id,
            to_id,
            body: SignalBody::IceCandidate(candidate),
        }
    }

    /// Decode one relayed message, rejecting malformed payloads rather than
    /// trusting a cast.
    pub fn decode(value: serde_json::Value) -> Result<Self, SignalingError> {
        let message: SignalMessage =
            serde_json::from_value(value).map_err(|e| SignalingError::Malformed(e.to_string()))?;
        message.validate()?;
        Ok(message)
    }

    pub fn encode(&self) -> Result<serde_json::Value, SignalingError> {
        serde_json::to_value(self).map_err(|e| SignalingError::Malformed(e.to_string()))
    }

    /// Cross-check the tag against the payload it carries.
    pub fn validate(&self) -> Result<(), SignalingError> {
        match &self.body {
            SignalBody::Offer(description) => {
                if description.kind != SdpType::Offer {
                    return Err(SignalingError::Malformed(
                        "offer message carrying a non-offer description".to_string(),
                    ));
                }
                if description.sdp.is_empty() {
                    return Err(SignalingError::Malformed("empty sdp".to_string()));
                }
            }
            SignalBody::Answer(description) => {
                if description.kind != SdpType::Answer {
                    return Err(SignalingError::Malformed(
                        "answer message carrying a non-answer description".to_string(),
                    ));
                }
                if description.sdp.is_empty() {
                    return Err(SignalingError::Malformed("empty sdp".to_string()));
                }
            }
            SignalBody::IceCandidate(candidate) => {
                if candidate.candidate.is_empty() {
                    return Err(SignalingError::Malformed("empty candidate".to_string()));
                }
            }
        }
        Ok(())
    }

    pub fn kind_str(&self) -> &'static str {
        match &self.body {
            SignalBody::Offer(_) => "offer",
            SignalBody::Answer(_) => "answer",
            SignalBody::IceCandidate(_) => "ice-candidate",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn offer_description() -> SessionDescription {
        SessionDescription {
            kind: SdpType::Offer,
            sdp: "v=0\r\n".to_string(),
        }
    }

    #[test]
    fn test_wire_shape_round_trip() {
        let message = SignalMessage::offer(
            CallId::new("C1"),
            UserId::new("alice"),
            UserId::new("bob"),
            offer_description(),
        );

        let value = message.encode().unwrap();
        assert_eq!(value["callId"], "C1");
        assert_eq!(value["fromId"], "alice");
        assert_eq!(value["kind"], "offer");
        assert_eq!(value["payload"]["type"], "offer");

        let decoded = SignalMessage::decode(value).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_candidate_wire_field_names() {
        let message = SignalMessage::ice_candidate(
            CallId::new("C1"),
            UserId::new("alice"),
            UserId::new("bob"),
            IceCandidate {
                candidate: "candidate:1 1 udp 2113937151 192.0.2.1 54400 typ host".to_string(),
                sdp_mid: Some("0".to_string()),
                sdp_m_line_index: Some(0),
            },
        );

        let value = message.encode().unwrap();
        assert_eq!(value["kind"], "ice-candidate");
        assert_eq!(value["payload"]["sdpMid"], "0");
        assert_eq!(value["payload"]["sdpMLineIndex"], 0);
    }

    #[test]
    fn test_candidate_null_mid_allowed() {
        let value = json!({
            "callId": "C1",
            "fromId": "alice",
            "toId": "bob",
            "kind": "ice-candidate",
            "payload": {
                "candidate": "candidate:1 1 udp 1 192.0.2.1 54400 typ host",
                "sdpMid": null,
                "sdpMLineIndex": null,
            },
        });
        let decoded = SignalMessage::decode(value).unwrap();
        assert!(matches!(decoded.body, SignalBody::IceCandidate(ref c) if c.sdp_mid.is_none()));
    }

    #[test]
    fn test_rejects_unknown_kind() {
        let value = json!({
            "callId": "C1",
            "fromId": "alice",
            "toId": "bob",
            "kind": "renegotiate",
            "payload": {},
        });
        assert!(SignalMessage::decode(value).is_err());
    }

    #[test]
    fn test_rejects_mislabeled_description() {
        let value = json!({
            "callId": "C1",
            "fromId": "alice",
            "toId": "bob",
            "kind": "offer",
            "payload": { "type": "answer", "sdp": "v=0\r\n" },
        });
        assert!(matches!(
            SignalMessage::decode(value),
            Err(SignalingError::Malformed(_))
        ));
    }

    #[test]
    fn test_rejects_empty_sdp() {
        let value = json!({
            "callId": "C1",
            "fromId": "alice",
            "toId": "bob",
            "kind": "answer",
            "payload": { "type": "answer", "sdp": "" },
        });
        assert!(SignalMessage::decode(value).is_err());
    }
}
