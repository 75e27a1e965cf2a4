//! Call-related error types.

use thiserror::Error;

use crate::media::MediaAcquisitionError;
use crate::peer::NegotiationError;
use crate::session::InvalidTransition;
use crate::signaling::SignalingError;
use crate::types::call::CallId;

#[derive(Debug, Error)]
pub enum CallError {
    #[error("call not found: {0}")]
    NotFound(CallId),

    #[error("call already exists: {0}")]
    AlreadyExists(CallId),

    #[error("max concurrent calls reached")]
    TooManyCalls,

    #[error("invalid call state transition: {0}")]
    InvalidTransition(#[from] InvalidTransition),

    #[error("media acquisition failed: {0}")]
    Media(#[from] MediaAcquisitionError),

    #[error("signaling delivery failed: {0}")]
    Signaling(#[from] SignalingError),

    #[error("negotiation failed: {0}")]
    Negotiation(#[from] NegotiationError),
}
