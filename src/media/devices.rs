//! Capture-device seam over the platform media stack.

use async_trait::async_trait;
use thiserror::Error;

use super::track::LocalStream;
use crate::types::call::MediaKind;

#[derive(Debug, Clone, Error)]
pub enum MediaAcquisitionError {
    #[error("capture permission denied")]
    PermissionDenied,

    #[error("capture device unavailable: {0}")]
    DeviceUnavailable(String),
}

/// Platform capture devices. Implementations hand out [`LocalStream`]s whose
/// tracks the caller then exclusively owns.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Request local capture for a call: a microphone track always, plus the
    /// video source the kind asks for.
    async fn capture(&self, kind: MediaKind) -> Result<LocalStream, MediaAcquisitionError>;

    /// Request a separate display capture for screen sharing.
    async fn capture_display(&self) -> Result<LocalStream, MediaAcquisitionError>;
}
