//! In-process capture devices for tests and the demo binary.

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::Mutex;

use super::devices::{MediaAcquisitionError, MediaDevices};
use super::track::{LocalStream, LocalTrack, TrackKind, TrackSource};
use crate::types::call::MediaKind;

/// Capture devices that synthesize tracks instead of touching hardware.
/// Denial is configurable so acquisition-failure paths can be exercised, and
/// every stream ever issued is retained so tests can assert release.
#[derive(Default)]
pub struct SimulatedMediaDevices {
    deny_capture: AtomicBool,
    deny_display: AtomicBool,
    acquisitions: AtomicUsize,
    issued: Mutex<Vec<LocalStream>>,
}

impl SimulatedMediaDevices {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make subsequent `capture` calls fail with a permission denial.
    pub fn deny_capture(&self, deny: bool) {
        self.deny_capture.store(deny, Ordering::SeqCst);
    }

    /// Make subsequent `capture_display` calls fail with a permission denial.
    pub fn deny_display(&self, deny: bool) {
        self.deny_display.store(deny, Ordering::SeqCst);
    }

    /// Number of successful acquisitions so far.
    pub fn acquisition_count(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }

    /// Every stream this device ever handed out.
    pub async fn issued_streams(&self) -> Vec<LocalStream> {
        self.issued.lock().await.clone()
    }

    /// Whether every track ever issued has been stopped.
    pub async fn all_tracks_stopped(&self) -> bool {
        self.issued.lock().await.iter().all(|s| s.all_stopped())
    }

    async fn issue(&self, tracks: Vec<Arc<LocalTrack>>) -> LocalStream {
        let stream = LocalStream::new(tracks);
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        self.issued.lock().await.push(stream.clone());
        stream
    }
}

#[async_trait]
impl MediaDevices for SimulatedMediaDevices {
    async fn capture(&self, kind: MediaKind) -> Result<LocalStream, MediaAcquisitionError> {
        if self.deny_capture.load(Ordering::SeqCst) {
            return Err(MediaAcquisitionError::PermissionDenied);
        }

        let mut tracks = vec![LocalTrack::new(TrackKind::Audio, TrackSource::Microphone)];
        match kind {
            MediaKind::Voice => {}
            MediaKind::Video => {
                tracks.push(LocalTrack::new(TrackKind::Video, TrackSource::Camera));
            }
            MediaKind::ScreenShare => {
                tracks.push(LocalTrack::new(TrackKind::Video, TrackSource::Display));
            }
        }
        Ok(self.issue(tracks).await)
    }

    async fn capture_display(&self) -> Result<LocalStream, MediaAcquisitionError> {
        if self.deny_display.load(Ordering::SeqCst) {
            return Err(MediaAcquisitionError::PermissionDenied);
        }
        let tracks = vec![LocalTrack::new(TrackKind::Video, TrackSource::Display)];
        Ok(self.issue(tracks).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_capture_shapes() {
        let devices = SimulatedMediaDevices::new();

        let voice = devices.capture(MediaKind::Voice).await.unwrap();
        assert_eq!(voice.tracks().len(), 1);
        assert!(!voice.has_video());

        let video = devices.capture(MediaKind::Video).await.unwrap();
        assert_eq!(video.tracks().len(), 2);
        assert!(video.has_video());

        assert_eq!(devices.acquisition_count(), 2);
    }

    #[tokio::test]
    async fn test_denied_capture() {
        let devices = SimulatedMediaDevices::new();
        devices.deny_capture(true);

        let result = devices.capture(MediaKind::Voice).await;
        assert!(matches!(result, Err(MediaAcquisitionError::PermissionDenied)));
        assert_eq!(devices.acquisition_count(), 0);
    }
}
