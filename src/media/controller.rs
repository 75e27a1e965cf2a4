//! Per-call media ownership: acquisition, toggles, release.

use log::debug;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use super::devices::{MediaAcquisitionError, MediaDevices};
use super::track::{LocalStream, TrackKind};
use crate::types::call::MediaKind;

/// Owns the local capture for one call. Release must happen on every exit
/// path — success, decline, error, timeout — and is idempotent so the
/// session's terminate path can call it unconditionally.
pub struct MediaController {
    devices: Arc<dyn MediaDevices>,
    // std Mutex: never held across an await point, and release() must be
    // callable from synchronous cleanup contexts.
    stream: Mutex<Option<LocalStream>>,
    muted: AtomicBool,
    video_off: AtomicBool,
}

impl MediaController {
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        Self {
            devices,
            stream: Mutex::new(None),
            muted: AtomicBool::new(false),
            video_off: AtomicBool::new(false),
        }
    }

    /// Request local capture for `kind`. A previously held stream is stopped
    /// and replaced.
    pub async fn acquire(&self, kind: MediaKind) -> Result<LocalStream, MediaAcquisitionError> {
        let stream = self.devices.capture(kind).await?;
        debug!(
            "acquired local stream {} ({} tracks)",
            stream.id(),
            stream.tracks().len()
        );

        let mut guard = self.stream.lock().expect("media lock poisoned");
        if let Some(old) = guard.take() {
            old.stop_all();
        }
        *guard = Some(stream.clone());
        self.muted.store(false, Ordering::SeqCst);
        self.video_off.store(!kind.wants_video(), Ordering::SeqCst);
        Ok(stream)
    }

    /// Flip every audio track's enabled flag and return the new muted state.
    /// Two calls restore each track to exactly its prior state.
    pub fn toggle_mute(&self) -> bool {
        self.toggle_tracks(TrackKind::Audio);
        !self.muted.fetch_xor(true, Ordering::SeqCst)
    }

    /// Flip every video track's enabled flag and return the new video-off
    /// state.
    pub fn toggle_video(&self) -> bool {
        self.toggle_tracks(TrackKind::Video);
        !self.video_off.fetch_xor(true, Ordering::SeqCst)
    }

    fn toggle_tracks(&self, kind: TrackKind) {
        let guard = self.stream.lock().expect("media lock poisoned");
        if let Some(stream) = &*guard {
            for track in stream.tracks_of(kind) {
                track.toggle();
            }
        }
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    pub fn is_video_off(&self) -> bool {
        self.video_off.load(Ordering::SeqCst)
    }

    /// Stop every owned track and drop the stream. Safe no-op when nothing
    /// was acquired; safe to call twice.
    pub fn release(&self) {
        let mut guard = self.stream.lock().expect("media lock poisoned");
        if let Some(stream) = guard.take() {
            debug!("releasing local stream {}", stream.id());
            stream.stop_all();
        }
    }

    pub fn current_stream(&self) -> Option<LocalStream> {
        self.stream.lock().expect("media lock poisoned").clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::SimulatedMediaDevices;

    fn controller() -> (Arc<SimulatedMediaDevices>, MediaController) {
        let devices = SimulatedMediaDevices::new();
        let controller = MediaController::new(devices.clone());
        (devices, controller)
    }

    #[tokio::test]
    async fn test_toggle_mute_twice_restores_tracks_exactly() {
        let (_, controller) = controller();
        let stream = controller.acquire(MediaKind::Voice).await.unwrap();

        let originals: Vec<bool> = stream.tracks().iter().map(|t| t.is_enabled()).collect();

        assert!(controller.toggle_mute());
        assert!(!controller.toggle_mute());

        let after: Vec<bool> = stream.tracks().iter().map(|t| t.is_enabled()).collect();
        assert_eq!(originals, after);
    }

    #[tokio::test]
    async fn test_toggle_preserves_mixed_track_states() {
        let (_, controller) = controller();
        let stream = controller.acquire(MediaKind::Video).await.unwrap();

        // Put the video track into a non-default state first.
        let video = stream.tracks_of(TrackKind::Video).next().unwrap().clone();
        video.set_enabled(false);

        controller.toggle_video();
        assert!(video.is_enabled());
        controller.toggle_video();
        assert!(!video.is_enabled());
    }

    #[tokio::test]
    async fn test_release_stops_every_track() {
        let (devices, controller) = controller();
        controller.acquire(MediaKind::Video).await.unwrap();

        controller.release();
        assert!(devices.all_tracks_stopped().await);
    }

    #[tokio::test]
    async fn test_release_without_acquisition_is_noop() {
        let (_, controller) = controller();
        controller.release();
        controller.release();
    }

    #[tokio::test]
    async fn test_reacquire_stops_previous_stream() {
        let (_, controller) = controller();
        let first = controller.acquire(MediaKind::Voice).await.unwrap();
        let second = controller.acquire(MediaKind::Video).await.unwrap();

        assert!(first.all_stopped());
        assert!(!second.all_stopped());
    }

    #[tokio::test]
    async fn test_denied_acquire_leaves_nothing_held() {
        let (devices, controller) = controller();
        devices.deny_capture(true);

        let result = controller.acquire(MediaKind::Voice).await;
        assert!(matches!(result, Err(MediaAcquisitionError::PermissionDenied)));
        assert!(controller.current_stream().is_none());
    }
}
