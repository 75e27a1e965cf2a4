//! Track and stream handles for locally captured media.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;

use crate::types::call::random_hex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// Where a track's frames come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackSource {
    Microphone,
    Camera,
    Display,
}

/// One locally captured track. Exclusively owned by the client that acquired
/// it; stopping is permanent.
#[derive(Debug)]
pub struct LocalTrack {
    id: String,
    kind: TrackKind,
    source: TrackSource,
    enabled: AtomicBool,
    stopped: watch::Sender<bool>,
}

impl LocalTrack {
    pub fn new(kind: TrackKind, source: TrackSource) -> Arc<Self> {
        let (stopped, _) = watch::channel(false);
        Arc::new(Self {
            id: random_hex(16),
            kind,
            source,
            enabled: AtomicBool::new(true),
            stopped,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn source(&self) -> TrackSource {
        self.source
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Flip the enabled flag and return the new value.
    pub fn toggle(&self) -> bool {
        // fetch_xor flips atomically; returns the previous value.
        !self.enabled.fetch_xor(true, Ordering::SeqCst)
    }

    /// Permanently stop the track. Idempotent.
    pub fn stop(&self) {
        self.stopped.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.stopped.borrow()
    }

    /// Watch that resolves to `true` when the track stops, including stops
    /// originating outside this crate (e.g. the OS ending a display capture).
    pub fn stopped(&self) -> watch::Receiver<bool> {
        self.stopped.subscribe()
    }
}

/// A group of tracks acquired together.
#[derive(Debug, Clone)]
pub struct LocalStream {
    id: String,
    tracks: Vec<Arc<LocalTrack>>,
}

impl LocalStream {
    pub fn new(tracks: Vec<Arc<LocalTrack>>) -> Self {
        Self {
            id: random_hex(16),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[Arc<LocalTrack>] {
        &self.tracks
    }

    pub fn tracks_of(&self, kind: TrackKind) -> impl Iterator<Item = &Arc<LocalTrack>> {
        self.tracks.iter().filter(move |t| t.kind() == kind)
    }

    pub fn has_video(&self) -> bool {
        self.tracks_of(TrackKind::Video).next().is_some()
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }

    pub fn all_stopped(&self) -> bool {
        self.tracks.iter().all(|t| t.is_stopped())
    }
}

/// A remote participant's track as surfaced by a peer connection. Read-only
/// for the receiver.
#[derive(Debug, Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toggle_flips_and_reports_new_state() {
        let track = LocalTrack::new(TrackKind::Audio, TrackSource::Microphone);
        assert!(track.is_enabled());

        assert!(!track.toggle());
        assert!(!track.is_enabled());

        assert!(track.toggle());
        assert!(track.is_enabled());
    }

    #[test]
    fn test_stop_is_permanent_and_idempotent() {
        let track = LocalTrack::new(TrackKind::Video, TrackSource::Camera);
        assert!(!track.is_stopped());

        track.stop();
        track.stop();
        assert!(track.is_stopped());
    }

    #[tokio::test]
    async fn test_stopped_watch_fires() {
        let track = LocalTrack::new(TrackKind::Video, TrackSource::Display);
        let mut watch = track.stopped();

        track.stop();
        watch.wait_for(|stopped| *stopped).await.unwrap();
    }

    #[test]
    fn test_stream_stop_all() {
        let stream = LocalStream::new(vec![
            LocalTrack::new(TrackKind::Audio, TrackSource::Microphone),
            LocalTrack::new(TrackKind::Video, TrackSource::Camera),
        ]);
        assert!(!stream.all_stopped());

        stream.stop_all();
        assert!(stream.all_stopped());
    }
}
