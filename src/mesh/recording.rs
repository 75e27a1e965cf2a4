//! Audio-mix recording for mesh sessions.

use chrono::{DateTime, Utc};

/// Mixes every participant's audio into a single destination. Only the
/// bookkeeping lives here — which tracks fed the mix and when — since the
/// actual mixing happens in the platform's audio graph.
pub struct MixRecorder {
    started_at: DateTime<Utc>,
    source_track_ids: Vec<String>,
}

impl MixRecorder {
    pub fn start(source_track_ids: Vec<String>) -> Self {
        Self {
            started_at: Utc::now(),
            source_track_ids,
        }
    }

    /// A participant's audio track joined the mix mid-recording.
    pub fn add_source(&mut self, track_id: String) {
        if !self.source_track_ids.contains(&track_id) {
            self.source_track_ids.push(track_id);
        }
    }

    pub fn remove_source(&mut self, track_id: &str) {
        self.source_track_ids.retain(|id| id != track_id);
    }

    pub fn source_count(&self) -> usize {
        self.source_track_ids.len()
    }

    pub fn finish(self) -> RecordingArtifact {
        RecordingArtifact {
            source_track_ids: self.source_track_ids,
            started_at: self.started_at,
            stopped_at: Utc::now(),
        }
    }
}

/// What a finished recording produced.
#[derive(Debug, Clone)]
pub struct RecordingArtifact {
    pub source_track_ids: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub stopped_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sources_are_deduplicated() {
        let mut recorder = MixRecorder::start(vec!["a".to_string()]);
        recorder.add_source("a".to_string());
        recorder.add_source("b".to_string());
        assert_eq!(recorder.source_count(), 2);

        recorder.remove_source("a");
        let artifact = recorder.finish();
        assert_eq!(artifact.source_track_ids, vec!["b".to_string()]);
    }
}
