//! Video recording session state machine.
//!
//! `Idle -> Recording <-> Paused -> Idle`. Chunks are buffered in
//! memory while a session is live and flushed into a single artifact
//! on stop. The hard duration timeout lives in the scheduler; the
//! recorder itself only tracks state.

use std::sync::{Arc, Mutex};

use crate::storage::{Artifact, ArtifactKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    Idle,
    Recording,
    Paused,
}

struct Session {
    owner_id: String,
    chunks: Vec<Vec<u8>>,
}

struct RecorderInner {
    state: RecorderState,
    session: Option<Session>,
}

/// Buffering recorder for one video session at a time.
#[derive(Clone)]
pub struct VideoRecorder {
    inner: Arc<Mutex<RecorderInner>>,
}

impl VideoRecorder {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(RecorderInner {
                state: RecorderState::Idle,
                session: None,
            })),
        }
    }

    pub fn state(&self) -> RecorderState {
        self.inner.lock().unwrap().state
    }

    /// Begin a session. Returns false if one is already live.
    pub fn start(&self, owner_id: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != RecorderState::Idle {
            return false;
        }
        inner.state = RecorderState::Recording;
        inner.session = Some(Session {
            owner_id: owner_id.to_string(),
            chunks: Vec::new(),
        });
        true
    }

    /// Pause a live session. No-op unless currently recording.
    pub fn pause(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != RecorderState::Recording {
            return false;
        }
        inner.state = RecorderState::Paused;
        true
    }

    /// Resume a paused session. No-op unless currently paused.
    pub fn resume(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != RecorderState::Paused {
            return false;
        }
        inner.state = RecorderState::Recording;
        true
    }

    /// Append a chunk. Dropped while paused or idle.
    pub fn push_chunk(&self, bytes: Vec<u8>) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != RecorderState::Recording {
            return false;
        }
        if let Some(session) = inner.session.as_mut() {
            session.chunks.push(bytes);
            return true;
        }
        false
    }

    /// End the session, flushing buffered chunks into one artifact.
    ///
    /// Returns `None` when idle or when nothing was buffered.
    pub fn stop(&self) -> Option<Artifact> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == RecorderState::Idle {
            return None;
        }
        inner.state = RecorderState::Idle;
        let session = inner.session.take()?;
        if session.chunks.is_empty() {
            return None;
        }
        let payload: Vec<u8> = session.chunks.concat();
        Some(Artifact::new(
            &session.owner_id,
            ArtifactKind::Video,
            payload,
        ))
    }
}

impl Default for VideoRecorder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_transitions() {
        let rec = VideoRecorder::new();
        assert_eq!(rec.state(), RecorderState::Idle);

        assert!(rec.start("u1"));
        assert_eq!(rec.state(), RecorderState::Recording);
        // Second start is a no-op.
        assert!(!rec.start("u1"));

        assert!(rec.pause());
        assert_eq!(rec.state(), RecorderState::Paused);
        assert!(!rec.pause());

        assert!(rec.resume());
        assert_eq!(rec.state(), RecorderState::Recording);
        assert!(!rec.resume());
    }

    #[test]
    fn test_stop_flushes_chunks_into_one_artifact() {
        let rec = VideoRecorder::new();
        rec.start("u1");
        rec.push_chunk(vec![1, 2]);
        rec.push_chunk(vec![3]);

        let artifact = rec.stop().expect("buffered session");
        assert_eq!(artifact.owner_id, "u1");
        assert_eq!(artifact.kind, ArtifactKind::Video);
        assert_eq!(artifact.payload, vec![1, 2, 3]);
        assert_eq!(rec.state(), RecorderState::Idle);
    }

    #[test]
    fn test_chunks_dropped_while_paused() {
        let rec = VideoRecorder::new();
        rec.start("u1");
        rec.push_chunk(vec![1]);
        rec.pause();
        assert!(!rec.push_chunk(vec![2]));
        rec.resume();
        rec.push_chunk(vec![3]);

        let artifact = rec.stop().unwrap();
        assert_eq!(artifact.payload, vec![1, 3]);
    }

    #[test]
    fn test_stop_without_session_or_chunks() {
        let rec = VideoRecorder::new();
        assert!(rec.stop().is_none());

        rec.start("u1");
        // Nothing buffered, nothing flushed.
        assert!(rec.stop().is_none());
        assert_eq!(rec.state(), RecorderState::Idle);

        // A fresh session can start after stop.
        assert!(rec.start("u1"));
    }
}
