//! Local track bookkeeping: at most one audio and one video track, each with
//! the sender the native session returned when it was attached.

use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::error::{SessionError, SessionResult};
use crate::media::{LocalTrack, RtpSender, TrackKind};
use crate::native::NativeSession;
use crate::sync::lock;

/// Stream id local tracks are attached under.
pub const LOCAL_STREAM_ID: &str = "local_av_stream";

struct AttachedTrack {
    track: LocalTrack,
    sender: Arc<dyn RtpSender>,
}

#[derive(Default)]
pub struct TrackManager {
    audio: Mutex<Option<AttachedTrack>>,
    video: Mutex<Option<AttachedTrack>>,
}

impl TrackManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, kind: TrackKind) -> &Mutex<Option<AttachedTrack>> {
        match kind {
            TrackKind::Audio => &self.audio,
            TrackKind::Video => &self.video,
        }
    }

    /// Attaches `track` to the native session unless a track of the same kind
    /// is already attached. The slot lock is not held across the native call;
    /// if another track claimed the slot meanwhile, the new sender is removed.
    pub fn add(
        &self,
        native: &dyn NativeSession,
        track: LocalTrack,
    ) -> SessionResult<Arc<dyn RtpSender>> {
        let kind = track.kind();
        if self.is_attached(kind) {
            return Err(SessionError::TrackAlreadyAttached(kind));
        }

        let sender = native.add_track(track.clone(), &[LOCAL_STREAM_ID.to_string()])?;
        let raced = {
            let mut slot = lock(self.slot(kind));
            if slot.is_some() {
                true
            } else {
                *slot = Some(AttachedTrack {
                    track,
                    sender: Arc::clone(&sender),
                });
                false
            }
        };

        if raced {
            if let Err(e) = native.remove_track(&sender) {
                warn!(%kind, error = %e, "native session failed to remove raced sender");
            }
            return Err(SessionError::TrackAlreadyAttached(kind));
        }
        Ok(sender)
    }

    /// Detaches and forgets the track of `kind`, returning it. A no-op when
    /// none is attached.
    pub fn remove(&self, native: Option<&dyn NativeSession>, kind: TrackKind) -> Option<LocalTrack> {
        let attached = lock(self.slot(kind)).take()?;
        if let Some(native) = native {
            if let Err(e) = native.remove_track(&attached.sender) {
                warn!(%kind, error = %e, "native session failed to remove sender");
            }
        }
        Some(attached.track)
    }

    pub fn track(&self, kind: TrackKind) -> Option<LocalTrack> {
        lock(self.slot(kind)).as_ref().map(|a| a.track.clone())
    }

    pub fn sender(&self, kind: TrackKind) -> Option<Arc<dyn RtpSender>> {
        lock(self.slot(kind)).as_ref().map(|a| Arc::clone(&a.sender))
    }

    pub fn is_attached(&self, kind: TrackKind) -> bool {
        lock(self.slot(kind)).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dummy::{DummySession, DummyTrack};
    use crate::media::{AudioFrame, VideoFrame, VideoTrack};

    fn video(id: &str) -> LocalTrack {
        let track: Arc<VideoTrack> = Arc::new(DummyTrack::<VideoFrame>::new(id));
        LocalTrack::Video(track)
    }

    #[test]
    fn test_second_track_of_same_kind_is_rejected() {
        let native = DummySession::new();
        let tracks = TrackManager::new();

        let sender = tracks.add(&*native, video("cam0")).unwrap();
        let err = tracks.add(&*native, video("cam1")).err().unwrap();

        assert!(matches!(err, SessionError::TrackAlreadyAttached(TrackKind::Video)));
        assert_eq!(tracks.track(TrackKind::Video).unwrap().id(), "cam0");
        assert!(Arc::ptr_eq(&tracks.sender(TrackKind::Video).unwrap(), &sender));
        assert_eq!(native.senders().len(), 1);
    }

    #[test]
    fn test_audio_and_video_slots_are_independent() {
        let native = DummySession::new();
        let tracks = TrackManager::new();
        let mic = Arc::new(DummyTrack::<AudioFrame>::new("mic"));

        tracks.add(&*native, video("cam")).unwrap();
        tracks.add(&*native, LocalTrack::Audio(mic)).unwrap();

        assert!(tracks.is_attached(TrackKind::Audio));
        assert!(tracks.is_attached(TrackKind::Video));
        assert_eq!(native.senders().len(), 2);
    }

    #[test]
    fn test_remove_detaches_sender_and_is_idempotent() {
        let native = DummySession::new();
        let tracks = TrackManager::new();
        tracks.add(&*native, video("cam")).unwrap();

        let removed = tracks.remove(Some(&*native), TrackKind::Video);
        assert_eq!(removed.map(|t| t.id()), Some("cam".to_string()));
        assert!(native.senders().is_empty());
        assert!(tracks.remove(Some(&*native), TrackKind::Video).is_none());

        tracks.add(&*native, video("cam2")).unwrap();
        assert_eq!(native.senders().len(), 1);
    }
}
