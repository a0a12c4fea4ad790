//! Frame sink adapters.
//!
//! The coordinator owns one adapter per direction and media kind. Each adapter
//! is attached as a sink to the matching track and forwards every frame to
//! the callback the caller registered, holding nothing beyond the current frame.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::media::{ArgbFrame, AudioFrame, FrameSink, VideoFrame};
use crate::sync::lock;

pub type FrameCallback<F> = Arc<dyn Fn(&F) + Send + Sync>;
pub type VideoFrameCallback = FrameCallback<VideoFrame>;
pub type ArgbFrameCallback = FrameCallback<ArgbFrame>;
pub type AudioFrameCallback = FrameCallback<AudioFrame>;

pub struct FrameSinkAdapter<F> {
    callback: Mutex<Option<FrameCallback<F>>>,
    forwarded: AtomicU64,
}

pub type AudioFrameObserver = FrameSinkAdapter<AudioFrame>;

impl<F> Default for FrameSinkAdapter<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F> FrameSinkAdapter<F> {
    pub fn new() -> Self {
        Self {
            callback: Mutex::new(None),
            forwarded: AtomicU64::new(0),
        }
    }

    /// Replaces the frame callback; `None` stops forwarding.
    pub fn set_callback(&self, callback: Option<FrameCallback<F>>) {
        *lock(&self.callback) = callback;
    }

    pub fn has_callback(&self) -> bool {
        lock(&self.callback).is_some()
    }

    /// Frames handed to a callback so far.
    pub fn forwarded_frames(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    fn forward(&self, frame: &F) {
        let callback = lock(&self.callback).clone();
        if let Some(callback) = callback {
            callback(frame);
            self.forwarded.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl<F> FrameSink<F> for FrameSinkAdapter<F> {
    fn on_frame(&self, frame: &F) {
        self.forward(frame);
    }
}

impl<F> fmt::Debug for FrameSinkAdapter<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameSinkAdapter")
            .field("has_callback", &self.has_callback())
            .field("forwarded", &self.forwarded_frames())
            .finish()
    }
}

/// Video sink with an I420 and an ARGB callback slot. Frames arrive as I420
/// and are converted only while an ARGB callback is registered.
#[derive(Debug, Default)]
pub struct VideoFrameObserver {
    i420: FrameSinkAdapter<VideoFrame>,
    argb: FrameSinkAdapter<ArgbFrame>,
}

impl VideoFrameObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_callback(&self, callback: Option<VideoFrameCallback>) {
        self.i420.set_callback(callback);
    }

    pub fn set_argb_callback(&self, callback: Option<ArgbFrameCallback>) {
        self.argb.set_callback(callback);
    }

    pub fn has_callback(&self) -> bool {
        self.i420.has_callback() || self.argb.has_callback()
    }

    pub fn forwarded_frames(&self) -> u64 {
        self.i420.forwarded_frames()
    }

    pub fn forwarded_argb_frames(&self) -> u64 {
        self.argb.forwarded_frames()
    }

    pub fn clear_callbacks(&self) {
        self.i420.set_callback(None);
        self.argb.set_callback(None);
    }
}

impl FrameSink<VideoFrame> for VideoFrameObserver {
    fn on_frame(&self, frame: &VideoFrame) {
        self.i420.on_frame(frame);
        if !self.argb.has_callback() {
            return;
        }
        match frame.to_argb() {
            Some(argb) => self.argb.on_frame(&argb),
            None => debug!(
                width = frame.width,
                height = frame.height,
                "dropping video frame with inconsistent planes"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn audio_frame(frames: u32) -> AudioFrame {
        AudioFrame {
            data: Bytes::from(vec![0u8; frames as usize * 4]),
            bits_per_sample: 16,
            sample_rate: 48_000,
            channels: 2,
            frames,
        }
    }

    #[test]
    fn test_frames_without_callback_are_dropped() {
        let adapter = AudioFrameObserver::new();
        adapter.on_frame(&audio_frame(480));
        assert_eq!(adapter.forwarded_frames(), 0);
    }

    #[test]
    fn test_frames_reach_latest_callback() {
        let adapter = AudioFrameObserver::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        adapter.set_callback(Some(Arc::new(move |frame: &AudioFrame| {
            sink.lock().unwrap().push(frame.frames);
        })));

        adapter.on_frame(&audio_frame(480));
        adapter.on_frame(&audio_frame(960));
        adapter.set_callback(None);
        adapter.on_frame(&audio_frame(10));

        assert_eq!(*seen.lock().unwrap(), vec![480, 960]);
        assert_eq!(adapter.forwarded_frames(), 2);
        assert!(!adapter.has_callback());
    }

    fn gray_frame() -> VideoFrame {
        VideoFrame {
            width: 2,
            height: 2,
            data_y: Bytes::from_static(&[126; 4]),
            data_u: Bytes::from_static(&[128]),
            data_v: Bytes::from_static(&[128]),
            stride_y: 2,
            stride_u: 1,
            stride_v: 1,
        }
    }

    #[test]
    fn test_video_observer_feeds_both_formats() {
        let observer = VideoFrameObserver::new();
        let i420 = Arc::new(Mutex::new(Vec::new()));
        let argb = Arc::new(Mutex::new(Vec::new()));
        let (i, a) = (Arc::clone(&i420), Arc::clone(&argb));
        observer.set_callback(Some(Arc::new(move |frame: &VideoFrame| {
            i.lock().unwrap().push(frame.width);
        })));
        observer.set_argb_callback(Some(Arc::new(move |frame: &ArgbFrame| {
            a.lock().unwrap().push(frame.data.len());
        })));

        observer.on_frame(&gray_frame());

        assert_eq!(*i420.lock().unwrap(), vec![2]);
        assert_eq!(*argb.lock().unwrap(), vec![16]);
        assert_eq!(observer.forwarded_argb_frames(), 1);
    }

    #[test]
    fn test_argb_only_observer_skips_malformed_frames() {
        let observer = VideoFrameObserver::new();
        observer.set_argb_callback(Some(Arc::new(|_: &ArgbFrame| {})));
        let mut frame = gray_frame();
        frame.data_y = Bytes::from_static(&[126]);

        observer.on_frame(&frame);

        assert_eq!(observer.forwarded_argb_frames(), 0);
        assert_eq!(observer.forwarded_frames(), 0);
        observer.clear_callbacks();
        assert!(!observer.has_callback());
    }
}
