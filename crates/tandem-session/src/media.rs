//! Media handles exchanged with the native session: tracks, streams, senders,
//! and the decoded frames their sinks receive.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

/// One decoded I420 video frame.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    pub data_y: Bytes,
    pub data_u: Bytes,
    pub data_v: Bytes,
    pub stride_y: u32,
    pub stride_u: u32,
    pub stride_v: u32,
}

impl VideoFrame {
    /// Converts to 32-bit ARGB using BT.601 limited-range coefficients.
    /// Returns `None` when a plane is too short for the frame geometry.
    pub fn to_argb(&self) -> Option<ArgbFrame> {
        let (width, height) = (self.width as usize, self.height as usize);
        let (stride_y, stride_u, stride_v) = (
            self.stride_y as usize,
            self.stride_u as usize,
            self.stride_v as usize,
        );
        let chroma_rows = height.div_ceil(2);
        let chroma_cols = width.div_ceil(2);
        if width == 0
            || height == 0
            || stride_y < width
            || stride_u < chroma_cols
            || stride_v < chroma_cols
            || self.data_y.len() < stride_y * (height - 1) + width
            || self.data_u.len() < stride_u * (chroma_rows - 1) + chroma_cols
            || self.data_v.len() < stride_v * (chroma_rows - 1) + chroma_cols
        {
            return None;
        }

        let stride = width * 4;
        let mut data = Vec::with_capacity(stride * height);
        for row in 0..height {
            for col in 0..width {
                let c = i32::from(self.data_y[row * stride_y + col]) - 16;
                let d = i32::from(self.data_u[(row / 2) * stride_u + col / 2]) - 128;
                let e = i32::from(self.data_v[(row / 2) * stride_v + col / 2]) - 128;
                let r = clamp_channel((298 * c + 409 * e + 128) >> 8);
                let g = clamp_channel((298 * c - 100 * d - 208 * e + 128) >> 8);
                let b = clamp_channel((298 * c + 516 * d + 128) >> 8);
                data.extend_from_slice(&[b, g, r, 0xff]);
            }
        }

        Some(ArgbFrame {
            width: self.width,
            height: self.height,
            data: Bytes::from(data),
            stride: stride as u32,
        })
    }
}

fn clamp_channel(value: i32) -> u8 {
    value.clamp(0, 255) as u8
}

/// One 32-bit ARGB video frame. Pixels are stored little-endian, so each
/// pixel's bytes are B, G, R, A in memory.
#[derive(Debug, Clone)]
pub struct ArgbFrame {
    pub width: u32,
    pub height: u32,
    pub data: Bytes,
    pub stride: u32,
}

/// One block of decoded, interleaved PCM audio.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub data: Bytes,
    pub bits_per_sample: u32,
    pub sample_rate: u32,
    pub channels: u32,
    pub frames: u32,
}

/// Receives frames from a track.
pub trait FrameSink<F>: Send + Sync {
    fn on_frame(&self, frame: &F);
}

/// A media track owned by the native session's pipeline.
pub trait MediaTrack<F>: Send + Sync {
    fn id(&self) -> String;
    fn add_sink(&self, sink: Arc<dyn FrameSink<F>>);
    fn remove_sink(&self, sink: &Arc<dyn FrameSink<F>>);
}

pub type VideoTrack = dyn MediaTrack<VideoFrame>;
pub type AudioTrack = dyn MediaTrack<AudioFrame>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

/// A local track handed to the native session for sending.
#[derive(Clone)]
pub enum LocalTrack {
    Audio(Arc<AudioTrack>),
    Video(Arc<VideoTrack>),
}

impl LocalTrack {
    pub fn kind(&self) -> TrackKind {
        match self {
            LocalTrack::Audio(_) => TrackKind::Audio,
            LocalTrack::Video(_) => TrackKind::Video,
        }
    }

    pub fn id(&self) -> String {
        match self {
            LocalTrack::Audio(track) => track.id(),
            LocalTrack::Video(track) => track.id(),
        }
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("kind", &self.kind())
            .field("id", &self.id())
            .finish()
    }
}

/// Native handle for a track that is attached to and sent by the session.
pub trait RtpSender: Send + Sync {
    fn id(&self) -> String;
}

/// A stream of remote media reported by the native session.
pub trait MediaStream: Send + Sync {
    fn id(&self) -> String;
    fn audio_tracks(&self) -> Vec<Arc<AudioTrack>>;
    fn video_tracks(&self) -> Vec<Arc<VideoTrack>>;
}

/// Identity comparison for trait objects, ignoring vtable pointers.
pub(crate) fn same_object<T: ?Sized, U: ?Sized>(a: &Arc<T>, b: &Arc<U>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uniform_frame(width: u32, height: u32, y: u8, u: u8, v: u8) -> VideoFrame {
        let chroma_w = width.div_ceil(2);
        let chroma_h = height.div_ceil(2);
        VideoFrame {
            width,
            height,
            data_y: Bytes::from(vec![y; (width * height) as usize]),
            data_u: Bytes::from(vec![u; (chroma_w * chroma_h) as usize]),
            data_v: Bytes::from(vec![v; (chroma_w * chroma_h) as usize]),
            stride_y: width,
            stride_u: chroma_w,
            stride_v: chroma_w,
        }
    }

    #[test]
    fn test_argb_conversion_of_black_and_white() {
        let black = uniform_frame(2, 2, 16, 128, 128).to_argb().unwrap();
        assert_eq!(black.stride, 8);
        assert_eq!(black.data.len(), 16);
        assert_eq!(&black.data[..4], &[0u8, 0, 0, 0xff]);

        let white = uniform_frame(3, 3, 235, 128, 128).to_argb().unwrap();
        assert_eq!((white.width, white.height), (3, 3));
        assert!(white.data.chunks(4).all(|px| px == [255u8, 255, 255, 0xff]));
    }

    #[test]
    fn test_argb_conversion_of_saturated_red() {
        // BT.601 red: Y=81, U=90, V=240
        let red = uniform_frame(2, 2, 81, 90, 240).to_argb().unwrap();
        let px = &red.data[..4];
        assert!(px[2] >= 250, "red channel {}", px[2]);
        assert!(px[1] <= 5, "green channel {}", px[1]);
        assert!(px[0] <= 5, "blue channel {}", px[0]);
    }

    #[test]
    fn test_argb_conversion_rejects_short_planes() {
        let mut frame = uniform_frame(4, 4, 16, 128, 128);
        frame.data_v = Bytes::from_static(&[128]);
        assert!(frame.to_argb().is_none());
        assert!(uniform_frame(0, 0, 16, 128, 128).to_argb().is_none());
    }
}
