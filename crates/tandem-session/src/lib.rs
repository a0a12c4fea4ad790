//! Peer session coordination.
//!
//! [`PeerSession`] owns one native peer-to-peer session and relays its
//! signaling events (local descriptions, ICE candidates, connection and
//! renegotiation signals) into per-event callback slots. It also keeps the
//! local audio/video tracks, the remote streams, and a registry of data
//! channels addressable by id and by label.
//!
//! The negotiation engine itself stays behind the [`NativeSession`] trait.
//! [`dummy::DummySession`] implements it in-process.

#![forbid(unsafe_code)]

pub mod callbacks;
pub mod channels;
pub mod dummy;
pub mod error;
pub mod media;
pub mod native;
pub mod session;
pub mod sinks;
mod sync;
pub mod tracks;

pub use callbacks::{Callback, CallbackRegistry, EventKind, NegotiationStage, SignalingEvent};
pub use channels::{DataChannelCallbacks, DataChannelObserver, DataChannelRegistry};
pub use error::{SessionError, SessionResult};
pub use media::{
    ArgbFrame, AudioFrame, AudioTrack, FrameSink, LocalTrack, MediaStream, MediaTrack, RtpSender,
    TrackKind, VideoFrame, VideoTrack,
};
pub use native::{
    DataBuffer, DataChannelEvents, DataChannelInit, DataChannelState, DescriptionObserver,
    IceConnectionState, IceGatheringState, NativeDataChannel, NativeError, NativeResult,
    NativeSession, SessionObserver, SetDescriptionDone, SignalingState,
};
pub use session::{PeerSession, SessionStates};
pub use sinks::{AudioFrameObserver, FrameSinkAdapter, VideoFrameObserver};
pub use tandem_common::{IceCandidate, IceServer, SdpType, SessionConfig, SessionDescription};
