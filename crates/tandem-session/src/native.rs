//! The seam between the coordinator and the negotiation/ICE/DTLS engine.
//!
//! A native session drives its own state machine on its own threads and reports
//! progress through the two observer protocols below. The coordinator only
//! holds the session behind [`NativeSession`] and is registered as a weak
//! observer, so the engine never keeps a coordinator alive on its own.

use std::sync::{Arc, Weak};

use bytes::Bytes;
use tandem_common::{IceCandidate, IceServer, SessionDescription};
use thiserror::Error;

use crate::media::{LocalTrack, MediaStream, RtpSender};

/// Failure reported by the native session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NativeError {
    /// The engine refused the request outright.
    #[error("rejected by native session: {0}")]
    Rejected(String),
    /// The request is not valid in the engine's current state.
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// The engine has shut down.
    #[error("native session closed")]
    Closed,
}

pub type NativeResult<T> = Result<T, NativeError>;

/// Offer/answer state of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignalingState {
    #[default]
    Stable,
    HaveLocalOffer,
    HaveLocalPranswer,
    HaveRemoteOffer,
    HaveRemotePranswer,
    /// The engine was shut down; no further negotiation is possible.
    Closed,
}

/// Combined ICE + DTLS connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IceConnectionState {
    #[default]
    New,
    Checking,
    Connected,
    Completed,
    Failed,
    Disconnected,
    Closed,
}

impl IceConnectionState {
    /// Whether media and data can flow in this state.
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            IceConnectionState::Connected | IceConnectionState::Completed
        )
    }
}

/// Progress of local candidate gathering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IceGatheringState {
    #[default]
    New,
    Gathering,
    Complete,
}

/// Lifecycle of one data channel. Only `Open` channels accept messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Creation parameters for a native data channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataChannelInit {
    pub ordered: bool,
    /// `None` means fully reliable.
    pub max_retransmits: Option<u16>,
    /// Pre-negotiated stream id; `None` lets the session assign one in-band.
    pub negotiated_id: Option<u16>,
}

/// One message as handed to or received from a data channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataBuffer {
    pub data: Bytes,
    pub binary: bool,
}

impl DataBuffer {
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            binary: true,
        }
    }
}

/// Events a native data channel reports to its observer.
pub trait DataChannelEvents: Send + Sync {
    fn on_state_change(&self);
    fn on_message(&self, buffer: &DataBuffer);
    fn on_buffered_amount_change(&self, previous_amount: u64);
}

/// A data channel owned by the engine.
pub trait NativeDataChannel: Send + Sync {
    /// Stream id, once assigned.
    fn id(&self) -> Option<u16>;
    /// Label given at creation; may be empty.
    fn label(&self) -> String;
    /// Whether messages are delivered in order.
    fn ordered(&self) -> bool;
    /// Whether lost messages are retransmitted without limit.
    fn reliable(&self) -> bool;
    fn state(&self) -> DataChannelState;
    /// Bytes queued for sending but not yet handed to the transport.
    fn buffered_amount(&self) -> u64;
    /// Queues one message. Fails unless the channel is open.
    fn send(&self, buffer: DataBuffer) -> NativeResult<()>;
    /// Replaces the observer. The channel holds it weakly.
    fn register_observer(&self, observer: Weak<dyn DataChannelEvents>);
    fn unregister_observer(&self);
    /// Starts closing the channel; the state change is reported to the observer.
    fn close(&self);
}

/// Session-lifecycle observer protocol.
pub trait SessionObserver: Send + Sync {
    fn on_signaling_change(&self, state: SignalingState);
    fn on_add_stream(&self, stream: Arc<dyn MediaStream>);
    fn on_remove_stream(&self, stream: Arc<dyn MediaStream>);
    fn on_data_channel(&self, channel: Arc<dyn NativeDataChannel>);
    fn on_renegotiation_needed(&self);
    fn on_ice_connection_change(&self, state: IceConnectionState);
    fn on_ice_gathering_change(&self, state: IceGatheringState);
    fn on_ice_candidate(&self, candidate: &IceCandidate);
}

/// Description-creation observer protocol.
pub trait DescriptionObserver: Send + Sync {
    /// Ownership of the created description moves to the observer.
    fn on_success(&self, description: SessionDescription);
    fn on_failure(&self, error: NativeError);
}

/// Completion of a set-description request.
pub type SetDescriptionDone = Box<dyn FnOnce(NativeResult<()>) + Send>;

/// The negotiation engine driven by a coordinator.
pub trait NativeSession: Send + Sync {
    /// Replaces the session observer. The engine holds it weakly.
    fn register_observer(&self, observer: Weak<dyn SessionObserver>);
    fn unregister_observer(&self);

    /// Applies the STUN/TURN servers used for candidate gathering.
    fn set_ice_servers(&self, servers: &[IceServer]) -> NativeResult<()>;

    /// Starts creating an offer; the result arrives through `observer`.
    fn create_offer(&self, observer: Arc<dyn DescriptionObserver>) -> NativeResult<()>;
    /// Starts creating an answer; the result arrives through `observer`.
    fn create_answer(&self, observer: Arc<dyn DescriptionObserver>) -> NativeResult<()>;
    /// Applies a description this engine created; the outcome goes to `done`.
    fn set_local_description(&self, description: SessionDescription, done: SetDescriptionDone);
    /// Returns an error when the description is rejected outright; the outcome
    /// of applying it is reported through `done`.
    fn set_remote_description(
        &self,
        description: SessionDescription,
        done: SetDescriptionDone,
    ) -> NativeResult<()>;
    /// Adds a remote candidate. Requires a remote description.
    fn add_ice_candidate(&self, candidate: &IceCandidate) -> NativeResult<()>;

    /// Starts sending `track` under the given stream ids.
    fn add_track(
        &self,
        track: LocalTrack,
        stream_ids: &[String],
    ) -> NativeResult<Arc<dyn RtpSender>>;
    /// Stops sending through `sender`. Fails for a sender this engine never returned.
    fn remove_track(&self, sender: &Arc<dyn RtpSender>) -> NativeResult<()>;

    /// Creates a local channel. `init.negotiated_id` makes it pre-negotiated.
    fn create_data_channel(
        &self,
        label: &str,
        init: &DataChannelInit,
    ) -> NativeResult<Arc<dyn NativeDataChannel>>;
}
