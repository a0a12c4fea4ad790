//! In-process native session.
//!
//! Runs the offer/answer state machine synchronously on the calling thread and
//! lets the owner raise every observer event by hand. Used for tests and for
//! exercising the coordinator without a real negotiation engine.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use tandem_common::{IceCandidate, IceServer, SdpType, SessionDescription};
use tracing::debug;

use crate::media::{
    same_object, AudioTrack, FrameSink, LocalTrack, MediaStream, MediaTrack, RtpSender,
    VideoTrack,
};
use crate::native::{
    DataBuffer, DataChannelEvents, DataChannelInit, DataChannelState, DescriptionObserver,
    IceConnectionState, IceGatheringState, NativeDataChannel, NativeError, NativeResult,
    NativeSession, SessionObserver, SetDescriptionDone, SignalingState,
};
use crate::sync::lock;

pub struct DummySender {
    id: String,
    track_id: String,
}

impl DummySender {
    pub fn track_id(&self) -> &str {
        &self.track_id
    }
}

impl RtpSender for DummySender {
    fn id(&self) -> String {
        self.id.clone()
    }
}

pub struct DummyTrack<F: 'static> {
    id: String,
    sinks: Mutex<Vec<Arc<dyn FrameSink<F>>>>,
}

impl<F: 'static> DummyTrack<F> {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            sinks: Mutex::new(Vec::new()),
        }
    }

    /// Pushes one frame through every attached sink.
    pub fn deliver(&self, frame: &F) {
        let sinks = lock(&self.sinks).clone();
        for sink in sinks {
            sink.on_frame(frame);
        }
    }

    pub fn sink_count(&self) -> usize {
        lock(&self.sinks).len()
    }
}

impl<F: 'static> MediaTrack<F> for DummyTrack<F> {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn add_sink(&self, sink: Arc<dyn FrameSink<F>>) {
        let mut sinks = lock(&self.sinks);
        if !sinks.iter().any(|known| same_object(known, &sink)) {
            sinks.push(sink);
        }
    }

    fn remove_sink(&self, sink: &Arc<dyn FrameSink<F>>) {
        lock(&self.sinks).retain(|known| !same_object(known, sink));
    }
}

pub struct DummyStream {
    id: String,
    audio: Vec<Arc<AudioTrack>>,
    video: Vec<Arc<VideoTrack>>,
}

impl DummyStream {
    pub fn new(
        id: impl Into<String>,
        audio: Vec<Arc<AudioTrack>>,
        video: Vec<Arc<VideoTrack>>,
    ) -> Self {
        Self {
            id: id.into(),
            audio,
            video,
        }
    }
}

impl MediaStream for DummyStream {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn audio_tracks(&self) -> Vec<Arc<AudioTrack>> {
        self.audio.clone()
    }

    fn video_tracks(&self) -> Vec<Arc<VideoTrack>> {
        self.video.clone()
    }
}

pub struct DummyDataChannel {
    id: Mutex<Option<u16>>,
    label: String,
    ordered: bool,
    reliable: bool,
    state: Mutex<DataChannelState>,
    buffered: AtomicU64,
    sent: Mutex<Vec<DataBuffer>>,
    observer: Mutex<Option<Weak<dyn DataChannelEvents>>>,
}

impl DummyDataChannel {
    pub fn new(id: Option<u16>, label: impl Into<String>, ordered: bool, reliable: bool) -> Self {
        Self {
            id: Mutex::new(id),
            label: label.into(),
            ordered,
            reliable,
            state: Mutex::new(DataChannelState::Connecting),
            buffered: AtomicU64::new(0),
            sent: Mutex::new(Vec::new()),
            observer: Mutex::new(None),
        }
    }

    fn events(&self) -> Option<Arc<dyn DataChannelEvents>> {
        lock(&self.observer).as_ref().and_then(Weak::upgrade)
    }

    /// Simulates in-band id assignment for a locally created channel.
    pub fn assign_id(&self, id: u16) {
        *lock(&self.id) = Some(id);
    }

    pub fn set_state(&self, state: DataChannelState) {
        *lock(&self.state) = state;
        if let Some(events) = self.events() {
            events.on_state_change();
        }
    }

    /// Simulates a message arriving from the remote peer.
    pub fn deliver(&self, data: impl Into<Bytes>) {
        let buffer = DataBuffer::binary(data);
        if let Some(events) = self.events() {
            events.on_message(&buffer);
        }
    }

    pub fn set_buffered_amount(&self, amount: u64) {
        let previous = self.buffered.swap(amount, Ordering::SeqCst);
        if let Some(events) = self.events() {
            events.on_buffered_amount_change(previous);
        }
    }

    pub fn sent(&self) -> Vec<DataBuffer> {
        lock(&self.sent).clone()
    }

    pub fn has_observer(&self) -> bool {
        self.events().is_some()
    }
}

impl NativeDataChannel for DummyDataChannel {
    fn id(&self) -> Option<u16> {
        *lock(&self.id)
    }

    fn label(&self) -> String {
        self.label.clone()
    }

    fn ordered(&self) -> bool {
        self.ordered
    }

    fn reliable(&self) -> bool {
        self.reliable
    }

    fn state(&self) -> DataChannelState {
        *lock(&self.state)
    }

    fn buffered_amount(&self) -> u64 {
        self.buffered.load(Ordering::SeqCst)
    }

    fn send(&self, buffer: DataBuffer) -> NativeResult<()> {
        if self.state() != DataChannelState::Open {
            return Err(NativeError::InvalidState(format!(
                "data channel '{}' is not open",
                self.label
            )));
        }
        lock(&self.sent).push(buffer);
        Ok(())
    }

    fn register_observer(&self, observer: Weak<dyn DataChannelEvents>) {
        *lock(&self.observer) = Some(observer);
    }

    fn unregister_observer(&self) {
        *lock(&self.observer) = None;
    }

    fn close(&self) {
        self.set_state(DataChannelState::Closed);
    }
}

#[derive(Default)]
pub struct DummySession {
    observer: Mutex<Option<Weak<dyn SessionObserver>>>,
    signaling: Mutex<SignalingState>,
    local_description: Mutex<Option<SessionDescription>>,
    remote_description: Mutex<Option<SessionDescription>>,
    pending_description: Mutex<Option<(Arc<dyn DescriptionObserver>, SdpType)>>,
    fail_next_set_local: Mutex<Option<NativeError>>,
    candidates: Mutex<Vec<IceCandidate>>,
    senders: Mutex<Vec<Arc<DummySender>>>,
    channels: Mutex<Vec<Arc<DummyDataChannel>>>,
    next_sender: AtomicUsize,
    closed: AtomicBool,
    ice_servers: Mutex<Vec<IceServer>>,
}

impl DummySession {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn observer(&self) -> Option<Arc<dyn SessionObserver>> {
        lock(&self.observer).as_ref().and_then(Weak::upgrade)
    }

    fn notify(&self, f: impl FnOnce(&dyn SessionObserver)) -> bool {
        match self.observer() {
            Some(observer) => {
                f(observer.as_ref());
                true
            }
            None => false,
        }
    }

    fn ensure_open(&self) -> NativeResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(NativeError::Closed);
        }
        Ok(())
    }

    fn transition(&self, state: SignalingState) {
        *lock(&self.signaling) = state;
        if let Some(observer) = self.observer() {
            observer.on_signaling_change(state);
        }
    }

    fn request_description(
        &self,
        observer: Arc<dyn DescriptionObserver>,
        sdp_type: SdpType,
        allowed: &[SignalingState],
    ) -> NativeResult<()> {
        self.ensure_open()?;
        let state = self.signaling_state();
        if !allowed.contains(&state) {
            return Err(NativeError::InvalidState(format!(
                "cannot create {sdp_type} in {state:?}"
            )));
        }
        *lock(&self.pending_description) = Some((observer, sdp_type));
        debug!(%sdp_type, "DummySession: description requested");
        Ok(())
    }

    pub fn ice_servers(&self) -> Vec<IceServer> {
        lock(&self.ice_servers).clone()
    }

    pub fn signaling_state(&self) -> SignalingState {
        *lock(&self.signaling)
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        lock(&self.local_description).clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        lock(&self.remote_description).clone()
    }

    pub fn candidates(&self) -> Vec<IceCandidate> {
        lock(&self.candidates).clone()
    }

    pub fn senders(&self) -> Vec<Arc<DummySender>> {
        lock(&self.senders).clone()
    }

    pub fn channels(&self) -> Vec<Arc<DummyDataChannel>> {
        lock(&self.channels).clone()
    }

    pub fn channel(&self, id: u16) -> Option<Arc<DummyDataChannel>> {
        lock(&self.channels)
            .iter()
            .find(|channel| channel.id() == Some(id))
            .cloned()
    }

    pub fn has_observer(&self) -> bool {
        self.observer().is_some()
    }

    pub fn has_pending_description(&self) -> bool {
        lock(&self.pending_description).is_some()
    }

    /// Finishes the outstanding offer/answer request with `sdp` as its body.
    pub fn complete_description(&self, sdp: &str) -> bool {
        let Some((observer, sdp_type)) = lock(&self.pending_description).take() else {
            return false;
        };
        observer.on_success(SessionDescription::new(sdp_type, sdp));
        true
    }

    /// Fails the outstanding offer/answer request.
    pub fn fail_description(&self, error: NativeError) -> bool {
        let Some((observer, _)) = lock(&self.pending_description).take() else {
            return false;
        };
        observer.on_failure(error);
        true
    }

    pub fn fail_next_set_local_description(&self, error: NativeError) {
        *lock(&self.fail_next_set_local) = Some(error);
    }

    /// Marks the session closed; later requests fail with [`NativeError::Closed`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.transition(SignalingState::Closed);
    }

    pub fn raise_ice_connection_change(&self, state: IceConnectionState) -> bool {
        self.notify(|observer| observer.on_ice_connection_change(state))
    }

    pub fn raise_ice_gathering_change(&self, state: IceGatheringState) -> bool {
        self.notify(|observer| observer.on_ice_gathering_change(state))
    }

    pub fn raise_ice_candidate(&self, candidate: &IceCandidate) -> bool {
        self.notify(|observer| observer.on_ice_candidate(candidate))
    }

    pub fn raise_renegotiation_needed(&self) -> bool {
        self.notify(|observer| observer.on_renegotiation_needed())
    }

    pub fn raise_add_stream(&self, stream: Arc<dyn MediaStream>) -> bool {
        self.notify(|observer| observer.on_add_stream(stream))
    }

    pub fn raise_remove_stream(&self, stream: Arc<dyn MediaStream>) -> bool {
        self.notify(|observer| observer.on_remove_stream(stream))
    }

    /// Simulates the remote peer opening a channel.
    pub fn open_remote_channel(&self, id: u16, label: &str) -> Arc<DummyDataChannel> {
        let channel = Arc::new(DummyDataChannel::new(Some(id), label, true, true));
        *lock(&channel.state) = DataChannelState::Open;
        lock(&self.channels).push(Arc::clone(&channel));
        if let Some(observer) = self.observer() {
            observer.on_data_channel(Arc::clone(&channel) as Arc<dyn NativeDataChannel>);
        }
        channel
    }
}

impl NativeSession for DummySession {
    fn register_observer(&self, observer: Weak<dyn SessionObserver>) {
        *lock(&self.observer) = Some(observer);
    }

    fn unregister_observer(&self) {
        *lock(&self.observer) = None;
    }

    fn set_ice_servers(&self, servers: &[IceServer]) -> NativeResult<()> {
        self.ensure_open()?;
        *lock(&self.ice_servers) = servers.to_vec();
        Ok(())
    }

    fn create_offer(&self, observer: Arc<dyn DescriptionObserver>) -> NativeResult<()> {
        self.request_description(
            observer,
            SdpType::Offer,
            &[SignalingState::Stable, SignalingState::HaveLocalOffer],
        )
    }

    fn create_answer(&self, observer: Arc<dyn DescriptionObserver>) -> NativeResult<()> {
        self.request_description(
            observer,
            SdpType::Answer,
            &[
                SignalingState::HaveRemoteOffer,
                SignalingState::HaveLocalPranswer,
            ],
        )
    }

    fn set_local_description(&self, description: SessionDescription, done: SetDescriptionDone) {
        if let Err(e) = self.ensure_open() {
            done(Err(e));
            return;
        }
        let injected = lock(&self.fail_next_set_local).take();
        if let Some(error) = injected {
            done(Err(error));
            return;
        }

        let next = match description.sdp_type {
            SdpType::Offer => SignalingState::HaveLocalOffer,
            SdpType::Pranswer => SignalingState::HaveLocalPranswer,
            SdpType::Answer | SdpType::Rollback => SignalingState::Stable,
        };
        *lock(&self.local_description) = Some(description);
        self.transition(next);
        done(Ok(()));
    }

    fn set_remote_description(
        &self,
        description: SessionDescription,
        done: SetDescriptionDone,
    ) -> NativeResult<()> {
        self.ensure_open()?;
        let state = self.signaling_state();
        let next = match description.sdp_type {
            SdpType::Offer
                if matches!(
                    state,
                    SignalingState::Stable | SignalingState::HaveRemoteOffer
                ) =>
            {
                SignalingState::HaveRemoteOffer
            }
            SdpType::Answer
                if matches!(
                    state,
                    SignalingState::HaveLocalOffer | SignalingState::HaveRemotePranswer
                ) =>
            {
                SignalingState::Stable
            }
            SdpType::Pranswer if state == SignalingState::HaveLocalOffer => {
                SignalingState::HaveRemotePranswer
            }
            SdpType::Rollback => SignalingState::Stable,
            sdp_type => {
                return Err(NativeError::InvalidState(format!(
                    "cannot apply remote {sdp_type} in {state:?}"
                )));
            }
        };

        *lock(&self.remote_description) = Some(description);
        self.transition(next);
        done(Ok(()));
        Ok(())
    }

    fn add_ice_candidate(&self, candidate: &IceCandidate) -> NativeResult<()> {
        self.ensure_open()?;
        if lock(&self.remote_description).is_none() {
            return Err(NativeError::InvalidState(
                "no remote description for ICE candidate".to_string(),
            ));
        }
        lock(&self.candidates).push(candidate.clone());
        Ok(())
    }

    fn add_track(&self, track: LocalTrack, stream_ids: &[String]) -> NativeResult<Arc<dyn RtpSender>> {
        self.ensure_open()?;
        let n = self.next_sender.fetch_add(1, Ordering::SeqCst);
        let sender = Arc::new(DummySender {
            id: format!("sender-{n}"),
            track_id: track.id(),
        });
        debug!(kind = %track.kind(), track_id = %sender.track_id, ?stream_ids, "DummySession: track added");
        lock(&self.senders).push(Arc::clone(&sender));
        Ok(sender)
    }

    fn remove_track(&self, sender: &Arc<dyn RtpSender>) -> NativeResult<()> {
        let mut senders = lock(&self.senders);
        let before = senders.len();
        senders.retain(|known| !same_object(known, sender));
        if senders.len() == before {
            return Err(NativeError::Rejected(format!(
                "unknown sender {}",
                sender.id()
            )));
        }
        Ok(())
    }

    fn create_data_channel(
        &self,
        label: &str,
        init: &DataChannelInit,
    ) -> NativeResult<Arc<dyn NativeDataChannel>> {
        self.ensure_open()?;
        let channel = Arc::new(DummyDataChannel::new(
            init.negotiated_id,
            label,
            init.ordered,
            init.max_retransmits.is_none(),
        ));
        debug!(label, id = ?init.negotiated_id, "DummySession: data channel created");
        lock(&self.channels).push(Arc::clone(&channel));
        Ok(channel)
    }
}
