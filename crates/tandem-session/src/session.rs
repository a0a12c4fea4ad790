//! The peer session coordinator.
//!
//! Callers drive the public operations from any thread. The native session
//! calls back into [`SessionObserver`] and [`DescriptionObserver`] from its own
//! threads; each callback becomes either a callback-slot invocation or a
//! mutation of the track, stream or data channel state below.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use tandem_common::{IceCandidate, IceServer, SdpType, SessionConfig, SessionDescription};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::callbacks::{callback, Callback, CallbackRegistry, EventKind, NegotiationStage, SignalingEvent};
use crate::channels::{DataChannelCallbacks, DataChannelObserver, DataChannelRegistry};
use crate::error::{SessionError, SessionResult};
use crate::media::{
    same_object, ArgbFrame, AudioFrame, AudioTrack, FrameSink, LocalTrack, MediaStream, RtpSender,
    TrackKind, VideoFrame, VideoTrack,
};
use crate::native::{
    DescriptionObserver, IceConnectionState, IceGatheringState, NativeDataChannel, NativeError,
    NativeSession, SessionObserver, SignalingState,
};
use crate::sinks::{AudioFrameObserver, VideoFrameObserver};
use crate::sync::{lock, read, write};
use crate::tracks::TrackManager;

/// Last states reported by the native session. Informational only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionStates {
    pub signaling: SignalingState,
    pub ice_connection: IceConnectionState,
    pub ice_gathering: IceGatheringState,
}

struct FrameSinks {
    local_audio: Arc<AudioFrameObserver>,
    remote_audio: Arc<AudioFrameObserver>,
    local_video: Arc<VideoFrameObserver>,
    remote_video: Arc<VideoFrameObserver>,
}

impl FrameSinks {
    fn new() -> Self {
        Self {
            local_audio: Arc::new(AudioFrameObserver::new()),
            remote_audio: Arc::new(AudioFrameObserver::new()),
            local_video: Arc::new(VideoFrameObserver::new()),
            remote_video: Arc::new(VideoFrameObserver::new()),
        }
    }

    fn audio(&self, sink: &Arc<AudioFrameObserver>) -> Arc<dyn FrameSink<AudioFrame>> {
        Arc::clone(sink) as Arc<dyn FrameSink<AudioFrame>>
    }

    fn video(&self, sink: &Arc<VideoFrameObserver>) -> Arc<dyn FrameSink<VideoFrame>> {
        Arc::clone(sink) as Arc<dyn FrameSink<VideoFrame>>
    }

    fn clear_callbacks(&self) {
        self.local_audio.set_callback(None);
        self.remote_audio.set_callback(None);
        self.local_video.clear_callbacks();
        self.remote_video.clear_callbacks();
    }
}

pub struct PeerSession {
    session_id: Uuid,
    me: Weak<PeerSession>,
    ice_servers: Vec<IceServer>,
    native: RwLock<Option<Arc<dyn NativeSession>>>,
    callbacks: CallbackRegistry,
    tracks: TrackManager,
    remote_streams: Mutex<Vec<Arc<dyn MediaStream>>>,
    data_channels: DataChannelRegistry,
    sinks: FrameSinks,
    states: Mutex<SessionStates>,
    connected: AtomicBool,
}

impl PeerSession {
    /// Creates a coordinator with no native session attached yet.
    pub fn new(config: SessionConfig) -> Arc<Self> {
        let session_id = Uuid::new_v4();
        debug!(%session_id, "peer session created");
        Arc::new_cyclic(|me| Self {
            session_id,
            me: me.clone(),
            ice_servers: config.ice_servers.clone(),
            native: RwLock::new(None),
            callbacks: CallbackRegistry::new(),
            tracks: TrackManager::new(),
            remote_streams: Mutex::new(Vec::new()),
            data_channels: DataChannelRegistry::new(&config),
            sinks: FrameSinks::new(),
            states: Mutex::new(SessionStates::default()),
            connected: AtomicBool::new(false),
        })
    }

    pub fn with_native(
        config: SessionConfig,
        native: Arc<dyn NativeSession>,
    ) -> SessionResult<Arc<Self>> {
        let session = Self::new(config);
        session.set_native(native)?;
        Ok(session)
    }

    /// Attaches the native session, hands it the configured ICE servers and
    /// registers this coordinator as its observer.
    ///
    /// Replacing a different session first releases everything attached to
    /// the old one: local senders are removed, data channels closed, remote
    /// streams dropped. Passing the attached session again is a no-op. If the
    /// new session rejects the ICE servers nothing changes.
    pub fn set_native(&self, native: Arc<dyn NativeSession>) -> SessionResult<()> {
        let previous = read(&self.native).clone();
        if let Some(previous) = &previous {
            if same_object(previous, &native) {
                debug!(session_id = %self.session_id, "native session already attached");
                return Ok(());
            }
        }

        native.set_ice_servers(&self.ice_servers)?;

        if let Some(previous) = &previous {
            previous.unregister_observer();
            self.release_native_state(Some(previous.as_ref()));
            let closed = self.data_channels.close_all();
            *lock(&self.states) = SessionStates::default();
            self.connected.store(false, Ordering::SeqCst);
            info!(session_id = %self.session_id, closed_channels = closed, "previous native session released");
        }

        *write(&self.native) = Some(Arc::clone(&native));
        let weak = self.me.clone();
        let observer: Weak<dyn SessionObserver> = weak;
        native.register_observer(observer);
        info!(session_id = %self.session_id, ice_servers = self.ice_servers.len(), "native session attached");
        Ok(())
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn has_native(&self) -> bool {
        read(&self.native).is_some()
    }

    fn native(&self) -> SessionResult<Arc<dyn NativeSession>> {
        read(&self.native)
            .clone()
            .ok_or(SessionError::NoNativeSession)
    }

    fn description_observer(&self) -> SessionResult<Arc<dyn DescriptionObserver>> {
        let me = self.me.upgrade().ok_or(SessionError::Closed)?;
        Ok(me)
    }

    // Callback registration

    pub fn register_callback(&self, kind: EventKind, callback: Callback) {
        self.callbacks.register(kind, callback);
    }

    pub fn unregister_callback(&self, kind: EventKind) -> bool {
        self.callbacks.unregister(kind)
    }

    pub fn on_connected<F>(&self, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.register_callback(
            EventKind::Connected,
            callback(move |event| {
                if let SignalingEvent::Connected = event {
                    f();
                }
            }),
        );
    }

    pub fn on_local_sdp_ready<F>(&self, f: F)
    where
        F: Fn(SdpType, &str) + Send + Sync + 'static,
    {
        self.register_callback(
            EventKind::LocalSdpReady,
            callback(move |event| {
                if let SignalingEvent::LocalSdpReady { sdp_type, sdp } = event {
                    f(*sdp_type, sdp);
                }
            }),
        );
    }

    pub fn on_ice_candidate_ready<F>(&self, f: F)
    where
        F: Fn(&str, u16, &str) + Send + Sync + 'static,
    {
        self.register_callback(
            EventKind::IceCandidateReady,
            callback(move |event| {
                if let SignalingEvent::IceCandidateReady {
                    sdp_mid,
                    sdp_mline_index,
                    candidate,
                } = event
                {
                    f(sdp_mid, *sdp_mline_index, candidate);
                }
            }),
        );
    }

    pub fn on_renegotiation_needed<F>(&self, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.register_callback(
            EventKind::RenegotiationNeeded,
            callback(move |event| {
                if let SignalingEvent::RenegotiationNeeded = event {
                    f();
                }
            }),
        );
    }

    /// Handler for failures of accepted negotiation requests. Without one the
    /// failure is only logged.
    pub fn on_negotiation_failed<F>(&self, f: F)
    where
        F: Fn(NegotiationStage, &NativeError) + Send + Sync + 'static,
    {
        self.register_callback(
            EventKind::NegotiationFailed,
            callback(move |event| {
                if let SignalingEvent::NegotiationFailed { stage, error } = event {
                    f(*stage, error);
                }
            }),
        );
    }

    /// Notified with `(id, label)` when the remote peer opens a data channel.
    pub fn on_data_channel_added<F>(&self, f: F)
    where
        F: Fn(u16, &str) + Send + Sync + 'static,
    {
        self.register_callback(
            EventKind::DataChannelAdded,
            callback(move |event| {
                if let SignalingEvent::DataChannelAdded { id, label } = event {
                    f(*id, label);
                }
            }),
        );
    }

    pub fn register_local_video_frame_callback<F>(&self, f: F)
    where
        F: Fn(&VideoFrame) + Send + Sync + 'static,
    {
        self.sinks.local_video.set_callback(Some(Arc::new(f)));
    }

    pub fn register_remote_video_frame_callback<F>(&self, f: F)
    where
        F: Fn(&VideoFrame) + Send + Sync + 'static,
    {
        self.sinks.remote_video.set_callback(Some(Arc::new(f)));
    }

    /// Local video frames converted to ARGB. Independent of the I420 callback.
    pub fn register_local_argb_frame_callback<F>(&self, f: F)
    where
        F: Fn(&ArgbFrame) + Send + Sync + 'static,
    {
        self.sinks.local_video.set_argb_callback(Some(Arc::new(f)));
    }

    pub fn register_remote_argb_frame_callback<F>(&self, f: F)
    where
        F: Fn(&ArgbFrame) + Send + Sync + 'static,
    {
        self.sinks.remote_video.set_argb_callback(Some(Arc::new(f)));
    }

    pub fn register_local_audio_frame_callback<F>(&self, f: F)
    where
        F: Fn(&AudioFrame) + Send + Sync + 'static,
    {
        self.sinks.local_audio.set_callback(Some(Arc::new(f)));
    }

    pub fn register_remote_audio_frame_callback<F>(&self, f: F)
    where
        F: Fn(&AudioFrame) + Send + Sync + 'static,
    {
        self.sinks.remote_audio.set_callback(Some(Arc::new(f)));
    }

    // Local tracks

    pub fn add_local_video_track(&self, track: Arc<VideoTrack>) -> SessionResult<Arc<dyn RtpSender>> {
        let native = self.native()?;
        let sender = self
            .tracks
            .add(native.as_ref(), LocalTrack::Video(Arc::clone(&track)))?;
        track.add_sink(self.sinks.video(&self.sinks.local_video));
        info!(session_id = %self.session_id, track_id = %track.id(), "local video track added");
        Ok(sender)
    }

    pub fn remove_local_video_track(&self) {
        let native = read(&self.native).clone();
        self.detach_local_track(native.as_deref(), TrackKind::Video);
    }

    pub fn add_local_audio_track(&self, track: Arc<AudioTrack>) -> SessionResult<Arc<dyn RtpSender>> {
        let native = self.native()?;
        let sender = self
            .tracks
            .add(native.as_ref(), LocalTrack::Audio(Arc::clone(&track)))?;
        track.add_sink(self.sinks.audio(&self.sinks.local_audio));
        info!(session_id = %self.session_id, track_id = %track.id(), "local audio track added");
        Ok(sender)
    }

    pub fn remove_local_audio_track(&self) {
        let native = read(&self.native).clone();
        self.detach_local_track(native.as_deref(), TrackKind::Audio);
    }

    fn detach_local_track(&self, native: Option<&dyn NativeSession>, kind: TrackKind) {
        let Some(track) = self.tracks.remove(native, kind) else {
            return;
        };
        match &track {
            LocalTrack::Audio(audio) => audio.remove_sink(&self.sinks.audio(&self.sinks.local_audio)),
            LocalTrack::Video(video) => video.remove_sink(&self.sinks.video(&self.sinks.local_video)),
        }
        info!(session_id = %self.session_id, %kind, track_id = %track.id(), "local track removed");
    }

    pub fn local_track(&self, kind: TrackKind) -> Option<LocalTrack> {
        self.tracks.track(kind)
    }

    pub fn local_sender(&self, kind: TrackKind) -> Option<Arc<dyn RtpSender>> {
        self.tracks.sender(kind)
    }

    pub fn remote_streams(&self) -> Vec<Arc<dyn MediaStream>> {
        lock(&self.remote_streams).clone()
    }

    // Data channels

    /// Creates a data channel. With `id` the channel is pre-negotiated and
    /// addressable by that id right away; an empty `label` keeps it out of
    /// the label index.
    pub fn add_data_channel(
        &self,
        id: Option<u16>,
        label: &str,
        ordered: bool,
        reliable: bool,
        callbacks: DataChannelCallbacks,
    ) -> SessionResult<Arc<DataChannelObserver>> {
        let native = self.native()?;
        let result =
            self.data_channels
                .add(native.as_ref(), id, label, ordered, reliable, callbacks);
        match &result {
            Ok(_) => info!(session_id = %self.session_id, ?id, label, ordered, reliable, "data channel added"),
            Err(e) => warn!(session_id = %self.session_id, ?id, label, error = %e, "data channel rejected"),
        }
        result
    }

    pub fn remove_data_channel(&self, id: u16) -> SessionResult<()> {
        self.data_channels.remove_by_id(id)?;
        info!(session_id = %self.session_id, id, "data channel removed");
        Ok(())
    }

    /// Removes every data channel carrying `label`.
    pub fn remove_data_channels_by_label(&self, label: &str) -> SessionResult<usize> {
        let removed = self.data_channels.remove_by_label(label)?;
        info!(session_id = %self.session_id, label, removed, "data channels removed");
        Ok(removed)
    }

    /// Queues `data` on an open channel. Returns once the native channel has
    /// accepted it; delivery is not awaited.
    pub fn send_data_channel_message(&self, id: u16, data: &[u8]) -> SessionResult<()> {
        self.data_channels.send(id, data).inspect_err(|e| {
            debug!(session_id = %self.session_id, id, len = data.len(), error = %e, "data channel send failed");
        })
    }

    pub fn data_channel(&self, id: u16) -> Option<Arc<DataChannelObserver>> {
        self.data_channels.get(id)
    }

    pub fn data_channels_by_label(&self, label: &str) -> Vec<Arc<DataChannelObserver>> {
        self.data_channels.by_label(label)
    }

    pub fn data_channels(&self) -> &DataChannelRegistry {
        &self.data_channels
    }

    // Signaling

    /// Asks the native session for an offer. `Ok` means the request was
    /// accepted; the offer arrives through the local-SDP-ready callback.
    pub fn create_offer(&self) -> SessionResult<()> {
        let native = self.native()?;
        native.create_offer(self.description_observer()?)?;
        debug!(session_id = %self.session_id, "offer requested");
        Ok(())
    }

    /// Asks the native session for an answer. `Ok` means the request was
    /// accepted; the answer arrives through the local-SDP-ready callback.
    pub fn create_answer(&self) -> SessionResult<()> {
        let native = self.native()?;
        native.create_answer(self.description_observer()?)?;
        debug!(session_id = %self.session_id, "answer requested");
        Ok(())
    }

    pub fn set_remote_description(&self, sdp_type: &str, sdp: &str) -> SessionResult<()> {
        let native = self.native()?;
        let description =
            SessionDescription::parse(sdp_type, sdp).map_err(SessionError::InvalidDescription)?;
        let kind = description.sdp_type;

        let me = self.me.clone();
        native.set_remote_description(
            description,
            Box::new(move |result| {
                if let (Err(error), Some(session)) = (result, me.upgrade()) {
                    session.report_negotiation_failure(NegotiationStage::SetRemoteDescription, error);
                }
            }),
        )?;
        debug!(session_id = %self.session_id, %kind, "remote description applied");
        Ok(())
    }

    pub fn add_ice_candidate(
        &self,
        sdp_mid: &str,
        sdp_mline_index: u16,
        candidate: &str,
    ) -> SessionResult<()> {
        let native = self.native()?;
        let candidate = IceCandidate::parse(sdp_mid, sdp_mline_index, candidate)
            .map_err(SessionError::InvalidCandidate)?;
        native.add_ice_candidate(&candidate).inspect_err(|e| {
            warn!(session_id = %self.session_id, sdp_mid, error = %e, "remote ICE candidate rejected");
        })?;
        Ok(())
    }

    pub fn states(&self) -> SessionStates {
        *lock(&self.states)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn report_negotiation_failure(&self, stage: NegotiationStage, error: NativeError) {
        let handled = self
            .callbacks
            .invoke(&SignalingEvent::NegotiationFailed { stage, error: &error });
        if !handled {
            warn!(session_id = %self.session_id, ?stage, %error, "negotiation step failed with no failure handler");
        } else {
            debug!(session_id = %self.session_id, ?stage, %error, "negotiation step failed");
        }
    }

    /// Detaches local tracks and drops remote streams along with their sinks.
    fn release_native_state(&self, native: Option<&dyn NativeSession>) {
        self.detach_local_track(native, TrackKind::Audio);
        self.detach_local_track(native, TrackKind::Video);
        let streams = std::mem::take(&mut *lock(&self.remote_streams));
        for stream in &streams {
            self.detach_remote_sinks(stream);
        }
    }

    fn attach_remote_sinks(&self, stream: &Arc<dyn MediaStream>) {
        if let Some(video) = stream.video_tracks().first() {
            video.add_sink(self.sinks.video(&self.sinks.remote_video));
        }
        if let Some(audio) = stream.audio_tracks().first() {
            audio.add_sink(self.sinks.audio(&self.sinks.remote_audio));
        }
    }

    fn detach_remote_sinks(&self, stream: &Arc<dyn MediaStream>) {
        if let Some(video) = stream.video_tracks().first() {
            video.remove_sink(&self.sinks.video(&self.sinks.remote_video));
        }
        if let Some(audio) = stream.audio_tracks().first() {
            audio.remove_sink(&self.sinks.audio(&self.sinks.remote_audio));
        }
    }
}

impl SessionObserver for PeerSession {
    fn on_signaling_change(&self, state: SignalingState) {
        debug!(session_id = %self.session_id, ?state, "signaling state changed");
        lock(&self.states).signaling = state;
    }

    fn on_add_stream(&self, stream: Arc<dyn MediaStream>) {
        info!(session_id = %self.session_id, stream_id = %stream.id(), "remote stream added");
        self.attach_remote_sinks(&stream);
        lock(&self.remote_streams).push(stream);
    }

    fn on_remove_stream(&self, stream: Arc<dyn MediaStream>) {
        info!(session_id = %self.session_id, stream_id = %stream.id(), "remote stream removed");
        let removed = {
            let mut streams = lock(&self.remote_streams);
            let before = streams.len();
            streams.retain(|known| !same_object(known, &stream));
            before != streams.len()
        };
        if removed {
            self.detach_remote_sinks(&stream);
        }
    }

    fn on_data_channel(&self, channel: Arc<dyn NativeDataChannel>) {
        let label = channel.label();
        match self.data_channels.adopt(channel) {
            Ok(observer) => {
                info!(session_id = %self.session_id, id = ?observer.id(), label = %label, "remote data channel opened");
                if let Some(id) = observer.id() {
                    self.callbacks.invoke(&SignalingEvent::DataChannelAdded {
                        id,
                        label: observer.label(),
                    });
                }
            }
            Err(e) => {
                warn!(session_id = %self.session_id, label = %label, error = %e, "ignoring remote data channel");
            }
        }
    }

    fn on_renegotiation_needed(&self) {
        debug!(session_id = %self.session_id, "renegotiation needed");
        self.callbacks.invoke(&SignalingEvent::RenegotiationNeeded);
    }

    fn on_ice_connection_change(&self, state: IceConnectionState) {
        debug!(session_id = %self.session_id, ?state, "ICE connection state changed");
        lock(&self.states).ice_connection = state;

        let now_connected = state.is_connected();
        let was_connected = self.connected.swap(now_connected, Ordering::SeqCst);
        if now_connected && !was_connected {
            info!(session_id = %self.session_id, "peer connected");
            self.callbacks.invoke(&SignalingEvent::Connected);
        } else if was_connected && !now_connected {
            info!(session_id = %self.session_id, ?state, "peer no longer connected");
        }
    }

    fn on_ice_gathering_change(&self, state: IceGatheringState) {
        debug!(session_id = %self.session_id, ?state, "ICE gathering state changed");
        lock(&self.states).ice_gathering = state;
    }

    fn on_ice_candidate(&self, candidate: &IceCandidate) {
        debug!(session_id = %self.session_id, sdp_mid = %candidate.sdp_mid, "local ICE candidate gathered");
        self.callbacks.invoke(&SignalingEvent::IceCandidateReady {
            sdp_mid: &candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            candidate: &candidate.candidate,
        });
    }
}

impl DescriptionObserver for PeerSession {
    fn on_success(&self, description: SessionDescription) {
        let native = match self.native() {
            Ok(native) => native,
            Err(e) => {
                warn!(session_id = %self.session_id, error = %e, "dropping created description");
                return;
            }
        };

        let sdp_type = description.sdp_type;
        let sdp = description.sdp.clone();
        let me = self.me.clone();
        native.set_local_description(
            description,
            Box::new(move |result| {
                let Some(session) = me.upgrade() else {
                    return;
                };
                match result {
                    Ok(()) => {
                        debug!(session_id = %session.session_id, %sdp_type, "local description set");
                        session
                            .callbacks
                            .invoke(&SignalingEvent::LocalSdpReady { sdp_type, sdp: &sdp });
                    }
                    Err(error) => {
                        session.report_negotiation_failure(NegotiationStage::SetLocalDescription, error)
                    }
                }
            }),
        );
    }

    fn on_failure(&self, error: NativeError) {
        self.report_negotiation_failure(NegotiationStage::CreateDescription, error);
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        let native = match self.native.get_mut() {
            Ok(native) => native.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(native) = &native {
            native.unregister_observer();
        }

        self.release_native_state(native.as_deref());
        self.data_channels.clear();
        self.callbacks.clear();
        self.sinks.clear_callbacks();
        debug!(session_id = %self.session_id, "peer session destroyed");
    }
}

impl fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerSession")
            .field("session_id", &self.session_id)
            .field("has_native", &self.has_native())
            .field("states", &self.states())
            .field("callbacks", &self.callbacks)
            .field("data_channels", &self.data_channels)
            .finish()
    }
}
