//! Test doubles for the provider and transport seams
//!
//! - [`MockMediaProvider`] / [`MockConnection`]: scripted capture and
//!   connection objects that "connect" as soon as both descriptions are set.
//! - [`RecordingTransport`]: records outgoing messages, lets a test inject
//!   inbound ones.
//! - [`SignalingHub`] / [`HubTransport`]: an in-process coordination server
//!   routing between several clients the way the real server does.

use crate::identity::PeerId;
use crate::provider::{
    CaptureRequest, ConnectionConfig, ConnectionEventSink, LocalCapture, MediaConnection,
    MediaTrack, MediaTransportProvider, ProviderError, TrackKind, TrackSource,
};
use crate::signaling::{SignalingError, SignalingMessage, SignalingTransport};
use crate::types::{CallId, ConnectionState, IceCandidate, SessionDescription};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Scripted [`MediaTransportProvider`]
#[derive(Default)]
pub struct MockMediaProvider {
    deny_capture: AtomicBool,
    deny_screen: AtomicBool,
    fail_camera_switch: AtomicBool,
    manual_connect: AtomicBool,
    capture_delay: Mutex<Option<Duration>>,
    captures: AtomicUsize,
    screens: Mutex<Vec<MediaTrack>>,
    connections: Mutex<Vec<Arc<MockConnection>>>,
}

impl MockMediaProvider {
    /// Provider granting every request
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse microphone/camera capture
    pub fn set_deny_capture(&self, deny: bool) {
        self.deny_capture.store(deny, Ordering::SeqCst);
    }

    /// Refuse screen capture
    pub fn set_deny_screen(&self, deny: bool) {
        self.deny_screen.store(deny, Ordering::SeqCst);
    }

    /// Fail video-only captures (camera switches)
    pub fn set_fail_camera_switch(&self, fail: bool) {
        self.fail_camera_switch.store(fail, Ordering::SeqCst);
    }

    /// Keep connections in `Connecting` until the test drives them
    pub fn set_manual_connect(&self, manual: bool) {
        self.manual_connect.store(manual, Ordering::SeqCst);
    }

    /// Delay every capture request
    pub fn set_capture_delay(&self, delay: Option<Duration>) {
        *self.capture_delay.lock() = delay;
    }

    /// Number of microphone/camera capture requests that succeeded
    pub fn capture_count(&self) -> usize {
        self.captures.load(Ordering::SeqCst)
    }

    /// Screen tracks handed out so far
    pub fn screen_tracks(&self) -> Vec<MediaTrack> {
        self.screens.lock().clone()
    }

    /// Every connection created so far, oldest first
    pub fn connections(&self) -> Vec<Arc<MockConnection>> {
        self.connections.lock().clone()
    }

    /// Most recent connection created for `peer`
    pub fn connection_for(&self, peer: &PeerId) -> Option<Arc<MockConnection>> {
        self.connections
            .lock()
            .iter()
            .rev()
            .find(|c| c.peer_id() == peer)
            .cloned()
    }

    async fn delay(&self) {
        let delay = *self.capture_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl MediaTransportProvider for MockMediaProvider {
    async fn acquire_local_media(
        &self,
        request: CaptureRequest,
    ) -> Result<LocalCapture, ProviderError> {
        self.delay().await;
        if self.deny_capture.load(Ordering::SeqCst) {
            return Err(ProviderError::PermissionDenied(
                "capture refused by user".to_string(),
            ));
        }
        if !request.audio && self.fail_camera_switch.load(Ordering::SeqCst) {
            return Err(ProviderError::DeviceNotFound("no second camera".to_string()));
        }

        self.captures.fetch_add(1, Ordering::SeqCst);
        let audio = request
            .audio
            .then(|| MediaTrack::new(TrackKind::Audio, TrackSource::Microphone, "mock-mic"));
        let video = request.video.map(|facing| {
            MediaTrack::new(
                TrackKind::Video,
                TrackSource::Camera(facing),
                format!("mock-camera-{facing:?}").to_lowercase(),
            )
        });
        Ok(LocalCapture { audio, video })
    }

    async fn acquire_screen_capture(&self) -> Result<MediaTrack, ProviderError> {
        self.delay().await;
        if self.deny_screen.load(Ordering::SeqCst) {
            return Err(ProviderError::PermissionDenied(
                "screen capture refused".to_string(),
            ));
        }
        let track = MediaTrack::new(TrackKind::Video, TrackSource::Screen, "mock-screen");
        self.screens.lock().push(track.clone());
        Ok(track)
    }

    async fn create_connection(
        &self,
        config: ConnectionConfig,
        events: ConnectionEventSink,
    ) -> Result<Arc<dyn MediaConnection>, ProviderError> {
        let connection = Arc::new(MockConnection::new(
            config,
            events,
            !self.manual_connect.load(Ordering::SeqCst),
        ));
        self.connections.lock().push(Arc::clone(&connection));
        Ok(connection)
    }
}

/// Scripted connection object
///
/// With auto-connect on, applying the second description gathers one local
/// candidate, reports `Connected` and announces one remote track.
pub struct MockConnection {
    peer_id: PeerId,
    config: ConnectionConfig,
    sink: ConnectionEventSink,
    auto_connect: bool,
    state: Mutex<ConnectionState>,
    local: Mutex<Option<SessionDescription>>,
    remote: Mutex<Option<SessionDescription>>,
    video: Mutex<Option<MediaTrack>>,
    candidates: Mutex<Vec<IceCandidate>>,
    offers: AtomicUsize,
    ice_restarts: AtomicUsize,
    announced: AtomicBool,
    closed: AtomicBool,
}

impl MockConnection {
    fn new(config: ConnectionConfig, sink: ConnectionEventSink, auto_connect: bool) -> Self {
        let video = config
            .tracks
            .iter()
            .find(|t| t.kind() == TrackKind::Video)
            .cloned();
        Self {
            peer_id: config.peer_id.clone(),
            config,
            sink,
            auto_connect,
            state: Mutex::new(ConnectionState::New),
            local: Mutex::new(None),
            remote: Mutex::new(None),
            video: Mutex::new(video),
            candidates: Mutex::new(Vec::new()),
            offers: AtomicUsize::new(0),
            ice_restarts: AtomicUsize::new(0),
            announced: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Remote participant
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Configuration the connection was created with
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Outgoing video track
    pub fn video_track(&self) -> Option<MediaTrack> {
        self.video.lock().clone()
    }

    /// Candidates applied from the peer
    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.candidates.lock().clone()
    }

    /// Offers generated, ICE restarts included
    pub fn offers_created(&self) -> usize {
        self.offers.load(Ordering::SeqCst)
    }

    /// Offers generated with ICE restart
    pub fn ice_restarts(&self) -> usize {
        self.ice_restarts.load(Ordering::SeqCst)
    }

    /// Applied local description
    pub fn local_description(&self) -> Option<SessionDescription> {
        self.local.lock().clone()
    }

    /// Applied remote description
    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.remote.lock().clone()
    }

    /// Whether `close` was called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Report a state change as the platform would
    pub fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
        self.sink.state_changed(state);
    }

    /// Report a connection failure
    pub fn fail(&self) {
        self.set_state(ConnectionState::Failed);
    }

    fn maybe_connect(&self) {
        if !self.auto_connect || self.is_closed() {
            return;
        }
        if self.local.lock().is_none() || self.remote.lock().is_none() {
            return;
        }
        if *self.state.lock() == ConnectionState::Connected {
            return;
        }

        self.sink.local_candidate(IceCandidate {
            candidate: format!("candidate:1 1 udp 2122260223 10.0.0.1 50000 typ host ({})", self.peer_id),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        });
        self.set_state(ConnectionState::Connected);
        if !self.announced.swap(true, Ordering::SeqCst) {
            self.sink.remote_track(MediaTrack::new(
                TrackKind::Video,
                TrackSource::Remote(self.peer_id.clone()),
                format!("remote-{}", self.peer_id),
            ));
        }
    }
}

#[async_trait]
impl MediaConnection for MockConnection {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, ProviderError> {
        let n = self.offers.fetch_add(1, Ordering::SeqCst) + 1;
        if ice_restart {
            self.ice_restarts.fetch_add(1, Ordering::SeqCst);
        }
        Ok(SessionDescription::offer(format!(
            "v=0 mock-offer to={} n={n} restart={ice_restart}",
            self.peer_id
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription, ProviderError> {
        if self.remote.lock().is_none() {
            return Err(ProviderError::Connection(
                "no remote offer applied".to_string(),
            ));
        }
        Ok(SessionDescription::answer(format!(
            "v=0 mock-answer to={}",
            self.peer_id
        )))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), ProviderError> {
        *self.local.lock() = Some(description);
        {
            let mut state = self.state.lock();
            if *state == ConnectionState::New {
                *state = ConnectionState::Connecting;
            }
        }
        self.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), ProviderError> {
        *self.remote.lock() = Some(description);
        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), ProviderError> {
        self.candidates.lock().push(candidate);
        Ok(())
    }

    async fn replace_video_track(&self, track: Option<MediaTrack>) -> Result<(), ProviderError> {
        *self.video.lock() = track;
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        *self.state.lock()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        *self.state.lock() = ConnectionState::Closed;
    }
}

/// Signaling transport that records what is sent
///
/// Inbound messages are queued with [`RecordingTransport::push_inbound`];
/// [`RecordingTransport::drop_connection`] makes the pending receive report
/// a closed connection.
pub struct RecordingTransport {
    sent: Mutex<Vec<SignalingMessage>>,
    inbound_tx: mpsc::UnboundedSender<Option<SignalingMessage>>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Option<SignalingMessage>>>,
    connects: AtomicUsize,
    fail_sends: AtomicBool,
}

impl RecordingTransport {
    /// Create an idle transport
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            sent: Mutex::new(Vec::new()),
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            connects: AtomicUsize::new(0),
            fail_sends: AtomicBool::new(false),
        }
    }

    /// Every message sent so far
    pub fn sent(&self) -> Vec<SignalingMessage> {
        self.sent.lock().clone()
    }

    /// Messages sent so far with the given wire type
    pub fn sent_of_type(&self, message_type: &str) -> Vec<SignalingMessage> {
        self.sent
            .lock()
            .iter()
            .filter(|m| m.message_type() == message_type)
            .cloned()
            .collect()
    }

    /// Forget recorded messages
    pub fn clear_sent(&self) {
        self.sent.lock().clear();
    }

    /// Make every send fail with a transport error
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Queue a message for the receiver
    pub fn push_inbound(&self, message: SignalingMessage) {
        let _ = self.inbound_tx.send(Some(message));
    }

    /// Make the receiver observe a closed connection
    pub fn drop_connection(&self) {
        let _ = self.inbound_tx.send(None);
    }

    /// Number of `connect` calls
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

impl Default for RecordingTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SignalingTransport for RecordingTransport {
    async fn connect(&self) -> Result<(), SignalingError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn send_message(&self, message: &SignalingMessage) -> Result<(), SignalingError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(SignalingError::TransportError("send refused".to_string()));
        }
        self.sent.lock().push(message.clone());
        Ok(())
    }

    async fn receive_message(&self) -> Result<Option<SignalingMessage>, SignalingError> {
        let mut rx = self.inbound_rx.lock().await;
        Ok(rx.recv().await.flatten())
    }

    async fn close(&self) {}
}

#[derive(Debug, Default)]
struct HubCall {
    members: Vec<PeerId>,
    joined: Vec<PeerId>,
}

#[derive(Default)]
struct HubState {
    clients: HashMap<PeerId, mpsc::UnboundedSender<Option<SignalingMessage>>>,
    calls: HashMap<CallId, HubCall>,
    routed: Vec<(PeerId, SignalingMessage)>,
}

impl HubState {
    fn deliver(&self, to: &PeerId, message: SignalingMessage) {
        match self.clients.get(to) {
            Some(client) => {
                let _ = client.send(Some(message));
            }
            None => tracing::debug!(peer_id = %to, "Hub dropping message for offline peer"),
        }
    }
}

/// In-process coordination server
///
/// Tracks who invited whom and who has joined so it can turn answers into
/// `peer:joined` fan-out and hang-ups into `peer:left` or `call:ended`.
/// Negotiation messages are forwarded with `peerId` rewritten to the sender.
#[derive(Clone, Default)]
pub struct SignalingHub {
    state: Arc<Mutex<HubState>>,
}

impl SignalingHub {
    /// Empty hub
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport for the client identified by `peer_id`
    pub fn transport(&self, peer_id: impl Into<PeerId>) -> HubTransport {
        HubTransport {
            peer_id: peer_id.into(),
            hub: self.clone(),
            inbound: tokio::sync::Mutex::new(None),
        }
    }

    /// Every message the hub accepted, with its sender
    pub fn routed(&self) -> Vec<(PeerId, SignalingMessage)> {
        self.state.lock().routed.clone()
    }

    /// Clients currently connected
    pub fn connected_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<_> = self.state.lock().clients.keys().cloned().collect();
        peers.sort();
        peers
    }

    /// Close the connection of `peer_id` from the server side
    pub fn drop_connection(&self, peer_id: &PeerId) {
        if let Some(client) = self.state.lock().clients.remove(peer_id) {
            let _ = client.send(None);
        }
    }

    fn register(&self, peer_id: PeerId, sender: mpsc::UnboundedSender<Option<SignalingMessage>>) {
        self.state.lock().clients.insert(peer_id, sender);
    }

    fn route(&self, from: &PeerId, message: &SignalingMessage) -> Result<(), SignalingError> {
        let mut state = self.state.lock();
        if !state.clients.contains_key(from) {
            return Err(SignalingError::NotConnected);
        }
        state.routed.push((from.clone(), message.clone()));

        match message {
            SignalingMessage::Invite {
                call_id,
                participants,
                ..
            } => {
                let members: Vec<PeerId> = participants.iter().map(|p| p.id.clone()).collect();
                for member in members.iter().filter(|m| *m != from) {
                    state.deliver(member, message.clone());
                }
                state.calls.insert(
                    call_id.clone(),
                    HubCall {
                        members,
                        joined: vec![from.clone()],
                    },
                );
            }
            SignalingMessage::Answer { call_id, .. } => {
                let Some(call) = state.calls.get_mut(call_id) else {
                    return Ok(());
                };
                let previously_joined = call.joined.clone();
                if !call.joined.contains(from) {
                    call.joined.push(from.clone());
                }
                let members = call.members.clone();
                for member in members.iter().filter(|m| *m != from) {
                    state.deliver(member, message.clone());
                }
                for peer in previously_joined.iter().filter(|p| *p != from) {
                    state.deliver(
                        peer,
                        SignalingMessage::PeerJoined {
                            peer_id: from.clone(),
                        },
                    );
                }
            }
            SignalingMessage::Reject { call_id, .. } => {
                let Some(call) = state.calls.get_mut(call_id) else {
                    return Ok(());
                };
                call.members.retain(|m| m != from);
                let members = call.members.clone();
                for member in &members {
                    state.deliver(member, message.clone());
                }
            }
            SignalingMessage::Offer { peer_id, sdp } => {
                state.deliver(
                    peer_id,
                    SignalingMessage::Offer {
                        peer_id: from.clone(),
                        sdp: sdp.clone(),
                    },
                );
            }
            SignalingMessage::AnswerSdp { peer_id, sdp } => {
                state.deliver(
                    peer_id,
                    SignalingMessage::AnswerSdp {
                        peer_id: from.clone(),
                        sdp: sdp.clone(),
                    },
                );
            }
            SignalingMessage::IceCandidate { peer_id, candidate } => {
                state.deliver(
                    peer_id,
                    SignalingMessage::IceCandidate {
                        peer_id: from.clone(),
                        candidate: candidate.clone(),
                    },
                );
            }
            SignalingMessage::Ended { call_id } => {
                let Some(mut call) = state.calls.remove(call_id) else {
                    return Ok(());
                };
                call.members.retain(|m| m != from);
                call.joined.retain(|m| m != from);
                if call.joined.len() >= 2 {
                    for peer in &call.joined {
                        state.deliver(
                            peer,
                            SignalingMessage::PeerLeft {
                                peer_id: from.clone(),
                            },
                        );
                    }
                    state.calls.insert(call_id.clone(), call);
                } else {
                    for member in &call.members {
                        state.deliver(member, message.clone());
                    }
                }
            }
            SignalingMessage::PeerJoined { .. } | SignalingMessage::PeerLeft { .. } => {
                tracing::debug!(peer_id = %from, "Hub ignoring server-only message from client");
            }
        }
        Ok(())
    }
}

/// One client's connection to a [`SignalingHub`]
pub struct HubTransport {
    peer_id: PeerId,
    hub: SignalingHub,
    inbound: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<Option<SignalingMessage>>>>,
}

impl HubTransport {
    /// Client identity on the hub
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }
}

#[async_trait]
impl SignalingTransport for HubTransport {
    async fn connect(&self) -> Result<(), SignalingError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.hub.register(self.peer_id.clone(), tx);
        *self.inbound.lock().await = Some(rx);
        Ok(())
    }

    async fn send_message(&self, message: &SignalingMessage) -> Result<(), SignalingError> {
        self.hub.route(&self.peer_id, message)
    }

    async fn receive_message(&self) -> Result<Option<SignalingMessage>, SignalingError> {
        let mut guard = self.inbound.lock().await;
        let rx = guard.as_mut().ok_or(SignalingError::NotConnected)?;
        match rx.recv().await {
            Some(Some(message)) => Ok(Some(message)),
            Some(None) | None => {
                *guard = None;
                Ok(None)
            }
        }
    }

    async fn close(&self) {
        self.inbound.lock().await.take();
    }
}
