//! Media Transport Provider boundary
//!
//! The platform facility that captures audio/video and moves packets between
//! peers is a black box to the orchestrator. It is reached through four
//! capability operations:
//!
//! - [`MediaTransportProvider::acquire_local_media`]
//! - [`MediaTransportProvider::acquire_screen_capture`]
//! - [`MediaTransportProvider::create_connection`]
//! - description/candidate exchange on the returned [`MediaConnection`]
//!
//! and reports back through a [`ConnectionEventSink`]: remote tracks,
//! connection state changes and locally gathered candidates.

use crate::identity::PeerId;
use crate::types::{ConnectionState, FacingMode, IceCandidate, IceServer, SessionDescription};
use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

/// Errors reported by the provider
#[derive(Error, Debug, Clone)]
pub enum ProviderError {
    /// The user or platform refused capture
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// No capture device of the requested kind
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Capability not available on this platform
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Connection object failure
    #[error("Connection error: {0}")]
    Connection(String),
}

/// Audio or video
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    /// Audio samples
    Audio,
    /// Video frames
    Video,
}

/// Origin of a track
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackSource {
    /// Local microphone
    Microphone,
    /// Local camera
    Camera(FacingMode),
    /// Local screen capture
    Screen,
    /// Received from a peer
    Remote(PeerId),
}

struct TrackInner {
    id: String,
    kind: TrackKind,
    source: TrackSource,
    label: String,
    enabled: AtomicBool,
    ended: watch::Sender<bool>,
}

/// Handle to a media track
///
/// Clones share the same underlying track, so flipping `enabled` on one
/// handle is seen by every connection the track was handed to.
#[derive(Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

impl MediaTrack {
    /// Create a live, enabled track
    pub fn new(kind: TrackKind, source: TrackSource, label: impl Into<String>) -> Self {
        let (ended, _) = watch::channel(false);
        Self {
            inner: Arc::new(TrackInner {
                id: Uuid::new_v4().to_string(),
                kind,
                source,
                label: label.into(),
                enabled: AtomicBool::new(true),
                ended,
            }),
        }
    }

    /// Track identifier
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Audio or video
    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    /// Where the track comes from
    pub fn source(&self) -> &TrackSource {
        &self.inner.source
    }

    /// Device label
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Whether samples/frames are sent
    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// Enable or disable the track in place
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Whether the track has been stopped
    pub fn is_ended(&self) -> bool {
        *self.inner.ended.borrow()
    }

    /// Stop the track and release the device behind it
    ///
    /// Also used by providers when the platform ends a capture on its own
    /// (e.g. the user stops a screen share from system UI).
    pub fn stop(&self) {
        self.inner.ended.send_replace(true);
    }

    /// Resolve once the track is stopped
    pub async fn ended(&self) {
        let mut rx = self.inner.ended.subscribe();
        // The sender lives as long as `self`, so this only resolves on stop.
        let _ = rx.wait_for(|ended| *ended).await;
    }
}

impl PartialEq for MediaTrack {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for MediaTrack {}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("source", &self.inner.source)
            .field("enabled", &self.is_enabled())
            .field("ended", &self.is_ended())
            .finish()
    }
}

/// What to capture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureRequest {
    /// Include a microphone track
    pub audio: bool,
    /// Include a camera track facing this way
    pub video: Option<FacingMode>,
}

/// Tracks returned by a capture request
#[derive(Debug, Clone, Default)]
pub struct LocalCapture {
    /// Microphone track
    pub audio: Option<MediaTrack>,
    /// Camera track
    pub video: Option<MediaTrack>,
}

impl LocalCapture {
    /// Every captured track
    pub fn tracks(&self) -> Vec<MediaTrack> {
        self.audio.iter().chain(self.video.iter()).cloned().collect()
    }

    /// Stop every captured track
    pub fn stop_all(&self) {
        for track in self.tracks() {
            track.stop();
        }
    }
}

/// Parameters for a new connection object
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Remote participant
    pub peer_id: PeerId,
    /// STUN/TURN servers
    pub ice_servers: Vec<IceServer>,
    /// Local tracks to send from the start
    pub tracks: Vec<MediaTrack>,
}

/// Notification from a connection object
#[derive(Debug, Clone)]
pub enum ConnectionEventKind {
    /// Remote track available
    RemoteTrack(MediaTrack),
    /// Connection state changed
    StateChanged(ConnectionState),
    /// Local candidate gathered, to be sent to the peer
    LocalCandidate(IceCandidate),
}

/// Notification tagged with the link it belongs to
#[derive(Debug, Clone)]
pub struct ConnectionEvent {
    /// Remote participant
    pub peer_id: PeerId,
    /// Link generation; events from replaced links are ignored
    pub link_id: u64,
    /// Payload
    pub kind: ConnectionEventKind,
}

/// Callback handle given to the provider with every connection
#[derive(Debug, Clone)]
pub struct ConnectionEventSink {
    peer_id: PeerId,
    link_id: u64,
    sender: mpsc::UnboundedSender<ConnectionEvent>,
}

impl ConnectionEventSink {
    /// Create a sink feeding `sender`
    pub fn new(
        peer_id: PeerId,
        link_id: u64,
        sender: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        Self {
            peer_id,
            link_id,
            sender,
        }
    }

    /// Remote participant this sink reports for
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    fn emit(&self, kind: ConnectionEventKind) {
        let event = ConnectionEvent {
            peer_id: self.peer_id.clone(),
            link_id: self.link_id,
            kind,
        };
        if self.sender.send(event).is_err() {
            tracing::trace!(peer_id = %self.peer_id, "Connection event dropped, mesh gone");
        }
    }

    /// Report a remote track
    pub fn remote_track(&self, track: MediaTrack) {
        self.emit(ConnectionEventKind::RemoteTrack(track));
    }

    /// Report a connection state change
    pub fn state_changed(&self, state: ConnectionState) {
        self.emit(ConnectionEventKind::StateChanged(state));
    }

    /// Report a locally gathered candidate
    pub fn local_candidate(&self, candidate: IceCandidate) {
        self.emit(ConnectionEventKind::LocalCandidate(candidate));
    }
}

/// Connection object to one remote participant
#[async_trait]
pub trait MediaConnection: Send + Sync {
    /// Generate an offer; `ice_restart` gathers fresh candidates
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, ProviderError>;

    /// Generate an answer to the applied remote offer
    async fn create_answer(&self) -> Result<SessionDescription, ProviderError>;

    /// Apply a locally generated description
    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), ProviderError>;

    /// Apply the peer's description
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), ProviderError>;

    /// Apply a peer candidate
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), ProviderError>;

    /// Swap the outgoing video track without renegotiation
    async fn replace_video_track(&self, track: Option<MediaTrack>) -> Result<(), ProviderError>;

    /// Current connection state
    fn connection_state(&self) -> ConnectionState;

    /// Close the connection
    async fn close(&self);
}

/// Platform media capability
#[async_trait]
pub trait MediaTransportProvider: Send + Sync {
    /// Acquire microphone and/or camera
    async fn acquire_local_media(
        &self,
        request: CaptureRequest,
    ) -> Result<LocalCapture, ProviderError>;

    /// Acquire a screen capture video track
    async fn acquire_screen_capture(&self) -> Result<MediaTrack, ProviderError>;

    /// Create a connection object seeded with ICE servers and initial tracks
    async fn create_connection(
        &self,
        config: ConnectionConfig,
        events: ConnectionEventSink,
    ) -> Result<Arc<dyn MediaConnection>, ProviderError>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_track_enabled_is_shared_between_clones() {
        let track = MediaTrack::new(TrackKind::Audio, TrackSource::Microphone, "mic");
        let clone = track.clone();
        clone.set_enabled(false);
        assert!(!track.is_enabled());
        assert_eq!(track, clone);
    }

    #[tokio::test]
    async fn test_ended_resolves_after_stop() {
        let track = MediaTrack::new(TrackKind::Video, TrackSource::Screen, "screen");
        let waiter = {
            let track = track.clone();
            tokio::spawn(async move { track.ended().await })
        };
        track.stop();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(track.is_ended());
    }

    #[test]
    fn test_ended_pending_until_stop() {
        let track = MediaTrack::new(TrackKind::Video, TrackSource::Screen, "screen");
        let mut ended = tokio_test::task::spawn(track.ended());
        tokio_test::assert_pending!(ended.poll());

        track.stop();
        assert!(ended.is_woken());
        tokio_test::assert_ready!(ended.poll());
    }

    #[tokio::test]
    async fn test_sink_tags_events_with_link() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = ConnectionEventSink::new(PeerId::new("bob"), 7, tx);
        sink.state_changed(ConnectionState::Connected);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.peer_id, PeerId::new("bob"));
        assert_eq!(event.link_id, 7);
        assert!(matches!(
            event.kind,
            ConnectionEventKind::StateChanged(ConnectionState::Connected)
        ));
    }

    #[test]
    fn test_local_capture_stop_all() {
        let capture = LocalCapture {
            audio: Some(MediaTrack::new(TrackKind::Audio, TrackSource::Microphone, "mic")),
            video: Some(MediaTrack::new(
                TrackKind::Video,
                TrackSource::Camera(FacingMode::User),
                "cam",
            )),
        };
        capture.stop_all();
        assert!(capture.tracks().iter().all(MediaTrack::is_ended));
    }
}
