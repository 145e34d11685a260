//! Outgoing video swaps racing each other across peer links

use async_trait::async_trait;
use meshcall_core::testing::{MockMediaProvider, RecordingTransport};
use meshcall_core::{
    CaptureRequest, ConnectionConfig, ConnectionEventSink, ConnectionState, EventBus, FacingMode,
    IceCandidate, LocalCapture, MediaConfig, MediaConnection, MediaController, MediaTrack,
    MediaTransportProvider, MeshConfig, OutgoingTracks, PeerId, PeerMesh, ProviderError,
    SessionDescription, SignalingChannel, TrackSource,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Connection whose track replacement takes a while, longest for the
/// front camera
struct SlowSwapConnection {
    inner: Arc<dyn MediaConnection>,
}

#[async_trait]
impl MediaConnection for SlowSwapConnection {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, ProviderError> {
        self.inner.create_offer(ice_restart).await
    }

    async fn create_answer(&self) -> Result<SessionDescription, ProviderError> {
        self.inner.create_answer().await
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), ProviderError> {
        self.inner.set_local_description(description).await
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), ProviderError> {
        self.inner.set_remote_description(description).await
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), ProviderError> {
        self.inner.add_ice_candidate(candidate).await
    }

    async fn replace_video_track(&self, track: Option<MediaTrack>) -> Result<(), ProviderError> {
        let delay = match track.as_ref().map(MediaTrack::source) {
            Some(TrackSource::Camera(FacingMode::User)) => Duration::from_millis(50),
            _ => Duration::from_millis(1),
        };
        tokio::time::sleep(delay).await;
        self.inner.replace_video_track(track).await
    }

    fn connection_state(&self) -> ConnectionState {
        self.inner.connection_state()
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}

struct SlowSwapProvider {
    inner: Arc<MockMediaProvider>,
}

#[async_trait]
impl MediaTransportProvider for SlowSwapProvider {
    async fn acquire_local_media(
        &self,
        request: CaptureRequest,
    ) -> Result<LocalCapture, ProviderError> {
        self.inner.acquire_local_media(request).await
    }

    async fn acquire_screen_capture(&self) -> Result<MediaTrack, ProviderError> {
        self.inner.acquire_screen_capture().await
    }

    async fn create_connection(
        &self,
        config: ConnectionConfig,
        events: ConnectionEventSink,
    ) -> Result<Arc<dyn MediaConnection>, ProviderError> {
        let inner = self.inner.create_connection(config, events).await?;
        Ok(Arc::new(SlowSwapConnection { inner }))
    }
}

struct Harness {
    media: Arc<MediaController>,
    mesh: Arc<PeerMesh>,
    mock: Arc<MockMediaProvider>,
}

fn harness() -> Harness {
    let mock = Arc::new(MockMediaProvider::new());
    let provider = Arc::new(SlowSwapProvider {
        inner: Arc::clone(&mock),
    });
    let events = EventBus::default();
    let signaling = Arc::new(SignalingChannel::new(
        Arc::new(RecordingTransport::new()),
        Default::default(),
        events.clone(),
    ));
    let (outgoing, outgoing_rx) = watch::channel(OutgoingTracks::default());
    let (mesh, _connection_events) = PeerMesh::new(
        MeshConfig::default(),
        provider.clone(),
        signaling,
        events.clone(),
        outgoing_rx,
    );
    let media = Arc::new(MediaController::new(
        MediaConfig::default(),
        provider,
        Arc::clone(&mesh),
        events,
        outgoing,
    ));
    Harness { media, mesh, mock }
}

async fn in_call_with(h: &Harness, peers: &[&str]) {
    h.media.acquire_local_media(true).await.unwrap();
    for peer in peers {
        h.mesh.create_link(&PeerId::new(*peer)).await.unwrap();
    }
}

fn assert_links_send_outgoing_video(h: &Harness) {
    let expected = h.media.outgoing_tracks().video.unwrap();
    assert!(!expected.is_ended());
    for connection in h.mock.connections() {
        let sent = connection.video_track().unwrap();
        assert_eq!(
            sent,
            expected,
            "{} sends {:?}, controller sends {:?}",
            connection.peer_id(),
            sent.source(),
            expected.source()
        );
        assert!(!sent.is_ended());
    }
}

#[tokio::test(start_paused = true)]
async fn camera_switch_racing_share_stop_leaves_links_on_new_camera() {
    let h = harness();
    in_call_with(&h, &["a", "b"]).await;
    h.media.start_screen_share().await.unwrap();

    h.mock.set_capture_delay(Some(Duration::from_millis(5)));
    let switch = {
        let media = Arc::clone(&h.media);
        tokio::spawn(async move { media.switch_camera().await })
    };
    tokio::task::yield_now().await;
    h.media.stop_screen_share().await;
    assert_eq!(switch.await.unwrap().unwrap(), FacingMode::Environment);

    assert_eq!(
        h.media.outgoing_tracks().video.unwrap().source(),
        &TrackSource::Camera(FacingMode::Environment)
    );
    assert_links_send_outgoing_video(&h);
}

#[tokio::test(start_paused = true)]
async fn share_stop_racing_camera_switch_leaves_links_on_new_camera() {
    let h = harness();
    in_call_with(&h, &["a", "b"]).await;
    h.media.start_screen_share().await.unwrap();

    let stop = {
        let media = Arc::clone(&h.media);
        tokio::spawn(async move { media.stop_screen_share().await })
    };
    tokio::task::yield_now().await;
    h.mock.set_capture_delay(Some(Duration::from_millis(5)));
    h.media.switch_camera().await.unwrap();
    stop.await.unwrap();

    assert!(!h.media.local_state().unwrap().is_sharing_screen());
    assert_links_send_outgoing_video(&h);
}

#[tokio::test(start_paused = true)]
async fn share_start_racing_camera_switch_keeps_screen_on_links() {
    let h = harness();
    in_call_with(&h, &["a", "b"]).await;

    let start = {
        let media = Arc::clone(&h.media);
        tokio::spawn(async move { media.start_screen_share().await })
    };
    tokio::task::yield_now().await;
    h.media.switch_camera().await.unwrap();
    start.await.unwrap().unwrap();

    assert_eq!(
        h.media.outgoing_tracks().video.unwrap().source(),
        &TrackSource::Screen
    );
    assert_links_send_outgoing_video(&h);
}
