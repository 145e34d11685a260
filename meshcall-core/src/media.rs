//! Local media management
//!
//! The [`MediaController`] exclusively owns the local capture: microphone,
//! camera and the optional screen capture. It flips track flags in place for
//! mute/video-off and swaps the outgoing video track on every peer link for
//! screen share and camera switch, without renegotiation.
//!
//! Every acquisition is tagged with the media epoch current when it started.
//! [`MediaController::release_all`] bumps the epoch, so a capture that
//! completes after teardown is stopped instead of being installed.
//!
//! Screen share start/stop and camera switch are serialized: each holds the
//! swap lock until every link has received its track, so links never end up
//! on a track a later swap already replaced and stopped.

use crate::events::{CallEvent, EventBus};
use crate::mesh::PeerMesh;
use crate::provider::{CaptureRequest, MediaTrack, MediaTransportProvider, ProviderError};
use crate::types::FacingMode;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

/// Media-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    /// Capture permission refused or no device available
    #[error("Media access denied: {0}")]
    MediaAccessDenied(String),

    /// Screen sharing is disabled or unsupported
    #[error("Screen share unavailable")]
    ScreenShareUnavailable,

    /// No local capture is held
    #[error("No local media")]
    NoLocalMedia,

    /// Local capture has no camera track
    #[error("No video track")]
    NoVideoTrack,

    /// Media was released while the operation was in flight
    #[error("Media released during acquisition")]
    Released,

    /// Any other capture failure
    #[error("Capture failed: {0}")]
    Capture(String),
}

impl From<ProviderError> for MediaError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::PermissionDenied(msg) | ProviderError::DeviceNotFound(msg) => {
                MediaError::MediaAccessDenied(msg)
            }
            ProviderError::Unsupported(msg) | ProviderError::Connection(msg) => {
                MediaError::Capture(msg)
            }
        }
    }
}

/// Media configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Screen sharing feature flag
    pub screen_share_enabled: bool,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            screen_share_enabled: true,
        }
    }
}

/// Tracks every peer link should be sending right now
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutgoingTracks {
    /// Microphone track
    pub audio: Option<MediaTrack>,
    /// Screen track while sharing, camera track otherwise
    pub video: Option<MediaTrack>,
}

impl OutgoingTracks {
    /// Every outgoing track
    #[must_use]
    pub fn tracks(&self) -> Vec<MediaTrack> {
        self.audio.iter().chain(self.video.iter()).cloned().collect()
    }
}

/// Local capture state
#[derive(Debug, Clone)]
pub struct LocalMediaState {
    /// Microphone track
    pub audio: Option<MediaTrack>,
    /// Camera track
    pub camera: Option<MediaTrack>,
    /// Facing of the camera track
    pub facing: FacingMode,
    /// Microphone disabled
    pub is_muted: bool,
    /// Camera disabled
    pub is_video_off: bool,
    /// Screen capture, only while sharing
    pub screen: Option<MediaTrack>,
}

impl LocalMediaState {
    /// Whether a screen capture is being sent
    #[must_use]
    pub fn is_sharing_screen(&self) -> bool {
        self.screen.is_some()
    }

    fn outgoing(&self) -> OutgoingTracks {
        OutgoingTracks {
            audio: self.audio.clone(),
            video: self.screen.clone().or_else(|| self.camera.clone()),
        }
    }

    fn stop_all(&self) {
        for track in self
            .audio
            .iter()
            .chain(self.camera.iter())
            .chain(self.screen.iter())
        {
            track.stop();
        }
    }
}

/// Owner of the local capture
pub struct MediaController {
    config: MediaConfig,
    provider: Arc<dyn MediaTransportProvider>,
    mesh: Arc<PeerMesh>,
    events: EventBus,
    state: Mutex<Option<LocalMediaState>>,
    epoch: AtomicU64,
    outgoing: watch::Sender<OutgoingTracks>,
    video_swap: tokio::sync::Mutex<()>,
}

impl MediaController {
    /// Create a controller publishing its outgoing tracks on `outgoing`
    ///
    /// `mesh` must have been built with the receiving end of `outgoing` so
    /// new links are seeded with the current tracks.
    pub fn new(
        config: MediaConfig,
        provider: Arc<dyn MediaTransportProvider>,
        mesh: Arc<PeerMesh>,
        events: EventBus,
        outgoing: watch::Sender<OutgoingTracks>,
    ) -> Self {
        Self {
            config,
            provider,
            mesh,
            events,
            state: Mutex::new(None),
            epoch: AtomicU64::new(0),
            outgoing,
            video_swap: tokio::sync::Mutex::new(()),
        }
    }

    /// Acquire microphone and, optionally, camera
    ///
    /// # Errors
    ///
    /// - [`MediaError::MediaAccessDenied`] if permission is refused or no
    ///   device exists
    /// - [`MediaError::Released`] if [`MediaController::release_all`] ran
    ///   while capture was pending
    #[tracing::instrument(skip(self))]
    pub async fn acquire_local_media(
        &self,
        include_video: bool,
    ) -> Result<Vec<MediaTrack>, MediaError> {
        let epoch = self.epoch.load(Ordering::SeqCst);
        let request = CaptureRequest {
            audio: true,
            video: include_video.then_some(FacingMode::User),
        };
        let capture = self.provider.acquire_local_media(request).await.map_err(|e| {
            tracing::warn!(error = %e, "Local capture failed");
            MediaError::from(e)
        })?;

        let previous = {
            let mut state = self.state.lock();
            if self.epoch.load(Ordering::SeqCst) != epoch {
                drop(state);
                capture.stop_all();
                return Err(MediaError::Released);
            }
            state.replace(LocalMediaState {
                audio: capture.audio.clone(),
                camera: capture.video.clone(),
                facing: FacingMode::User,
                is_muted: false,
                is_video_off: false,
                screen: None,
            })
        };
        if let Some(previous) = previous {
            previous.stop_all();
        }

        self.publish_outgoing();
        let tracks = capture.tracks();
        tracing::info!(tracks = tracks.len(), "Local media acquired");
        self.events.publish(CallEvent::LocalStream {
            tracks: tracks.clone(),
        });
        Ok(tracks)
    }

    /// Flip the microphone enabled flag; returns the new mute state
    ///
    /// # Errors
    ///
    /// Returns [`MediaError::NoLocalMedia`] when no microphone is held
    pub fn toggle_mute(&self) -> Result<bool, MediaError> {
        let muted = {
            let mut state = self.state.lock();
            let local = state.as_mut().ok_or(MediaError::NoLocalMedia)?;
            let audio = local.audio.as_ref().ok_or(MediaError::NoLocalMedia)?;
            local.is_muted = !local.is_muted;
            audio.set_enabled(!local.is_muted);
            local.is_muted
        };
        tracing::debug!(muted, "Mute toggled");
        self.events.publish(CallEvent::MuteChanged { muted });
        Ok(muted)
    }

    /// Flip the camera enabled flag; returns the new video-off state
    ///
    /// # Errors
    ///
    /// Returns [`MediaError::NoLocalMedia`] or [`MediaError::NoVideoTrack`]
    pub fn toggle_video(&self) -> Result<bool, MediaError> {
        let video_off = {
            let mut state = self.state.lock();
            let local = state.as_mut().ok_or(MediaError::NoLocalMedia)?;
            let camera = local.camera.as_ref().ok_or(MediaError::NoVideoTrack)?;
            local.is_video_off = !local.is_video_off;
            camera.set_enabled(!local.is_video_off);
            local.is_video_off
        };
        tracing::debug!(video_off, "Video toggled");
        self.events.publish(CallEvent::VideoChanged { video_off });
        Ok(video_off)
    }

    /// Send a screen capture instead of the camera on every link
    ///
    /// No-op while already sharing. When the platform ends the capture on
    /// its own, [`MediaController::stop_screen_share`] runs automatically.
    ///
    /// # Errors
    ///
    /// - [`MediaError::ScreenShareUnavailable`] if the feature is disabled
    /// - [`MediaError::NoLocalMedia`] outside a call
    /// - [`MediaError::MediaAccessDenied`] if the capture is refused
    #[tracing::instrument(skip(self))]
    pub async fn start_screen_share(self: &Arc<Self>) -> Result<(), MediaError> {
        if !self.config.screen_share_enabled {
            return Err(MediaError::ScreenShareUnavailable);
        }
        let _swap = self.video_swap.lock().await;
        let sharing = self
            .state
            .lock()
            .as_ref()
            .map(LocalMediaState::is_sharing_screen)
            .ok_or(MediaError::NoLocalMedia)?;
        if sharing {
            return Ok(());
        }

        let epoch = self.epoch.load(Ordering::SeqCst);
        let screen = self
            .provider
            .acquire_screen_capture()
            .await
            .map_err(|e| match e {
                ProviderError::Unsupported(_) => MediaError::ScreenShareUnavailable,
                other => MediaError::from(other),
            })?;

        {
            let mut state = self.state.lock();
            if self.epoch.load(Ordering::SeqCst) != epoch {
                drop(state);
                screen.stop();
                return Err(MediaError::Released);
            }
            let Some(local) = state.as_mut() else {
                drop(state);
                screen.stop();
                return Err(MediaError::Released);
            };
            if local.is_sharing_screen() {
                drop(state);
                screen.stop();
                return Ok(());
            }
            local.screen = Some(screen.clone());
        }

        self.publish_outgoing();
        self.mesh.replace_video_track(Some(screen.clone())).await;
        self.watch_screen_end(screen);
        tracing::info!("Screen share started");
        self.events.publish(CallEvent::ScreenShareStarted);
        Ok(())
    }

    fn watch_screen_end(self: &Arc<Self>, screen: MediaTrack) {
        let controller = Arc::downgrade(self);
        tokio::spawn(async move {
            screen.ended().await;
            let Some(controller) = controller.upgrade() else {
                return;
            };
            let still_current = controller
                .state
                .lock()
                .as_ref()
                .and_then(|local| local.screen.as_ref())
                .is_some_and(|current| *current == screen);
            if still_current {
                tracing::info!("Screen capture ended externally");
                controller.stop_screen_share().await;
            }
        });
    }

    /// Release the screen capture and send the camera again; no-op when not sharing
    #[tracing::instrument(skip(self))]
    pub async fn stop_screen_share(&self) {
        let _swap = self.video_swap.lock().await;
        let (screen, camera) = {
            let mut state = self.state.lock();
            let Some(local) = state.as_mut() else {
                return;
            };
            let Some(screen) = local.screen.take() else {
                return;
            };
            (screen, local.camera.clone())
        };

        screen.stop();
        self.publish_outgoing();
        self.mesh.replace_video_track(camera).await;
        tracing::info!("Screen share stopped");
        self.events.publish(CallEvent::ScreenShareStopped);
    }

    /// Replace the camera with the opposite-facing one
    ///
    /// While sharing, only the stored camera is swapped; the outgoing screen
    /// track is untouched. The new camera inherits the video-off state.
    ///
    /// # Errors
    ///
    /// Returns error if there is no camera or the new one cannot be
    /// acquired; the original camera stays in use.
    #[tracing::instrument(skip(self))]
    pub async fn switch_camera(&self) -> Result<FacingMode, MediaError> {
        let _swap = self.video_swap.lock().await;
        let (old_camera, facing) = {
            let state = self.state.lock();
            let local = state.as_ref().ok_or(MediaError::NoLocalMedia)?;
            let camera = local.camera.clone().ok_or(MediaError::NoVideoTrack)?;
            (camera, local.facing.opposite())
        };

        let epoch = self.epoch.load(Ordering::SeqCst);
        let capture = self
            .provider
            .acquire_local_media(CaptureRequest {
                audio: false,
                video: Some(facing),
            })
            .await
            .map_err(|e| {
                tracing::warn!(error = %e, "Camera switch failed, keeping current camera");
                MediaError::from(e)
            })?;
        if let Some(stray) = &capture.audio {
            stray.stop();
        }
        let Some(new_camera) = capture.video else {
            return Err(MediaError::Capture("no camera track returned".to_string()));
        };

        let sharing = {
            let mut state = self.state.lock();
            let current = state
                .as_mut()
                .filter(|_| self.epoch.load(Ordering::SeqCst) == epoch);
            let Some(local) = current else {
                drop(state);
                new_camera.stop();
                return Err(MediaError::Released);
            };
            if local.camera.as_ref() != Some(&old_camera) {
                drop(state);
                new_camera.stop();
                return Err(MediaError::Capture(
                    "camera changed during switch".to_string(),
                ));
            }
            new_camera.set_enabled(!local.is_video_off);
            local.camera = Some(new_camera.clone());
            local.facing = facing;
            local.is_sharing_screen()
        };

        self.publish_outgoing();
        if !sharing {
            self.mesh.replace_video_track(Some(new_camera)).await;
        }
        old_camera.stop();

        tracing::info!(?facing, "Camera switched");
        self.events.publish(CallEvent::CameraSwitched { facing });
        Ok(facing)
    }

    /// Stop and forget every local track, screen capture included
    ///
    /// Synchronous: the capture is released before this returns, and any
    /// acquisition still in flight is stopped when it completes.
    pub fn release_all(&self) {
        let released = {
            let mut state = self.state.lock();
            self.epoch.fetch_add(1, Ordering::SeqCst);
            state.take()
        };
        if let Some(local) = released {
            local.stop_all();
            tracing::debug!("Local media released");
        }
        self.outgoing.send_replace(OutgoingTracks::default());
    }

    /// Whether any local capture is held
    #[must_use]
    pub fn has_local_media(&self) -> bool {
        self.state.lock().is_some()
    }

    /// Snapshot of the local capture
    #[must_use]
    pub fn local_state(&self) -> Option<LocalMediaState> {
        self.state.lock().clone()
    }

    /// Tracks currently sent on every link
    #[must_use]
    pub fn outgoing_tracks(&self) -> OutgoingTracks {
        self.outgoing.borrow().clone()
    }

    fn publish_outgoing(&self) {
        let outgoing = self
            .state
            .lock()
            .as_ref()
            .map(LocalMediaState::outgoing)
            .unwrap_or_default();
        self.outgoing.send_replace(outgoing);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::identity::PeerId;
    use crate::mesh::MeshConfig;
    use crate::signaling::SignalingChannel;
    use crate::testing::{MockMediaProvider, RecordingTransport};
    use crate::provider::TrackSource;

    fn controller_with(config: MediaConfig) -> (Arc<MediaController>, Arc<MockMediaProvider>) {
        let provider = Arc::new(MockMediaProvider::new());
        let events = EventBus::default();
        let signaling = Arc::new(SignalingChannel::new(
            Arc::new(RecordingTransport::new()),
            Default::default(),
            events.clone(),
        ));
        let (outgoing, outgoing_rx) = watch::channel(OutgoingTracks::default());
        let (mesh, _rx) = PeerMesh::new(
            MeshConfig::default(),
            provider.clone(),
            signaling,
            events.clone(),
            outgoing_rx,
        );
        let controller = Arc::new(MediaController::new(
            config,
            provider.clone(),
            mesh,
            events,
            outgoing,
        ));
        (controller, provider)
    }

    fn controller() -> (Arc<MediaController>, Arc<MockMediaProvider>) {
        controller_with(MediaConfig::default())
    }

    #[tokio::test]
    async fn test_acquire_audio_only() {
        let (media, _) = controller();
        let tracks = media.acquire_local_media(false).await.unwrap();
        assert_eq!(tracks.len(), 1);
        let state = media.local_state().unwrap();
        assert!(state.audio.is_some());
        assert!(state.camera.is_none());
        assert!(media.outgoing_tracks().video.is_none());
    }

    #[tokio::test]
    async fn test_acquire_denied() {
        let (media, provider) = controller();
        provider.set_deny_capture(true);
        let res = media.acquire_local_media(true).await;
        assert!(matches!(res, Err(MediaError::MediaAccessDenied(_))));
        assert!(!media.has_local_media());
    }

    #[tokio::test]
    async fn test_toggle_mute_is_involution() {
        let (media, _) = controller();
        media.acquire_local_media(false).await.unwrap();
        assert!(media.toggle_mute().unwrap());
        assert!(!media.toggle_mute().unwrap());
        let audio = media.local_state().unwrap().audio.unwrap();
        assert!(audio.is_enabled());
    }

    #[tokio::test]
    async fn test_toggle_video_flips_track_in_place() {
        let (media, _) = controller();
        media.acquire_local_media(true).await.unwrap();
        let camera = media.local_state().unwrap().camera.unwrap();
        assert!(media.toggle_video().unwrap());
        assert!(!camera.is_enabled());
        assert_eq!(media.local_state().unwrap().camera.unwrap(), camera);
    }

    #[test]
    fn test_toggles_without_media_fail() {
        let (media, _) = controller();
        assert_eq!(media.toggle_mute(), Err(MediaError::NoLocalMedia));
        assert_eq!(media.toggle_video(), Err(MediaError::NoLocalMedia));
    }

    #[tokio::test]
    async fn test_toggle_video_on_audio_call() {
        let (media, _) = controller();
        media.acquire_local_media(false).await.unwrap();
        assert_eq!(media.toggle_video(), Err(MediaError::NoVideoTrack));
    }

    #[tokio::test]
    async fn test_screen_share_disabled() {
        let (media, _) = controller_with(MediaConfig {
            screen_share_enabled: false,
        });
        media.acquire_local_media(true).await.unwrap();
        assert_eq!(
            media.start_screen_share().await,
            Err(MediaError::ScreenShareUnavailable)
        );
    }

    #[tokio::test]
    async fn test_screen_share_swaps_outgoing_video() {
        let (media, provider) = controller();
        media.acquire_local_media(true).await.unwrap();
        let camera = media.local_state().unwrap().camera.unwrap();

        media.start_screen_share().await.unwrap();
        let outgoing = media.outgoing_tracks().video.unwrap();
        assert_eq!(outgoing.source(), &TrackSource::Screen);

        // Second start is a no-op.
        media.start_screen_share().await.unwrap();
        assert_eq!(provider.screen_tracks().len(), 1);

        media.stop_screen_share().await;
        assert_eq!(media.outgoing_tracks().video.unwrap(), camera);
        assert!(provider.screen_tracks()[0].is_ended());
    }

    #[tokio::test]
    async fn test_external_screen_stop_restores_camera() {
        let (media, provider) = controller();
        media.acquire_local_media(true).await.unwrap();
        media.start_screen_share().await.unwrap();

        provider.screen_tracks()[0].stop();
        for _ in 0..20 {
            if !media.local_state().unwrap().is_sharing_screen() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(!media.local_state().unwrap().is_sharing_screen());
    }

    #[tokio::test]
    async fn test_switch_camera_keeps_video_off() {
        let (media, _) = controller();
        media.acquire_local_media(true).await.unwrap();
        let old = media.local_state().unwrap().camera.unwrap();
        media.toggle_video().unwrap();

        let facing = media.switch_camera().await.unwrap();
        assert_eq!(facing, FacingMode::Environment);
        let state = media.local_state().unwrap();
        let new = state.camera.unwrap();
        assert_ne!(new, old);
        assert!(old.is_ended());
        assert!(!new.is_enabled());
        assert_eq!(media.outgoing_tracks().video.unwrap(), new);
    }

    #[tokio::test]
    async fn test_switch_camera_failure_keeps_original() {
        let (media, provider) = controller();
        media.acquire_local_media(true).await.unwrap();
        let old = media.local_state().unwrap().camera.unwrap();
        provider.set_fail_camera_switch(true);

        assert!(matches!(
            media.switch_camera().await,
            Err(MediaError::MediaAccessDenied(_))
        ));
        assert_eq!(media.local_state().unwrap().camera.unwrap(), old);
        assert!(!old.is_ended());
    }

    #[tokio::test]
    async fn test_switch_camera_while_sharing_keeps_screen_outgoing() {
        let (media, _) = controller();
        media.acquire_local_media(true).await.unwrap();
        media.start_screen_share().await.unwrap();

        media.switch_camera().await.unwrap();
        assert_eq!(
            media.outgoing_tracks().video.unwrap().source(),
            &TrackSource::Screen
        );

        media.stop_screen_share().await;
        assert_eq!(
            media.outgoing_tracks().video.unwrap().source(),
            &TrackSource::Camera(FacingMode::Environment)
        );
    }

    #[tokio::test]
    async fn test_release_all_stops_everything() {
        let (media, _) = controller();
        let tracks = media.acquire_local_media(true).await.unwrap();
        media.start_screen_share().await.unwrap();
        let screen = media.local_state().unwrap().screen.unwrap();

        media.release_all();
        assert!(!media.has_local_media());
        assert!(tracks.iter().all(MediaTrack::is_ended));
        assert!(screen.is_ended());
        assert_eq!(media.outgoing_tracks(), OutgoingTracks::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_during_acquisition_discards_capture() {
        let (media, provider) = controller();
        provider.set_capture_delay(Some(std::time::Duration::from_millis(50)));

        let pending = {
            let media = Arc::clone(&media);
            tokio::spawn(async move { media.acquire_local_media(true).await })
        };
        tokio::task::yield_now().await;
        media.release_all();

        assert_eq!(pending.await.unwrap(), Err(MediaError::Released));
        assert!(!media.has_local_media());
    }

    #[tokio::test]
    async fn test_new_links_are_seeded_with_outgoing_tracks() {
        let (media, provider) = controller();
        media.acquire_local_media(true).await.unwrap();
        media.mesh.create_link(&PeerId::new("bob")).await.unwrap();

        let connection = provider.connection_for(&PeerId::new("bob")).unwrap();
        assert_eq!(connection.config().tracks.len(), 2);
        assert_eq!(
            connection.video_track(),
            media.local_state().unwrap().camera
        );
    }
}
