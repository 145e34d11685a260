//! Call service orchestration
//!
//! [`CallService`] wires the signaling channel, peer mesh, media controller
//! and call manager together around one event bus, and runs their background
//! loops. Each service is an independent instance; several can share a
//! process (tests run whole meshes in-process).

use crate::call::{CallError, CallManager};
use crate::events::{CallEvent, EventBus, EventKind};
use crate::identity::ParticipantRef;
use crate::media::{LocalMediaState, MediaConfig, MediaController, MediaError, OutgoingTracks};
use crate::mesh::{MeshConfig, PeerLinkInfo, PeerMesh};
use crate::provider::{ConnectionEvent, MediaTransportProvider};
use crate::signaling::{SignalingChannel, SignalingConfig, SignalingTransport};
use crate::types::{
    AdmissionPolicy, CallId, CallSession, CallState, CallType, FacingMode, SubscriptionTier,
};
use anyhow::Context;
use futures::Stream;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

/// Service errors
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Initialization error
    #[error("Initialization error: {0}")]
    InitError(String),

    /// Call error
    #[error(transparent)]
    Call(#[from] CallError),

    /// Media error
    #[error(transparent)]
    Media(#[from] MediaError),

    /// `start` was called twice
    #[error("Service already started")]
    AlreadyStarted,
}

/// Service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallServiceConfig {
    /// Signaling channel settings
    pub signaling: SignalingConfig,
    /// Local media settings
    pub media: MediaConfig,
    /// Peer mesh settings
    pub mesh: MeshConfig,
    /// Tier table
    pub admission: AdmissionPolicy,
    /// Undelivered events retained per subscriber
    pub event_capacity: usize,
}

impl Default for CallServiceConfig {
    fn default() -> Self {
        Self {
            signaling: SignalingConfig::default(),
            media: MediaConfig::default(),
            mesh: MeshConfig::default(),
            admission: AdmissionPolicy::default(),
            event_capacity: 256,
        }
    }
}

impl CallServiceConfig {
    /// Parse a JSON configuration; missing fields take their defaults
    ///
    /// # Errors
    ///
    /// Returns error if the text is not a valid configuration
    pub fn from_json_str(text: &str) -> anyhow::Result<Self> {
        serde_json::from_str(text).context("Failed to parse service configuration")
    }

    /// Load a JSON configuration file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed
    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_json_str(&text).with_context(|| format!("Invalid config file {}", path.display()))
    }
}

/// Main call service
pub struct CallService {
    local: ParticipantRef,
    events: EventBus,
    signaling: Arc<SignalingChannel>,
    media: Arc<MediaController>,
    mesh: Arc<PeerMesh>,
    manager: Arc<CallManager>,
    connection_events: Mutex<Option<mpsc::UnboundedReceiver<ConnectionEvent>>>,
    signaling_task: Mutex<Option<JoinHandle<()>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl CallService {
    /// Create a service; nothing runs until [`CallService::start`]
    pub fn new(
        local: ParticipantRef,
        config: CallServiceConfig,
        transport: Arc<dyn SignalingTransport>,
        provider: Arc<dyn MediaTransportProvider>,
    ) -> Self {
        let events = EventBus::new(config.event_capacity);
        let signaling = Arc::new(SignalingChannel::new(
            transport,
            config.signaling,
            events.clone(),
        ));
        let (outgoing, outgoing_rx) = watch::channel(OutgoingTracks::default());
        let (mesh, connection_events) = PeerMesh::new(
            config.mesh,
            Arc::clone(&provider),
            Arc::clone(&signaling),
            events.clone(),
            outgoing_rx,
        );
        let media = Arc::new(MediaController::new(
            config.media,
            provider,
            Arc::clone(&mesh),
            events.clone(),
            outgoing,
        ));
        let manager = Arc::new(CallManager::new(
            local.clone(),
            config.admission,
            Arc::clone(&media),
            Arc::clone(&mesh),
            Arc::clone(&signaling),
            events.clone(),
        ));

        Self {
            local,
            events,
            signaling,
            media,
            mesh,
            manager,
            connection_events: Mutex::new(Some(connection_events)),
            signaling_task: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Create a builder
    #[must_use]
    pub fn builder() -> CallServiceBuilder {
        CallServiceBuilder::new()
    }

    /// Start the signaling loop, inbound dispatch and connection event pump
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::AlreadyStarted`] on a second call
    #[tracing::instrument(skip(self), fields(local = %self.local.id))]
    pub async fn start(&self) -> Result<(), ServiceError> {
        let connection_events = self
            .connection_events
            .lock()
            .take()
            .ok_or(ServiceError::AlreadyStarted)?;
        tracing::info!("Starting call service");

        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();
        let signaling = Arc::clone(&self.signaling);
        let signaling_task = tokio::spawn(async move { signaling.run(inbound_tx).await });

        let manager = Arc::clone(&self.manager);
        let dispatch = tokio::spawn(async move {
            while let Some(message) = inbound_rx.recv().await {
                manager.handle_signaling(message).await;
            }
            tracing::debug!("Signaling dispatch stopped");
        });
        let pump = self.mesh.spawn_event_pump(connection_events);

        *self.signaling_task.lock() = Some(signaling_task);
        self.workers.lock().extend([dispatch, pump]);
        tracing::info!("Call service started");
        Ok(())
    }

    /// End any call and stop the background tasks
    #[tracing::instrument(skip(self), fields(local = %self.local.id))]
    pub async fn shutdown(&self) {
        if let Err(e) = self.manager.end_call().await {
            tracing::warn!(error = %e, "Failed to end call during shutdown");
        }
        self.signaling.shutdown();

        let signaling_task = self.signaling_task.lock().take();
        if let Some(task) = signaling_task {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Signaling task failed");
            }
        }
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for worker in workers {
            worker.abort();
        }
        tracing::info!("Call service stopped");
    }

    /// Place a call
    ///
    /// # Errors
    ///
    /// See [`CallManager::start_call`]
    pub async fn start_call(
        &self,
        participants: Vec<ParticipantRef>,
        call_type: CallType,
        tier: SubscriptionTier,
    ) -> Result<CallSession, ServiceError> {
        Ok(self
            .manager
            .start_call(participants, call_type, tier)
            .await?)
    }

    /// Accept a ringing call
    ///
    /// # Errors
    ///
    /// See [`CallManager::answer_call`]
    pub async fn answer_call(&self, call_id: &CallId, with_video: bool) -> Result<(), ServiceError> {
        Ok(self.manager.answer_call(call_id, with_video).await?)
    }

    /// Decline a ringing call
    ///
    /// # Errors
    ///
    /// See [`CallManager::reject_call`]
    pub async fn reject_call(&self, call_id: &CallId, reason: &str) -> Result<(), ServiceError> {
        Ok(self.manager.reject_call(call_id, reason).await?)
    }

    /// Hang up; no-op without a live call
    ///
    /// # Errors
    ///
    /// See [`CallManager::end_call`]
    pub async fn end_call(&self) -> Result<(), ServiceError> {
        Ok(self.manager.end_call().await?)
    }

    /// Flip the microphone; returns the new mute state
    ///
    /// # Errors
    ///
    /// Returns error without local media
    pub fn toggle_mute(&self) -> Result<bool, ServiceError> {
        Ok(self.media.toggle_mute()?)
    }

    /// Flip the camera; returns the new video-off state
    ///
    /// # Errors
    ///
    /// Returns error without a camera track
    pub fn toggle_video(&self) -> Result<bool, ServiceError> {
        Ok(self.media.toggle_video()?)
    }

    /// Send the screen instead of the camera
    ///
    /// # Errors
    ///
    /// See [`MediaController::start_screen_share`]
    pub async fn start_screen_share(&self) -> Result<(), ServiceError> {
        Ok(self.media.start_screen_share().await?)
    }

    /// Send the camera again
    pub async fn stop_screen_share(&self) {
        self.media.stop_screen_share().await;
    }

    /// Switch to the opposite camera
    ///
    /// # Errors
    ///
    /// See [`MediaController::switch_camera`]
    pub async fn switch_camera(&self) -> Result<FacingMode, ServiceError> {
        Ok(self.media.switch_camera().await?)
    }

    /// Subscribe to every event
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    /// Subscribe to the given event kinds
    pub fn subscribe_kinds(
        &self,
        kinds: &[EventKind],
    ) -> impl Stream<Item = CallEvent> + Send + Unpin + 'static {
        self.events.subscribe_kinds(kinds)
    }

    /// Event bus shared by every component
    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Local participant
    #[must_use]
    pub fn local(&self) -> &ParticipantRef {
        &self.local
    }

    /// Snapshot of the current or last call
    #[must_use]
    pub fn session(&self) -> Option<CallSession> {
        self.manager.session()
    }

    /// Current call state
    #[must_use]
    pub fn state(&self) -> CallState {
        self.manager.state()
    }

    /// Snapshot of every peer link
    #[must_use]
    pub fn peer_links(&self) -> Vec<PeerLinkInfo> {
        self.mesh.links()
    }

    /// Snapshot of the local capture
    #[must_use]
    pub fn local_media(&self) -> Option<LocalMediaState> {
        self.media.local_state()
    }

    /// Tracks currently sent on every link
    #[must_use]
    pub fn outgoing_tracks(&self) -> OutgoingTracks {
        self.media.outgoing_tracks()
    }

    /// Whether the signaling connection is open
    #[must_use]
    pub fn is_signaling_connected(&self) -> bool {
        self.signaling.is_connected()
    }
}

/// Call service builder
#[derive(Default)]
pub struct CallServiceBuilder {
    local: Option<ParticipantRef>,
    config: CallServiceConfig,
    transport: Option<Arc<dyn SignalingTransport>>,
    provider: Option<Arc<dyn MediaTransportProvider>>,
}

impl CallServiceBuilder {
    /// Create new builder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the local participant
    #[must_use]
    pub fn with_local(mut self, local: impl Into<ParticipantRef>) -> Self {
        self.local = Some(local.into());
        self
    }

    /// Set configuration
    #[must_use]
    pub fn with_config(mut self, config: CallServiceConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the signaling transport
    #[must_use]
    pub fn with_transport(mut self, transport: Arc<dyn SignalingTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Set the media provider
    #[must_use]
    pub fn with_provider(mut self, provider: Arc<dyn MediaTransportProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Build the service
    ///
    /// # Errors
    ///
    /// Returns error if the local participant, transport or provider is missing
    pub fn build(self) -> Result<CallService, ServiceError> {
        let local = self
            .local
            .ok_or_else(|| ServiceError::InitError("local participant not set".to_string()))?;
        let transport = self
            .transport
            .ok_or_else(|| ServiceError::InitError("signaling transport not set".to_string()))?;
        let provider = self
            .provider
            .ok_or_else(|| ServiceError::InitError("media provider not set".to_string()))?;
        Ok(CallService::new(local, self.config, transport, provider))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::testing::{MockMediaProvider, RecordingTransport};

    #[test]
    fn test_config_defaults_from_empty_json() {
        let config = CallServiceConfig::from_json_str("{}").unwrap();
        assert_eq!(config.event_capacity, 256);
        assert_eq!(config.signaling.reconnect_delay_ms, 3000);
        assert_eq!(config.mesh.retry_delay_ms, 1000);
        assert!(config.media.screen_share_enabled);
    }

    #[test]
    fn test_config_partial_override() {
        let config = CallServiceConfig::from_json_str(
            r#"{"mesh":{"retry_delay_ms":250},"media":{"screen_share_enabled":false}}"#,
        )
        .unwrap();
        assert_eq!(config.mesh.retry_delay_ms, 250);
        assert!(!config.mesh.ice_servers.is_empty());
        assert!(!config.media.screen_share_enabled);
    }

    #[test]
    fn test_config_rejects_garbage() {
        assert!(CallServiceConfig::from_json_str("not json").is_err());
    }

    #[test]
    fn test_builder_requires_parts() {
        let res = CallService::builder().with_local("me").build();
        assert!(matches!(res, Err(ServiceError::InitError(_))));
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let service = CallService::builder()
            .with_local("me")
            .with_transport(Arc::new(RecordingTransport::new()))
            .with_provider(Arc::new(MockMediaProvider::new()))
            .build()
            .unwrap();
        service.start().await.unwrap();
        assert!(matches!(
            service.start().await,
            Err(ServiceError::AlreadyStarted)
        ));
        service.shutdown().await;
        assert!(!service.is_signaling_connected());
    }
}
