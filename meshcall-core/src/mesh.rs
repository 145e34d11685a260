//! Peer mesh management
//!
//! One connection object per remote participant. The mesh drives the
//! offer/answer/candidate exchange for each link and tracks per-peer health.
//!
//! Links can disappear while a negotiation step is suspended (a `peer:left`
//! arriving mid-offer, an `end_call`). Every step re-checks that the link it
//! started on is still the current one and turns into a no-op otherwise.

use crate::events::{CallEvent, EventBus};
use crate::identity::PeerId;
use crate::media::OutgoingTracks;
use crate::provider::{
    ConnectionConfig, ConnectionEvent, ConnectionEventKind, ConnectionEventSink, MediaConnection,
    MediaTrack, MediaTransportProvider, ProviderError,
};
use crate::signaling::{SignalingChannel, SignalingError, SignalingMessage};
use crate::types::{ConnectionState, IceCandidate, IceServer, NegotiationRole, SessionDescription};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Mesh errors
#[derive(Error, Debug)]
pub enum MeshError {
    /// The provider refused a connection operation
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// A negotiation message could not be sent
    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    /// Every link was closed while this one was being created
    #[error("Mesh closed during link creation")]
    Closed,
}

/// Mesh configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// STUN/TURN servers handed to every connection
    pub ice_servers: Vec<IceServer>,
    /// Delay before the retry offer after a connection failure
    pub retry_delay_ms: u64,
}

impl MeshConfig {
    /// Retry delay as a duration
    #[must_use]
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            ice_servers: IceServer::default_stun(),
            retry_delay_ms: 1000,
        }
    }
}

struct PeerLink {
    link_id: u64,
    connection: Arc<dyn MediaConnection>,
    connection_state: ConnectionState,
    remote_stream: Vec<MediaTrack>,
    negotiation_role: Option<NegotiationRole>,
}

/// Snapshot of one peer link
#[derive(Debug, Clone)]
pub struct PeerLinkInfo {
    /// Remote participant
    pub peer_id: PeerId,
    /// Link generation
    pub link_id: u64,
    /// Last reported connection state
    pub connection_state: ConnectionState,
    /// Tracks received from the peer
    pub remote_stream: Vec<MediaTrack>,
    /// Side taken in the offer/answer exchange, once negotiation started
    pub negotiation_role: Option<NegotiationRole>,
}

/// Owner of every peer link of the current call
pub struct PeerMesh {
    config: MeshConfig,
    provider: Arc<dyn MediaTransportProvider>,
    signaling: Arc<SignalingChannel>,
    events: EventBus,
    outgoing: watch::Receiver<OutgoingTracks>,
    links: RwLock<HashMap<PeerId, PeerLink>>,
    next_link_id: AtomicU64,
    generation: AtomicU64,
    connection_events: mpsc::UnboundedSender<ConnectionEvent>,
}

impl PeerMesh {
    /// Create the mesh
    ///
    /// Returns the receiver of connection notifications; hand it to
    /// [`PeerMesh::spawn_event_pump`].
    pub fn new(
        config: MeshConfig,
        provider: Arc<dyn MediaTransportProvider>,
        signaling: Arc<SignalingChannel>,
        events: EventBus,
        outgoing: watch::Receiver<OutgoingTracks>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (connection_events, rx) = mpsc::unbounded_channel();
        let mesh = Arc::new(Self {
            config,
            provider,
            signaling,
            events,
            outgoing,
            links: RwLock::new(HashMap::new()),
            next_link_id: AtomicU64::new(1),
            generation: AtomicU64::new(0),
            connection_events,
        });
        (mesh, rx)
    }

    /// Create a link to `peer`, or return the existing one
    ///
    /// The connection is seeded with the configured ICE servers and every
    /// local track currently held.
    ///
    /// # Errors
    ///
    /// Returns error if the provider cannot create the connection, or if
    /// [`PeerMesh::close_all`] ran while it was being created.
    #[tracing::instrument(skip(self, peer), fields(peer_id = %peer))]
    pub async fn create_link(&self, peer: &PeerId) -> Result<u64, MeshError> {
        if let Some(link_id) = self.links.read().get(peer).map(|l| l.link_id) {
            return Ok(link_id);
        }

        let generation = self.generation.load(Ordering::SeqCst);
        let link_id = self.next_link_id.fetch_add(1, Ordering::SeqCst);
        let seeded = self.outgoing.borrow().clone();
        let config = ConnectionConfig {
            peer_id: peer.clone(),
            ice_servers: self.config.ice_servers.clone(),
            tracks: seeded.tracks(),
        };
        let sink = ConnectionEventSink::new(peer.clone(), link_id, self.connection_events.clone());
        let connection = self.provider.create_connection(config, sink).await?;

        enum Outcome {
            Inserted,
            Existing(u64),
            Closed,
        }
        let outcome = {
            let mut links = self.links.write();
            if self.generation.load(Ordering::SeqCst) != generation {
                Outcome::Closed
            } else if let Some(existing) = links.get(peer) {
                Outcome::Existing(existing.link_id)
            } else {
                links.insert(
                    peer.clone(),
                    PeerLink {
                        link_id,
                        connection: Arc::clone(&connection),
                        connection_state: ConnectionState::New,
                        remote_stream: Vec::new(),
                        negotiation_role: None,
                    },
                );
                Outcome::Inserted
            }
        };

        match outcome {
            Outcome::Inserted => {}
            Outcome::Existing(existing) => {
                tracing::debug!(existing, "Lost link creation race, closing duplicate");
                connection.close().await;
                return Ok(existing);
            }
            Outcome::Closed => {
                connection.close().await;
                return Err(MeshError::Closed);
            }
        }

        let current_video = self.outgoing.borrow().video.clone();
        if current_video != seeded.video {
            if let Err(e) = connection.replace_video_track(current_video).await {
                tracing::warn!(error = %e, "Failed to resync video track on new link");
            }
        }

        tracing::debug!(link_id, "Peer link created");
        Ok(link_id)
    }

    /// Generate an offer for `peer` and send it
    ///
    /// A missing link, or one replaced mid-negotiation, makes this a no-op.
    ///
    /// # Errors
    ///
    /// Returns error if the provider fails or the offer cannot be sent
    pub async fn make_offer(&self, peer: &PeerId) -> Result<(), MeshError> {
        self.send_offer(peer, false, None).await
    }

    #[tracing::instrument(skip(self, peer), fields(peer_id = %peer))]
    async fn send_offer(
        &self,
        peer: &PeerId,
        ice_restart: bool,
        expected_link: Option<u64>,
    ) -> Result<(), MeshError> {
        let Some((link_id, connection)) = self.connection(peer) else {
            tracing::debug!("No link to offer to");
            return Ok(());
        };
        if expected_link.is_some_and(|expected| expected != link_id) {
            tracing::debug!("Link replaced before retry, skipping offer");
            return Ok(());
        }

        let offer = connection.create_offer(ice_restart).await?;
        if !self.is_current(peer, link_id) {
            tracing::debug!("Link closed while generating offer");
            return Ok(());
        }
        connection.set_local_description(offer.clone()).await?;
        self.update_link(peer, link_id, |link| {
            link.negotiation_role = Some(NegotiationRole::Offerer);
        });

        self.signaling
            .send(SignalingMessage::Offer {
                peer_id: peer.clone(),
                sdp: offer,
            })
            .await?;
        tracing::debug!(ice_restart, "Offer sent");
        Ok(())
    }

    /// Apply a remote offer and answer it, creating the link if absent
    ///
    /// # Errors
    ///
    /// Returns error if the link cannot be created, the provider fails or
    /// the answer cannot be sent
    #[tracing::instrument(skip(self, peer, offer), fields(peer_id = %peer))]
    pub async fn handle_offer(
        &self,
        peer: &PeerId,
        offer: SessionDescription,
    ) -> Result<(), MeshError> {
        let link_id = self.create_link(peer).await?;
        let Some(connection) = self.current_connection(peer, link_id) else {
            return Ok(());
        };
        self.update_link(peer, link_id, |link| {
            link.negotiation_role = Some(NegotiationRole::Answerer);
        });

        connection.set_remote_description(offer).await?;
        if !self.is_current(peer, link_id) {
            return Ok(());
        }
        let answer = connection.create_answer().await?;
        if !self.is_current(peer, link_id) {
            tracing::debug!("Link closed while generating answer");
            return Ok(());
        }
        connection.set_local_description(answer.clone()).await?;

        self.signaling
            .send(SignalingMessage::AnswerSdp {
                peer_id: peer.clone(),
                sdp: answer,
            })
            .await?;
        tracing::debug!("Answer sent");
        Ok(())
    }

    /// Apply a remote answer; dropped when the link is gone
    pub async fn handle_answer(&self, peer: &PeerId, answer: SessionDescription) {
        let Some((_, connection)) = self.connection(peer) else {
            tracing::debug!(peer_id = %peer, "Answer for unknown peer, dropping");
            return;
        };
        if let Err(e) = connection.set_remote_description(answer).await {
            tracing::warn!(peer_id = %peer, error = %e, "Failed to apply remote answer");
        }
    }

    /// Apply a remote candidate; dropped when the link is gone
    pub async fn handle_ice_candidate(&self, peer: &PeerId, candidate: IceCandidate) {
        let Some((_, connection)) = self.connection(peer) else {
            tracing::debug!(peer_id = %peer, "Candidate for unknown peer, dropping");
            return;
        };
        if let Err(e) = connection.add_ice_candidate(candidate).await {
            tracing::warn!(peer_id = %peer, error = %e, "Failed to apply candidate");
        }
    }

    /// Process one notification from a connection object
    pub async fn handle_connection_event(self: &Arc<Self>, event: ConnectionEvent) {
        let ConnectionEvent {
            peer_id,
            link_id,
            kind,
        } = event;

        match kind {
            ConnectionEventKind::RemoteTrack(track) => {
                let known = self.update_link(&peer_id, link_id, |link| {
                    link.remote_stream.push(track.clone());
                });
                if known {
                    tracing::debug!(peer_id = %peer_id, track_id = track.id(), "Remote track");
                    self.events.publish(CallEvent::RemoteStream { peer_id, track });
                }
            }
            ConnectionEventKind::StateChanged(state) => {
                let known = self.update_link(&peer_id, link_id, |link| {
                    link.connection_state = state;
                });
                if !known {
                    return;
                }
                tracing::debug!(peer_id = %peer_id, ?state, "Connection state changed");
                self.events.publish(CallEvent::ConnectionStateChanged {
                    peer_id: peer_id.clone(),
                    state,
                });
                if state == ConnectionState::Failed {
                    tracing::warn!(peer_id = %peer_id, "Connection failed, scheduling retry offer");
                    self.events.publish(CallEvent::ConnectionFailed {
                        peer_id: peer_id.clone(),
                    });
                    self.schedule_retry(peer_id, link_id);
                }
            }
            ConnectionEventKind::LocalCandidate(candidate) => {
                if !self.is_current(&peer_id, link_id) {
                    return;
                }
                let message = SignalingMessage::IceCandidate {
                    peer_id: peer_id.clone(),
                    candidate,
                };
                if let Err(e) = self.signaling.send(message).await {
                    tracing::warn!(peer_id = %peer_id, error = %e, "Failed to send local candidate");
                }
            }
        }
    }

    fn schedule_retry(self: &Arc<Self>, peer: PeerId, link_id: u64) {
        let mesh = Arc::downgrade(self);
        let delay = self.config.retry_delay();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(mesh) = mesh.upgrade() else {
                return;
            };
            if let Err(e) = mesh.send_offer(&peer, true, Some(link_id)).await {
                tracing::warn!(peer_id = %peer, error = %e, "Retry offer failed");
            }
        });
    }

    /// Feed connection notifications into [`PeerMesh::handle_connection_event`]
    ///
    /// The task ends once the mesh is dropped.
    pub fn spawn_event_pump(
        self: &Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    ) -> JoinHandle<()> {
        let mesh: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(mesh) = mesh.upgrade() else {
                    break;
                };
                mesh.handle_connection_event(event).await;
            }
            tracing::debug!("Connection event pump stopped");
        })
    }

    /// Close and discard the link to `peer`; no-op when absent
    pub async fn close_link(&self, peer: &PeerId) {
        let removed = self.links.write().remove(peer);
        if let Some(link) = removed {
            link.connection.close().await;
            tracing::debug!(peer_id = %peer, link_id = link.link_id, "Peer link closed");
        }
    }

    /// Close every link
    ///
    /// The link table is emptied before the first suspension point, so the
    /// mesh is observably empty as soon as this future is first polled.
    pub async fn close_all(&self) {
        let drained: Vec<PeerLink> = {
            let mut links = self.links.write();
            self.generation.fetch_add(1, Ordering::SeqCst);
            links.drain().map(|(_, link)| link).collect()
        };
        if drained.is_empty() {
            return;
        }
        tracing::debug!(count = drained.len(), "Closing all peer links");
        for link in drained {
            link.connection.close().await;
        }
    }

    /// Swap the outgoing video track on every link
    pub async fn replace_video_track(&self, track: Option<MediaTrack>) {
        let connections: Vec<(PeerId, Arc<dyn MediaConnection>)> = self
            .links
            .read()
            .iter()
            .map(|(peer, link)| (peer.clone(), Arc::clone(&link.connection)))
            .collect();
        for (peer, connection) in connections {
            if let Err(e) = connection.replace_video_track(track.clone()).await {
                tracing::warn!(peer_id = %peer, error = %e, "Failed to replace video track");
            }
        }
    }

    /// Snapshot of every link, ordered by peer id
    #[must_use]
    pub fn links(&self) -> Vec<PeerLinkInfo> {
        let mut infos: Vec<_> = self
            .links
            .read()
            .iter()
            .map(|(peer, link)| Self::info(peer, link))
            .collect();
        infos.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        infos
    }

    /// Snapshot of the link to `peer`
    #[must_use]
    pub fn link(&self, peer: &PeerId) -> Option<PeerLinkInfo> {
        self.links.read().get(peer).map(|link| Self::info(peer, link))
    }

    /// Peers with a link
    #[must_use]
    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.links().into_iter().map(|l| l.peer_id).collect()
    }

    /// Whether a link to `peer` exists
    #[must_use]
    pub fn contains(&self, peer: &PeerId) -> bool {
        self.links.read().contains_key(peer)
    }

    /// Number of links
    #[must_use]
    pub fn len(&self) -> usize {
        self.links.read().len()
    }

    /// Whether there are no links
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.links.read().is_empty()
    }

    fn info(peer: &PeerId, link: &PeerLink) -> PeerLinkInfo {
        PeerLinkInfo {
            peer_id: peer.clone(),
            link_id: link.link_id,
            connection_state: link.connection_state,
            remote_stream: link.remote_stream.clone(),
            negotiation_role: link.negotiation_role,
        }
    }

    fn connection(&self, peer: &PeerId) -> Option<(u64, Arc<dyn MediaConnection>)> {
        self.links
            .read()
            .get(peer)
            .map(|link| (link.link_id, Arc::clone(&link.connection)))
    }

    fn current_connection(&self, peer: &PeerId, link_id: u64) -> Option<Arc<dyn MediaConnection>> {
        self.connection(peer)
            .filter(|(id, _)| *id == link_id)
            .map(|(_, connection)| connection)
    }

    fn is_current(&self, peer: &PeerId, link_id: u64) -> bool {
        self.links
            .read()
            .get(peer)
            .is_some_and(|link| link.link_id == link_id)
    }

    fn update_link(&self, peer: &PeerId, link_id: u64, f: impl FnOnce(&mut PeerLink)) -> bool {
        match self.links.write().get_mut(peer) {
            Some(link) if link.link_id == link_id => {
                f(link);
                true
            }
            _ => false,
        }
    }
}
