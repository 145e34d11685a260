//! Signaling channel
//!
//! Call-control and negotiation messages travel to and from the coordination
//! server as one JSON object per message. The server routes by `peerId`: an
//! outgoing `offer`/`answer`/`ice:candidate` names the recipient, the copy
//! delivered to that recipient names the sender.

use crate::events::{CallEvent, EventBus};
use crate::identity::{ParticipantRef, PeerId};
use crate::types::{CallId, CallType, IceCandidate, SessionDescription};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;

/// Signaling errors
#[derive(Error, Debug)]
pub enum SignalingError {
    /// No connection to the coordination server
    #[error("Not connected to signaling server")]
    NotConnected,

    /// Frame could not be encoded or decoded
    #[error("Invalid signaling message: {0}")]
    InvalidMessage(String),

    /// Frame exceeds the configured size cap
    #[error("Signaling message too large: {size} bytes (max {max})")]
    MessageTooLarge {
        /// Actual size
        size: usize,
        /// Configured cap
        max: usize,
    },

    /// Transport error
    #[error("Transport error: {0}")]
    TransportError(String),
}

impl From<serde_json::Error> for SignalingError {
    fn from(err: serde_json::Error) -> Self {
        SignalingError::InvalidMessage(err.to_string())
    }
}

/// Signaling message types
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum SignalingMessage {
    /// Ask the listed participants to join a call
    #[serde(rename = "call:invite", rename_all = "camelCase")]
    Invite {
        /// Call identifier
        call_id: CallId,
        /// Caller first, then invitees
        participants: Vec<ParticipantRef>,
        /// Audio or video
        call_type: CallType,
    },

    /// Accept an invite
    #[serde(rename = "call:answer", rename_all = "camelCase")]
    Answer {
        /// Call identifier
        call_id: CallId,
        /// Whether the answerer sends video
        with_video: bool,
    },

    /// Decline an invite
    #[serde(rename = "call:reject", rename_all = "camelCase")]
    Reject {
        /// Call identifier
        call_id: CallId,
        /// Human readable reason
        reason: String,
    },

    /// Negotiation offer
    #[serde(rename = "offer", rename_all = "camelCase")]
    Offer {
        /// Recipient (outgoing) or sender (incoming)
        peer_id: PeerId,
        /// Offer description
        sdp: SessionDescription,
    },

    /// Negotiation answer
    #[serde(rename = "answer", rename_all = "camelCase")]
    AnswerSdp {
        /// Recipient (outgoing) or sender (incoming)
        peer_id: PeerId,
        /// Answer description
        sdp: SessionDescription,
    },

    /// Network candidate
    #[serde(rename = "ice:candidate", rename_all = "camelCase")]
    IceCandidate {
        /// Recipient (outgoing) or sender (incoming)
        peer_id: PeerId,
        /// Candidate payload
        candidate: IceCandidate,
    },

    /// Call finished
    #[serde(rename = "call:ended", rename_all = "camelCase")]
    Ended {
        /// Call identifier
        call_id: CallId,
    },

    /// A participant joined the active call
    #[serde(rename = "peer:joined", rename_all = "camelCase")]
    PeerJoined {
        /// Joining participant
        peer_id: PeerId,
    },

    /// A participant left the active call
    #[serde(rename = "peer:left", rename_all = "camelCase")]
    PeerLeft {
        /// Leaving participant
        peer_id: PeerId,
    },
}

impl SignalingMessage {
    /// Wire name of this message
    #[must_use]
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::Invite { .. } => "call:invite",
            Self::Answer { .. } => "call:answer",
            Self::Reject { .. } => "call:reject",
            Self::Offer { .. } => "offer",
            Self::AnswerSdp { .. } => "answer",
            Self::IceCandidate { .. } => "ice:candidate",
            Self::Ended { .. } => "call:ended",
            Self::PeerJoined { .. } => "peer:joined",
            Self::PeerLeft { .. } => "peer:left",
        }
    }

    /// Call this message refers to, if it carries one
    #[must_use]
    pub fn call_id(&self) -> Option<&CallId> {
        match self {
            Self::Invite { call_id, .. }
            | Self::Answer { call_id, .. }
            | Self::Reject { call_id, .. }
            | Self::Ended { call_id } => Some(call_id),
            _ => None,
        }
    }

    /// Peer this message refers to, if it carries one
    #[must_use]
    pub fn peer_id(&self) -> Option<&PeerId> {
        match self {
            Self::Offer { peer_id, .. }
            | Self::AnswerSdp { peer_id, .. }
            | Self::IceCandidate { peer_id, .. }
            | Self::PeerJoined { peer_id }
            | Self::PeerLeft { peer_id } => Some(peer_id),
            _ => None,
        }
    }

    /// Check if this is a peer negotiation message
    #[must_use]
    pub fn is_negotiation(&self) -> bool {
        matches!(
            self,
            Self::Offer { .. } | Self::AnswerSdp { .. } | Self::IceCandidate { .. }
        )
    }

    /// Encode as a JSON text frame
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn to_json(&self) -> Result<String, SignalingError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a JSON text frame
    ///
    /// # Errors
    ///
    /// Returns error if the frame is not a known message
    pub fn from_json(text: &str) -> Result<Self, SignalingError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Signaling transport trait
///
/// Implement this for your specific connection to the coordination server
/// (WebSocket, in-process hub, ...). Implementations own at most one live
/// connection; `connect` replaces a closed one.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Open the connection
    async fn connect(&self) -> Result<(), SignalingError>;

    /// Send a signaling message
    async fn send_message(&self, message: &SignalingMessage) -> Result<(), SignalingError>;

    /// Receive the next message; `Ok(None)` means the connection closed
    ///
    /// `Err(SignalingError::InvalidMessage)` reports an undecodable frame on a
    /// connection that is still usable. Any other error is fatal for the
    /// connection.
    async fn receive_message(&self) -> Result<Option<SignalingMessage>, SignalingError>;

    /// Close the connection
    async fn close(&self);
}

/// Signaling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// Coordination server URL
    pub url: String,
    /// Fixed delay before reconnecting after a closure
    pub reconnect_delay_ms: u64,
    /// Maximum size of one frame
    pub max_message_bytes: usize,
}

impl SignalingConfig {
    /// Reconnect delay as a duration
    #[must_use]
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080/signal".to_string(),
            reconnect_delay_ms: 3000,
            max_message_bytes: 64 * 1024,
        }
    }
}

/// Reliable signaling channel with auto-reconnect
///
/// [`SignalingChannel::run`] keeps a connection to the coordination server
/// open for the lifetime of the service: on unexpected closure it waits
/// the configured delay and reconnects, without limit. Losing the connection
/// never ends a call by itself.
pub struct SignalingChannel {
    transport: Arc<dyn SignalingTransport>,
    config: SignalingConfig,
    events: EventBus,
    connected: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl SignalingChannel {
    /// Create new signaling channel
    #[must_use]
    pub fn new(
        transport: Arc<dyn SignalingTransport>,
        config: SignalingConfig,
        events: EventBus,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            transport,
            config,
            events,
            connected: AtomicBool::new(false),
            shutdown,
        }
    }

    /// Whether a connection is currently open
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Get access to the underlying transport
    #[must_use]
    pub fn transport(&self) -> &Arc<dyn SignalingTransport> {
        &self.transport
    }

    /// Send a signaling message
    ///
    /// # Errors
    ///
    /// Returns error if sending fails
    #[tracing::instrument(skip(self, message), fields(message_type = message.message_type()))]
    pub async fn send(&self, message: SignalingMessage) -> Result<(), SignalingError> {
        tracing::debug!("Sending signaling message");
        self.transport.send_message(&message).await
    }

    /// Ask [`SignalingChannel::run`] to close the connection and return
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Connection loop
    ///
    /// Forwards every decoded message to `inbound` in arrival order. Returns
    /// after [`SignalingChannel::shutdown`] or when `inbound` is dropped.
    pub async fn run(&self, inbound: mpsc::UnboundedSender<SignalingMessage>) {
        let mut shutdown = self.shutdown.subscribe();
        let delay = self.config.reconnect_delay();

        loop {
            if *shutdown.borrow() {
                break;
            }

            let connected = tokio::select! {
                res = self.transport.connect() => res,
                _ = shutdown.wait_for(|stop| *stop) => break,
            };

            match connected {
                Ok(()) => {
                    self.connected.store(true, Ordering::SeqCst);
                    tracing::info!(url = %self.config.url, "Signaling connected");
                    self.events.publish(CallEvent::SignalingConnected);

                    let keep_going = tokio::select! {
                        keep = self.pump(&inbound) => keep,
                        _ = shutdown.wait_for(|stop| *stop) => false,
                    };

                    self.connected.store(false, Ordering::SeqCst);
                    self.events.publish(CallEvent::SignalingDisconnected);
                    if !keep_going {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Signaling connect failed");
                }
            }

            tracing::info!(delay_ms = delay.as_millis(), "Reconnecting signaling");
            tokio::select! {
                _ = sleep(delay) => {}
                _ = shutdown.wait_for(|stop| *stop) => break,
            }
        }

        self.connected.store(false, Ordering::SeqCst);
        self.transport.close().await;
        tracing::debug!("Signaling loop stopped");
    }

    /// Read until the connection drops; `false` when the receiver side is gone
    async fn pump(&self, inbound: &mpsc::UnboundedSender<SignalingMessage>) -> bool {
        loop {
            match self.transport.receive_message().await {
                Ok(Some(message)) => {
                    tracing::debug!(
                        message_type = message.message_type(),
                        "Received signaling message"
                    );
                    if inbound.send(message).is_err() {
                        return false;
                    }
                }
                Ok(None) => {
                    tracing::warn!("Signaling connection closed");
                    return true;
                }
                Err(SignalingError::InvalidMessage(reason)) => {
                    tracing::warn!(%reason, "Dropping undecodable signaling message");
                }
                Err(SignalingError::MessageTooLarge { size, max }) => {
                    tracing::warn!(size, max, "Dropping oversized signaling message");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Signaling receive failed");
                    return true;
                }
            }
        }
    }
}
