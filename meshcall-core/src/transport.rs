//! Transport layer implementations
//!
//! [`WebSocketTransport`] connects to the coordination server over a
//! WebSocket and exchanges one JSON text frame per [`SignalingMessage`].

use crate::signaling::{SignalingError, SignalingMessage, SignalingTransport};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// Maximum identifier length (call ids, peer ids)
const MAX_ID_LENGTH: usize = 256;

/// Maximum SDP string length
const MAX_SDP_LENGTH: usize = 32 * 1024;

/// Maximum roster length accepted in an invite
const MAX_INVITE_PARTICIPANTS: usize = 64;

/// Multiple of `max_message_bytes` tungstenite buffers before failing the
/// connection; frames between the two limits are skipped without closing
const WIRE_LIMIT_FACTOR: usize = 4;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Server URL (`ws://` or `wss://`)
    pub url: String,
    /// Maximum size of one frame in either direction
    pub max_message_bytes: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        let signaling = crate::signaling::SignalingConfig::default();
        Self {
            url: signaling.url,
            max_message_bytes: signaling.max_message_bytes,
        }
    }
}

impl From<&crate::signaling::SignalingConfig> for TransportConfig {
    fn from(config: &crate::signaling::SignalingConfig) -> Self {
        Self {
            url: config.url.clone(),
            max_message_bytes: config.max_message_bytes,
        }
    }
}

/// WebSocket connection to the coordination server
pub struct WebSocketTransport {
    config: TransportConfig,
    sink: Mutex<Option<SplitSink<WsStream, Message>>>,
    stream: Mutex<Option<SplitStream<WsStream>>>,
}

impl WebSocketTransport {
    /// Create new WebSocket transport; nothing is opened until `connect`
    #[must_use]
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            sink: Mutex::new(None),
            stream: Mutex::new(None),
        }
    }

    /// Get transport configuration
    #[must_use]
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Socket limits derived from `max_message_bytes`
    #[must_use]
    pub fn websocket_config(&self) -> WebSocketConfig {
        let wire_limit = self
            .config
            .max_message_bytes
            .saturating_mul(WIRE_LIMIT_FACTOR);
        WebSocketConfig::default()
            .max_message_size(Some(wire_limit))
            .max_frame_size(Some(wire_limit))
    }

    fn decode(&self, text: &str) -> Result<SignalingMessage, SignalingError> {
        if text.len() > self.config.max_message_bytes {
            return Err(SignalingError::MessageTooLarge {
                size: text.len(),
                max: self.config.max_message_bytes,
            });
        }
        let message = SignalingMessage::from_json(text)?;
        validate_signaling_message(&message)?;
        Ok(message)
    }
}

#[async_trait]
impl SignalingTransport for WebSocketTransport {
    #[tracing::instrument(skip(self), fields(url = %self.config.url))]
    async fn connect(&self) -> Result<(), SignalingError> {
        let (ws, _response) = tokio_tungstenite::connect_async_with_config(
            self.config.url.as_str(),
            Some(self.websocket_config()),
            false,
        )
        .await
            .map_err(|e| SignalingError::TransportError(format!("Failed to connect: {e}")))?;
        let (sink, stream) = ws.split();

        *self.sink.lock().await = Some(sink);
        *self.stream.lock().await = Some(stream);
        tracing::debug!("WebSocket opened");
        Ok(())
    }

    async fn send_message(&self, message: &SignalingMessage) -> Result<(), SignalingError> {
        validate_signaling_message(message)?;
        let text = message.to_json()?;
        if text.len() > self.config.max_message_bytes {
            return Err(SignalingError::MessageTooLarge {
                size: text.len(),
                max: self.config.max_message_bytes,
            });
        }

        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(SignalingError::NotConnected)?;
        if let Err(e) = sink.send(Message::text(text)).await {
            *guard = None;
            return Err(SignalingError::TransportError(format!("Failed to send: {e}")));
        }
        Ok(())
    }

    async fn receive_message(&self) -> Result<Option<SignalingMessage>, SignalingError> {
        let mut guard = self.stream.lock().await;
        let stream = guard.as_mut().ok_or(SignalingError::NotConnected)?;

        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => return self.decode(text.as_str()).map(Some),
                Some(Ok(Message::Binary(data))) => {
                    let text = std::str::from_utf8(&data)
                        .map_err(|e| SignalingError::InvalidMessage(e.to_string()))?;
                    return self.decode(text).map(Some);
                }
                Some(Ok(Message::Close(frame))) => {
                    tracing::debug!(?frame, "WebSocket closed by server");
                    *guard = None;
                    return Ok(None);
                }
                Some(Ok(_)) => {
                    // Ping/pong are answered by tungstenite itself.
                }
                Some(Err(e)) => {
                    *guard = None;
                    return Err(SignalingError::TransportError(format!(
                        "Failed to receive: {e}"
                    )));
                }
                None => {
                    *guard = None;
                    return Ok(None);
                }
            }
        }
    }

    async fn close(&self) {
        if let Some(mut sink) = self.sink.lock().await.take() {
            if let Err(e) = sink.close().await {
                tracing::debug!(error = %e, "WebSocket close failed");
            }
        }
        self.stream.lock().await.take();
    }
}

/// Validate signaling message fields to prevent abuse
fn validate_signaling_message(message: &SignalingMessage) -> Result<(), SignalingError> {
    let check_id = |what: &str, value: &str| {
        if value.is_empty() || value.len() > MAX_ID_LENGTH {
            Err(SignalingError::InvalidMessage(format!(
                "{what} length {} outside 1..={MAX_ID_LENGTH}",
                value.len()
            )))
        } else {
            Ok(())
        }
    };
    let check_sdp = |what: &str, value: &str| {
        if value.len() > MAX_SDP_LENGTH {
            Err(SignalingError::InvalidMessage(format!(
                "{what} length {} exceeds maximum of {MAX_SDP_LENGTH}",
                value.len()
            )))
        } else {
            Ok(())
        }
    };

    match message {
        SignalingMessage::Invite {
            call_id,
            participants,
            ..
        } => {
            check_id("Call ID", call_id.as_str())?;
            if participants.len() > MAX_INVITE_PARTICIPANTS {
                return Err(SignalingError::InvalidMessage(format!(
                    "Invite lists {} participants, maximum is {MAX_INVITE_PARTICIPANTS}",
                    participants.len()
                )));
            }
            for participant in participants {
                check_id("Participant ID", participant.id.as_str())?;
            }
        }
        SignalingMessage::Answer { call_id, .. } | SignalingMessage::Ended { call_id } => {
            check_id("Call ID", call_id.as_str())?;
        }
        SignalingMessage::Reject { call_id, reason } => {
            check_id("Call ID", call_id.as_str())?;
            check_sdp("Reason", reason)?;
        }
        SignalingMessage::Offer { peer_id, sdp } | SignalingMessage::AnswerSdp { peer_id, sdp } => {
            check_id("Peer ID", peer_id.as_str())?;
            check_sdp("SDP", &sdp.sdp)?;
        }
        SignalingMessage::IceCandidate { peer_id, candidate } => {
            check_id("Peer ID", peer_id.as_str())?;
            check_sdp("Candidate", &candidate.candidate)?;
        }
        SignalingMessage::PeerJoined { peer_id } | SignalingMessage::PeerLeft { peer_id } => {
            check_id("Peer ID", peer_id.as_str())?;
        }
    }
    Ok(())
}
