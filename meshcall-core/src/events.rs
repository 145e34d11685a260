//! Event bus
//!
//! Session and peer-level notifications for external collaborators (UI,
//! statistics). Every notification is a variant of the closed [`CallEvent`]
//! enum; subscribers either take the raw broadcast receiver or a stream
//! filtered down to the [`EventKind`]s they care about.

use crate::identity::{ParticipantRef, PeerId};
use crate::provider::MediaTrack;
use crate::types::{CallId, CallState, CallType, ConnectionState, FacingMode};
use futures::{Stream, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

/// Notification published on the event bus
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// Session state machine moved
    StateChanged {
        /// Call identifier
        call_id: CallId,
        /// Previous state
        from: CallState,
        /// New state
        to: CallState,
    },
    /// Invite received while idle
    IncomingCall {
        /// Call identifier
        call_id: CallId,
        /// Caller followed by the rest of the roster
        participants: Vec<ParticipantRef>,
        /// Audio or video
        call_type: CallType,
    },
    /// A remote participant accepted the call
    CallAnswered {
        /// Call identifier
        call_id: CallId,
        /// Whether the answerer sends video
        with_video: bool,
    },
    /// The call was declined
    CallRejected {
        /// Call identifier
        call_id: CallId,
        /// Reason given by the rejecting side
        reason: String,
    },
    /// The call finished
    CallEnded {
        /// Call identifier
        call_id: CallId,
    },
    /// Local capture acquired
    LocalStream {
        /// Captured tracks
        tracks: Vec<MediaTrack>,
    },
    /// A remote track became available
    RemoteStream {
        /// Sending peer
        peer_id: PeerId,
        /// Received track
        track: MediaTrack,
    },
    /// A participant joined the active call
    PeerJoined {
        /// Joining peer
        peer_id: PeerId,
    },
    /// A participant left the active call
    PeerLeft {
        /// Leaving peer
        peer_id: PeerId,
    },
    /// Per-peer connection health changed
    ConnectionStateChanged {
        /// Remote peer
        peer_id: PeerId,
        /// New state
        state: ConnectionState,
    },
    /// A peer connection failed; a retry offer is scheduled
    ConnectionFailed {
        /// Remote peer
        peer_id: PeerId,
    },
    /// Microphone muted or unmuted
    MuteChanged {
        /// New mute state
        muted: bool,
    },
    /// Camera turned off or on
    VideoChanged {
        /// New video-off state
        video_off: bool,
    },
    /// Screen track is now outgoing
    ScreenShareStarted,
    /// Camera track is outgoing again
    ScreenShareStopped,
    /// Camera replaced by the opposite one
    CameraSwitched {
        /// Facing of the new camera
        facing: FacingMode,
    },
    /// Signaling connection established
    SignalingConnected,
    /// Signaling connection lost; a reconnect is scheduled
    SignalingDisconnected,
}

/// Discriminant of [`CallEvent`] used for filtered subscriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// [`CallEvent::StateChanged`]
    StateChanged,
    /// [`CallEvent::IncomingCall`]
    IncomingCall,
    /// [`CallEvent::CallAnswered`]
    CallAnswered,
    /// [`CallEvent::CallRejected`]
    CallRejected,
    /// [`CallEvent::CallEnded`]
    CallEnded,
    /// [`CallEvent::LocalStream`]
    LocalStream,
    /// [`CallEvent::RemoteStream`]
    RemoteStream,
    /// [`CallEvent::PeerJoined`]
    PeerJoined,
    /// [`CallEvent::PeerLeft`]
    PeerLeft,
    /// [`CallEvent::ConnectionStateChanged`]
    ConnectionStateChanged,
    /// [`CallEvent::ConnectionFailed`]
    ConnectionFailed,
    /// [`CallEvent::MuteChanged`]
    MuteChanged,
    /// [`CallEvent::VideoChanged`]
    VideoChanged,
    /// [`CallEvent::ScreenShareStarted`]
    ScreenShareStarted,
    /// [`CallEvent::ScreenShareStopped`]
    ScreenShareStopped,
    /// [`CallEvent::CameraSwitched`]
    CameraSwitched,
    /// [`CallEvent::SignalingConnected`]
    SignalingConnected,
    /// [`CallEvent::SignalingDisconnected`]
    SignalingDisconnected,
}

impl CallEvent {
    /// Discriminant of this event
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Self::StateChanged { .. } => EventKind::StateChanged,
            Self::IncomingCall { .. } => EventKind::IncomingCall,
            Self::CallAnswered { .. } => EventKind::CallAnswered,
            Self::CallRejected { .. } => EventKind::CallRejected,
            Self::CallEnded { .. } => EventKind::CallEnded,
            Self::LocalStream { .. } => EventKind::LocalStream,
            Self::RemoteStream { .. } => EventKind::RemoteStream,
            Self::PeerJoined { .. } => EventKind::PeerJoined,
            Self::PeerLeft { .. } => EventKind::PeerLeft,
            Self::ConnectionStateChanged { .. } => EventKind::ConnectionStateChanged,
            Self::ConnectionFailed { .. } => EventKind::ConnectionFailed,
            Self::MuteChanged { .. } => EventKind::MuteChanged,
            Self::VideoChanged { .. } => EventKind::VideoChanged,
            Self::ScreenShareStarted => EventKind::ScreenShareStarted,
            Self::ScreenShareStopped => EventKind::ScreenShareStopped,
            Self::CameraSwitched { .. } => EventKind::CameraSwitched,
            Self::SignalingConnected => EventKind::SignalingConnected,
            Self::SignalingDisconnected => EventKind::SignalingDisconnected,
        }
    }
}

/// Publish/subscribe fan-out of [`CallEvent`]s
///
/// Cloning the bus yields another handle onto the same registry.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CallEvent>,
}

impl EventBus {
    /// Create a bus retaining up to `capacity` undelivered events per subscriber
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event to every current subscriber
    pub fn publish(&self, event: CallEvent) {
        let kind = event.kind();
        if self.sender.send(event).is_err() {
            tracing::trace!(?kind, "No event subscribers");
        }
    }

    /// Subscribe to every event
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.sender.subscribe()
    }

    /// Subscribe to the given kinds only
    ///
    /// Lagged subscribers silently skip the events they missed.
    pub fn subscribe_kinds(
        &self,
        kinds: &[EventKind],
    ) -> impl Stream<Item = CallEvent> + Send + Unpin + 'static {
        let kinds = kinds.to_vec();
        BroadcastStream::new(self.sender.subscribe()).filter_map(move |item| {
            let wanted = match item {
                Ok(event) if kinds.contains(&event.kind()) => Some(event),
                Ok(_) => None,
                Err(err) => {
                    tracing::warn!(error = %err, "Event subscriber lagged");
                    None
                }
            };
            futures::future::ready(wanted)
        })
    }

    /// Number of live subscribers
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let bus = EventBus::new(16);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(CallEvent::ScreenShareStarted);

        assert_eq!(a.recv().await.unwrap().kind(), EventKind::ScreenShareStarted);
        assert_eq!(b.recv().await.unwrap().kind(), EventKind::ScreenShareStarted);
    }

    #[test]
    fn test_publish_without_subscribers_is_harmless() {
        let bus = EventBus::new(4);
        bus.publish(CallEvent::SignalingConnected);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_filtered_subscription() {
        let bus = EventBus::new(16);
        let mut muted = bus.subscribe_kinds(&[EventKind::MuteChanged]);

        bus.publish(CallEvent::VideoChanged { video_off: true });
        bus.publish(CallEvent::MuteChanged { muted: true });

        match muted.next().await.unwrap() {
            CallEvent::MuteChanged { muted } => assert!(muted),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
