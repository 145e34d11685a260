//! Meshcall - multi-party audio/video call orchestration
//!
//! This library establishes, manages and tears down small-group real-time
//! calls over a full mesh of peer connections. It features:
//!
//! - **Call state machine**: `Idle → Inviting/Ringing → Active → Ended`, with
//!   subscription-tier admission control
//! - **Peer mesh**: one connection per remote participant, offer/answer and
//!   candidate exchange, automatic retry on connection failure
//! - **Local media control**: mute, video-off, screen share and camera switch
//!   by track replacement, without renegotiation
//! - **Signaling channel**: JSON messages to a coordination server with
//!   automatic reconnect
//! - **Event bus**: typed notifications for UI and statistics consumers
//!
//! Capture and packet transport are delegated to a platform
//! [`MediaTransportProvider`]; the coordination server is reached through a
//! [`SignalingTransport`].
//!
//! # Examples
//!
//! The in-process hub and mock provider used here need the `test-utils`
//! feature.
//!
//! ```rust,no_run
//! # #[cfg(feature = "test-utils")]
//! # mod demo {
//! use meshcall_core::prelude::*;
//! use meshcall_core::testing::{MockMediaProvider, SignalingHub};
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let hub = SignalingHub::new();
//! let service = CallService::builder()
//!     .with_local("alice")
//!     .with_transport(Arc::new(hub.transport("alice")))
//!     .with_provider(Arc::new(MockMediaProvider::new()))
//!     .build()?;
//! service.start().await?;
//!
//! let session = service
//!     .start_call(vec!["bob".into()], CallType::Video, SubscriptionTier::Pro)
//!     .await?;
//! println!("calling {} participants", session.participants.len());
//! # Ok(())
//! # }
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::new_without_default)]

/// Call session types and data structures
pub mod types;

/// Participant identity
pub mod identity;

/// Event bus
pub mod events;

/// Media Transport Provider boundary
pub mod provider;

/// Signaling protocol and channel
pub mod signaling;

/// WebSocket signaling transport
pub mod transport;

/// Peer mesh management
pub mod mesh;

/// Local media management
pub mod media;

/// Call session management
pub mod call;

/// Service orchestration
pub mod service;

/// Test doubles for the provider and transport seams
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

// Re-export main types at crate root
pub use call::{CallError, CallManager, BUSY_REASON};
pub use events::{CallEvent, EventBus, EventKind};
pub use identity::{ParticipantRef, PeerId};
pub use media::{LocalMediaState, MediaConfig, MediaController, MediaError, OutgoingTracks};
pub use mesh::{MeshConfig, MeshError, PeerLinkInfo, PeerMesh};
pub use provider::{
    CaptureRequest, ConnectionConfig, ConnectionEvent, ConnectionEventKind, ConnectionEventSink,
    LocalCapture, MediaConnection, MediaTrack, MediaTransportProvider, ProviderError, TrackKind,
    TrackSource,
};
pub use service::{CallService, CallServiceBuilder, CallServiceConfig, ServiceError};
pub use signaling::{
    SignalingChannel, SignalingConfig, SignalingError, SignalingMessage, SignalingTransport,
};
pub use transport::{TransportConfig, WebSocketTransport};
pub use types::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::call::CallError;
    pub use crate::events::{CallEvent, EventKind};
    pub use crate::identity::{ParticipantRef, PeerId};
    pub use crate::media::MediaError;
    pub use crate::provider::{MediaConnection, MediaTrack, MediaTransportProvider};
    pub use crate::service::{CallService, CallServiceBuilder, CallServiceConfig, ServiceError};
    pub use crate::signaling::{SignalingMessage, SignalingTransport};
    pub use crate::transport::{TransportConfig, WebSocketTransport};
    pub use crate::types::{
        CallId, CallSession, CallState, CallType, ConnectionState, FacingMode, SubscriptionTier,
    };
}
