//! Call session types and data structures

use crate::identity::{ParticipantRef, PeerId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier for a call
///
/// Locally created calls get a random UUID; ids received from the
/// coordination server are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(pub String);

impl CallId {
    /// Create a new random call ID
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CallId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Kind of call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    /// Audio only
    Audio,
    /// Audio and camera video
    Video,
}

impl CallType {
    /// Whether local capture should include a camera track
    pub fn includes_video(self) -> bool {
        matches!(self, Self::Video)
    }
}

/// Call state machine
///
/// ```text
///   Idle ──start_call──► Inviting ──media ready──► Active ──end──► Ended
///     │                     │                        ▲
///     └──invite──► Ringing ─┼──answer_call───────────┘
///                     │     │
///                     └─────┴──reject──► Rejected
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallState {
    /// No call
    Idle,
    /// Outgoing call, local media being acquired
    Inviting,
    /// Incoming call waiting for a local decision
    Ringing,
    /// Call in progress
    Active,
    /// Call finished
    Ended,
    /// Call declined before it became active
    Rejected,
}

impl CallState {
    /// Terminal states accept no further transitions
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ended | Self::Rejected)
    }

    /// Check whether `self -> to` is an edge of the state machine
    pub fn can_transition_to(self, to: CallState) -> bool {
        matches!(
            (self, to),
            (CallState::Idle, CallState::Inviting)
                | (CallState::Idle, CallState::Ringing)
                | (CallState::Inviting, CallState::Active)
                | (CallState::Ringing, CallState::Active)
                | (CallState::Inviting, CallState::Rejected)
                | (CallState::Ringing, CallState::Rejected)
                | (CallState::Inviting, CallState::Ended)
                | (CallState::Ringing, CallState::Ended)
                | (CallState::Active, CallState::Ended)
        )
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Which side created the call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallDirection {
    /// Started locally
    Outgoing,
    /// Received as an invite
    Incoming,
}

/// Authoritative record of the current call
#[derive(Debug, Clone)]
pub struct CallSession {
    /// Call identifier
    pub id: CallId,
    /// Full roster, local participant included
    pub participants: Vec<ParticipantRef>,
    /// Audio or video
    pub call_type: CallType,
    /// More than two participants
    pub is_group: bool,
    /// Current state
    pub state: CallState,
    /// Outgoing or incoming
    pub direction: CallDirection,
    /// Creation timestamp
    pub started_at: DateTime<Utc>,
    /// Set when the call reaches a terminal state
    pub ended_at: Option<DateTime<Utc>>,
}

impl CallSession {
    /// Create a session in its initial state for the given direction
    pub fn new(
        id: CallId,
        participants: Vec<ParticipantRef>,
        call_type: CallType,
        direction: CallDirection,
    ) -> Self {
        let state = match direction {
            CallDirection::Outgoing => CallState::Inviting,
            CallDirection::Incoming => CallState::Ringing,
        };
        Self {
            id,
            is_group: participants.len() > 2,
            participants,
            call_type,
            state,
            direction,
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    /// Check roster membership
    pub fn has_participant(&self, peer: &PeerId) -> bool {
        self.participants.iter().any(|p| &p.id == peer)
    }

    /// Add a participant unless already present
    pub fn add_participant(&mut self, participant: ParticipantRef) {
        if !self.has_participant(&participant.id) {
            self.participants.push(participant);
        }
    }

    /// Remove a participant
    pub fn remove_participant(&mut self, peer: &PeerId) {
        self.participants.retain(|p| &p.id != peer);
    }

    /// Get call duration
    pub fn duration(&self) -> chrono::Duration {
        self.ended_at.unwrap_or_else(Utc::now) - self.started_at
    }
}

/// Subscription tier of the calling user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionTier {
    /// No subscription
    #[serde(alias = "none")]
    Free,
    /// Entry tier, 1:1 calls only
    Starter,
    /// Small group calls
    Pro,
    /// Largest group calls
    Vip,
}

impl SubscriptionTier {
    /// All tiers, lowest first
    pub const ALL: [SubscriptionTier; 4] = [Self::Free, Self::Starter, Self::Pro, Self::Vip];

    /// Reference capabilities of this tier
    pub fn limits(self) -> TierLimits {
        match self {
            Self::Free => TierLimits {
                call_access: false,
                group_calls: false,
                max_participants: 0,
            },
            Self::Starter => TierLimits {
                call_access: true,
                group_calls: false,
                max_participants: 2,
            },
            Self::Pro => TierLimits {
                call_access: true,
                group_calls: true,
                max_participants: 4,
            },
            Self::Vip => TierLimits {
                call_access: true,
                group_calls: true,
                max_participants: 6,
            },
        }
    }

    /// Reference participant cap of this tier
    pub fn max_participants(self) -> usize {
        self.limits().max_participants
    }
}

impl fmt::Display for SubscriptionTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Free => "free",
            Self::Starter => "starter",
            Self::Pro => "pro",
            Self::Vip => "vip",
        };
        f.write_str(name)
    }
}

impl FromStr for SubscriptionTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "free" => Ok(Self::Free),
            "starter" => Ok(Self::Starter),
            "pro" => Ok(Self::Pro),
            "vip" => Ok(Self::Vip),
            other => Err(format!("unknown subscription tier: {other}")),
        }
    }
}

/// Call capabilities granted by a tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierLimits {
    /// May place calls at all
    pub call_access: bool,
    /// May place calls with more than two participants
    pub group_calls: bool,
    /// Roster cap, local participant included
    pub max_participants: usize,
}

/// Tier table used for admission control
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionPolicy {
    /// Limits for free users
    pub free: TierLimits,
    /// Limits for starter users
    pub starter: TierLimits,
    /// Limits for pro users
    pub pro: TierLimits,
    /// Limits for vip users
    pub vip: TierLimits,
}

impl AdmissionPolicy {
    /// Limits configured for `tier`
    pub fn limits(&self, tier: SubscriptionTier) -> TierLimits {
        match tier {
            SubscriptionTier::Free => self.free,
            SubscriptionTier::Starter => self.starter,
            SubscriptionTier::Pro => self.pro,
            SubscriptionTier::Vip => self.vip,
        }
    }
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        Self {
            free: SubscriptionTier::Free.limits(),
            starter: SubscriptionTier::Starter.limits(),
            pro: SubscriptionTier::Pro.limits(),
            vip: SubscriptionTier::Vip.limits(),
        }
    }
}

/// STUN/TURN server handed to every new connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    /// Server URLs
    pub urls: Vec<String>,
    /// TURN username
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// TURN credential
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    /// STUN server without credentials
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    /// Public STUN servers used when nothing is configured
    pub fn default_stun() -> Vec<Self> {
        vec![
            Self::stun("stun:stun.l.google.com:19302"),
            Self::stun("stun:stun1.l.google.com:19302"),
        ]
    }
}

/// Kind of negotiation description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    /// Offer
    Offer,
    /// Answer
    Answer,
}

/// Negotiation description exchanged between two peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    /// Opaque description body
    pub sdp: String,
}

impl SessionDescription {
    /// Offer description
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    /// Answer description
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Network candidate for a connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// Candidate line
    pub candidate: String,
    /// SDP media ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    /// SDP media line index
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    /// Candidate with no media association
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }
}

/// Health of one peer connection as reported by the media transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Created, not negotiated
    New,
    /// Negotiating or checking candidates
    Connecting,
    /// Media flowing
    Connected,
    /// Temporarily lost
    Disconnected,
    /// Gave up; needs a fresh offer
    Failed,
    /// Closed locally
    Closed,
}

/// Which side of the offer/answer exchange a link took
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NegotiationRole {
    /// Sent the offer
    Offerer,
    /// Answered a remote offer
    Answerer,
}

/// Camera facing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FacingMode {
    /// Front camera
    User,
    /// Rear camera
    Environment,
}

impl FacingMode {
    /// The other camera
    pub fn opposite(self) -> Self {
        match self {
            Self::User => Self::Environment,
            Self::Environment => Self::User,
        }
    }
}
