//! Call session management
//!
//! The [`CallManager`] owns the authoritative [`CallSession`] record and is
//! the only place its state changes. It enforces admission control and routes
//! inbound signaling to the [`PeerMesh`] and [`MediaController`]; it never
//! touches peer links or local tracks directly.
//!
//! Every guard ("are we ringing?", "is a call already running?") is evaluated
//! under the slot lock before any asynchronous step starts. Operations that
//! suspend re-check the session afterwards, so a teardown that happened in
//! the meantime wins.

use crate::events::{CallEvent, EventBus};
use crate::identity::{ParticipantRef, PeerId};
use crate::media::{MediaController, MediaError};
use crate::mesh::PeerMesh;
use crate::signaling::{SignalingChannel, SignalingMessage};
use crate::types::{
    AdmissionPolicy, CallDirection, CallId, CallSession, CallState, CallType, SubscriptionTier,
};
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;

/// Reason sent when an invite arrives during another call
pub const BUSY_REASON: &str = "busy";

/// Call management errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// The tier may not place calls
    #[error("Call access denied for tier {tier}")]
    AccessDenied {
        /// Caller tier
        tier: SubscriptionTier,
    },

    /// The tier may not place calls with more than two participants
    #[error("Group calls not allowed for tier {tier}")]
    GroupNotAllowed {
        /// Caller tier
        tier: SubscriptionTier,
    },

    /// The roster exceeds the tier's participant cap
    #[error("Tier {tier} allows {max} participants, {requested} requested")]
    ParticipantLimitExceeded {
        /// Caller tier
        tier: SubscriptionTier,
        /// Roster size, local participant included
        requested: usize,
        /// Tier cap
        max: usize,
    },

    /// Another call is not finished yet
    #[error("Another call is in progress")]
    CallInProgress,

    /// The roster names nobody besides the local participant
    #[error("No remote participants")]
    NoParticipants,

    /// No call with this id
    #[error("Call not found: {0}")]
    CallNotFound(String),

    /// Operation not valid in the current state
    #[error("Invalid call state: {0}")]
    InvalidState(CallState),

    /// The call was torn down while the operation was suspended
    #[error("Call was ended while the operation was in progress")]
    Cancelled,

    /// Local media failure
    #[error(transparent)]
    Media(#[from] MediaError),
}

#[derive(Default)]
struct Slot {
    session: Option<CallSession>,
    media_pending: bool,
}

impl Slot {
    fn live(&self) -> Option<&CallSession> {
        self.session.as_ref().filter(|s| !s.state.is_terminal())
    }

    fn live_mut(&mut self) -> Option<&mut CallSession> {
        self.session.as_mut().filter(|s| !s.state.is_terminal())
    }

    fn is_busy(&self) -> bool {
        self.media_pending || self.live().is_some()
    }

    fn live_call(&mut self, call_id: &CallId) -> Option<&mut CallSession> {
        self.live_mut().filter(|s| &s.id == call_id)
    }
}

/// Move `session` to `to` if that is an edge of the state machine
fn transition(session: &mut CallSession, to: CallState) -> Option<CallEvent> {
    let from = session.state;
    if !from.can_transition_to(to) {
        tracing::warn!(call_id = %session.id, %from, %to, "Ignoring invalid state transition");
        return None;
    }
    session.state = to;
    if to.is_terminal() {
        session.ended_at = Some(Utc::now());
    }
    tracing::info!(call_id = %session.id, %from, %to, "Call state changed");
    Some(CallEvent::StateChanged {
        call_id: session.id.clone(),
        from,
        to,
    })
}

/// Top-level call state machine
pub struct CallManager {
    local: ParticipantRef,
    admission: AdmissionPolicy,
    slot: Mutex<Slot>,
    media: Arc<MediaController>,
    mesh: Arc<PeerMesh>,
    signaling: Arc<SignalingChannel>,
    events: EventBus,
}

impl CallManager {
    /// Create a manager for the local participant `local`
    pub fn new(
        local: ParticipantRef,
        admission: AdmissionPolicy,
        media: Arc<MediaController>,
        mesh: Arc<PeerMesh>,
        signaling: Arc<SignalingChannel>,
        events: EventBus,
    ) -> Self {
        Self {
            local,
            admission,
            slot: Mutex::new(Slot::default()),
            media,
            mesh,
            signaling,
            events,
        }
    }

    /// Local participant
    #[must_use]
    pub fn local(&self) -> &ParticipantRef {
        &self.local
    }

    /// Snapshot of the current or last call
    #[must_use]
    pub fn session(&self) -> Option<CallSession> {
        self.slot.lock().session.clone()
    }

    /// Current state; `Idle` when no call was ever made
    #[must_use]
    pub fn state(&self) -> CallState {
        self.slot
            .lock()
            .session
            .as_ref()
            .map_or(CallState::Idle, |s| s.state)
    }

    /// Whether a call is in progress
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.slot.lock().is_busy()
    }

    /// Check `roster_len` participants against the tier table
    ///
    /// # Errors
    ///
    /// Returns the first admission rule the roster breaks
    pub fn admit(&self, roster_len: usize, tier: SubscriptionTier) -> Result<(), CallError> {
        let limits = self.admission.limits(tier);
        if !limits.call_access {
            return Err(CallError::AccessDenied { tier });
        }
        if roster_len > 2 && !limits.group_calls {
            return Err(CallError::GroupNotAllowed { tier });
        }
        if roster_len > limits.max_participants {
            return Err(CallError::ParticipantLimitExceeded {
                tier,
                requested: roster_len,
                max: limits.max_participants,
            });
        }
        Ok(())
    }

    /// Deduplicate by id and put the local participant first
    fn normalize_roster(&self, participants: Vec<ParticipantRef>) -> Vec<ParticipantRef> {
        let mut roster = vec![self.local.clone()];
        for participant in participants {
            if !roster.iter().any(|p| p.id == participant.id) {
                roster.push(participant);
            }
        }
        roster
    }

    /// Place a call
    ///
    /// Admission is checked on the normalized roster (local participant
    /// included) before anything is created. The invite goes out once local
    /// media is ready and the session is `Active`; remote peers join later.
    ///
    /// # Errors
    ///
    /// - [`CallError::CallInProgress`] while another call is running
    /// - [`CallError::NoParticipants`] for an empty remote roster
    /// - admission errors, with no session created
    /// - [`CallError::Media`] if capture fails; the session ends
    /// - [`CallError::Cancelled`] if the call was ended during capture
    #[tracing::instrument(skip(self, participants), fields(count = participants.len()))]
    pub async fn start_call(
        &self,
        participants: Vec<ParticipantRef>,
        call_type: CallType,
        tier: SubscriptionTier,
    ) -> Result<CallSession, CallError> {
        let roster = self.normalize_roster(participants);
        let call_id = {
            let mut slot = self.slot.lock();
            if slot.is_busy() {
                return Err(CallError::CallInProgress);
            }
            if roster.len() < 2 {
                return Err(CallError::NoParticipants);
            }
            self.admit(roster.len(), tier)?;

            let session =
                CallSession::new(CallId::new(), roster, call_type, CallDirection::Outgoing);
            let call_id = session.id.clone();
            slot.session = Some(session);
            slot.media_pending = true;
            call_id
        };
        tracing::info!(call_id = %call_id, ?call_type, "Starting call");
        self.events.publish(CallEvent::StateChanged {
            call_id: call_id.clone(),
            from: CallState::Idle,
            to: CallState::Inviting,
        });

        let acquired = self
            .media
            .acquire_local_media(call_type.includes_video())
            .await;

        let mut published = Vec::new();
        let outcome = {
            let mut guard = self.slot.lock();
            let slot = &mut *guard;
            slot.media_pending = false;
            match (acquired, slot.live_call(&call_id)) {
                (Ok(_), Some(session)) => {
                    published.extend(transition(session, CallState::Active));
                    Ok(session.clone())
                }
                (Err(MediaError::Released), _) | (Ok(_), None) => Err(CallError::Cancelled),
                (Err(e), Some(session)) => {
                    published.extend(transition(session, CallState::Ended));
                    published.push(CallEvent::CallEnded {
                        call_id: call_id.clone(),
                    });
                    Err(CallError::Media(e))
                }
                (Err(_), None) => Err(CallError::Cancelled),
            }
        };
        for event in published {
            self.events.publish(event);
        }

        let session = match outcome {
            Ok(session) => session,
            Err(CallError::Cancelled) => {
                tracing::debug!(call_id = %call_id, "Call ended during media acquisition");
                return Err(CallError::Cancelled);
            }
            Err(e) => {
                tracing::warn!(call_id = %call_id, error = %e, "Call start failed");
                return Err(e);
            }
        };

        let invite = SignalingMessage::Invite {
            call_id: call_id.clone(),
            participants: session.participants.clone(),
            call_type,
        };
        if let Err(e) = self.signaling.send(invite).await {
            tracing::warn!(call_id = %call_id, error = %e, "Failed to send invite");
        }
        Ok(session)
    }

    /// Accept the ringing call `call_id`
    ///
    /// # Errors
    ///
    /// - [`CallError::CallNotFound`] if no live call has this id
    /// - [`CallError::InvalidState`] if the call is not ringing or is
    ///   already being answered
    /// - [`CallError::Media`] if capture fails; the call keeps ringing
    /// - [`CallError::Cancelled`] if the call ended during capture
    #[tracing::instrument(skip(self), fields(call_id = %call_id))]
    pub async fn answer_call(&self, call_id: &CallId, with_video: bool) -> Result<(), CallError> {
        {
            let mut guard = self.slot.lock();
            let slot = &mut *guard;
            let state = slot
                .live()
                .filter(|s| &s.id == call_id)
                .map(|s| s.state)
                .ok_or_else(|| CallError::CallNotFound(call_id.to_string()))?;
            if state != CallState::Ringing || slot.media_pending {
                return Err(CallError::InvalidState(state));
            }
            slot.media_pending = true;
        }

        let acquired = self.media.acquire_local_media(with_video).await;

        let (event, outcome) = {
            let mut guard = self.slot.lock();
            let slot = &mut *guard;
            slot.media_pending = false;
            let ringing = slot
                .live_call(call_id)
                .filter(|s| s.state == CallState::Ringing);
            match (acquired, ringing) {
                (Ok(_), Some(session)) => (transition(session, CallState::Active), Ok(())),
                (Err(MediaError::Released), _) => (None, Err(CallError::Cancelled)),
                (Err(e), Some(_)) => (None, Err(CallError::Media(e))),
                (Ok(_), None) => {
                    self.media.release_all();
                    (None, Err(CallError::Cancelled))
                }
                (Err(_), None) => (None, Err(CallError::Cancelled)),
            }
        };
        if let Some(event) = event {
            self.events.publish(event);
        }
        if let Err(e) = outcome {
            tracing::warn!(error = %e, "Answer failed");
            return Err(e);
        }

        let answer = SignalingMessage::Answer {
            call_id: call_id.clone(),
            with_video,
        };
        if let Err(e) = self.signaling.send(answer).await {
            tracing::warn!(error = %e, "Failed to send answer");
        }
        Ok(())
    }

    /// Decline the ringing call `call_id`
    ///
    /// # Errors
    ///
    /// - [`CallError::CallNotFound`] if no live call has this id
    /// - [`CallError::InvalidState`] if the call is not ringing
    #[tracing::instrument(skip(self), fields(call_id = %call_id))]
    pub async fn reject_call(&self, call_id: &CallId, reason: &str) -> Result<(), CallError> {
        let event = {
            let mut slot = self.slot.lock();
            let session = slot
                .live_call(call_id)
                .ok_or_else(|| CallError::CallNotFound(call_id.to_string()))?;
            if session.state != CallState::Ringing {
                return Err(CallError::InvalidState(session.state));
            }
            transition(session, CallState::Rejected)
        };
        self.media.release_all();
        self.mesh.close_all().await;
        if let Some(event) = event {
            self.events.publish(event);
        }
        self.events.publish(CallEvent::CallRejected {
            call_id: call_id.clone(),
            reason: reason.to_string(),
        });

        let reject = SignalingMessage::Reject {
            call_id: call_id.clone(),
            reason: reason.to_string(),
        };
        if let Err(e) = self.signaling.send(reject).await {
            tracing::warn!(error = %e, "Failed to send reject");
        }
        Ok(())
    }

    /// Hang up
    ///
    /// Closes every link and releases all media. Calling it with no live
    /// call is a no-op.
    ///
    /// # Errors
    ///
    /// Currently infallible; signaling failures are logged.
    #[tracing::instrument(skip(self))]
    pub async fn end_call(&self) -> Result<(), CallError> {
        let (call_id, event) = {
            let mut slot = self.slot.lock();
            let Some(session) = slot.live_mut() else {
                return Ok(());
            };
            (session.id.clone(), transition(session, CallState::Ended))
        };

        self.teardown().await;
        if let Some(event) = event {
            self.events.publish(event);
        }
        self.events.publish(CallEvent::CallEnded {
            call_id: call_id.clone(),
        });

        if let Err(e) = self.signaling.send(SignalingMessage::Ended { call_id }).await {
            tracing::warn!(error = %e, "Failed to send call end");
        }
        Ok(())
    }

    async fn teardown(&self) {
        self.media.release_all();
        self.mesh.close_all().await;
    }

    /// Route one inbound signaling message
    pub async fn handle_signaling(&self, message: SignalingMessage) {
        match message {
            SignalingMessage::Invite {
                call_id,
                participants,
                call_type,
            } => self.on_invite(call_id, participants, call_type).await,
            SignalingMessage::Answer {
                call_id,
                with_video,
            } => self.on_answer(call_id, with_video),
            SignalingMessage::Reject { call_id, reason } => self.on_reject(call_id, reason).await,
            SignalingMessage::Ended { call_id } => self.on_ended(call_id).await,
            SignalingMessage::Offer { peer_id, sdp } => {
                if !self.admit_peer(&peer_id) {
                    tracing::debug!(peer_id = %peer_id, "Offer outside an active call, dropping");
                    return;
                }
                if let Err(e) = self.mesh.handle_offer(&peer_id, sdp).await {
                    tracing::warn!(peer_id = %peer_id, error = %e, "Failed to handle offer");
                }
            }
            SignalingMessage::AnswerSdp { peer_id, sdp } => {
                self.mesh.handle_answer(&peer_id, sdp).await;
            }
            SignalingMessage::IceCandidate { peer_id, candidate } => {
                self.mesh.handle_ice_candidate(&peer_id, candidate).await;
            }
            SignalingMessage::PeerJoined { peer_id } => self.on_peer_joined(peer_id).await,
            SignalingMessage::PeerLeft { peer_id } => self.on_peer_left(peer_id).await,
        }
    }

    async fn on_invite(
        &self,
        call_id: CallId,
        participants: Vec<ParticipantRef>,
        call_type: CallType,
    ) {
        if !participants.iter().any(|p| p.id == self.local.id) {
            tracing::debug!(call_id = %call_id, "Invite does not name us, ignoring");
            return;
        }

        let mut roster: Vec<ParticipantRef> = Vec::with_capacity(participants.len());
        for participant in participants {
            if !roster.iter().any(|p| p.id == participant.id) {
                roster.push(participant);
            }
        }

        let accepted = {
            let mut slot = self.slot.lock();
            if let Some(current) = slot.live() {
                if current.id == call_id {
                    tracing::debug!(call_id = %call_id, "Duplicate invite");
                    return;
                }
                false
            } else if slot.media_pending {
                false
            } else {
                slot.session = Some(CallSession::new(
                    call_id.clone(),
                    roster.clone(),
                    call_type,
                    CallDirection::Incoming,
                ));
                true
            }
        };

        if !accepted {
            tracing::info!(call_id = %call_id, "Busy, rejecting incoming call");
            let reject = SignalingMessage::Reject {
                call_id,
                reason: BUSY_REASON.to_string(),
            };
            if let Err(e) = self.signaling.send(reject).await {
                tracing::warn!(error = %e, "Failed to send busy reject");
            }
            return;
        }

        tracing::info!(
            call_id = %call_id,
            caller = %roster.first().map(ParticipantRef::label).unwrap_or_default(),
            "Incoming call"
        );
        self.events.publish(CallEvent::StateChanged {
            call_id: call_id.clone(),
            from: CallState::Idle,
            to: CallState::Ringing,
        });
        self.events.publish(CallEvent::IncomingCall {
            call_id,
            participants: roster,
            call_type,
        });
    }

    fn on_answer(&self, call_id: CallId, with_video: bool) {
        if self.slot.lock().live_call(&call_id).is_none() {
            tracing::debug!(call_id = %call_id, "Answer for unknown call");
            return;
        }
        tracing::info!(call_id = %call_id, with_video, "Call answered by remote");
        self.events.publish(CallEvent::CallAnswered {
            call_id,
            with_video,
        });
    }

    async fn on_reject(&self, call_id: CallId, reason: String) {
        let (known, event) = {
            let mut slot = self.slot.lock();
            match slot.live_call(&call_id) {
                None => (false, None),
                Some(session) if session.is_group => (true, None),
                Some(session) => match session.state {
                    CallState::Inviting => (true, transition(session, CallState::Rejected)),
                    CallState::Active => (true, transition(session, CallState::Ended)),
                    _ => (true, None),
                },
            }
        };
        if !known {
            tracing::debug!(call_id = %call_id, "Reject for unknown call");
            return;
        }

        tracing::info!(call_id = %call_id, %reason, "Call rejected by remote");
        let torn_down = event.is_some();
        if torn_down {
            self.teardown().await;
        }
        if let Some(event) = event {
            self.events.publish(event);
        }
        self.events.publish(CallEvent::CallRejected {
            call_id: call_id.clone(),
            reason,
        });
        if torn_down {
            self.events.publish(CallEvent::CallEnded { call_id });
        }
    }

    async fn on_ended(&self, call_id: CallId) {
        let event = {
            let mut slot = self.slot.lock();
            match slot.live_call(&call_id) {
                Some(session) => transition(session, CallState::Ended),
                None => {
                    tracing::debug!(call_id = %call_id, "End for unknown call");
                    return;
                }
            }
        };
        tracing::info!(call_id = %call_id, "Call ended by remote");
        self.teardown().await;
        if let Some(event) = event {
            self.events.publish(event);
        }
        self.events.publish(CallEvent::CallEnded { call_id });
    }

    /// Whether negotiation with `peer` belongs to the active call; adds the
    /// peer to the roster when the server routes a newcomer to us
    fn admit_peer(&self, peer: &PeerId) -> bool {
        if peer == &self.local.id {
            return false;
        }
        let mut slot = self.slot.lock();
        match slot.live_mut() {
            Some(session) if session.state == CallState::Active => {
                if !session.has_participant(peer) {
                    tracing::debug!(peer_id = %peer, "Adding unlisted peer to roster");
                    session.add_participant(ParticipantRef::new(peer.clone()));
                    session.is_group = session.participants.len() > 2;
                }
                true
            }
            _ => false,
        }
    }

    fn still_in_call(&self, peer: &PeerId) -> bool {
        self.slot
            .lock()
            .live()
            .is_some_and(|s| s.state == CallState::Active && s.has_participant(peer))
    }

    async fn on_peer_joined(&self, peer_id: PeerId) {
        if !self.admit_peer(&peer_id) {
            tracing::debug!(peer_id = %peer_id, "Peer joined outside an active call, ignoring");
            return;
        }

        if let Err(e) = self.mesh.create_link(&peer_id).await {
            tracing::warn!(peer_id = %peer_id, error = %e, "Failed to create link for new peer");
            return;
        }
        if !self.still_in_call(&peer_id) {
            self.mesh.close_link(&peer_id).await;
            return;
        }

        tracing::info!(peer_id = %peer_id, "Peer joined");
        self.events.publish(CallEvent::PeerJoined {
            peer_id: peer_id.clone(),
        });

        if self.media.has_local_media() {
            if let Err(e) = self.mesh.make_offer(&peer_id).await {
                tracing::warn!(peer_id = %peer_id, error = %e, "Failed to offer to new peer");
            }
        }
    }

    async fn on_peer_left(&self, peer_id: PeerId) {
        let known = {
            let mut slot = self.slot.lock();
            match slot.live_mut() {
                Some(session) if session.has_participant(&peer_id) => {
                    session.remove_participant(&peer_id);
                    true
                }
                _ => false,
            }
        };
        self.mesh.close_link(&peer_id).await;
        if known {
            tracing::info!(peer_id = %peer_id, "Peer left");
            self.events.publish(CallEvent::PeerLeft { peer_id });
        }
    }
}
