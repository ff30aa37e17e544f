// Session lifecycle state machine: create, join handshake, membership
// tracking, and settings propagation.
//
// The manager is sans-IO. Every operation returns the messages to put on
// the wire and the events to surface; the runtime owns the transport and
// the observer registry. Time is always passed in, so the join deadline is
// testable without sleeping.

use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use slicesync_common::protocol::{StateUpdateAction, StateUpdateData, SyncMessage, SyncPayload};
use slicesync_common::types::{
    ParticipantRole, Permissions, SessionSettings, SyncParticipant, SyncSession,
};

/// Default join handshake deadline.
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// What a session operation wants surfaced and sent.
#[derive(Debug, Default)]
pub struct SessionOutput {
    pub events: Vec<SessionEvent>,
    pub outbound: Vec<SyncMessage>,
}

impl SessionOutput {
    fn event(event: SessionEvent) -> Self {
        Self { events: vec![event], outbound: Vec::new() }
    }
}

/// Session-level happenings, mapped to engine events by the runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Joined(SyncSession),
    JoinRejected { session_id: Uuid },
    JoinTimedOut { session_id: Uuid },
    ParticipantJoined(SyncParticipant),
    ParticipantLeft { user_id: String },
    /// The host departed; the session is over for everyone.
    SessionEnded { session_id: Uuid },
    SettingsUpdated(SessionSettings),
}

/// Join handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JoinState {
    Idle,
    Pending { session_id: Uuid, deadline: DateTime<Utc> },
}

/// Tracks the local participant's session membership.
#[derive(Debug)]
pub struct SessionManager {
    local_user_id: String,
    display_name: String,
    session: Option<SyncSession>,
    join: JoinState,
    join_timeout: Duration,
}

impl SessionManager {
    pub fn new(
        local_user_id: impl Into<String>,
        display_name: impl Into<String>,
        join_timeout: Duration,
    ) -> Self {
        Self {
            local_user_id: local_user_id.into(),
            display_name: display_name.into(),
            session: None,
            join: JoinState::Idle,
            join_timeout,
        }
    }

    pub fn session(&self) -> Option<&SyncSession> {
        self.session.as_ref()
    }

    pub fn in_session(&self) -> bool {
        self.session.is_some()
    }

    pub fn is_local_host(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.is_host(&self.local_user_id))
    }

    /// Effective settings: the active session's, or defaults when solo.
    pub fn settings(&self) -> SessionSettings {
        self.session.as_ref().map(|s| s.settings).unwrap_or_default()
    }

    /// The local participant's permissions within the active session.
    pub fn local_permissions(&self) -> Option<Permissions> {
        self.session
            .as_ref()
            .and_then(|s| s.participant(&self.local_user_id))
            .map(|p| p.permissions)
    }

    // ── Create ──────────────────────────────────────────────────────

    /// Start hosting a new session with the local user as sole member.
    ///
    /// Returns the session and its `session-created` announcement.
    pub fn create_session(
        &mut self,
        settings: SessionSettings,
        now: DateTime<Utc>,
    ) -> Result<(SyncSession, SyncMessage)> {
        if let Some(existing) = &self.session {
            bail!("already in session {}; leave it before creating another", existing.id);
        }
        if matches!(self.join, JoinState::Pending { .. }) {
            bail!("join already in progress");
        }

        let host = SyncParticipant::new(
            self.local_user_id.clone(),
            self.display_name.clone(),
            ParticipantRole::Host,
            now,
        );
        let session = SyncSession::new(host, settings, now);
        info!(session_id = %session.id, "created sync session");

        let announce = SyncMessage::new(
            session.id,
            self.local_user_id.clone(),
            now,
            SyncPayload::StateUpdate(StateUpdateData {
                action: StateUpdateAction::SessionCreated { session: session.clone() },
            }),
        );
        self.session = Some(session.clone());
        Ok((session, announce))
    }

    // ── Join handshake ──────────────────────────────────────────────

    /// Ask to join an existing session. The answer arrives as a
    /// `join-response` handled by [`SessionManager::handle_action`];
    /// [`SessionManager::poll_join`] enforces the deadline.
    pub fn begin_join(&mut self, session_id: Uuid, now: DateTime<Utc>) -> Result<SyncMessage> {
        if let Some(existing) = &self.session {
            bail!("already in session {}; leave it before joining another", existing.id);
        }
        if let JoinState::Pending { session_id: pending, .. } = &self.join {
            bail!("join of session {pending} already in progress");
        }

        let deadline = now
            + chrono::Duration::from_std(self.join_timeout)
                .map_err(|_| anyhow!("join timeout out of range"))?;
        self.join = JoinState::Pending { session_id, deadline };
        debug!(%session_id, %deadline, "join request pending");

        Ok(SyncMessage::new(
            session_id,
            self.local_user_id.clone(),
            now,
            SyncPayload::StateUpdate(StateUpdateData {
                action: StateUpdateAction::JoinRequest { display_name: self.display_name.clone() },
            }),
        ))
    }

    /// Expire an unanswered join request. Emits at most one timeout per
    /// pending join.
    pub fn poll_join(&mut self, now: DateTime<Utc>) -> Option<SessionEvent> {
        if let JoinState::Pending { session_id, deadline } = self.join {
            if now >= deadline {
                warn!(%session_id, "join request timed out");
                self.join = JoinState::Idle;
                return Some(SessionEvent::JoinTimedOut { session_id });
            }
        }
        None
    }

    // ── Leave ───────────────────────────────────────────────────────

    /// Leave the current session. Departure is fire-and-forget: the
    /// notification goes out best-effort and local membership is cleared
    /// regardless. Returns `None` when not in a session.
    pub fn leave(&mut self, now: DateTime<Utc>) -> Option<SyncMessage> {
        self.join = JoinState::Idle;
        let session = self.session.take()?;
        info!(session_id = %session.id, "leaving sync session");
        Some(SyncMessage::new(
            session.id,
            self.local_user_id.clone(),
            now,
            SyncPayload::StateUpdate(StateUpdateData {
                action: StateUpdateAction::ParticipantLeft { user_id: self.local_user_id.clone() },
            }),
        ))
    }

    // ── Host operations ─────────────────────────────────────────────

    /// Change the session settings. Host only; returns the broadcast.
    pub fn update_settings(
        &mut self,
        settings: SessionSettings,
        now: DateTime<Utc>,
    ) -> Result<SyncMessage> {
        let Some(session) = self.session.as_mut() else {
            bail!("not in a session");
        };
        if !session.is_host(&self.local_user_id) {
            bail!("only the host can change session settings");
        }
        session.settings = settings;
        session.last_activity = now;
        Ok(SyncMessage::new(
            session.id,
            self.local_user_id.clone(),
            now,
            SyncPayload::StateUpdate(StateUpdateData {
                action: StateUpdateAction::SettingsUpdated { settings },
            }),
        ))
    }

    // ── Inbound dispatch ────────────────────────────────────────────

    /// Apply a remote `state-update` action to the session model.
    ///
    /// Unknown or out-of-context actions are ignored; membership actions
    /// from non-hosts are discarded.
    pub fn handle_action(
        &mut self,
        msg: &SyncMessage,
        action: &StateUpdateAction,
        now: DateTime<Utc>,
    ) -> SessionOutput {
        match action {
            StateUpdateAction::JoinRequest { display_name } => {
                self.handle_join_request(msg, display_name, now)
            }
            StateUpdateAction::JoinResponse { user_id, accepted, session } => {
                self.handle_join_response(msg, user_id, *accepted, session.as_ref())
            }
            StateUpdateAction::ParticipantJoined { participant } => {
                self.handle_participant_joined(msg, participant)
            }
            StateUpdateAction::ParticipantLeft { user_id } => {
                self.handle_participant_left(msg, user_id)
            }
            StateUpdateAction::SettingsUpdated { settings } => {
                self.handle_settings_updated(msg, *settings)
            }
            // Session creation announcements from peers and acks carry no
            // membership change for us.
            StateUpdateAction::SessionCreated { .. }
            | StateUpdateAction::Ack { .. }
            | StateUpdateAction::StateChanged { .. } => SessionOutput::default(),
        }
    }

    fn handle_join_request(
        &mut self,
        msg: &SyncMessage,
        display_name: &str,
        now: DateTime<Utc>,
    ) -> SessionOutput {
        let local_user = self.local_user_id.clone();
        let Some(session) = self.session.as_mut() else {
            return SessionOutput::default();
        };
        // Only the host answers join requests, and only for its session.
        if !session.is_host(&local_user) || session.id != msg.session_id {
            return SessionOutput::default();
        }

        let mut output = SessionOutput::default();
        if let Some(existing) = session.participants.get_mut(&msg.user_id) {
            // Duplicate request: accept idempotently, no re-broadcast.
            existing.last_seen = now;
        } else {
            let participant = SyncParticipant::new(
                msg.user_id.clone(),
                display_name.to_string(),
                ParticipantRole::Participant,
                now,
            );
            session.participants.insert(participant.id.clone(), participant.clone());
            info!(session_id = %session.id, user_id = %participant.id, "participant joined");
            output.events.push(SessionEvent::ParticipantJoined(participant.clone()));
            output.outbound.push(SyncMessage::new(
                session.id,
                local_user.clone(),
                now,
                SyncPayload::StateUpdate(StateUpdateData {
                    action: StateUpdateAction::ParticipantJoined { participant },
                }),
            ));
        }
        session.last_activity = now;

        output.outbound.insert(
            0,
            SyncMessage::new(
                session.id,
                local_user,
                now,
                SyncPayload::StateUpdate(StateUpdateData {
                    action: StateUpdateAction::JoinResponse {
                        user_id: msg.user_id.clone(),
                        accepted: true,
                        session: Some(session.clone()),
                    },
                }),
            ),
        );
        output
    }

    fn handle_join_response(
        &mut self,
        msg: &SyncMessage,
        addressee: &str,
        accepted: bool,
        session: Option<&SyncSession>,
    ) -> SessionOutput {
        let JoinState::Pending { session_id, .. } = self.join else {
            return SessionOutput::default();
        };
        // Responses are broadcast; one aimed at another concurrent joiner
        // must not settle our pending request.
        if msg.session_id != session_id || addressee != self.local_user_id {
            return SessionOutput::default();
        }
        self.join = JoinState::Idle;

        match (accepted, session) {
            (true, Some(session)) => {
                // The authoritative roster arrives with the acceptance.
                info!(session_id = %session.id, "join accepted");
                self.session = Some(session.clone());
                SessionOutput::event(SessionEvent::Joined(session.clone()))
            }
            _ => {
                warn!(%session_id, "join rejected");
                SessionOutput::event(SessionEvent::JoinRejected { session_id })
            }
        }
    }

    fn handle_participant_joined(
        &mut self,
        msg: &SyncMessage,
        participant: &SyncParticipant,
    ) -> SessionOutput {
        let Some(session) = self.session.as_mut() else {
            return SessionOutput::default();
        };
        if session.id != msg.session_id || participant.id == self.local_user_id {
            return SessionOutput::default();
        }
        // Membership broadcasts are host-authoritative.
        if msg.user_id != session.host_id {
            return SessionOutput::default();
        }
        session.participants.insert(participant.id.clone(), participant.clone());
        SessionOutput::event(SessionEvent::ParticipantJoined(participant.clone()))
    }

    fn handle_participant_left(&mut self, msg: &SyncMessage, user_id: &str) -> SessionOutput {
        let Some(session) = self.session.as_mut() else {
            return SessionOutput::default();
        };
        if session.id != msg.session_id || msg.user_id != user_id {
            return SessionOutput::default();
        }

        if session.is_host(user_id) {
            // No host migration: the session ends when the host leaves.
            let session_id = session.id;
            info!(%session_id, "host left; session ended");
            self.session = None;
            return SessionOutput::event(SessionEvent::SessionEnded { session_id });
        }

        if session.participants.remove(user_id).is_some() {
            SessionOutput::event(SessionEvent::ParticipantLeft { user_id: user_id.to_string() })
        } else {
            SessionOutput::default()
        }
    }

    fn handle_settings_updated(
        &mut self,
        msg: &SyncMessage,
        settings: SessionSettings,
    ) -> SessionOutput {
        let Some(session) = self.session.as_mut() else {
            return SessionOutput::default();
        };
        // Settings are host-controlled; anyone else's update is discarded.
        if session.id != msg.session_id || msg.user_id != session.host_id {
            return SessionOutput::default();
        }
        session.settings = settings;
        session.last_activity = msg.timestamp;
        SessionOutput::event(SessionEvent::SettingsUpdated(settings))
    }
}
