// The engine facade: one explicitly constructed `CollabRuntime` owns the
// store, snapshots, session model, transport connection, conflict resolver,
// and observer registry.
//
// Local mutations flow store-first, then onto the wire according to the
// active session's sync settings. Inbound messages are arbitrated by the
// conflict resolver before they touch the store. Without a transport URL
// the runtime is a purely local state manager.
//
// Transport failures surface as `error`/`disconnected` events and never
// propagate as panics or fatal errors.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use slicesync_common::protocol::{
    AnnotationData, CursorPositionData, MeasurementData, StateUpdateAction, StateUpdateData,
    SyncMessage, SyncPayload, ViewportSyncData,
};
use slicesync_common::types::{
    Annotation, CursorPoint, ItemOp, Measurement, SessionSettings, SyncSession, ViewportState,
};

use crate::config::EngineConfig;
use crate::conflict::{Arbitration, ConflictResolver};
use crate::events::{EngineEvent, EventKind, EventRegistry, SubscriptionId};
use crate::session::{SessionEvent, SessionManager, SessionOutput};
use crate::store::persist::{ExportedState, StatePersistence, STORAGE_KEY};
use crate::store::snapshot::{Snapshot, SnapshotId, SnapshotManager};
use crate::store::{StateChangeEvent, StateStore};
use crate::transport::{ConnectionManager, ConnectionState, SyncTransport, TransportEvent};

pub struct CollabRuntime<T: SyncTransport> {
    user_id: String,
    store: StateStore,
    snapshots: SnapshotManager,
    events: EventRegistry,
    session: SessionManager,
    connection: ConnectionManager<T>,
    conflicts: ConflictResolver,
    persistence: Box<dyn StatePersistence>,
}

impl<T: SyncTransport> CollabRuntime<T> {
    pub fn new(
        user_id: impl Into<String>,
        display_name: impl Into<String>,
        transport: T,
        persistence: Box<dyn StatePersistence>,
        config: &EngineConfig,
    ) -> Self {
        let user_id = user_id.into();
        Self {
            store: StateStore::new(),
            snapshots: SnapshotManager::with_cap(config.snapshot_cap),
            events: EventRegistry::new(),
            session: SessionManager::new(
                user_id.clone(),
                display_name,
                config.join_timeout(),
            ),
            connection: ConnectionManager::new(
                user_id.clone(),
                transport,
                config.reconnect.clone(),
                config.max_queued_messages,
            ),
            conflicts: ConflictResolver::new(config.conflict_window()),
            persistence,
            user_id,
        }
    }

    /// Bring the runtime up. With no URL it stays disconnected and acts as
    /// a purely local state manager; with one it validates and connects.
    pub fn initialize(&mut self, transport_url: Option<&str>, now: DateTime<Utc>) -> Result<()> {
        self.set_local_state("application.started_at", serde_json::to_value(now)?, "runtime", now);
        if let Some(url) = transport_url {
            let event = self.connection.connect(url)?;
            self.emit_transport_event(event, now);
        } else {
            info!("no transport url; running as local state manager");
        }
        Ok(())
    }

    // ── Accessors ───────────────────────────────────────────────────

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn current_session(&self) -> Option<&SyncSession> {
        self.session.session()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn snapshots(&self) -> &SnapshotManager {
        &self.snapshots
    }

    // ── Observers ───────────────────────────────────────────────────

    pub fn subscribe(
        &mut self,
        kind: EventKind,
        callback: impl Fn(&EngineEvent) + 'static,
    ) -> SubscriptionId {
        self.events.subscribe(kind, callback)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    // ── Local mutations ─────────────────────────────────────────────

    /// Deep-set under the global state root; forwarded to the session as
    /// a generic state change.
    pub fn update_state(
        &mut self,
        path: &str,
        value: Value,
        source: &str,
        now: DateTime<Utc>,
    ) -> Option<StateChangeEvent> {
        let event = self.store.update_state(path, value, source, now)?;
        self.events.emit(&EngineEvent::StateChange(event.clone()));

        if let Some(session_id) = self.session.session().map(|s| s.id) {
            let key = format!("state:{path}");
            self.conflicts.record_local(&key, &self.user_id, now, event.new_value.clone(), now);
            let msg = SyncMessage::new(
                session_id,
                self.user_id.clone(),
                now,
                SyncPayload::StateUpdate(StateUpdateData {
                    action: StateUpdateAction::StateChanged {
                        path: path.to_string(),
                        value: event.new_value.clone(),
                        source: source.to_string(),
                    },
                }),
            );
            self.dispatch(msg);
        }
        Some(event)
    }

    /// Deep-set under one viewer mode. Viewport paths go out as
    /// `viewport-sync` (full viewport), everything else as a generic state
    /// change, both gated by the session settings.
    pub fn update_viewer_state(
        &mut self,
        mode: &str,
        path: &str,
        value: Value,
        source: &str,
        now: DateTime<Utc>,
    ) -> Option<StateChangeEvent> {
        let event = self.store.update_viewer_state(mode, path, value, source, now)?;
        self.events.emit(&EngineEvent::StateChange(event.clone()));

        let Some((session_id, settings)) =
            self.session.session().map(|s| (s.id, s.settings))
        else {
            return Some(event);
        };

        if path == "viewport" || path.starts_with("viewport.") {
            if settings.sync_viewport {
                if let Some(viewport) = self.store.viewer_state(mode).map(|v| v.viewport.clone()) {
                    self.send_viewport(session_id, mode, viewport, now);
                }
            }
        } else {
            let full_path = format!("viewer_states.{mode}.{path}");
            let key = format!("state:{full_path}");
            self.conflicts.record_local(&key, &self.user_id, now, event.new_value.clone(), now);
            let msg = SyncMessage::new(
                session_id,
                self.user_id.clone(),
                now,
                SyncPayload::StateUpdate(StateUpdateData {
                    action: StateUpdateAction::StateChanged {
                        path: full_path,
                        value: event.new_value.clone(),
                        source: source.to_string(),
                    },
                }),
            );
            self.dispatch(msg);
        }
        Some(event)
    }

    /// Activate a viewer mode, optionally preserving its prior state.
    pub fn switch_mode(
        &mut self,
        mode: &str,
        preserve_state: bool,
        source: &str,
        now: DateTime<Utc>,
    ) -> StateChangeEvent {
        let event = self.store.switch_mode(mode, preserve_state, source, now);
        self.events.emit(&EngineEvent::StateChange(event.clone()));
        event
    }

    /// Share the local pointer position. Transient: never stored.
    pub fn sync_cursor(
        &mut self,
        mode: &str,
        image_id: Option<String>,
        position: CursorPoint,
        now: DateTime<Utc>,
    ) {
        let Some((session_id, settings)) =
            self.session.session().map(|s| (s.id, s.settings))
        else {
            return;
        };
        if !settings.sync_cursor {
            return;
        }
        let msg = SyncMessage::new(
            session_id,
            self.user_id.clone(),
            now,
            SyncPayload::CursorPosition(CursorPositionData {
                mode: mode.to_string(),
                image_id,
                position,
            }),
        );
        self.dispatch(msg);
    }

    /// Add, replace, or remove an annotation in one viewer mode.
    pub fn apply_annotation(
        &mut self,
        mode: &str,
        op: ItemOp,
        annotation: Annotation,
        source: &str,
        now: DateTime<Utc>,
    ) -> Option<StateChangeEvent> {
        let mut list =
            self.store.viewer_state(mode).map(|v| v.annotations.clone()).unwrap_or_default();
        upsert_item(&mut list, op, annotation.clone(), |a| &a.id);
        let value = serde_json::to_value(&list).ok()?;
        let event = self.store.update_viewer_state(mode, "annotations", value, source, now)?;
        self.events.emit(&EngineEvent::StateChange(event.clone()));

        let Some((session_id, settings)) =
            self.session.session().map(|s| (s.id, s.settings))
        else {
            return Some(event);
        };
        if settings.sync_annotations {
            let key = format!("annotation:{mode}:{}", annotation.id);
            let payload = serde_json::to_value(&annotation).unwrap_or(Value::Null);
            self.conflicts.record_local(&key, &self.user_id, now, payload, now);
            let msg = SyncMessage::new(
                session_id,
                self.user_id.clone(),
                now,
                SyncPayload::Annotation(AnnotationData {
                    mode: mode.to_string(),
                    op,
                    annotation,
                }),
            );
            self.dispatch(msg);
        }
        Some(event)
    }

    /// Add, replace, or remove a measurement in one viewer mode.
    pub fn apply_measurement(
        &mut self,
        mode: &str,
        op: ItemOp,
        measurement: Measurement,
        source: &str,
        now: DateTime<Utc>,
    ) -> Option<StateChangeEvent> {
        let mut list =
            self.store.viewer_state(mode).map(|v| v.measurements.clone()).unwrap_or_default();
        upsert_item(&mut list, op, measurement.clone(), |m| &m.id);
        let value = serde_json::to_value(&list).ok()?;
        let event = self.store.update_viewer_state(mode, "measurements", value, source, now)?;
        self.events.emit(&EngineEvent::StateChange(event.clone()));

        let Some((session_id, settings)) =
            self.session.session().map(|s| (s.id, s.settings))
        else {
            return Some(event);
        };
        if settings.sync_measurements {
            let key = format!("measurement:{mode}:{}", measurement.id);
            let payload = serde_json::to_value(&measurement).unwrap_or(Value::Null);
            self.conflicts.record_local(&key, &self.user_id, now, payload, now);
            let msg = SyncMessage::new(
                session_id,
                self.user_id.clone(),
                now,
                SyncPayload::Measurement(MeasurementData {
                    mode: mode.to_string(),
                    op,
                    measurement,
                }),
            );
            self.dispatch(msg);
        }
        Some(event)
    }

    // ── Snapshots ───────────────────────────────────────────────────

    pub fn create_snapshot(
        &mut self,
        description: impl Into<String>,
        tags: Vec<String>,
        now: DateTime<Utc>,
    ) -> Snapshot {
        let snapshot = self.snapshots.create(self.store.state(), description, tags, now);
        self.events.emit(&EngineEvent::SnapshotCreated(snapshot.clone()));
        snapshot
    }

    /// Replace the live state with a snapshot. A miss fails without side
    /// effects.
    pub fn restore_snapshot(&mut self, id: SnapshotId) -> Result<()> {
        let Some(snapshot) = self.snapshots.get(id).cloned() else {
            bail!("snapshot {id:?} not found");
        };
        self.store.replace(snapshot.state.clone());
        self.events.emit(&EngineEvent::StateRestored(snapshot));
        Ok(())
    }

    pub fn clear_snapshots(&mut self) {
        self.snapshots.clear();
    }

    // ── Export / import / persistence ───────────────────────────────

    /// The store's exported form: `{ state, snapshots, version,
    /// exported_at }`.
    pub fn export_state(&self, now: DateTime<Utc>) -> Result<Value> {
        ExportedState::new(self.store.state().clone(), self.snapshots.export(), now).to_value()
    }

    /// Replace the live state and snapshot history from an exported
    /// payload. Malformed payloads are rejected without mutation.
    pub fn import_state(&mut self, payload: &Value) -> Result<()> {
        let exported =
            ExportedState::from_value(payload).context("import payload is malformed")?;
        self.store.replace(exported.state);
        self.snapshots.replace(exported.snapshots);
        Ok(())
    }

    /// Full reset to defaults; the only operation that drops viewer states.
    pub fn reset_state(&mut self) {
        self.store.reset();
    }

    /// Save the exported form through the injected adapter.
    pub fn persist_state(&mut self, now: DateTime<Utc>) -> Result<()> {
        let payload = self.export_state(now)?;
        self.persistence.save(STORAGE_KEY, &payload)
    }

    /// Load previously persisted state. Returns `false` when nothing is
    /// stored; a malformed payload is an error and leaves live state
    /// untouched.
    pub fn load_persisted_state(&mut self) -> Result<bool> {
        let Some(payload) = self.persistence.load(STORAGE_KEY)? else {
            return Ok(false);
        };
        let exported = ExportedState::from_value(&payload)
            .context("persisted state payload is malformed")?;
        self.store.replace(exported.state);
        self.snapshots.replace(exported.snapshots);
        Ok(true)
    }

    // ── Session lifecycle ───────────────────────────────────────────

    /// Start hosting. The local user becomes host and sole participant.
    pub fn create_session(
        &mut self,
        settings: SessionSettings,
        now: DateTime<Utc>,
    ) -> Result<SyncSession> {
        let (session, announce) = self.session.create_session(settings, now)?;
        self.dispatch(announce);
        self.mark_collaboration(Some(&session), now);
        self.events.emit(&EngineEvent::SessionCreated(session.clone()));
        Ok(session)
    }

    /// Ask to join an existing session; completion (or rejection/timeout)
    /// arrives through events.
    pub fn join_session(&mut self, session_id: Uuid, now: DateTime<Utc>) -> Result<()> {
        let request = self.session.begin_join(session_id, now)?;
        self.dispatch(request);
        Ok(())
    }

    /// Leave the active session. Fire-and-forget; local membership clears
    /// regardless of delivery.
    pub fn leave_session(&mut self, now: DateTime<Utc>) {
        let session_id = self.session.session().map(|s| s.id);
        if let Some(departure) = self.session.leave(now) {
            self.dispatch(departure);
        }
        if let Some(session_id) = session_id {
            self.conflicts.clear();
            self.mark_collaboration(None, now);
            self.events.emit(&EngineEvent::SessionLeft { session_id });
        }
    }

    /// Change the session settings (host only) and broadcast them.
    pub fn update_session_settings(
        &mut self,
        settings: SessionSettings,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let broadcast = self.session.update_settings(settings, now)?;
        self.dispatch(broadcast);
        Ok(())
    }

    // ── Timers & transport pump ─────────────────────────────────────

    /// Drive time-based behavior: the join handshake deadline.
    pub fn tick(&mut self, now: DateTime<Utc>) {
        if let Some(event) = self.session.poll_join(now) {
            self.emit_session_event(event, now);
        }
    }

    /// Backoff delay the caller should wait before [`Self::reconnect`].
    pub fn reconnect_delay(&self) -> std::time::Duration {
        self.connection.reconnect_delay()
    }

    /// Attempt one reconnect after an unexpected disconnect.
    pub fn reconnect(&mut self, now: DateTime<Utc>) {
        match self.connection.try_reconnect() {
            Ok(Some(event)) => self.emit_transport_event(event, now),
            Ok(None) => {}
            Err(error) => {
                self.events.emit(&EngineEvent::Error { message: error.to_string() });
            }
        }
    }

    /// Block for the next inbound frame and process it. Returns `false`
    /// when not connected.
    pub fn process_incoming(&mut self, now: DateTime<Utc>) -> Result<bool> {
        if self.connection.state() != ConnectionState::Connected {
            return Ok(false);
        }
        match self.connection.recv_event(now) {
            Ok(Some(event)) => {
                self.emit_transport_event(event, now);
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(error) => {
                // Transport errors become error events, never panics.
                self.events.emit(&EngineEvent::Error { message: error.to_string() });
                Ok(false)
            }
        }
    }

    /// Tear everything down: socket, queues, session, subscriptions.
    /// Idempotent.
    pub fn cleanup(&mut self, now: DateTime<Utc>) {
        if let Some(departure) = self.session.leave(now) {
            let _ = self.connection.send(departure);
        }
        self.connection.shutdown();
        self.conflicts.clear();
        self.events.clear();
    }

    // ── Inbound dispatch ────────────────────────────────────────────

    fn emit_transport_event(&mut self, event: TransportEvent, now: DateTime<Utc>) {
        match event {
            TransportEvent::Connected => self.events.emit(&EngineEvent::Connected),
            TransportEvent::Disconnected { reason } => {
                self.events.emit(&EngineEvent::Disconnected { reason });
            }
            TransportEvent::ReconnectFailed { attempts } => {
                self.events.emit(&EngineEvent::ReconnectFailed { attempts });
            }
            TransportEvent::Inbound(msg) => self.handle_inbound(msg, now),
        }
    }

    fn handle_inbound(&mut self, msg: SyncMessage, now: DateTime<Utc>) {
        match &msg.payload {
            SyncPayload::StateUpdate(StateUpdateData { action }) => match action {
                StateUpdateAction::StateChanged { path, value, source } => {
                    self.handle_remote_state_change(
                        &msg,
                        path.clone(),
                        value.clone(),
                        source.clone(),
                        now,
                    );
                }
                StateUpdateAction::Ack { message_id } => {
                    debug!(%message_id, from = %msg.user_id, "ack received");
                }
                action => {
                    let action = action.clone();
                    let output = self.session.handle_action(&msg, &action, now);
                    self.apply_session_output(output, now);
                }
            },
            SyncPayload::ViewportSync(data) => {
                self.handle_remote_viewport(&msg, data.clone(), now);
            }
            SyncPayload::CursorPosition(data) => {
                if self.in_session_with(&msg) && self.session.settings().sync_cursor {
                    self.events.emit(&EngineEvent::CursorSync {
                        user_id: msg.user_id.clone(),
                        data: data.clone(),
                    });
                }
            }
            SyncPayload::Annotation(data) => {
                self.handle_remote_annotation(&msg, data.clone(), now);
            }
            SyncPayload::Measurement(data) => {
                self.handle_remote_measurement(&msg, data.clone(), now);
            }
        }
    }

    fn in_session_with(&self, msg: &SyncMessage) -> bool {
        self.session.session().is_some_and(|s| s.id == msg.session_id)
    }

    fn handle_remote_state_change(
        &mut self,
        msg: &SyncMessage,
        path: String,
        value: Value,
        source: String,
        now: DateTime<Utc>,
    ) {
        if !self.in_session_with(msg) {
            return;
        }
        let Some((strategy, host_id)) = self
            .session
            .session()
            .map(|s| (s.settings.conflict_resolution, s.host_id.clone()))
        else {
            return;
        };
        let key = format!("state:{path}");
        let outcome = self.conflicts.arbitrate(
            &key,
            &msg.user_id,
            msg.timestamp,
            value,
            strategy,
            &host_id,
            now,
        );
        let winning = match outcome {
            Arbitration::Apply(value) => value,
            Arbitration::Resolved(record) => match record.resolution {
                Some(resolution) => resolution.final_value,
                None => return,
            },
            Arbitration::Pending(_) => return,
        };
        if let Some(event) = self.store.update_state(&path, winning, &source, now) {
            self.events.emit(&EngineEvent::StateChange(event));
        }
    }

    fn handle_remote_viewport(
        &mut self,
        msg: &SyncMessage,
        data: ViewportSyncData,
        now: DateTime<Utc>,
    ) {
        if !self.in_session_with(msg) || !self.session.settings().sync_viewport {
            return;
        }
        let Some((strategy, host_id)) = self
            .session
            .session()
            .map(|s| (s.settings.conflict_resolution, s.host_id.clone()))
        else {
            return;
        };
        let key = format!("viewport:{}", data.mode);
        let payload = match serde_json::to_value(&data.viewport) {
            Ok(payload) => payload,
            Err(error) => {
                warn!(?error, "unserializable viewport payload dropped");
                return;
            }
        };
        let outcome = self.conflicts.arbitrate(
            &key,
            &msg.user_id,
            msg.timestamp,
            payload,
            strategy,
            &host_id,
            now,
        );
        let winning = match outcome {
            Arbitration::Apply(value) => value,
            Arbitration::Resolved(record) => match record.resolution {
                Some(resolution) => {
                    debug!(conflict_id = %record.conflict_id, key, "viewport conflict resolved");
                    resolution.final_value
                }
                None => return,
            },
            Arbitration::Pending(_) => return,
        };
        let Ok(viewport) = serde_json::from_value::<ViewportState>(winning.clone()) else {
            warn!(key, "resolved viewport does not fit schema; dropped");
            return;
        };
        if let Some(event) =
            self.store.update_viewer_state(&data.mode, "viewport", winning, &msg.user_id, now)
        {
            self.events.emit(&EngineEvent::StateChange(event));
        }
        self.events.emit(&EngineEvent::ViewportSync {
            user_id: msg.user_id.clone(),
            data: ViewportSyncData { mode: data.mode, viewport },
        });
    }

    fn handle_remote_annotation(
        &mut self,
        msg: &SyncMessage,
        data: AnnotationData,
        now: DateTime<Utc>,
    ) {
        if !self.in_session_with(msg) || !self.session.settings().sync_annotations {
            return;
        }
        let annotation = match self.arbitrate_item(
            msg,
            &format!("annotation:{}:{}", data.mode, data.annotation.id),
            data.op,
            &data.annotation,
            now,
        ) {
            Some(annotation) => annotation,
            None => return,
        };

        let mut list = self
            .store
            .viewer_state(&data.mode)
            .map(|v| v.annotations.clone())
            .unwrap_or_default();
        upsert_item(&mut list, data.op, annotation, |a| &a.id);
        let Ok(value) = serde_json::to_value(&list) else { return };
        if let Some(event) =
            self.store.update_viewer_state(&data.mode, "annotations", value, &msg.user_id, now)
        {
            self.events.emit(&EngineEvent::StateChange(event));
        }
        self.events.emit(&EngineEvent::AnnotationSync {
            user_id: msg.user_id.clone(),
            data,
        });
    }

    fn handle_remote_measurement(
        &mut self,
        msg: &SyncMessage,
        data: MeasurementData,
        now: DateTime<Utc>,
    ) {
        if !self.in_session_with(msg) || !self.session.settings().sync_measurements {
            return;
        }
        let measurement = match self.arbitrate_item(
            msg,
            &format!("measurement:{}:{}", data.mode, data.measurement.id),
            data.op,
            &data.measurement,
            now,
        ) {
            Some(measurement) => measurement,
            None => return,
        };

        let mut list = self
            .store
            .viewer_state(&data.mode)
            .map(|v| v.measurements.clone())
            .unwrap_or_default();
        upsert_item(&mut list, data.op, measurement, |m| &m.id);
        let Ok(value) = serde_json::to_value(&list) else { return };
        if let Some(event) =
            self.store.update_viewer_state(&data.mode, "measurements", value, &msg.user_id, now)
        {
            self.events.emit(&EngineEvent::StateChange(event));
        }
        self.events.emit(&EngineEvent::MeasurementSync {
            user_id: msg.user_id.clone(),
            data,
        });
    }

    // Arbitrate one synced list item. Removals bypass arbitration; for
    // add/update the winning serialized item is deserialized back, or the
    // change is dropped if the winner does not fit the item schema.
    fn arbitrate_item<I>(
        &mut self,
        msg: &SyncMessage,
        key: &str,
        op: ItemOp,
        item: &I,
        now: DateTime<Utc>,
    ) -> Option<I>
    where
        I: serde::Serialize + serde::de::DeserializeOwned + Clone,
    {
        if op == ItemOp::Remove {
            return Some(item.clone());
        }
        let (strategy, host_id) = {
            let session = self.session.session()?;
            (session.settings.conflict_resolution, session.host_id.clone())
        };
        let payload = serde_json::to_value(item).ok()?;
        let outcome =
            self.conflicts.arbitrate(key, &msg.user_id, msg.timestamp, payload, strategy, &host_id, now);
        let winning = match outcome {
            Arbitration::Apply(value) => value,
            Arbitration::Resolved(record) => match record.resolution {
                Some(resolution) => {
                    debug!(conflict_id = %record.conflict_id, key, "item conflict resolved");
                    resolution.final_value
                }
                None => return None,
            },
            Arbitration::Pending(_) => return None,
        };
        match serde_json::from_value(winning) {
            Ok(item) => Some(item),
            Err(error) => {
                warn!(key, ?error, "resolved item does not fit schema; dropped");
                None
            }
        }
    }

    fn apply_session_output(&mut self, output: SessionOutput, now: DateTime<Utc>) {
        for msg in output.outbound {
            self.dispatch(msg);
        }
        for event in output.events {
            self.emit_session_event(event, now);
        }
    }

    fn emit_session_event(&mut self, event: SessionEvent, now: DateTime<Utc>) {
        match event {
            SessionEvent::Joined(session) => {
                self.mark_collaboration(Some(&session), now);
                self.events.emit(&EngineEvent::SessionJoined(session));
            }
            SessionEvent::JoinRejected { session_id } => {
                self.events.emit(&EngineEvent::Error {
                    message: format!("join of session {session_id} was rejected"),
                });
            }
            SessionEvent::JoinTimedOut { session_id } => {
                self.events.emit(&EngineEvent::Error {
                    message: format!("join of session {session_id} timed out"),
                });
            }
            SessionEvent::ParticipantJoined(participant) => {
                self.refresh_participant_count(now);
                self.events.emit(&EngineEvent::ParticipantJoined(participant));
            }
            SessionEvent::ParticipantLeft { user_id } => {
                self.refresh_participant_count(now);
                self.events.emit(&EngineEvent::ParticipantLeft { user_id });
            }
            SessionEvent::SessionEnded { session_id } => {
                self.conflicts.clear();
                self.mark_collaboration(None, now);
                self.events.emit(&EngineEvent::SessionLeft { session_id });
            }
            SessionEvent::SettingsUpdated(settings) => {
                debug!(?settings, "session settings updated");
            }
        }
    }

    // ── Internals ───────────────────────────────────────────────────

    // Store update + event emission without wire forwarding, for the
    // engine's own bookkeeping paths.
    fn set_local_state(&mut self, path: &str, value: Value, source: &str, now: DateTime<Utc>) {
        if let Some(event) = self.store.update_state(path, value, source, now) {
            self.events.emit(&EngineEvent::StateChange(event));
        }
    }

    fn mark_collaboration(&mut self, session: Option<&SyncSession>, now: DateTime<Utc>) {
        let (active, session_id, count) = match session {
            Some(s) => (true, serde_json::to_value(s.id).unwrap_or(Value::Null), s.participants.len()),
            None => (false, Value::Null, 0),
        };
        self.set_local_state("collaboration.active", Value::Bool(active), "session", now);
        self.set_local_state("collaboration.session_id", session_id, "session", now);
        self.set_local_state(
            "collaboration.participant_count",
            Value::from(count),
            "session",
            now,
        );
    }

    fn refresh_participant_count(&mut self, now: DateTime<Utc>) {
        let count = self.session.session().map(|s| s.participants.len()).unwrap_or(0);
        self.set_local_state(
            "collaboration.participant_count",
            Value::from(count),
            "session",
            now,
        );
    }

    fn send_viewport(
        &mut self,
        session_id: Uuid,
        mode: &str,
        viewport: ViewportState,
        now: DateTime<Utc>,
    ) {
        let key = format!("viewport:{mode}");
        let payload = serde_json::to_value(&viewport).unwrap_or(Value::Null);
        self.conflicts.record_local(&key, &self.user_id, now, payload, now);
        let msg = SyncMessage::new(
            session_id,
            self.user_id.clone(),
            now,
            SyncPayload::ViewportSync(ViewportSyncData { mode: mode.to_string(), viewport }),
        );
        self.dispatch(msg);
    }

    // Best-effort send: failures surface as error events.
    fn dispatch(&mut self, msg: SyncMessage) {
        if let Err(error) = self.connection.send(msg) {
            warn!(?error, "failed to dispatch sync message");
            self.events.emit(&EngineEvent::Error { message: error.to_string() });
        }
    }
}

// Apply an add/update/remove to an id-keyed list.
fn upsert_item<I>(list: &mut Vec<I>, op: ItemOp, item: I, id: impl Fn(&I) -> &String) {
    match op {
        ItemOp::Add | ItemOp::Update => {
            let item_id = id(&item).clone();
            match list.iter().position(|i| id(i) == &item_id) {
                Some(pos) => list[pos] = item,
                None => list.push(item),
            }
        }
        ItemOp::Remove => {
            let item_id = id(&item).clone();
            list.retain(|i| id(i) != &item_id);
        }
    }
}
