// Explicit observer registry for engine notifications.
//
// Subscribers register a callback per event kind and get back a handle for
// deterministic unregistration. There is no global event bus: each runtime
// owns exactly one registry.

use uuid::Uuid;

use slicesync_common::protocol::{
    AnnotationData, CursorPositionData, MeasurementData, ViewportSyncData,
};
use slicesync_common::types::{SyncParticipant, SyncSession};

use crate::store::snapshot::Snapshot;
use crate::store::StateChangeEvent;

/// Everything the engine reports to its observers.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    StateChange(StateChangeEvent),
    SnapshotCreated(Snapshot),
    StateRestored(Snapshot),
    SessionCreated(SyncSession),
    SessionJoined(SyncSession),
    SessionLeft { session_id: Uuid },
    ParticipantJoined(SyncParticipant),
    ParticipantLeft { user_id: String },
    ViewportSync { user_id: String, data: ViewportSyncData },
    CursorSync { user_id: String, data: CursorPositionData },
    AnnotationSync { user_id: String, data: AnnotationData },
    MeasurementSync { user_id: String, data: MeasurementData },
    Connected,
    Disconnected { reason: String },
    ReconnectFailed { attempts: u32 },
    Error { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    StateChange,
    SnapshotCreated,
    StateRestored,
    SessionCreated,
    SessionJoined,
    SessionLeft,
    ParticipantJoined,
    ParticipantLeft,
    ViewportSync,
    CursorSync,
    AnnotationSync,
    MeasurementSync,
    Connected,
    Disconnected,
    ReconnectFailed,
    Error,
}

impl EngineEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::StateChange(_) => EventKind::StateChange,
            Self::SnapshotCreated(_) => EventKind::SnapshotCreated,
            Self::StateRestored(_) => EventKind::StateRestored,
            Self::SessionCreated(_) => EventKind::SessionCreated,
            Self::SessionJoined(_) => EventKind::SessionJoined,
            Self::SessionLeft { .. } => EventKind::SessionLeft,
            Self::ParticipantJoined(_) => EventKind::ParticipantJoined,
            Self::ParticipantLeft { .. } => EventKind::ParticipantLeft,
            Self::ViewportSync { .. } => EventKind::ViewportSync,
            Self::CursorSync { .. } => EventKind::CursorSync,
            Self::AnnotationSync { .. } => EventKind::AnnotationSync,
            Self::MeasurementSync { .. } => EventKind::MeasurementSync,
            Self::Connected => EventKind::Connected,
            Self::Disconnected { .. } => EventKind::Disconnected,
            Self::ReconnectFailed { .. } => EventKind::ReconnectFailed,
            Self::Error { .. } => EventKind::Error,
        }
    }
}

/// Handle returned by [`EventRegistry::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Callback = Box<dyn Fn(&EngineEvent)>;

/// Callback registry keyed by event kind.
#[derive(Default)]
pub struct EventRegistry {
    next_id: u64,
    subscribers: Vec<(SubscriptionId, EventKind, Callback)>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(
        &mut self,
        kind: EventKind,
        callback: impl Fn(&EngineEvent) + 'static,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.subscribers.push((id, kind, Box::new(callback)));
        id
    }

    /// Remove a subscription. Returns whether it was present.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(sub_id, _, _)| *sub_id != id);
        self.subscribers.len() != before
    }

    /// Invoke every subscriber registered for the event's kind, in
    /// registration order.
    pub fn emit(&self, event: &EngineEvent) {
        let kind = event.kind();
        for (_, sub_kind, callback) in &self.subscribers {
            if *sub_kind == kind {
                callback(event);
            }
        }
    }

    /// Drop every subscription (engine cleanup).
    pub fn clear(&mut self) {
        self.subscribers.clear();
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }
}

impl std::fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRegistry")
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn error_event(message: &str) -> EngineEvent {
        EngineEvent::Error { message: message.into() }
    }

    #[test]
    fn subscriber_receives_matching_events_only() {
        let mut registry = EventRegistry::new();
        let seen = Rc::new(RefCell::new(Vec::new()));

        let sink = Rc::clone(&seen);
        registry.subscribe(EventKind::Error, move |event| {
            if let EngineEvent::Error { message } = event {
                sink.borrow_mut().push(message.clone());
            }
        });

        registry.emit(&error_event("boom"));
        registry.emit(&EngineEvent::Connected);

        assert_eq!(*seen.borrow(), vec!["boom"]);
    }

    #[test]
    fn unsubscribe_is_deterministic() {
        let mut registry = EventRegistry::new();
        let count = Rc::new(RefCell::new(0));

        let sink = Rc::clone(&count);
        let id = registry.subscribe(EventKind::Connected, move |_| {
            *sink.borrow_mut() += 1;
        });

        registry.emit(&EngineEvent::Connected);
        assert!(registry.unsubscribe(id));
        registry.emit(&EngineEvent::Connected);

        assert_eq!(*count.borrow(), 1);
        assert!(!registry.unsubscribe(id), "second unsubscribe reports absence");
    }

    #[test]
    fn multiple_subscribers_fire_in_registration_order() {
        let mut registry = EventRegistry::new();
        let order = Rc::new(RefCell::new(Vec::new()));

        for label in ["first", "second"] {
            let sink = Rc::clone(&order);
            registry.subscribe(EventKind::Connected, move |_| {
                sink.borrow_mut().push(label);
            });
        }

        registry.emit(&EngineEvent::Connected);
        assert_eq!(*order.borrow(), vec!["first", "second"]);
    }

    #[test]
    fn clear_drops_all_subscriptions() {
        let mut registry = EventRegistry::new();
        registry.subscribe(EventKind::Connected, |_| {});
        registry.subscribe(EventKind::Error, |_| {});
        assert_eq!(registry.len(), 2);
        registry.clear();
        assert_eq!(registry.len(), 0);
    }
}
