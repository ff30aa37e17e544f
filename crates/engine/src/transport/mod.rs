// Socket connection manager: connect, reconnect with exponential backoff,
// offline queuing, and inbound dispatch.
//
// The actual socket is abstracted behind `SyncTransport` so the manager is
// testable without network I/O; a production implementation wraps a
// WebSocket client. Frames are JSON text; malformed inbound frames are
// logged and dropped, never fatal.

use std::collections::VecDeque;
use std::net::IpAddr;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use url::Url;

use slicesync_common::protocol::{StateUpdateAction, StateUpdateData, SyncMessage, SyncPayload};

use crate::config::ReconnectConfig;

// ── Transport trait ─────────────────────────────────────────────────

/// Abstraction over the bidirectional socket.
///
/// `recv` blocks for the next text frame and returns `None` on clean
/// close. No two managers may share one transport.
pub trait SyncTransport {
    fn connect(&mut self, url: &str) -> Result<()>;
    fn send(&mut self, frame: &str) -> Result<()>;
    fn recv(&mut self) -> Result<Option<String>>;
    fn close(&mut self);
}

// ── Connection state ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events surfaced to the runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Socket is up; any queued messages have been flushed.
    Connected,
    /// A remote participant's message (self-echo already filtered).
    Inbound(SyncMessage),
    /// Connection lost or connect attempt failed.
    Disconnected { reason: String },
    /// Retry budget exhausted; no further attempts until `connect`.
    ReconnectFailed { attempts: u32 },
}

/// Whether `send` hit the wire or the offline queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    Queued,
}

// ── Connection manager ──────────────────────────────────────────────

/// Owns the socket lifecycle, the offline outbound queue, and the
/// reconnect/backoff bookkeeping for one participant.
pub struct ConnectionManager<T: SyncTransport> {
    local_user_id: String,
    transport: T,
    state: ConnectionState,
    url: Option<String>,
    outbound: VecDeque<SyncMessage>,
    reconnect: ReconnectConfig,
    max_queued: usize,
    consecutive_failures: u32,
    exhausted_reported: bool,
}

impl<T: SyncTransport> ConnectionManager<T> {
    pub fn new(
        local_user_id: impl Into<String>,
        transport: T,
        reconnect: ReconnectConfig,
        max_queued: usize,
    ) -> Self {
        Self {
            local_user_id: local_user_id.into(),
            transport,
            state: ConnectionState::Disconnected,
            url: None,
            outbound: VecDeque::new(),
            reconnect,
            max_queued: max_queued.max(1),
            consecutive_failures: 0,
            exhausted_reported: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn queued_len(&self) -> usize {
        self.outbound.len()
    }

    /// Open the socket. An explicit `connect` re-arms the retry budget.
    ///
    /// Returns `Connected` on success or `Disconnected` with the failure
    /// reason; hard errors (invalid URL) propagate.
    pub fn connect(&mut self, url: &str) -> Result<TransportEvent> {
        validate_sync_url(url)?;
        self.url = Some(url.to_string());
        self.consecutive_failures = 0;
        self.exhausted_reported = false;
        self.attempt_connect()
    }

    fn attempt_connect(&mut self) -> Result<TransportEvent> {
        let url = self.url.clone().ok_or_else(|| anyhow!("no transport url configured"))?;
        self.state = ConnectionState::Connecting;

        if let Err(error) = self.transport.connect(&url) {
            self.state = ConnectionState::Disconnected;
            self.consecutive_failures += 1;
            return Ok(TransportEvent::Disconnected {
                reason: format!("connection failed: {error}"),
            });
        }

        self.state = ConnectionState::Connected;
        self.consecutive_failures = 0;
        info!(url = %url, "sync connection established");

        if let Err(reason) = self.flush_queue() {
            self.state = ConnectionState::Disconnected;
            self.consecutive_failures += 1;
            return Ok(TransportEvent::Disconnected { reason });
        }

        Ok(TransportEvent::Connected)
    }

    // Drain the offline queue in FIFO order. A failed send leaves the
    // failing message (and everything behind it) queued.
    fn flush_queue(&mut self) -> std::result::Result<(), String> {
        while let Some(msg) = self.outbound.pop_front() {
            let frame = match msg.encode() {
                Ok(frame) => frame,
                Err(error) => {
                    warn!(?error, "dropping unencodable queued message");
                    continue;
                }
            };
            if let Err(error) = self.transport.send(&frame) {
                self.outbound.push_front(msg);
                return Err(format!("flush failed: {error}"));
            }
        }
        Ok(())
    }

    /// Send immediately when connected, otherwise queue for the next
    /// flush. Delivery is at-most-once: acknowledgments are never awaited
    /// and unacked messages are not resent.
    pub fn send(&mut self, msg: SyncMessage) -> Result<SendOutcome> {
        if self.state != ConnectionState::Connected {
            self.enqueue(msg);
            return Ok(SendOutcome::Queued);
        }

        let frame = msg.encode()?;
        match self.transport.send(&frame) {
            Ok(()) => Ok(SendOutcome::Sent),
            Err(error) => {
                warn!(?error, "send failed; queueing message and marking disconnected");
                self.state = ConnectionState::Disconnected;
                self.enqueue(msg);
                Ok(SendOutcome::Queued)
            }
        }
    }

    fn enqueue(&mut self, msg: SyncMessage) {
        while self.outbound.len() >= self.max_queued {
            // Bounded queue: drop-oldest during long outages.
            if let Some(dropped) = self.outbound.pop_front() {
                warn!(message_id = %dropped.id, "outbound queue full; dropping oldest message");
            }
        }
        self.outbound.push_back(msg);
    }

    /// Block for the next remote message.
    ///
    /// Self-authored frames are discarded, malformed frames are logged and
    /// skipped, and `requires_ack` frames get a fire-and-forget ack.
    /// Returns `Disconnected` when the peer closes.
    pub fn recv_event(&mut self, now: DateTime<Utc>) -> Result<Option<TransportEvent>> {
        if self.state != ConnectionState::Connected {
            return Err(anyhow!("cannot receive: not connected"));
        }

        loop {
            let frame = match self.transport.recv()? {
                Some(frame) => frame,
                None => {
                    self.state = ConnectionState::Disconnected;
                    return Ok(Some(TransportEvent::Disconnected {
                        reason: "connection closed by peer".to_string(),
                    }));
                }
            };

            let msg = match SyncMessage::decode(&frame) {
                Ok(msg) => msg,
                Err(error) => {
                    warn!(?error, "dropping malformed inbound frame");
                    continue;
                }
            };

            if msg.user_id == self.local_user_id {
                debug!(message_id = %msg.id, "discarding self-echoed message");
                continue;
            }

            if msg.requires_ack() {
                self.send_ack(&msg, now);
            }

            return Ok(Some(TransportEvent::Inbound(msg)));
        }
    }

    // Best effort: ack failures are logged, never retried.
    fn send_ack(&mut self, msg: &SyncMessage, now: DateTime<Utc>) {
        let ack = SyncMessage::new(
            msg.session_id,
            self.local_user_id.clone(),
            now,
            SyncPayload::StateUpdate(StateUpdateData {
                action: StateUpdateAction::Ack { message_id: msg.id },
            }),
        );
        match ack.encode() {
            Ok(frame) => {
                if let Err(error) = self.transport.send(&frame) {
                    warn!(?error, acked = %msg.id, "failed to send ack");
                }
            }
            Err(error) => warn!(?error, "failed to encode ack"),
        }
    }

    /// Backoff delay before the next reconnect attempt: `base × 2^n` with
    /// `n` the 0-indexed retry, capped at the configured maximum. The
    /// first retry after a failure waits exactly the base delay.
    pub fn reconnect_delay(&self) -> Duration {
        let exp = self.consecutive_failures.saturating_sub(1).min(16);
        let delay_ms = self
            .reconnect
            .base_delay_ms
            .saturating_mul(1u64 << exp)
            .min(self.reconnect.max_delay_ms);
        Duration::from_millis(delay_ms)
    }

    pub fn should_reconnect(&self) -> bool {
        self.consecutive_failures < self.reconnect.max_attempts
    }

    /// Drive one reconnect attempt after an unexpected disconnect.
    ///
    /// Returns `None` when already connected or when the exhausted state
    /// was already reported; `ReconnectFailed` is emitted exactly once per
    /// exhausted budget.
    pub fn try_reconnect(&mut self) -> Result<Option<TransportEvent>> {
        if self.state == ConnectionState::Connected {
            return Ok(None);
        }
        if !self.should_reconnect() {
            if self.exhausted_reported {
                return Ok(None);
            }
            self.exhausted_reported = true;
            warn!(attempts = self.consecutive_failures, "reconnect budget exhausted");
            return Ok(Some(TransportEvent::ReconnectFailed {
                attempts: self.consecutive_failures,
            }));
        }
        // Unexpected closes don't bump the failure count themselves; each
        // failed attempt here does.
        self.attempt_connect().map(Some)
    }

    /// Close the socket and drop all queued traffic. Safe to call twice.
    pub fn shutdown(&mut self) {
        self.transport.close();
        self.state = ConnectionState::Disconnected;
        self.outbound.clear();
        self.url = None;
        self.consecutive_failures = 0;
        self.exhausted_reported = false;
    }
}

fn validate_sync_url(value: &str) -> Result<()> {
    let parsed = Url::parse(value).map_err(|error| anyhow!("invalid sync url `{value}`: {error}"))?;
    match parsed.scheme() {
        "wss" => Ok(()),
        "ws" if is_loopback_host(parsed.host_str()) => Ok(()),
        _ => Err(anyhow!("sync url must use wss (ws is allowed only for localhost testing)")),
    }
}

fn is_loopback_host(host: Option<&str>) -> bool {
    let Some(host) = host else {
        return false;
    };
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    host.parse::<IpAddr>().is_ok_and(|addr| addr.is_loopback())
}

#[cfg(test)]
mod tests {
    use super::*;
    use slicesync_common::protocol::{MessageMetadata, ViewportSyncData};
    use slicesync_common::types::ViewportState;
    use uuid::Uuid;

    // ── Mock transport ──────────────────────────────────────────────

    #[derive(Debug, Default)]
    struct MockTransport {
        /// Frames to be returned by recv() in order; None = clean close.
        recv_queue: VecDeque<Option<String>>,
        /// Frames passed to send().
        sent: Vec<String>,
        /// If set, connect returns this error (consumed one at a time).
        connect_errors: VecDeque<String>,
        /// If set, send returns this error once.
        fail_next_send: bool,
        closed: bool,
    }

    impl MockTransport {
        fn queue_recv(&mut self, msg: &SyncMessage) {
            self.recv_queue.push_back(Some(msg.encode().unwrap()));
        }

        fn queue_raw(&mut self, frame: &str) {
            self.recv_queue.push_back(Some(frame.to_string()));
        }

        fn queue_close(&mut self) {
            self.recv_queue.push_back(None);
        }

        fn sent_messages(&self) -> Vec<SyncMessage> {
            self.sent.iter().map(|f| SyncMessage::decode(f).unwrap()).collect()
        }
    }

    impl SyncTransport for MockTransport {
        fn connect(&mut self, _url: &str) -> Result<()> {
            if let Some(err) = self.connect_errors.pop_front() {
                return Err(anyhow!("{err}"));
            }
            Ok(())
        }

        fn send(&mut self, frame: &str) -> Result<()> {
            if self.fail_next_send {
                self.fail_next_send = false;
                return Err(anyhow!("broken pipe"));
            }
            self.sent.push(frame.to_string());
            Ok(())
        }

        fn recv(&mut self) -> Result<Option<String>> {
            Ok(self.recv_queue.pop_front().flatten())
        }

        fn close(&mut self) {
            self.closed = true;
        }
    }

    fn ts() -> DateTime<Utc> {
        "2026-02-01T12:00:00Z".parse().unwrap()
    }

    fn viewport_msg(user_id: &str) -> SyncMessage {
        SyncMessage::new(
            Uuid::new_v4(),
            user_id,
            ts(),
            SyncPayload::ViewportSync(ViewportSyncData {
                mode: "simple".into(),
                viewport: ViewportState { zoom: 2.0, ..Default::default() },
            }),
        )
    }

    fn manager(transport: MockTransport) -> ConnectionManager<MockTransport> {
        ConnectionManager::new("user-local", transport, ReconnectConfig::default(), 1024)
    }

    const URL: &str = "ws://localhost:9100/sync";

    // ── Connect / URL validation ────────────────────────────────────

    #[test]
    fn connect_happy_path() {
        let mut mgr = manager(MockTransport::default());
        assert_eq!(mgr.state(), ConnectionState::Disconnected);
        let event = mgr.connect(URL).unwrap();
        assert_eq!(event, TransportEvent::Connected);
        assert_eq!(mgr.state(), ConnectionState::Connected);
    }

    #[test]
    fn connect_rejects_non_tls_remote_url() {
        let mut mgr = manager(MockTransport::default());
        let error = mgr.connect("ws://sync.example.com/v1").unwrap_err();
        assert!(error.to_string().contains("must use wss"));
    }

    #[test]
    fn connect_accepts_wss_and_loopback_ws() {
        let mut mgr = manager(MockTransport::default());
        assert_eq!(mgr.connect("wss://sync.example.com/v1").unwrap(), TransportEvent::Connected);
        assert_eq!(mgr.connect("ws://127.0.0.1:9100/sync").unwrap(), TransportEvent::Connected);
    }

    #[test]
    fn failed_connect_reports_disconnected() {
        let mut transport = MockTransport::default();
        transport.connect_errors.push_back("refused".into());
        let mut mgr = manager(transport);

        match mgr.connect(URL).unwrap() {
            TransportEvent::Disconnected { reason } => {
                assert!(reason.contains("connection failed"));
            }
            other => panic!("expected Disconnected, got {other:?}"),
        }
        assert_eq!(mgr.state(), ConnectionState::Disconnected);
    }

    // ── Offline queue ───────────────────────────────────────────────

    #[test]
    fn messages_sent_while_disconnected_flush_in_order_after_connect() {
        let mut mgr = manager(MockTransport::default());

        let first = viewport_msg("user-local");
        let second = viewport_msg("user-local");
        assert_eq!(mgr.send(first.clone()).unwrap(), SendOutcome::Queued);
        assert_eq!(mgr.send(second.clone()).unwrap(), SendOutcome::Queued);
        assert_eq!(mgr.queued_len(), 2);

        mgr.connect(URL).unwrap();

        let sent = mgr.transport.sent_messages();
        assert_eq!(sent.len(), 2, "each queued message is sent exactly once");
        assert_eq!(sent[0].id, first.id);
        assert_eq!(sent[1].id, second.id);
        assert_eq!(mgr.queued_len(), 0);
    }

    #[test]
    fn send_while_connected_goes_straight_to_the_wire() {
        let mut mgr = manager(MockTransport::default());
        mgr.connect(URL).unwrap();
        assert_eq!(mgr.send(viewport_msg("user-local")).unwrap(), SendOutcome::Sent);
        assert_eq!(mgr.transport.sent.len(), 1);
    }

    #[test]
    fn send_failure_queues_message_and_disconnects() {
        let mut mgr = manager(MockTransport::default());
        mgr.connect(URL).unwrap();
        mgr.transport.fail_next_send = true;

        let msg = viewport_msg("user-local");
        assert_eq!(mgr.send(msg.clone()).unwrap(), SendOutcome::Queued);
        assert_eq!(mgr.state(), ConnectionState::Disconnected);
        assert_eq!(mgr.queued_len(), 1);

        // Reconnect flushes the queued message.
        mgr.connect(URL).unwrap();
        let sent = mgr.transport.sent_messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].id, msg.id);
    }

    #[test]
    fn queue_is_bounded_drop_oldest() {
        let mut mgr =
            ConnectionManager::new("user-local", MockTransport::default(), ReconnectConfig::default(), 2);
        let a = viewport_msg("user-local");
        let b = viewport_msg("user-local");
        let c = viewport_msg("user-local");
        mgr.send(a.clone()).unwrap();
        mgr.send(b.clone()).unwrap();
        mgr.send(c.clone()).unwrap();
        assert_eq!(mgr.queued_len(), 2);

        mgr.connect(URL).unwrap();
        let sent = mgr.transport.sent_messages();
        assert_eq!(sent.iter().map(|m| m.id).collect::<Vec<_>>(), vec![b.id, c.id]);
    }

    // ── Inbound dispatch ────────────────────────────────────────────

    #[test]
    fn inbound_remote_message_is_surfaced() {
        let mut transport = MockTransport::default();
        let remote = viewport_msg("user-remote");
        transport.queue_recv(&remote);

        let mut mgr = manager(transport);
        mgr.connect(URL).unwrap();

        let event = mgr.recv_event(ts()).unwrap().unwrap();
        assert_eq!(event, TransportEvent::Inbound(remote));
    }

    #[test]
    fn self_echo_is_discarded() {
        let mut transport = MockTransport::default();
        transport.queue_recv(&viewport_msg("user-local"));
        let remote = viewport_msg("user-remote");
        transport.queue_recv(&remote);

        let mut mgr = manager(transport);
        mgr.connect(URL).unwrap();

        // The self-echo is skipped; the remote message comes through.
        let event = mgr.recv_event(ts()).unwrap().unwrap();
        assert_eq!(event, TransportEvent::Inbound(remote));
    }

    #[test]
    fn malformed_frames_are_skipped_without_closing() {
        let mut transport = MockTransport::default();
        transport.queue_raw("{definitely not json");
        transport.queue_raw(r#"{"type": "telemetry-burst", "data": {}}"#);
        let remote = viewport_msg("user-remote");
        transport.queue_recv(&remote);

        let mut mgr = manager(transport);
        mgr.connect(URL).unwrap();

        let event = mgr.recv_event(ts()).unwrap().unwrap();
        assert_eq!(event, TransportEvent::Inbound(remote));
        assert_eq!(mgr.state(), ConnectionState::Connected);
    }

    #[test]
    fn peer_close_reports_disconnected() {
        let mut transport = MockTransport::default();
        transport.queue_close();

        let mut mgr = manager(transport);
        mgr.connect(URL).unwrap();

        match mgr.recv_event(ts()).unwrap().unwrap() {
            TransportEvent::Disconnected { .. } => {}
            other => panic!("expected Disconnected, got {other:?}"),
        }
        assert_eq!(mgr.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn requires_ack_triggers_exactly_one_ack() {
        let mut transport = MockTransport::default();
        let remote = viewport_msg("user-remote")
            .with_metadata(MessageMetadata { requires_ack: true, ..Default::default() });
        transport.queue_recv(&remote);

        let mut mgr = manager(transport);
        mgr.connect(URL).unwrap();
        mgr.recv_event(ts()).unwrap();

        let sent = mgr.transport.sent_messages();
        assert_eq!(sent.len(), 1);
        match &sent[0].payload {
            SyncPayload::StateUpdate(StateUpdateData {
                action: StateUpdateAction::Ack { message_id },
            }) => assert_eq!(*message_id, remote.id),
            other => panic!("expected ack, got {other:?}"),
        }
        assert_eq!(sent[0].user_id, "user-local");
    }

    // ── Reconnect backoff ───────────────────────────────────────────

    #[test]
    fn reconnect_delay_doubles_and_caps() {
        let mut transport = MockTransport::default();
        for _ in 0..10 {
            transport.connect_errors.push_back("refused".into());
        }
        let mut mgr = ConnectionManager::new(
            "user-local",
            transport,
            ReconnectConfig { base_delay_ms: 500, max_delay_ms: 30_000, max_attempts: 100 },
            1024,
        );

        // First retry waits exactly the base delay, then doubles.
        mgr.connect(URL).unwrap();
        assert_eq!(mgr.reconnect_delay(), Duration::from_millis(500));
        mgr.try_reconnect().unwrap();
        assert_eq!(mgr.reconnect_delay(), Duration::from_millis(1_000));
        mgr.try_reconnect().unwrap();
        assert_eq!(mgr.reconnect_delay(), Duration::from_millis(2_000));

        for _ in 0..7 {
            mgr.try_reconnect().unwrap();
        }
        assert_eq!(mgr.reconnect_delay(), Duration::from_millis(30_000));
    }

    #[test]
    fn reconnect_stops_after_cap_with_single_terminal_event() {
        let mut transport = MockTransport::default();
        for _ in 0..10 {
            transport.connect_errors.push_back("refused".into());
        }
        let mut mgr = ConnectionManager::new(
            "user-local",
            transport,
            ReconnectConfig { base_delay_ms: 1, max_delay_ms: 10, max_attempts: 3 },
            1024,
        );

        mgr.connect(URL).unwrap(); // failure 1
        mgr.try_reconnect().unwrap(); // failure 2
        mgr.try_reconnect().unwrap(); // failure 3
        assert!(!mgr.should_reconnect());

        let terminal = mgr.try_reconnect().unwrap();
        assert_eq!(terminal, Some(TransportEvent::ReconnectFailed { attempts: 3 }));
        // Exactly once: further polls yield nothing.
        assert_eq!(mgr.try_reconnect().unwrap(), None);
        assert_eq!(mgr.try_reconnect().unwrap(), None);
    }

    #[test]
    fn explicit_connect_rearms_the_retry_budget() {
        let mut transport = MockTransport::default();
        for _ in 0..3 {
            transport.connect_errors.push_back("refused".into());
        }
        let mut mgr = ConnectionManager::new(
            "user-local",
            transport,
            ReconnectConfig { base_delay_ms: 1, max_delay_ms: 10, max_attempts: 3 },
            1024,
        );

        mgr.connect(URL).unwrap();
        mgr.try_reconnect().unwrap();
        mgr.try_reconnect().unwrap();
        assert!(mgr.try_reconnect().unwrap().is_some()); // terminal

        // Fourth connect succeeds (queue of errors exhausted).
        assert_eq!(mgr.connect(URL).unwrap(), TransportEvent::Connected);
        assert!(mgr.should_reconnect());
    }

    #[test]
    fn successful_reconnect_resets_failure_count() {
        let mut transport = MockTransport::default();
        transport.connect_errors.push_back("refused".into());
        let mut mgr = manager(transport);

        mgr.connect(URL).unwrap(); // fails once
        let event = mgr.try_reconnect().unwrap(); // succeeds
        assert_eq!(event, Some(TransportEvent::Connected));
        assert_eq!(mgr.reconnect_delay(), Duration::from_millis(500));
    }

    // ── Shutdown ────────────────────────────────────────────────────

    #[test]
    fn shutdown_closes_socket_and_clears_queue_idempotently() {
        let mut mgr = manager(MockTransport::default());
        mgr.send(viewport_msg("user-local")).unwrap();
        mgr.connect(URL).unwrap();

        mgr.shutdown();
        assert_eq!(mgr.state(), ConnectionState::Disconnected);
        assert_eq!(mgr.queued_len(), 0);
        assert!(mgr.transport.closed);

        // Second shutdown is a no-op, not a panic.
        mgr.shutdown();
    }
}
