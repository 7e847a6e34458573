//! # Connection Management
//!
//! Owns the console's single websocket to the lab server.
//!
//! ## Lifecycle:
//! ```text
//!   connect() ──► CONNECTING ──Opened──► OPEN ──Closed──► CLOSED
//!                     │                                     │
//!                     └──────────────Closed─────────────────┤
//!                                                           ▼
//!                                       reconnect deadline (fixed delay)
//!                                                           │
//!   connect() ◄─────────────────────────────────────────────┘
//! ```
//!
//! The manager never blocks and never owns a timer. It records a reconnect
//! deadline; the console's event loop sleeps until it and calls `connect()`
//! again. There is no retry limit and no backoff.
//!
//! Every socket carries a generation number. Events from an older socket
//! (a close that races a newer connect) are ignored, and connecting again
//! aborts the previous socket task, so at most one socket is ever live.

use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::protocol::Envelope;
use crate::surfaces::RenderLine;

/// How long `shutdown` waits for the socket to close cleanly.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Socket lifecycle state, mirrored on the status indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closed => "closed",
        }
    }
}

/// The logical session the console holds with the server.
///
/// A fresh `id` is minted per socket; `reconnect_attempt` counts connects
/// since the last successful open.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: Uuid,
    pub state: ConnectionState,
    pub protocol_version: String,
    pub reconnect_attempt: u32,
    pub generation: u64,
    pub opened_at: Option<DateTime<Utc>>,
}

/// Outbound payload for the socket task.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

/// Events a socket task reports back to the console.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    Opened { generation: u64 },
    Text { generation: u64, text: String },
    /// Emitted exactly once per socket, including when the dial itself fails
    Closed { generation: u64, reason: String },
}

impl SocketEvent {
    pub fn generation(&self) -> u64 {
        match self {
            SocketEvent::Opened { generation }
            | SocketEvent::Text { generation, .. }
            | SocketEvent::Closed { generation, .. } => *generation,
        }
    }
}

/// Channels handed to a dialer for one socket.
#[derive(Debug)]
pub struct SocketLink {
    pub generation: u64,
    pub events: mpsc::UnboundedSender<SocketEvent>,
    pub outbound: mpsc::UnboundedReceiver<Frame>,
}

impl SocketLink {
    fn report(&self, event: SocketEvent) {
        let _ = self.events.send(event);
    }
}

/// Opens sockets. Production code uses [`WsDialer`]; tests substitute their own.
pub trait Dialer: Send + Sync {
    /// Spawn a task that drives one socket to `url` until it closes.
    fn dial(&self, url: &str, link: SocketLink) -> JoinHandle<()>;
}

/// tokio-tungstenite client.
#[derive(Debug, Default, Clone)]
pub struct WsDialer;

impl Dialer for WsDialer {
    fn dial(&self, url: &str, link: SocketLink) -> JoinHandle<()> {
        tokio::spawn(run_socket(url.to_string(), link))
    }
}

async fn run_socket(url: String, mut link: SocketLink) {
    let generation = link.generation;
    let stream = match connect_async(url.as_str()).await {
        Ok((stream, _response)) => stream,
        Err(err) => {
            link.report(SocketEvent::Closed {
                generation,
                reason: err.to_string(),
            });
            return;
        }
    };
    link.report(SocketEvent::Opened { generation });

    let (mut write, mut read) = stream.split();
    let reason = loop {
        tokio::select! {
            frame = link.outbound.recv() => {
                let message = match frame {
                    Some(Frame::Text(text)) => Message::Text(text),
                    Some(Frame::Binary(bytes)) => Message::Binary(bytes),
                    None => {
                        let _ = write.close().await;
                        break "closed by client".to_string();
                    }
                };
                if let Err(err) = write.send(message).await {
                    break err.to_string();
                }
            }
            incoming = read.next() => match incoming {
                Some(Ok(Message::Text(text))) => link.report(SocketEvent::Text { generation, text }),
                Some(Ok(Message::Close(frame))) => {
                    break frame
                        .map(|f| format!("closed by server ({})", f.code))
                        .unwrap_or_else(|| "closed by server".to_string());
                }
                Some(Ok(other)) => debug!(generation, kind = ?other, "Ignoring non-text frame from server"),
                Some(Err(err)) => break err.to_string(),
                None => break "stream ended".to_string(),
            },
        }
    };

    link.report(SocketEvent::Closed { generation, reason });
}

/// What a socket event meant to the console.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkUpdate {
    /// Socket opened and the handshake went out
    Opened { note: RenderLine },
    /// A text frame to classify and route
    Message(String),
    /// Socket is gone; a reconnect has been scheduled
    Closed { note: RenderLine },
}

/// Connection lifecycle, handshake and fixed-delay reconnect.
pub struct ConnectionManager {
    url: String,
    reconnect_delay: Duration,
    dialer: Box<dyn Dialer>,
    events_tx: mpsc::UnboundedSender<SocketEvent>,
    session: Session,
    outbound: Option<mpsc::UnboundedSender<Frame>>,
    task: Option<JoinHandle<()>>,
    next_reconnect: Option<Instant>,
}

impl ConnectionManager {
    pub fn new(
        config: &ClientConfig,
        dialer: Box<dyn Dialer>,
        events_tx: mpsc::UnboundedSender<SocketEvent>,
    ) -> Self {
        Self {
            url: config.endpoint().to_string(),
            reconnect_delay: config.reconnect_delay(),
            dialer,
            events_tx,
            session: Session {
                id: Uuid::new_v4(),
                state: ConnectionState::Closed,
                protocol_version: config.protocol.version.clone(),
                reconnect_attempt: 0,
                generation: 0,
                opened_at: None,
            },
            outbound: None,
            task: None,
            next_reconnect: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.session.state
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn next_reconnect(&self) -> Option<Instant> {
        self.next_reconnect
    }

    pub fn reconnect_due(&self, now: Instant) -> bool {
        matches!(self.next_reconnect, Some(deadline) if deadline <= now)
    }

    /// Open a new socket, replacing any existing one.
    ///
    /// Returns the note to show in the chat log.
    pub fn connect(&mut self) -> RenderLine {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.outbound = None;
        self.next_reconnect = None;

        if self.session.generation > 0 {
            self.session.reconnect_attempt += 1;
        }
        self.session.generation += 1;
        self.session.id = Uuid::new_v4();
        self.session.state = ConnectionState::Connecting;
        self.session.opened_at = None;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let link = SocketLink {
            generation: self.session.generation,
            events: self.events_tx.clone(),
            outbound: outbound_rx,
        };
        self.outbound = Some(outbound_tx);
        self.task = Some(self.dialer.dial(&self.url, link));

        info!(
            url = %self.url,
            generation = self.session.generation,
            attempt = self.session.reconnect_attempt,
            session_id = %self.session.id,
            "Connecting to lab server"
        );
        RenderLine::system(format!("Connecting to {}...", self.url))
    }

    /// Apply one socket event. Events from superseded sockets yield `None`.
    pub fn handle_event(&mut self, event: SocketEvent, now: Instant) -> Option<LinkUpdate> {
        if event.generation() != self.session.generation {
            debug!(
                generation = event.generation(),
                live = self.session.generation,
                "Ignoring event from a superseded socket"
            );
            return None;
        }

        match event {
            SocketEvent::Opened { .. } => {
                self.session.state = ConnectionState::Open;
                self.session.reconnect_attempt = 0;
                self.session.opened_at = Some(Utc::now());
                let handshake = Envelope::Handshake {
                    version: self.session.protocol_version.clone(),
                };
                self.send(&handshake);
                info!(session_id = %self.session.id, "Uplink established");
                Some(LinkUpdate::Opened {
                    note: RenderLine::system("Uplink established. Handshaking..."),
                })
            }
            SocketEvent::Text { text, .. } => Some(LinkUpdate::Message(text)),
            SocketEvent::Closed { reason, .. } => {
                if self.session.state == ConnectionState::Closed {
                    return None;
                }
                self.session.state = ConnectionState::Closed;
                self.outbound = None;
                self.task = None;
                self.next_reconnect = Some(now + self.reconnect_delay);
                warn!(
                    reason = %reason,
                    delay_ms = self.reconnect_delay.as_millis() as u64,
                    "Connection lost, reconnect scheduled"
                );
                Some(LinkUpdate::Closed {
                    note: RenderLine::system(format!(
                        "Connection lost. Reconnecting in {}...",
                        format_delay(self.reconnect_delay)
                    )),
                })
            }
        }
    }

    /// Serialize and send one envelope. Silently dropped (with a warning)
    /// unless the socket is open.
    pub fn send(&self, envelope: &Envelope) -> bool {
        let text = match envelope.to_json() {
            Ok(text) => text,
            Err(err) => {
                warn!(kind = envelope.kind(), error = %err, "Could not encode envelope");
                return false;
            }
        };
        let sent = self.send_frame(Frame::Text(text));
        if !sent {
            warn!(kind = envelope.kind(), state = self.state().as_str(), "Socket not open, message dropped");
        }
        sent
    }

    /// Send raw PCM bytes. Dropped without a warning when not open, since
    /// capture keeps producing frames during a reconnect.
    pub fn send_binary(&self, bytes: Vec<u8>) -> bool {
        self.send_frame(Frame::Binary(bytes))
    }

    fn send_frame(&self, frame: Frame) -> bool {
        if self.session.state != ConnectionState::Open {
            return false;
        }
        match &self.outbound {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        }
    }

    /// Close the socket and cancel any pending reconnect.
    pub async fn shutdown(&mut self) {
        self.next_reconnect = None;
        self.outbound = None;
        self.session.state = ConnectionState::Closed;
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(CLOSE_GRACE, &mut task).await.is_err() {
                task.abort();
            }
        }
        info!(session_id = %self.session.id, "Connection shut down");
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Whole seconds as `5s`, anything finer as `1.5s`.
fn format_delay(delay: Duration) -> String {
    if delay.subsec_millis() == 0 {
        format!("{}s", delay.as_secs())
    } else {
        format!("{:.1}s", delay.as_secs_f64())
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::FakeDialer;
    use super::*;
    use tokio::net::TcpListener;

    fn manager(dialer: FakeDialer) -> (ConnectionManager, mpsc::UnboundedReceiver<SocketEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ConnectionManager::new(&ClientConfig::default(), Box::new(dialer), tx), rx)
    }

    fn handshake_json() -> String {
        Envelope::Handshake {
            version: "3.4.0".to_string(),
        }
        .to_json()
        .unwrap()
    }

    #[tokio::test]
    async fn test_open_sends_handshake_first() {
        let dialer = FakeDialer::default();
        let (mut conn, mut events) = manager(dialer.clone());

        let note = conn.connect();
        assert_eq!(note.text, "Connecting to ws://localhost:8765...");
        assert_eq!(conn.state(), ConnectionState::Connecting);

        dialer.open();
        let update = conn.handle_event(events.recv().await.unwrap(), Instant::now());
        assert!(matches!(update, Some(LinkUpdate::Opened { .. })));
        assert_eq!(conn.state(), ConnectionState::Open);

        conn.send(&Envelope::TextInput {
            content: "hi".to_string(),
        });
        let sent = dialer.sent();
        assert_eq!(sent[0], Frame::Text(handshake_json()));
        assert_eq!(sent.len(), 2);
    }

    #[tokio::test]
    async fn test_send_when_not_open_is_dropped() {
        let dialer = FakeDialer::default();
        let (mut conn, _events) = manager(dialer.clone());

        assert!(!conn.send(&Envelope::MicState { active: true }));
        conn.connect();
        assert!(!conn.send(&Envelope::MicState { active: true }));
        assert!(!conn.send_binary(vec![0, 1]));
        assert!(dialer.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_schedules_reconnect_after_fixed_delay() {
        let dialer = FakeDialer::default();
        let (mut conn, mut events) = manager(dialer.clone());
        conn.connect();

        for attempt in 1..=3u32 {
            dialer.close();
            let closed_at = Instant::now();
            let update = conn.handle_event(events.recv().await.unwrap(), closed_at);
            match update {
                Some(LinkUpdate::Closed { note }) => {
                    assert_eq!(note.text, "Connection lost. Reconnecting in 5s...")
                }
                other => panic!("expected close, got {:?}", other),
            }
            assert_eq!(conn.state(), ConnectionState::Closed);

            let deadline = conn.next_reconnect().unwrap();
            assert_eq!(deadline - closed_at, Duration::from_secs(5));
            assert!(!conn.reconnect_due(closed_at + Duration::from_millis(4999)));

            tokio::time::sleep_until(deadline).await;
            assert!(conn.reconnect_due(Instant::now()));
            conn.connect();
            assert_eq!(conn.session().reconnect_attempt, attempt);
            assert!(conn.next_reconnect().is_none());
        }
        assert_eq!(dialer.dials(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_note_shows_fractional_delay() {
        let mut config = ClientConfig::default();
        config.connection.reconnect_delay_ms = 1500;
        let dialer = FakeDialer::default();
        let (tx, mut events) = mpsc::unbounded_channel();
        let mut conn = ConnectionManager::new(&config, Box::new(dialer.clone()), tx);
        conn.connect();

        dialer.close();
        let closed_at = Instant::now();
        match conn.handle_event(events.recv().await.unwrap(), closed_at) {
            Some(LinkUpdate::Closed { note }) => {
                assert_eq!(note.text, "Connection lost. Reconnecting in 1.5s...")
            }
            other => panic!("expected close, got {:?}", other),
        }
        assert_eq!(conn.next_reconnect().unwrap() - closed_at, Duration::from_millis(1500));
    }

    #[test]
    fn test_format_delay() {
        assert_eq!(format_delay(Duration::from_secs(5)), "5s");
        assert_eq!(format_delay(Duration::from_millis(1500)), "1.5s");
        assert_eq!(format_delay(Duration::from_millis(2500)), "2.5s");
    }

    #[tokio::test]
    async fn test_stale_socket_events_are_ignored() {
        let dialer = FakeDialer::default();
        let (mut conn, _events) = manager(dialer);
        conn.connect();
        conn.connect();

        let stale = SocketEvent::Closed {
            generation: 1,
            reason: "late".to_string(),
        };
        assert!(conn.handle_event(stale, Instant::now()).is_none());
        assert_eq!(conn.state(), ConnectionState::Connecting);
        assert!(conn.next_reconnect().is_none());
    }

    #[tokio::test]
    async fn test_failed_dial_schedules_reconnect() {
        let dialer = FakeDialer::default();
        let (mut conn, mut events) = manager(dialer.clone());
        conn.connect();
        dialer.close();
        let update = conn.handle_event(events.recv().await.unwrap(), Instant::now());
        assert!(matches!(update, Some(LinkUpdate::Closed { .. })));
        assert!(conn.next_reconnect().is_some());
    }

    #[tokio::test]
    async fn test_real_socket_handshake_and_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let first = ws.next().await.unwrap().unwrap();
            ws.send(Message::Text(r#"{"type":"status","state":"ready"}"#.to_string()))
                .await
                .unwrap();
            first
        });

        let mut config = ClientConfig::default();
        config.network.local_url = format!("ws://{}", addr);
        let (tx, mut events) = mpsc::unbounded_channel();
        let mut conn = ConnectionManager::new(&config, Box::new(WsDialer), tx);
        conn.connect();

        let opened = conn.handle_event(events.recv().await.unwrap(), Instant::now());
        assert!(matches!(opened, Some(LinkUpdate::Opened { .. })));

        let reply = conn.handle_event(events.recv().await.unwrap(), Instant::now());
        assert_eq!(
            reply,
            Some(LinkUpdate::Message(r#"{"type":"status","state":"ready"}"#.to_string()))
        );

        let first = server.await.unwrap();
        assert_eq!(first, Message::Text(handshake_json()));
        conn.shutdown().await;
        assert_eq!(conn.state(), ConnectionState::Closed);
    }
}
