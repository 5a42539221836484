//! Chat client facade.
//!
//! [`ChatClient`] is what the presentation layer holds: a connection
//! flag, the message log and `send`. Behind it a single actor task owns
//! the state machine, the transport handle, the reconnect timer and the
//! log, and processes commands, transport events and timer expiry one at
//! a time.

use std::pin::Pin;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Sleep;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::chat::{
    Action, ApplicationMessage, ConnectionId, ConnectionMachine, ConnectionState, Connector,
    MessageLog, TransportEvent, TransportHandle,
};

/// Capacity of the new-message fan-out. Slow subscribers lag and skip;
/// the log itself is never trimmed.
const INCOMING_CAPACITY: usize = 256;

/// Observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    /// Reconnects scheduled since the last successful open.
    pub retries: u32,
}

impl ConnectionStatus {
    pub fn connected(&self) -> bool {
        self.state == ConnectionState::Open
    }
}

/// Commands sent by the facade to the actor
#[derive(Debug)]
enum Command {
    Start,
    Send {
        content: String,
        reply: oneshot::Sender<bool>,
    },
    Messages {
        reply: oneshot::Sender<Vec<ApplicationMessage>>,
    },
    Stop {
        done: oneshot::Sender<()>,
    },
}

/// One chat session.
///
/// Dropping the client closes its command channel, which stops the
/// connection and ends the actor.
pub struct ChatClient {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ConnectionStatus>,
    incoming: broadcast::Sender<ApplicationMessage>,
    task: JoinHandle<()>,
}

impl ChatClient {
    /// Creates the session in `Idle`. Nothing is opened until [`start`](Self::start).
    pub fn spawn<C: Connector>(connector: C, backoff: Backoff, max_retries: u32) -> Self {
        let machine = ConnectionMachine::new(backoff, max_retries);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ConnectionStatus {
            state: machine.state(),
            retries: machine.retries(),
        });
        let (incoming_tx, _) = broadcast::channel(INCOMING_CAPACITY);

        let actor = ConnectionActor {
            connector,
            machine,
            transport: None,
            reconnect: None,
            log: MessageLog::new(),
            events: event_tx,
            status: status_tx,
            incoming: incoming_tx.clone(),
        };
        let task = tokio::spawn(actor.run(cmd_rx, event_rx));

        Self {
            commands: cmd_tx,
            status: status_rx,
            incoming: incoming_tx,
            task,
        }
    }

    /// Opens the connection. Also serves as the manual reconnect once the
    /// retry budget is exhausted or after [`stop`](Self::stop).
    pub fn start(&self) {
        let _ = self.commands.send(Command::Start);
    }

    /// True iff the connection is open right now.
    pub fn connected(&self) -> bool {
        self.status.borrow().connected()
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    /// Receiver that observes every state change.
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Receives each message as it is appended to the log.
    pub fn subscribe(&self) -> broadcast::Receiver<ApplicationMessage> {
        self.incoming.subscribe()
    }

    /// Current message log, in arrival order.
    pub async fn messages(&self) -> Vec<ApplicationMessage> {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Messages { reply }).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Sends `content` if the connection is open. Returns false, and sends
    /// nothing, otherwise; the message is not kept for later.
    pub async fn send(&self, content: &str) -> bool {
        let (reply, rx) = oneshot::channel();
        let cmd = Command::Send {
            content: content.to_string(),
            reply,
        };
        if self.commands.send(cmd).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Cancels any pending reconnect and closes the connection.
    pub async fn stop(&self) {
        let (done, rx) = oneshot::channel();
        if self.commands.send(Command::Stop { done }).is_ok() {
            let _ = rx.await;
        }
    }

    /// Stops the connection and waits for the actor to finish.
    pub async fn shutdown(self) {
        self.stop().await;
        let ChatClient { commands, task, .. } = self;
        // Closing the command channel ends the actor loop
        drop(commands);
        if let Err(e) = task.await {
            warn!("Chat client task ended abnormally: {e}");
        }
        info!("Chat client shut down");
    }
}

struct PendingReconnect {
    timer: u64,
    sleep: Pin<Box<Sleep>>,
}

struct ConnectionActor<C> {
    connector: C,
    machine: ConnectionMachine,
    /// The only live transport attempt, if any.
    transport: Option<TransportHandle>,
    reconnect: Option<PendingReconnect>,
    log: MessageLog,
    events: mpsc::UnboundedSender<TransportEvent>,
    status: watch::Sender<ConnectionStatus>,
    incoming: broadcast::Sender<ApplicationMessage>,
}

impl<C: Connector> ConnectionActor<C> {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        debug!("Connection actor started");
        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => {
                        let actions = self.machine.stop();
                        self.apply(actions);
                        break;
                    }
                },
                Some(event) = events.recv() => self.handle_event(event),
                timer = reconnect_due(&mut self.reconnect) => {
                    self.reconnect = None;
                    let actions = self.machine.reconnect_due(timer);
                    self.apply(actions);
                }
            }
            self.publish_status();
        }
        self.publish_status();
        debug!("Connection actor finished ({} messages received)", self.log.snapshot().len());
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Start => {
                let actions = self.machine.start();
                self.apply(actions);
            }
            Command::Send { content, reply } => {
                let sent = match self.machine.send(&content, Utc::now()) {
                    Some(Action::Transmit { id, frame }) => self.transmit(id, frame),
                    _ => false,
                };
                if sent {
                    debug!("Sent message: {content}");
                } else {
                    debug!("Cannot send message, not connected");
                }
                let _ = reply.send(sent);
            }
            Command::Messages { reply } => {
                let _ = reply.send(self.log.snapshot().to_vec());
            }
            Command::Stop { done } => {
                let actions = self.machine.stop();
                self.apply(actions);
                let _ = done.send(());
            }
        }
    }

    fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Opened { id } => self.machine.on_opened(id),
            TransportEvent::Frame { id, text } => {
                if let Some(msg) = self.machine.on_frame(id, &text) {
                    self.log.append(msg.clone());
                    // No subscribers is fine
                    let _ = self.incoming.send(msg);
                }
            }
            TransportEvent::Error { id, error } => self.machine.on_error(id, &error),
            TransportEvent::Closed { id, reason } => {
                let actions = self.machine.on_closed(id, &reason);
                self.release_ended_transport();
                self.apply(actions);
            }
        }
    }

    fn apply(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::OpenTransport(id) => {
                    if let Some(previous) = self.transport.take() {
                        warn!("Closing leftover connection {} before opening {id}", previous.id());
                        previous.close();
                    }
                    self.transport = Some(self.connector.open(id, self.events.clone()));
                }
                Action::CloseTransport(id) => match self.transport.take() {
                    Some(handle) if handle.id() == id => handle.close(),
                    other => self.transport = other,
                },
                Action::ScheduleReconnect { timer, delay } => {
                    self.reconnect = Some(PendingReconnect {
                        timer,
                        sleep: Box::pin(tokio::time::sleep(delay)),
                    });
                }
                Action::CancelReconnect(timer) => {
                    if self.reconnect.as_ref().is_some_and(|p| p.timer == timer) {
                        debug!("Cancelled reconnect timer {timer}");
                        self.reconnect = None;
                    }
                }
                Action::Transmit { id, frame } => {
                    self.transmit(id, frame);
                }
            }
        }
    }

    fn transmit(&self, id: ConnectionId, frame: String) -> bool {
        match &self.transport {
            Some(handle) if handle.id() == id => handle.send_text(frame),
            _ => false,
        }
    }

    /// Drops the handle once the machine no longer tracks its attempt.
    fn release_ended_transport(&mut self) {
        let current = self.machine.current_connection();
        if self.transport.as_ref().is_some_and(|h| Some(h.id()) != current) {
            self.transport = None;
        }
    }

    fn publish_status(&self) {
        let next = ConnectionStatus {
            state: self.machine.state(),
            retries: self.machine.retries(),
        };
        self.status.send_if_modified(|status| {
            if *status == next {
                false
            } else {
                *status = next;
                true
            }
        });
    }
}

/// Resolves with the timer id when the pending reconnect is due; never
/// resolves when none is pending.
async fn reconnect_due(pending: &mut Option<PendingReconnect>) -> u64 {
    match pending {
        Some(p) => {
            p.sleep.as_mut().await;
            p.timer
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::transport::TransportCommand;
    use std::time::Duration;
    use tokio::time::Instant;

    /// Test side of one transport attempt.
    struct MockConnection {
        id: ConnectionId,
        events: mpsc::UnboundedSender<TransportEvent>,
        commands: mpsc::UnboundedReceiver<TransportCommand>,
    }

    impl MockConnection {
        fn open(&self) {
            let _ = self.events.send(TransportEvent::Opened { id: self.id });
        }

        fn frame(&self, text: &str) {
            let _ = self.events.send(TransportEvent::Frame {
                id: self.id,
                text: text.to_string(),
            });
        }

        fn error(&self, error: &str) {
            let _ = self.events.send(TransportEvent::Error {
                id: self.id,
                error: error.to_string(),
            });
        }

        fn close(&self, reason: &str) {
            let _ = self.events.send(TransportEvent::Closed {
                id: self.id,
                reason: reason.to_string(),
            });
        }
    }

    /// Hands every opened attempt to the test.
    struct MockConnector {
        opened: mpsc::UnboundedSender<MockConnection>,
    }

    impl Connector for MockConnector {
        fn open(
            &self,
            id: ConnectionId,
            events: mpsc::UnboundedSender<TransportEvent>,
        ) -> TransportHandle {
            let (tx, rx) = mpsc::unbounded_channel();
            let _ = self.opened.send(MockConnection {
                id,
                events,
                commands: rx,
            });
            TransportHandle::new(id, tx)
        }
    }

    fn client(max_retries: u32) -> (ChatClient, mpsc::UnboundedReceiver<MockConnection>) {
        let (opened_tx, opened_rx) = mpsc::unbounded_channel();
        let client = ChatClient::spawn(
            MockConnector { opened: opened_tx },
            Backoff::default(),
            max_retries,
        );
        (client, opened_rx)
    }

    async fn next_connection(opened: &mut mpsc::UnboundedReceiver<MockConnection>) -> MockConnection {
        tokio::time::timeout(Duration::from_secs(120), opened.recv())
            .await
            .expect("no connection attempt")
            .expect("connector dropped")
    }

    async fn wait_for_state(client: &ChatClient, state: ConnectionState) {
        let mut status = client.watch_status();
        tokio::time::timeout(Duration::from_secs(120), status.wait_for(|s| s.state == state))
            .await
            .expect("state not reached")
            .expect("actor ended");
    }

    async fn connected_client() -> (ChatClient, mpsc::UnboundedReceiver<MockConnection>, MockConnection) {
        let (client, mut opened) = client(5);
        client.start();
        let conn = next_connection(&mut opened).await;
        conn.open();
        wait_for_state(&client, ConnectionState::Open).await;
        (client, opened, conn)
    }

    // ── send ─────────────────────────────────────────────

    #[tokio::test]
    async fn test_send_before_start_fails() {
        let (client, _opened) = client(5);
        assert!(!client.send("hi").await);
        assert!(client.messages().await.is_empty());
        assert_eq!(client.status().state, ConnectionState::Idle);
        assert!(!client.connected());
    }

    #[tokio::test]
    async fn test_send_while_connecting_fails() {
        let (client, mut opened) = client(5);
        client.start();
        let mut conn = next_connection(&mut opened).await;
        assert!(!client.send("too early").await);
        assert!(conn.commands.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_and_receive_echo() {
        let (client, _opened, mut conn) = connected_client().await;
        assert!(client.connected());

        assert!(client.send("hello").await);
        match conn.commands.recv().await {
            Some(TransportCommand::SendText(frame)) => {
                let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
                assert_eq!(value["content"], "hello");
                assert!(value["timestamp"].as_str().unwrap().ends_with('Z'));
            }
            other => panic!("expected SendText, got {other:?}"),
        }

        let mut incoming = client.subscribe();
        conn.frame(r#"{"type":"message","content":"hello","timestamp":"2024-05-01T10:00:00Z","podName":"pod-1"}"#);
        let echoed = incoming.recv().await.unwrap();
        assert_eq!(echoed.content, "hello");

        let messages = client.messages().await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].pod_name.as_deref(), Some("pod-1"));
    }

    // ── inbound frames ───────────────────────────────────

    #[tokio::test]
    async fn test_messages_keep_arrival_order() {
        let (client, _opened, conn) = connected_client().await;
        let mut incoming = client.subscribe();
        for i in 0..10 {
            conn.frame(&format!(r#"{{"content":"m{i}"}}"#));
        }
        for _ in 0..10 {
            incoming.recv().await.unwrap();
        }
        let contents: Vec<String> = client.messages().await.into_iter().map(|m| m.content).collect();
        let expected: Vec<String> = (0..10).map(|i| format!("m{i}")).collect();
        assert_eq!(contents, expected);
    }

    #[tokio::test]
    async fn test_malformed_frame_skipped() {
        let (client, _opened, conn) = connected_client().await;
        let mut incoming = client.subscribe();
        conn.frame("{oops");
        conn.frame(r#"{"type":"system","content":"pod-7 ready","podName":"pod-7"}"#);

        let msg = incoming.recv().await.unwrap();
        assert!(msg.is_system());
        let messages = client.messages().await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].pod_name.as_deref(), Some("pod-7"));
        assert!(client.connected());
    }

    // ── reconnection ─────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_delays_and_exhaustion() {
        let (client, mut opened) = client(5);
        client.start();

        let expected = [1000u64, 2000, 4000, 8000, 10_000];
        let mut conn = next_connection(&mut opened).await;
        for ms in expected {
            let closed_at = Instant::now();
            conn.close("connection refused");
            conn = next_connection(&mut opened).await;
            let waited = closed_at.elapsed();
            assert!(waited >= Duration::from_millis(ms), "waited {waited:?}, expected {ms}ms");
            assert!(waited < Duration::from_millis(ms + 500), "waited {waited:?}, expected {ms}ms");
        }

        conn.close("connection refused");
        wait_for_state(&client, ConnectionState::Exhausted).await;
        assert_eq!(client.status().retries, 5);
        assert!(!client.connected());
        assert!(!client.send("anyone there?").await);

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert!(opened.try_recv().is_err());
        assert_eq!(client.status().state, ConnectionState::Exhausted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_restarts_backoff() {
        let (client, mut opened) = client(5);
        client.start();

        let conn = next_connection(&mut opened).await;
        conn.close("refused");
        let conn = next_connection(&mut opened).await;
        conn.close("refused");
        let conn = next_connection(&mut opened).await;
        conn.open();
        wait_for_state(&client, ConnectionState::Open).await;
        assert_eq!(client.status().retries, 0);

        let closed_at = Instant::now();
        conn.close("connection reset");
        let _conn = next_connection(&mut opened).await;
        let waited = closed_at.elapsed();
        assert!(waited >= Duration::from_millis(1000));
        assert!(waited < Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_then_close_schedules_one_reconnect() {
        let (client, mut opened) = client(5);
        client.start();
        let conn = next_connection(&mut opened).await;
        conn.error("connection refused");
        conn.close("handshake failed");

        let _second = next_connection(&mut opened).await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(opened.try_recv().is_err());
        assert_eq!(client.status().state, ConnectionState::Connecting);
        assert_eq!(client.status().retries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_ignored_while_reconnecting() {
        let (client, mut opened) = client(5);
        client.start();
        let conn = next_connection(&mut opened).await;
        conn.close("refused");
        wait_for_state(&client, ConnectionState::Reconnecting).await;

        client.start();
        client.start();
        let _second = next_connection(&mut opened).await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(opened.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_reconnect_after_exhaustion() {
        let (client, mut opened) = client(0);
        client.start();
        let conn = next_connection(&mut opened).await;
        conn.close("refused");
        wait_for_state(&client, ConnectionState::Exhausted).await;
        assert!(!client.send("lost").await);

        client.start();
        let mut conn = next_connection(&mut opened).await;
        conn.open();
        wait_for_state(&client, ConnectionState::Open).await;
        assert!(client.send("back").await);
        // Only the message sent while open reaches the transport
        match conn.commands.recv().await {
            Some(TransportCommand::SendText(frame)) => assert!(frame.contains("\"back\"")),
            other => panic!("expected SendText, got {other:?}"),
        }
    }

    // ── stop / teardown ──────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_pending_reconnect() {
        let (client, mut opened) = client(5);
        client.start();
        let conn = next_connection(&mut opened).await;
        conn.close("refused");
        wait_for_state(&client, ConnectionState::Reconnecting).await;

        client.stop().await;
        assert_eq!(client.status().state, ConnectionState::Closed);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(opened.try_recv().is_err());
        assert_eq!(client.status().state, ConnectionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_closes_transport_without_retry() {
        let (client, mut opened, mut conn) = connected_client().await;
        client.stop().await;
        assert!(!client.connected());
        assert_eq!(conn.commands.recv().await, Some(TransportCommand::Close));

        // The transport reports the close; nothing is rescheduled
        conn.close("closed locally");
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(opened.try_recv().is_err());
        assert_eq!(client.status().state, ConnectionState::Closed);
        assert!(!client.send("late").await);
    }

    #[tokio::test]
    async fn test_events_after_stop_ignored() {
        let (client, _opened, conn) = connected_client().await;
        client.stop().await;
        conn.frame(r#"{"content":"late"}"#);
        conn.open();
        assert!(client.messages().await.is_empty());
        assert_eq!(client.status().state, ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_drop_closes_transport() {
        let (client, _opened, mut conn) = connected_client().await;
        drop(client);
        let cmd = conn.commands.recv().await;
        assert!(matches!(cmd, Some(TransportCommand::Close) | None));
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_actor() {
        let (client, _opened, mut conn) = connected_client().await;
        let mut status = client.watch_status();
        client.shutdown().await;
        assert_eq!(conn.commands.recv().await, Some(TransportCommand::Close));
        assert_eq!(status.borrow_and_update().state, ConnectionState::Closed);
    }
}
