//! WebSocket connection manager with bounded auto-reconnect.
//!
//! Owns at most one socket to the console server, tracks which gates the
//! server currently streams to us, and fans decoded [`ServerMessage`]s out
//! to listeners keyed by [`MessageTopic`]. Abnormal closures are retried
//! with linear backoff (`attempt × base_delay`) until the attempt budget
//! runs out; after that a single [`ConnectionEvent::ReconnectExhausted`] is
//! published and the manager stays down until [`reset`](ConnectionManager::reset)
//! or an explicit [`connect`](ConnectionManager::connect).
//!
//! Subscriptions are not restored after a reconnect. Whoever needs a gate
//! stream re-subscribes once [`ConnectionEvent::Connected`] arrives.
//!
//! # Example
//!
//! ```rust,ignore
//! use parkline_api::{ConnectionManager, MessageTopic, ReconnectConfig};
//!
//! let manager = ConnectionManager::new(url, ReconnectConfig::default());
//! manager.connect().await?;
//! manager.subscribe_to_gate("gate_1");
//!
//! let listener = manager.on_message(MessageTopic::ZoneUpdate, |msg| {
//!     println!("{msg:?}");
//! });
//!
//! // later
//! listener.dispose();
//! manager.disconnect();
//! ```

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use indexmap::IndexSet;
use strum::Display;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_tungstenite::tungstenite::{
    self, Message,
    protocol::{CloseFrame, frame::coding::CloseCode},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use url::Url;

use crate::error::Error;
use crate::listeners::{ListenerHandle, ListenerRegistry};
use crate::messages::{ClientFrame, MessageTopic, ServerMessage};

// ── Constants ────────────────────────────────────────────────────────

/// Server endpoint used when nothing else is configured.
pub const DEFAULT_URL: &str = "ws://localhost:3000/api/v1/ws";

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Close code recorded when the socket drops without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Close code recorded for a close frame without a status.
pub const CLOSE_NO_STATUS: u16 = 1005;

/// `1000 Normal` and `1001 Going Away` are clean; everything else is retried.
pub fn is_clean_close(code: u16) -> bool {
    matches!(code, 1000 | 1001)
}

// ── ReconnectConfig ──────────────────────────────────────────────────

/// Backoff and timeout configuration for the connection manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Multiplied by the attempt number. Default: 1s.
    pub base_delay: Duration,

    /// Automatic attempts after an abnormal close. Default: 5.
    pub max_attempts: u32,

    /// How long `connect()` waits for the socket to open. Default: 5s.
    pub connect_timeout: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_attempts: 5,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Delay before reconnect `attempt` (1-based), or `None` once the budget
/// is spent.
pub fn reconnect_delay(attempt: u32, config: &ReconnectConfig) -> Option<Duration> {
    if attempt == 0 || attempt > config.max_attempts {
        return None;
    }
    Some(config.base_delay * attempt)
}

// ── Status & lifecycle events ────────────────────────────────────────

/// Observable socket state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// Lifecycle notifications published on [`ConnectionManager::events`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected { code: u16 },
    ReconnectScheduled { attempt: u32, delay: Duration },
    /// Automatic reconnection gave up. Published once per exhaustion.
    ReconnectExhausted { attempts: u32 },
}

/// Disposer returned by [`ConnectionManager::on_message`].
pub type MessageListener = ListenerHandle<MessageTopic, ServerMessage>;

// ── ConnectionManager ────────────────────────────────────────────────

/// Handle to the shared connection.
///
/// Cheaply cloneable via `Arc<Inner>`. Background tasks hold only weak
/// references, so dropping every handle tears the socket down.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    url: Url,
    config: ReconnectConfig,
    state: Mutex<State>,
    status: watch::Sender<ConnectionStatus>,
    events: broadcast::Sender<ConnectionEvent>,
    listeners: ListenerRegistry<MessageTopic, ServerMessage>,
}

#[derive(Default)]
struct State {
    socket: Option<Socket>,
    /// Bumped for every new socket and on `disconnect()`. Close events
    /// carrying an older session are ignored.
    session: u64,
    subscribed_gates: IndexSet<String>,
    current_gate: Option<String>,
    reconnect_attempts: u32,
    reconnect_timer: Option<CancellationToken>,
    exhausted_notified: bool,
}

struct Socket {
    outbound: mpsc::UnboundedSender<Message>,
    cancel: CancellationToken,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let state = self
            .state
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(timer) = state.reconnect_timer.take() {
            timer.cancel();
        }
        if let Some(socket) = state.socket.take() {
            socket.cancel.cancel();
        }
    }
}

impl ConnectionManager {
    /// Create a manager for `url`. Does NOT connect.
    pub fn new(url: Url, config: ReconnectConfig) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            inner: Arc::new(Inner {
                url,
                config,
                state: Mutex::new(State::default()),
                status,
                events,
                listeners: ListenerRegistry::new(),
            }),
        }
    }

    pub fn url(&self) -> &Url {
        &self.inner.url
    }

    pub fn config(&self) -> &ReconnectConfig {
        &self.inner.config
    }

    // ── Connection lifecycle ─────────────────────────────────────

    /// Open the socket.
    ///
    /// Resolves immediately when already connected. When another attempt is
    /// in flight, waits for that attempt instead of opening a second socket.
    pub async fn connect(&self) -> Result<(), Error> {
        let session = {
            let mut state = self.inner.lock();
            let status = *self.inner.status.borrow();
            match status {
                ConnectionStatus::Connected => return Ok(()),
                ConnectionStatus::Connecting => None,
                ConnectionStatus::Disconnected => {
                    state.session += 1;
                    self.inner.status.send_replace(ConnectionStatus::Connecting);
                    Some(state.session)
                }
            }
        };

        let Some(session) = session else {
            debug!("connection attempt already in flight, waiting for it");
            return self.await_pending().await;
        };

        info!(url = %self.inner.url, "Connecting to WebSocket");

        let timeout = self.inner.config.connect_timeout;
        let opened = tokio::time::timeout(
            timeout,
            tokio_tungstenite::connect_async(self.inner.url.as_str()),
        )
        .await;

        let ws_stream = match opened {
            Ok(Ok((ws_stream, _response))) => ws_stream,
            Ok(Err(e)) => {
                let err = Error::WebSocketConnect(e.to_string());
                self.fail_attempt(session, &err);
                return Err(err);
            }
            Err(_) => {
                let err = Error::Timeout {
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                };
                self.fail_attempt(session, &err);
                return Err(err);
            }
        };

        let mut state = self.inner.lock();
        if state.session != session {
            // disconnect() ran while the handshake was in flight
            return Err(Error::WebSocketConnect(
                "connection attempt superseded by disconnect".into(),
            ));
        }

        let (write, read) = ws_stream.split();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        tokio::spawn(write_loop(write, outbound_rx));
        tokio::spawn(read_task(
            read,
            self.inner.listeners.clone(),
            cancel.clone(),
            Arc::downgrade(&self.inner),
            session,
        ));

        state.socket = Some(Socket { outbound, cancel });
        state.reconnect_attempts = 0;
        state.exhausted_notified = false;
        if let Some(timer) = state.reconnect_timer.take() {
            timer.cancel();
        }
        self.inner.status.send_replace(ConnectionStatus::Connected);
        let _ = self.inner.events.send(ConnectionEvent::Connected);

        info!("WebSocket connected; subscriptions are not restored automatically");
        Ok(())
    }

    async fn await_pending(&self) -> Result<(), Error> {
        let mut rx = self.inner.status.subscribe();
        match rx
            .wait_for(|status| *status != ConnectionStatus::Connecting)
            .await
        {
            Ok(status) if *status == ConnectionStatus::Connected => Ok(()),
            _ => Err(Error::WebSocketConnect("connection attempt failed".into())),
        }
    }

    /// Hard reset: cancel pending reconnects, suppress further automatic
    /// attempts, close cleanly, and drop every listener and subscription.
    pub fn disconnect(&self) {
        let mut state = self.inner.lock();
        if let Some(timer) = state.reconnect_timer.take() {
            timer.cancel();
        }
        state.reconnect_attempts = self.inner.config.max_attempts;
        // An explicit disconnect is not an exhausted budget.
        state.exhausted_notified = true;
        state.session += 1;

        if let Some(socket) = state.socket.take() {
            let _ = socket.outbound.send(Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "Client disconnect".into(),
            })));
            socket.cancel.cancel();
        }

        state.subscribed_gates.clear();
        state.current_gate = None;
        self.inner
            .status
            .send_replace(ConnectionStatus::Disconnected);
        drop(state);

        self.inner.listeners.clear();
        info!("WebSocket disconnected and all subscriptions cleared");
    }

    /// [`disconnect`](Self::disconnect), then re-arm the attempt budget.
    pub fn reset(&self) {
        self.disconnect();
        let mut state = self.inner.lock();
        state.reconnect_attempts = 0;
        state.exhausted_notified = false;
    }

    // ── Gate subscriptions ───────────────────────────────────────

    /// Ask the server to stream updates for `gate_id`.
    ///
    /// No-op when already subscribed. While the socket is not open nothing
    /// is sent and nothing is tracked.
    pub fn subscribe_to_gate(&self, gate_id: &str) {
        let mut state = self.inner.lock();
        if state.subscribed_gates.contains(gate_id) {
            debug!(gate_id, "Already subscribed to gate, skipping duplicate subscription");
            return;
        }

        state.current_gate = Some(gate_id.to_owned());

        let Some(socket) = state.socket.as_ref() else {
            debug!(gate_id, "WebSocket not open, subscribe request dropped");
            return;
        };

        match send_frame(&socket.outbound, &ClientFrame::subscribe(gate_id)) {
            Ok(()) => {
                state.subscribed_gates.insert(gate_id.to_owned());
                info!(
                    gate_id,
                    total = state.subscribed_gates.len(),
                    "Subscribed to gate"
                );
            }
            Err(e) => warn!(error = %e, gate_id, "Failed to send subscribe frame"),
        }
    }

    /// Stop streaming updates for `gate_id`. No-op when not subscribed.
    pub fn unsubscribe_from_gate(&self, gate_id: &str) {
        let mut state = self.inner.lock();
        if !state.subscribed_gates.contains(gate_id) {
            debug!(gate_id, "Not subscribed to gate, skipping unsubscribe");
            return;
        }

        if let Some(socket) = state.socket.as_ref() {
            match send_frame(&socket.outbound, &ClientFrame::unsubscribe(gate_id)) {
                Ok(()) => {
                    state.subscribed_gates.shift_remove(gate_id);
                    info!(
                        gate_id,
                        remaining = state.subscribed_gates.len(),
                        "Unsubscribed from gate"
                    );
                }
                Err(e) => warn!(error = %e, gate_id, "Failed to send unsubscribe frame"),
            }
        }

        if state.current_gate.as_deref() == Some(gate_id) {
            state.current_gate = None;
        }
    }

    /// Unsubscribe every tracked gate.
    pub fn unsubscribe_from_all_gates(&self) {
        let gates = self.current_subscriptions();
        info!(count = gates.len(), "Unsubscribing from all gates");
        for gate_id in &gates {
            self.unsubscribe_from_gate(gate_id);
        }
    }

    // ── Message listeners ────────────────────────────────────────

    /// Register `callback` for `topic`. [`MessageTopic::All`] sees every
    /// message. Callbacks run on the socket's reader task, in arrival order.
    pub fn on_message<F>(&self, topic: MessageTopic, callback: F) -> MessageListener
    where
        F: Fn(&ServerMessage) + Send + Sync + 'static,
    {
        self.inner.listeners.register(topic, callback)
    }

    /// Number of callbacks registered for `topic`.
    pub fn listener_count(&self, topic: MessageTopic) -> usize {
        self.inner.listeners.count(&topic)
    }

    // ── State observation ────────────────────────────────────────

    pub fn status(&self) -> ConnectionStatus {
        *self.inner.status.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// Subscribe to status changes.
    pub fn status_watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    /// Subscribe to lifecycle events.
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Gate most recently requested through [`subscribe_to_gate`](Self::subscribe_to_gate).
    pub fn current_gate(&self) -> Option<String> {
        self.inner.lock().current_gate.clone()
    }

    /// Gates the server is currently streaming to us, in subscription order.
    pub fn current_subscriptions(&self) -> Vec<String> {
        self.inner.lock().subscribed_gates.iter().cloned().collect()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.lock().reconnect_attempts
    }

    // ── Close & reconnect handling ───────────────────────────────

    /// A handshake failed or timed out. Treated like an abnormal close.
    fn fail_attempt(&self, session: u64, err: &Error) {
        warn!(error = %err, "WebSocket connection attempt failed");
        let mut state = self.inner.lock();
        if state.session != session {
            return;
        }
        self.inner
            .status
            .send_replace(ConnectionStatus::Disconnected);
        self.after_abnormal_loss(&mut state);
    }

    fn handle_close(&self, session: u64, code: u16) {
        let mut state = self.inner.lock();
        if state.session != session || state.socket.is_none() {
            trace!(code, "ignoring close of a superseded socket");
            return;
        }

        state.socket = None;
        let cleared = state.subscribed_gates.len();
        state.subscribed_gates.clear();
        info!(code, cleared, "WebSocket disconnected, gate subscriptions cleared");

        self.inner
            .status
            .send_replace(ConnectionStatus::Disconnected);
        let _ = self.inner.events.send(ConnectionEvent::Disconnected { code });

        if is_clean_close(code) {
            debug!(code, "clean close, not reconnecting");
            return;
        }
        self.after_abnormal_loss(&mut state);
    }

    fn after_abnormal_loss(&self, state: &mut State) {
        if state.reconnect_attempts < self.inner.config.max_attempts {
            self.schedule_reconnect(state);
        } else if !state.exhausted_notified {
            state.exhausted_notified = true;
            error!(
                attempts = state.reconnect_attempts,
                "WebSocket reconnection limit reached, giving up"
            );
            let _ = self.inner.events.send(ConnectionEvent::ReconnectExhausted {
                attempts: state.reconnect_attempts,
            });
        }
    }

    fn schedule_reconnect(&self, state: &mut State) {
        if let Some(timer) = state.reconnect_timer.take() {
            timer.cancel();
        }

        state.reconnect_attempts += 1;
        let attempt = state.reconnect_attempts;
        let Some(delay) = reconnect_delay(attempt, &self.inner.config) else {
            return;
        };

        info!(
            attempt,
            max_attempts = self.inner.config.max_attempts,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Scheduling reconnect"
        );

        let token = CancellationToken::new();
        state.reconnect_timer = Some(token.clone());
        let _ = self
            .inner
            .events
            .send(ConnectionEvent::ReconnectScheduled { attempt, delay });

        tokio::spawn(reconnect_task(Arc::downgrade(&self.inner), token, delay));
    }
}

// ── Background tasks ─────────────────────────────────────────────────

async fn reconnect_task(inner: Weak<Inner>, token: CancellationToken, delay: Duration) {
    tokio::select! {
        biased;
        _ = token.cancelled() => return,
        _ = tokio::time::sleep(delay) => {}
    }

    let Some(inner) = inner.upgrade() else { return };
    let manager = ConnectionManager { inner };

    {
        let mut state = manager.inner.lock();
        if token.is_cancelled() {
            return;
        }
        state.reconnect_timer = None;
    }

    if manager.status() != ConnectionStatus::Disconnected {
        debug!("reconnect timer fired but a connection already exists");
        return;
    }

    if let Err(e) = manager.connect().await {
        warn!(error = %e, "Reconnect failed");
    }
}

/// Drain the outbound channel into the socket. Ends after a close frame or
/// when every sender is gone.
async fn write_loop<S>(mut sink: S, mut outbound: mpsc::UnboundedReceiver<Message>)
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    while let Some(message) = outbound.recv().await {
        let closing = matches!(message, Message::Close(_));
        if let Err(e) = sink.send(message).await {
            debug!(error = %e, "WebSocket send failed, writer exiting");
            break;
        }
        if closing {
            break;
        }
    }
    let _ = sink.close().await;
}

async fn read_task<S>(
    read: S,
    listeners: ListenerRegistry<MessageTopic, ServerMessage>,
    cancel: CancellationToken,
    inner: Weak<Inner>,
    session: u64,
) where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    let code = read_loop(read, &listeners, &cancel).await;
    if let Some(inner) = inner.upgrade() {
        ConnectionManager { inner }.handle_close(session, code);
    }
}

/// Read frames until the socket closes. Returns the effective close code.
async fn read_loop<S>(
    mut read: S,
    listeners: &ListenerRegistry<MessageTopic, ServerMessage>,
    cancel: &CancellationToken,
) -> u16
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return u16::from(CloseCode::Normal),
            frame = read.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => dispatch_text(&text, listeners),
                    Some(Ok(Message::Ping(_))) => {
                        // tungstenite answers pings itself
                        trace!("WebSocket ping");
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let Some(cf) = frame else {
                            info!("WebSocket close frame received (no payload)");
                            return CLOSE_NO_STATUS;
                        };
                        info!(code = %cf.code, reason = %cf.reason, "WebSocket close frame received");
                        return u16::from(cf.code);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket read error");
                        return CLOSE_ABNORMAL;
                    }
                    None => {
                        info!("WebSocket stream ended without a close frame");
                        return CLOSE_ABNORMAL;
                    }
                }
            }
        }
    }
}

/// Decode a text frame and hand it to its topic's listeners, then to `All`.
/// Malformed frames are logged and dropped.
fn dispatch_text(text: &str, listeners: &ListenerRegistry<MessageTopic, ServerMessage>) {
    let message = match ServerMessage::from_json(text) {
        Ok(message) => message,
        Err(e) => {
            warn!(error = %e, "Failed to parse WebSocket message, dropping it");
            return;
        }
    };

    let topic = message.topic();
    let delivered =
        listeners.emit(&topic, &message) + listeners.emit(&MessageTopic::All, &message);
    trace!(%topic, delivered, "dispatched message");
}

fn send_frame(outbound: &mpsc::UnboundedSender<Message>, frame: &ClientFrame) -> Result<(), Error> {
    let json = frame.to_json()?;
    outbound
        .send(Message::Text(json.into()))
        .map_err(|_| Error::NotConnected)
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use pretty_assertions::assert_eq;
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    use super::*;

    // ── Loopback server ──────────────────────────────────────────

    enum ServerCmd {
        Send(String),
        Close(u16),
        Drop,
    }

    /// In-process WebSocket server. Serves one connection at a time and
    /// records every text frame the client sends.
    struct TestServer {
        url: Url,
        frames: mpsc::UnboundedReceiver<String>,
        control: mpsc::UnboundedSender<ServerCmd>,
        accepted: Arc<AtomicUsize>,
        task: JoinHandle<()>,
    }

    impl TestServer {
        async fn spawn() -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let (frame_tx, frames) = mpsc::unbounded_channel();
            let (control, mut control_rx) = mpsc::unbounded_channel();
            let accepted = Arc::new(AtomicUsize::new(0));
            let counter = Arc::clone(&accepted);

            let task = tokio::spawn(async move {
                while let Ok((tcp, _)) = listener.accept().await {
                    let Ok(ws) = tokio_tungstenite::accept_async(tcp).await else {
                        continue;
                    };
                    counter.fetch_add(1, Ordering::SeqCst);
                    let (mut sink, mut stream) = ws.split();

                    loop {
                        tokio::select! {
                            frame = stream.next() => match frame {
                                Some(Ok(Message::Text(text))) => {
                                    let _ = frame_tx.send(text.as_str().to_owned());
                                }
                                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                                Some(Ok(_)) => {}
                            },
                            cmd = control_rx.recv() => match cmd {
                                Some(ServerCmd::Send(text)) => {
                                    let _ = sink.send(Message::Text(text.into())).await;
                                }
                                Some(ServerCmd::Close(code)) => {
                                    let _ = sink
                                        .send(Message::Close(Some(CloseFrame {
                                            code: CloseCode::from(code),
                                            reason: "server closing".into(),
                                        })))
                                        .await;
                                    break;
                                }
                                Some(ServerCmd::Drop) | None => break,
                            },
                        }
                    }
                }
            });

            Self {
                url: Url::parse(&format!("ws://{addr}/api/v1/ws")).unwrap(),
                frames,
                control,
                accepted,
                task,
            }
        }

        fn send(&self, text: impl Into<String>) {
            self.control.send(ServerCmd::Send(text.into())).unwrap();
        }

        async fn next_frame(&mut self) -> String {
            tokio::time::timeout(Duration::from_secs(5), self.frames.recv())
                .await
                .expect("timed out waiting for a client frame")
                .expect("server gone")
        }

        /// Stop listening and drop the live connection without a close frame.
        fn shutdown(&self) {
            self.task.abort();
        }
    }

    fn fast_config() -> ReconnectConfig {
        ReconnectConfig {
            base_delay: Duration::from_millis(20),
            max_attempts: 5,
            connect_timeout: Duration::from_secs(2),
        }
    }

    async fn next_event(rx: &mut broadcast::Receiver<ConnectionEvent>) -> ConnectionEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for a connection event")
            .expect("event channel closed")
    }

    async fn wait_for_event(
        rx: &mut broadcast::Receiver<ConnectionEvent>,
        wanted: impl Fn(&ConnectionEvent) -> bool,
    ) -> ConnectionEvent {
        loop {
            let event = next_event(rx).await;
            if wanted(&event) {
                return event;
            }
        }
    }

    const ZONE_UPDATE: &str = r#"{"type":"zone-update","payload":{"id":"Z1","occupied":3}}"#;

    // ── Backoff ──────────────────────────────────────────────────

    #[test]
    fn default_reconnect_config() {
        let config = ReconnectConfig::default();
        assert_eq!(config.base_delay, Duration::from_secs(1));
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
    }

    #[test]
    fn backoff_is_attempt_times_base() {
        let config = ReconnectConfig::default();
        for attempt in 1..=5 {
            assert_eq!(
                reconnect_delay(attempt, &config),
                Some(Duration::from_secs(u64::from(attempt)))
            );
        }
    }

    #[test]
    fn backoff_stops_after_budget() {
        let config = ReconnectConfig::default();
        assert_eq!(reconnect_delay(0, &config), None);
        assert_eq!(reconnect_delay(6, &config), None);
    }

    #[test]
    fn clean_close_codes() {
        assert!(is_clean_close(1000));
        assert!(is_clean_close(1001));
        assert!(!is_clean_close(CLOSE_ABNORMAL));
        assert!(!is_clean_close(CLOSE_NO_STATUS));
        assert!(!is_clean_close(1011));
    }

    // ── Subscriptions ────────────────────────────────────────────

    #[tokio::test]
    async fn subscribe_twice_sends_one_frame() {
        let mut server = TestServer::spawn().await;
        let manager = ConnectionManager::new(server.url.clone(), fast_config());
        manager.connect().await.unwrap();

        manager.subscribe_to_gate("G1");
        manager.subscribe_to_gate("G1");
        manager.subscribe_to_gate("G2");

        assert_eq!(
            server.next_frame().await,
            r#"{"type":"subscribe","payload":{"gateId":"G1"}}"#
        );
        // The duplicate never went out: the next frame is G2's.
        assert_eq!(
            server.next_frame().await,
            r#"{"type":"subscribe","payload":{"gateId":"G2"}}"#
        );
        assert_eq!(manager.current_subscriptions(), vec!["G1", "G2"]);
        assert_eq!(manager.current_gate().as_deref(), Some("G2"));
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let mut server = TestServer::spawn().await;
        let manager = ConnectionManager::new(server.url.clone(), fast_config());
        manager.connect().await.unwrap();

        manager.subscribe_to_gate("G1");
        manager.unsubscribe_from_gate("G1");
        manager.unsubscribe_from_gate("G1");
        manager.subscribe_to_gate("G3");

        assert!(server.next_frame().await.contains(r#""type":"subscribe""#));
        assert_eq!(
            server.next_frame().await,
            r#"{"type":"unsubscribe","payload":{"gateId":"G1"}}"#
        );
        assert!(server.next_frame().await.contains("G3"));
        assert_eq!(manager.current_subscriptions(), vec!["G3"]);
    }

    #[tokio::test]
    async fn unsubscribe_from_all_gates_empties_the_set() {
        let server = TestServer::spawn().await;
        let manager = ConnectionManager::new(server.url.clone(), fast_config());
        manager.connect().await.unwrap();

        for gate in ["G1", "G2", "G3"] {
            manager.subscribe_to_gate(gate);
        }
        manager.unsubscribe_from_all_gates();

        assert!(manager.current_subscriptions().is_empty());
    }

    #[test]
    fn subscribe_while_disconnected_is_not_tracked() {
        let url = Url::parse(DEFAULT_URL).unwrap();
        let manager = ConnectionManager::new(url, ReconnectConfig::default());

        manager.subscribe_to_gate("G1");

        assert!(manager.current_subscriptions().is_empty());
        assert_eq!(manager.current_gate().as_deref(), Some("G1"));
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
    }

    // ── Connect ──────────────────────────────────────────────────

    #[tokio::test]
    async fn concurrent_connects_share_one_socket() {
        let server = TestServer::spawn().await;
        let manager = ConnectionManager::new(server.url.clone(), fast_config());

        let (a, b) = tokio::join!(manager.connect(), manager.connect());
        a.unwrap();
        b.unwrap();
        manager.connect().await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.accepted.load(Ordering::SeqCst), 1);
        assert!(manager.is_connected());
    }

    #[tokio::test]
    async fn connect_to_closed_port_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let config = ReconnectConfig {
            max_attempts: 0,
            ..fast_config()
        };
        let manager =
            ConnectionManager::new(Url::parse(&format!("ws://{addr}/ws")).unwrap(), config);
        let mut events = manager.events();

        let err = manager.connect().await.unwrap_err();
        assert!(matches!(err, Error::WebSocketConnect(_)), "got {err:?}");
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
        assert_eq!(
            next_event(&mut events).await,
            ConnectionEvent::ReconnectExhausted { attempts: 0 }
        );
    }

    /// Accepts TCP connections and holds them open without ever
    /// answering the WebSocket handshake.
    async fn silent_listener() -> (Url, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((tcp, _)) = listener.accept().await {
                held.push(tcp);
            }
        });
        (Url::parse(&format!("ws://{addr}/ws")).unwrap(), task)
    }

    #[tokio::test]
    async fn unanswered_handshake_times_out() {
        let (url, task) = silent_listener().await;
        let config = ReconnectConfig {
            connect_timeout: Duration::from_millis(200),
            max_attempts: 0,
            ..fast_config()
        };
        let manager = ConnectionManager::new(url, config);

        let err = manager.connect().await.unwrap_err();
        assert!(
            matches!(err, Error::Timeout { timeout_ms: 200 }),
            "got {err:?}"
        );
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
        task.abort();
    }

    #[tokio::test]
    async fn waiter_on_a_failing_attempt_gets_an_error() {
        let (url, task) = silent_listener().await;
        let config = ReconnectConfig {
            connect_timeout: Duration::from_millis(200),
            max_attempts: 0,
            ..fast_config()
        };
        let manager = ConnectionManager::new(url, config);

        let (first, second) = tokio::join!(manager.connect(), manager.connect());
        assert!(
            matches!(first, Err(Error::Timeout { timeout_ms: 200 })),
            "got {first:?}"
        );
        assert!(
            matches!(second, Err(Error::WebSocketConnect(_))),
            "got {second:?}"
        );
        assert!(!manager.is_connected());
        task.abort();
    }

    #[tokio::test]
    async fn failed_connect_after_disconnect_is_not_reported_as_exhausted() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let manager =
            ConnectionManager::new(Url::parse(&format!("ws://{addr}/ws")).unwrap(), fast_config());
        let mut events = manager.events();

        manager.disconnect();
        manager.connect().await.unwrap_err();

        // Long enough for any scheduled retry at the fast base delay.
        tokio::time::sleep(Duration::from_millis(200)).await;
        loop {
            match events.try_recv() {
                Ok(ConnectionEvent::ReconnectExhausted { attempts }) => {
                    panic!("explicit disconnect reported as exhausted after {attempts} attempts")
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);

        // A reset re-arms the budget and the notice.
        manager.reset();
        manager.connect().await.unwrap_err();
        assert_eq!(
            wait_for_event(&mut events, |e| matches!(
                e,
                ConnectionEvent::ReconnectExhausted { .. }
            ))
            .await,
            ConnectionEvent::ReconnectExhausted { attempts: 5 }
        );
    }

    // ── Dispatch ─────────────────────────────────────────────────

    #[tokio::test]
    async fn messages_reach_topic_and_all_listeners() {
        let server = TestServer::spawn().await;
        let manager = ConnectionManager::new(server.url.clone(), fast_config());
        manager.connect().await.unwrap();

        let (zone_tx, mut zone_rx) = mpsc::unbounded_channel();
        let (all_tx, mut all_rx) = mpsc::unbounded_channel();
        let (admin_tx, mut admin_rx) = mpsc::unbounded_channel::<ServerMessage>();

        let _zone = manager.on_message(MessageTopic::ZoneUpdate, move |msg| {
            let _ = zone_tx.send(msg.clone());
        });
        let _all = manager.on_message(MessageTopic::All, move |msg| {
            let _ = all_tx.send(msg.clone());
        });
        let _admin = manager.on_message(MessageTopic::AdminUpdate, move |msg| {
            let _ = admin_tx.send(msg.clone());
        });

        server.send("definitely not json");
        server.send(ZONE_UPDATE);

        let zone = tokio::time::timeout(Duration::from_secs(5), zone_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(zone.topic(), MessageTopic::ZoneUpdate);
        let all = tokio::time::timeout(Duration::from_secs(5), all_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(all, zone);

        // The garbage frame was dropped without taking the socket down.
        assert!(manager.is_connected());
        assert!(admin_rx.try_recv().is_err());
        assert!(zone_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn disposed_listener_stops_receiving() {
        let server = TestServer::spawn().await;
        let manager = ConnectionManager::new(server.url.clone(), fast_config());
        manager.connect().await.unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let first = manager.on_message(MessageTopic::ZoneUpdate, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _second = manager.on_message(MessageTopic::ZoneUpdate, move |_| {
            let _ = tx.send(());
        });

        assert!(first.dispose());
        assert_eq!(manager.listener_count(MessageTopic::ZoneUpdate), 1);

        server.send(ZONE_UPDATE);
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    // ── Close & reconnect ────────────────────────────────────────

    #[tokio::test]
    async fn abnormal_close_clears_subscriptions_and_reconnects() {
        let mut server = TestServer::spawn().await;
        let manager = ConnectionManager::new(server.url.clone(), fast_config());
        let mut events = manager.events();
        manager.connect().await.unwrap();
        assert_eq!(next_event(&mut events).await, ConnectionEvent::Connected);

        manager.subscribe_to_gate("G1");
        server.next_frame().await;
        assert_eq!(manager.current_subscriptions(), vec!["G1"]);

        server.control.send(ServerCmd::Drop).unwrap();

        assert_eq!(
            next_event(&mut events).await,
            ConnectionEvent::Disconnected {
                code: CLOSE_ABNORMAL
            }
        );
        assert!(manager.current_subscriptions().is_empty());
        assert_eq!(
            next_event(&mut events).await,
            ConnectionEvent::ReconnectScheduled {
                attempt: 1,
                delay: Duration::from_millis(20)
            }
        );

        assert_eq!(next_event(&mut events).await, ConnectionEvent::Connected);
        assert!(manager.is_connected());
        assert_eq!(manager.reconnect_attempts(), 0);
        // Not restored automatically.
        assert!(manager.current_subscriptions().is_empty());
        assert_eq!(server.accepted.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn clean_server_close_does_not_reconnect() {
        let server = TestServer::spawn().await;
        let manager = ConnectionManager::new(server.url.clone(), fast_config());
        let mut events = manager.events();
        manager.connect().await.unwrap();
        assert_eq!(next_event(&mut events).await, ConnectionEvent::Connected);

        server.control.send(ServerCmd::Close(1000)).unwrap();

        assert_eq!(
            next_event(&mut events).await,
            ConnectionEvent::Disconnected { code: 1000 }
        );
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(events.try_recv().is_err());
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
        assert_eq!(server.accepted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reconnect_gives_up_after_five_attempts() {
        let server = TestServer::spawn().await;
        let config = ReconnectConfig {
            base_delay: Duration::from_millis(10),
            ..fast_config()
        };
        let manager = ConnectionManager::new(server.url.clone(), config);
        let mut events = manager.events();
        manager.connect().await.unwrap();

        server.shutdown();

        let mut delays = Vec::new();
        loop {
            match next_event(&mut events).await {
                ConnectionEvent::ReconnectScheduled { attempt, delay } => {
                    delays.push((attempt, delay));
                }
                ConnectionEvent::ReconnectExhausted { attempts } => {
                    assert_eq!(attempts, 5);
                    break;
                }
                _ => {}
            }
        }

        let expected: Vec<(u32, Duration)> = (1..=5)
            .map(|n| (n, Duration::from_millis(10 * u64::from(n))))
            .collect();
        assert_eq!(delays, expected);

        // No sixth attempt.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(events.try_recv().is_err());
        assert_eq!(manager.reconnect_attempts(), 5);
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn disconnect_is_a_hard_reset() {
        let mut server = TestServer::spawn().await;
        let manager = ConnectionManager::new(server.url.clone(), fast_config());
        manager.connect().await.unwrap();
        let mut events = manager.events();

        manager.subscribe_to_gate("G1");
        server.next_frame().await;
        let _listener = manager.on_message(MessageTopic::All, |_| {});

        manager.disconnect();

        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
        assert!(manager.current_subscriptions().is_empty());
        assert_eq!(manager.current_gate(), None);
        assert_eq!(manager.listener_count(MessageTopic::All), 0);
        assert_eq!(manager.reconnect_attempts(), 5);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(events.try_recv().is_err(), "no reconnect after disconnect");

        manager.reset();
        assert_eq!(manager.reconnect_attempts(), 0);
        manager.connect().await.unwrap();
        assert!(manager.is_connected());
    }
}
