// ── Audit aggregator ──
//
// Subscribes to every gate, turns admin assertions and zone occupancy
// changes into audit entries, and keeps the bounded log persisted and
// published. The filtering rules live in `AuditFeed`; this type wires
// them to the connection, storage and subscribers.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::Utc;
use strum::Display;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use parkline_api::{
    ConnectionManager, ListenerHandle, ListenerRegistry, MessageListener, MessageTopic,
    ServerMessage,
};

use super::entry::AuditLogEntry;
use super::feed::{AuditFeed, Outcome};
use crate::config::AuditConfig;
use crate::error::CoreError;
use crate::persist::{self, KeyValueStore, LoadOutcome};
use crate::stream::{LogSnapshot, LogStream};

/// Disposer returned by [`AuditAggregator::subscribe`].
pub type LogSubscription = ListenerHandle<(), [AuditLogEntry]>;

/// Lifecycle of the aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum AggregatorState {
    Uninitialized,
    Initializing,
    /// Initialized; zone updates are still being ignored.
    WarmingUp,
    Steady,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Uninitialized,
    Initializing,
    Ready,
}

// ── AuditAggregator ──────────────────────────────────────────────────

/// Cheaply cloneable handle to the audit log service.
#[derive(Clone)]
pub struct AuditAggregator {
    inner: Arc<Inner>,
}

struct Inner {
    connection: ConnectionManager,
    store: Arc<dyn KeyValueStore>,
    config: AuditConfig,
    state: Mutex<State>,
    subscribers: ListenerRegistry<(), [AuditLogEntry]>,
    snapshot: watch::Sender<LogSnapshot>,
}

struct State {
    feed: AuditFeed,
    phase: Phase,
    gates: Vec<String>,
    listeners: Vec<MessageListener>,
}

impl AuditAggregator {
    /// Create the aggregator and load any unexpired persisted log.
    /// Does NOT subscribe; call [`initialize`](Self::initialize).
    pub fn new(
        connection: ConnectionManager,
        store: Arc<dyn KeyValueStore>,
        config: AuditConfig,
    ) -> Self {
        let mut feed = AuditFeed::new(config.clone());

        match persist::load_logs(store.as_ref(), &config.storage_key, config.expiry, Utc::now()) {
            Ok(LoadOutcome::Loaded(logs)) => {
                let count = logs.len();
                if feed.restore(logs) {
                    info!(count, "restored audit log from storage");
                }
            }
            Ok(LoadOutcome::Expired | LoadOutcome::Corrupt | LoadOutcome::Missing) => {}
            Err(e) => warn!(error = %e, "failed to load audit log from storage"),
        }

        let (snapshot, _) = watch::channel(Arc::new(feed.entries().to_vec()));

        Self {
            inner: Arc::new(Inner {
                connection,
                store,
                config,
                state: Mutex::new(State {
                    feed,
                    phase: Phase::Uninitialized,
                    gates: Vec::new(),
                    listeners: Vec::new(),
                }),
                subscribers: ListenerRegistry::new(),
                snapshot,
            }),
        }
    }

    pub fn config(&self) -> &AuditConfig {
        &self.inner.config
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.inner.connection
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Connect if needed, subscribe every gate, and start listening.
    ///
    /// Idempotent: a second call while initializing or initialized is a
    /// no-op. On failure the aggregator stays uninitialized.
    pub async fn initialize(&self, gate_ids: &[String]) -> Result<(), CoreError> {
        {
            let mut state = self.inner.lock();
            if state.phase != Phase::Uninitialized {
                debug!("audit aggregator already initialized, skipping");
                return Ok(());
            }
            state.phase = Phase::Initializing;
        }

        info!(gates = ?gate_ids, "initializing audit aggregator");

        let connection = &self.inner.connection;
        if !connection.is_connected() {
            if let Err(e) = connection.connect().await {
                error!(error = %e, "audit aggregator failed to initialize");
                let mut state = self.inner.lock();
                if state.phase == Phase::Initializing {
                    state.phase = Phase::Uninitialized;
                }
                let mut err = CoreError::from(e);
                if let CoreError::ConnectionFailed { url, .. } = &mut err {
                    *url = connection.url().to_string();
                }
                return Err(err);
            }
        }

        if self.inner.lock().phase != Phase::Initializing {
            debug!("audit aggregator destroyed during initialization");
            return Ok(());
        }

        for gate_id in gate_ids {
            connection.subscribe_to_gate(gate_id);
        }

        let admin = connection.on_message(
            MessageTopic::AdminUpdate,
            message_handler(Arc::downgrade(&self.inner)),
        );
        let zone = connection.on_message(
            MessageTopic::ZoneUpdate,
            message_handler(Arc::downgrade(&self.inner)),
        );

        let mut state = self.inner.lock();
        state.gates = gate_ids.to_vec();
        state.listeners = vec![admin, zone];
        state.feed.start_warm_up(Instant::now());
        state.phase = Phase::Ready;

        info!(
            gates = state.gates.len(),
            logs = state.feed.len(),
            warm_up_ms = u64::try_from(self.inner.config.warm_up.as_millis()).unwrap_or(u64::MAX),
            "audit aggregator initialized"
        );
        Ok(())
    }

    /// Dispose listeners, unsubscribe the recorded gates, and drop all
    /// in-memory state. The aggregator can be initialized again afterwards.
    /// Persisted entries are left in storage.
    pub fn destroy(&self) {
        let (listeners, gates) = {
            let mut state = self.inner.lock();
            state.feed.reset();
            state.phase = Phase::Uninitialized;
            self.inner.snapshot.send_replace(Arc::new(Vec::new()));
            (
                std::mem::take(&mut state.listeners),
                std::mem::take(&mut state.gates),
            )
        };

        for listener in listeners {
            listener.dispose();
        }
        for gate_id in &gates {
            self.inner.connection.unsubscribe_from_gate(gate_id);
        }
        self.inner.subscribers.clear();

        info!(gates = gates.len(), "audit aggregator destroyed");
    }

    // ── Log access ───────────────────────────────────────────────

    /// Register `callback` for every log change. It is invoked right away
    /// with the current log.
    pub fn subscribe<F>(&self, callback: F) -> LogSubscription
    where
        F: Fn(&[AuditLogEntry]) + Send + Sync + 'static,
    {
        let callback = Arc::new(callback);
        let registered = Arc::clone(&callback);
        let handle = self
            .inner
            .subscribers
            .register((), move |logs: &[AuditLogEntry]| registered(logs));

        let current = self.inner.snapshot.borrow().clone();
        callback(current.as_slice());
        debug!(subscribers = self.inner.subscribers.len(), "audit log subscriber added");
        handle
    }

    /// Copy of the log, newest first.
    pub fn logs(&self) -> Vec<AuditLogEntry> {
        self.inner.lock().feed.entries().to_vec()
    }

    pub fn log_stream(&self) -> LogStream {
        LogStream::new(self.inner.snapshot.subscribe())
    }

    /// Empty the log, persist the empty log, and notify subscribers.
    pub fn clear_logs(&self) {
        let snapshot = {
            let mut state = self.inner.lock();
            state.feed.clear_entries();
            self.inner.persist(state.feed.entries());
            self.inner.publish(&state)
        };
        info!("audit log cleared");
        self.inner.notify(&snapshot);
    }

    pub fn state(&self) -> AggregatorState {
        let state = self.inner.lock();
        match state.phase {
            Phase::Uninitialized => AggregatorState::Uninitialized,
            Phase::Initializing => AggregatorState::Initializing,
            Phase::Ready if state.feed.is_warming_up(Instant::now()) => AggregatorState::WarmingUp,
            Phase::Ready => AggregatorState::Steady,
        }
    }

    pub fn is_initialized(&self) -> bool {
        matches!(
            self.state(),
            AggregatorState::WarmingUp | AggregatorState::Steady
        )
    }

    /// Gates subscribed by the last successful `initialize`.
    pub fn subscribed_gates(&self) -> Vec<String> {
        self.inner.lock().gates.clone()
    }
}

fn message_handler(inner: Weak<Inner>) -> impl Fn(&ServerMessage) + Send + Sync + 'static {
    move |message: &ServerMessage| {
        if let Some(inner) = inner.upgrade() {
            inner.handle_message(message);
        }
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle_message(&self, message: &ServerMessage) {
        let snapshot = {
            let mut state = self.lock();
            if state.phase != Phase::Ready {
                return;
            }

            let outcome = match message {
                ServerMessage::AdminUpdate(update) => {
                    let outcome = state.feed.apply_admin(update);
                    debug!(
                        action = %update.action,
                        target_id = %update.target_id,
                        admin_id = %update.admin_id,
                        %outcome,
                        "admin update"
                    );
                    outcome
                }
                ServerMessage::ZoneUpdate(zone) => {
                    let outcome = state.feed.apply_zone(zone, Instant::now(), Utc::now());
                    if outcome != Outcome::Throttled {
                        debug!(zone_id = %zone.id, occupied = zone.occupied, %outcome, "zone update");
                    }
                    outcome
                }
            };

            if !outcome.is_added() {
                return;
            }

            self.persist(state.feed.entries());
            self.publish(&state)
        };

        self.notify(&snapshot);
    }

    /// Write the log through to the store. Runs on the socket reader with
    /// the state lock held, so storage is never behind what subscribers
    /// see. Stores are small local writes; a slow store delays dispatch.
    fn persist(&self, entries: &[AuditLogEntry]) {
        if let Err(e) = persist::save_logs(
            self.store.as_ref(),
            &self.config.storage_key,
            entries,
            Utc::now(),
        ) {
            warn!(error = %e, "failed to persist audit log");
        }
    }

    /// Refresh the watch snapshot. Called with the state lock held so the
    /// snapshot order matches the log order.
    fn publish(&self, state: &State) -> LogSnapshot {
        let snapshot = Arc::new(state.feed.entries().to_vec());
        self.snapshot.send_replace(Arc::clone(&snapshot));
        snapshot
    }

    /// Invoke subscribers. Never called with the state lock held.
    fn notify(&self, snapshot: &LogSnapshot) {
        let notified = self.subscribers.emit(&(), snapshot.as_slice());
        debug!(entries = snapshot.len(), notified, "audit log updated");
    }
}
