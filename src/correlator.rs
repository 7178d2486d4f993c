//! Correlator: wait, with a deadline, for the search result matching an
//! identifier.
//!
//! # Design
//!
//! The broker's read cursor is shared by the whole process. If each waiter
//! read from it directly, a waiter scanning for its own identifier would
//! consume, and lose, results belonging to other waiters. Instead:
//!
//! ```text
//!            BrokerClient::next_message
//!                       │  (one owner)
//!                       ▼
//!               ┌───────────────┐
//!               │  reader task  │── malformed / unknown id → discarded
//!               └───────┬───────┘
//!                       │ demultiplex by search_id
//!          ┌────────────┼────────────┐
//!          ▼            ▼            ▼
//!       slot(a)      slot(b)      slot(c)      (oneshot per pending wait)
//!          │            │            │
//!     PendingWait  PendingWait  PendingWait
//! ```
//!
//! A caller [`register`](Correlator::register)s its identifier *before* the
//! search is triggered, then [`wait`](PendingWait::wait)s on the returned
//! handle. Each wait ends in exactly one terminal [`Outcome`]:
//!
//! - `Matched`: the result arrived; its content is returned.
//! - `TimedOut`: the deadline passed; the configured fallback text is returned.
//! - `Canceled`: the caller's token fired or the correlator shut down.
//!
//! Dropping a [`PendingWait`] releases its slot, so an aborted request never
//! leaves an entry behind. Duplicate deliveries find no slot and are dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::BrokerClient;
use crate::config::Config;
use crate::error::RelayError;
use crate::models::{SearchIdentifier, SearchResult};

/// Terminal state of one correlation wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Matched,
    TimedOut,
    Canceled,
}

/// Result of one correlation wait.
#[derive(Debug, Clone)]
pub struct Correlation {
    pub search_id: SearchIdentifier,
    pub outcome: Outcome,
    /// Result content when matched, fallback text when timed out, empty when
    /// canceled.
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct CorrelatorSettings {
    /// Upper bound on a single read from the cursor.
    pub poll_interval: Duration,
    /// Returned as content when a wait times out.
    pub timeout_fallback: String,
}

impl From<&Config> for CorrelatorSettings {
    fn from(config: &Config) -> Self {
        Self {
            poll_interval: config.correlation.poll_interval(),
            timeout_fallback: config.messages.timeout_fallback.clone(),
        }
    }
}

struct Slot {
    ticket: u64,
    tx: oneshot::Sender<String>,
}

struct Registry {
    open: bool,
    /// Set when the reader gave up on the cursor.
    failure: Option<String>,
    next_ticket: u64,
    slots: HashMap<SearchIdentifier, Slot>,
}

type SharedRegistry = Arc<Mutex<Registry>>;

fn lock(registry: &SharedRegistry) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(|e| e.into_inner())
}

/// Closes the registry and drops every slot, resolving all pending waits to
/// [`Outcome::Canceled`].
fn close_registry(registry: &SharedRegistry) -> usize {
    let mut reg = lock(registry);
    reg.open = false;
    let pending = reg.slots.len();
    reg.slots.clear();
    pending
}

/// Roughly thirty years; stands in for deadlines too far out to represent.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// The instant `timeout` from now, clamped instead of overflowing.
pub fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout).unwrap_or(now + FAR_FUTURE)
}

pub struct Correlator {
    registry: SharedRegistry,
    settings: CorrelatorSettings,
    stop: CancellationToken,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Correlator {
    /// Spawn the reader task. From here on the reader is the only consumer
    /// of `broker`'s cursor.
    pub fn start(broker: Arc<BrokerClient>, settings: CorrelatorSettings) -> Arc<Self> {
        let registry = Arc::new(Mutex::new(Registry {
            open: true,
            failure: None,
            next_ticket: 0,
            slots: HashMap::new(),
        }));
        let stop = CancellationToken::new();

        let reader = tokio::spawn(read_loop(
            broker,
            registry.clone(),
            settings.poll_interval,
            stop.clone(),
        ));

        Arc::new(Self {
            registry,
            settings,
            stop,
            reader: Mutex::new(Some(reader)),
        })
    }

    /// Open a slot for `id`.
    ///
    /// Fails with [`RelayError::Validation`] if `id` is already awaited,
    /// with [`RelayError::Canceled`] after shutdown, and with
    /// [`RelayError::BrokerRead`] once the reader has given up on the cursor.
    pub fn register(&self, id: SearchIdentifier) -> Result<PendingWait, RelayError> {
        let (tx, rx) = oneshot::channel();
        let mut reg = lock(&self.registry);

        if !reg.open {
            return Err(RelayError::Canceled);
        }
        if let Some(reason) = &reg.failure {
            return Err(RelayError::BrokerRead(format!(
                "correlation reader stopped: {}",
                reason
            )));
        }
        if reg.slots.contains_key(&id) {
            return Err(RelayError::Validation(format!(
                "search id {} is already awaited",
                id
            )));
        }

        reg.next_ticket += 1;
        let ticket = reg.next_ticket;
        reg.slots.insert(id.clone(), Slot { ticket, tx });
        debug!(search_id = %id, "correlation slot registered");

        Ok(PendingWait {
            id,
            ticket,
            rx,
            registry: self.registry.clone(),
            fallback: self.settings.timeout_fallback.clone(),
        })
    }

    /// Register `id` and wait for its result.
    ///
    /// Only results published after this call can match.
    pub async fn await_result(
        &self,
        id: SearchIdentifier,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<Correlation, RelayError> {
        Ok(self.register(id)?.wait(deadline, cancel).await)
    }

    /// Number of registered, unresolved waits.
    pub fn pending_count(&self) -> usize {
        lock(&self.registry).slots.len()
    }

    /// Stop the reader and resolve every pending wait to
    /// [`Outcome::Canceled`]. The broker stays open; its owner closes it.
    pub async fn shutdown(&self) {
        self.stop.cancel();

        let reader = self
            .reader
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = reader {
            if let Err(e) = handle.await {
                warn!(error = %e, "correlation reader ended abnormally");
            }
        }

        let canceled = close_registry(&self.registry);
        info!(canceled, "correlator stopped");
    }
}

impl Drop for Correlator {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// A registered wait for one identifier.
///
/// Dropping it without waiting deregisters the slot.
pub struct PendingWait {
    id: SearchIdentifier,
    ticket: u64,
    rx: oneshot::Receiver<String>,
    registry: SharedRegistry,
    fallback: String,
}

impl PendingWait {
    /// Wait until the result arrives, `deadline` passes, or `cancel` fires.
    pub async fn wait(mut self, deadline: Instant, cancel: &CancellationToken) -> Correlation {
        let (outcome, content) = tokio::select! {
            biased;
            _ = cancel.cancelled() => (Outcome::Canceled, String::new()),
            delivered = &mut self.rx => match delivered {
                Ok(content) => (Outcome::Matched, content),
                // Sender dropped: the correlator shut down
                Err(_) => (Outcome::Canceled, String::new()),
            },
            _ = tokio::time::sleep_until(deadline) => (Outcome::TimedOut, self.fallback.clone()),
        };

        debug!(search_id = %self.id, ?outcome, "correlation resolved");

        Correlation {
            search_id: self.id.clone(),
            outcome,
            content,
        }
    }
}

impl Drop for PendingWait {
    fn drop(&mut self) {
        let mut reg = lock(&self.registry);
        // Only remove our own slot; the id may have been re-registered
        if reg.slots.get(&self.id).map(|s| s.ticket) == Some(self.ticket) {
            reg.slots.remove(&self.id);
        }
    }
}

/// Consecutive failed reads after which the cursor is treated as lost.
const MAX_CONSECUTIVE_READ_FAILURES: u32 = 5;

async fn read_loop(
    broker: Arc<BrokerClient>,
    registry: SharedRegistry,
    poll_interval: Duration,
    stop: CancellationToken,
) {
    debug!(topic = %broker.topic(), "correlation reader started");
    let mut failures = 0u32;

    loop {
        let next = tokio::select! {
            _ = stop.cancelled() => break,
            next = broker.next_message(poll_interval) => next,
        };

        match next {
            Ok(Some(payload)) => {
                failures = 0;
                dispatch(&registry, &payload);
            }
            Ok(None) => failures = 0,
            Err(RelayError::BrokerClosed) => {
                info!("broker closed; correlation reader exiting");
                break;
            }
            Err(e) => {
                failures += 1;
                if failures >= MAX_CONSECUTIVE_READ_FAILURES {
                    // Pending waits run out their deadlines; new ones are refused
                    error!(
                        error = %e,
                        failures,
                        "broker cursor lost; correlation reader stopping"
                    );
                    lock(&registry).failure = Some(e.to_string());
                    return;
                }
                warn!(error = %e, failures, "broker read failed");
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
        }
    }

    close_registry(&registry);
}

/// Route one topic message to its waiter. Returns whether a waiter took it.
fn dispatch(registry: &SharedRegistry, payload: &[u8]) -> bool {
    let result = match SearchResult::from_payload(payload) {
        Ok(result) => result,
        Err(e) => {
            warn!(error = %e, bytes = payload.len(), "skipping malformed topic message");
            return false;
        }
    };

    let slot = lock(registry).slots.remove(&result.search_id);
    match slot {
        Some(slot) => {
            if slot.tx.send(result.content).is_err() {
                debug!(search_id = %result.search_id, "waiter left before delivery");
                return false;
            }
            true
        }
        None => {
            debug!(search_id = %result.search_id, "no pending wait; discarding result");
            false
        }
    }
}
