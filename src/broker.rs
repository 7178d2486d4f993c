//! Broker client: durable publish plus one shared read cursor over a topic.
//!
//! The [`BrokerClient`] holds no business logic. It wraps a [`Transport`]
//! (AMQP in production, [`MemoryTransport`] for local runs and tests) and
//! adds the delivery guarantees every caller relies on:
//!
//! - **Bounded retries** with exponential backoff for failed sends.
//! - **Hard publish timeout** covering all attempts; on expiry the call fails
//!   with [`RelayError::PublishTimeout`] instead of hanging.
//! - **Outstanding-publish counter** used as a backpressure signal by the
//!   ingress health probe.
//! - **Explicit lifecycle**: constructed by the composition root, closed with
//!   [`BrokerClient::close`], which refuses new publishes and drains
//!   in-flight ones for a bounded grace period.
//!
//! # Read cursor
//!
//! [`BrokerClient::next_message`] reads from a single subscription positioned
//! at "latest": anything published before the subscription was opened is
//! never seen. Concurrent callers would compete for the same stream, so the
//! process must route all reads through one owner (see
//! [`crate::correlator`]).

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, Notify};
use tracing::{debug, info, warn};

use crate::amqp::AmqpTransport;
use crate::config::BrokerConfig;
use crate::correlator::deadline_after;
use crate::error::RelayError;

/// Raw message transport beneath the [`BrokerClient`].
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one payload and return once the broker has acknowledged it.
    async fn send(&self, topic: &str, payload: &[u8]) -> Result<()>;

    /// Wait up to `max_wait` for the next message on the subscription.
    ///
    /// Returns `Ok(None)` when nothing arrived in time.
    async fn receive(&self, max_wait: Duration) -> Result<Option<Vec<u8>>>;

    /// Close the underlying connection.
    async fn close(&self) -> Result<()>;
}

/// Publish behaviour for a [`BrokerClient`].
#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub topic: String,
    pub publish_timeout: Duration,
    pub max_retries: u32,
    pub retry_backoff: Duration,
}

impl From<&BrokerConfig> for BrokerSettings {
    fn from(config: &BrokerConfig) -> Self {
        Self {
            topic: config.topic.clone(),
            publish_timeout: config.publish_timeout(),
            max_retries: config.max_retries,
            retry_backoff: config.retry_backoff(),
        }
    }
}

pub struct BrokerClient {
    transport: Arc<dyn Transport>,
    settings: BrokerSettings,
    outstanding: AtomicUsize,
    closed: AtomicBool,
    drained: Notify,
}

impl BrokerClient {
    pub fn new(transport: Arc<dyn Transport>, settings: BrokerSettings) -> Self {
        Self {
            transport,
            settings,
            outstanding: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            drained: Notify::new(),
        }
    }

    /// Connect to the configured AMQP endpoints and open the read cursor.
    pub async fn open(config: &BrokerConfig) -> Result<Arc<Self>> {
        let transport = AmqpTransport::connect(&config.urls, &config.topic).await?;
        info!(topic = %config.topic, "broker client open");
        Ok(Arc::new(Self::new(Arc::new(transport), config.into())))
    }

    /// A client over a fresh in-process topic.
    pub fn in_memory(settings: BrokerSettings) -> Arc<Self> {
        let transport = MemoryTransport::new(&settings.topic);
        Arc::new(Self::new(Arc::new(transport), settings))
    }

    /// The topic this client's cursor is subscribed to.
    pub fn topic(&self) -> &str {
        &self.settings.topic
    }

    /// Number of publishes currently awaiting acknowledgment.
    pub fn outstanding_publishes(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Fails with [`RelayError::BrokerCapacity`] when outstanding publishes
    /// exceed `threshold`.
    pub fn check_capacity(&self, threshold: usize) -> Result<(), RelayError> {
        let outstanding = self.outstanding_publishes();
        if outstanding > threshold {
            Err(RelayError::BrokerCapacity {
                outstanding,
                threshold,
            })
        } else {
            Ok(())
        }
    }

    /// Publish one message durably.
    ///
    /// Retries failed sends up to `max_retries` times; the whole sequence is
    /// bounded by `publish_timeout`.
    pub async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), RelayError> {
        // Counted before the closed check so `close` either sees this
        // publish and waits for it, or this publish sees `closed`
        let _in_flight = InFlight::enter(self);
        if self.is_closed() {
            return Err(RelayError::BrokerClosed);
        }

        let timeout = self.settings.publish_timeout;

        match tokio::time::timeout(timeout, self.publish_with_retry(topic, payload)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(topic, ?timeout, "publish not acknowledged in time");
                Err(RelayError::PublishTimeout(timeout))
            }
        }
    }

    async fn publish_with_retry(&self, topic: &str, payload: &[u8]) -> Result<(), RelayError> {
        let mut last_err = None;

        for attempt in 0..=self.settings.max_retries {
            if attempt > 0 {
                // Exponential backoff: base, 2x, 4x, ... capped at 32x
                let delay = self
                    .settings
                    .retry_backoff
                    .saturating_mul(1u32 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            match self.transport.send(topic, payload).await {
                Ok(()) => {
                    debug!(topic, attempt, bytes = payload.len(), "publish acknowledged");
                    return Ok(());
                }
                Err(e) => {
                    warn!(topic, attempt, error = %e, "publish attempt failed");
                    last_err = Some(e);
                }
            }
        }

        Err(RelayError::BrokerPublish(
            last_err
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no publish attempts made".to_string()),
        ))
    }

    /// Read the next message from the shared cursor, waiting at most
    /// `max_wait`.
    pub async fn next_message(&self, max_wait: Duration) -> Result<Option<Vec<u8>>, RelayError> {
        if self.is_closed() {
            return Err(RelayError::BrokerClosed);
        }
        self.transport
            .receive(max_wait)
            .await
            .map_err(|e| RelayError::BrokerRead(e.to_string()))
    }

    /// Stop accepting publishes, wait up to `grace` for in-flight ones, then
    /// close the transport. Idempotent.
    pub async fn close(&self, grace: Duration) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let drain = async {
            loop {
                let notified = self.drained.notified();
                if self.outstanding_publishes() == 0 {
                    break;
                }
                notified.await;
            }
        };

        if tokio::time::timeout(grace, drain).await.is_err() {
            warn!(
                outstanding = self.outstanding_publishes(),
                "closing broker with publishes still in flight"
            );
        }

        self.transport.close().await?;
        info!(topic = %self.settings.topic, "broker client closed");
        Ok(())
    }
}

/// Counts one publish as outstanding for as long as it lives.
struct InFlight<'a> {
    client: &'a BrokerClient,
}

impl<'a> InFlight<'a> {
    fn enter(client: &'a BrokerClient) -> Self {
        client.outstanding.fetch_add(1, Ordering::SeqCst);
        Self { client }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.client.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.client.drained.notify_waiters();
        }
    }
}

// ============ In-memory transport ============

const MEMORY_TOPIC_CAPACITY: usize = 1024;

type Envelope = (String, Vec<u8>);

/// In-process topic bus with the same "latest" cursor semantics as the AMQP
/// transport.
///
/// Every [`MemoryTransport`] sharing a bus (see [`MemoryTransport::attach`])
/// sees every message sent after it subscribed, mirroring one exclusive
/// queue per process bound to a fanout exchange.
pub struct MemoryTransport {
    topic: String,
    sender: broadcast::Sender<Envelope>,
    cursor: Mutex<broadcast::Receiver<Envelope>>,
    closed: AtomicBool,
}

impl MemoryTransport {
    pub fn new(topic: &str) -> Self {
        let (sender, cursor) = broadcast::channel(MEMORY_TOPIC_CAPACITY);
        Self {
            topic: topic.to_string(),
            sender,
            cursor: Mutex::new(cursor),
            closed: AtomicBool::new(false),
        }
    }

    /// A new subscriber on the same bus, positioned at "latest".
    pub fn attach(&self) -> Self {
        Self {
            topic: self.topic.clone(),
            sender: self.sender.clone(),
            cursor: Mutex::new(self.sender.subscribe()),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, topic: &str, payload: &[u8]) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            bail!("memory transport is closed");
        }
        self.sender
            .send((topic.to_string(), payload.to_vec()))
            .map_err(|_| anyhow::anyhow!("no subscribers on topic {}", topic))?;
        Ok(())
    }

    async fn receive(&self, max_wait: Duration) -> Result<Option<Vec<u8>>> {
        let deadline = deadline_after(max_wait);
        let mut cursor = self.cursor.lock().await;

        loop {
            match tokio::time::timeout_at(deadline, cursor.recv()).await {
                Err(_) => return Ok(None),
                Ok(Ok((topic, payload))) if topic == self.topic => return Ok(Some(payload)),
                Ok(Ok(_)) => continue,
                Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                    warn!(skipped, "memory cursor lagged; messages dropped");
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => return Ok(None),
            }
        }
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
