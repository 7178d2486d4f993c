//! AMQP transport for the broker client, built on `lapin`.
//!
//! A topic maps to a durable fanout exchange. Publishing uses a channel in
//! confirm mode, so a send only succeeds once the broker has acknowledged
//! the message. Messages are marked persistent and carry a `source` header
//! naming the producing service.
//!
//! The read cursor is an exclusive, auto-delete, server-named queue bound to
//! the exchange when the transport connects. Each process therefore sees
//! every result published after it started, and nothing published before.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::{
        BasicConsumeOptions, BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind,
};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::broker::Transport;

/// AMQP `delivery_mode` marking a message persistent.
const PERSISTENT: u8 = 2;

/// Value of the `source` header stamped on every published result.
const SOURCE: &str = "search-service";

/// Persistent JSON, tagged with the producing service.
fn message_properties() -> BasicProperties {
    let mut headers = FieldTable::default();
    headers.insert("source".into(), AMQPValue::LongString(SOURCE.into()));

    BasicProperties::default()
        .with_delivery_mode(PERSISTENT)
        .with_content_type("application/json".into())
        .with_headers(headers)
}

pub struct AmqpTransport {
    connection: Connection,
    publish_channel: Channel,
    consumer: Mutex<Consumer>,
}

impl AmqpTransport {
    /// Connect to the first reachable endpoint in `urls` and subscribe to
    /// `topic`.
    pub async fn connect(urls: &[String], topic: &str) -> Result<Self> {
        let mut last_err = None;

        for url in urls {
            match Connection::connect(url, ConnectionProperties::default()).await {
                Ok(connection) => {
                    info!(endpoint = %url, "connected to broker");
                    return Self::setup(connection, topic).await;
                }
                Err(e) => {
                    warn!(endpoint = %url, error = %e, "broker endpoint unreachable");
                    last_err = Some(e);
                }
            }
        }

        Err(match last_err {
            Some(e) => anyhow!("no broker endpoint reachable: {}", e),
            None => anyhow!("no broker endpoints configured"),
        })
    }

    async fn setup(connection: Connection, topic: &str) -> Result<Self> {
        let publish_channel = connection
            .create_channel()
            .await
            .context("Failed to create publish channel")?;
        publish_channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .context("Failed to enable publisher confirms")?;
        publish_channel
            .exchange_declare(
                topic,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .with_context(|| format!("Failed to declare exchange {}", topic))?;

        let consume_channel = connection
            .create_channel()
            .await
            .context("Failed to create consume channel")?;
        let queue = consume_channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .context("Failed to declare subscription queue")?;
        consume_channel
            .queue_bind(
                queue.name().as_str(),
                topic,
                "",
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .with_context(|| format!("Failed to bind subscription to {}", topic))?;
        let consumer = consume_channel
            .basic_consume(
                queue.name().as_str(),
                "",
                BasicConsumeOptions {
                    no_ack: true,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .context("Failed to start consumer")?;

        info!(topic, queue = %queue.name().as_str(), "subscribed at latest position");

        Ok(Self {
            connection,
            publish_channel,
            consumer: Mutex::new(consumer),
        })
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn send(&self, topic: &str, payload: &[u8]) -> Result<()> {
        let confirmation = self
            .publish_channel
            .basic_publish(
                topic,
                "",
                BasicPublishOptions::default(),
                payload,
                message_properties(),
            )
            .await
            .context("Failed to publish message")?
            .await
            .context("Failed to await publisher confirm")?;

        if confirmation.is_nack() {
            bail!("broker rejected message on {}", topic);
        }
        Ok(())
    }

    async fn receive(&self, max_wait: Duration) -> Result<Option<Vec<u8>>> {
        let mut consumer = self.consumer.lock().await;
        match tokio::time::timeout(max_wait, consumer.next()).await {
            Err(_) => Ok(None),
            Ok(None) => bail!("broker subscription ended"),
            Ok(Some(Err(e))) => Err(e).context("Failed to receive message"),
            Ok(Some(Ok(delivery))) => Ok(Some(delivery.data)),
        }
    }

    async fn close(&self) -> Result<()> {
        self.connection
            .close(200, "search-relay shutting down")
            .await
            .context("Failed to close broker connection")?;
        Ok(())
    }
}
