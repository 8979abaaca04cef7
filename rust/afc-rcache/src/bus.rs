// afc-rcache: Message-bus correlation protocol
//
// Workers return computed responses on a direct exchange. Every coordinator
// instance owns one exclusive, randomly named response queue bound with its
// own name as routing key; the queue name travels with each compute job so
// the worker knows where to publish.

use futures::StreamExt;
use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions, QueueDeleteOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use rand::Rng;
use tracing::error;

use crate::error::RcacheResult;
use crate::models::ReqRespKey;

/// Name of the direct exchange carrying response correlation records
pub const RMQ_EXCHANGE_NAME: &str = "RcacheExchange";

const QUEUE_NAME_PREFIX: &str = "afc_response_queue_";
const QUEUE_NAME_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Generates a per-instance response queue name
pub fn random_queue_name() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..10)
        .map(|_| QUEUE_NAME_CHARSET[rng.gen_range(0..QUEUE_NAME_CHARSET.len())] as char)
        .collect();
    format!("{QUEUE_NAME_PREFIX}{suffix}")
}

async fn open_channel(dsn: &str) -> RcacheResult<(Connection, Channel)> {
    let connection = Connection::connect(dsn, ConnectionProperties::default()).await?;
    let channel = connection.create_channel().await?;
    channel
        .exchange_declare(
            RMQ_EXCHANGE_NAME,
            ExchangeKind::Direct,
            ExchangeDeclareOptions::default(),
            FieldTable::default(),
        )
        .await?;
    Ok((connection, channel))
}

/// Publishes response correlation records toward one coordinator queue.
/// Used by workers and by tests standing in for workers.
pub struct BusSender {
    _connection: Connection,
    channel: Channel,
    queue_name: String,
}

impl BusSender {
    pub async fn connect(dsn: &str, queue_name: &str) -> RcacheResult<BusSender> {
        let (connection, channel) = open_channel(dsn).await?;
        Ok(BusSender {
            _connection: connection,
            channel,
            queue_name: queue_name.to_string(),
        })
    }

    /// Sends one correlation record; transient delivery, no confirm needed
    pub async fn send_response(&self, rrk: &ReqRespKey) -> RcacheResult<()> {
        let body = serde_json::to_vec(rrk)?;
        self.channel
            .basic_publish(
                RMQ_EXCHANGE_NAME,
                &self.queue_name,
                BasicPublishOptions::default(),
                &body,
                BasicProperties::default()
                    .with_content_type("application/json".into())
                    .with_delivery_mode(1),
            )
            .await?
            .await?;
        Ok(())
    }
}

/// Owns the coordinator's exclusive response queue and its consume loop
pub struct BusReceiver {
    _connection: Connection,
    channel: Channel,
    queue_name: String,
}

impl BusReceiver {
    /// Declares the exchange and an exclusive response queue bound with
    /// the queue's own name as routing key
    pub async fn connect(dsn: &str) -> RcacheResult<BusReceiver> {
        let (connection, channel) = open_channel(dsn).await?;
        let queue_name = random_queue_name();
        channel
            .queue_declare(
                &queue_name,
                QueueDeclareOptions {
                    exclusive: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        channel
            .queue_bind(
                &queue_name,
                RMQ_EXCHANGE_NAME,
                &queue_name,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(BusReceiver {
            _connection: connection,
            channel,
            queue_name,
        })
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Consumes correlation records until the connection drops, feeding
    /// each decoded record to `handler`. Decode failures are logged and
    /// the message dropped; responses are idempotent and the requester's
    /// deadline covers the loss.
    pub async fn run<F>(&self, mut handler: F) -> RcacheResult<()>
    where
        F: FnMut(ReqRespKey) + Send,
    {
        let mut consumer = self
            .channel
            .basic_consume(
                &self.queue_name,
                "rcache_reader",
                BasicConsumeOptions {
                    no_ack: true,
                    exclusive: true,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        while let Some(delivery) = consumer.next().await {
            let delivery = delivery?;
            match serde_json::from_slice::<ReqRespKey>(&delivery.data) {
                Ok(rrk) => handler(rrk),
                Err(err) => {
                    error!("Decode error on response record arrived from worker: {err}");
                }
            }
        }
        Ok(())
    }

    /// Deletes the response queue on graceful shutdown
    pub async fn close(&self) -> RcacheResult<()> {
        self.channel
            .queue_delete(&self.queue_name, QueueDeleteOptions::default())
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_name_shape() {
        let name = random_queue_name();
        assert!(name.starts_with(QUEUE_NAME_PREFIX));
        assert_eq!(name.len(), QUEUE_NAME_PREFIX.len() + 10);
        assert!(name[QUEUE_NAME_PREFIX.len()..]
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
    }

    #[test]
    fn test_queue_names_differ() {
        assert_ne!(random_queue_name(), random_queue_name());
    }
}
