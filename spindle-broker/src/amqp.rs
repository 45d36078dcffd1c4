use crate::{Ack, BrokerError, JobBroker, JobDelivery};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind};
use spindle_core::config::BrokerConfig;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// lapin-backed broker driver.
///
/// Declares one fanout exchange and one durable, non-exclusive,
/// non-auto-delete queue bound to it; consumes with explicit ack under a
/// prefetch bound.
pub struct AmqpBroker {
    channel: Channel,
    queue: String,
    exchange: String,
    consumer: Mutex<Option<Consumer>>,
    consumer_tag: String,
}

impl AmqpBroker {
    pub async fn connect(uri: &str, config: &BrokerConfig) -> Result<Self, BrokerError> {
        info!(queue = %config.queue, exchange = %config.exchange, "Connecting to broker");
        let connection = Connection::connect(uri, ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        channel
            .exchange_declare(
                &config.exchange,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        channel
            .queue_declare(
                &config.queue,
                QueueDeclareOptions {
                    durable: true,
                    exclusive: false,
                    auto_delete: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        channel
            .queue_bind(
                &config.queue,
                &config.exchange,
                "",
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        channel
            .basic_qos(config.prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        Ok(Self {
            channel,
            queue: config.queue.clone(),
            exchange: config.exchange.clone(),
            consumer: Mutex::new(None),
            consumer_tag: format!("spindle-worker-{}", std::process::id()),
        })
    }
}

struct AmqpAck(lapin::acker::Acker);

#[async_trait]
impl Ack for AmqpAck {
    async fn ack(self: Box<Self>) -> Result<(), BrokerError> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::Ack(e.to_string()))
    }
}

#[async_trait]
impl JobBroker for AmqpBroker {
    async fn publish(&self, body: &[u8]) -> Result<(), BrokerError> {
        self.channel
            .basic_publish(
                &self.exchange,
                "",
                BasicPublishOptions::default(),
                body,
                BasicProperties::default(),
            )
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))?
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))?;
        Ok(())
    }

    async fn queue_depth(&self) -> Result<u64, BrokerError> {
        // Passive declare reports the live message count.
        let queue = self
            .channel
            .queue_declare(
                &self.queue,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        debug!(depth = queue.message_count(), "Broker queue depth");
        Ok(u64::from(queue.message_count()))
    }

    async fn next(&self) -> Result<Option<JobDelivery>, BrokerError> {
        let mut guard = self.consumer.lock().await;
        if guard.is_none() {
            let consumer = self
                .channel
                .basic_consume(
                    &self.queue,
                    &self.consumer_tag,
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| BrokerError::Consume(e.to_string()))?;
            *guard = Some(consumer);
        }

        let consumer = guard.as_mut().expect("consumer just installed");
        match consumer.next().await {
            Some(Ok(delivery)) => Ok(Some(JobDelivery::new(
                delivery.data,
                Box::new(AmqpAck(delivery.acker)),
            ))),
            Some(Err(e)) => Err(BrokerError::Consume(e.to_string())),
            None => Ok(None),
        }
    }
}
