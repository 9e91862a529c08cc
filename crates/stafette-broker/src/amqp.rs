//! AMQP 0-9-1 broker adapter.
//!
//! Declares the durable topic exchanges on connect, publishes with
//! persistent delivery mode and publisher confirms, and consumes with
//! manual acknowledgement. Each consumer gets its own channel with a
//! prefetch of one so a slow handler never starves acknowledged work.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind,
};
use tracing::{debug, info};

use crate::{
    error::BrokerError,
    message::{Acker, Delivery, MessageHeaders},
    Broker, DeliveryStream,
};
use stafette_core::{contracts, trace};

/// Persistent delivery mode per the AMQP basic properties table.
const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// AMQP broker adapter.
pub struct AmqpBroker {
    connection: Connection,
    channel: Channel,
    stage: String,
}

impl AmqpBroker {
    /// Connects, opens the publish channel, and declares both exchanges.
    ///
    /// `stage` identifies this process role in dead-letter headers
    /// (e.g. `worker-service`).
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Connection`] if the broker is unreachable or
    /// [`BrokerError::Declare`] if exchange declaration fails.
    pub async fn connect(url: &str, stage: impl Into<String>) -> Result<Self, BrokerError> {
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        declare_exchanges(&channel).await?;

        info!(exchange = contracts::EXCHANGE, dlq_exchange = contracts::DLQ_EXCHANGE, "broker connected");

        Ok(Self { connection, channel, stage: stage.into() })
    }

    async fn publish_on(
        channel: &Channel,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        headers: &MessageHeaders,
    ) -> Result<(), BrokerError> {
        let confirm = channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                BasicProperties::default()
                    .with_content_type("application/json".into())
                    .with_delivery_mode(DELIVERY_MODE_PERSISTENT)
                    .with_headers(field_table(headers)),
            )
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))?
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))?;

        if let Confirmation::Nack(_) = confirm {
            return Err(BrokerError::Publish(format!(
                "broker nacked publish on {exchange}/{routing_key}"
            )));
        }

        Ok(())
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn publish(
        &self,
        routing_key: &str,
        body: &[u8],
        headers: &MessageHeaders,
    ) -> Result<(), BrokerError> {
        Self::publish_on(&self.channel, contracts::EXCHANGE, routing_key, body, headers).await
    }

    async fn publish_dlq(
        &self,
        routing_key: &str,
        body: &[u8],
        original_error: &str,
        headers: &MessageHeaders,
    ) -> Result<(), BrokerError> {
        let headers = headers.dead_lettered(original_error, &self.stage);
        Self::publish_on(&self.channel, contracts::DLQ_EXCHANGE, routing_key, body, &headers).await
    }

    async fn open_consumer(
        &self,
        queue: &str,
        routing_key: &str,
    ) -> Result<Box<dyn DeliveryStream>, BrokerError> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        declare_exchanges(&channel).await?;

        // Dead-letter queue first, so failures always have somewhere to go.
        let dlq = contracts::dead_letter_queue(routing_key);
        declare_and_bind(&channel, &dlq, routing_key, contracts::DLQ_EXCHANGE).await?;
        declare_and_bind(&channel, queue, routing_key, contracts::EXCHANGE).await?;

        channel
            .basic_qos(1, BasicQosOptions::default())
            .await
            .map_err(|e| BrokerError::Consume(e.to_string()))?;

        let consumer = channel
            .basic_consume(
                queue,
                &format!("stafette-{queue}"),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Consume(e.to_string()))?;

        info!(queue, routing_key, "consumer channel opened");

        Ok(Box::new(AmqpDeliveryStream {
            consumer,
            channel,
            queue: queue.to_string(),
            stage: self.stage.clone(),
        }))
    }

    fn is_connected(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }
}

struct AmqpDeliveryStream {
    consumer: Consumer,
    channel: Channel,
    queue: String,
    stage: String,
}

#[async_trait]
impl DeliveryStream for AmqpDeliveryStream {
    async fn next_delivery(&mut self) -> Option<Result<Delivery, BrokerError>> {
        let delivery = match self.consumer.next().await? {
            Ok(delivery) => delivery,
            Err(e) => return Some(Err(BrokerError::Consume(e.to_string()))),
        };

        let headers = parse_headers(&delivery.properties);
        debug!(
            queue = %self.queue,
            routing_key = %delivery.routing_key,
            retry_count = headers.retry_count,
            size = delivery.data.len(),
            "delivery received"
        );

        let acker = AmqpAcker {
            acker: delivery.acker,
            channel: self.channel.clone(),
            queue: self.queue.clone(),
            routing_key: delivery.routing_key.to_string(),
            stage: self.stage.clone(),
        };

        Some(Ok(Delivery {
            routing_key: delivery.routing_key.to_string(),
            queue: self.queue.clone(),
            body: delivery.data,
            headers,
            acker: Box::new(acker),
        }))
    }
}

struct AmqpAcker {
    acker: lapin::acker::Acker,
    channel: Channel,
    queue: String,
    routing_key: String,
    stage: String,
}

#[async_trait]
impl Acker for AmqpAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::Acknowledge(e.to_string()))
    }

    async fn requeue_with_retry(
        &self,
        body: &[u8],
        headers: &MessageHeaders,
    ) -> Result<(), BrokerError> {
        // Default exchange, routing key = queue name: redelivers to this
        // queue only, without re-fanning-out to sibling subscribers.
        AmqpBroker::publish_on(&self.channel, "", &self.queue, body, headers).await?;
        self.ack().await
    }

    async fn dead_letter(
        &self,
        body: &[u8],
        original_error: &str,
        headers: &MessageHeaders,
    ) -> Result<(), BrokerError> {
        let annotated = headers.dead_lettered(original_error, &self.stage);
        AmqpBroker::publish_on(
            &self.channel,
            contracts::DLQ_EXCHANGE,
            &self.routing_key,
            body,
            &annotated,
        )
        .await?;
        self.ack().await
    }
}

async fn declare_exchanges(channel: &Channel) -> Result<(), BrokerError> {
    for exchange in [contracts::EXCHANGE, contracts::DLQ_EXCHANGE] {
        channel
            .exchange_declare(
                exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions { durable: true, ..Default::default() },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Declare(format!("exchange {exchange}: {e}")))?;
    }
    Ok(())
}

async fn declare_and_bind(
    channel: &Channel,
    queue: &str,
    routing_key: &str,
    exchange: &str,
) -> Result<(), BrokerError> {
    channel
        .queue_declare(
            queue,
            QueueDeclareOptions { durable: true, ..Default::default() },
            FieldTable::default(),
        )
        .await
        .map_err(|e| BrokerError::Declare(format!("queue {queue}: {e}")))?;

    channel
        .queue_bind(queue, exchange, routing_key, QueueBindOptions::default(), FieldTable::default())
        .await
        .map_err(|e| BrokerError::Declare(format!("binding {queue} -> {exchange}: {e}")))?;

    Ok(())
}

fn field_table(headers: &MessageHeaders) -> FieldTable {
    let mut table = FieldTable::default();

    if let Some(trace_id) = &headers.trace_id {
        table.insert(trace::TRACE_ID_HEADER.into(), AMQPValue::LongString(trace_id.as_str().into()));
    }
    if let Some(traceparent) = &headers.traceparent {
        table.insert(
            trace::TRACEPARENT_HEADER.into(),
            AMQPValue::LongString(traceparent.as_str().into()),
        );
    }
    table.insert(
        trace::RETRY_COUNT_HEADER.into(),
        AMQPValue::LongLongInt(i64::from(headers.retry_count)),
    );
    if let Some(original_error) = &headers.original_error {
        table.insert(
            trace::ORIGINAL_ERROR_HEADER.into(),
            AMQPValue::LongString(original_error.as_str().into()),
        );
    }
    if let Some(stage) = &headers.failed_stage {
        table.insert(trace::FAILED_STAGE_HEADER.into(), AMQPValue::LongString(stage.as_str().into()));
    }

    table
}

fn parse_headers(properties: &BasicProperties) -> MessageHeaders {
    let mut headers = MessageHeaders::default();

    let Some(table) = properties.headers() else {
        return headers;
    };

    for (key, value) in table.inner() {
        match (key.as_str(), value) {
            (trace::TRACE_ID_HEADER, AMQPValue::LongString(s)) => {
                headers.trace_id = Some(String::from_utf8_lossy(s.as_bytes()).into_owned());
            },
            (trace::TRACEPARENT_HEADER, AMQPValue::LongString(s)) => {
                headers.traceparent = Some(String::from_utf8_lossy(s.as_bytes()).into_owned());
            },
            (trace::RETRY_COUNT_HEADER, AMQPValue::LongLongInt(n)) => {
                headers.retry_count = u32::try_from(*n).unwrap_or(0);
            },
            (trace::RETRY_COUNT_HEADER, AMQPValue::LongInt(n)) => {
                headers.retry_count = u32::try_from(*n).unwrap_or(0);
            },
            (trace::ORIGINAL_ERROR_HEADER, AMQPValue::LongString(s)) => {
                headers.original_error = Some(String::from_utf8_lossy(s.as_bytes()).into_owned());
            },
            (trace::FAILED_STAGE_HEADER, AMQPValue::LongString(s)) => {
                headers.failed_stage = Some(String::from_utf8_lossy(s.as_bytes()).into_owned());
            },
            _ => {},
        }
    }

    headers
}
