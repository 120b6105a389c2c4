//! RabbitMQ broker using lapin.
//!
//! Every lane `q` is backed by three durable queues:
//!
//! - `tasks.q` holds pending envelopes;
//! - `tasks.q.delay` holds scheduled envelopes with a per-message TTL and
//!   dead-letters them into `tasks.q` once it expires;
//! - `tasks.q.dead` holds dead letters.
//!
//! Envelope metadata travels in message headers and the payload is the message
//! body. Publishes wait for publisher confirms, so `enqueue` returns only after
//! RabbitMQ has taken responsibility for the message.
//!
//! A lease is an unacknowledged `basic.get` delivery. RabbitMQ requeues it if
//! the channel closes or the delivery acknowledgement timeout fires, which is
//! the lease expiry for this backend. RabbitMQ only expires messages at the
//! head of a queue, so a long delay can hold back shorter delays queued behind
//! it: envelopes may become eligible late, never early.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicGetOptions, BasicNackOptions, BasicPublishOptions,
        ConfirmSelectOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{error, info, warn};

use super::memory::DEFAULT_LEASE_TIMEOUT;
use super::{Broker, BrokerError, DeadLetter, LaneStats, Lease};
use crate::task::envelope::add_duration;
use crate::task::{Envelope, TaskId};

/// How often an idle `lease` polls the lanes again.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

const HEADER_TASK_TYPE: &str = "x-task-type";
const HEADER_QUEUE: &str = "x-queue";
const HEADER_MAX_RETRY: &str = "x-max-retry";
const HEADER_RETRY_COUNT: &str = "x-retry-count";
const HEADER_PROCESS_AT: &str = "x-process-at";
const HEADER_ENQUEUED_AT: &str = "x-enqueued-at";
const HEADER_LAST_ERROR: &str = "x-last-error";
const HEADER_DEAD_REASON: &str = "x-dead-reason";
const HEADER_DIED_AT: &str = "x-died-at";

fn ready_queue(lane: &str) -> String {
    format!("tasks.{lane}")
}

fn delay_queue(lane: &str) -> String {
    format!("tasks.{lane}.delay")
}

fn dead_queue(lane: &str) -> String {
    format!("tasks.{lane}.dead")
}

/// Broker backed by RabbitMQ with automatic reconnection.
#[derive(Clone)]
pub struct AmqpBroker {
    inner: Arc<AmqpBrokerInner>,
}

struct AmqpBrokerInner {
    url: String,
    lease_timeout: Duration,
    connection: RwLock<Option<Connection>>,
    channel: RwLock<Option<Channel>>,
    /// Lanes declared on the current channel
    declared: Mutex<HashSet<String>>,
    /// Unacknowledged deliveries by lease token
    leases: Mutex<HashMap<u64, HeldDelivery>>,
    next_token: AtomicU64,
}

struct HeldDelivery {
    lane: String,
    delivery: Delivery,
}

/// Where a settled envelope goes next.
enum Destination {
    Requeue(Envelope),
    Dead(Envelope, String),
}

impl AmqpBroker {
    /// Create a broker for the given RabbitMQ URL. The connection is opened
    /// lazily on first use.
    pub fn new(url: String) -> Self {
        Self::with_lease_timeout(url, DEFAULT_LEASE_TIMEOUT)
    }

    pub fn with_lease_timeout(url: String, lease_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(AmqpBrokerInner {
                url,
                lease_timeout,
                connection: RwLock::new(None),
                channel: RwLock::new(None),
                declared: Mutex::new(HashSet::new()),
                leases: Mutex::new(HashMap::new()),
                next_token: AtomicU64::new(1),
            }),
        }
    }

    fn leases(&self) -> MutexGuard<'_, HashMap<u64, HeldDelivery>> {
        self.inner
            .leases
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn declared(&self) -> MutexGuard<'_, HashSet<String>> {
        self.inner
            .declared
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Ensure we have a valid connection and a confirm-mode channel.
    async fn ensure_connected(&self) -> Result<Channel, BrokerError> {
        {
            let channel = self.inner.channel.read().await;
            if let Some(ch) = channel.as_ref() {
                if ch.status().connected() {
                    return Ok(ch.clone());
                }
            }
        }

        let mut connection = self.inner.connection.write().await;
        let mut channel = self.inner.channel.write().await;

        // Double-check after acquiring write lock
        if let Some(ch) = channel.as_ref() {
            if ch.status().connected() {
                return Ok(ch.clone());
            }
        }

        info!("rabbitmq_broker_connecting");

        let conn = Connection::connect(&self.inner.url, ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::Unavailable(format!("failed to connect to RabbitMQ: {e}")))?;

        let ch = conn.create_channel().await?;
        ch.confirm_select(ConfirmSelectOptions::default()).await?;

        info!("rabbitmq_broker_connected");

        // Leases held on the old channel were requeued by RabbitMQ.
        self.declared().clear();
        self.leases().clear();

        *connection = Some(conn);
        *channel = Some(ch.clone());

        Ok(ch)
    }

    /// Declare the three queues for a lane (idempotent) and return their sizes.
    async fn declare_lane(&self, channel: &Channel, lane: &str) -> Result<LaneStats, BrokerError> {
        let durable = QueueDeclareOptions {
            durable: true,
            ..Default::default()
        };

        let ready = channel
            .queue_declare(&ready_queue(lane), durable, FieldTable::default())
            .await?;

        let mut delay_args = FieldTable::default();
        delay_args.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString("".into()),
        );
        delay_args.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(ready_queue(lane).into()),
        );
        let delay = channel
            .queue_declare(&delay_queue(lane), durable, delay_args)
            .await?;

        let dead = channel
            .queue_declare(&dead_queue(lane), durable, FieldTable::default())
            .await?;

        let fresh = self.declared().insert(lane.to_string());
        if fresh {
            info!(
                lane = lane,
                ready_queue = %ready_queue(lane),
                delay_queue = %delay_queue(lane),
                dead_queue = %dead_queue(lane),
                "rabbitmq_lane_declared"
            );
        }

        Ok(LaneStats {
            pending: ready.message_count() as usize,
            scheduled: delay.message_count() as usize,
            in_flight: 0,
            dead: dead.message_count() as usize,
        })
    }

    async fn ensure_lane(&self, channel: &Channel, lane: &str) -> Result<(), BrokerError> {
        if self.declared().contains(lane) {
            return Ok(());
        }
        self.declare_lane(channel, lane).await.map(|_| ())
    }

    /// Publish to a queue and wait for the broker to confirm it.
    async fn publish(
        &self,
        channel: &Channel,
        queue: &str,
        body: &[u8],
        properties: BasicProperties,
    ) -> Result<(), BrokerError> {
        let confirmation = channel
            .basic_publish("", queue, BasicPublishOptions::default(), body, properties)
            .await?
            .await?;

        if confirmation.is_nack() {
            return Err(BrokerError::Unavailable(format!(
                "publish to {queue} was not confirmed"
            )));
        }
        Ok(())
    }

    /// Route an envelope to the ready or delay queue of its lane.
    async fn publish_envelope(&self, channel: &Channel, envelope: &Envelope) -> Result<(), BrokerError> {
        self.ensure_lane(channel, &envelope.queue).await?;

        let now = Utc::now();
        let properties = encode_properties(envelope);
        let (queue, properties) = if envelope.is_due(now) {
            (ready_queue(&envelope.queue), properties)
        } else {
            let delay_ms = (envelope.process_at - now).num_milliseconds().max(1);
            (
                delay_queue(&envelope.queue),
                properties.with_expiration(delay_ms.to_string().into()),
            )
        };

        self.publish(channel, &queue, &envelope.payload, properties).await
    }

    async fn publish_dead(
        &self,
        channel: &Channel,
        envelope: &Envelope,
        reason: &str,
    ) -> Result<(), BrokerError> {
        self.ensure_lane(channel, &envelope.queue).await?;

        let mut headers = encode_headers(envelope);
        headers.insert(
            HEADER_DEAD_REASON.into(),
            AMQPValue::LongString(reason.to_string().into()),
        );
        headers.insert(
            HEADER_DIED_AT.into(),
            AMQPValue::LongString(Utc::now().to_rfc3339().into()),
        );
        let properties = base_properties(envelope).with_headers(headers);

        self.publish(channel, &dead_queue(&envelope.queue), &envelope.payload, properties)
            .await
    }

    fn take_lease(&self, lease: &Lease) -> Result<HeldDelivery, BrokerError> {
        self.leases()
            .remove(&lease.token)
            .ok_or(BrokerError::LeaseLost(lease.task_id()))
    }

    fn restore_lease(&self, token: u64, held: HeldDelivery) {
        self.leases().insert(token, held);
    }

    /// Republish the leased envelope to `destination`, then ack the original
    /// delivery.
    async fn settle(&self, lease: &Lease, destination: Destination) -> Result<(), BrokerError> {
        let held = self.take_lease(lease)?;
        let channel = match self.ensure_connected().await {
            Ok(channel) => channel,
            Err(e) => {
                self.restore_lease(lease.token, held);
                return Err(e);
            }
        };

        let published = match &destination {
            Destination::Requeue(envelope) => self.publish_envelope(&channel, envelope).await,
            Destination::Dead(envelope, reason) => self.publish_dead(&channel, envelope, reason).await,
        };
        if let Err(e) = published {
            self.restore_lease(lease.token, held);
            return Err(e);
        }

        held.delivery.acker.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    /// Move a delivery that cannot be decoded to the dead queue untouched.
    async fn quarantine(&self, channel: &Channel, lane: &str, delivery: Delivery, reason: &str) {
        error!(lane = lane, error = %reason, "rabbitmq_envelope_malformed");

        let properties = delivery.properties.clone();
        let result = self
            .publish(channel, &dead_queue(lane), &delivery.data, properties)
            .await;
        let settle = match result {
            Ok(()) => delivery.acker.ack(BasicAckOptions::default()).await,
            Err(e) => {
                warn!(lane = lane, error = %e, "rabbitmq_quarantine_failed");
                delivery
                    .acker
                    .nack(BasicNackOptions {
                        requeue: true,
                        ..Default::default()
                    })
                    .await
            }
        };
        if let Err(e) = settle {
            warn!(lane = lane, error = %e, "rabbitmq_quarantine_settle_failed");
        }
    }

    /// Try each lane once without waiting.
    async fn try_lease(&self, channel: &Channel, queues: &[String]) -> Result<Option<Lease>, BrokerError> {
        for lane in queues {
            self.ensure_lane(channel, lane).await?;

            let Some(message) = channel
                .basic_get(&ready_queue(lane), BasicGetOptions { no_ack: false })
                .await?
            else {
                continue;
            };
            let delivery = message.delivery;

            let envelope = match decode_envelope(&delivery, lane) {
                Ok(envelope) => envelope,
                Err(e) => {
                    self.quarantine(channel, lane, delivery, &e.to_string()).await;
                    continue;
                }
            };

            let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
            let lease = Lease {
                envelope,
                token,
                deadline: add_duration(Utc::now(), self.inner.lease_timeout),
            };
            self.leases().insert(
                token,
                HeldDelivery {
                    lane: lane.clone(),
                    delivery,
                },
            );
            return Ok(Some(lease));
        }
        Ok(None)
    }

    /// Close the connection gracefully.
    pub async fn shutdown(&self) {
        let mut connection = self.inner.connection.write().await;
        let mut channel = self.inner.channel.write().await;

        if let Some(ch) = channel.take() {
            if let Err(e) = ch.close(200, "Normal shutdown").await {
                warn!(error = %e, "rabbitmq_channel_close_error");
            }
        }

        if let Some(conn) = connection.take() {
            if let Err(e) = conn.close(200, "Normal shutdown").await {
                warn!(error = %e, "rabbitmq_connection_close_error");
            }
        }

        self.leases().clear();
        self.declared().clear();

        info!("rabbitmq_broker_closed");
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn enqueue(&self, envelope: Envelope) -> Result<TaskId, BrokerError> {
        let channel = self.ensure_connected().await?;
        self.publish_envelope(&channel, &envelope).await?;
        Ok(envelope.id)
    }

    async fn lease(&self, queues: &[String], wait: Duration) -> Result<Option<Lease>, BrokerError> {
        let give_up = Instant::now() + wait;
        loop {
            let channel = self.ensure_connected().await?;
            if let Some(lease) = self.try_lease(&channel, queues).await? {
                return Ok(Some(lease));
            }

            let remaining = give_up.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            tokio::time::sleep(remaining.min(POLL_INTERVAL)).await;
        }
    }

    async fn ack(&self, lease: &Lease) -> Result<(), BrokerError> {
        let held = self.take_lease(lease)?;
        held.delivery.acker.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn retry(&self, lease: &Lease, error: &str, retry_at: DateTime<Utc>) -> Result<(), BrokerError> {
        let mut envelope = lease.envelope.clone();
        envelope.last_error = Some(error.to_string());

        if envelope.retries_exhausted() {
            return self
                .settle(lease, Destination::Dead(envelope, error.to_string()))
                .await;
        }

        envelope.retry_count += 1;
        envelope.process_at = retry_at;
        self.settle(lease, Destination::Requeue(envelope)).await
    }

    async fn kill(&self, lease: &Lease, reason: &str) -> Result<(), BrokerError> {
        let envelope = lease.envelope.clone();
        self.settle(lease, Destination::Dead(envelope, reason.to_string()))
            .await
    }

    async fn stats(&self, queue: &str) -> Result<LaneStats, BrokerError> {
        let channel = self.ensure_connected().await?;
        let mut stats = self.declare_lane(&channel, queue).await?;
        stats.in_flight = self
            .leases()
            .values()
            .filter(|held| held.lane == queue)
            .count();
        Ok(stats)
    }

    /// Peek at the dead queue by holding every message unacked, then
    /// requeueing them.
    async fn dead_letters(&self, queue: &str) -> Result<Vec<DeadLetter>, BrokerError> {
        let channel = self.ensure_connected().await?;
        let stats = self.declare_lane(&channel, queue).await?;

        let mut held = Vec::with_capacity(stats.dead);
        let mut letters = Vec::with_capacity(stats.dead);
        for _ in 0..stats.dead {
            let Some(message) = channel
                .basic_get(&dead_queue(queue), BasicGetOptions { no_ack: false })
                .await?
            else {
                break;
            };
            let delivery = message.delivery;
            match decode_dead_letter(&delivery, queue) {
                Ok(letter) => letters.push(letter),
                Err(e) => warn!(lane = queue, error = %e, "rabbitmq_dead_letter_malformed"),
            }
            held.push(delivery);
        }

        for delivery in held {
            delivery
                .acker
                .nack(BasicNackOptions {
                    requeue: true,
                    ..Default::default()
                })
                .await?;
        }

        Ok(letters)
    }

    async fn close(&self) {
        self.shutdown().await;
    }
}

fn base_properties(envelope: &Envelope) -> BasicProperties {
    BasicProperties::default()
        .with_delivery_mode(2) // Persistent
        .with_content_type("application/octet-stream".into())
        .with_message_id(envelope.id.to_string().into())
}

fn encode_properties(envelope: &Envelope) -> BasicProperties {
    base_properties(envelope).with_headers(encode_headers(envelope))
}

fn encode_headers(envelope: &Envelope) -> FieldTable {
    let mut headers = FieldTable::default();
    headers.insert(
        HEADER_TASK_TYPE.into(),
        AMQPValue::LongString(envelope.task_type.clone().into()),
    );
    headers.insert(
        HEADER_QUEUE.into(),
        AMQPValue::LongString(envelope.queue.clone().into()),
    );
    headers.insert(
        HEADER_MAX_RETRY.into(),
        AMQPValue::LongLongInt(i64::from(envelope.max_retry)),
    );
    headers.insert(
        HEADER_RETRY_COUNT.into(),
        AMQPValue::LongLongInt(i64::from(envelope.retry_count)),
    );
    headers.insert(
        HEADER_PROCESS_AT.into(),
        AMQPValue::LongString(envelope.process_at.to_rfc3339().into()),
    );
    headers.insert(
        HEADER_ENQUEUED_AT.into(),
        AMQPValue::LongString(envelope.enqueued_at.to_rfc3339().into()),
    );
    if let Some(last_error) = &envelope.last_error {
        headers.insert(
            HEADER_LAST_ERROR.into(),
            AMQPValue::LongString(last_error.clone().into()),
        );
    }
    headers
}

fn header<'a>(headers: &'a FieldTable, name: &str) -> Option<&'a AMQPValue> {
    headers
        .inner()
        .iter()
        .find(|(key, _)| key.as_str() == name)
        .map(|(_, value)| value)
}

fn header_string(headers: &FieldTable, name: &str) -> Option<String> {
    match header(headers, name)? {
        AMQPValue::LongString(value) => Some(String::from_utf8_lossy(value.as_bytes()).into_owned()),
        AMQPValue::ShortString(value) => Some(value.as_str().to_string()),
        _ => None,
    }
}

fn header_u32(headers: &FieldTable, name: &str) -> Option<u32> {
    let value = match header(headers, name)? {
        AMQPValue::LongLongInt(v) => *v,
        AMQPValue::LongInt(v) => i64::from(*v),
        AMQPValue::LongUInt(v) => i64::from(*v),
        AMQPValue::ShortInt(v) => i64::from(*v),
        _ => return None,
    };
    u32::try_from(value).ok()
}

fn header_time(headers: &FieldTable, name: &str) -> Result<DateTime<Utc>, BrokerError> {
    let raw = header_string(headers, name)
        .ok_or_else(|| BrokerError::Codec(format!("missing header {name}")))?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| BrokerError::Codec(format!("invalid {name}: {e}")))
}

fn decode_envelope(delivery: &Delivery, lane: &str) -> Result<Envelope, BrokerError> {
    let headers = delivery
        .properties
        .headers()
        .as_ref()
        .ok_or_else(|| BrokerError::Codec("message has no headers".to_string()))?;

    let id = delivery
        .properties
        .message_id()
        .as_ref()
        .ok_or_else(|| BrokerError::Codec("message has no message_id".to_string()))?
        .as_str()
        .parse::<TaskId>()
        .map_err(|e| BrokerError::Codec(format!("invalid message_id: {e}")))?;

    let task_type = header_string(headers, HEADER_TASK_TYPE)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| BrokerError::Codec(format!("missing header {HEADER_TASK_TYPE}")))?;

    Ok(Envelope {
        id,
        task_type,
        payload: delivery.data.clone(),
        queue: header_string(headers, HEADER_QUEUE).unwrap_or_else(|| lane.to_string()),
        max_retry: header_u32(headers, HEADER_MAX_RETRY)
            .ok_or_else(|| BrokerError::Codec(format!("missing header {HEADER_MAX_RETRY}")))?,
        retry_count: header_u32(headers, HEADER_RETRY_COUNT).unwrap_or(0),
        process_at: header_time(headers, HEADER_PROCESS_AT)?,
        enqueued_at: header_time(headers, HEADER_ENQUEUED_AT)?,
        last_error: header_string(headers, HEADER_LAST_ERROR),
    })
}

fn decode_dead_letter(delivery: &Delivery, lane: &str) -> Result<DeadLetter, BrokerError> {
    let envelope = decode_envelope(delivery, lane)?;
    let headers = delivery
        .properties
        .headers()
        .as_ref()
        .ok_or_else(|| BrokerError::Codec("message has no headers".to_string()))?;

    Ok(DeadLetter {
        envelope,
        reason: header_string(headers, HEADER_DEAD_REASON).unwrap_or_default(),
        died_at: header_time(headers, HEADER_DIED_AT).unwrap_or_else(|_| Utc::now()),
    })
}
