//! Stream consumer adapter
//!
//! Long-running consume loop over a stream-oriented AMQP broker. Declares
//! the stream with its retention policy, binds the configured routing-key
//! patterns, then decodes each message into an [`Event`] and forwards it to
//! the core's ingestion channel. Offsets are checkpointed per consumer name
//! so reconnections resume where they left off; decode failures are logged
//! and skipped, transport failures reconnect with capped exponential
//! backoff.

use crate::error::{HealthError, Result};
use crate::event::Event;
use crate::metrics;
use crate::reducers::StatePublisher;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
/// Consecutive failed connection attempts before giving up
const MAX_CONNECT_FAILURES: u32 = 10;
const PREFETCH_COUNT: u16 = 256;
const EVENT_BUFFER: usize = 1024;
const DEFAULT_STARTUP_GRACE: Duration = Duration::from_secs(60);

/// One exchange binding for the consumed stream
#[derive(Debug, Clone)]
pub struct BindingArgs {
    pub exchange: String,
    /// Routing-key pattern, e.g. `#.stream_health.transcode.#`
    pub key: String,
}

/// Initial consume cursor
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OffsetSpec {
    First,
    Last,
    Next,
    Timestamp(DateTime<Utc>),
    Offset(u64),
}

#[derive(Debug, Clone)]
pub struct ConsumeOptions {
    /// Logical stream name; created if absent
    pub stream: String,
    pub bindings: Vec<BindingArgs>,
    /// Stable identifier used for offset checkpointing
    pub consumer_name: String,
    pub max_length_bytes: Option<u64>,
    pub max_segment_size_bytes: Option<u64>,
    pub max_age: Option<Duration>,
    pub start_offset: OffsetSpec,
    /// Checkpoint offsets under `consumer_name` and resume from them
    pub memorize_offset: bool,
}

impl ConsumeOptions {
    pub fn new(stream: impl Into<String>, consumer_name: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            bindings: Vec::new(),
            consumer_name: consumer_name.into(),
            max_length_bytes: None,
            max_segment_size_bytes: None,
            max_age: None,
            start_offset: OffsetSpec::Last,
            memorize_offset: false,
        }
    }

    pub fn with_binding(mut self, exchange: impl Into<String>, key: impl Into<String>) -> Self {
        self.bindings.push(BindingArgs {
            exchange: exchange.into(),
            key: key.into(),
        });
        self
    }

    pub fn with_start_offset(mut self, offset: OffsetSpec) -> Self {
        self.start_offset = offset;
        self
    }

    pub fn with_memorized_offset(mut self) -> Self {
        self.memorize_offset = true;
        self
    }
}

/// Liveness shared between the consume loop and [`crate::Core::is_healthy`]
pub struct ConsumerHealth {
    connected: AtomicBool,
    consumed: AtomicU64,
    started_at: Instant,
    startup_grace: Duration,
}

impl ConsumerHealth {
    pub fn new(startup_grace: Duration) -> Self {
        Self {
            connected: AtomicBool::new(false),
            consumed: AtomicU64::new(0),
            started_at: Instant::now(),
            startup_grace,
        }
    }

    /// Connected and consuming, or still inside the startup grace window.
    pub fn is_healthy(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
            && (self.consumed.load(Ordering::Relaxed) > 0
                || self.started_at.elapsed() < self.startup_grace)
    }

    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn consumed(&self) -> u64 {
        self.consumed.load(Ordering::Relaxed)
    }

    fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }

    fn record_consumed(&self) {
        self.consumed.fetch_add(1, Ordering::Relaxed);
    }
}

impl Default for ConsumerHealth {
    fn default() -> Self {
        Self::new(DEFAULT_STARTUP_GRACE)
    }
}

/// Decode one broker message body into an event.
pub fn decode_event(payload: &[u8]) -> Result<Event> {
    Ok(serde_json::from_slice(payload)?)
}

pub struct StreamConsumer {
    uri: String,
    health: Arc<ConsumerHealth>,
    offsets: Arc<DashMap<String, u64>>,
}

impl StreamConsumer {
    pub fn new(uri: impl Into<String>) -> Self {
        Self::with_startup_grace(uri, DEFAULT_STARTUP_GRACE)
    }

    pub fn with_startup_grace(uri: impl Into<String>, startup_grace: Duration) -> Self {
        Self {
            uri: uri.into(),
            health: Arc::new(ConsumerHealth::new(startup_grace)),
            offsets: Arc::new(DashMap::new()),
        }
    }

    pub fn health(&self) -> Arc<ConsumerHealth> {
        self.health.clone()
    }

    /// Last checkpointed offset for a consumer name, if any.
    pub fn checkpointed_offset(&self, consumer_name: &str) -> Option<u64> {
        self.offsets.get(consumer_name).map(|o| *o)
    }

    /// Spawn the consume loop and return the decoded-event channel.
    ///
    /// The channel yields events until the shutdown signal fires, the
    /// receiver is dropped, or reconnection gives up.
    pub fn consume(
        &self,
        opts: ConsumeOptions,
        shutdown: watch::Receiver<bool>,
    ) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let worker = ConsumeLoop {
            uri: self.uri.clone(),
            opts,
            health: self.health.clone(),
            offsets: self.offsets.clone(),
            tx,
            shutdown,
        };
        tokio::spawn(worker.run());
        rx
    }
}

enum LoopExit {
    Shutdown,
    ReceiverClosed,
}

struct ConsumeLoop {
    uri: String,
    opts: ConsumeOptions,
    health: Arc<ConsumerHealth>,
    offsets: Arc<DashMap<String, u64>>,
    tx: mpsc::Sender<Event>,
    shutdown: watch::Receiver<bool>,
}

impl ConsumeLoop {
    async fn run(mut self) {
        let mut backoff = INITIAL_BACKOFF;
        let mut failures = 0u32;
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            let mut consumed_any = false;
            match self.run_connection(&mut consumed_any).await {
                Ok(LoopExit::Shutdown) => break,
                Ok(LoopExit::ReceiverClosed) => {
                    info!(stream = %self.opts.stream, "event receiver dropped, stopping consumer");
                    break;
                }
                Err(err) => {
                    self.health.set_connected(false);
                    if consumed_any {
                        backoff = INITIAL_BACKOFF;
                        failures = 0;
                    }
                    failures += 1;
                    if failures >= MAX_CONNECT_FAILURES {
                        error!(
                            stream = %self.opts.stream,
                            error = %err,
                            attempts = failures,
                            "reconnection budget exhausted, giving up"
                        );
                        break;
                    }
                    metrics::CONSUMER_RECONNECTS.inc();
                    let delay = with_jitter(backoff);
                    warn!(
                        stream = %self.opts.stream,
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "broker connection lost, reconnecting"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        changed = self.shutdown.changed() => {
                            if changed.is_err() || *self.shutdown.borrow() {
                                break;
                            }
                        }
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
        self.health.set_connected(false);
    }

    async fn run_connection(&mut self, consumed_any: &mut bool) -> Result<LoopExit> {
        let connection = Connection::connect(&self.uri, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;
        self.declare_stream(&channel).await?;
        for binding in &self.opts.bindings {
            channel
                .queue_bind(
                    &self.opts.stream,
                    &binding.exchange,
                    &binding.key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await?;
        }
        // stream consumers require a prefetch window for flow control
        channel
            .basic_qos(PREFETCH_COUNT, BasicQosOptions::default())
            .await?;

        let checkpoint = if self.opts.memorize_offset {
            self.offsets.get(&self.opts.consumer_name).map(|o| *o)
        } else {
            None
        };
        let mut args = FieldTable::default();
        args.insert(
            "x-stream-offset".into(),
            start_offset_value(&self.opts.start_offset, checkpoint),
        );
        let mut consumer = channel
            .basic_consume(
                &self.opts.stream,
                &self.opts.consumer_name,
                BasicConsumeOptions::default(),
                args,
            )
            .await?;

        self.health.set_connected(true);
        info!(
            stream = %self.opts.stream,
            consumer = %self.opts.consumer_name,
            resumed_offset = ?checkpoint,
            "consuming from broker stream"
        );

        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        return Ok(LoopExit::Shutdown);
                    }
                }
                delivery = consumer.next() => {
                    let delivery = match delivery {
                        Some(Ok(delivery)) => delivery,
                        Some(Err(err)) => return Err(err.into()),
                        None => {
                            return Err(HealthError::Transport(
                                "delivery stream closed by broker".into(),
                            ))
                        }
                    };
                    *consumed_any = true;
                    let offset = offset_from_headers(delivery.properties.headers().as_ref());
                    match decode_event(&delivery.data) {
                        Ok(event) => {
                            self.health.record_consumed();
                            if self.tx.send(event).await.is_err() {
                                return Ok(LoopExit::ReceiverClosed);
                            }
                        }
                        Err(err) => {
                            warn!(
                                stream = %self.opts.stream,
                                error = %err,
                                "skipping undecodable broker message"
                            );
                            metrics::DECODE_FAILURES.inc();
                        }
                    }
                    if self.opts.memorize_offset {
                        if let Some(offset) = offset {
                            self.offsets.insert(self.opts.consumer_name.clone(), offset);
                        }
                    }
                    delivery.ack(BasicAckOptions::default()).await?;
                }
            }
        }
    }

    async fn declare_stream(&self, channel: &Channel) -> Result<()> {
        let mut args = FieldTable::default();
        args.insert("x-queue-type".into(), AMQPValue::LongString("stream".into()));
        if let Some(bytes) = self.opts.max_length_bytes {
            args.insert(
                "x-max-length-bytes".into(),
                AMQPValue::LongLongInt(bytes as i64),
            );
        }
        if let Some(bytes) = self.opts.max_segment_size_bytes {
            args.insert(
                "x-stream-max-segment-size-bytes".into(),
                AMQPValue::LongLongInt(bytes as i64),
            );
        }
        if let Some(age) = self.opts.max_age {
            args.insert(
                "x-max-age".into(),
                AMQPValue::LongString(format_max_age(age).into()),
            );
        }
        channel
            .queue_declare(
                &self.opts.stream,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                args,
            )
            .await?;
        Ok(())
    }
}

/// The `x-stream-offset` value to start consuming from. A checkpointed
/// offset always wins: resume one past it.
fn start_offset_value(start: &OffsetSpec, checkpoint: Option<u64>) -> AMQPValue {
    if let Some(offset) = checkpoint {
        return AMQPValue::LongLongInt((offset + 1) as i64);
    }
    match start {
        OffsetSpec::First => AMQPValue::LongString("first".into()),
        OffsetSpec::Last => AMQPValue::LongString("last".into()),
        OffsetSpec::Next => AMQPValue::LongString("next".into()),
        OffsetSpec::Timestamp(ts) => AMQPValue::Timestamp(ts.timestamp().max(0) as u64),
        OffsetSpec::Offset(offset) => AMQPValue::LongLongInt(*offset as i64),
    }
}

/// Broker-assigned offset of a delivery, from its `x-stream-offset` header.
fn offset_from_headers(headers: Option<&FieldTable>) -> Option<u64> {
    headers?
        .inner()
        .iter()
        .find(|(key, _)| key.as_str() == "x-stream-offset")
        .and_then(|(_, value)| match value {
            AMQPValue::LongLongInt(v) => Some(*v as u64),
            AMQPValue::LongInt(v) => Some(*v as u64),
            AMQPValue::LongUInt(v) => Some(u64::from(*v)),
            _ => None,
        })
}

fn format_max_age(age: Duration) -> String {
    format!("{}s", age.as_secs())
}

fn with_jitter(base: Duration) -> Duration {
    let factor = 1.0 + rand::thread_rng().gen_range(-0.3..0.3);
    Duration::from_millis((base.as_millis() as f64 * factor) as u64)
}

/// AMQP-backed republisher for stream-state events.
///
/// Publishes through a dedicated task fed by an unbounded channel so the
/// reduce path never blocks on broker I/O; failures are logged and dropped.
pub struct AmqpStatePublisher {
    tx: mpsc::UnboundedSender<StatePublish>,
}

struct StatePublish {
    exchange: String,
    routing_key: String,
    payload: Vec<u8>,
}

impl AmqpStatePublisher {
    pub async fn connect(uri: &str) -> Result<Arc<Self>> {
        let connection = Connection::connect(uri, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;
        let (tx, mut rx) = mpsc::unbounded_channel::<StatePublish>();
        tokio::spawn(async move {
            // the connection must outlive the publisher task
            let _connection = connection;
            while let Some(msg) = rx.recv().await {
                let result = channel
                    .basic_publish(
                        &msg.exchange,
                        &msg.routing_key,
                        BasicPublishOptions::default(),
                        &msg.payload,
                        BasicProperties::default(),
                    )
                    .await;
                if let Err(err) = result {
                    warn!(
                        exchange = %msg.exchange,
                        routing_key = %msg.routing_key,
                        error = %err,
                        "failed to republish stream state"
                    );
                }
            }
        });
        Ok(Arc::new(Self { tx }))
    }
}

impl StatePublisher for AmqpStatePublisher {
    fn publish_state(
        &self,
        exchange: &str,
        routing_key: &str,
        event: &crate::event::StreamStateEvent,
    ) {
        let payload = match serde_json::to_vec(&Event::StreamState(event.clone())) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "failed to encode stream-state event");
                return;
            }
        };
        let msg = StatePublish {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            payload,
        };
        if self.tx.send(msg).is_err() {
            warn!("state publisher task stopped, dropping republish");
        }
    }
}
