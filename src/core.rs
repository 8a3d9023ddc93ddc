//! The stream health core
//!
//! Routes decoded events to records, runs the reducer pipeline, maintains
//! bounded event history, and serves the query surface the HTTP layer
//! consumes: point-in-time status, past events, and live subscriptions with
//! replay.

use crate::condition::{default_condition_types, ConditionType, Status};
use crate::consumer::ConsumerHealth;
use crate::error::{HealthError, Result};
use crate::event::Event;
use crate::metrics;
use crate::record::{Record, RecordStorage, DEFAULT_PAST_EVENTS_CAP};
use crate::reducers::Pipeline;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;

pub struct CoreOptions {
    /// Condition types every record is created with
    pub conditions: Vec<ConditionType>,
    /// Bound on each record's retained event history
    pub past_events_cap: usize,
    /// Live-channel buffer handed to each subscription
    pub subscription_buffer: usize,
    /// How long shutdown waits for in-flight events to drain
    pub shutdown_grace: Duration,
}

impl Default for CoreOptions {
    fn default() -> Self {
        Self {
            conditions: default_condition_types(),
            past_events_cap: DEFAULT_PAST_EVENTS_CAP,
            subscription_buffer: 128,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

pub struct Core {
    opts: CoreOptions,
    pipeline: Pipeline,
    storage: RecordStorage,
    consumer_health: RwLock<Option<Arc<ConsumerHealth>>>,
}

impl Core {
    pub fn new(opts: CoreOptions, pipeline: Pipeline) -> Self {
        let storage = RecordStorage::new(opts.past_events_cap);
        Self {
            opts,
            pipeline,
            storage,
            consumer_health: RwLock::new(None),
        }
    }

    pub fn get(&self, manifest_id: &str) -> Option<Arc<Record>> {
        self.storage.get(manifest_id)
    }

    pub fn get_or_create(&self, manifest_id: &str) -> Arc<Record> {
        self.storage
            .get_or_create(manifest_id, &self.opts.conditions, &self.pipeline)
    }

    /// Current status snapshot for a manifest.
    pub fn get_status(&self, manifest_id: &str) -> Result<Arc<Status>> {
        self.get(manifest_id)
            .map(|record| record.status())
            .ok_or_else(|| HealthError::StreamNotFound(manifest_id.to_string()))
    }

    /// Whether the core is consuming: the adapter holds a connection and has
    /// seen at least one message since startup, or its startup grace window
    /// has not yet elapsed.
    pub fn is_healthy(&self) -> bool {
        self.consumer_health
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map_or(false, |health| health.is_healthy())
    }

    pub fn bind_consumer(&self, health: Arc<ConsumerHealth>) {
        *self
            .consumer_health
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(health);
    }

    /// Ingest one event: reduce, append to history, publish to subscribers.
    ///
    /// Safe under concurrent calls for distinct manifests; calls for the
    /// same manifest are serialized by the record lock. Invariant
    /// violations (duplicate ID, timestamp regression) are logged and the
    /// event skipped; ingestion continues.
    pub fn handle_event(&self, event: &Event) {
        let record = self.get_or_create(event.stream_id());
        record.with_inner_mut(|inner| {
            if inner.past_events.iter().any(|e| e.id() == event.id()) {
                error!(
                    stream_id = %event.stream_id(),
                    event_id = %event.id(),
                    "duplicate event in history, skipping"
                );
                metrics::EVENTS_SKIPPED
                    .with_label_values(&["duplicate"])
                    .inc();
                return;
            }
            if let Some(last) = inner.past_events.back() {
                if event.timestamp() < last.timestamp() {
                    error!(
                        stream_id = %event.stream_id(),
                        event_id = %event.id(),
                        event_time = event.timestamp().timestamp_millis(),
                        last_time = last.timestamp().timestamp_millis(),
                        "out-of-order event for manifest, skipping"
                    );
                    metrics::EVENTS_SKIPPED
                        .with_label_values(&["out_of_order"])
                        .inc();
                    return;
                }
            }

            let next = self
                .pipeline
                .reduce(&inner.last_status, &mut inner.reducer_states, event);
            inner.last_status = Arc::new(Status {
                last_event_time: Some(event.timestamp()),
                ..next
            });
            inner.append_event(event.clone());
            inner.subscribers.publish(event);
        });
        metrics::EVENTS_HANDLED
            .with_label_values(&[event.kind()])
            .inc();
    }

    /// History events for a manifest with timestamps in `[from, to)`.
    /// Unknown manifests yield an empty slice, not an error.
    pub fn get_past_events(
        &self,
        manifest_id: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Vec<Event> {
        self.get(manifest_id)
            .map(|record| record.past_events(from, to))
            .unwrap_or_default()
    }

    /// Subscribe to a manifest's events with replay.
    ///
    /// Returns the backlog from the resolved cursor plus a live channel.
    /// Registration is atomic with respect to event ingestion: an event is
    /// either in the backlog or delivered live, never both, never neither.
    pub fn subscribe_events(
        &self,
        manifest_id: &str,
        last_event_id: Option<Uuid>,
        from: Option<DateTime<Utc>>,
    ) -> Result<(Vec<Event>, mpsc::Receiver<Event>)> {
        let record = self
            .get(manifest_id)
            .ok_or_else(|| HealthError::StreamNotFound(manifest_id.to_string()))?;
        record.with_inner_mut(|inner| {
            let anchor = locate_anchor(&inner.past_events, last_event_id, from)?;
            let backlog = inner.past_events.iter().skip(anchor).cloned().collect();
            let rx = inner.subscribers.subscribe(self.opts.subscription_buffer);
            Ok((backlog, rx))
        })
    }

    /// Drop every live subscription, closing all channels.
    pub fn close_all_subscriptions(&self) {
        self.storage
            .for_each(|record| record.with_inner_mut(|inner| inner.subscribers.close_all()));
    }

    /// Start the ingestion task draining the decoded-event channel.
    ///
    /// On shutdown the task drains in-flight events up to the grace
    /// deadline, then closes every subscription.
    pub fn start(
        self: &Arc<Self>,
        mut events: mpsc::Receiver<Event>,
        consumer_health: Arc<ConsumerHealth>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        self.bind_consumer(consumer_health);
        let core = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    event = events.recv() => match event {
                        Some(event) => core.handle_event(&event),
                        None => {
                            info!("event channel closed, stopping ingestion");
                            core.close_all_subscriptions();
                            return;
                        }
                    },
                }
            }

            let deadline = tokio::time::Instant::now() + core.opts.shutdown_grace;
            loop {
                match tokio::time::timeout_at(deadline, events.recv()).await {
                    Ok(Some(event)) => core.handle_event(&event),
                    Ok(None) | Err(_) => break,
                }
            }
            core.close_all_subscriptions();
            info!("stream health core stopped");
        })
    }
}

/// Resolve the replay anchor: the index of the first history event the
/// subscriber is entitled to.
fn locate_anchor(
    history: &VecDeque<Event>,
    last_event_id: Option<Uuid>,
    from: Option<DateTime<Utc>>,
) -> Result<usize> {
    if let Some(id) = last_event_id {
        return match history.iter().position(|e| e.id() == id) {
            Some(idx) => Ok(idx + 1),
            // also covers a cursor that fell off the start of the buffer
            None => Err(HealthError::EventNotFound),
        };
    }
    if let Some(from) = from {
        return Ok(history
            .iter()
            .position(|e| e.timestamp() >= from)
            .unwrap_or(history.len()));
    }
    Ok(0)
}
