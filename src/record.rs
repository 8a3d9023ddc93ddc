//! Per-manifest records and their storage
//!
//! Records are created lazily on the first event for a manifest and never
//! destroyed during the process lifetime. Mutation goes through a per-record
//! lock; readers take a consistent `Arc<Status>` snapshot and never block
//! writers for long.

use crate::condition::{ConditionType, Status};
use crate::event::Event;
use crate::fanout::SubscriberSet;
use crate::reducers::{Pipeline, ReducerState};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::{Arc, RwLock};

pub(crate) struct RecordInner {
    past_events_cap: usize,
    pub past_events: VecDeque<Event>,
    pub reducer_states: Vec<ReducerState>,
    pub last_status: Arc<Status>,
    pub subscribers: SubscriberSet,
}

impl RecordInner {
    /// Append to the bounded history, evicting the oldest event at capacity.
    pub fn append_event(&mut self, event: Event) {
        if self.past_events.len() >= self.past_events_cap {
            self.past_events.pop_front();
        }
        self.past_events.push_back(event);
    }
}

/// Per-manifest aggregate: current status, bounded event history, reducer
/// state, and the live subscriptions.
pub struct Record {
    manifest_id: String,
    conditions: Vec<ConditionType>,
    inner: RwLock<RecordInner>,
}

impl Record {
    pub(crate) fn new(
        manifest_id: impl Into<String>,
        conditions: &[ConditionType],
        reducer_states: Vec<ReducerState>,
        past_events_cap: usize,
    ) -> Self {
        let manifest_id = manifest_id.into();
        Self {
            conditions: conditions.to_vec(),
            inner: RwLock::new(RecordInner {
                past_events_cap,
                past_events: VecDeque::with_capacity(past_events_cap),
                reducer_states,
                last_status: Arc::new(Status::new(manifest_id.clone(), conditions)),
                subscribers: SubscriberSet::default(),
            }),
            manifest_id,
        }
    }

    pub fn manifest_id(&self) -> &str {
        &self.manifest_id
    }

    pub fn condition_types(&self) -> &[ConditionType] {
        &self.conditions
    }

    /// Consistent snapshot of the current status.
    pub fn status(&self) -> Arc<Status> {
        self.read().last_status.clone()
    }

    /// History events with timestamps in `[from, to)`, in observation order.
    pub fn past_events(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Vec<Event> {
        self.read()
            .past_events
            .iter()
            .filter(|e| {
                from.map_or(true, |f| e.timestamp() >= f)
                    && to.map_or(true, |t| e.timestamp() < t)
            })
            .cloned()
            .collect()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, RecordInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn with_inner_mut<R>(&self, f: impl FnOnce(&mut RecordInner) -> R) -> R {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        f(&mut inner)
    }
}

/// Concurrent map from manifest ID to its record
pub struct RecordStorage {
    records: DashMap<String, Arc<Record>>,
    past_events_cap: usize,
}

/// Default bound on each record's retained event history
pub const DEFAULT_PAST_EVENTS_CAP: usize = 100;

impl RecordStorage {
    pub fn new(past_events_cap: usize) -> Self {
        Self {
            records: DashMap::new(),
            past_events_cap,
        }
    }

    pub fn get(&self, manifest_id: &str) -> Option<Arc<Record>> {
        self.records.get(manifest_id).map(|r| r.value().clone())
    }

    /// Atomic get-or-create: concurrent callers all receive the same record.
    pub fn get_or_create(
        &self,
        manifest_id: &str,
        conditions: &[ConditionType],
        pipeline: &Pipeline,
    ) -> Arc<Record> {
        if let Some(existing) = self.get(manifest_id) {
            return existing;
        }
        self.records
            .entry(manifest_id.to_string())
            .or_insert_with(|| {
                Arc::new(Record::new(
                    manifest_id,
                    conditions,
                    pipeline.initial_states(),
                    self.past_events_cap,
                ))
            })
            .value()
            .clone()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub(crate) fn for_each(&self, mut f: impl FnMut(&Arc<Record>)) {
        for entry in self.records.iter() {
            f(entry.value());
        }
    }
}

impl Default for RecordStorage {
    fn default() -> Self {
        Self::new(DEFAULT_PAST_EVENTS_CAP)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::default_condition_types;
    use crate::event::{EventBase, StreamState, StreamStateEvent};
    use crate::reducers::{default_pipeline, PipelineOptions};
    use chrono::TimeZone;

    fn event_at(ms: i64) -> Event {
        Event::StreamState(StreamStateEvent {
            base: EventBase::new("m1", Utc.timestamp_millis_opt(ms).unwrap()),
            state: StreamState { active: true },
        })
    }

    #[test]
    fn get_or_create_is_idempotent() {
        let storage = RecordStorage::default();
        let pipeline = default_pipeline(PipelineOptions::default());
        let conditions = default_condition_types();

        let first = storage.get_or_create("m1", &conditions, &pipeline);
        let second = storage.get_or_create("m1", &conditions, &pipeline);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(storage.len(), 1);
        assert!(storage.get("m2").is_none());
    }

    #[test]
    fn concurrent_creates_converge_on_one_record() {
        let storage = Arc::new(RecordStorage::default());
        let conditions = default_condition_types();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let storage = storage.clone();
                let conditions = conditions.clone();
                std::thread::spawn(move || {
                    let pipeline = default_pipeline(PipelineOptions::default());
                    let record = storage.get_or_create("m1", &conditions, &pipeline);
                    Arc::as_ptr(&record) as usize
                })
            })
            .collect();

        let pointers: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(pointers.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(storage.len(), 1);
    }

    #[test]
    fn history_is_fifo_bounded() {
        let storage = RecordStorage::new(100);
        let pipeline = default_pipeline(PipelineOptions::default());
        let record = storage.get_or_create("m1", &default_condition_types(), &pipeline);

        for i in 0..200 {
            record.with_inner_mut(|inner| inner.append_event(event_at(i)));
        }

        let history = record.past_events(None, None);
        assert_eq!(history.len(), 100);
        assert_eq!(history[0].timestamp().timestamp_millis(), 100);
        assert_eq!(history[99].timestamp().timestamp_millis(), 199);
    }

    #[test]
    fn past_events_filters_a_half_open_range() {
        let storage = RecordStorage::default();
        let pipeline = default_pipeline(PipelineOptions::default());
        let record = storage.get_or_create("m1", &default_condition_types(), &pipeline);
        for i in 0..10 {
            record.with_inner_mut(|inner| inner.append_event(event_at(i * 1000)));
        }

        let from = Utc.timestamp_millis_opt(2000).unwrap();
        let to = Utc.timestamp_millis_opt(5000).unwrap();
        let events = record.past_events(Some(from), Some(to));
        let times: Vec<i64> = events.iter().map(|e| e.timestamp().timestamp_millis()).collect();
        assert_eq!(times, vec![2000, 3000, 4000]);
    }
}
