//! Reducer pipeline
//!
//! A reducer is a pure function from (prior status, prior reducer state,
//! event) to (new status, new state). The pipeline invokes its reducers left
//! to right; each one sees the conditions produced by its predecessors, and
//! per-reducer state is kept in a tagged slot indexed by pipeline position.
//! Health aggregation runs after the primitive reducers, stats run last so
//! they observe finalized conditions.

mod health;
mod media_server;
mod multistream;
mod stats;
mod stream_state;
mod transcode;

pub use health::HealthReducer;
pub use media_server::MediaServerMetricsReducer;
pub use multistream::MultistreamReducer;
pub use stats::{StatsReducer, StatsState};
pub use stream_state::{StatePublisher, StreamStateReducer};
pub use transcode::TranscodeReducer;

use crate::condition::{Condition, ConditionType, Status};
use crate::event::Event;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

/// Opaque per-reducer state, one slot per pipeline position
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ReducerState {
    #[default]
    None,
    Stats(StatsState),
}

pub trait Reducer: Send + Sync {
    fn initial_state(&self) -> ReducerState {
        ReducerState::None
    }

    /// Produce the next status and reducer state for an event.
    ///
    /// All time must come from the event; reducers with equal inputs must
    /// produce equal outputs.
    fn reduce(&self, status: &Status, state: &ReducerState, event: &Event)
        -> (Status, ReducerState);
}

/// Ordered composition of reducers
pub struct Pipeline {
    reducers: Vec<Box<dyn Reducer>>,
}

impl Pipeline {
    pub fn new(reducers: Vec<Box<dyn Reducer>>) -> Self {
        Self { reducers }
    }

    pub fn len(&self) -> usize {
        self.reducers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reducers.is_empty()
    }

    pub fn initial_states(&self) -> Vec<ReducerState> {
        self.reducers.iter().map(|r| r.initial_state()).collect()
    }

    pub fn reduce(&self, status: &Status, states: &mut [ReducerState], event: &Event) -> Status {
        debug_assert_eq!(states.len(), self.reducers.len());
        let mut current = status.clone();
        for (reducer, state) in self.reducers.iter().zip(states.iter_mut()) {
            let (next, next_state) = reducer.reduce(&current, state, event);
            current = next;
            *state = next_state;
        }
        current
    }
}

#[derive(Default)]
pub struct PipelineOptions {
    /// Exchange stream-state events are republished to, when set
    pub state_exchange: Option<String>,
    pub state_publisher: Option<Arc<dyn StatePublisher>>,
    /// Stats windows; empty means the defaults
    pub stats_windows: Vec<Duration>,
    /// Ingest errors tolerated before `NoErrors` turns false
    pub max_ingest_errors: u64,
}

pub fn default_stats_windows() -> Vec<Duration> {
    vec![
        Duration::from_secs(60),
        Duration::from_secs(10 * 60),
        Duration::from_secs(60 * 60),
    ]
}

/// How far in the past consumption should start for stats to be warm
pub fn default_start_time_offset() -> Duration {
    default_stats_windows().into_iter().max().unwrap_or_default()
}

/// The standard pipeline: stream-state, transcode, multistream, media-server
/// metrics, health aggregation, windowed stats.
pub fn default_pipeline(opts: PipelineOptions) -> Pipeline {
    let stream_state = match (opts.state_exchange, opts.state_publisher) {
        (Some(exchange), Some(publisher)) => {
            StreamStateReducer::with_republish(exchange, publisher)
        }
        _ => StreamStateReducer::new(),
    };
    let windows = if opts.stats_windows.is_empty() {
        default_stats_windows()
    } else {
        opts.stats_windows
    };
    Pipeline::new(vec![
        Box::new(stream_state),
        Box::new(TranscodeReducer),
        Box::new(MultistreamReducer),
        Box::new(MediaServerMetricsReducer::new(opts.max_ingest_errors)),
        Box::new(HealthReducer),
        Box::new(StatsReducer::new(windows)),
    ])
}

/// Probe a condition of the given type against the current status
pub(crate) fn probe(
    status: &Status,
    kind: ConditionType,
    value: Option<bool>,
    at: DateTime<Utc>,
) -> Condition {
    status
        .condition(kind)
        .cloned()
        .unwrap_or_else(|| Condition::new(kind))
        .probed(value, at)
}
