//! Media-server metrics reducer
//!
//! Threshold-based conditions derived from periodic ingest metrics.

use super::{probe, Reducer, ReducerState};
use crate::condition::{ConditionType, Status};
use crate::event::Event;

pub struct MediaServerMetricsReducer {
    /// Ingest errors tolerated per report before `NoErrors` turns false
    max_error_count: u64,
}

impl MediaServerMetricsReducer {
    pub fn new(max_error_count: u64) -> Self {
        Self { max_error_count }
    }
}

impl Default for MediaServerMetricsReducer {
    fn default() -> Self {
        Self::new(0)
    }
}

impl Reducer for MediaServerMetricsReducer {
    fn reduce(
        &self,
        status: &Status,
        _state: &ReducerState,
        event: &Event,
    ) -> (Status, ReducerState) {
        let Event::MediaServerMetrics(evt) = event else {
            return (status.clone(), ReducerState::None);
        };
        let no_errors = probe(
            status,
            ConditionType::NoErrors,
            Some(evt.stats.error_count <= self.max_error_count),
            evt.base.timestamp,
        );
        (status.with_conditions(vec![no_errors]), ReducerState::None)
    }
}
