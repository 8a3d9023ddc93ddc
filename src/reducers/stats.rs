//! Windowed condition stats
//!
//! Keeps a ring of status samples per condition, evicted lazily by the
//! arriving event's timestamp, and attaches `(count, rate)` per configured
//! window to each condition probed by the event. Runs last in the pipeline
//! so it sees finalized conditions.

use super::{Reducer, ReducerState};
use crate::condition::{window_key, Condition, ConditionStats, ConditionType, Status, WindowStats};
use crate::event::Event;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
struct StatusSample {
    timestamp: DateTime<Utc>,
    status: Option<bool>,
}

/// Per-record sample rings, one per condition type
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StatsState {
    samples: HashMap<ConditionType, VecDeque<StatusSample>>,
}

pub struct StatsReducer {
    windows: Vec<(String, chrono::Duration)>,
    max_window: chrono::Duration,
}

impl StatsReducer {
    pub fn new(windows: Vec<Duration>) -> Self {
        let max = windows.iter().copied().max().unwrap_or_default();
        let windows = windows
            .into_iter()
            .map(|w| {
                (
                    window_key(w),
                    chrono::Duration::milliseconds(w.as_millis() as i64),
                )
            })
            .collect();
        Self {
            windows,
            max_window: chrono::Duration::milliseconds(max.as_millis() as i64),
        }
    }

    fn window_stats(&self, ring: &VecDeque<StatusSample>, now: DateTime<Utc>) -> ConditionStats {
        let mut windows = BTreeMap::new();
        for (key, window) in &self.windows {
            let cutoff = now - *window;
            let mut count = 0u64;
            let mut hits = 0u64;
            // rings are time-ordered, so walk back until the window starts
            for sample in ring.iter().rev() {
                if sample.timestamp < cutoff {
                    break;
                }
                count += 1;
                if sample.status == Some(true) {
                    hits += 1;
                }
            }
            let rate = if count == 0 {
                0.0
            } else {
                hits as f64 / count as f64
            };
            windows.insert(key.clone(), WindowStats { count, rate });
        }
        ConditionStats { windows }
    }
}

impl Reducer for StatsReducer {
    fn initial_state(&self) -> ReducerState {
        ReducerState::Stats(StatsState::default())
    }

    fn reduce(
        &self,
        status: &Status,
        state: &ReducerState,
        event: &Event,
    ) -> (Status, ReducerState) {
        let mut state = match state {
            ReducerState::Stats(s) => s.clone(),
            _ => StatsState::default(),
        };
        let now = event.timestamp();
        let horizon = now - self.max_window;

        let mut updates = Vec::new();
        let mut healthy_update: Option<Condition> = None;
        for cond in status
            .conditions
            .iter()
            .chain(std::iter::once(&status.healthy))
        {
            // only conditions probed by this event gain a sample
            if cond.last_probe_time != Some(now) {
                continue;
            }
            let ring = state.samples.entry(cond.kind).or_default();
            ring.push_back(StatusSample {
                timestamp: now,
                status: cond.status,
            });
            while ring.front().map_or(false, |s| s.timestamp < horizon) {
                ring.pop_front();
            }
            let updated = cond.with_stats(self.window_stats(ring, now));
            if cond.kind == ConditionType::Healthy {
                healthy_update = Some(updated);
            } else {
                updates.push(updated);
            }
        }

        let mut next = status.with_conditions(updates);
        if let Some(healthy) = healthy_update {
            next = next.with_healthy(healthy);
        }
        (next, ReducerState::Stats(state))
    }
}
