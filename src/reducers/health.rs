//! Health aggregation
//!
//! Derives the top-level `Healthy` condition from the record's
//! sub-conditions: unknown while nothing has been observed, false as soon as
//! any observed sub-condition is false, true when every observed
//! sub-condition is true.

use super::{Reducer, ReducerState};
use crate::condition::{Condition, ConditionType, Status};
use crate::event::Event;

pub struct HealthReducer;

impl Reducer for HealthReducer {
    fn reduce(
        &self,
        status: &Status,
        _state: &ReducerState,
        event: &Event,
    ) -> (Status, ReducerState) {
        let mut any_known = false;
        let mut any_false = false;
        for cond in &status.conditions {
            match cond.status {
                Some(false) => {
                    any_known = true;
                    any_false = true;
                }
                Some(true) => any_known = true,
                None => {}
            }
        }
        let aggregate = if !any_known {
            None
        } else if any_false {
            Some(false)
        } else {
            Some(true)
        };

        let last_probe = status
            .conditions
            .iter()
            .filter_map(|c| c.last_probe_time)
            .max();
        let prev = &status.healthy;
        let healthy = Condition {
            kind: ConditionType::Healthy,
            status: aggregate,
            last_probe_time: last_probe.or(prev.last_probe_time),
            last_transition_time: if aggregate != prev.status {
                Some(event.timestamp())
            } else {
                prev.last_transition_time
            },
            extra_data: prev.extra_data.clone(),
        };
        (status.with_healthy(healthy), ReducerState::None)
    }
}
