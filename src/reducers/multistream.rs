//! Multistream reducer
//!
//! `Multistreaming` tracks the connection state of the most recently
//! reported push target.

use super::{probe, Reducer, ReducerState};
use crate::condition::{ConditionType, Status};
use crate::event::{Event, TargetStatus};

pub struct MultistreamReducer;

impl Reducer for MultistreamReducer {
    fn reduce(
        &self,
        status: &Status,
        _state: &ReducerState,
        event: &Event,
    ) -> (Status, ReducerState) {
        let Event::Multistream(evt) = event else {
            return (status.clone(), ReducerState::None);
        };
        let connected = matches!(evt.status, TargetStatus::Connected);
        let multistreaming = probe(
            status,
            ConditionType::Multistreaming,
            Some(connected),
            evt.base.timestamp,
        );
        (
            status.with_conditions(vec![multistreaming]),
            ReducerState::None,
        )
    }
}
