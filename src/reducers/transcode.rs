//! Transcode reducer
//!
//! `Transcoding` follows the segment's success flag. `TranscodeRealTime`
//! holds when the encode latency is at most the segment duration, i.e. the
//! fleet keeps up with the incoming stream.

use super::{probe, Reducer, ReducerState};
use crate::condition::{ConditionType, Status};
use crate::event::Event;

pub struct TranscodeReducer;

impl Reducer for TranscodeReducer {
    fn reduce(
        &self,
        status: &Status,
        _state: &ReducerState,
        event: &Event,
    ) -> (Status, ReducerState) {
        let Event::Transcode(evt) = event else {
            return (status.clone(), ReducerState::None);
        };
        let at = evt.base.timestamp;
        let transcoding = probe(status, ConditionType::Transcoding, Some(evt.success), at);
        let real_time = probe(
            status,
            ConditionType::TranscodeRealTime,
            Some(evt.latency_ms as f64 <= evt.segment.duration),
            at,
        );
        (
            status.with_conditions(vec![transcoding, real_time]),
            ReducerState::None,
        )
    }
}
