//! Stream-state reducer
//!
//! Derives the `Active` condition from media-server state changes and,
//! when configured with an exchange, republishes the event so downstream
//! consumers see state transitions without subscribing to the raw stream.

use super::{probe, Reducer, ReducerState};
use crate::condition::{ConditionType, Status};
use crate::event::{Event, StreamStateEvent};
use std::sync::Arc;

/// Best-effort republish hook. Implementations must not block: the reduce
/// path is on the ingestion hot path.
pub trait StatePublisher: Send + Sync {
    fn publish_state(&self, exchange: &str, routing_key: &str, event: &StreamStateEvent);
}

#[derive(Default)]
pub struct StreamStateReducer {
    republish: Option<(String, Arc<dyn StatePublisher>)>,
}

impl StreamStateReducer {
    pub fn new() -> Self {
        Self { republish: None }
    }

    pub fn with_republish(exchange: impl Into<String>, publisher: Arc<dyn StatePublisher>) -> Self {
        Self {
            republish: Some((exchange.into(), publisher)),
        }
    }
}

fn state_routing_key(event: &StreamStateEvent) -> String {
    match &event.base.region {
        Some(region) => format!("stream.state.{}.{}", region, event.base.stream_id),
        None => format!("stream.state.{}", event.base.stream_id),
    }
}

impl Reducer for StreamStateReducer {
    fn reduce(
        &self,
        status: &Status,
        _state: &ReducerState,
        event: &Event,
    ) -> (Status, ReducerState) {
        let Event::StreamState(evt) = event else {
            return (status.clone(), ReducerState::None);
        };
        if let Some((exchange, publisher)) = &self.republish {
            publisher.publish_state(exchange, &state_routing_key(evt), evt);
        }
        let active = probe(
            status,
            ConditionType::Active,
            Some(evt.state.active),
            evt.base.timestamp,
        );
        (status.with_conditions(vec![active]), ReducerState::None)
    }
}
