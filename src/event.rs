//! Event envelope and wire schema
//!
//! Every broker message body is a JSON document with a `type` tag, a UUID
//! `id`, a millisecond-epoch `timestamp` and a `streamId`, plus type-specific
//! fields. Events are immutable once observed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Fields shared by every event kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventBase {
    /// Unique event ID for idempotency and replay cursors
    pub id: Uuid,
    /// Origin timestamp, milliseconds since the epoch on the wire
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    /// Manifest ID of the stream this event belongs to
    pub stream_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

impl EventBase {
    pub fn new(stream_id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp,
            stream_id: stream_id.into(),
            region: None,
        }
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }
}

/// A transcoded segment with its outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscodeEvent {
    #[serde(flatten)]
    pub base: EventBase,
    pub segment: SegmentMetadata,
    pub start_time: i64,
    pub latency_ms: i64,
    pub success: bool,
    #[serde(default)]
    pub attempts: Vec<TranscodeAttemptInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentMetadata {
    pub seq_no: u64,
    /// Segment duration in milliseconds
    pub duration: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub byte_size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscodeAttemptInfo {
    pub latency_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orchestrator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Connection-state change of one multistream push target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultistreamEvent {
    #[serde(flatten)]
    pub base: EventBase,
    pub target: MultistreamTargetInfo,
    pub status: TargetStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultistreamTargetInfo {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TargetStatus {
    Connected,
    Error,
    Offline,
}

/// Periodic ingest metrics reported by the media server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaServerMetricsEvent {
    #[serde(flatten)]
    pub base: EventBase,
    pub stats: IngestMetrics,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestMetrics {
    #[serde(default)]
    pub error_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_time_ms: Option<i64>,
}

/// Stream went active or inactive on the media server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStateEvent {
    #[serde(flatten)]
    pub base: EventBase,
    pub state: StreamState,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamState {
    pub active: bool,
}

/// Progress snapshot of an async task running against the stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEvent {
    #[serde(flatten)]
    pub base: EventBase,
    pub task: TaskInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInfo {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<serde_json::Value>,
}

/// Uniform event representation across all event kinds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Event {
    Transcode(TranscodeEvent),
    Multistream(MultistreamEvent),
    MediaServerMetrics(MediaServerMetricsEvent),
    StreamState(StreamStateEvent),
    Task(TaskEvent),
}

impl Event {
    pub fn base(&self) -> &EventBase {
        match self {
            Event::Transcode(e) => &e.base,
            Event::Multistream(e) => &e.base,
            Event::MediaServerMetrics(e) => &e.base,
            Event::StreamState(e) => &e.base,
            Event::Task(e) => &e.base,
        }
    }

    pub fn id(&self) -> Uuid {
        self.base().id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.base().timestamp
    }

    pub fn stream_id(&self) -> &str {
        &self.base().stream_id
    }

    pub fn region(&self) -> Option<&str> {
        self.base().region.as_deref()
    }

    /// Wire tag of this event kind
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Transcode(_) => "transcode",
            Event::Multistream(_) => "multistream",
            Event::MediaServerMetrics(_) => "media-server-metrics",
            Event::StreamState(_) => "stream-state",
            Event::Task(_) => "task",
        }
    }
}
