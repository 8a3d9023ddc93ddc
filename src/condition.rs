//! Health conditions and per-manifest status snapshots
//!
//! A condition is a named tri-state signal: `Some(true)`, `Some(false)`, or
//! `None` for unknown (no observation yet). Unknown is distinct from false
//! and serializes to `null`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionType {
    Transcoding,
    TranscodeRealTime,
    Multistreaming,
    Active,
    NoErrors,
    Healthy,
}

impl fmt::Display for ConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConditionType::Transcoding => "Transcoding",
            ConditionType::TranscodeRealTime => "TranscodeRealTime",
            ConditionType::Multistreaming => "Multistreaming",
            ConditionType::Active => "Active",
            ConditionType::NoErrors => "NoErrors",
            ConditionType::Healthy => "Healthy",
        };
        f.write_str(name)
    }
}

/// Condition types monitored for a record unless configured otherwise
pub fn default_condition_types() -> Vec<ConditionType> {
    vec![
        ConditionType::Transcoding,
        ConditionType::TranscodeRealTime,
        ConditionType::Multistreaming,
        ConditionType::Active,
        ConditionType::NoErrors,
    ]
}

/// Per-window rolling counters attached to a condition
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WindowStats {
    /// Samples observed inside the window
    pub count: u64,
    /// Fraction of those samples with status `true`
    pub rate: f64,
}

/// Stats payload keyed by humanized window ("1m", "10m", "1h")
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConditionStats {
    pub windows: BTreeMap<String, WindowStats>,
}

/// Humanized key for a stats window duration
pub fn window_key(window: Duration) -> String {
    let secs = window.as_secs();
    if secs >= 3600 && secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs >= 60 && secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub kind: ConditionType,
    /// `null` on the wire encodes unknown
    #[serde(default)]
    pub status: Option<bool>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub last_probe_time: Option<DateTime<Utc>>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub last_transition_time: Option<DateTime<Utc>>,
    #[serde(
        rename = "extraData",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub extra_data: Option<ConditionStats>,
}

impl Condition {
    pub fn new(kind: ConditionType) -> Self {
        Self {
            kind,
            status: None,
            last_probe_time: None,
            last_transition_time: None,
            extra_data: None,
        }
    }

    /// New condition with `status` probed at `probe_time`.
    ///
    /// The transition timestamp moves only when the status value changes.
    pub fn probed(&self, status: Option<bool>, probe_time: DateTime<Utc>) -> Self {
        let last_transition_time = if status != self.status {
            Some(probe_time)
        } else {
            self.last_transition_time
        };
        Self {
            kind: self.kind,
            status,
            last_probe_time: Some(probe_time),
            last_transition_time,
            extra_data: self.extra_data.clone(),
        }
    }

    pub fn with_stats(&self, stats: ConditionStats) -> Self {
        Self {
            extra_data: Some(stats),
            ..self.clone()
        }
    }
}

/// Point-in-time health snapshot of one manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    pub id: String,
    pub healthy: Condition,
    pub conditions: Vec<Condition>,
    /// Timestamp of the most recent input event
    #[serde(
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_event_time: Option<DateTime<Utc>>,
}

impl Status {
    pub fn new(manifest_id: impl Into<String>, condition_types: &[ConditionType]) -> Self {
        Self {
            id: manifest_id.into(),
            healthy: Condition::new(ConditionType::Healthy),
            conditions: condition_types.iter().copied().map(Condition::new).collect(),
            last_event_time: None,
        }
    }

    pub fn condition(&self, kind: ConditionType) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.kind == kind)
    }

    /// Replace the matching conditions, leaving the rest untouched.
    ///
    /// Conditions of a type this record is not configured for are dropped.
    pub fn with_conditions(&self, updated: Vec<Condition>) -> Self {
        let mut next = self.clone();
        for cond in updated {
            if let Some(slot) = next.conditions.iter_mut().find(|c| c.kind == cond.kind) {
                *slot = cond;
            }
        }
        next
    }

    pub fn with_healthy(&self, healthy: Condition) -> Self {
        Self {
            healthy,
            ..self.clone()
        }
    }
}
