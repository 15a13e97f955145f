//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A monitored endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorTarget {
    pub id: i64,
    pub ip: String,
    pub frequency_seconds: i64,
    pub is_active: bool,
    pub url: Option<String>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl MonitorTarget {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// One probe's recorded outcome.
///
/// A loss sample has no latency and no hop count; a success sample has both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingSample {
    pub time: DateTime<Utc>,
    pub target_id: i64,
    pub latency_ms: Option<f64>,
    pub hops: Option<i64>,
    pub packet_loss: bool,
}

impl PingSample {
    /// A successful probe observation.
    pub fn success(time: DateTime<Utc>, target_id: i64, latency_ms: f64, hops: i64) -> Self {
        Self {
            time,
            target_id,
            latency_ms: Some(latency_ms),
            hops: Some(hops),
            packet_loss: false,
        }
    }

    /// A probe that got no reply within the timeout.
    pub fn loss(time: DateTime<Utc>, target_id: i64) -> Self {
        Self {
            time,
            target_id,
            latency_ms: None,
            hops: None,
            packet_loss: true,
        }
    }
}

/// One roll-up bucket (minute or hour level), or a raw sample folded into
/// the same shape for uniform analytics queries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateRow {
    /// Bucket start, unix epoch seconds, aligned to the level's width.
    pub bucket: i64,
    pub target_id: i64,
    pub avg_latency: Option<f64>,
    pub min_latency: Option<f64>,
    pub max_latency: Option<f64>,
    pub loss_count: i64,
    pub samples: i64,
}

/// Lifecycle event kinds recorded in the event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Start,
    Stop,
    Pause,
    Resume,
    Delete,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Start => "start",
            EventType::Stop => "stop",
            EventType::Pause => "pause",
            EventType::Resume => "resume",
            EventType::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "start" => Some(EventType::Start),
            "stop" => Some(EventType::Stop),
            "pause" => Some(EventType::Pause),
            "resume" => Some(EventType::Resume),
            "delete" => Some(EventType::Delete),
            _ => None,
        }
    }
}

/// A row in the event log.
#[derive(Debug, Clone, Serialize)]
pub struct EventLog {
    pub id: i64,
    pub target_id: Option<i64>,
    pub event_type: EventType,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// Retention level a read resolves against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    Raw,
    Minute,
    Hour,
    Auto,
}

impl Resolution {
    /// Native bucket width in seconds. Raw samples arrive once per second
    /// at the fastest cadence.
    pub fn bucket_seconds(&self) -> i64 {
        match self {
            Resolution::Raw => 1,
            Resolution::Minute => 60,
            Resolution::Hour => 3600,
            Resolution::Auto => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_constructors_uphold_loss_shape() {
        let t = Utc::now();
        let ok = PingSample::success(t, 1, 12.5, 56);
        assert!(!ok.packet_loss);
        assert_eq!(ok.latency_ms, Some(12.5));
        assert_eq!(ok.hops, Some(56));

        let lost = PingSample::loss(t, 1);
        assert!(lost.packet_loss);
        assert!(lost.latency_ms.is_none());
        assert!(lost.hops.is_none());
    }

    #[test]
    fn test_event_type_round_trip() {
        for ev in [
            EventType::Start,
            EventType::Stop,
            EventType::Pause,
            EventType::Resume,
            EventType::Delete,
        ] {
            assert_eq!(EventType::parse(ev.as_str()), Some(ev));
        }
        assert_eq!(EventType::parse("restart"), None);
    }
}
