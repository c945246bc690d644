use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ConfigError;
use crate::stats::{AggregateStats, Alert, TrendSummary};

/// Unique packet identifier.
pub type PacketId = Uuid;

/// Free-form packet metadata.
pub type Metadata = HashMap<String, String>;

/// Metadata keys understood by the hub, filters and pipelines.
pub mod meta {
    pub const METRIC: &str = "metric";
    pub const ROOM_ID: &str = "room_id";
    pub const LABEL: &str = "label";
    pub const PIPELINE_ID: &str = "pipeline_id";
    pub const ORIGIN_STREAM: &str = "origin_stream";
    pub const BATCH_SIZE: &str = "batch_size";
}

/// The logical stream a packet travels on. Each variant owns exactly one
/// broadcast channel in the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamType {
    SensorMetrics,
    SensorAlerts,
    AutomationStatus,
    SystemStatus,
    AnalysisResults,
    ChartData,
    Statistics,
}

impl StreamType {
    pub const ALL: [StreamType; 7] = [
        StreamType::SensorMetrics,
        StreamType::SensorAlerts,
        StreamType::AutomationStatus,
        StreamType::SystemStatus,
        StreamType::AnalysisResults,
        StreamType::ChartData,
        StreamType::Statistics,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamType::SensorMetrics => "sensor_metrics",
            StreamType::SensorAlerts => "sensor_alerts",
            StreamType::AutomationStatus => "automation_status",
            StreamType::SystemStatus => "system_status",
            StreamType::AnalysisResults => "analysis_results",
            StreamType::ChartData => "chart_data",
            StreamType::Statistics => "statistics",
        }
    }
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StreamType {
    type Err = ConfigError;

    /// Accepts both `sensor_metrics` and `sensorMetrics` spellings.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .flat_map(char::to_lowercase)
            .collect();
        StreamType::ALL
            .into_iter()
            .find(|t| t.as_str().replace('_', "") == normalized)
            .ok_or_else(|| ConfigError::UnknownStreamType(s.to_string()))
    }
}

/// Typed packet payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Payload {
    Number(f64),
    Text(String),
    Flag(bool),
    Json(serde_json::Value),
    Batch(Vec<Packet>),
    Aggregate(AggregateStats),
    Trend(TrendSummary),
    Alert(Alert),
}

impl Payload {
    /// Numeric view of the payload. JSON numbers count as numeric.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Payload::Number(v) => Some(*v),
            Payload::Json(v) => v.as_f64(),
            _ => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        self.as_f64().is_some()
    }

    /// Number of packets carried by a batch payload.
    pub fn batch_len(&self) -> Option<usize> {
        match self {
            Payload::Batch(items) => Some(items.len()),
            _ => None,
        }
    }
}

impl From<f64> for Payload {
    fn from(v: f64) -> Self {
        Payload::Number(v)
    }
}

impl From<i64> for Payload {
    fn from(v: i64) -> Self {
        Payload::Number(v as f64)
    }
}

impl From<bool> for Payload {
    fn from(v: bool) -> Self {
        Payload::Flag(v)
    }
}

impl From<&str> for Payload {
    fn from(v: &str) -> Self {
        Payload::Text(v.to_string())
    }
}

impl From<String> for Payload {
    fn from(v: String) -> Self {
        Payload::Text(v)
    }
}

impl From<serde_json::Value> for Payload {
    fn from(v: serde_json::Value) -> Self {
        Payload::Json(v)
    }
}

impl From<AggregateStats> for Payload {
    fn from(v: AggregateStats) -> Self {
        Payload::Aggregate(v)
    }
}

impl From<TrendSummary> for Payload {
    fn from(v: TrendSummary) -> Self {
        Payload::Trend(v)
    }
}

impl From<Alert> for Payload {
    fn from(v: Alert) -> Self {
        Payload::Alert(v)
    }
}

/// The atomic unit of streamed data.
///
/// Packets are never mutated after emission; transforms derive new packets
/// through [`Packet::with_payload`] and [`Packet::rerouted`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    pub id: PacketId,
    pub stream_type: StreamType,
    pub payload: Payload,
    pub timestamp: DateTime<Utc>,
    /// Origin identifier (device id, pipeline id, ...).
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Packet {
    pub fn new(
        stream_type: StreamType,
        payload: impl Into<Payload>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            stream_type,
            payload: payload.into(),
            timestamp,
            source: String::new(),
            metadata: Metadata::new(),
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata.extend(metadata);
        self
    }

    /// Derive a new packet carrying `payload`, keeping type, timestamp,
    /// source and metadata.
    pub fn with_payload(&self, payload: impl Into<Payload>) -> Packet {
        Packet {
            id: Uuid::new_v4(),
            stream_type: self.stream_type,
            payload: payload.into(),
            timestamp: self.timestamp,
            source: self.source.clone(),
            metadata: self.metadata.clone(),
        }
    }

    /// Derive a copy of this packet addressed to another stream, tagged with
    /// a new source and the stream it came from.
    pub fn rerouted(&self, stream_type: StreamType, source: &str) -> Packet {
        let mut metadata = self.metadata.clone();
        metadata.insert(meta::ORIGIN_STREAM.into(), self.stream_type.to_string());
        Packet {
            id: Uuid::new_v4(),
            stream_type,
            payload: self.payload.clone(),
            timestamp: self.timestamp,
            source: source.to_string(),
            metadata,
        }
    }

    pub fn value(&self) -> Option<f64> {
        self.payload.as_f64()
    }

    pub fn metric(&self) -> Option<&str> {
        self.metadata.get(meta::METRIC).map(String::as_str)
    }

    pub fn room_id(&self) -> Option<&str> {
        self.metadata.get(meta::ROOM_ID).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_type_parses_both_spellings() {
        assert_eq!("sensor_metrics".parse::<StreamType>().unwrap(), StreamType::SensorMetrics);
        assert_eq!("sensorMetrics".parse::<StreamType>().unwrap(), StreamType::SensorMetrics);
        assert_eq!("analysisResults".parse::<StreamType>().unwrap(), StreamType::AnalysisResults);
        assert!(matches!(
            "weather".parse::<StreamType>(),
            Err(ConfigError::UnknownStreamType(s)) if s == "weather"
        ));
    }

    #[test]
    fn stream_type_display_roundtrips() {
        for t in StreamType::ALL {
            assert_eq!(t.to_string().parse::<StreamType>().unwrap(), t);
        }
    }

    #[test]
    fn payload_numeric_view() {
        assert_eq!(Payload::Number(2.5).as_f64(), Some(2.5));
        assert_eq!(Payload::Json(serde_json::json!(4)).as_f64(), Some(4.0));
        assert_eq!(Payload::Text("x".into()).as_f64(), None);
        assert!(!Payload::Flag(true).is_numeric());
    }

    #[test]
    fn with_payload_keeps_envelope_but_not_id() {
        let p = Packet::new(StreamType::SensorMetrics, 1.0, Utc::now())
            .with_source("dev-1")
            .with_meta(meta::METRIC, "temperature");
        let q = p.with_payload(2.0);
        assert_ne!(p.id, q.id);
        assert_eq!(q.timestamp, p.timestamp);
        assert_eq!(q.source, "dev-1");
        assert_eq!(q.metric(), Some("temperature"));
        assert_eq!(q.value(), Some(2.0));
    }

    #[test]
    fn rerouted_tags_origin() {
        let p = Packet::new(StreamType::SensorMetrics, 1.0, Utc::now()).with_source("dev-1");
        let q = p.rerouted(StreamType::AnalysisResults, "pipe-a");
        assert_eq!(q.stream_type, StreamType::AnalysisResults);
        assert_eq!(q.source, "pipe-a");
        assert_eq!(q.metadata[meta::ORIGIN_STREAM], "sensor_metrics");
        assert_eq!(q.payload, p.payload);
    }

    #[test]
    fn packet_serde_roundtrip() {
        let p = Packet::new(StreamType::Statistics, "hello", Utc::now()).with_meta("k", "v");
        let json = serde_json::to_string(&p).unwrap();
        let back: Packet = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
    }
}
