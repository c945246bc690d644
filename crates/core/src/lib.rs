pub mod clock;
pub mod config;
pub mod error;
pub mod packet;
pub mod series;
pub mod stats;

pub use clock::{system_clock, Clock, ManualClock, SharedClock, SystemClock};
pub use config::{AlertRule, AnalyticsConfig, EngineConfig, HubConfig, PipelineConfig};
pub use error::*;
pub use packet::{meta, Metadata, Packet, PacketId, Payload, StreamType};
pub use series::{ChartPoint, ChartSeries, RingBuffer, SeriesKey, DEFAULT_MAX_DATA_POINTS};
pub use stats::{
    aggregate, severity, trend, AggregateStats, Alert, Severity, TrendDirection, TrendSummary,
};
