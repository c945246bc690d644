use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::packet::StreamType;
use crate::series::DEFAULT_MAX_DATA_POINTS;

// ── Top-level config ────────────────────────────────────────────────

/// Full configuration for one engine instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Stream hub sizing.
    #[serde(default)]
    pub hub: HubConfig,

    /// Pipeline analytics refresh behaviour.
    #[serde(default)]
    pub analytics: AnalyticsConfig,

    /// Pipelines created when the engine initializes.
    #[serde(default)]
    pub pipelines: Vec<PipelineConfig>,

    /// Threshold alert rules forwarded into `sensor_alerts` while running.
    #[serde(default)]
    pub alerts: Vec<AlertRule>,
}

// ── Section configs ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubConfig {
    /// Cap on points kept per chart series.
    #[serde(default = "default_max_data_points")]
    pub max_data_points: usize,

    /// Broadcast buffer per stream type. Subscribers further behind than
    /// this skip the oldest packets.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_max_data_points() -> usize {
    DEFAULT_MAX_DATA_POINTS
}

fn default_channel_capacity() -> usize {
    256
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_data_points: default_max_data_points(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsConfig {
    /// Seconds between periodic analytics refreshes.
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,

    /// Multiplier applied to an idle pipeline's average latency per refresh.
    #[serde(default = "default_latency_decay")]
    pub latency_decay: f64,
}

fn default_refresh_interval_secs() -> u64 {
    10
}

fn default_latency_decay() -> f64 {
    0.5
}

impl AnalyticsConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs.max(1))
    }
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: default_refresh_interval_secs(),
            latency_decay: default_latency_decay(),
        }
    }
}

// ── Pipelines ───────────────────────────────────────────────────────

/// Declarative description of one pipeline.
///
/// `operator_chain` names the stages in order. Each stage reads its
/// parameters from `filter_params`, first under `"<name>#<index>"` and then
/// under `"<name>"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub id: String,

    /// Stream type the pipeline reads from (e.g. `"sensor_metrics"`).
    pub source_type: String,

    #[serde(default)]
    pub filter_params: HashMap<String, serde_json::Value>,

    #[serde(default)]
    pub operator_chain: Vec<String>,

    /// Default window for buffer/debounce/throttle stages.
    #[serde(default)]
    pub interval_hint_ms: Option<u64>,

    /// Default batch cap for buffer stages.
    #[serde(default)]
    pub buffer_size_hint: Option<usize>,

    /// Fold numeric outputs into the chart series `<id>@<room_id>`.
    #[serde(default)]
    pub persist: bool,

    /// Stream type outputs are re-emitted into.
    #[serde(default = "default_output_type")]
    pub output_type: String,

    /// Stop the pipeline once its error count exceeds this budget.
    #[serde(default)]
    pub error_budget: Option<u64>,
}

fn default_output_type() -> String {
    StreamType::AnalysisResults.to_string()
}

impl PipelineConfig {
    pub fn new(id: impl Into<String>, source: StreamType) -> Self {
        Self {
            id: id.into(),
            source_type: source.to_string(),
            filter_params: HashMap::new(),
            operator_chain: Vec::new(),
            interval_hint_ms: None,
            buffer_size_hint: None,
            persist: false,
            output_type: default_output_type(),
            error_budget: None,
        }
    }

    /// Append an operator to the chain.
    pub fn operator(mut self, name: impl Into<String>) -> Self {
        self.operator_chain.push(name.into());
        self
    }

    /// Append an operator together with its parameters.
    pub fn operator_with(mut self, name: impl Into<String>, params: serde_json::Value) -> Self {
        let name = name.into();
        self.filter_params.insert(name.clone(), params);
        self.operator_chain.push(name);
        self
    }

    pub fn interval_hint(mut self, interval: Duration) -> Self {
        self.interval_hint_ms = Some(interval.as_millis() as u64);
        self
    }

    pub fn buffer_size_hint(mut self, size: usize) -> Self {
        self.buffer_size_hint = Some(size);
        self
    }

    pub fn persistent(mut self) -> Self {
        self.persist = true;
        self
    }

    pub fn output(mut self, stream: StreamType) -> Self {
        self.output_type = stream.to_string();
        self
    }

    pub fn error_budget(mut self, budget: u64) -> Self {
        self.error_budget = Some(budget);
        self
    }

    pub fn resolve_source(&self) -> Result<StreamType, ConfigError> {
        self.source_type.parse()
    }

    pub fn resolve_output(&self) -> Result<StreamType, ConfigError> {
        self.output_type.parse()
    }

    /// Parameters for the operator at `index` in the chain.
    pub fn params_for(&self, name: &str, index: usize) -> Option<&serde_json::Value> {
        self.filter_params
            .get(&format!("{name}#{index}"))
            .or_else(|| self.filter_params.get(name))
    }

    pub fn interval_hint_duration(&self) -> Option<Duration> {
        self.interval_hint_ms.map(Duration::from_millis)
    }
}

// ── Alerts ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub metric: String,
    pub threshold: f64,
    pub alert_type: String,

    #[serde(default = "default_alert_source")]
    pub source_type: String,
}

fn default_alert_source() -> String {
    StreamType::SensorMetrics.to_string()
}

impl AlertRule {
    pub fn new(metric: impl Into<String>, threshold: f64, alert_type: impl Into<String>) -> Self {
        Self {
            metric: metric.into(),
            threshold,
            alert_type: alert_type.into(),
            source_type: default_alert_source(),
        }
    }

    pub fn resolve_source(&self) -> Result<StreamType, ConfigError> {
        self.source_type.parse()
    }
}
