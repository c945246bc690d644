use std::path::Path;

use tracing::info;

use crate::error::ConfigError;

use super::types::{AnalyticsConfig, EngineConfig, HubConfig};

impl EngineConfig {
    /// Parse config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config = Self::from_toml(&content)?;
        info!(
            path = %path.as_ref().display(),
            pipelines = config.pipelines.len(),
            alerts = config.alerts.len(),
            "engine config loaded"
        );
        Ok(config)
    }

    /// Defaults only: no pipelines, no alert rules.
    pub fn local() -> Self {
        Self {
            hub: HubConfig::default(),
            analytics: AnalyticsConfig::default(),
            pipelines: Vec::new(),
            alerts: Vec::new(),
        }
    }

    // ── Environment variable overrides ──────────────────────────────

    /// Apply environment variable overrides.
    ///
    /// Convention: `PULSE_SECTION_KEY` overrides `section.key`.
    /// - `PULSE_HUB_MAX_DATA_POINTS` -> `hub.max_data_points`
    /// - `PULSE_HUB_CHANNEL_CAPACITY` -> `hub.channel_capacity`
    /// - `PULSE_ANALYTICS_REFRESH_INTERVAL_SECS` -> `analytics.refresh_interval_secs`
    /// - `PULSE_ANALYTICS_LATENCY_DECAY` -> `analytics.latency_decay`
    pub(crate) fn apply_env_overrides(&mut self) {
        if let Some(v) = env_parse("PULSE_HUB_MAX_DATA_POINTS") {
            self.hub.max_data_points = v;
        }
        if let Some(v) = env_parse("PULSE_HUB_CHANNEL_CAPACITY") {
            self.hub.channel_capacity = v;
        }
        if let Some(v) = env_parse("PULSE_ANALYTICS_REFRESH_INTERVAL_SECS") {
            self.analytics.refresh_interval_secs = v;
        }
        if let Some(v) = env_parse("PULSE_ANALYTICS_LATENCY_DECAY") {
            self.analytics.latency_decay = v;
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::local()
    }
}
