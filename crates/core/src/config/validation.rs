use std::collections::HashSet;

use super::types::EngineConfig;
use crate::error::ConfigError;
use crate::packet::StreamType;

impl EngineConfig {
    /// Validate the config: sizes, ranges, pipeline ids and stream types.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_hub()?;
        self.validate_analytics()?;
        self.validate_pipelines()?;
        self.validate_alerts()?;
        Ok(())
    }

    fn validate_hub(&self) -> Result<(), ConfigError> {
        if self.hub.max_data_points == 0 {
            return Err(ConfigError::Invalid("hub.max_data_points must be > 0".into()));
        }
        if self.hub.channel_capacity == 0 {
            return Err(ConfigError::Invalid("hub.channel_capacity must be > 0".into()));
        }
        Ok(())
    }

    fn validate_analytics(&self) -> Result<(), ConfigError> {
        if self.analytics.refresh_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "analytics.refresh_interval_secs must be > 0".into(),
            ));
        }
        let decay = self.analytics.latency_decay;
        if !(0.0..=1.0).contains(&decay) {
            return Err(ConfigError::Invalid(format!(
                "analytics.latency_decay must be within [0, 1], got {decay}"
            )));
        }
        Ok(())
    }

    /// Ids must be unique and non-empty; stream types must resolve and a
    /// pipeline may not re-emit into the stream it reads.
    fn validate_pipelines(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for pipeline in &self.pipelines {
            if pipeline.id.trim().is_empty() {
                return Err(ConfigError::EmptyPipelineId);
            }
            if !seen.insert(pipeline.id.as_str()) {
                return Err(ConfigError::DuplicatePipeline(pipeline.id.clone()));
            }
            let source = pipeline.resolve_source()?;
            let output = pipeline.resolve_output()?;
            if source == output {
                return Err(ConfigError::FeedbackLoop(pipeline.id.clone()));
            }
        }
        Ok(())
    }

    fn validate_alerts(&self) -> Result<(), ConfigError> {
        for rule in &self.alerts {
            if rule.metric.is_empty() {
                return Err(ConfigError::Invalid("alert rule metric must not be empty".into()));
            }
            if !(rule.threshold > 0.0) {
                return Err(ConfigError::Invalid(format!(
                    "alert rule '{}' threshold must be > 0, got {}",
                    rule.metric, rule.threshold
                )));
            }
            if rule.resolve_source()? == StreamType::SensorAlerts {
                return Err(ConfigError::FeedbackLoop(format!("alert rule '{}'", rule.alert_type)));
            }
        }
        Ok(())
    }
}
