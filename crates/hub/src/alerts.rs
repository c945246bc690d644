//! Threshold alerts built on top of [`StreamHub::create_alert_stream`].

use futures::stream::{BoxStream, StreamExt};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use pulse_core::{meta, Alert, AlertRule, ConfigError, Packet, StreamType};

use crate::hub::StreamHub;

pub type AlertStream = BoxStream<'static, Alert>;

/// Source tag on alerts the generator publishes into `sensor_alerts`.
pub const ALERT_SOURCE: &str = "alert_generator";

/// Turns threshold rules into alert streams. Holds no state of its own.
#[derive(Debug, Clone)]
pub struct AlertGenerator {
    hub: StreamHub,
}

impl AlertGenerator {
    pub fn new(hub: StreamHub) -> Self {
        Self { hub }
    }

    /// Alerts for `rule`, starting with the next matching reading.
    pub fn watch(&self, rule: &AlertRule) -> Result<AlertStream, ConfigError> {
        let source = rule.resolve_source()?;
        Ok(self
            .hub
            .create_alert_stream(source, &rule.metric, rule.threshold, &rule.alert_type))
    }

    /// Publish every alert for `rule` into `sensor_alerts` from a background
    /// task. The task ends when the hub is disposed or the handle is aborted.
    pub fn forward(&self, rule: &AlertRule) -> Result<JoinHandle<()>, ConfigError> {
        if rule.resolve_source()? == StreamType::SensorAlerts {
            return Err(ConfigError::FeedbackLoop(format!("alert rule '{}'", rule.alert_type)));
        }
        let mut alerts = self.watch(rule)?;
        let hub = self.hub.clone();
        let metric = rule.metric.clone();
        info!(
            metric = %rule.metric,
            threshold = rule.threshold,
            alert_type = %rule.alert_type,
            "forwarding alerts"
        );

        Ok(tokio::spawn(async move {
            while let Some(alert) = alerts.next().await {
                debug!(
                    metric = %alert.metric,
                    value = alert.value,
                    severity = alert.severity.as_str(),
                    "alert raised"
                );
                let packet = Packet::new(StreamType::SensorAlerts, alert.clone(), alert.timestamp)
                    .with_source(ALERT_SOURCE)
                    .with_meta(meta::METRIC, metric.as_str());
                hub.emit_packet(packet);
            }
            debug!(metric = %metric, "alert forwarding finished");
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_core::{HubConfig, Payload, Severity};

    fn running_hub() -> StreamHub {
        let hub = StreamHub::new(HubConfig::default());
        hub.start();
        hub
    }

    #[tokio::test]
    async fn watch_yields_classified_alerts() {
        let hub = running_hub();
        let generator = AlertGenerator::new(hub.clone());
        let mut alerts = generator
            .watch(&AlertRule::new("temperature", 30.0, "high_temperature"))
            .unwrap();

        hub.update_chart_data("temperature", "kitchen", 28.0, None);
        hub.update_chart_data("temperature", "kitchen", 37.0, None);

        let alert = alerts.next().await.unwrap();
        assert_eq!(alert.value, 37.0);
        assert_eq!(alert.severity, Severity::Medium);
    }

    #[tokio::test]
    async fn forward_publishes_into_sensor_alerts() {
        let hub = running_hub();
        let mut published = hub.get_stream(StreamType::SensorAlerts);
        let generator = AlertGenerator::new(hub.clone());
        let task = generator
            .forward(&AlertRule::new("humidity", 60.0, "damp"))
            .unwrap();

        hub.update_chart_data("humidity", "bathroom", 130.0, None);

        let packet = published.next().await.unwrap();
        assert_eq!(packet.source, ALERT_SOURCE);
        assert_eq!(packet.metric(), Some("humidity"));
        match packet.payload {
            Payload::Alert(alert) => {
                assert_eq!(alert.severity, Severity::Critical);
                assert_eq!(alert.alert_type, "damp");
            }
            other => panic!("expected alert payload, got {other:?}"),
        }

        hub.dispose();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn forward_rejects_alert_source() {
        let generator = AlertGenerator::new(running_hub());
        let mut rule = AlertRule::new("temperature", 30.0, "loop");
        rule.source_type = "sensor_alerts".into();
        assert!(matches!(generator.forward(&rule), Err(ConfigError::FeedbackLoop(_))));

        rule.source_type = "weather".into();
        assert!(matches!(generator.watch(&rule), Err(ConfigError::UnknownStreamType(_))));
    }
}
