//! Integration tests for the engine lifecycle with an attached event
//! source, alert rules and analytics refresh.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use futures::StreamExt;
use serde_json::json;
use tokio::time::timeout;

use pulse_core::{
    AlertRule, AnalyticsConfig, Clock, EngineConfig, ManualClock, Packet, Payload,
    PipelineConfig, Severity, StreamType,
};
use pulse_pipeline::{
    init_tracing, DomainEvent, DomainEventKind, Engine, EngineState, LocalEventBus,
};

const TIMEOUT: Duration = Duration::from_secs(5);
const SETTLE: Duration = Duration::from_millis(5);

fn reading(room: &str, metric: &str, value: f64) -> DomainEvent {
    DomainEvent::SensorReadingUpdated {
        device_id: format!("{room}-sensor"),
        room_id: room.to_string(),
        metric: metric.to_string(),
        value,
        label: None,
    }
}

fn climate_config() -> EngineConfig {
    init_tracing();
    let mut config = EngineConfig::local();
    config.pipelines.push(
        PipelineConfig::new("warm-readings", StreamType::SensorMetrics)
            .operator_with("filter", json!({ "metric": "temperature", "min_value": 25.0 }))
            .persistent(),
    );
    config
        .alerts
        .push(AlertRule::new("temperature", 30.0, "high_temperature"));
    config
}

#[tokio::test(start_paused = true)]
async fn readings_flow_through_pipeline_and_alerts() {
    let engine = Engine::new(climate_config()).unwrap();
    let bus = Arc::new(LocalEventBus::new());
    engine.attach_source(bus.clone());
    engine.start().await.unwrap();
    assert_eq!(engine.state(), EngineState::Running);

    let mut alerts = engine.hub().get_stream(StreamType::SensorAlerts);
    let (_, mut results) = engine.orchestrator().subscribe_channel("warm-readings", 16);

    bus.publish(&reading("office", "temperature", 21.0));
    bus.publish(&reading("office", "humidity", 55.0));
    bus.publish(&reading("office", "temperature", 40.0));

    let out = timeout(TIMEOUT, results.recv()).await.unwrap().unwrap();
    assert_eq!(out.value(), Some(40.0));
    assert_eq!(out.source, "warm-readings");

    let alert_packet = timeout(TIMEOUT, alerts.next()).await.unwrap().unwrap();
    let Payload::Alert(alert) = &alert_packet.payload else {
        panic!("expected an alert payload, got {:?}", alert_packet.payload);
    };
    assert_eq!(alert.metric, "temperature");
    assert_eq!(alert.value, 40.0);
    assert_eq!(alert.severity, Severity::Medium);
    assert_eq!(alert.alert_type, "high_temperature");

    tokio::time::sleep(SETTLE).await;
    assert!(results.try_recv().is_err());

    // Raw readings and the persisted pipeline output both land in series.
    assert_eq!(engine.hub().get_chart_data("temperature", "office").len(), 2);
    assert_eq!(engine.hub().get_chart_data("humidity", "office").len(), 1);
    let persisted = engine.hub().get_chart_data("warm-readings", "office");
    assert_eq!(persisted.iter().map(|p| p.value).collect::<Vec<_>>(), vec![40.0]);
}

#[tokio::test(start_paused = true)]
async fn dispose_detaches_sources_and_clears_state() {
    let engine = Engine::new(climate_config()).unwrap();
    let bus = Arc::new(LocalEventBus::new());
    engine.attach_source(bus.clone());
    engine.start().await.unwrap();
    assert_eq!(bus.handler_count(DomainEventKind::SensorReadingUpdated), 1);

    bus.publish(&reading("hall", "temperature", 26.0));
    tokio::time::sleep(SETTLE).await;

    engine.dispose().await;
    assert_eq!(engine.state(), EngineState::Disposed);
    for kind in DomainEventKind::ALL {
        assert_eq!(bus.handler_count(kind), 0);
    }
    assert!(engine.orchestrator().pipeline_ids().is_empty());
    assert!(engine.hub().series_keys().is_empty());
    assert_eq!(bus.publish(&reading("hall", "temperature", 27.0)), 0);

    // A disposed engine can be brought back up from its config.
    engine.start().await.unwrap();
    assert_eq!(engine.orchestrator().pipeline_ids(), vec!["warm-readings".to_string()]);
    assert!(engine.orchestrator().is_active("warm-readings"));
}

#[tokio::test(start_paused = true)]
async fn stopped_engine_ignores_events() {
    let engine = Engine::new(climate_config()).unwrap();
    let bus = Arc::new(LocalEventBus::new());
    engine.attach_source(bus.clone());
    engine.start().await.unwrap();
    let (_, mut results) = engine.orchestrator().subscribe_channel("warm-readings", 16);

    engine.stop();
    assert_eq!(engine.state(), EngineState::Stopped);
    bus.publish(&reading("office", "temperature", 35.0));
    tokio::time::sleep(SETTLE).await;
    assert!(results.try_recv().is_err());

    engine.start().await.unwrap();
    bus.publish(&reading("office", "temperature", 36.0));
    let out = timeout(TIMEOUT, results.recv()).await.unwrap().unwrap();
    assert_eq!(out.value(), Some(36.0));
}

#[tokio::test(start_paused = true)]
async fn engines_are_independent() {
    let first = Engine::new(climate_config()).unwrap();
    let second = Engine::new(climate_config()).unwrap();
    first.start().await.unwrap();
    second.start().await.unwrap();
    let (_, mut first_rx) = first.orchestrator().subscribe_channel("warm-readings", 16);
    let (_, mut second_rx) = second.orchestrator().subscribe_channel("warm-readings", 16);

    first.hub().update_chart_data("temperature", "attic", 28.0, None);

    let out = timeout(TIMEOUT, first_rx.recv()).await.unwrap().unwrap();
    assert_eq!(out.value(), Some(28.0));
    tokio::time::sleep(SETTLE).await;
    assert!(second_rx.try_recv().is_err());
    assert!(second.hub().get_chart_data("temperature", "attic").is_empty());

    let second_metrics = second.orchestrator().pipeline_metrics("warm-readings").await.unwrap();
    assert_eq!(second_metrics.total_events, 0);
}

#[tokio::test(start_paused = true)]
async fn analytics_refresh_rolls_rate_and_decays_latency() {
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()));
    let mut config = EngineConfig::local();
    config.analytics = AnalyticsConfig {
        refresh_interval_secs: 1,
        latency_decay: 0.5,
    };
    config
        .pipelines
        .push(PipelineConfig::new("latency", StreamType::SensorMetrics));
    let engine = Engine::with_clock(config, clock.clone()).unwrap();
    engine.start().await.unwrap();

    // Emitted two seconds in the past by the hub's clock.
    let emitted_at = clock.now() - chrono::Duration::seconds(2);
    let stale = Packet::new(StreamType::SensorMetrics, 5.0, emitted_at);
    engine.hub().emit_packet(stale);
    tokio::time::sleep(SETTLE).await;

    let metrics = engine.orchestrator().pipeline_metrics("latency").await.unwrap();
    assert_eq!(metrics.total_events, 1);
    assert_eq!(metrics.average_latency_ms, 2000.0);
    assert_eq!(metrics.last_event_time, Some(clock.now()));

    // First refresh sees one event in the window.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    let metrics = engine.orchestrator().pipeline_metrics("latency").await.unwrap();
    assert_eq!(metrics.events_per_second, 1.0);
    assert_eq!(metrics.average_latency_ms, 2000.0);

    // Second refresh sees an idle window.
    tokio::time::sleep(Duration::from_secs(1)).await;
    let metrics = engine.orchestrator().pipeline_metrics("latency").await.unwrap();
    assert_eq!(metrics.events_per_second, 0.0);
    assert_eq!(metrics.average_latency_ms, 1000.0);
}
