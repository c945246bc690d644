//! Per-pipeline throughput, latency and error tracking.
//!
//! Counters are updated for every packet a pipeline emits; a refresh tick
//! rolls the windowed rate and decays latency of idle pipelines.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use pulse_core::{AnalyticsConfig, Packet, SharedClock};

/// Snapshot of one pipeline's analytics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineAnalytics {
    pub pipeline_id: String,
    /// Packets emitted since creation. Never decreases.
    pub total_events: u64,
    pub events_per_second: f64,
    /// Running average of `now - packet.timestamp`, in milliseconds.
    pub average_latency_ms: f64,
    /// Stage and subscriber failures. Never decreases.
    pub error_count: u64,
    /// Deliveries skipped because a subscriber queue was full.
    pub dropped_deliveries: u64,
    pub last_event_time: Option<DateTime<Utc>>,
}

impl PipelineAnalytics {
    fn new(pipeline_id: &str) -> Self {
        Self {
            pipeline_id: pipeline_id.to_string(),
            total_events: 0,
            events_per_second: 0.0,
            average_latency_ms: 0.0,
            error_count: 0,
            dropped_deliveries: 0,
            last_event_time: None,
        }
    }
}

#[derive(Debug)]
struct Entry {
    analytics: PipelineAnalytics,
    /// Events since the last tick.
    window_events: u64,
    last_arrival: Option<Instant>,
}

/// Shared analytics store for every pipeline of one orchestrator.
#[derive(Debug, Clone)]
pub struct AnalyticsCollector {
    inner: Arc<Mutex<HashMap<String, Entry>>>,
    config: AnalyticsConfig,
    clock: SharedClock,
}

impl AnalyticsCollector {
    pub fn new(config: AnalyticsConfig, clock: SharedClock) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            config,
            clock,
        }
    }

    pub fn config(&self) -> &AnalyticsConfig {
        &self.config
    }

    /// Start tracking `pipeline_id` with zeroed counters. Existing counters
    /// are kept.
    pub async fn register(&self, pipeline_id: &str) {
        self.inner
            .lock()
            .await
            .entry(pipeline_id.to_string())
            .or_insert_with(|| Entry {
                analytics: PipelineAnalytics::new(pipeline_id),
                window_events: 0,
                last_arrival: None,
            });
    }

    pub async fn remove(&self, pipeline_id: &str) -> Option<PipelineAnalytics> {
        self.inner.lock().await.remove(pipeline_id).map(|e| e.analytics)
    }

    /// Count one output packet.
    pub async fn record_output(&self, pipeline_id: &str, packet: &Packet) {
        let now = self.clock.now();
        let arrival = Instant::now();
        let mut inner = self.inner.lock().await;
        let Some(entry) = inner.get_mut(pipeline_id) else {
            return;
        };

        let stats = &mut entry.analytics;
        stats.total_events += 1;
        entry.window_events += 1;

        if let Some(previous) = entry.last_arrival {
            let gap = arrival.duration_since(previous).as_secs_f64();
            if gap > 0.0 {
                stats.events_per_second = 1.0 / gap;
            }
        }
        entry.last_arrival = Some(arrival);

        let latency_ms = (now - packet.timestamp).num_milliseconds().max(0) as f64;
        stats.average_latency_ms +=
            (latency_ms - stats.average_latency_ms) / stats.total_events as f64;
        stats.last_event_time = Some(now);
    }

    /// Count one failure. Returns the new error count.
    pub async fn record_error(&self, pipeline_id: &str) -> u64 {
        let mut inner = self.inner.lock().await;
        match inner.get_mut(pipeline_id) {
            Some(entry) => {
                entry.analytics.error_count += 1;
                entry.analytics.error_count
            }
            None => 0,
        }
    }

    pub async fn record_dropped(&self, pipeline_id: &str, dropped: u64) {
        if dropped == 0 {
            return;
        }
        if let Some(entry) = self.inner.lock().await.get_mut(pipeline_id) {
            entry.analytics.dropped_deliveries += dropped;
        }
    }

    /// Roll the rate window: events per second over the last interval, and
    /// latency decay for pipelines that emitted nothing in it.
    pub async fn tick(&self) {
        let interval = self.config.refresh_interval().as_secs_f64();
        let decay = self.config.latency_decay;
        let mut inner = self.inner.lock().await;
        for (id, entry) in inner.iter_mut() {
            let stats = &mut entry.analytics;
            stats.events_per_second = entry.window_events as f64 / interval;
            if entry.window_events == 0 {
                stats.average_latency_ms *= decay;
            }
            debug!(
                pipeline = %id,
                window_events = entry.window_events,
                eps = stats.events_per_second,
                "analytics refreshed"
            );
            entry.window_events = 0;
        }
    }

    pub async fn get(&self, pipeline_id: &str) -> Option<PipelineAnalytics> {
        self.inner
            .lock()
            .await
            .get(pipeline_id)
            .map(|e| e.analytics.clone())
    }

    pub async fn snapshot(&self) -> HashMap<String, PipelineAnalytics> {
        self.inner
            .lock()
            .await
            .iter()
            .map(|(id, e)| (id.clone(), e.analytics.clone()))
            .collect()
    }
}

/// Spawn the periodic refresh. Stops once `shutdown` turns `true` or its
/// sender is dropped.
pub fn spawn_refresh_task(
    collector: AnalyticsCollector,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(collector.config.refresh_interval());
        // The first tick fires immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    collector.tick().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("analytics refresh stopped");
    })
}
