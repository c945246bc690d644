use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use futures::future;
use futures::stream::{self, BoxStream, StreamExt};
use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

use pulse_core::{
    aggregate, meta, system_clock, trend, AggregateStats, Alert, ChartPoint, ChartSeries,
    HubConfig, Metadata, Packet, PacketId, Payload, SeriesKey, SharedClock, StreamType,
    TrendSummary,
};

use crate::filter::PacketFilter;
use crate::window::time_windows;

/// A live view over one or more hub channels.
pub type PacketStream = BoxStream<'static, Packet>;

/// Hub lifecycle. Emission only publishes while `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HubState {
    Created,
    Running,
    Stopped,
    Disposed,
}

struct Inner {
    config: HubConfig,
    clock: SharedClock,
    state: RwLock<HubState>,
    channels: RwLock<HashMap<StreamType, broadcast::Sender<Packet>>>,
    series: Mutex<HashMap<SeriesKey, ChartSeries>>,
}

/// Broadcast channel registry plus chart series cache.
///
/// Cloning is cheap; clones share the same channels and series.
#[derive(Clone)]
pub struct StreamHub {
    inner: Arc<Inner>,
}

impl fmt::Debug for StreamHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHub")
            .field("state", &self.state())
            .field("config", &self.inner.config)
            .finish()
    }
}

impl StreamHub {
    pub fn new(config: HubConfig) -> Self {
        Self::with_clock(config, system_clock())
    }

    pub fn with_clock(config: HubConfig, clock: SharedClock) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                clock,
                state: RwLock::new(HubState::Created),
                channels: RwLock::new(HashMap::new()),
                series: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn clock(&self) -> SharedClock {
        self.inner.clock.clone()
    }

    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    pub fn state(&self) -> HubState {
        *self.inner.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: HubState) -> HubState {
        let mut guard = self.inner.state.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *guard, state)
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Open a channel for every stream type. A disposed hub becomes usable
    /// again.
    pub fn initialize(&self) {
        for stream_type in StreamType::ALL {
            self.sender(stream_type);
        }
        let mut state = self.inner.state.write().unwrap_or_else(PoisonError::into_inner);
        if *state == HubState::Disposed {
            *state = HubState::Created;
        }
        info!(channels = StreamType::ALL.len(), "stream hub initialized");
    }

    pub fn start(&self) {
        let previous = self.set_state(HubState::Running);
        if previous != HubState::Running {
            info!(from = ?previous, "stream hub running");
        }
    }

    /// Stop publishing. Channels and series stay in place.
    pub fn stop(&self) {
        let mut state = self.inner.state.write().unwrap_or_else(PoisonError::into_inner);
        if *state == HubState::Running {
            *state = HubState::Stopped;
            info!("stream hub stopped");
        }
    }

    /// Drop every channel and clear the series cache. Existing subscriber
    /// streams end once their buffered packets are drained.
    pub fn dispose(&self) {
        self.set_state(HubState::Disposed);
        let channels = std::mem::take(
            &mut *self.inner.channels.write().unwrap_or_else(PoisonError::into_inner),
        );
        self.clear_chart_data();
        info!(channels = channels.len(), "stream hub disposed");
    }

    // ── Channels ────────────────────────────────────────────────────

    fn sender(&self, stream_type: StreamType) -> broadcast::Sender<Packet> {
        if let Some(tx) = self
            .inner
            .channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&stream_type)
        {
            return tx.clone();
        }
        let mut channels = self.inner.channels.write().unwrap_or_else(PoisonError::into_inner);
        channels
            .entry(stream_type)
            .or_insert_with(|| {
                debug!(stream = %stream_type, "channel created");
                broadcast::channel(self.inner.config.channel_capacity.max(1)).0
            })
            .clone()
    }

    /// Subscribe to `stream_type`. The subscription starts now: the stream
    /// yields every packet emitted after this call and nothing before.
    pub fn get_stream(&self, stream_type: StreamType) -> PacketStream {
        receiver_stream(self.sender(stream_type).subscribe(), stream_type)
    }

    /// Number of live subscriptions on `stream_type`.
    pub fn subscriber_count(&self, stream_type: StreamType) -> usize {
        self.inner
            .channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&stream_type)
            .map_or(0, |tx| tx.receiver_count())
    }

    // ── Emission ────────────────────────────────────────────────────

    /// Publish `payload` on `stream_type`, stamped with the hub clock.
    ///
    /// Returns the packet id, or `None` when the hub is not running.
    pub fn emit(&self, stream_type: StreamType, payload: impl Into<Payload>) -> Option<PacketId> {
        self.emit_from(stream_type, payload, "", Metadata::new())
    }

    pub fn emit_from(
        &self,
        stream_type: StreamType,
        payload: impl Into<Payload>,
        source: impl Into<String>,
        metadata: Metadata,
    ) -> Option<PacketId> {
        let packet = Packet::new(stream_type, payload, self.inner.clock.now())
            .with_source(source)
            .with_metadata(metadata);
        self.emit_packet(packet)
    }

    /// Publish an already built packet on its own stream type.
    pub fn emit_packet(&self, packet: Packet) -> Option<PacketId> {
        if self.state() != HubState::Running {
            debug!(stream = %packet.stream_type, "hub not running, emit ignored");
            return None;
        }
        let id = packet.id;
        let stream_type = packet.stream_type;
        match self.sender(stream_type).send(packet) {
            Ok(receivers) => debug!(stream = %stream_type, receivers, "packet emitted"),
            Err(_) => debug!(stream = %stream_type, "packet emitted with no subscribers"),
        }
        Some(id)
    }

    // ── Chart series ────────────────────────────────────────────────

    /// Append a reading to the `(metric, room_id)` series and publish it on
    /// `sensor_metrics`.
    pub fn update_chart_data(
        &self,
        metric: &str,
        room_id: &str,
        value: f64,
        label: Option<&str>,
    ) -> Option<PacketId> {
        self.update_chart_data_from("", metric, room_id, value, label)
    }

    /// [`update_chart_data`](Self::update_chart_data) with the emitting
    /// device recorded as the packet source.
    pub fn update_chart_data_from(
        &self,
        source: &str,
        metric: &str,
        room_id: &str,
        value: f64,
        label: Option<&str>,
    ) -> Option<PacketId> {
        let now = self.inner.clock.now();
        let mut point = ChartPoint::new(now, value);
        let mut metadata = Metadata::from([
            (meta::METRIC.to_string(), metric.to_string()),
            (meta::ROOM_ID.to_string(), room_id.to_string()),
        ]);
        if let Some(label) = label {
            point = point.with_label(label);
            metadata.insert(meta::LABEL.to_string(), label.to_string());
        }
        self.record_point(SeriesKey::new(metric, room_id), point);

        let packet = Packet::new(StreamType::SensorMetrics, value, now)
            .with_source(source)
            .with_metadata(metadata);
        self.emit_packet(packet)
    }

    /// Fold a point into its series without publishing anything.
    pub fn record_point(&self, key: SeriesKey, point: ChartPoint) {
        let max_points = self.inner.config.max_data_points;
        let mut series = self.inner.series.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = series
            .entry(key)
            .or_insert_with_key(|key| ChartSeries::new(key.clone(), max_points));
        if let Some(evicted) = entry.push(point) {
            debug!(series = %entry.key(), evicted_at = %evicted.timestamp, "chart point evicted");
        }
    }

    /// Points of the `(metric, room_id)` series, oldest first. Empty when the
    /// series does not exist.
    pub fn get_chart_data(&self, metric: &str, room_id: &str) -> Vec<ChartPoint> {
        self.series_points(&SeriesKey::new(metric, room_id))
            .unwrap_or_default()
    }

    pub(crate) fn series_points(&self, key: &SeriesKey) -> Option<Vec<ChartPoint>> {
        self.inner
            .series
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map(ChartSeries::points)
    }

    pub fn series_keys(&self) -> Vec<SeriesKey> {
        let mut keys: Vec<SeriesKey> = self
            .inner
            .series
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    pub fn clear_chart_data(&self) {
        self.inner.series.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    // ── Derived views ───────────────────────────────────────────────

    pub fn create_filtered_stream(
        &self,
        stream_type: StreamType,
        filter: PacketFilter,
    ) -> PacketStream {
        self.get_stream(stream_type)
            .filter(move |packet| future::ready(filter.matches(packet)))
            .boxed()
    }

    /// Merge several stream types. Order is kept within a type only.
    pub fn create_combined_stream(&self, types: &[StreamType]) -> PacketStream {
        let mut seen = HashSet::new();
        let streams: Vec<PacketStream> = types
            .iter()
            .filter(|t| seen.insert(**t))
            .map(|t| self.get_stream(*t))
            .collect();
        stream::select_all(streams).boxed()
    }

    /// Summary statistics of `metric` per `window`. Empty windows are skipped.
    pub fn create_aggregated_stream(
        &self,
        stream_type: StreamType,
        metric: &str,
        window: Duration,
    ) -> BoxStream<'static, AggregateStats> {
        time_windows(self.metric_values(stream_type, metric), window, usize::MAX)
            .filter_map(|values| future::ready(aggregate(&values)))
            .boxed()
    }

    /// Trend of `metric` per `window`. Windows with fewer than ten values
    /// emit nothing.
    pub fn create_trend_stream(
        &self,
        stream_type: StreamType,
        metric: &str,
        window: Duration,
    ) -> BoxStream<'static, TrendSummary> {
        time_windows(self.metric_values(stream_type, metric), window, usize::MAX)
            .filter_map(|values| future::ready(trend(&values)))
            .boxed()
    }

    /// Alerts for readings of `metric` at or above `threshold`. A reading
    /// equal to the one before it is ignored.
    pub fn create_alert_stream(
        &self,
        stream_type: StreamType,
        metric: &str,
        threshold: f64,
        alert_type: &str,
    ) -> BoxStream<'static, Alert> {
        let metric = metric.to_string();
        let alert_type = alert_type.to_string();
        let wanted = metric.clone();
        let mut last: Option<f64> = None;

        self.get_stream(stream_type)
            .filter_map(move |packet| {
                let reading = (packet.metric() == Some(wanted.as_str()))
                    .then(|| packet.value().map(|v| (v, packet.timestamp)))
                    .flatten();
                future::ready(reading)
            })
            .filter(move |(value, _)| {
                let repeated = last == Some(*value);
                last = Some(*value);
                future::ready(!repeated)
            })
            .filter(move |(value, _)| future::ready(*value >= threshold))
            .map(move |(value, at)| Alert::from_breach(&metric, value, threshold, &alert_type, at))
            .boxed()
    }

    fn metric_values(&self, stream_type: StreamType, metric: &str) -> BoxStream<'static, f64> {
        let metric = metric.to_string();
        self.get_stream(stream_type)
            .filter_map(move |packet| {
                let value = if packet.metric() == Some(metric.as_str()) {
                    packet.value()
                } else {
                    None
                };
                future::ready(value)
            })
            .boxed()
    }
}

/// Adapt a broadcast receiver into a stream. A lagging subscriber skips the
/// packets it missed and keeps going.
fn receiver_stream(rx: broadcast::Receiver<Packet>, stream_type: StreamType) -> PacketStream {
    stream::unfold(rx, move |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(packet) => return Some((packet, rx)),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(stream = %stream_type, skipped, "subscriber lagged, packets skipped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use pulse_core::{ManualClock, TrendDirection};

    fn running_hub() -> StreamHub {
        let hub = StreamHub::new(HubConfig::default());
        hub.initialize();
        hub.start();
        hub
    }

    fn reading(hub: &StreamHub, metric: &str, value: f64) {
        let metadata = Metadata::from([(meta::METRIC.to_string(), metric.to_string())]);
        hub.emit_from(StreamType::SensorMetrics, value, "dev-1", metadata);
    }

    #[tokio::test]
    async fn every_subscriber_sees_every_packet() {
        let hub = running_hub();
        let mut a = hub.get_stream(StreamType::SystemStatus);
        let mut b = hub.get_stream(StreamType::SystemStatus);
        assert_eq!(hub.subscriber_count(StreamType::SystemStatus), 2);

        let id = hub.emit(StreamType::SystemStatus, "ok").unwrap();
        assert_eq!(a.next().await.unwrap().id, id);
        assert_eq!(b.next().await.unwrap().id, id);
    }

    #[tokio::test]
    async fn late_subscriber_gets_no_replay() {
        let hub = running_hub();
        let _keepalive = hub.get_stream(StreamType::Statistics);
        hub.emit(StreamType::Statistics, 1.0);

        let mut late = hub.get_stream(StreamType::Statistics);
        let id = hub.emit(StreamType::Statistics, 2.0).unwrap();
        assert_eq!(late.next().await.unwrap().id, id);
    }

    #[tokio::test]
    async fn emit_is_noop_unless_running() {
        let hub = StreamHub::new(HubConfig::default());
        hub.initialize();
        assert_eq!(hub.state(), HubState::Created);
        assert!(hub.emit(StreamType::SensorMetrics, 1.0).is_none());

        hub.start();
        assert!(hub.emit(StreamType::SensorMetrics, 1.0).is_some());
        hub.stop();
        assert_eq!(hub.state(), HubState::Stopped);
        assert!(hub.emit(StreamType::SensorMetrics, 1.0).is_none());
    }

    #[tokio::test]
    async fn dispose_ends_subscriber_streams() {
        let hub = running_hub();
        let mut stream = hub.get_stream(StreamType::SensorMetrics);
        hub.update_chart_data("temperature", "kitchen", 21.0, None);
        hub.dispose();

        assert!(stream.next().await.is_some());
        assert!(stream.next().await.is_none());
        assert!(hub.series_keys().is_empty());
        assert_eq!(hub.state(), HubState::Disposed);
    }

    #[tokio::test]
    async fn update_chart_data_records_and_emits() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let hub = StreamHub::with_clock(
            HubConfig {
                max_data_points: 3,
                ..HubConfig::default()
            },
            clock.clone(),
        );
        hub.start();
        let mut metrics = hub.get_stream(StreamType::SensorMetrics);

        for i in 0..5 {
            hub.update_chart_data("temperature", "kitchen", 20.0 + i as f64, Some("reading"));
            clock.advance(chrono::Duration::seconds(1));
        }

        let points = hub.get_chart_data("temperature", "kitchen");
        assert_eq!(points.len(), 3);
        assert_eq!(points.iter().map(|p| p.value).collect::<Vec<_>>(), vec![22.0, 23.0, 24.0]);
        assert_eq!(points[0].label.as_deref(), Some("reading"));

        let first = metrics.next().await.unwrap();
        assert_eq!(first.value(), Some(20.0));
        assert_eq!(first.timestamp, start);
        assert_eq!(first.metric(), Some("temperature"));
        assert_eq!(first.room_id(), Some("kitchen"));
        assert_eq!(first.metadata[meta::LABEL], "reading");
    }

    #[tokio::test]
    async fn chart_data_is_recorded_while_stopped() {
        let hub = StreamHub::new(HubConfig::default());
        assert!(hub.update_chart_data("humidity", "hall", 40.0, None).is_none());
        assert_eq!(hub.get_chart_data("humidity", "hall").len(), 1);
        assert!(hub.get_chart_data("humidity", "attic").is_empty());
    }

    #[tokio::test]
    async fn filtered_stream_applies_filter() {
        let hub = running_hub();
        let mut hot = hub.create_filtered_stream(
            StreamType::SensorMetrics,
            PacketFilter::default().metric("temperature").min(25.0),
        );
        reading(&hub, "temperature", 20.0);
        reading(&hub, "humidity", 50.0);
        reading(&hub, "temperature", 30.0);

        assert_eq!(hot.next().await.unwrap().value(), Some(30.0));
    }

    #[tokio::test]
    async fn combined_stream_merges_types() {
        let hub = running_hub();
        let combined = hub.create_combined_stream(&[
            StreamType::SensorAlerts,
            StreamType::SystemStatus,
            StreamType::SensorAlerts,
        ]);
        assert_eq!(hub.subscriber_count(StreamType::SensorAlerts), 1);

        hub.emit(StreamType::SensorAlerts, "a");
        hub.emit(StreamType::SystemStatus, "b");
        let got: Vec<StreamType> = combined.take(2).map(|p| p.stream_type).collect().await;
        assert!(got.contains(&StreamType::SensorAlerts));
        assert!(got.contains(&StreamType::SystemStatus));
    }

    #[tokio::test(start_paused = true)]
    async fn aggregated_stream_summarises_each_window() {
        let hub = running_hub();
        let mut stats = hub.create_aggregated_stream(
            StreamType::SensorMetrics,
            "temperature",
            Duration::from_millis(100),
        );
        let producer = {
            let hub = hub.clone();
            tokio::spawn(async move {
                for v in [4.0, 1.0, 7.0] {
                    reading(&hub, "temperature", v);
                    reading(&hub, "humidity", 99.0);
                }
                tokio::time::sleep(Duration::from_millis(250)).await;
                reading(&hub, "temperature", 10.0);
            })
        };

        let first = stats.next().await.unwrap();
        assert_eq!(first.count, 3);
        assert_eq!(first.min, 1.0);
        assert_eq!(first.max, 7.0);
        assert_eq!(first.average, 4.0);

        let second = stats.next().await.unwrap();
        assert_eq!(second.count, 1);
        assert_eq!(second.sum, 10.0);
        producer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn trend_stream_needs_ten_values() {
        let hub = running_hub();
        let mut trends =
            hub.create_trend_stream(StreamType::SensorMetrics, "co2", Duration::from_millis(100));
        let producer = {
            let hub = hub.clone();
            tokio::spawn(async move {
                for v in 0..5 {
                    reading(&hub, "co2", v as f64);
                }
                tokio::time::sleep(Duration::from_millis(150)).await;
                for v in 1..=10 {
                    reading(&hub, "co2", v as f64);
                }
            })
        };

        let summary = trends.next().await.unwrap();
        assert_eq!(summary.direction, TrendDirection::Increasing);
        assert_eq!(summary.samples, 10);
        assert!((summary.predicted_next - 11.0).abs() < 1e-9);
        producer.await.unwrap();
    }

    #[tokio::test]
    async fn alert_stream_suppresses_repeats_and_classifies() {
        let hub = running_hub();
        let alerts =
            hub.create_alert_stream(StreamType::SensorMetrics, "temperature", 30.0, "high_temp");

        for v in [25.0, 31.0, 31.0, 46.0, 46.0, 20.0, 61.0] {
            reading(&hub, "temperature", v);
        }
        reading(&hub, "humidity", 90.0);

        let got: Vec<Alert> = alerts.take(3).collect().await;
        let values: Vec<f64> = got.iter().map(|a| a.value).collect();
        assert_eq!(values, vec![31.0, 46.0, 61.0]);
        assert_eq!(got[0].severity, pulse_core::Severity::Low);
        assert_eq!(got[1].severity, pulse_core::Severity::High);
        assert_eq!(got[2].severity, pulse_core::Severity::Critical);
        assert!(got.iter().all(|a| a.alert_type == "high_temp" && a.metric == "temperature"));
    }
}
