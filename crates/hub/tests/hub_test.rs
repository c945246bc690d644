//! Integration tests for a hub feeding dashboard-style consumers.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use futures::StreamExt;
use tokio::time::timeout;

use pulse_core::{meta, ExportError, HubConfig, ManualClock, Payload, StreamType};
use pulse_hub::{HubState, PacketFilter, StreamHub, TimeRange};

const TIMEOUT: Duration = Duration::from_secs(5);

fn hub_with_clock(max_data_points: usize) -> (StreamHub, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 15, 9, 0, 0).unwrap()));
    let config = HubConfig {
        max_data_points,
        ..HubConfig::default()
    };
    let hub = StreamHub::with_clock(config, clock.clone());
    hub.initialize();
    hub.start();
    (hub, clock)
}

#[tokio::test(start_paused = true)]
async fn room_dashboard_sees_only_its_room() {
    let (hub, _) = hub_with_clock(100);
    let mut kitchen = hub.create_filtered_stream(
        StreamType::SensorMetrics,
        PacketFilter::default().room("kitchen"),
    );
    let mut averages = hub.create_aggregated_stream(
        StreamType::SensorMetrics,
        "temperature",
        Duration::from_secs(1),
    );

    hub.update_chart_data("temperature", "kitchen", 20.0, None);
    hub.update_chart_data("temperature", "bedroom", 18.0, None);
    hub.update_chart_data("temperature", "kitchen", 22.0, Some("after cooking"));

    let first = timeout(TIMEOUT, kitchen.next()).await.unwrap().unwrap();
    let second = timeout(TIMEOUT, kitchen.next()).await.unwrap().unwrap();
    assert_eq!(first.value(), Some(20.0));
    assert_eq!(second.value(), Some(22.0));
    assert_eq!(second.metadata[meta::LABEL], "after cooking");

    let stats = timeout(TIMEOUT, averages.next()).await.unwrap().unwrap();
    assert_eq!(stats.count, 3);
    assert_eq!(stats.average, 20.0);
    assert_eq!(stats.min, 18.0);
    assert_eq!(stats.max, 22.0);
}

#[tokio::test(start_paused = true)]
async fn series_cap_and_export_window() {
    let (hub, clock) = hub_with_clock(3);
    for value in [1.0, 2.0, 3.0, 4.0, 5.0] {
        hub.update_chart_data("co2", "office", value, None);
        clock.advance(chrono::Duration::minutes(1));
    }

    let points = hub.get_chart_data("co2", "office");
    assert_eq!(points.iter().map(|p| p.value).collect::<Vec<_>>(), vec![3.0, 4.0, 5.0]);

    // Points sit at 09:02, 09:03 and 09:04; the clock is at 09:05.
    let end = Utc.with_ymd_and_hms(2024, 1, 15, 9, 5, 0).unwrap();
    let records = hub
        .export_stream_data("co2@office", TimeRange::last(chrono::Duration::seconds(150), end))
        .unwrap();
    assert_eq!(records.iter().map(|r| r.value).collect::<Vec<_>>(), vec![4.0, 5.0]);
    assert_eq!(records[0].metadata[meta::ROOM_ID], "office");

    assert_eq!(
        hub.export_stream_data("co2@garage", TimeRange::last(chrono::Duration::hours(1), end)),
        Err(ExportError::UnknownStream("co2@garage".into()))
    );
}

#[tokio::test(start_paused = true)]
async fn dispose_ends_open_streams_and_reinitialize_recovers() {
    let (hub, _) = hub_with_clock(100);
    let mut combined =
        hub.create_combined_stream(&[StreamType::SystemStatus, StreamType::AutomationStatus]);

    hub.emit(StreamType::SystemStatus, "ok");
    hub.dispose();
    assert_eq!(hub.state(), HubState::Disposed);
    assert!(hub.emit(StreamType::SystemStatus, "late").is_none());

    let buffered = timeout(TIMEOUT, combined.next()).await.unwrap().unwrap();
    assert_eq!(buffered.stream_type, StreamType::SystemStatus);
    assert!(timeout(TIMEOUT, combined.next()).await.unwrap().is_none());

    hub.initialize();
    hub.start();
    let mut status = hub.get_stream(StreamType::SystemStatus);
    hub.emit(StreamType::SystemStatus, "back");
    let packet = timeout(TIMEOUT, status.next()).await.unwrap().unwrap();
    assert_eq!(packet.payload, Payload::Text("back".into()));
}
