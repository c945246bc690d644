//! Point-in-time snapshots of chart series for export collaborators.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::debug;

use pulse_core::{meta, ExportError, Metadata, SeriesKey};

use crate::hub::StreamHub;

/// Inclusive time range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// The `span` leading up to `now`.
    pub fn last(span: Duration, now: DateTime<Utc>) -> Self {
        Self::new(now - span, now)
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at <= self.end
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportRecord {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub metadata: Metadata,
}

impl StreamHub {
    /// Records of the series `stream_id` (`"<metric>@<room_id>"`) inside
    /// `period`, oldest first.
    ///
    /// A known series with nothing in range yields an empty list. An id with
    /// no series behind it is an error.
    pub fn export_stream_data(
        &self,
        stream_id: &str,
        period: TimeRange,
    ) -> Result<Vec<ExportRecord>, ExportError> {
        if period.start > period.end {
            return Err(ExportError::InvalidRange {
                start: period.start,
                end: period.end,
            });
        }
        let key: SeriesKey = stream_id.parse()?;
        let points = self
            .series_points(&key)
            .ok_or_else(|| ExportError::UnknownStream(stream_id.to_string()))?;

        let records: Vec<ExportRecord> = points
            .into_iter()
            .filter(|p| period.contains(p.timestamp))
            .map(|p| {
                let mut metadata = p.metadata.unwrap_or_default();
                metadata.insert(meta::METRIC.to_string(), key.metric.clone());
                metadata.insert(meta::ROOM_ID.to_string(), key.room_id.clone());
                if let Some(label) = p.label {
                    metadata.insert(meta::LABEL.to_string(), label);
                }
                ExportRecord {
                    timestamp: p.timestamp,
                    value: p.value,
                    metadata,
                }
            })
            .collect();
        debug!(stream_id, records = records.len(), "series exported");
        Ok(records)
    }
}
