//! Bounded chart series keyed by metric and room.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ExportError;
use crate::packet::Metadata;

/// Default cap on points per chart series.
pub const DEFAULT_MAX_DATA_POINTS: usize = 100;

// ── Ring buffer ──────────────────────────────────────────────────────

/// A fixed-size ring buffer backed by `VecDeque`.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    buf: VecDeque<T>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    /// Create a new ring buffer with the given capacity (at least 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            buf: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Push an item, evicting and returning the oldest if over capacity.
    pub fn push(&mut self, item: T) -> Option<T> {
        self.buf.push_back(item);
        self.evict()
    }

    /// Insert keeping the buffer ordered by `key`, then evict the front if
    /// over capacity. Equal keys keep arrival order.
    pub fn insert_ordered_by<K, F>(&mut self, item: T, key: F) -> Option<T>
    where
        K: Ord,
        F: Fn(&T) -> K,
    {
        let k = key(&item);
        let pos = self.buf.partition_point(|existing| key(existing) <= k);
        self.buf.insert(pos, item);
        self.evict()
    }

    fn evict(&mut self) -> Option<T> {
        if self.buf.len() > self.capacity {
            self.buf.pop_front()
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn back(&self) -> Option<&T> {
        self.buf.back()
    }

    /// Iterate over items from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.buf.iter()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

// ── Series key ───────────────────────────────────────────────────────

/// Identifies a chart series. Rendered as `<metric>@<room_id>`, which is
/// also the stream id accepted by exports.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeriesKey {
    pub metric: String,
    pub room_id: String,
}

impl SeriesKey {
    pub fn new(metric: impl Into<String>, room_id: impl Into<String>) -> Self {
        Self {
            metric: metric.into(),
            room_id: room_id.into(),
        }
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.metric, self.room_id)
    }
}

impl FromStr for SeriesKey {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.rsplit_once('@') {
            Some((metric, room)) if !metric.is_empty() && !room.is_empty() => {
                Ok(SeriesKey::new(metric, room))
            }
            _ => Err(ExportError::InvalidStreamId(s.to_string())),
        }
    }
}

// ── Points and series ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

impl ChartPoint {
    pub fn new(timestamp: DateTime<Utc>, value: f64) -> Self {
        Self {
            timestamp,
            value,
            label: None,
            metadata: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// A time-ascending sequence of points capped at `max_points`. Inserting
/// past the cap evicts the oldest point.
#[derive(Debug, Clone)]
pub struct ChartSeries {
    key: SeriesKey,
    points: RingBuffer<ChartPoint>,
}

impl ChartSeries {
    pub fn new(key: SeriesKey, max_points: usize) -> Self {
        Self {
            key,
            points: RingBuffer::new(max_points),
        }
    }

    pub fn key(&self) -> &SeriesKey {
        &self.key
    }

    /// Insert a point, returning the evicted point if the cap was exceeded.
    ///
    /// Points normally arrive in time order and are appended; a late point is
    /// placed at its timestamp position.
    pub fn push(&mut self, point: ChartPoint) -> Option<ChartPoint> {
        match self.points.back() {
            Some(last) if last.timestamp > point.timestamp => {
                self.points.insert_ordered_by(point, |p| p.timestamp)
            }
            _ => self.points.push(point),
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn max_points(&self) -> usize {
        self.points.capacity()
    }

    pub fn latest(&self) -> Option<&ChartPoint> {
        self.points.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChartPoint> {
        self.points.iter()
    }

    pub fn points(&self) -> Vec<ChartPoint> {
        self.points.iter().cloned().collect()
    }

    /// Points with `start <= timestamp <= end`.
    pub fn range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> impl Iterator<Item = &ChartPoint> {
        self.points
            .iter()
            .filter(move |p| p.timestamp >= start && p.timestamp <= end)
    }
}
