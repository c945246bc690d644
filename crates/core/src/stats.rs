//! Windowed statistics, trend classification and threshold severity.
//!
//! All functions here are pure; the hub feeds them one window of values at
//! a time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Minimum samples in a window before a trend is computed.
pub const TREND_MIN_POINTS: usize = 10;

/// Slopes within `±TREND_SLOPE_EPSILON` classify as stable.
pub const TREND_SLOPE_EPSILON: f64 = 0.01;

// ── Aggregates ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AggregateStats {
    pub count: usize,
    pub sum: f64,
    pub average: f64,
    pub min: f64,
    pub max: f64,
}

/// Summary statistics for a window. `None` for an empty window.
pub fn aggregate(values: &[f64]) -> Option<AggregateStats> {
    if values.is_empty() {
        return None;
    }
    let sum: f64 = values.iter().sum();
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    Some(AggregateStats {
        count: values.len(),
        sum,
        average: sum / values.len() as f64,
        min,
        max,
    })
}

// ── Trend ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Increasing,
    Decreasing,
    Stable,
}

impl TrendDirection {
    pub fn from_slope(slope: f64) -> Self {
        if slope > TREND_SLOPE_EPSILON {
            TrendDirection::Increasing
        } else if slope < -TREND_SLOPE_EPSILON {
            TrendDirection::Decreasing
        } else {
            TrendDirection::Stable
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TrendDirection::Increasing => "increasing",
            TrendDirection::Decreasing => "decreasing",
            TrendDirection::Stable => "stable",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrendSummary {
    pub direction: TrendDirection,
    pub slope: f64,
    pub intercept: f64,
    /// Regression line evaluated at the next index.
    pub predicted_next: f64,
    pub samples: usize,
}

/// Ordinary least-squares fit of value against sample index.
///
/// Returns `None` when fewer than [`TREND_MIN_POINTS`] values are given.
pub fn trend(values: &[f64]) -> Option<TrendSummary> {
    let n = values.len();
    if n < TREND_MIN_POINTS {
        return None;
    }
    let nf = n as f64;
    let x_mean = (nf - 1.0) / 2.0;
    let y_mean = values.iter().sum::<f64>() / nf;

    let (mut cov, mut var) = (0.0, 0.0);
    for (i, y) in values.iter().enumerate() {
        let dx = i as f64 - x_mean;
        cov += dx * (y - y_mean);
        var += dx * dx;
    }
    let slope = if var == 0.0 { 0.0 } else { cov / var };
    let intercept = y_mean - slope * x_mean;

    Some(TrendSummary {
        direction: TrendDirection::from_slope(slope),
        slope,
        intercept,
        predicted_next: slope * nf + intercept,
        samples: n,
    })
}

// ── Severity and alerts ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

/// Classify how far `value` exceeds `threshold` by their ratio.
pub fn severity(value: f64, threshold: f64) -> Severity {
    let ratio = value / threshold;
    if ratio >= 2.0 {
        Severity::Critical
    } else if ratio >= 1.5 {
        Severity::High
    } else if ratio >= 1.2 {
        Severity::Medium
    } else {
        Severity::Low
    }
}

/// A threshold breach on a metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub metric: String,
    pub value: f64,
    pub threshold: f64,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
    pub alert_type: String,
}

impl Alert {
    pub fn from_breach(
        metric: impl Into<String>,
        value: f64,
        threshold: f64,
        alert_type: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            metric: metric.into(),
            value,
            threshold,
            severity: severity(value, threshold),
            timestamp,
            alert_type: alert_type.into(),
        }
    }
}
