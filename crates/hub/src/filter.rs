use serde::{Deserialize, Serialize};

use pulse_core::Packet;

/// Field predicates over a packet. Every set field must match.
///
/// The numeric bounds only apply to numeric payloads; anything else passes
/// them unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacketFilter {
    pub room_id: Option<String>,
    /// Matched against `Packet::source`.
    pub device_id: Option<String>,
    pub metric: Option<String>,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
}

impl PacketFilter {
    pub fn room(mut self, room_id: impl Into<String>) -> Self {
        self.room_id = Some(room_id.into());
        self
    }

    pub fn device(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    pub fn metric(mut self, metric: impl Into<String>) -> Self {
        self.metric = Some(metric.into());
        self
    }

    pub fn min(mut self, value: f64) -> Self {
        self.min_value = Some(value);
        self
    }

    pub fn max(mut self, value: f64) -> Self {
        self.max_value = Some(value);
        self
    }

    pub fn is_empty(&self) -> bool {
        self == &PacketFilter::default()
    }

    pub fn matches(&self, packet: &Packet) -> bool {
        if let Some(room) = &self.room_id {
            if packet.room_id() != Some(room.as_str()) {
                return false;
            }
        }
        if let Some(device) = &self.device_id {
            if packet.source != *device {
                return false;
            }
        }
        if let Some(metric) = &self.metric {
            if packet.metric() != Some(metric.as_str()) {
                return false;
            }
        }
        let Some(value) = packet.value() else {
            return true;
        };
        if self.min_value.is_some_and(|min| value < min) {
            return false;
        }
        if self.max_value.is_some_and(|max| value > max) {
            return false;
        }
        true
    }
}
