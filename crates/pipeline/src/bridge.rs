//! Inbound side: translate domain events from the host into hub traffic.
//!
//! The host's event source only needs to support `on`/`off` handler
//! registration. Sensor readings become chart updates (and so
//! `sensor_metrics` packets); everything else is emitted on the matching
//! stream type.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use pulse_core::{meta, Alert, Metadata, PacketId, StreamType};
use pulse_hub::StreamHub;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    SensorReadingUpdated {
        device_id: String,
        room_id: String,
        metric: String,
        value: f64,
        #[serde(default)]
        label: Option<String>,
    },
    AlertRaised {
        metric: String,
        value: f64,
        threshold: f64,
        alert_type: String,
        #[serde(default)]
        room_id: Option<String>,
    },
    AutomationTriggered {
        automation_id: String,
        outcome: String,
        success: bool,
    },
    SystemHealth {
        component: String,
        status: String,
        #[serde(default)]
        detail: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainEventKind {
    SensorReadingUpdated,
    AlertRaised,
    AutomationTriggered,
    SystemHealth,
}

impl DomainEventKind {
    pub const ALL: [DomainEventKind; 4] = [
        DomainEventKind::SensorReadingUpdated,
        DomainEventKind::AlertRaised,
        DomainEventKind::AutomationTriggered,
        DomainEventKind::SystemHealth,
    ];
}

impl DomainEvent {
    pub fn kind(&self) -> DomainEventKind {
        match self {
            DomainEvent::SensorReadingUpdated { .. } => DomainEventKind::SensorReadingUpdated,
            DomainEvent::AlertRaised { .. } => DomainEventKind::AlertRaised,
            DomainEvent::AutomationTriggered { .. } => DomainEventKind::AutomationTriggered,
            DomainEvent::SystemHealth { .. } => DomainEventKind::SystemHealth,
        }
    }
}

pub type EventHandler = Arc<dyn Fn(&DomainEvent) + Send + Sync>;
pub type HandlerId = u64;

/// Subscription contract of the host's event source.
pub trait DomainEventSource: Send + Sync {
    fn on(&self, kind: DomainEventKind, handler: EventHandler) -> HandlerId;

    /// Returns `false` if no such handler was registered.
    fn off(&self, kind: DomainEventKind, handler: HandlerId) -> bool;
}

/// Synchronous in-process event source.
#[derive(Default)]
pub struct LocalEventBus {
    next_id: AtomicU64,
    handlers: RwLock<HashMap<DomainEventKind, Vec<(HandlerId, EventHandler)>>>,
}

impl fmt::Debug for LocalEventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        let counts: HashMap<DomainEventKind, usize> =
            handlers.iter().map(|(kind, list)| (*kind, list.len())).collect();
        f.debug_struct("LocalEventBus").field("handlers", &counts).finish()
    }
}

impl LocalEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Call every handler registered for the event's kind. Returns how many
    /// were called.
    pub fn publish(&self, event: &DomainEvent) -> usize {
        let handlers: Vec<EventHandler> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event.kind())
            .map(|list| list.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default();
        for handler in &handlers {
            handler(event);
        }
        handlers.len()
    }

    pub fn handler_count(&self, kind: DomainEventKind) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .map_or(0, Vec::len)
    }
}

impl DomainEventSource for LocalEventBus {
    fn on(&self, kind: DomainEventKind, handler: EventHandler) -> HandlerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind)
            .or_default()
            .push((id, handler));
        id
    }

    fn off(&self, kind: DomainEventKind, handler: HandlerId) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        let Some(list) = handlers.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(id, _)| *id != handler);
        list.len() != before
    }
}

/// Handlers registered on one event source on behalf of one hub. Detaches
/// on drop.
pub struct EventBridge {
    source: Arc<dyn DomainEventSource>,
    registrations: Mutex<Vec<(DomainEventKind, HandlerId)>>,
}

impl fmt::Debug for EventBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registrations = self
            .registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        f.debug_struct("EventBridge")
            .field("registrations", &registrations)
            .finish()
    }
}

impl EventBridge {
    /// Register a handler for every event kind on `source`.
    pub fn attach(source: Arc<dyn DomainEventSource>, hub: StreamHub) -> Self {
        let registrations = DomainEventKind::ALL
            .into_iter()
            .map(|kind| {
                let hub = hub.clone();
                let handler: EventHandler = Arc::new(move |event: &DomainEvent| {
                    forward_event(&hub, event);
                });
                (kind, source.on(kind, handler))
            })
            .collect();
        info!("event bridge attached");
        Self {
            source,
            registrations: Mutex::new(registrations),
        }
    }

    /// Unregister every handler. Safe to call more than once.
    pub fn detach(&self) {
        let registrations =
            std::mem::take(&mut *self.registrations.lock().unwrap_or_else(PoisonError::into_inner));
        if registrations.is_empty() {
            return;
        }
        for (kind, id) in registrations {
            self.source.off(kind, id);
        }
        info!("event bridge detached");
    }

    pub fn is_attached(&self) -> bool {
        !self.registrations.lock().unwrap_or_else(PoisonError::into_inner).is_empty()
    }
}

impl Drop for EventBridge {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Translate one domain event into hub calls. Returns the emitted packet id,
/// if the hub was running.
pub fn forward_event(hub: &StreamHub, event: &DomainEvent) -> Option<PacketId> {
    debug!(kind = ?event.kind(), "domain event received");
    match event {
        DomainEvent::SensorReadingUpdated {
            device_id,
            room_id,
            metric,
            value,
            label,
        } => hub.update_chart_data_from(device_id, metric, room_id, *value, label.as_deref()),
        DomainEvent::AlertRaised {
            metric,
            value,
            threshold,
            alert_type,
            room_id,
        } => {
            let now = hub.clock().now();
            let alert = Alert::from_breach(metric, *value, *threshold, alert_type, now);
            let mut metadata = Metadata::from([(meta::METRIC.to_string(), metric.clone())]);
            if let Some(room) = room_id {
                metadata.insert(meta::ROOM_ID.to_string(), room.clone());
            }
            hub.emit_from(StreamType::SensorAlerts, alert, alert_type.as_str(), metadata)
        }
        DomainEvent::AutomationTriggered {
            automation_id,
            outcome,
            success,
        } => hub.emit_from(
            StreamType::AutomationStatus,
            serde_json::json!({ "outcome": outcome, "success": success }),
            automation_id.as_str(),
            Metadata::new(),
        ),
        DomainEvent::SystemHealth {
            component,
            status,
            detail,
        } => {
            let mut metadata = Metadata::new();
            if let Some(detail) = detail {
                metadata.insert("detail".to_string(), detail.clone());
            }
            hub.emit_from(StreamType::SystemStatus, status.as_str(), component.as_str(), metadata)
        }
    }
}
