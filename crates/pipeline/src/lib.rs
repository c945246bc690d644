//! Configurable operator pipelines over [`pulse_hub::StreamHub`] streams.
//!
//! A [`PipelineOrchestrator`] turns [`pulse_core::PipelineConfig`] records
//! into running operator chains, re-emits their output into the hub, fans it
//! out to observers and keeps per-pipeline analytics. [`Engine`] ties the
//! hub, orchestrator, alert rules and inbound event bridge together behind
//! one lifecycle.

pub mod analytics;
pub mod bridge;
pub mod engine;
pub mod logging;
pub mod observer;
pub mod operators;
pub mod orchestrator;
pub mod registry;

pub use analytics::{AnalyticsCollector, PipelineAnalytics};
pub use bridge::{
    DomainEvent, DomainEventKind, DomainEventSource, EventBridge, EventHandler, HandlerId,
    LocalEventBus,
};
pub use engine::{Engine, EngineState};
pub use logging::init_tracing;
pub use observer::{
    ChannelObserver, Delivery, ObserverError, ObserverRegistry, PacketObserver, SubscriberId,
};
pub use operators::{Operator, OperatorSpec, StageItem, StageStream};
pub use orchestrator::{PipelineOrchestrator, PipelineStatus};
pub use registry::{Mapper, OperatorFactory, Predicate, StageRegistry};
