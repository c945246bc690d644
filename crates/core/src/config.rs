//! Engine configuration.
//!
//! Parsed from TOML (`pulse.toml`) with environment variable overrides and
//! validation, or built programmatically by the host application.

mod loading;
mod types;
mod validation;


pub use types::{AlertRule, AnalyticsConfig, EngineConfig, HubConfig, PipelineConfig};
