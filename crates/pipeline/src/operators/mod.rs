//! Operator stages.
//!
//! Every stage has the same shape: it takes the previous stage's stream and
//! returns a new one. Items are `Result`s so a failing stage can report an
//! error for one packet while the rest of the stream keeps flowing; stages
//! pass error items through untouched.

mod basic;
mod timed;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::BoxStream;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use pulse_core::{ConfigError, Packet, PipelineConfig, PipelineError};

use crate::registry::StageRegistry;

pub use basic::{DistinctOp, FilterOp, MapOp, PassthroughOp, SkipOp, TakeOp};
pub use timed::{BufferOp, DebounceOp, ThrottleOp};

pub type StageItem = Result<Packet, PipelineError>;
pub type StageStream = BoxStream<'static, StageItem>;

/// One transform stage of a pipeline.
///
/// `apply` may be called once per pipeline start, so any per-run state
/// (counters, windows, the last packet seen) must be created inside it.
pub trait Operator: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn apply(&self, input: StageStream) -> StageStream;
}

/// Everything an operator factory gets to build one stage.
pub struct OperatorSpec<'a> {
    pub name: &'a str,
    /// Position in the chain.
    pub index: usize,
    pub params: Option<&'a Value>,
    pub config: &'a PipelineConfig,
    pub registry: &'a StageRegistry,
}

impl<'a> OperatorSpec<'a> {
    pub fn malformed(&self, message: impl ToString) -> ConfigError {
        ConfigError::malformed(format!("{}#{}", self.name, self.index), message)
    }

    /// Deserialize the params object, or `T::default()` when there are none.
    pub fn params_or_default<T>(&self) -> Result<T, ConfigError>
    where
        T: DeserializeOwned + Default,
    {
        match self.params {
            None | Some(Value::Null) => Ok(T::default()),
            Some(value) => serde_json::from_value(value.clone()).map_err(|e| self.malformed(e)),
        }
    }

    /// A count given either bare (`5`) or as `{"count": 5}`.
    pub fn count(&self) -> Result<usize, ConfigError> {
        let raw = match self.params {
            Some(Value::Object(map)) => map.get("count"),
            other => other,
        };
        raw.and_then(Value::as_u64)
            .map(|n| n as usize)
            .ok_or_else(|| self.malformed("expected a non-negative integer count"))
    }

    /// A window given bare in milliseconds (`250`) or as `{"window_ms": 250}`,
    /// falling back to the pipeline's interval hint and then `default`.
    pub fn window(&self, default: Duration) -> Result<Duration, ConfigError> {
        let raw = match self.params {
            Some(Value::Object(map)) => map.get("window_ms"),
            other => other,
        };
        let window = match raw {
            None | Some(Value::Null) => self.config.interval_hint_duration().unwrap_or(default),
            Some(value) => value
                .as_u64()
                .map(Duration::from_millis)
                .ok_or_else(|| self.malformed("window_ms must be a non-negative integer"))?,
        };
        if window.is_zero() {
            return Err(self.malformed("window must be longer than zero"));
        }
        Ok(window)
    }
}

/// Build the stage list for `config`, in chain order.
///
/// Names are matched case-insensitively against the registry. A name the
/// registry does not know becomes a passthrough stage.
pub fn build_stages(
    config: &PipelineConfig,
    registry: &StageRegistry,
) -> Result<Vec<Arc<dyn Operator>>, ConfigError> {
    let mut stages = Vec::with_capacity(config.operator_chain.len());
    for (index, raw_name) in config.operator_chain.iter().enumerate() {
        let name = raw_name.trim().to_ascii_lowercase();
        let spec = OperatorSpec {
            name: &name,
            index,
            params: config.params_for(raw_name, index),
            config,
            registry,
        };
        let stage = match registry.operator(&name) {
            Some(factory) => factory(&spec)?,
            None => {
                warn!(
                    pipeline = %config.id,
                    operator = %raw_name,
                    "unknown operator, passing packets through"
                );
                Arc::new(PassthroughOp::new(&name)) as Arc<dyn Operator>
            }
        };
        debug!(pipeline = %config.id, index, stage = stage.name(), "stage built");
        stages.push(stage);
    }
    Ok(stages)
}

/// Compose `stages` onto `source`, first stage innermost.
pub fn apply_stages(source: StageStream, stages: &[Arc<dyn Operator>]) -> StageStream {
    stages.iter().fold(source, |stream, stage| stage.apply(stream))
}

/// Shorthand for a stage failure on one packet.
pub fn stage_error(stage: &str, message: impl ToString) -> PipelineError {
    PipelineError::Stage {
        stage: stage.to_string(),
        message: message.to_string(),
    }
}
