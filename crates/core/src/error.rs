use chrono::{DateTime, Utc};
use thiserror::Error;

/// Creation-time failures, surfaced synchronously to the caller.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown stream type: {0}")]
    UnknownStreamType(String),

    #[error("pipeline id must not be empty")]
    EmptyPipelineId,

    #[error("duplicate pipeline id: {0}")]
    DuplicatePipeline(String),

    #[error("malformed params for operator '{operator}': {message}")]
    MalformedOperator { operator: String, message: String },

    #[error("'{0}' would re-emit into its own source stream")]
    FeedbackLoop(String),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConfigError {
    pub fn malformed(operator: impl Into<String>, message: impl ToString) -> Self {
        ConfigError::MalformedOperator {
            operator: operator.into(),
            message: message.to_string(),
        }
    }
}

/// Mid-stream failures. Recovered at the pipeline output boundary: logged
/// and counted, never propagated to the orchestrator.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PipelineError {
    #[error("stage '{stage}' failed: {message}")]
    Stage { stage: String, message: String },

    #[error("subscriber {subscriber} failed: {message}")]
    Observer { subscriber: String, message: String },

    #[error("unknown pipeline: {0}")]
    UnknownPipeline(String),
}

/// Snapshot retrieval failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExportError {
    #[error("unknown stream: {0}")]
    UnknownStream(String),

    #[error("invalid stream id '{0}', expected '<metric>@<room_id>'")]
    InvalidStreamId(String),

    #[error("invalid range: start {start} is after end {end}")]
    InvalidRange {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}
