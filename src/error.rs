//! Error types for the reader agent runtime.

use uuid::Uuid;

use crate::agent::Owner;

/// Top-level error type for the runtime.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Missing queue policy for category {category}")]
    MissingPolicy { category: String },
}

/// Execution queue errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Job {id} finished without reporting a status")]
    HandleDropped { id: Uuid },
}

/// Agent runtime errors.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("No job body registered for task {task_id} ({owner})")]
    MissingJobBody { task_id: Uuid, owner: Owner },
}

/// Error returned by a job body.
///
/// `Cancelled` is the cooperative cancellation signal: a body returns it after
/// observing its operation context being cancelled. Whether that ends up as
/// `cancelled` or `timed_out` is decided by the execution queue, never by the
/// body.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    #[error("operation cancelled")]
    Cancelled,

    #[error("no model route: {0}")]
    NoRoute(String),

    #[error("{0}")]
    Failed(String),
}

impl JobError {
    /// Expected failures are reported but kept out of warning-level diagnostics.
    pub fn is_expected(&self) -> bool {
        matches!(self, Self::NoRoute(_))
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

impl From<anyhow::Error> for JobError {
    fn from(err: anyhow::Error) -> Self {
        Self::Failed(format!("{err:#}"))
    }
}

/// Result type alias for the runtime.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anyhow_context_is_kept() {
        let err = anyhow::anyhow!("connection reset").context("fetching summary");
        let job_err: JobError = err.into();
        assert_eq!(
            job_err,
            JobError::Failed("fetching summary: connection reset".to_string())
        );
    }

    #[test]
    fn only_no_route_is_expected() {
        assert!(JobError::NoRoute("summary".into()).is_expected());
        assert!(!JobError::Cancelled.is_expected());
        assert!(!JobError::failed("boom").is_expected());
    }

    #[test]
    fn config_errors_surface_through_top_level_error() {
        let err: Error = ConfigError::InvalidValue {
            key: "READER_MAX_CONCURRENT_JOBS".into(),
            message: "must be at least 1".into(),
        }
        .into();
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(
            err.to_string(),
            "Configuration error: Invalid configuration value for READER_MAX_CONCURRENT_JOBS: must be at least 1"
        );

        let result: Result<()> = Err(QueueError::HandleDropped { id: Uuid::nil() }.into());
        assert!(matches!(result, Err(Error::Queue(_))));
    }

    #[test]
    fn failed_message_is_verbatim() {
        assert_eq!(JobError::failed("HTTP 502").to_string(), "HTTP 502");
    }
}
