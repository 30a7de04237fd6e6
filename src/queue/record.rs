//! Job records and their lifecycle state.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::context::TerminationReason;
use crate::error::JobError;

/// Opaque per-submission job identifier.
pub type JobId = Uuid;

/// Lifecycle state of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobStatus {
    /// Registered, waiting for a free slot.
    Queued,
    /// Body is executing.
    Running,
    Succeeded,
    /// Body returned a non-cancellation error.
    Failed {
        message: String,
        /// Expected failures (e.g. no model route) stay out of warning diagnostics.
        #[serde(default)]
        expected: bool,
    },
    /// Stopped by an explicit user cancel.
    Cancelled,
    /// Stopped because the execution timeout elapsed.
    TimedOut,
}

impl JobStatus {
    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed { .. } | Self::Cancelled | Self::TimedOut
        )
    }

    /// Map the body's result to a terminal status.
    ///
    /// A cooperative cancellation is classified only by the reason recorded
    /// when the signal was raised, never by the error itself.
    pub fn from_outcome(
        result: &Result<(), JobError>,
        reason: Option<TerminationReason>,
    ) -> Self {
        match result {
            Ok(()) => Self::Succeeded,
            Err(JobError::Cancelled) => match reason {
                Some(TerminationReason::TimedOut) => Self::TimedOut,
                Some(TerminationReason::UserCancelled) | None => Self::Cancelled,
            },
            Err(err) => Self::Failed {
                message: err.to_string(),
                expected: err.is_expected(),
            },
        }
    }

    /// Status for a body dropped after it failed to unwind in time.
    pub fn from_reason(reason: TerminationReason) -> Self {
        match reason {
            TerminationReason::TimedOut => Self::TimedOut,
            TerminationReason::UserCancelled => Self::Cancelled,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed { message, .. } => write!(f, "failed({message})"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::TimedOut => write!(f, "timed_out"),
        }
    }
}

/// UI-facing record of one submitted job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub category: String,
    pub title: String,
    pub status: JobStatus,
    pub progress: Option<f64>,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    pub(crate) fn new(id: JobId, category: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            category: category.into(),
            title: title.into(),
            status: JobStatus::Queued,
            progress: None,
            message: None,
            created_at: now,
            started_at: None,
            finished_at: None,
            updated_at: now,
        }
    }

    /// Move to a new status. Terminal statuses are immutable; returns false if
    /// the record was already terminal.
    pub(crate) fn set_status(&mut self, status: JobStatus) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        let now = Utc::now();
        match &status {
            JobStatus::Running if self.started_at.is_none() => self.started_at = Some(now),
            s if s.is_terminal() => self.finished_at = Some(now),
            _ => {}
        }
        self.status = status;
        self.updated_at = now;
        true
    }

    pub(crate) fn set_progress(&mut self, progress: Option<f64>, message: Option<String>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        if let Some(p) = progress.filter(|p| p.is_finite()) {
            self.progress = Some(p.clamp(0.0, 1.0));
        }
        if message.is_some() {
            self.message = message;
        }
        self.updated_at = Utc::now();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_maps_by_reason() {
        let cancelled = Err(JobError::Cancelled);
        assert_eq!(
            JobStatus::from_outcome(&cancelled, Some(TerminationReason::TimedOut)),
            JobStatus::TimedOut
        );
        assert_eq!(
            JobStatus::from_outcome(&cancelled, Some(TerminationReason::UserCancelled)),
            JobStatus::Cancelled
        );
    }

    #[test]
    fn other_errors_fail_even_after_a_signal() {
        let status = JobStatus::from_outcome(
            &Err(JobError::failed("socket closed")),
            Some(TerminationReason::TimedOut),
        );
        assert_eq!(
            status,
            JobStatus::Failed {
                message: "socket closed".into(),
                expected: false
            }
        );
    }

    #[test]
    fn no_route_is_an_expected_failure() {
        let status = JobStatus::from_outcome(&Err(JobError::NoRoute("translation".into())), None);
        assert!(matches!(status, JobStatus::Failed { expected: true, .. }));
    }

    #[test]
    fn terminal_status_is_immutable() {
        let mut record = JobRecord::new(Uuid::new_v4(), "summary", "Summarize");
        assert!(record.set_status(JobStatus::Running));
        assert!(record.started_at.is_some());
        assert!(record.set_status(JobStatus::TimedOut));
        assert!(record.finished_at.is_some());

        assert!(!record.set_status(JobStatus::Succeeded));
        assert!(!record.set_progress(Some(1.0), None));
        assert_eq!(record.status, JobStatus::TimedOut);
    }

    #[test]
    fn progress_is_clamped() {
        let mut record = JobRecord::new(Uuid::new_v4(), "summary", "Summarize");
        record.set_progress(Some(3.0), Some("almost".into()));
        assert_eq!(record.progress, Some(1.0));
        record.set_progress(Some(f64::NAN), None);
        assert_eq!(record.progress, Some(1.0));
        assert_eq!(record.message.as_deref(), Some("almost"));
    }

    #[test]
    fn status_serializes_with_state_tag() {
        let json = serde_json::to_value(JobStatus::Failed {
            message: "HTTP 429".into(),
            expected: false,
        })
        .unwrap();
        assert_eq!(json["state"], "failed");
        assert_eq!(json["message"], "HTTP 429");
        assert_eq!(
            serde_json::to_value(JobStatus::TimedOut).unwrap()["state"],
            "timed_out"
        );
    }
}
