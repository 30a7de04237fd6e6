//! Operation context handed to job bodies.
//!
//! Cancellation is cooperative. The queue raises a [`CancelSignal`] tagged
//! with a [`TerminationReason`]; the first reason set wins and stays readable
//! for the rest of the body's life, so a body unwinding after the signal can
//! still report why it was stopped.

use std::future::Future;
use std::sync::{Arc, OnceLock, Weak};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::executor::QueueShared;
use super::record::JobId;
use crate::error::JobError;

/// Why a cancellation signal fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    UserCancelled,
    TimedOut,
}

/// Cancellation token carrying a set-once reason.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    token: CancellationToken,
    reason: Arc<OnceLock<TerminationReason>>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the signal. Returns false if a reason was already recorded.
    pub fn fire(&self, reason: TerminationReason) -> bool {
        let first = self.reason.set(reason).is_ok();
        self.token.cancel();
        first
    }

    pub fn reason(&self) -> Option<TerminationReason> {
        self.reason.get().copied()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the signal fires.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

/// What a running job body sees of the queue.
#[derive(Clone)]
pub struct OperationContext {
    job_id: JobId,
    signal: CancelSignal,
    queue: Weak<QueueShared>,
}

impl OperationContext {
    pub(crate) fn new(job_id: JobId, signal: CancelSignal, queue: Weak<QueueShared>) -> Self {
        Self {
            job_id,
            signal,
            queue,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Report progress (0.0..=1.0) and/or a status message for the job record.
    ///
    /// Ignored once the job is terminal.
    pub async fn report_progress(&self, progress: Option<f64>, message: Option<String>) {
        if let Some(queue) = self.queue.upgrade() {
            queue.record_progress(self.job_id, progress, message).await;
        }
    }

    /// Why the job was asked to stop, if it was.
    pub fn termination_reason(&self) -> Option<TerminationReason> {
        self.signal.reason()
    }

    pub fn is_cancelled(&self) -> bool {
        self.signal.is_cancelled()
    }

    /// `Err(JobError::Cancelled)` once the signal has fired.
    pub fn check_cancelled(&self) -> Result<(), JobError> {
        if self.signal.is_cancelled() {
            Err(JobError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves once the signal fires.
    pub async fn cancelled(&self) {
        self.signal.cancelled().await
    }

    /// Run `fut` unless the signal fires first, in which case it is dropped and
    /// `JobError::Cancelled` is returned.
    pub async fn run_until_cancelled<F, T>(&self, fut: F) -> Result<T, JobError>
    where
        F: Future<Output = T>,
    {
        tokio::select! {
            biased;
            _ = self.signal.cancelled() => Err(JobError::Cancelled),
            value = fut => Ok(value),
        }
    }
}

impl std::fmt::Debug for OperationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationContext")
            .field("job_id", &self.job_id)
            .field("reason", &self.signal.reason())
            .finish()
    }
}
