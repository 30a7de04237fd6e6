//! Bootstrap + upsert event stream for job records.

use std::sync::Weak;

use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;

use super::executor::QueueShared;
use super::record::JobRecord;

/// Event delivered to job observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    /// Every known record, in submission order.
    Bootstrap { records: Vec<JobRecord> },
    /// One record after a state change.
    Upsert { record: JobRecord },
}

/// Subscription to the execution queue's record changes.
///
/// Yields a bootstrap snapshot first, then one upsert per change. A subscriber
/// that falls behind the broadcast buffer gets a fresh bootstrap instead of a
/// silent gap.
pub struct JobEventStream {
    bootstrap: Option<Vec<JobRecord>>,
    rx: broadcast::Receiver<JobRecord>,
    queue: Weak<QueueShared>,
}

impl JobEventStream {
    pub(crate) fn new(
        records: Vec<JobRecord>,
        rx: broadcast::Receiver<JobRecord>,
        queue: Weak<QueueShared>,
    ) -> Self {
        Self {
            bootstrap: Some(records),
            rx,
            queue,
        }
    }

    /// Wait for the next event. `None` once the queue is gone.
    pub async fn recv(&mut self) -> Option<JobEvent> {
        if let Some(records) = self.bootstrap.take() {
            return Some(JobEvent::Bootstrap { records });
        }

        match self.rx.recv().await {
            Ok(record) => Some(JobEvent::Upsert { record }),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "Job event subscriber lagged, re-bootstrapping");
                let queue = self.queue.upgrade()?;
                let (records, rx) = queue.snapshot_and_subscribe().await;
                self.rx = rx;
                Some(JobEvent::Bootstrap { records })
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }

    /// Adapt into a `futures::Stream`.
    pub fn into_stream(self) -> impl Stream<Item = JobEvent> + Send {
        futures::stream::unfold(self, |mut events| async move {
            events.recv().await.map(|event| (event, events))
        })
    }
}
