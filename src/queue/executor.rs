//! Execution queue: async job runner with global and per-category ceilings.
//!
//! The queue provides:
//! - `submit()`: register a job and start it as soon as both ceilings allow
//! - `cancel()`: user cancellation of a queued or running job
//! - `events()`: bootstrap snapshot + upsert stream of every job record
//!
//! Admission, counters and record mutations happen under one mutex. Job bodies
//! run in their own tasks and only come back through `complete()`.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::{Mutex, broadcast, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::context::{CancelSignal, OperationContext, TerminationReason};
use super::events::JobEventStream;
use super::record::{JobId, JobRecord, JobStatus};
use crate::config::QueueConfig;
use crate::error::{JobError, QueueError};

/// Default broadcast channel capacity.
const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// Boxed future returned by a job body.
pub type JobFuture = BoxFuture<'static, Result<(), JobError>>;

type JobBody = Box<dyn FnOnce(OperationContext) -> JobFuture + Send>;

struct PendingJob {
    id: JobId,
    category: String,
    body: JobBody,
    timeout: Option<Duration>,
}

#[derive(Default)]
struct QueueState {
    records: HashMap<JobId, JobRecord>,
    /// Submission order, for bootstrap snapshots.
    order: Vec<JobId>,
    pending: VecDeque<PendingJob>,
    /// Signals of non-terminal jobs.
    signals: HashMap<JobId, CancelSignal>,
    waiters: HashMap<JobId, oneshot::Sender<JobStatus>>,
    running_total: usize,
    running_by_category: HashMap<String, usize>,
}

impl QueueState {
    fn snapshot(&self) -> Vec<JobRecord> {
        self.order
            .iter()
            .filter_map(|id| self.records.get(id).cloned())
            .collect()
    }
}

pub(crate) struct QueueShared {
    config: QueueConfig,
    state: Mutex<QueueState>,
    tx: broadcast::Sender<JobRecord>,
}

impl QueueShared {
    fn publish(&self, record: &JobRecord) {
        // Ok if no observers are listening yet.
        let _ = self.tx.send(record.clone());
    }

    pub(crate) async fn snapshot_and_subscribe(
        &self,
    ) -> (Vec<JobRecord>, broadcast::Receiver<JobRecord>) {
        let state = self.state.lock().await;
        (state.snapshot(), self.tx.subscribe())
    }

    pub(crate) async fn record_progress(
        &self,
        id: JobId,
        progress: Option<f64>,
        message: Option<String>,
    ) {
        let mut state = self.state.lock().await;
        if let Some(record) = state.records.get_mut(&id)
            && record.status == JobStatus::Running
            && record.set_progress(progress, message)
        {
            self.publish(record);
        }
    }

    /// Start every pending job both ceilings allow, oldest first. A job blocked
    /// by its category ceiling does not hold back jobs of other categories.
    fn admit_ready(shared: &Arc<Self>, state: &mut QueueState) {
        let global_limit = shared.config.max_concurrent_jobs.max(1);
        let mut index = 0;
        while index < state.pending.len() && state.running_total < global_limit {
            let category = &state.pending[index].category;
            let running = state
                .running_by_category
                .get(category)
                .copied()
                .unwrap_or(0);
            if running >= shared.config.limit_for(category) {
                index += 1;
                continue;
            }
            let Some(job) = state.pending.remove(index) else {
                break;
            };
            Self::start(shared, state, job);
        }
    }

    fn start(shared: &Arc<Self>, state: &mut QueueState, job: PendingJob) {
        state.running_total += 1;
        *state
            .running_by_category
            .entry(job.category.clone())
            .or_default() += 1;

        let signal = state.signals.entry(job.id).or_default().clone();
        if let Some(record) = state.records.get_mut(&job.id)
            && record.set_status(JobStatus::Running)
        {
            shared.publish(record);
        }
        info!(job_id = %job.id, category = %job.category, "Job started");

        let shared = Arc::clone(shared);
        tokio::spawn(async move {
            let PendingJob {
                id, body, timeout, ..
            } = job;
            let ctx = OperationContext::new(id, signal.clone(), Arc::downgrade(&shared));
            let status = shared.drive(id, body(ctx), timeout, &signal).await;
            Self::complete(&shared, id, status).await;
        });
    }

    /// Run a body to completion, racing it against its timeout.
    async fn drive(
        &self,
        id: JobId,
        body: JobFuture,
        timeout: Option<Duration>,
        signal: &CancelSignal,
    ) -> JobStatus {
        let mut body = AssertUnwindSafe(body)
            .catch_unwind()
            .map(|caught| caught.unwrap_or_else(|_| Err(JobError::failed("job body panicked"))))
            .boxed();

        let deadline = async {
            match timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            result = &mut body => return JobStatus::from_outcome(&result, signal.reason()),
            _ = deadline => {
                if signal.fire(TerminationReason::TimedOut) {
                    info!(job_id = %id, timeout = ?timeout, "Job timed out, signalling");
                }
            }
            _ = signal.cancelled() => {}
        }

        // The signal is raised; the body is expected to unwind on its own.
        match self.config.unwind_grace {
            Some(grace) => match tokio::time::timeout(grace, body).await {
                Ok(result) => JobStatus::from_outcome(&result, signal.reason()),
                Err(_) => {
                    warn!(job_id = %id, grace = ?grace, "Job did not unwind in time, dropping it");
                    JobStatus::from_reason(
                        signal.reason().unwrap_or(TerminationReason::UserCancelled),
                    )
                }
            },
            None => {
                let result = body.await;
                JobStatus::from_outcome(&result, signal.reason())
            }
        }
    }

    async fn complete(shared: &Arc<Self>, id: JobId, status: JobStatus) {
        let mut guard = shared.state.lock().await;
        let state = &mut *guard;

        state.running_total = state.running_total.saturating_sub(1);
        state.signals.remove(&id);
        if let Some(record) = state.records.get_mut(&id) {
            if let Some(count) = state.running_by_category.get_mut(&record.category) {
                *count = count.saturating_sub(1);
            }
            if record.set_status(status.clone()) {
                shared.publish(record);
            }
        }

        match &status {
            JobStatus::Failed {
                message,
                expected: true,
            } => debug!(job_id = %id, error = %message, "Job failed (expected)"),
            JobStatus::Failed { message, .. } => warn!(job_id = %id, error = %message, "Job failed"),
            other => info!(job_id = %id, status = %other, "Job finished"),
        }

        if let Some(done) = state.waiters.remove(&id) {
            let _ = done.send(status);
        }

        Self::admit_ready(shared, state);
    }
}

/// Handle to a submitted job.
#[derive(Debug)]
pub struct JobHandle {
    id: JobId,
    done: oneshot::Receiver<JobStatus>,
}

impl JobHandle {
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Wait for the job's terminal status.
    pub async fn wait(self) -> Result<JobStatus, QueueError> {
        self.done
            .await
            .map_err(|_| QueueError::HandleDropped { id: self.id })
    }
}

/// Generic asynchronous job runner.
#[derive(Clone)]
pub struct ExecutionQueue {
    shared: Arc<QueueShared>,
}

impl ExecutionQueue {
    /// Create a new execution queue.
    pub fn new(config: QueueConfig) -> Self {
        let (tx, _rx) = broadcast::channel(DEFAULT_BROADCAST_CAPACITY);
        Self {
            shared: Arc::new(QueueShared {
                config,
                state: Mutex::new(QueueState::default()),
                tx,
            }),
        }
    }

    /// Register a job and start it once the global and category ceilings allow.
    ///
    /// `timeout` bounds execution time only, not time spent queued.
    pub async fn submit<F, Fut>(
        &self,
        category: impl Into<String>,
        title: impl Into<String>,
        timeout: Option<Duration>,
        body: F,
    ) -> JobHandle
    where
        F: FnOnce(OperationContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        let id = Uuid::new_v4();
        let category = category.into();
        let body: JobBody = Box::new(move |ctx| body(ctx).boxed());
        let (done_tx, done_rx) = oneshot::channel();

        let mut guard = self.shared.state.lock().await;
        let state = &mut *guard;

        let record = JobRecord::new(id, category.clone(), title);
        self.shared.publish(&record);
        debug!(job_id = %id, category = %category, title = %record.title, "Job queued");
        state.records.insert(id, record);
        state.order.push(id);
        state.signals.insert(id, CancelSignal::new());
        state.waiters.insert(id, done_tx);
        state.pending.push_back(PendingJob {
            id,
            category,
            body,
            timeout,
        });

        QueueShared::admit_ready(&self.shared, state);

        JobHandle { id, done: done_rx }
    }

    /// Ask a job to stop because the user cancelled it.
    ///
    /// A queued job is cancelled on the spot without its body ever running. A
    /// running job receives a `UserCancelled` signal and is expected to unwind.
    /// Returns false if the job is unknown or already terminal.
    pub async fn cancel(&self, id: JobId) -> bool {
        let mut guard = self.shared.state.lock().await;
        self.cancel_locked(&mut guard, id)
    }

    /// Cancel every job that has not terminated yet.
    pub async fn cancel_all(&self) {
        let mut guard = self.shared.state.lock().await;
        let state = &mut *guard;
        // Queued jobs first, so no freed slot admits them in between.
        let queued: Vec<JobId> = state.pending.iter().map(|job| job.id).collect();
        let running: Vec<JobId> = state
            .signals
            .keys()
            .filter(|id| !queued.contains(id))
            .copied()
            .collect();
        for id in queued.into_iter().chain(running) {
            self.cancel_locked(state, id);
        }
    }

    fn cancel_locked(&self, state: &mut QueueState, id: JobId) -> bool {
        let Some(record) = state.records.get_mut(&id) else {
            return false;
        };
        if record.status.is_terminal() {
            return false;
        }

        if let Some(index) = state.pending.iter().position(|job| job.id == id) {
            state.pending.remove(index);
            state.signals.remove(&id);
            if record.set_status(JobStatus::Cancelled) {
                self.shared.publish(record);
            }
            if let Some(done) = state.waiters.remove(&id) {
                let _ = done.send(JobStatus::Cancelled);
            }
            info!(job_id = %id, "Queued job cancelled before start");
            return true;
        }

        if let Some(signal) = state.signals.get(&id) {
            if signal.fire(TerminationReason::UserCancelled) {
                info!(job_id = %id, "Job cancellation requested");
            } else {
                debug!(job_id = %id, reason = ?signal.reason(), "Job already signalled");
            }
        }
        true
    }

    /// Subscribe to record changes, starting with a snapshot of every record.
    pub async fn events(&self) -> JobEventStream {
        let (records, rx) = self.shared.snapshot_and_subscribe().await;
        JobEventStream::new(records, rx, Arc::downgrade(&self.shared))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::queue::JobEvent;

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    fn queue(max: usize, per_category: usize) -> ExecutionQueue {
        ExecutionQueue::new(QueueConfig {
            max_concurrent_jobs: max,
            default_category_limit: per_category,
            category_limits: HashMap::new(),
            unwind_grace: None,
        })
    }

    async fn wait(handle: JobHandle) -> JobStatus {
        tokio::time::timeout(TEST_TIMEOUT, handle.wait())
            .await
            .expect("job should finish")
            .expect("status should be reported")
    }

    #[tokio::test]
    async fn success_and_failure_are_recorded() {
        let queue = queue(4, 4);
        let ok = queue
            .submit("summary", "ok", None, |_ctx| async { Ok(()) })
            .await;
        let bad = queue
            .submit("summary", "bad", None, |_ctx| async {
                Err(JobError::failed("HTTP 502"))
            })
            .await;

        assert_eq!(wait(ok).await, JobStatus::Succeeded);
        assert_eq!(
            wait(bad).await,
            JobStatus::Failed {
                message: "HTTP 502".into(),
                expected: false
            }
        );
    }

    #[tokio::test]
    async fn timeout_is_reported_as_timed_out() {
        let queue = queue(4, 4);
        let (reason_tx, reason_rx) = oneshot::channel();
        let handle = queue
            .submit(
                "translation",
                "slow",
                Some(Duration::from_millis(20)),
                |ctx| async move {
                    ctx.cancelled().await;
                    let _ = reason_tx.send(ctx.termination_reason());
                    Err(JobError::Cancelled)
                },
            )
            .await;

        assert_eq!(wait(handle).await, JobStatus::TimedOut);
        assert_eq!(reason_rx.await.unwrap(), Some(TerminationReason::TimedOut));
    }

    #[tokio::test]
    async fn user_cancel_is_reported_as_cancelled() {
        let queue = queue(4, 4);
        let handle = queue
            .submit("summary", "long", Some(Duration::from_secs(30)), |ctx| async move {
                ctx.run_until_cancelled(tokio::time::sleep(Duration::from_secs(30)))
                    .await?;
                Ok(())
            })
            .await;
        let id = handle.id();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(queue.cancel(id).await);
        assert_eq!(wait(handle).await, JobStatus::Cancelled);
        assert!(!queue.cancel(id).await);
    }

    #[tokio::test]
    async fn category_ceiling_holds_jobs_back() {
        let queue = queue(8, 1);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..4 {
            let running = running.clone();
            let peak = peak.clone();
            handles.push(
                queue
                    .submit("summary", format!("job {i}"), None, move |_ctx| async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await,
            );
        }
        for handle in handles {
            assert_eq!(wait(handle).await, JobStatus::Succeeded);
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn global_ceiling_spans_categories() {
        let queue = queue(2, 4);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for category in ["summary", "translation", "tagging", "summary"] {
            let running = running.clone();
            let peak = peak.clone();
            handles.push(
                queue
                    .submit(category, category, None, move |_ctx| async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await,
            );
        }
        for handle in handles {
            wait(handle).await;
        }
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn queued_job_cancelled_before_start_never_runs() {
        let queue = queue(1, 1);
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let blocker = queue
            .submit("summary", "blocker", None, |_ctx| async move {
                let _ = release_rx.await;
                Ok(())
            })
            .await;

        let ran = Arc::new(AtomicUsize::new(0));
        let ran_in_job = ran.clone();
        let queued = queue
            .submit("summary", "queued", None, move |_ctx| async move {
                ran_in_job.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(queue.cancel(queued.id()).await);
        assert_eq!(wait(queued).await, JobStatus::Cancelled);

        release_tx.send(()).unwrap();
        assert_eq!(wait(blocker).await, JobStatus::Succeeded);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn first_reason_wins_after_timeout() {
        let queue = queue(4, 4);
        let handle = queue
            .submit("summary", "slow", Some(Duration::from_millis(10)), |ctx| async move {
                ctx.cancelled().await;
                tokio::time::sleep(Duration::from_millis(30)).await;
                Err(JobError::Cancelled)
            })
            .await;
        let id = handle.id();
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.cancel(id).await;

        assert_eq!(wait(handle).await, JobStatus::TimedOut);
    }

    #[tokio::test]
    async fn stubborn_body_is_dropped_after_grace() {
        let queue = ExecutionQueue::new(QueueConfig {
            max_concurrent_jobs: 1,
            default_category_limit: 1,
            category_limits: HashMap::new(),
            unwind_grace: Some(Duration::from_millis(20)),
        });
        let handle = queue
            .submit("summary", "stubborn", Some(Duration::from_millis(10)), |_ctx| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            })
            .await;
        assert_eq!(wait(handle).await, JobStatus::TimedOut);

        // The slot is free again.
        let next = queue
            .submit("summary", "next", None, |_ctx| async { Ok(()) })
            .await;
        assert_eq!(wait(next).await, JobStatus::Succeeded);
    }

    #[tokio::test]
    #[allow(unreachable_code)]
    async fn panicking_body_fails_and_frees_slot() {
        let queue = queue(1, 1);
        let boom = queue
            .submit("summary", "boom", None, |_ctx| async {
                panic!("boom");
                Ok(())
            })
            .await;
        assert!(matches!(wait(boom).await, JobStatus::Failed { .. }));

        let next = queue
            .submit("summary", "next", None, |_ctx| async { Ok(()) })
            .await;
        assert_eq!(wait(next).await, JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn events_bootstrap_then_upsert() {
        let queue = queue(4, 4);
        let first = queue
            .submit("summary", "first", None, |_ctx| async { Ok(()) })
            .await;
        wait(first).await;

        let mut events = queue.events().await;
        match events.recv().await.unwrap() {
            JobEvent::Bootstrap { records } => {
                assert_eq!(records.len(), 1);
                assert_eq!(records[0].status, JobStatus::Succeeded);
            }
            other => panic!("expected bootstrap, got {other:?}"),
        }

        let second = queue
            .submit("summary", "second", None, |ctx| async move {
                ctx.report_progress(Some(0.5), Some("halfway".into())).await;
                Ok(())
            })
            .await;
        let id = second.id();
        wait(second).await;

        let mut statuses = Vec::new();
        for _ in 0..4 {
            match events.recv().await.unwrap() {
                JobEvent::Upsert { record } => {
                    assert_eq!(record.id, id);
                    statuses.push(record.status);
                }
                other => panic!("expected upsert, got {other:?}"),
            }
        }
        assert_eq!(
            statuses,
            vec![
                JobStatus::Queued,
                JobStatus::Running,
                JobStatus::Running,
                JobStatus::Succeeded
            ]
        );
    }

    #[tokio::test]
    async fn lagging_subscriber_is_rebootstrapped() {
        let queue = queue(4, 4);
        let mut events = queue.events().await;
        assert!(matches!(
            events.recv().await.unwrap(),
            JobEvent::Bootstrap { .. }
        ));

        let updates = DEFAULT_BROADCAST_CAPACITY + 100;
        let chatty = queue
            .submit("summary", "chatty", None, move |ctx| async move {
                for i in 0..updates {
                    ctx.report_progress(Some(i as f64 / updates as f64), None)
                        .await;
                }
                Ok(())
            })
            .await;
        let id = chatty.id();
        assert_eq!(wait(chatty).await, JobStatus::Succeeded);

        // The missed upserts are replaced by a fresh snapshot.
        match events.recv().await.unwrap() {
            JobEvent::Bootstrap { records } => {
                assert_eq!(records.len(), 1);
                assert_eq!(records[0].id, id);
                assert_eq!(records[0].status, JobStatus::Succeeded);
            }
            other => panic!("expected bootstrap, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn event_stream_yields_bootstrap_then_upserts() {
        use futures::StreamExt;

        let queue = queue(4, 4);
        let mut stream = Box::pin(queue.events().await.into_stream());
        match stream.next().await.unwrap() {
            JobEvent::Bootstrap { records } => assert!(records.is_empty()),
            other => panic!("expected bootstrap, got {other:?}"),
        }

        let handle = queue
            .submit("tagging", "tags", None, |_ctx| async { Ok(()) })
            .await;
        let id = handle.id();
        wait(handle).await;

        let statuses: Vec<JobStatus> = stream
            .take(3)
            .map(|event| match event {
                JobEvent::Upsert { record } => {
                    assert_eq!(record.id, id);
                    record.status
                }
                other => panic!("expected upsert, got {other:?}"),
            })
            .collect()
            .await;
        assert_eq!(
            statuses,
            vec![JobStatus::Queued, JobStatus::Running, JobStatus::Succeeded]
        );
    }

    #[tokio::test]
    async fn cancel_all_stops_running_and_queued() {
        let queue = queue(1, 1);
        let running = queue
            .submit("summary", "running", None, |ctx| async move {
                ctx.cancelled().await;
                Err(JobError::Cancelled)
            })
            .await;
        let queued = queue
            .submit("summary", "queued", None, |_ctx| async { Ok(()) })
            .await;

        queue.cancel_all().await;
        assert_eq!(wait(running).await, JobStatus::Cancelled);
        assert_eq!(wait(queued).await, JobStatus::Cancelled);
    }
}
