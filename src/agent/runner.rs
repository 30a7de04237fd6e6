//! Runs admitted agent owners on the execution queue.
//!
//! The engine decides *who* may run; the queue runs the body and decides how
//! it ended. The runner carries the result back: it maps the queue's final
//! [`JobStatus`] to the owner's terminal phase, finishes the owner with the
//! token it was activated under, and launches whichever owner got promoted
//! into the freed slot.
//!
//! Lock order is runner state, then engine. Bodies of waiting owners are kept
//! here and pruned whenever their task leaves the engine's waiting queue.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use super::engine::{AdmissionDecision, AgentRuntimeEngine, FinishOutcome};
use super::events::ActiveToken;
use super::owner::{AgentCategory, EntityId, Owner, TaskSpec};
use super::phase::AgentPhase;
use crate::config::AgentConfig;
use crate::error::{AgentError, JobError};
use crate::queue::{ExecutionQueue, JobHandle, JobId, JobStatus, OperationContext, TerminationReason};

/// A unit of agent work (summarize, translate, tag) supplied by the caller.
#[async_trait]
pub trait AgentJob: Send + Sync {
    /// Title shown on the job record.
    fn title(&self, owner: &Owner) -> String {
        format!("{} for entry {}", owner.category, owner.entity_id)
    }

    async fn run(&self, ctx: AgentJobContext) -> Result<(), JobError>;
}

/// Context for one activation of an owner.
#[derive(Clone)]
pub struct AgentJobContext {
    owner: Owner,
    task_id: Uuid,
    token: ActiveToken,
    engine: Arc<AgentRuntimeEngine>,
    op: OperationContext,
}

impl AgentJobContext {
    pub fn owner(&self) -> &Owner {
        &self.owner
    }

    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    pub fn active_token(&self) -> ActiveToken {
        self.token
    }

    pub fn operation(&self) -> &OperationContext {
        &self.op
    }

    /// Report a phase for this activation. Mirrors status/progress onto the
    /// job record when the engine accepts it.
    pub async fn set_phase(
        &self,
        phase: AgentPhase,
        status_text: Option<String>,
        progress: Option<f64>,
    ) -> bool {
        let applied = self
            .engine
            .update_phase(
                &self.owner,
                phase,
                status_text.clone(),
                progress,
                Some(self.token),
            )
            .await;
        if applied {
            self.op.report_progress(progress, status_text).await;
        }
        applied
    }

    /// Whether this activation still owns the slot.
    pub async fn is_current(&self) -> bool {
        self.engine.is_current_token(&self.owner, self.token).await
    }

    pub fn check_cancelled(&self) -> Result<(), JobError> {
        self.op.check_cancelled()
    }

    pub fn termination_reason(&self) -> Option<TerminationReason> {
        self.op.termination_reason()
    }
}

/// Agent terminal phase (and reason) for a finished job.
pub fn terminal_phase(status: &JobStatus) -> (AgentPhase, Option<String>) {
    match status {
        JobStatus::Succeeded => (AgentPhase::Completed, None),
        JobStatus::Failed { message, .. } => (AgentPhase::Failed, Some(message.clone())),
        JobStatus::Cancelled => (AgentPhase::Cancelled, None),
        JobStatus::TimedOut => (AgentPhase::TimedOut, None),
        JobStatus::Queued | JobStatus::Running => (
            AgentPhase::Failed,
            Some(format!("job ended while {status}")),
        ),
    }
}

type SharedJob = Arc<dyn AgentJob>;

#[derive(Default)]
struct RunnerState {
    /// Bodies of waiting tasks, by task id.
    bodies: HashMap<Uuid, SharedJob>,
    /// Queue job currently running for each active owner.
    running: HashMap<Owner, JobId>,
}

/// How an activation of an owner got into its slot.
enum Slot {
    Started(JobHandle),
    /// Promoted without a stored body.
    Missing(Uuid),
}

/// Submits agent tasks to the engine and runs admitted ones on the queue.
#[derive(Clone)]
pub struct AgentTaskRunner {
    engine: Arc<AgentRuntimeEngine>,
    queue: ExecutionQueue,
    config: Arc<AgentConfig>,
    state: Arc<Mutex<RunnerState>>,
}

impl AgentTaskRunner {
    pub fn new(engine: Arc<AgentRuntimeEngine>, queue: ExecutionQueue, config: AgentConfig) -> Self {
        Self {
            engine,
            queue,
            config: Arc::new(config),
            state: Arc::new(Mutex::new(RunnerState::default())),
        }
    }

    /// Submit a task. Started tasks run right away; waiting ones run when promoted.
    pub async fn submit(&self, spec: TaskSpec, job: SharedJob) -> AdmissionDecision {
        let owner = spec.owner.clone();
        let waiting_task_id = spec.task_id;
        let mut state = self.state.lock().await;
        let decision = self.engine.submit(spec).await;

        match &decision {
            AdmissionDecision::StartNow {
                task_id,
                active_token,
            } => {
                // Registered as running before the lock is released, so a
                // `cancel` right after admission reaches the queue job.
                let handle = self
                    .start_job(&mut state, &owner, *task_id, *active_token, job)
                    .await;
                let runner = self.clone();
                let token = *active_token;
                tokio::spawn(async move {
                    runner
                        .drive_slot(owner, token, Slot::Started(handle))
                        .await
                });
            }
            AdmissionDecision::QueuedWaiting { .. } => {
                state.bodies.insert(waiting_task_id, job);
            }
            AdmissionDecision::AlreadyActive { .. } | AdmissionDecision::Rejected { .. } => {}
        }

        self.prune(&mut state).await;
        decision
    }

    /// Stop an owner's work: abandon it if waiting, user-cancel it if running.
    pub async fn cancel(&self, owner: &Owner) -> bool {
        let job_id = {
            let mut state = self.state.lock().await;
            if self.engine.abandon_waiting(owner).await {
                self.prune(&mut state).await;
                return true;
            }
            state.running.get(owner).copied()
        };
        match job_id {
            Some(id) => self.queue.cancel(id).await,
            None => false,
        }
    }

    /// Abandon every waiting task of `category` targeting `entity_id`.
    pub async fn abandon_entity(&self, category: AgentCategory, entity_id: EntityId) -> Vec<Owner> {
        let mut state = self.state.lock().await;
        let removed = self
            .engine
            .abandon_waiting_entity(category, entity_id)
            .await;
        self.prune(&mut state).await;
        removed
    }

    pub fn engine(&self) -> &Arc<AgentRuntimeEngine> {
        &self.engine
    }

    pub fn queue(&self) -> &ExecutionQueue {
        &self.queue
    }

    async fn prune(&self, state: &mut RunnerState) {
        let waiting = self.engine.waiting_task_ids().await;
        state.bodies.retain(|task_id, _| waiting.contains(task_id));
    }

    /// Run one category slot: the launched owner, then each owner promoted
    /// into the slot after it.
    async fn drive_slot(&self, mut owner: Owner, mut token: ActiveToken, mut slot: Slot) {
        loop {
            let (phase, reason) = match slot {
                Slot::Started(handle) => {
                    let job_id = handle.id();
                    let status = handle.wait().await.unwrap_or_else(|e| JobStatus::Failed {
                        message: e.to_string(),
                        expected: false,
                    });
                    debug!(owner = %owner, job_id = %job_id, status = %status, "Agent job settled");
                    terminal_phase(&status)
                }
                Slot::Missing(task_id) => {
                    let err = AgentError::MissingJobBody {
                        task_id,
                        owner: owner.clone(),
                    };
                    warn!(error = %err, "Cannot launch promoted agent task");
                    (AgentPhase::Failed, Some(err.to_string()))
                }
            };

            let mut state = self.state.lock().await;
            state.running.remove(&owner);
            let outcome = self
                .engine
                .finish(&owner, phase, reason, Some(token))
                .await;
            let next = self.launch_promoted(&mut state, outcome).await;
            self.prune(&mut state).await;
            drop(state);

            match next {
                Some(next) => (owner, token, slot) = next,
                None => break,
            }
        }
    }

    /// Start the owner promoted by a finish, under the same lock.
    async fn launch_promoted(
        &self,
        state: &mut RunnerState,
        outcome: FinishOutcome,
    ) -> Option<(Owner, ActiveToken, Slot)> {
        let promoted = outcome.promoted?;
        let run = self.engine.run_state(&promoted).await?;
        let token = run.active_token?;
        let slot = match state.bodies.remove(&run.task_id) {
            Some(job) => Slot::Started(
                self.start_job(state, &promoted, run.task_id, token, job)
                    .await,
            ),
            None => Slot::Missing(run.task_id),
        };
        Some((promoted, token, slot))
    }

    /// Submit the owner's body to the queue and record it as running.
    async fn start_job(
        &self,
        state: &mut RunnerState,
        owner: &Owner,
        task_id: Uuid,
        token: ActiveToken,
        job: SharedJob,
    ) -> JobHandle {
        let title = job.title(owner);
        let timeout = self.config.timeout_for(owner.category);
        let engine = Arc::clone(&self.engine);
        let job_owner = owner.clone();

        let handle = self
            .queue
            .submit(owner.category.as_str(), title, timeout, move |op| async move {
                let ctx = AgentJobContext {
                    owner: job_owner,
                    task_id,
                    token,
                    engine,
                    op,
                };
                job.run(ctx).await
            })
            .await;

        state.running.insert(owner.clone(), handle.id());
        handle
    }
}
