//! Agent runtime engine: owner-aware admission, promotion and phase tracking.
//!
//! All bookkeeping lives in one [`EngineState`] behind a single mutex, so
//! admission, phase transitions and queue mutations are serialized and every
//! event is appended in the order the coordinator decided it. Job bodies never
//! run under this lock; they only present the [`ActiveToken`] they were handed
//! when their owner became active.
//!
//! Per category:
//! - at most `concurrent_limit` owners are active,
//! - at most `waiting_capacity` owners wait, overflow resolved by the
//!   [`ReplacementPolicy`],
//! - finishing an active owner promotes the head waiter of the same category
//!   only.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, broadcast};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::events::{ActiveToken, DropReason, RuntimeEvent, SequencedEvent};
use super::owner::{AgentCategory, EntityId, Owner, RequestSource, TaskSpec};
use super::phase::{AgentPhase, PhaseStep};
use super::policy::{QueuePolicy, ReplacementPolicy};
use crate::config::AgentConfig;

/// Default broadcast channel capacity.
const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// Default number of events retained in the in-memory log.
pub const DEFAULT_EVENT_LOG_CAPACITY: usize = 1024;

/// Per-owner run record, owned by the engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunState {
    pub task_id: Uuid,
    pub owner: Owner,
    pub source: RequestSource,
    pub phase: AgentPhase,
    pub status_text: Option<String>,
    pub progress: Option<f64>,
    pub updated_at: DateTime<Utc>,
    /// Token of the current (or most recent) activation.
    pub active_token: Option<ActiveToken>,
}

impl RunState {
    fn new(spec: &TaskSpec, phase: AgentPhase, active_token: Option<ActiveToken>) -> Self {
        Self {
            task_id: spec.task_id,
            owner: spec.owner.clone(),
            source: spec.source,
            phase,
            status_text: None,
            progress: None,
            updated_at: Utc::now(),
            active_token,
        }
    }
}

/// Result of submitting a [`TaskSpec`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionDecision {
    /// The owner is active now; the job must present `active_token`.
    StartNow {
        task_id: Uuid,
        active_token: ActiveToken,
    },
    /// The owner waits at this 1-based rank within its category.
    QueuedWaiting { position: usize },
    /// The owner already has an active run; the request was not duplicated.
    AlreadyActive { task_id: Uuid },
    /// The waiting queue is full and the policy refuses new requests.
    Rejected { reason: DropReason },
}

/// What a successful `finish` did to the category's waiting queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FinishOutcome {
    pub promoted: Option<Owner>,
    /// Waiters discarded while looking for an eligible successor.
    pub dropped: Vec<Owner>,
}

#[derive(Debug)]
struct WaitingEntry {
    spec: TaskSpec,
    enqueued_at: Instant,
}

#[derive(Debug, Default)]
struct CategoryQueue {
    active: Vec<Owner>,
    waiting: VecDeque<WaitingEntry>,
}

/// Append-only sequenced event log with live fan-out.
struct EventLog {
    next_seq: u64,
    entries: VecDeque<SequencedEvent>,
    capacity: usize,
    tx: broadcast::Sender<SequencedEvent>,
}

impl EventLog {
    fn emit(&mut self, event: RuntimeEvent) {
        self.next_seq += 1;
        let sequenced = SequencedEvent {
            seq: self.next_seq,
            at: Utc::now(),
            event,
        };
        self.entries.push_back(sequenced.clone());
        if self.entries.len() > self.capacity {
            let drain_count = self.entries.len() - self.capacity;
            self.entries.drain(..drain_count);
        }
        // Ok if nobody is subscribed.
        let _ = self.tx.send(sequenced);
    }
}

struct EngineState {
    runs: HashMap<Owner, RunState>,
    categories: HashMap<AgentCategory, CategoryQueue>,
    next_generation: u64,
    events: EventLog,
}

impl EngineState {
    fn is_active(&self, owner: &Owner) -> bool {
        self.categories
            .get(&owner.category)
            .is_some_and(|q| q.active.contains(owner))
    }

    fn admit(&mut self, spec: TaskSpec, policy: QueuePolicy) -> AdmissionDecision {
        let owner = spec.owner.clone();
        let queue = self.categories.entry(owner.category).or_default();

        if queue.active.contains(&owner) {
            let task_id = self
                .runs
                .get(&owner)
                .map(|r| r.task_id)
                .unwrap_or(spec.task_id);
            debug!(owner = %owner, task_id = %task_id, "Owner already active, request not duplicated");
            return AdmissionDecision::AlreadyActive { task_id };
        }

        if let Some(index) = queue.waiting.iter().position(|w| w.spec.owner == owner) {
            let previous = std::mem::replace(&mut queue.waiting[index].spec, spec.clone());
            let position = index + 1;
            if let Some(run) = self.runs.get_mut(&owner) {
                run.task_id = spec.task_id;
                run.source = spec.source;
                run.updated_at = Utc::now();
            }
            self.events.emit(RuntimeEvent::Dropped {
                task_id: previous.task_id,
                owner: owner.clone(),
                reason: DropReason::SupersededBySameOwner,
            });
            self.events.emit(RuntimeEvent::Queued {
                task_id: spec.task_id,
                owner,
                position,
            });
            return AdmissionDecision::QueuedWaiting { position };
        }

        if queue.active.len() < policy.concurrent_limit.max(1) {
            let active_token = self.activate(&spec);
            info!(owner = %owner, task_id = %spec.task_id, token = %active_token, "Agent task started");
            return AdmissionDecision::StartNow {
                task_id: spec.task_id,
                active_token,
            };
        }

        let capacity = policy.waiting_capacity;
        let mut evicted = Vec::new();
        if queue.waiting.len() >= capacity {
            if policy.replacement == ReplacementPolicy::RejectNew || capacity == 0 {
                info!(owner = %owner, task_id = %spec.task_id, capacity, "Waiting queue full, request rejected");
                self.events.emit(RuntimeEvent::Dropped {
                    task_id: spec.task_id,
                    owner,
                    reason: DropReason::WaitingQueueFull,
                });
                return AdmissionDecision::Rejected {
                    reason: DropReason::WaitingQueueFull,
                };
            }
            while queue.waiting.len() >= capacity {
                match queue.waiting.pop_front() {
                    Some(entry) => evicted.push(entry),
                    None => break,
                }
            }
        }

        queue.waiting.push_back(WaitingEntry {
            spec: spec.clone(),
            enqueued_at: Instant::now(),
        });
        let position = queue.waiting.len();

        for entry in &evicted {
            info!(owner = %entry.spec.owner, task_id = %entry.spec.task_id, "Oldest waiter replaced by latest request");
            Self::cancel_waiter(
                &mut self.runs,
                &mut self.events,
                &entry.spec,
                DropReason::ReplacedByLatest,
            );
        }

        self.runs
            .insert(owner.clone(), RunState::new(&spec, AgentPhase::Waiting, None));
        self.events.emit(RuntimeEvent::Queued {
            task_id: spec.task_id,
            owner: owner.clone(),
            position,
        });
        info!(owner = %owner, task_id = %spec.task_id, position, "Agent task queued");

        AdmissionDecision::QueuedWaiting { position }
    }

    /// Move an owner into the active set under a freshly minted token.
    fn activate(&mut self, spec: &TaskSpec) -> ActiveToken {
        self.next_generation += 1;
        let active_token = ActiveToken::from_generation(self.next_generation);

        self.categories
            .entry(spec.owner.category)
            .or_default()
            .active
            .push(spec.owner.clone());
        self.runs.insert(
            spec.owner.clone(),
            RunState::new(spec, AgentPhase::Requesting, Some(active_token)),
        );
        self.events.emit(RuntimeEvent::Activated {
            task_id: spec.task_id,
            owner: spec.owner.clone(),
            active_token,
        });

        active_token
    }

    fn cancel_waiter(
        runs: &mut HashMap<Owner, RunState>,
        events: &mut EventLog,
        spec: &TaskSpec,
        reason: DropReason,
    ) {
        if let Some(run) = runs.get_mut(&spec.owner)
            && run.task_id == spec.task_id
            && run.phase.can_transition_to(AgentPhase::Cancelled)
        {
            run.phase = AgentPhase::Cancelled;
            run.active_token = None;
            run.updated_at = Utc::now();
        }
        events.emit(RuntimeEvent::Dropped {
            task_id: spec.task_id,
            owner: spec.owner.clone(),
            reason,
        });
    }

    fn token_matches(run: &RunState, token: Option<ActiveToken>) -> bool {
        match token {
            Some(token) => run.active_token == Some(token),
            None => true,
        }
    }

    fn update_phase(
        &mut self,
        owner: &Owner,
        phase: AgentPhase,
        status_text: Option<String>,
        progress: Option<f64>,
        token: Option<ActiveToken>,
    ) -> bool {
        if phase.is_terminal() {
            debug!(owner = %owner, phase = %phase, "Terminal phase ignored by update_phase");
            return false;
        }
        if !self.is_active(owner) {
            debug!(owner = %owner, phase = %phase, "Phase update for inactive owner ignored");
            return false;
        }
        let Some(run) = self.runs.get_mut(owner) else {
            return false;
        };
        if !Self::token_matches(run, token) {
            debug!(owner = %owner, phase = %phase, "Stale active token, phase update ignored");
            return false;
        }

        let phase_changed = match run.phase.step_to(phase) {
            PhaseStep::Reject => {
                debug!(owner = %owner, from = %run.phase, to = %phase, "Out-of-order phase update dropped");
                return false;
            }
            PhaseStep::Advance => {
                run.phase = phase;
                true
            }
            PhaseStep::Stay => false,
        };

        if status_text.is_some() {
            run.status_text = status_text;
        }
        let progress = progress
            .filter(|p| p.is_finite())
            .map(|p| p.clamp(0.0, 1.0));
        let progress_changed = progress.is_some_and(|p| run.progress != Some(p));
        if progress.is_some() {
            run.progress = progress;
        }
        run.updated_at = Utc::now();
        let task_id = run.task_id;

        if phase_changed {
            self.events.emit(RuntimeEvent::PhaseChanged {
                task_id,
                owner: owner.clone(),
                phase,
            });
        }
        if let Some(progress) = progress
            && progress_changed
        {
            self.events.emit(RuntimeEvent::ProgressUpdated {
                task_id,
                owner: owner.clone(),
                progress,
            });
        }
        true
    }

    fn finish(
        &mut self,
        owner: &Owner,
        terminal: AgentPhase,
        reason: Option<String>,
        token: Option<ActiveToken>,
        policy: QueuePolicy,
    ) -> FinishOutcome {
        if !terminal.is_terminal() {
            warn!(owner = %owner, phase = %terminal, "finish called with a non-terminal phase");
            return FinishOutcome::default();
        }
        let Some(queue) = self.categories.get_mut(&owner.category) else {
            return FinishOutcome::default();
        };
        let Some(index) = queue.active.iter().position(|o| o == owner) else {
            debug!(owner = %owner, "Finish for inactive owner ignored");
            return FinishOutcome::default();
        };
        let Some(run) = self.runs.get_mut(owner) else {
            return FinishOutcome::default();
        };
        if !Self::token_matches(run, token) {
            debug!(owner = %owner, phase = %terminal, "Stale active token, finish ignored");
            return FinishOutcome::default();
        }
        if !run.phase.can_transition_to(terminal) {
            return FinishOutcome::default();
        }

        run.phase = terminal;
        if reason.is_some() {
            run.status_text = reason.clone();
        }
        run.updated_at = Utc::now();
        let task_id = run.task_id;
        queue.active.remove(index);

        self.events.emit(RuntimeEvent::Terminal {
            task_id,
            owner: owner.clone(),
            phase: terminal,
            reason,
        });
        info!(owner = %owner, task_id = %task_id, phase = %terminal, "Agent task finished");

        self.promote_next(owner, policy)
    }

    /// Hand the freed slot of `from` to the head waiter of the same category.
    fn promote_next(&mut self, from: &Owner, policy: QueuePolicy) -> FinishOutcome {
        let limit = policy.concurrent_limit.max(1);
        let mut outcome = FinishOutcome::default();

        loop {
            let queue = self.categories.entry(from.category).or_default();
            if queue.active.len() >= limit {
                break;
            }
            let Some(entry) = queue.waiting.pop_front() else {
                break;
            };

            if let Some(max_wait) = policy.max_wait
                && entry.enqueued_at.elapsed() > max_wait
            {
                info!(owner = %entry.spec.owner, task_id = %entry.spec.task_id, "Waiter expired before promotion");
                Self::cancel_waiter(
                    &mut self.runs,
                    &mut self.events,
                    &entry.spec,
                    DropReason::WaitExpired,
                );
                outcome.dropped.push(entry.spec.owner);
                continue;
            }

            let active_token = self.activate(&entry.spec);
            self.events.emit(RuntimeEvent::Promoted {
                from: from.clone(),
                to: Some(entry.spec.owner.clone()),
            });
            info!(
                from = %from,
                to = %entry.spec.owner,
                token = %active_token,
                "Promoted waiting agent task"
            );
            outcome.promoted = Some(entry.spec.owner);
            break;
        }

        if outcome.promoted.is_none() {
            self.events.emit(RuntimeEvent::Promoted {
                from: from.clone(),
                to: None,
            });
        }
        outcome
    }

    fn remove_waiters(
        &mut self,
        category: AgentCategory,
        predicate: impl Fn(&Owner) -> bool,
        reason: DropReason,
    ) -> Vec<Owner> {
        let Some(queue) = self.categories.get_mut(&category) else {
            return Vec::new();
        };
        let mut removed = Vec::new();
        let mut kept = VecDeque::with_capacity(queue.waiting.len());
        for entry in queue.waiting.drain(..) {
            if predicate(&entry.spec.owner) {
                removed.push(entry);
            } else {
                kept.push_back(entry);
            }
        }
        queue.waiting = kept;

        for entry in &removed {
            info!(owner = %entry.spec.owner, task_id = %entry.spec.task_id, reason = %reason, "Waiting agent task dropped");
            Self::cancel_waiter(&mut self.runs, &mut self.events, &entry.spec, reason);
        }
        removed.into_iter().map(|e| e.spec.owner).collect()
    }
}

/// Identity-aware coordinator for agent jobs.
pub struct AgentRuntimeEngine {
    policies: HashMap<AgentCategory, QueuePolicy>,
    state: Mutex<EngineState>,
    tx: broadcast::Sender<SequencedEvent>,
}

impl AgentRuntimeEngine {
    /// Create an engine with the given per-category policies.
    ///
    /// Categories without an entry fall back to [`QueuePolicy::default`].
    pub fn new(policies: HashMap<AgentCategory, QueuePolicy>) -> Self {
        Self::with_log_capacity(policies, DEFAULT_EVENT_LOG_CAPACITY)
    }

    pub fn with_log_capacity(
        policies: HashMap<AgentCategory, QueuePolicy>,
        log_capacity: usize,
    ) -> Self {
        let (tx, _rx) = broadcast::channel(DEFAULT_BROADCAST_CAPACITY);
        Self {
            policies,
            state: Mutex::new(EngineState {
                runs: HashMap::new(),
                categories: HashMap::new(),
                next_generation: 0,
                events: EventLog {
                    next_seq: 0,
                    entries: VecDeque::new(),
                    capacity: log_capacity.max(1),
                    tx: tx.clone(),
                },
            }),
            tx,
        }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        Self::with_log_capacity(config.policies.clone(), config.event_log_capacity)
    }

    /// Configured policy for a category.
    pub fn policy(&self, category: AgentCategory) -> QueuePolicy {
        self.policies.get(&category).copied().unwrap_or_default()
    }

    /// Admit a submission: start it, queue it, or refuse it.
    pub async fn submit(&self, spec: TaskSpec) -> AdmissionDecision {
        let policy = spec
            .policy
            .unwrap_or_else(|| self.policy(spec.owner.category));
        self.state.lock().await.admit(spec, policy)
    }

    /// Shorthand for submitting a fresh spec for `owner`.
    pub async fn request_start(&self, owner: Owner, source: RequestSource) -> AdmissionDecision {
        self.submit(TaskSpec::new(owner, source)).await
    }

    /// Apply a non-terminal phase/progress update. Returns whether it was applied.
    ///
    /// Stale tokens, inactive owners and out-of-order phases are dropped
    /// silently.
    pub async fn update_phase(
        &self,
        owner: &Owner,
        phase: AgentPhase,
        status_text: Option<String>,
        progress: Option<f64>,
        token: Option<ActiveToken>,
    ) -> bool {
        self.state
            .lock()
            .await
            .update_phase(owner, phase, status_text, progress, token)
    }

    /// Terminate the owner's active run and promote the next waiter of its category.
    pub async fn finish(
        &self,
        owner: &Owner,
        terminal: AgentPhase,
        reason: Option<String>,
        token: Option<ActiveToken>,
    ) -> FinishOutcome {
        let policy = self.policy(owner.category);
        self.state
            .lock()
            .await
            .finish(owner, terminal, reason, token, policy)
    }

    /// Remove one waiting owner. Returns false if it was not waiting.
    pub async fn abandon_waiting(&self, owner: &Owner) -> bool {
        let target = owner.clone();
        !self
            .state
            .lock()
            .await
            .remove_waiters(
                owner.category,
                |o| *o == target,
                DropReason::AbandonedByEntrySwitch,
            )
            .is_empty()
    }

    /// Remove every waiting owner of `category` that targets `entity_id`.
    pub async fn abandon_waiting_entity(
        &self,
        category: AgentCategory,
        entity_id: EntityId,
    ) -> Vec<Owner> {
        self.state.lock().await.remove_waiters(
            category,
            |o| o.entity_id == entity_id,
            DropReason::AbandonedByEntrySwitch,
        )
    }

    pub async fn phase(&self, owner: &Owner) -> Option<AgentPhase> {
        self.state.lock().await.runs.get(owner).map(|r| r.phase)
    }

    pub async fn run_state(&self, owner: &Owner) -> Option<RunState> {
        self.state.lock().await.runs.get(owner).cloned()
    }

    /// 1-based rank of a waiting owner.
    pub async fn waiting_position(&self, owner: &Owner) -> Option<usize> {
        let state = self.state.lock().await;
        state
            .categories
            .get(&owner.category)?
            .waiting
            .iter()
            .position(|w| w.spec.owner == *owner)
            .map(|i| i + 1)
    }

    pub async fn active_owners(&self, category: AgentCategory) -> Vec<Owner> {
        let state = self.state.lock().await;
        state
            .categories
            .get(&category)
            .map(|q| q.active.clone())
            .unwrap_or_default()
    }

    pub async fn waiting_owners(&self, category: AgentCategory) -> Vec<Owner> {
        let state = self.state.lock().await;
        state
            .categories
            .get(&category)
            .map(|q| q.waiting.iter().map(|w| w.spec.owner.clone()).collect())
            .unwrap_or_default()
    }

    /// Task ids currently waiting in any category.
    pub async fn waiting_task_ids(&self) -> HashSet<Uuid> {
        let state = self.state.lock().await;
        state
            .categories
            .values()
            .flat_map(|q| q.waiting.iter().map(|w| w.spec.task_id))
            .collect()
    }

    /// Whether `token` belongs to the owner's current activation.
    pub async fn is_current_token(&self, owner: &Owner, token: ActiveToken) -> bool {
        let state = self.state.lock().await;
        state.is_active(owner)
            && state
                .runs
                .get(owner)
                .is_some_and(|r| r.active_token == Some(token))
    }

    /// Retained events, oldest first.
    pub async fn events(&self) -> Vec<SequencedEvent> {
        self.state.lock().await.events.entries.iter().cloned().collect()
    }

    /// Subscribe to live events.
    pub fn subscribe(&self) -> broadcast::Receiver<SequencedEvent> {
        self.tx.subscribe()
    }

    /// Retained history plus a live receiver, with no gap or overlap between them.
    pub async fn subscribe_with_history(
        &self,
    ) -> (Vec<SequencedEvent>, broadcast::Receiver<SequencedEvent>) {
        let state = self.state.lock().await;
        let history = state.events.entries.iter().cloned().collect();
        (history, self.tx.subscribe())
    }
}
