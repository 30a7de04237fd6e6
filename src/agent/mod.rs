//! Agent runtime: per-category admission of owner-scoped agent tasks.
//!
//! The [`AgentRuntimeEngine`] decides which owners may run, keeps their phase
//! and publishes [`RuntimeEvent`]s. The [`AgentTaskRunner`] runs admitted
//! owners as jobs on the execution queue.

pub mod engine;
pub mod events;
pub mod owner;
pub mod phase;
pub mod policy;
pub mod runner;

pub use engine::{AdmissionDecision, AgentRuntimeEngine, FinishOutcome, RunState};
pub use events::{ActiveToken, DropReason, RuntimeEvent, SequencedEvent};
pub use owner::{AgentCategory, EntityId, Owner, RequestSource, TaskSpec};
pub use phase::{AgentPhase, PhaseStep};
pub use policy::{QueuePolicy, ReplacementPolicy};
pub use runner::{AgentJob, AgentJobContext, AgentTaskRunner, terminal_phase};
