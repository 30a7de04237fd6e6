//! Ordered event stream of the agent runtime engine.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::owner::Owner;
use super::phase::AgentPhase;

/// Opaque value minted each time an owner becomes active.
///
/// Updates presenting an older token come from a superseded activation and
/// are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActiveToken(u64);

impl ActiveToken {
    pub(crate) fn from_generation(generation: u64) -> Self {
        Self(generation)
    }
}

impl fmt::Display for ActiveToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Why a task left the waiting queue without running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Evicted by a newer request under the latest-only policy.
    ReplacedByLatest,
    /// The UI navigated away from the entity.
    AbandonedByEntrySwitch,
    /// A newer request for the same waiting owner took its place.
    SupersededBySameOwner,
    /// Refused under the reject-new policy.
    WaitingQueueFull,
    /// Waited longer than the category's max wait.
    WaitExpired,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ReplacedByLatest => "replaced_by_latest",
            Self::AbandonedByEntrySwitch => "abandoned_by_entry_switch",
            Self::SupersededBySameOwner => "superseded_by_same_owner",
            Self::WaitingQueueFull => "waiting_queue_full",
            Self::WaitExpired => "wait_expired",
        };
        f.write_str(s)
    }
}

/// Events emitted by the engine, in coordination order.
///
/// `Queued` implies the owner is now `waiting`, `Activated` implies
/// `requesting`, and `Dropped` implies `cancelled` (except for
/// `SupersededBySameOwner`, where the owner keeps waiting under a new task id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuntimeEvent {
    Queued {
        task_id: Uuid,
        owner: Owner,
        position: usize,
    },
    /// The owner entered the active set in phase `requesting`, whether
    /// admitted directly or promoted from `waiting`. No `PhaseChanged`
    /// accompanies it.
    Activated {
        task_id: Uuid,
        owner: Owner,
        active_token: ActiveToken,
    },
    Dropped {
        task_id: Uuid,
        owner: Owner,
        reason: DropReason,
    },
    PhaseChanged {
        task_id: Uuid,
        owner: Owner,
        phase: AgentPhase,
    },
    ProgressUpdated {
        task_id: Uuid,
        owner: Owner,
        progress: f64,
    },
    Terminal {
        task_id: Uuid,
        owner: Owner,
        phase: AgentPhase,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Promoted {
        from: Owner,
        #[serde(skip_serializing_if = "Option::is_none")]
        to: Option<Owner>,
    },
}

impl RuntimeEvent {
    /// The owner the event is about (`from` for promotions).
    pub fn owner(&self) -> &Owner {
        match self {
            Self::Queued { owner, .. }
            | Self::Activated { owner, .. }
            | Self::Dropped { owner, .. }
            | Self::PhaseChanged { owner, .. }
            | Self::ProgressUpdated { owner, .. }
            | Self::Terminal { owner, .. } => owner,
            Self::Promoted { from, .. } => from,
        }
    }

    /// Event type name (matches the serde tag).
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Queued { .. } => "queued",
            Self::Activated { .. } => "activated",
            Self::Dropped { .. } => "dropped",
            Self::PhaseChanged { .. } => "phase_changed",
            Self::ProgressUpdated { .. } => "progress_updated",
            Self::Terminal { .. } => "terminal",
            Self::Promoted { .. } => "promoted",
        }
    }
}

/// An event stamped with its position in the engine's stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequencedEvent {
    pub seq: u64,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: RuntimeEvent,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentCategory;

    #[test]
    fn events_serialize_with_type_tag() {
        let event = RuntimeEvent::Dropped {
            task_id: Uuid::nil(),
            owner: Owner::new(AgentCategory::Summary, 3, "default"),
            reason: DropReason::ReplacedByLatest,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "dropped");
        assert_eq!(json["reason"], "replaced_by_latest");
        assert_eq!(json["owner"]["category"], "summary");
        assert_eq!(event.kind(), "dropped");
    }

    #[test]
    fn promoted_without_successor_omits_to() {
        let event = RuntimeEvent::Promoted {
            from: Owner::new(AgentCategory::Tagging, 1, ""),
            to: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert!(json.get("to").is_none());
    }

    #[test]
    fn promoted_is_attributed_to_the_finished_owner() {
        let from = Owner::new(AgentCategory::Summary, 1, "default");
        let to = Owner::new(AgentCategory::Summary, 2, "default");
        let event = RuntimeEvent::Promoted {
            from: from.clone(),
            to: Some(to),
        };
        assert_eq!(event.owner(), &from);

        let progress = RuntimeEvent::ProgressUpdated {
            task_id: Uuid::nil(),
            owner: from.clone(),
            progress: 0.25,
        };
        assert_eq!(progress.owner(), &from);
        assert_eq!(progress.kind(), "progress_updated");
    }

    #[test]
    fn drop_reason_display_matches_serde() {
        let json = serde_json::to_string(&DropReason::AbandonedByEntrySwitch).unwrap();
        assert_eq!(
            json,
            format!("\"{}\"", DropReason::AbandonedByEntrySwitch)
        );
    }
}
