//! Owner identity and task submissions.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::policy::QueuePolicy;

/// Coarse agent task kind; concurrency limits are partitioned by category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentCategory {
    Summary,
    Translation,
    Tagging,
}

impl AgentCategory {
    pub const ALL: [AgentCategory; 3] = [Self::Summary, Self::Translation, Self::Tagging];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Summary => "summary",
            Self::Translation => "translation",
            Self::Tagging => "tagging",
        }
    }
}

impl fmt::Display for AgentCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "summary" => Ok(Self::Summary),
            "translation" => Ok(Self::Translation),
            "tagging" => Ok(Self::Tagging),
            other => Err(format!("unknown agent category '{other}'")),
        }
    }
}

/// Identifier of the entity an agent task works on (an entry).
pub type EntityId = i64;

/// One logical unit of recurring work: (category, entity, variant slot).
///
/// Many task ids may be submitted for the same owner over time; the engine
/// keeps at most one of them active.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Owner {
    pub category: AgentCategory,
    pub entity_id: EntityId,
    /// Variant slot, e.g. the target language of a translation.
    pub slot: String,
}

impl Owner {
    pub fn new(category: AgentCategory, entity_id: EntityId, slot: impl Into<String>) -> Self {
        Self {
            category,
            entity_id,
            slot: slot.into(),
        }
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.category, self.entity_id, self.slot)
    }
}

/// Who asked for the work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestSource {
    Manual,
    Auto,
}

/// A single submission to the agent runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub task_id: Uuid,
    pub owner: Owner,
    pub source: RequestSource,
    /// Overrides the category policy for this admission decision only.
    pub policy: Option<QueuePolicy>,
}

impl TaskSpec {
    pub fn new(owner: Owner, source: RequestSource) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            owner,
            source,
            policy: None,
        }
    }

    pub fn with_policy(mut self, policy: QueuePolicy) -> Self {
        self.policy = Some(policy);
        self
    }
}
