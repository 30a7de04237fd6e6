//! Configuration types.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use crate::agent::engine::DEFAULT_EVENT_LOG_CAPACITY;
use crate::agent::{AgentCategory, QueuePolicy, ReplacementPolicy};
use crate::error::ConfigError;

/// Prefix of every environment override.
const ENV_PREFIX: &str = "READER_";

/// Runtime configuration.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    pub queue: QueueConfig,
    pub agent: AgentConfig,
}

/// Execution queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Global ceiling on running jobs.
    pub max_concurrent_jobs: usize,
    /// Per-category ceiling for categories not listed in `category_limits`.
    pub default_category_limit: usize,
    pub category_limits: HashMap<String, usize>,
    /// How long a signalled job may take to unwind before it is dropped
    /// (`None` waits indefinitely).
    pub unwind_grace: Option<Duration>,
}

impl QueueConfig {
    /// Ceiling for a category.
    pub fn limit_for(&self, category: &str) -> usize {
        self.category_limits
            .get(category)
            .copied()
            .unwrap_or(self.default_category_limit)
            .max(1)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 4,
            default_category_limit: 2,
            category_limits: HashMap::new(),
            unwind_grace: None,
        }
    }
}

/// Agent runtime configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub policies: HashMap<AgentCategory, QueuePolicy>,
    /// Execution timeout per category.
    pub timeouts: HashMap<AgentCategory, Duration>,
    /// Events retained in the engine's in-memory log.
    pub event_log_capacity: usize,
}

impl AgentConfig {
    pub fn timeout_for(&self, category: AgentCategory) -> Option<Duration> {
        self.timeouts.get(&category).copied()
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            policies: HashMap::from([
                (AgentCategory::Summary, QueuePolicy::latest_only(1, 2)),
                (AgentCategory::Translation, QueuePolicy::latest_only(1, 1)),
                (AgentCategory::Tagging, QueuePolicy::reject_new(1, 2)),
            ]),
            timeouts: HashMap::from([
                (AgentCategory::Summary, Duration::from_secs(120)),
                (AgentCategory::Translation, Duration::from_secs(180)),
                (AgentCategory::Tagging, Duration::from_secs(60)),
            ]),
            event_log_capacity: DEFAULT_EVENT_LOG_CAPACITY,
        }
    }
}

impl RuntimeConfig {
    /// Defaults overridden by `READER_*` environment variables.
    pub fn from_env() -> crate::error::Result<Self> {
        Ok(Self::from_lookup(|key| std::env::var(key).ok())?)
    }

    /// Defaults overridden by whatever `lookup` returns for each `READER_*` key.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let env = EnvReader { lookup };

        if let Some(max) = env.parse::<usize>("MAX_CONCURRENT_JOBS")? {
            config.queue.max_concurrent_jobs = max;
        }
        if let Some(limit) = env.parse::<usize>("DEFAULT_CATEGORY_LIMIT")? {
            config.queue.default_category_limit = limit;
        }
        if let Some(secs) = env.parse::<u64>("UNWIND_GRACE_SECS")? {
            config.queue.unwind_grace = Some(Duration::from_secs(secs));
        }
        if let Some(capacity) = env.parse::<usize>("EVENT_LOG_CAPACITY")? {
            config.agent.event_log_capacity = capacity;
        }

        for category in AgentCategory::ALL {
            let prefix = category.as_str().to_ascii_uppercase();
            let mut policy = config
                .agent
                .policies
                .get(&category)
                .copied()
                .unwrap_or_default();

            if let Some(limit) = env.parse::<usize>(&format!("{prefix}_CONCURRENT_LIMIT"))? {
                policy.concurrent_limit = limit;
            }
            if let Some(capacity) = env.parse::<usize>(&format!("{prefix}_WAITING_CAPACITY"))? {
                policy.waiting_capacity = capacity;
            }
            if let Some(replacement) =
                env.parse::<ReplacementPolicy>(&format!("{prefix}_REPLACEMENT"))?
            {
                policy.replacement = replacement;
            }
            if let Some(secs) = env.parse::<u64>(&format!("{prefix}_MAX_WAIT_SECS"))? {
                policy.max_wait = Some(Duration::from_secs(secs));
            }
            if let Some(secs) = env.parse::<u64>(&format!("{prefix}_TIMEOUT_SECS"))? {
                config
                    .agent
                    .timeouts
                    .insert(category, Duration::from_secs(secs));
            }

            config.agent.policies.insert(category, policy);
            // Agent jobs run on the queue under their category name.
            config
                .queue
                .category_limits
                .entry(category.as_str().to_string())
                .or_insert(policy.concurrent_limit);
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject limits that would stall every job.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.max_concurrent_jobs == 0 {
            return Err(invalid("MAX_CONCURRENT_JOBS", "must be at least 1"));
        }
        if self.queue.default_category_limit == 0 {
            return Err(invalid("DEFAULT_CATEGORY_LIMIT", "must be at least 1"));
        }
        if let Some((category, _)) = self.queue.category_limits.iter().find(|(_, l)| **l == 0) {
            return Err(ConfigError::InvalidValue {
                key: format!("category limit for {category}"),
                message: "must be at least 1".to_string(),
            });
        }
        for category in AgentCategory::ALL {
            let policy = self
                .agent
                .policies
                .get(&category)
                .ok_or_else(|| ConfigError::MissingPolicy {
                    category: category.to_string(),
                })?;
            if policy.concurrent_limit == 0 {
                return Err(invalid(
                    &format!("{}_CONCURRENT_LIMIT", category.as_str().to_ascii_uppercase()),
                    "must be at least 1",
                ));
            }
        }
        Ok(())
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: format!("{ENV_PREFIX}{key}"),
        message: message.to_string(),
    }
}

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn parse<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let full_key = format!("{ENV_PREFIX}{key}");
        match (self.lookup)(&full_key) {
            None => Ok(None),
            Some(raw) if raw.trim().is_empty() => Ok(None),
            Some(raw) => raw
                .trim()
                .parse()
                .map(Some)
                .map_err(|e: T::Err| ConfigError::InvalidValue {
                    key: full_key,
                    message: e.to_string(),
                }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_validate() {
        let config = RuntimeConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.queue.max_concurrent_jobs, 4);
        assert_eq!(
            config.agent.policies[&AgentCategory::Translation],
            QueuePolicy::latest_only(1, 1)
        );
        assert_eq!(config.queue.limit_for("summary"), 1);
        assert_eq!(config.queue.limit_for("feed_refresh"), 2);
    }

    #[test]
    fn overrides_apply_per_category() {
        let config = RuntimeConfig::from_lookup(lookup(&[
            ("READER_MAX_CONCURRENT_JOBS", "8"),
            ("READER_SUMMARY_WAITING_CAPACITY", "1"),
            ("READER_TAGGING_REPLACEMENT", "latest_only"),
            ("READER_TRANSLATION_TIMEOUT_SECS", "30"),
            ("READER_SUMMARY_MAX_WAIT_SECS", "600"),
        ]))
        .unwrap();

        assert_eq!(config.queue.max_concurrent_jobs, 8);
        let summary = config.agent.policies[&AgentCategory::Summary];
        assert_eq!(summary.waiting_capacity, 1);
        assert_eq!(summary.max_wait, Some(Duration::from_secs(600)));
        assert_eq!(
            config.agent.policies[&AgentCategory::Tagging].replacement,
            ReplacementPolicy::LatestOnly
        );
        assert_eq!(
            config.agent.timeout_for(AgentCategory::Translation),
            Some(Duration::from_secs(30))
        );
    }

    #[test]
    fn bad_values_name_the_key() {
        let err = RuntimeConfig::from_lookup(lookup(&[("READER_SUMMARY_CONCURRENT_LIMIT", "two")]))
            .unwrap_err();
        match err {
            ConfigError::InvalidValue { key, .. } => {
                assert_eq!(key, "READER_SUMMARY_CONCURRENT_LIMIT")
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn zero_limits_are_rejected() {
        assert!(RuntimeConfig::from_lookup(lookup(&[("READER_MAX_CONCURRENT_JOBS", "0")])).is_err());
        assert!(
            RuntimeConfig::from_lookup(lookup(&[("READER_TRANSLATION_CONCURRENT_LIMIT", "0")]))
                .is_err()
        );
    }
}
