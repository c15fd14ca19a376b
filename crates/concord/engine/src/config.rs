//! Engine tunables.
//!
//! Every threshold the engine applies is a configuration value. The
//! defaults reproduce the behaviour agents already depend on; none of them
//! is a validated business rule.

use chrono::Duration;
use serde::{Deserialize, Serialize};

/// Routing, reputation and consensus parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Senders scoring below this are filtered.
    pub min_sender_reputation: u32,
    pub priority: PriorityBands,
    /// Upper bound on capability-matched targets.
    pub max_targets: usize,
    /// Targets chosen when no agent matches the required capabilities.
    pub fallback_targets: usize,
    pub min_voting_weight: u64,
    pub min_voter_reputation: u32,
    /// Approval percentage, 0..=100.
    pub consensus_threshold_percent: u8,
    pub voting_period_secs: u64,
    pub multiplier_divisor: f64,
    pub multiplier_min: f64,
    pub multiplier_max: f64,
    pub default_voting_power: u64,
    /// Parallel task inserts / invitation sends per item.
    pub dispatch_concurrency: usize,
    pub store_timeout_secs: u64,
    pub claim_ttl_secs: u64,
}

/// Reputation score bands for message priority.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityBands {
    pub high: u32,
    pub medium: u32,
    /// Scores strictly below this are low priority.
    pub low_below: u32,
    /// Minimum score for an urgent message to keep urgent priority.
    pub urgent_min: u32,
}

impl Default for PriorityBands {
    fn default() -> Self {
        Self {
            high: 800,
            medium: 650,
            low_below: 500,
            urgent_min: 600,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_sender_reputation: 400,
            priority: PriorityBands::default(),
            max_targets: 5,
            fallback_targets: 3,
            min_voting_weight: 50,
            min_voter_reputation: 400,
            consensus_threshold_percent: 60,
            voting_period_secs: 24 * 60 * 60,
            multiplier_divisor: 500.0,
            multiplier_min: 0.5,
            multiplier_max: 2.0,
            default_voting_power: 100,
            dispatch_concurrency: 8,
            store_timeout_secs: 5,
            claim_ttl_secs: 120,
        }
    }
}

impl EngineConfig {
    pub fn voting_period(&self) -> Duration {
        Duration::seconds(self.voting_period_secs as i64)
    }

    pub fn claim_ttl(&self) -> Duration {
        Duration::seconds(self.claim_ttl_secs as i64)
    }

    pub fn store_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.store_timeout_secs)
    }
}

/// Periodic sweep parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub stale_message_interval_secs: u64,
    /// Unprocessed items older than this are retried.
    pub stale_after_secs: u64,
    pub stale_batch: usize,
    pub reminder_interval_secs: u64,
    /// Rounds closing within this window get reminders.
    pub reminder_window_secs: u64,
    pub reminder_batch: usize,
    pub reputation_interval_secs: u64,
    pub reputation_batch: usize,
    pub retention_interval_secs: u64,
    pub retention_window_secs: u64,
    pub round_close_interval_secs: u64,
    pub round_close_batch: usize,
    /// Activity types never pruned.
    pub durable_activity_types: Vec<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            stale_message_interval_secs: 60,
            stale_after_secs: 300,
            stale_batch: 10,
            reminder_interval_secs: 3600,
            reminder_window_secs: 2 * 60 * 60,
            reminder_batch: 5,
            reputation_interval_secs: 300,
            reputation_batch: 20,
            retention_interval_secs: 24 * 60 * 60,
            retention_window_secs: 30 * 24 * 60 * 60,
            round_close_interval_secs: 60,
            round_close_batch: 50,
            durable_activity_types: vec!["escrow_created".to_string()],
        }
    }
}

impl SchedulerConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::seconds(self.stale_after_secs as i64)
    }

    pub fn reminder_window(&self) -> Duration {
        Duration::seconds(self.reminder_window_secs as i64)
    }

    pub fn retention_window(&self) -> Duration {
        Duration::seconds(self.retention_window_secs as i64)
    }
}

/// Which decision oracle backs the agent runners.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum OracleConfig {
    /// Canned replies; never acts unless scripted.
    #[default]
    Static,
    /// An OpenAI-compatible chat completions endpoint.
    OpenaiCompatible {
        endpoint: String,
        model: String,
        /// Environment variable holding the bearer token.
        #[serde(default = "default_api_key_env")]
        api_key_env: String,
        #[serde(default = "default_temperature")]
        temperature: f32,
        #[serde(default = "default_max_tokens")]
        max_tokens: u32,
        #[serde(default = "default_oracle_timeout")]
        timeout_secs: u64,
    },
}

fn default_api_key_env() -> String {
    "CONCORD_ORACLE_API_KEY".to_string()
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    500
}

fn default_oracle_timeout() -> u64 {
    30
}

/// Agent runner pool parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub enabled: bool,
    /// Concurrent oracle calls across all runners.
    pub max_concurrent_decisions: usize,
    pub oracle_timeout_secs: u64,
    pub memory_capacity: usize,
    pub context_messages: usize,
    pub context_votes: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_concurrent_decisions: 4,
            oracle_timeout_secs: 30,
            memory_capacity: 100,
            context_messages: 10,
            context_votes: 5,
        }
    }
}

impl RunnerConfig {
    pub fn oracle_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.oracle_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_keeps_defaults() {
        let cfg: EngineConfig = serde_json::from_value(serde_json::json!({
            "consensus_threshold_percent": 75,
            "priority": { "high": 900 }
        }))
        .unwrap();
        assert_eq!(cfg.consensus_threshold_percent, 75);
        assert_eq!(cfg.priority.high, 900);
        assert_eq!(cfg.priority.medium, 650);
        assert_eq!(cfg.min_sender_reputation, 400);
        assert_eq!(cfg.voting_period(), Duration::hours(24));
    }

    #[test]
    fn oracle_backend_tagging() {
        let cfg: OracleConfig = serde_json::from_value(serde_json::json!({
            "backend": "openai_compatible",
            "endpoint": "http://localhost:8080/v1/chat/completions",
            "model": "local"
        }))
        .unwrap();
        match cfg {
            OracleConfig::OpenaiCompatible {
                temperature,
                max_tokens,
                api_key_env,
                ..
            } => {
                assert_eq!(temperature, 0.7);
                assert_eq!(max_tokens, 500);
                assert_eq!(api_key_env, "CONCORD_ORACLE_API_KEY");
            }
            OracleConfig::Static => panic!("expected openai_compatible backend"),
        }
    }
}
