//! Reputation scoring.
//!
//! `score = min(1000, 10 * confirmed_activities + 5 * success_rate + min(200, 2 * total_requests))`
//!
//! Every term is non-decreasing in its input, so the score is monotone.

use crate::engine::Engine;
use crate::error::EngineResult;
use chrono::Utc;
use concord_types::Agent;

pub const MAX_SCORE: u32 = 1000;
const ACTIVITY_POINTS: f64 = 10.0;
const SUCCESS_POINTS: f64 = 5.0;
const REQUEST_POINTS: f64 = 2.0;
const REQUEST_CAP: f64 = 200.0;

/// Inputs to the reputation formula.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReputationInputs {
    pub confirmed_activities: u64,
    /// Percentage; clamped to [0, 100]. NaN counts as 0.
    pub success_rate: f64,
    pub total_requests: u64,
}

impl ReputationInputs {
    pub fn for_agent(agent: &Agent, confirmed_activities: u64) -> Self {
        Self {
            confirmed_activities,
            success_rate: agent.success_rate,
            total_requests: agent.total_requests,
        }
    }
}

/// Score in [0, 1000], floored to an integer.
pub fn compute_score(inputs: ReputationInputs) -> u32 {
    let success_rate = if inputs.success_rate.is_nan() {
        0.0
    } else {
        inputs.success_rate.clamp(0.0, 100.0)
    };
    let activity = inputs.confirmed_activities as f64 * ACTIVITY_POINTS;
    let success = success_rate * SUCCESS_POINTS;
    let volume = (inputs.total_requests as f64 * REQUEST_POINTS).min(REQUEST_CAP);
    (activity + success + volume).min(MAX_SCORE as f64).floor() as u32
}

impl Engine {
    /// Current score of `agent`, computed from its confirmed activity.
    pub async fn score_agent(&self, agent: &Agent) -> EngineResult<u32> {
        let confirmed = self
            .io(
                "count_confirmed_activities",
                self.store.count_confirmed_activities(&agent.agent_id),
            )
            .await?;
        Ok(compute_score(ReputationInputs::for_agent(agent, confirmed)))
    }

    /// Recompute and persist the agent's reputation snapshot.
    pub async fn refresh_reputation(&self, agent: &Agent) -> EngineResult<u32> {
        let score = self.score_agent(agent).await?;
        self.io(
            "set_reputation",
            self.store.set_reputation(&agent.agent_id, score, Utc::now()),
        )
        .await?;
        tracing::debug!(agent_id = %agent.agent_id, score, "Reputation refreshed");
        Ok(score)
    }
}
