//! Request handlers. Each one is a thin wrapper over an [`Engine`]
//! operation.
//!
//! [`Engine`]: concord_engine::Engine

use super::state::AppState;
use crate::error::{ApiError, ApiResult};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use concord_types::{
    Agent, AgentId, HealthReport, Message, MessageId, MessageOutcome, ProactiveReport, Proposal,
    ProposalId, ProposalOutcome, VoteChoice, VoteReceipt,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    #[serde(flatten)]
    pub report: HealthReport,
    pub version: String,
    pub uptime: String,
}

/// Store connectivity. Unhealthy answers 503 with the same body.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let report = state.engine.health_check().await;
    let status = if report.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(HealthResponse {
            report,
            version: state.version.clone(),
            uptime: state.uptime(),
        }),
    )
}

#[derive(Debug, Deserialize)]
pub struct RegisterAgentRequest {
    pub agent_id: String,
    pub name: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub voting_power: Option<u64>,
    pub success_rate: Option<f64>,
    pub total_requests: Option<u64>,
}

pub async fn register_agent(
    State(state): State<AppState>,
    Json(request): Json<RegisterAgentRequest>,
) -> ApiResult<(StatusCode, Json<Agent>)> {
    if request.agent_id.trim().is_empty() {
        return Err(ApiError::BadRequest("agent_id is required".to_string()));
    }
    let mut agent =
        Agent::new(request.agent_id, request.name).with_capabilities(request.capabilities);
    if let Some(power) = request.voting_power {
        agent = agent.with_voting_power(power);
    }
    let success_rate = request.success_rate.unwrap_or(agent.success_rate);
    let total_requests = request.total_requests.unwrap_or(agent.total_requests);
    agent = agent.with_history(success_rate, total_requests);

    let agent = state.engine.register_agent(agent).await?;
    Ok((StatusCode::CREATED, Json(agent)))
}

pub async fn get_agent(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Agent>> {
    Ok(Json(state.engine.get_agent(&AgentId::new(id)).await?))
}

#[derive(Debug, Deserialize)]
pub struct SubmitMessageRequest {
    pub message_id: Option<String>,
    pub sender_id: String,
    #[serde(default)]
    pub recipient_ids: Vec<AgentId>,
    pub message_type: String,
    #[serde(default)]
    pub content: serde_json::Value,
    #[serde(default)]
    pub requires_response: bool,
    pub response_deadline: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageAccepted {
    pub message_id: MessageId,
}

/// Store a message. Routing happens asynchronously via the change feed.
pub async fn submit_message(
    State(state): State<AppState>,
    Json(request): Json<SubmitMessageRequest>,
) -> ApiResult<(StatusCode, Json<MessageAccepted>)> {
    if request.message_type.trim().is_empty() {
        return Err(ApiError::BadRequest("message_type is required".to_string()));
    }
    let mut message = Message::new(request.sender_id, request.message_type, request.content)
        .with_recipients(request.recipient_ids);
    if let Some(id) = request.message_id {
        message = message.with_id(id);
    }
    if request.requires_response {
        message = message.requiring_response(request.response_deadline);
    }

    let message_id = state.engine.submit_message(message).await?;
    Ok((StatusCode::ACCEPTED, Json(MessageAccepted { message_id })))
}

pub async fn process_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<MessageOutcome>> {
    let outcome = state.engine.process_message(&MessageId::new(id)).await?;
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
pub struct SubmitProposalRequest {
    pub proposal_id: Option<String>,
    pub proposer_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub proposal_data: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProposalAccepted {
    pub proposal_id: ProposalId,
}

pub async fn submit_proposal(
    State(state): State<AppState>,
    Json(request): Json<SubmitProposalRequest>,
) -> ApiResult<(StatusCode, Json<ProposalAccepted>)> {
    if request.title.trim().is_empty() {
        return Err(ApiError::BadRequest("title is required".to_string()));
    }
    let mut proposal = Proposal::new(request.proposer_id, request.title)
        .with_description(request.description)
        .with_data(request.proposal_data);
    if let Some(id) = request.proposal_id {
        proposal = proposal.with_id(id);
    }

    let proposal_id = state.engine.submit_proposal(proposal).await?;
    Ok((StatusCode::ACCEPTED, Json(ProposalAccepted { proposal_id })))
}

pub async fn process_proposal(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ProposalOutcome>> {
    let outcome = state.engine.process_proposal(&ProposalId::new(id)).await?;
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
pub struct CastVoteRequest {
    pub agent_id: String,
    pub choice: VoteChoice,
    #[serde(default)]
    pub reasoning: String,
}

/// Rejected votes still answer 200; the receipt says why.
pub async fn cast_vote(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<CastVoteRequest>,
) -> ApiResult<Json<VoteReceipt>> {
    let receipt = state
        .engine
        .cast_vote(
            &AgentId::new(request.agent_id),
            &ProposalId::new(id),
            request.choice,
            request.reasoning,
        )
        .await?;
    Ok(Json(receipt))
}

pub async fn run_proactive(State(state): State<AppState>) -> Json<ProactiveReport> {
    Json(state.engine.run_proactive().await)
}
