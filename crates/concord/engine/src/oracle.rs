//! Decision oracle.
//!
//! Agent runners ask an external model whether to respond to a message or
//! how to vote on a proposal. The reply must parse into [`Decision`];
//! anything else is an [`OracleError`] and the runner does nothing.

use crate::config::OracleConfig;
use crate::error::OracleError;
use async_trait::async_trait;
use concord_types::{AgentId, VoteChoice};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    MessageResponse,
    ProposalVote,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OracleRequest {
    pub kind: DecisionKind,
    pub system_prompt: String,
    pub user_prompt: String,
}

/// Strict oracle result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub should_act: bool,
    #[serde(default)]
    pub payload: Value,
    pub reasoning: String,
}

impl Decision {
    /// Decode the payload. Only meaningful when `should_act` is true.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, OracleError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| OracleError::InvalidPayload(e.to_string()))
    }
}

/// Payload of an affirmative message-response decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponsePayload {
    pub recipient_ids: Vec<AgentId>,
    #[serde(default = "default_response_type")]
    pub message_type: String,
    pub content: Value,
}

fn default_response_type() -> String {
    "response".to_string()
}

/// Payload of an affirmative vote decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VotePayload {
    pub vote: VoteChoice,
}

/// Raw text completion backend.
#[async_trait]
pub trait DecisionOracle: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, request: &OracleRequest) -> Result<String, OracleError>;
}

/// Complete `request` under `timeout` and parse the reply strictly.
pub async fn decide(
    oracle: &dyn DecisionOracle,
    request: &OracleRequest,
    timeout: Duration,
) -> Result<Decision, OracleError> {
    let raw = tokio::time::timeout(timeout, oracle.complete(request))
        .await
        .map_err(|_| OracleError::Timeout(timeout))??;
    parse_decision(&raw)
}

/// The whole reply as JSON, else the first JSON object embedded in it.
pub fn parse_decision(raw: &str) -> Result<Decision, OracleError> {
    let trimmed = raw.trim();
    if let Ok(decision) = serde_json::from_str::<Decision>(trimmed) {
        return Ok(decision);
    }
    let candidate = extract_first_json_object(trimmed)
        .ok_or_else(|| OracleError::Parse("no JSON object in reply".to_string()))?;
    serde_json::from_str::<Decision>(&candidate).map_err(|e| OracleError::Parse(e.to_string()))
}

fn extract_first_json_object(raw: &str) -> Option<String> {
    let start = raw.find('{')?;
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;

    for (idx, ch) in raw[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(raw[start..start + idx + 1].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

/// Offline oracle with scripted replies per decision kind. Unscripted
/// requests get a "do nothing" decision.
#[derive(Default)]
pub struct StaticOracle {
    replies: Mutex<HashMap<DecisionKind, VecDeque<String>>>,
    calls: AtomicUsize,
}

impl StaticOracle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a raw reply for the next request of `kind`.
    pub fn script(self, kind: DecisionKind, raw: impl Into<String>) -> Self {
        if let Ok(mut replies) = self.replies.lock() {
            replies.entry(kind).or_default().push_back(raw.into());
        }
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DecisionOracle for StaticOracle {
    fn name(&self) -> &str {
        "static"
    }

    async fn complete(&self, request: &OracleRequest) -> Result<String, OracleError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut replies = self
            .replies
            .lock()
            .map_err(|_| OracleError::Unavailable("static oracle lock poisoned".to_string()))?;
        Ok(replies
            .get_mut(&request.kind)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| {
                json!({
                    "should_act": false,
                    "payload": null,
                    "reasoning": "no scripted reply"
                })
                .to_string()
            }))
    }
}

/// OpenAI-compatible chat completions backend.
pub struct OpenAiCompatibleOracle {
    client: Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiCompatibleOracle {
    pub fn new(
        endpoint: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
        temperature: f32,
        max_tokens: u32,
        timeout: Duration,
    ) -> Result<Self, OracleError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| OracleError::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            model: model.into(),
            api_key,
            temperature,
            max_tokens,
        })
    }
}

#[async_trait]
impl DecisionOracle for OpenAiCompatibleOracle {
    fn name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &OracleRequest) -> Result<String, OracleError> {
        let payload = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": request.system_prompt },
                { "role": "user", "content": request.user_prompt },
            ],
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
        });

        let mut builder = self.client.post(&self.endpoint).json(&payload);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| OracleError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(OracleError::Http {
                status,
                body: body.chars().take(320).collect(),
            });
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| OracleError::Parse(format!("invalid completion response: {e}")))?;
        body.choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| OracleError::Parse("completion had no content".to_string()))
    }
}

/// Build the oracle named by `config`.
pub fn from_config(config: &OracleConfig) -> Result<Box<dyn DecisionOracle>, OracleError> {
    match config {
        OracleConfig::Static => Ok(Box::new(StaticOracle::new())),
        OracleConfig::OpenaiCompatible {
            endpoint,
            model,
            api_key_env,
            temperature,
            max_tokens,
            timeout_secs,
        } => {
            let api_key = std::env::var(api_key_env).ok();
            if api_key.is_none() {
                tracing::warn!(env = %api_key_env, "Oracle API key not set; sending unauthenticated requests");
            }
            Ok(Box::new(OpenAiCompatibleOracle::new(
                endpoint.clone(),
                model.clone(),
                api_key,
                *temperature,
                *max_tokens,
                Duration::from_secs(*timeout_secs),
            )?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_json() {
        let d = parse_decision(r#"{"should_act": true, "payload": {"vote": "approve"}, "reasoning": "ok"}"#)
            .unwrap();
        assert!(d.should_act);
        assert_eq!(
            d.payload_as::<VotePayload>().unwrap().vote,
            VoteChoice::Approve
        );
    }

    #[test]
    fn extracts_object_from_chatter() {
        let raw = "Sure! Here you go:\n```json\n{\"should_act\": false, \"reasoning\": \"not my area {really}\"}\n```";
        let d = parse_decision(raw).unwrap();
        assert!(!d.should_act);
        assert_eq!(d.reasoning, "not my area {really}");
        assert!(d.payload.is_null());
    }

    #[test]
    fn partial_objects_are_errors_not_guesses() {
        assert!(matches!(
            parse_decision(r#"{"should_act": true}"#),
            Err(OracleError::Parse(_))
        ));
        assert!(matches!(parse_decision("yes, approve"), Err(OracleError::Parse(_))));
        assert!(matches!(
            parse_decision(r#"{"should_act": "yes", "reasoning": "x"}"#),
            Err(OracleError::Parse(_))
        ));
    }

    #[test]
    fn bad_payload_is_reported() {
        let d = parse_decision(r#"{"should_act": true, "payload": {"vote": "maybe"}, "reasoning": "x"}"#)
            .unwrap();
        assert!(matches!(
            d.payload_as::<VotePayload>(),
            Err(OracleError::InvalidPayload(_))
        ));
    }

    #[tokio::test]
    async fn static_oracle_replays_script_then_declines() {
        let oracle = StaticOracle::new().script(
            DecisionKind::ProposalVote,
            r#"{"should_act": true, "payload": {"vote": "reject"}, "reasoning": "too costly"}"#,
        );
        let request = OracleRequest {
            kind: DecisionKind::ProposalVote,
            system_prompt: String::new(),
            user_prompt: String::new(),
        };

        let first = decide(&oracle, &request, Duration::from_secs(1)).await.unwrap();
        assert!(first.should_act);
        let second = decide(&oracle, &request, Duration::from_secs(1)).await.unwrap();
        assert!(!second.should_act);
        assert_eq!(oracle.calls(), 2);
    }

    struct Stalled;

    #[async_trait]
    impl DecisionOracle for Stalled {
        fn name(&self) -> &str {
            "stalled"
        }

        async fn complete(&self, _request: &OracleRequest) -> Result<String, OracleError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(String::new())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_oracle_times_out() {
        let request = OracleRequest {
            kind: DecisionKind::MessageResponse,
            system_prompt: String::new(),
            user_prompt: String::new(),
        };
        let err = decide(&Stalled, &request, Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(matches!(err, OracleError::Timeout(_)));
    }
}
