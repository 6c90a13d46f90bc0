//! Reasoning service clients.
//!
//! The driver only sees [`ReasoningClient`]: one request in, either free text or a
//! single tool call out. [`OpenAiCompatibleClient`] speaks the chat-completions wire
//! format (OpenAI and Ollama both accept it); [`ScriptedReasoningClient`] replays a
//! fixed list of replies for smoke runs and tests.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::Mutex;

use gradplan_core::config::{LlmConfig, LlmProvider};
use gradplan_core::domain::conversation::{ConversationMessage, MessageBody, Step};
use gradplan_core::domain::tool::ToolOutcome;

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Clone, Debug, PartialEq)]
pub struct ReasoningRequest {
    pub step: Step,
    pub system: String,
    pub transcript: Vec<ConversationMessage>,
    /// Tool catalog as rendered by the registry.
    pub tools: Vec<Value>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ReasoningReply {
    Text(String),
    ToolCall { name: String, arguments: Value },
}

#[derive(Debug, Error)]
pub enum ReasoningError {
    #[error("reasoning transport error: {0}")]
    Transport(String),
    #[error("reasoning service returned status {status}")]
    Status { status: u16 },
    #[error("reasoning response could not be decoded: {0}")]
    Decode(String),
    #[error("reasoning call timed out after {0:?}")]
    Timeout(Duration),
    #[error("reasoning client misconfigured: {0}")]
    Configuration(String),
}

#[async_trait]
pub trait ReasoningClient: Send + Sync {
    async fn complete(&self, request: &ReasoningRequest) -> Result<ReasoningReply, ReasoningError>;
}

pub struct OpenAiCompatibleClient {
    client: Client,
    endpoint: String,
    model: String,
    api_key: Option<SecretString>,
    timeout: Duration,
}

impl OpenAiCompatibleClient {
    pub fn from_config(config: &LlmConfig) -> Result<Self, ReasoningError> {
        let base_url = match (&config.base_url, config.provider) {
            (Some(url), _) => url.clone(),
            (None, LlmProvider::OpenAi) => OPENAI_BASE_URL.to_string(),
            (None, LlmProvider::Ollama) => {
                return Err(ReasoningError::Configuration(
                    "llm.base_url is required for the ollama provider".to_string(),
                ))
            }
        };

        let timeout = Duration::from_secs(config.timeout_secs);
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| ReasoningError::Configuration(error.to_string()))?;

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
            timeout,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn request_body(&self, request: &ReasoningRequest) -> Value {
        let mut messages = vec![json!({ "role": "system", "content": request.system })];
        messages.extend(request.transcript.iter().map(chat_message));

        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|tool| json!({ "type": "function", "function": tool }))
            .collect();

        let mut body = json!({ "model": self.model, "messages": messages });
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools);
        }
        body
    }
}

fn chat_message(message: &ConversationMessage) -> Value {
    match &message.body {
        MessageBody::User { text } => json!({ "role": "user", "content": text }),
        MessageBody::Assistant { text } => json!({ "role": "assistant", "content": text }),
        MessageBody::ToolCall { call } => json!({
            "role": "assistant",
            "content": Value::Null,
            "tool_calls": [{
                "id": call.id.0,
                "type": "function",
                "function": { "name": call.name, "arguments": call.arguments.to_string() },
            }],
        }),
        MessageBody::ToolResult { result } => {
            let content = match &result.outcome {
                ToolOutcome::Output(output) => output.to_string(),
                ToolOutcome::Error(message) => json!({ "error": message }).to_string(),
            };
            json!({ "role": "tool", "tool_call_id": result.call_id.0, "content": content })
        }
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ChatToolCall>,
}

#[derive(Deserialize)]
struct ChatToolCall {
    function: ChatFunction,
}

#[derive(Deserialize)]
struct ChatFunction {
    name: String,
    arguments: String,
}

fn reply_from_response(response: ChatResponse) -> Result<ReasoningReply, ReasoningError> {
    let message = response
        .choices
        .into_iter()
        .next()
        .map(|choice| choice.message)
        .ok_or_else(|| ReasoningError::Decode("response has no choices".to_string()))?;

    if let Some(call) = message.tool_calls.into_iter().next() {
        // Unparseable arguments go through as a string; the registry rejects them.
        let arguments = serde_json::from_str(&call.function.arguments)
            .unwrap_or(Value::String(call.function.arguments));
        return Ok(ReasoningReply::ToolCall { name: call.function.name, arguments });
    }

    match message.content {
        Some(text) if !text.trim().is_empty() => Ok(ReasoningReply::Text(text)),
        _ => Err(ReasoningError::Decode("response has no content and no tool call".to_string())),
    }
}

#[async_trait]
impl ReasoningClient for OpenAiCompatibleClient {
    async fn complete(&self, request: &ReasoningRequest) -> Result<ReasoningReply, ReasoningError> {
        let mut builder = self.client.post(&self.endpoint).json(&self.request_body(request));
        if let Some(api_key) = &self.api_key {
            builder = builder.bearer_auth(api_key.expose_secret());
        }

        let response = builder.send().await.map_err(|error| {
            if error.is_timeout() {
                ReasoningError::Timeout(self.timeout)
            } else {
                ReasoningError::Transport(error.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ReasoningError::Status { status: status.as_u16() });
        }

        let parsed: ChatResponse =
            response.json().await.map_err(|error| ReasoningError::Decode(error.to_string()))?;
        reply_from_response(parsed)
    }
}

/// Replays queued replies in order and keeps every request it was sent.
#[derive(Default)]
pub struct ScriptedReasoningClient {
    replies: Mutex<VecDeque<Result<ReasoningReply, ReasoningError>>>,
    requests: Mutex<Vec<ReasoningRequest>>,
}

impl ScriptedReasoningClient {
    pub fn new(replies: impl IntoIterator<Item = ReasoningReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().map(Ok).collect()),
            requests: Mutex::default(),
        }
    }

    pub async fn push(&self, reply: ReasoningReply) {
        self.replies.lock().await.push_back(Ok(reply));
    }

    pub async fn push_error(&self, error: ReasoningError) {
        self.replies.lock().await.push_back(Err(error));
    }

    pub async fn remaining(&self) -> usize {
        self.replies.lock().await.len()
    }

    pub async fn requests(&self) -> Vec<ReasoningRequest> {
        self.requests.lock().await.clone()
    }
}

#[async_trait]
impl ReasoningClient for ScriptedReasoningClient {
    async fn complete(&self, request: &ReasoningRequest) -> Result<ReasoningReply, ReasoningError> {
        self.requests.lock().await.push(request.clone());
        self.replies
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Err(ReasoningError::Transport("script exhausted".to_string())))
    }
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;
    use serde_json::{json, Value};

    use gradplan_core::config::{LlmConfig, LlmProvider};
    use gradplan_core::domain::conversation::{ConversationMessage, Step};
    use gradplan_core::domain::tool::{ToolCall, ToolCallId, ToolOutcome, ToolResult};

    use super::{
        reply_from_response, ChatResponse, OpenAiCompatibleClient, ReasoningClient,
        ReasoningError, ReasoningReply, ReasoningRequest, ScriptedReasoningClient,
    };

    fn config(provider: LlmProvider, base_url: Option<&str>) -> LlmConfig {
        LlmConfig {
            provider,
            api_key: Some(SecretString::from("sk-test".to_string())),
            base_url: base_url.map(str::to_string),
            model: "gpt-test".to_string(),
            timeout_secs: 5,
        }
    }

    fn request(transcript: Vec<ConversationMessage>) -> ReasoningRequest {
        ReasoningRequest {
            step: Step::ProfileCheck,
            system: "review the profile".to_string(),
            transcript,
            tools: vec![json!({"name": "get_student_profile", "parameters": {}})],
        }
    }

    #[test]
    fn endpoint_defaults_per_provider() {
        let openai = OpenAiCompatibleClient::from_config(&config(LlmProvider::OpenAi, None))
            .expect("openai client");
        assert_eq!(openai.endpoint(), "https://api.openai.com/v1/chat/completions");

        let ollama = OpenAiCompatibleClient::from_config(&config(
            LlmProvider::Ollama,
            Some("http://localhost:11434/v1/"),
        ))
        .expect("ollama client");
        assert_eq!(ollama.endpoint(), "http://localhost:11434/v1/chat/completions");

        assert!(matches!(
            OpenAiCompatibleClient::from_config(&config(LlmProvider::Ollama, None)),
            Err(ReasoningError::Configuration(_))
        ));
    }

    #[test]
    fn request_body_pairs_tool_calls_with_results() {
        let client = OpenAiCompatibleClient::from_config(&config(LlmProvider::OpenAi, None))
            .expect("client");
        let call_id = ToolCallId("call-1".to_string());
        let transcript = vec![
            ConversationMessage::user(Step::ProfileCheck, "plan my degree"),
            ConversationMessage::tool_call(
                Step::ProfileCheck,
                ToolCall {
                    id: call_id.clone(),
                    name: "get_student_profile".to_string(),
                    arguments: json!({}),
                },
            ),
            ConversationMessage::tool_result(
                Step::ProfileCheck,
                ToolResult {
                    call_id,
                    name: "get_student_profile".to_string(),
                    outcome: ToolOutcome::Error("profile missing".to_string()),
                },
            ),
        ];

        let body = client.request_body(&request(transcript));
        let messages = body["messages"].as_array().expect("messages");

        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[2]["tool_calls"][0]["id"], "call-1");
        assert_eq!(messages[2]["tool_calls"][0]["function"]["arguments"], "{}");
        assert_eq!(messages[3]["role"], "tool");
        assert_eq!(messages[3]["tool_call_id"], "call-1");
        assert_eq!(body["tools"][0]["type"], "function");
    }

    #[test]
    fn response_prefers_tool_call_over_text() {
        let response: ChatResponse = serde_json::from_value(json!({
            "choices": [{
                "message": {
                    "content": "calling a tool",
                    "tool_calls": [{
                        "id": "provider-id",
                        "type": "function",
                        "function": {"name": "list_programs", "arguments": "{\"kind\":\"major\"}"}
                    }]
                }
            }]
        }))
        .expect("decode");

        assert_eq!(
            reply_from_response(response).expect("reply"),
            ReasoningReply::ToolCall {
                name: "list_programs".to_string(),
                arguments: json!({"kind": "major"}),
            }
        );
    }

    #[test]
    fn malformed_tool_arguments_pass_through_as_string() {
        let response: ChatResponse = serde_json::from_value(json!({
            "choices": [{"message": {"content": null, "tool_calls": [
                {"function": {"name": "list_programs", "arguments": "{kind:"}}
            ]}}]
        }))
        .expect("decode");

        match reply_from_response(response).expect("reply") {
            ReasoningReply::ToolCall { arguments, .. } => {
                assert_eq!(arguments, Value::String("{kind:".to_string()))
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[test]
    fn empty_response_is_a_decode_error() {
        let response: ChatResponse =
            serde_json::from_value(json!({"choices": [{"message": {"content": "  "}}]}))
                .expect("decode");
        assert!(matches!(reply_from_response(response), Err(ReasoningError::Decode(_))));

        let no_choices: ChatResponse =
            serde_json::from_value(json!({"choices": []})).expect("decode");
        assert!(matches!(reply_from_response(no_choices), Err(ReasoningError::Decode(_))));
    }

    #[tokio::test]
    async fn scripted_client_replays_then_reports_exhaustion() {
        let client = ScriptedReasoningClient::new([ReasoningReply::Text("hello".to_string())]);

        let first = client.complete(&request(Vec::new())).await.expect("first reply");
        assert_eq!(first, ReasoningReply::Text("hello".to_string()));

        let exhausted = client.complete(&request(Vec::new())).await;
        assert!(matches!(exhausted, Err(ReasoningError::Transport(_))));
        assert_eq!(client.requests().await.len(), 2);
        assert_eq!(client.remaining().await, 0);
    }
}
