//! Model backend abstraction
//!
//! The agent loop talks to the model through [`ModelBackend`]; the Ollama
//! [`ChatClient`] is the production implementation and tests plug in
//! scripted stubs.

use async_trait::async_trait;

use crate::error::ModelError;
use crate::ollama::{normalize_arguments, ChatClient, ChatError, ChatMessage, ChatOptions, Tool};
use crate::tools::ToolCallRequest;

/// One request to the model
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<Tool>,
    /// Ask for extended reasoning
    pub think: bool,
    pub num_predict: u32,
}

/// The model's answer: final text, tool calls, or both
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelReply {
    pub content: String,
    pub tool_calls: Vec<ToolCallRequest>,
    pub thinking: Option<String>,
}

impl ModelReply {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn calls(tool_calls: Vec<ToolCallRequest>) -> Self {
        Self {
            tool_calls,
            ..Self::default()
        }
    }
}

#[async_trait]
pub trait ModelBackend: Send + Sync {
    async fn chat(&self, request: &ChatRequest) -> Result<ModelReply, ModelError>;
}

/// Which request shape a model call uses
///
/// `Full → Reduced → Exhausted`: the reduced attempt drops `think`, and
/// a failure there ends the turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelAttempt {
    Full,
    Reduced,
    Exhausted,
}

impl ModelAttempt {
    pub fn next(self) -> Self {
        match self {
            ModelAttempt::Full => ModelAttempt::Reduced,
            ModelAttempt::Reduced | ModelAttempt::Exhausted => ModelAttempt::Exhausted,
        }
    }

    /// Whether this attempt requests extended reasoning
    pub fn think(self, think_enabled: bool) -> bool {
        think_enabled && self == ModelAttempt::Full
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ModelAttempt::Full => "full",
            ModelAttempt::Reduced => "reduced",
            ModelAttempt::Exhausted => "exhausted",
        }
    }
}

impl From<ChatError> for ModelError {
    fn from(e: ChatError) -> Self {
        match e {
            ChatError::CapabilityRejected(body) => ModelError::CapabilityRejected(body),
            ChatError::Parse(e) => ModelError::Malformed(e.to_string()),
            ChatError::EmptyResponse => ModelError::Malformed("empty response".to_string()),
            ChatError::Status { status, body } => {
                ModelError::Unavailable(format!("HTTP {}: {}", status, body.trim()))
            }
            ChatError::Request(e) => ModelError::Unavailable(e.to_string()),
        }
    }
}

/// Convert a backend message into a reply, assigning missing call ids
pub fn reply_from_message(message: ChatMessage) -> ModelReply {
    let tool_calls = message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|call| {
            ToolCallRequest::new(
                call.function.name,
                normalize_arguments(call.function.arguments),
                call.id
                    .filter(|id| !id.is_empty())
                    .unwrap_or_else(ToolCallRequest::generate_id),
            )
        })
        .collect();

    ModelReply {
        content: message.content,
        tool_calls,
        thinking: message.thinking.filter(|t| !t.is_empty()),
    }
}

#[async_trait]
impl ModelBackend for ChatClient {
    async fn chat(&self, request: &ChatRequest) -> Result<ModelReply, ModelError> {
        let tools = if request.tools.is_empty() {
            None
        } else {
            Some(request.tools.as_slice())
        };
        let options = ChatOptions {
            think: request.think,
            num_predict: request.num_predict,
        };
        let response = ChatClient::chat(self, &request.messages, &request.model, tools, options).await?;
        Ok(reply_from_message(response.message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ollama::ToolCall;
    use serde_json::json;

    #[test]
    fn test_attempt_transitions() {
        assert_eq!(ModelAttempt::Full.next(), ModelAttempt::Reduced);
        assert_eq!(ModelAttempt::Reduced.next(), ModelAttempt::Exhausted);
        assert!(ModelAttempt::Full.think(true));
        assert!(!ModelAttempt::Full.think(false));
        assert!(!ModelAttempt::Reduced.think(true));
    }

    #[test]
    fn test_reply_assigns_missing_ids() {
        let mut with_id = ToolCall::new("fetch_url", json!("{\"url\": \"https://a.b\"}"));
        with_id.id = Some("abc".into());
        let message = ChatMessage::assistant_tool_calls(
            "",
            vec![ToolCall::new("duck_search", json!({"query": "x"})), with_id],
        );

        let reply = reply_from_message(message);
        assert_eq!(reply.tool_calls.len(), 2);
        assert!(reply.tool_calls[0].call_id.starts_with("call_"));
        assert_eq!(reply.tool_calls[1].call_id, "abc");
        assert_eq!(reply.tool_calls[1].arguments["url"], "https://a.b");
    }

    #[test]
    fn test_chat_error_mapping() {
        let err: ModelError = ChatError::CapabilityRejected("does not support thinking".into()).into();
        assert!(matches!(err, ModelError::CapabilityRejected(_)));
        let err: ModelError = ChatError::EmptyResponse.into();
        assert!(matches!(err, ModelError::Malformed(_)));
        let err: ModelError = ChatError::Status {
            status: 500,
            body: "boom".into(),
        }
        .into();
        assert_eq!(err.to_string(), "model request failed: HTTP 500: boom");
    }
}
