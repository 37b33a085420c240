//! Ollama Chat API with tool calling support
//!
//! This module provides a client for Ollama's `/api/chat` endpoint,
//! which supports tool/function calling and the optional `think` mode.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A message in a chat conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String, // "system", "user", "assistant", "tool"
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
}

impl ChatMessage {
    fn with_role(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
            thinking: None,
            tool_calls: None,
            tool_name: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role("assistant", content)
    }

    /// Assistant message that requested tools
    pub fn assistant_tool_calls(content: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: Some(calls),
            ..Self::with_role("assistant", content)
        }
    }

    pub fn tool(tool_name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_name: Some(tool_name.into()),
            ..Self::with_role("tool", content)
        }
    }
}

/// A tool call from the model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub function: FunctionCall,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            id: None,
            function: FunctionCall {
                name: name.into(),
                arguments,
            },
        }
    }
}

/// Function call details
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// Tool definition for the model
#[derive(Debug, Clone, Serialize)]
pub struct Tool {
    #[serde(rename = "type")]
    pub tool_type: String, // Always "function"
    pub function: ToolFunction,
}

impl Tool {
    pub fn function(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            tool_type: "function".to_string(),
            function: ToolFunction {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }
}

/// Function specification for a tool
#[derive(Debug, Clone, Serialize)]
pub struct ToolFunction {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value, // JSON Schema
}

/// Response from /api/chat
#[derive(Debug, Clone, Deserialize)]
pub struct ChatResponse {
    pub message: ChatMessage,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub eval_count: u32,
    #[serde(default)]
    pub eval_duration: u64,
}

/// Error type for chat operations
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Empty response from Ollama")]
    EmptyResponse,
    #[error("Ollama returned {status}: {body}")]
    Status { status: u16, body: String },
    /// The model does not support a requested feature (e.g. `think`)
    #[error("Capability rejected: {0}")]
    CapabilityRejected(String),
}

/// Per-request generation options
#[derive(Debug, Clone, Copy)]
pub struct ChatOptions {
    pub think: bool,
    pub num_predict: u32,
}

/// Client for Ollama's /api/chat endpoint with tool support
#[derive(Clone)]
pub struct ChatClient {
    base_url: String,
    client: reqwest::Client,
}

impl ChatClient {
    /// Create a new chat client
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }

    /// Send a chat request with optional tools
    ///
    /// A 4xx answer whose body mentions thinking is reported as
    /// [`ChatError::CapabilityRejected`] so callers can retry without `think`.
    pub async fn chat(
        &self,
        messages: &[ChatMessage],
        model: &str,
        tools: Option<&[Tool]>,
        options: ChatOptions,
    ) -> Result<ChatResponse, ChatError> {
        let endpoint = format!("{}/api/chat", self.base_url);

        let mut body = serde_json::json!({
            "model": model,
            "messages": messages,
            "stream": false,
            "options": {
                "temperature": 0.0,
                "num_predict": options.num_predict
            }
        });

        if let Some(t) = tools {
            body["tools"] = serde_json::to_value(t)?;
        }
        if options.think {
            body["think"] = serde_json::Value::Bool(true);
        }

        let response = self.client.post(&endpoint).json(&body).send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            if status.is_client_error() && is_capability_rejection(&text) {
                return Err(ChatError::CapabilityRejected(text));
            }
            return Err(ChatError::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        if text.is_empty() {
            return Err(ChatError::EmptyResponse);
        }

        let chat_response: ChatResponse = serde_json::from_str(&text)?;
        Ok(chat_response)
    }
}

fn is_capability_rejection(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    lower.contains("does not support thinking") || lower.contains("thinking")
}

/// Try to parse tool calls from the response content text
///
/// This handles models that output tool calls as JSON in the text
/// (bare, fenced in ```json blocks, or as an array) instead of using the
/// native tool_calls field.
pub fn parse_tool_calls_from_text(content: &str) -> Vec<ToolCall> {
    let content = strip_code_fence(content.trim());

    if let Ok(serde_json::Value::Array(items)) = serde_json::from_str(content) {
        return items.iter().filter_map(parse_tool_call_from_value).collect();
    }

    if let Some(tool_call) = try_parse_tool_call(content) {
        return vec![tool_call];
    }

    let mut tool_calls = Vec::new();
    let mut depth = 0usize;
    let mut start = None;

    for (i, c) in content.char_indices() {
        match c {
            '{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    if let Some(s) = start.take() {
                        if let Some(tool_call) = try_parse_tool_call(&content[s..=i]) {
                            tool_calls.push(tool_call);
                        }
                    }
                }
            }
            _ => {}
        }
    }

    tool_calls
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.trim_end().strip_suffix("```").unwrap_or(rest).trim()
}

/// Try to parse a single tool call from a JSON string
fn try_parse_tool_call(json_str: &str) -> Option<ToolCall> {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(json_str) {
        return parse_tool_call_from_value(&value);
    }

    // Models often leave quotes unescaped inside python source
    let fixed = try_fix_malformed_json(json_str)?;
    let value = serde_json::from_str::<serde_json::Value>(&fixed).ok()?;
    parse_tool_call_from_value(&value)
}

/// Escape bare double quotes inside a `"code": "..."` value
fn try_fix_malformed_json(json_str: &str) -> Option<String> {
    let code_marker = "\"code\": \"";
    let code_start = json_str.find(code_marker)?;
    let code_value_start = code_start + code_marker.len();

    let remaining = &json_str[code_value_start..];
    let end_pattern = remaining.rfind("\"}}")?;
    let code_content = &remaining[..end_pattern];

    let escaped_code = code_content
        .replace("\\\"", "\u{FFFF}")
        .replace('"', "\\\"")
        .replace('\u{FFFF}', "\\\"");

    let prefix = &json_str[..code_value_start];
    let suffix = &json_str[code_value_start + end_pattern..];

    Some(format!("{}{}{}", prefix, escaped_code, suffix))
}

/// Parse a tool call from a JSON Value
///
/// Accepts `{"name", "arguments"}`, `{"name", "parameters"}` and
/// `{"function": {"name", "arguments"}}`.
fn parse_tool_call_from_value(value: &serde_json::Value) -> Option<ToolCall> {
    if let Some(function) = value.get("function").filter(|f| f.is_object()) {
        return parse_tool_call_from_value(function);
    }

    let name = value.get("name").and_then(|n| n.as_str())?;
    let arguments = value
        .get("arguments")
        .or_else(|| value.get("parameters"))
        .cloned()
        .unwrap_or_else(|| serde_json::json!({}));

    Some(ToolCall::new(name, normalize_arguments(arguments)))
}

/// Some backends send arguments as a JSON-encoded string
pub fn normalize_arguments(arguments: serde_json::Value) -> serde_json::Value {
    match arguments {
        serde_json::Value::String(s) => match serde_json::from_str(&s) {
            Ok(v @ serde_json::Value::Object(_)) => v,
            _ => serde_json::Value::String(s),
        },
        serde_json::Value::Null => serde_json::json!({}),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bare_tool_call() {
        let calls =
            parse_tool_calls_from_text(r#"{"name": "duck_search", "arguments": {"query": "rust"}}"#);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].function.name, "duck_search");
        assert_eq!(calls[0].function.arguments["query"], "rust");
    }

    #[test]
    fn test_parse_fenced_array() {
        let text = "```json\n[{\"name\": \"fetch_url\", \"arguments\": {\"url\": \"https://a\"}}, {\"function\": {\"name\": \"duck_search\", \"arguments\": {\"query\": \"b\"}}}]\n```";
        let calls = parse_tool_calls_from_text(text);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].function.name, "fetch_url");
        assert_eq!(calls[1].function.name, "duck_search");
    }

    #[test]
    fn test_parse_embedded_in_prose() {
        let text = r#"I'll look that up. {"name": "duck_search", "parameters": {"query": "tor"}} then report."#;
        let calls = parse_tool_calls_from_text(text);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].function.arguments["query"], "tor");
    }

    #[test]
    fn test_parse_unescaped_code_quotes() {
        let text = r#"{"name": "python_exec", "arguments": {"code": "print("hi")"}}"#;
        let calls = parse_tool_calls_from_text(text);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].function.arguments["code"], "print(\"hi\")");
    }

    #[test]
    fn test_plain_text_has_no_calls() {
        assert!(parse_tool_calls_from_text("The answer is 42.").is_empty());
        assert!(parse_tool_calls_from_text("unbalanced } brace {").is_empty());
    }

    #[test]
    fn test_normalize_string_arguments() {
        let args = normalize_arguments(serde_json::json!("{\"query\": \"x\"}"));
        assert_eq!(args["query"], "x");
        assert_eq!(normalize_arguments(serde_json::Value::Null), serde_json::json!({}));
    }

    #[test]
    fn test_message_serialization_skips_empty_fields() {
        let json = serde_json::to_value(ChatMessage::user("hi")).unwrap();
        assert!(json.get("tool_calls").is_none());
        assert!(json.get("thinking").is_none());

        let json = serde_json::to_value(ChatMessage::tool("duck_search", "{}")).unwrap();
        assert_eq!(json["tool_name"], "duck_search");
    }

    #[test]
    fn test_capability_rejection_detection() {
        assert!(is_capability_rejection(
            r#"{"error":"\"qwen2\" does not support thinking"}"#
        ));
        assert!(!is_capability_rejection(r#"{"error":"model not found"}"#));
    }
}
