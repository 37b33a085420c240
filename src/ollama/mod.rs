//! Ollama LLM integration module
//!
//! Client for Ollama's `/api/chat` endpoint with tool calling, plus the
//! helpers that recover tool calls some models emit inline as text.

pub mod tool_use;

pub use tool_use::{
    normalize_arguments, parse_tool_calls_from_text, ChatClient, ChatError, ChatMessage,
    ChatOptions, ChatResponse, FunctionCall, Tool, ToolCall, ToolFunction,
};
