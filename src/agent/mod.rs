//! Conversational agent: model abstraction, tool loop and session storage
//!
//! # Architecture
//!
//! ```text
//! user text → AgentLoop ──ChatRequest──▶ ModelBackend (Ollama /api/chat)
//!                 │  ◀──ModelReply──────
//!                 │
//!                 ├─ tool calls ─▶ ToolExecutor ─▶ web / files / sandbox
//!                 │                   ▲
//!                 │                   └── ProxyControl (Tor readiness gate)
//!                 │
//!                 └─ end of turn ─▶ SessionStore::append_turns
//! ```

pub mod controller;
pub mod model;
pub mod sessions;

pub use controller::{system_prompt, AgentEvent, AgentLoop, TurnOutcome};
pub use model::{ChatRequest, ModelAttempt, ModelBackend, ModelReply};
pub use sessions::{Role, Session, SessionMeta, SessionStore, Turn};
