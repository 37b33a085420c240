//! veilagent - local research agent with an embedded Tor supervisor
//!
//! A language model served by Ollama drives a closed set of tools (web
//! search and fetch, Tor-routed search and fetch, onion reachability, local
//! file reading and search, sandboxed Python) while sessions are persisted
//! as append-only transcripts.
//!
//! # Modules
//!
//! - `agent` - tool-calling loop, model abstraction, session store
//! - `tools` - tool registry, executor, web/file/sandbox backends
//! - `proxy` - Tor discovery, launch, bootstrap polling, relaunch, shutdown
//! - `ollama` - `/api/chat` client with tool calling
//! - `security` - seccomp and capability hardening for the sandbox (Linux)
//! - `config`, `error`, `metrics`, `tracing` - ambient stack
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use veilagent::{AgentLoop, Config, ProxySupervisor, SessionStore};
//!
//! let config = Config::from_env();
//! let store = Arc::new(SessionStore::open(&config.store_root)?);
//! let proxy = Arc::new(ProxySupervisor::new(config.proxy()));
//! // build a ToolExecutor and a ModelBackend, then:
//! // let agent = AgentLoop::new(config.agent(), model, tools, proxy, store);
//! ```

pub mod agent;
pub mod config;
pub mod error;
pub mod metrics;
pub mod ollama;
pub mod proxy;
#[cfg(target_os = "linux")]
pub mod security;
pub mod tools;
pub mod tracing;

// Re-export commonly used types at crate root for convenience
pub use agent::{AgentLoop, Session, SessionStore, Turn, TurnOutcome};
pub use config::Config;
pub use error::{AgentError, ErrorKind};
pub use proxy::{ProxyControl, ProxyProcessState, ProxyStatus, ProxySupervisor};
pub use tools::{ToolCallRequest, ToolExecutor, ToolResult};
