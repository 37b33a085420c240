//! Runtime configuration
//!
//! All settings have defaults and can be overridden through `VEIL_*`
//! environment variables (and, in the binary, through CLI flags). Component
//! configs (`AgentConfig`, `ProxyConfig`, `SandboxConfig`, `ToolConfig`) are
//! derived from the top-level [`Config`] so each subsystem only sees what it
//! needs.

use std::path::PathBuf;
use std::time::Duration;

/// Default model tag requested from Ollama
pub const DEFAULT_MODEL: &str = "qwen3";

/// Default Ollama endpoint
pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

/// Top-level configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Model tag passed to the backend
    pub model: String,
    /// Ollama base URL
    pub ollama_url: String,
    /// Request the backend's extended reasoning mode
    pub think: bool,
    /// Timeout for a single model call
    pub model_timeout: Duration,
    /// Timeout for outbound HTTP made by tools
    pub http_timeout: Duration,
    /// Wall-clock bound for a single tool call
    pub tool_timeout: Duration,
    /// Maximum characters of tool output handed back to the model
    pub output_char_cap: usize,
    /// Maximum tool round-trips per user turn
    pub max_tool_rounds: usize,
    /// Character budget for the model context window
    pub context_char_budget: usize,
    /// Clip applied to tool turn content when building model context
    pub tool_context_chars: usize,
    /// Token generation limit passed to the backend
    pub num_predict: u32,
    /// User-Agent header for web tools
    pub user_agent: String,

    /// Launch the embedded proxy daemon
    pub proxy_enabled: bool,
    /// Explicit proxy binary path (skips discovery)
    pub proxy_binary: Option<PathBuf>,
    /// SOCKS port (0 = allocate)
    pub socks_port: u16,
    /// Control port (0 = allocate)
    pub control_port: u16,
    /// Daemon log level
    pub proxy_log_level: String,
    /// Bound on waiting for bootstrap
    pub proxy_ready_timeout: Duration,
    /// Relaunch attempts after a failure
    pub proxy_max_relaunches: u32,
    /// Base delay between relaunches (doubled each attempt)
    pub proxy_relaunch_backoff: Duration,

    /// Root of the session store
    pub store_root: PathBuf,

    /// Python interpreter used by the sandbox
    pub python_bin: String,
    /// Upper bound on sandbox execution time
    pub python_max_timeout: Duration,

    /// Directory that file tools are restricted to
    pub home_dir: PathBuf,

    /// OTLP collector endpoint (tracing export disabled when unset)
    pub otlp_endpoint: Option<String>,
    /// Emit JSON log lines instead of human-readable output
    pub log_json: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            ollama_url: DEFAULT_OLLAMA_URL.to_string(),
            think: true,
            model_timeout: Duration::from_secs(120),
            http_timeout: Duration::from_secs(45),
            tool_timeout: Duration::from_secs(60),
            output_char_cap: 90_000,
            max_tool_rounds: 8,
            context_char_budget: 120_000,
            tool_context_chars: 20_000,
            num_predict: 512,
            user_agent: format!("veilagent/{}", env!("CARGO_PKG_VERSION")),
            proxy_enabled: true,
            proxy_binary: None,
            socks_port: 0,
            control_port: 0,
            proxy_log_level: "notice".to_string(),
            proxy_ready_timeout: Duration::from_secs(90),
            proxy_max_relaunches: 2,
            proxy_relaunch_backoff: Duration::from_millis(500),
            store_root: PathBuf::from(".veilagent"),
            python_bin: "python3".to_string(),
            python_max_timeout: Duration::from_secs(60),
            home_dir: dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")),
            otlp_endpoint: None,
            log_json: false,
        }
    }
}

impl Config {
    /// Build a config from defaults overlaid with `VEIL_*` environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("VEIL_MODEL") {
            cfg.model = v;
        }
        if let Some(v) = get("VEIL_OLLAMA_URL") {
            cfg.ollama_url = v.trim_end_matches('/').to_string();
        }
        if let Some(v) = get("VEIL_THINK").and_then(|v| parse_bool(&v)) {
            cfg.think = v;
        }
        if let Some(v) = get("VEIL_MODEL_TIMEOUT").and_then(|v| v.parse().ok()) {
            cfg.model_timeout = Duration::from_secs(v);
        }
        if let Some(v) = get("VEIL_TIMEOUT").and_then(|v| v.parse().ok()) {
            cfg.http_timeout = Duration::from_secs(v);
        }
        if let Some(v) = get("VEIL_TOOL_TIMEOUT").and_then(|v| v.parse().ok()) {
            cfg.tool_timeout = Duration::from_secs(v);
        }
        if let Some(v) = get("VEIL_MAX_TOOL_CHARS").and_then(|v| v.parse().ok()) {
            cfg.output_char_cap = v;
        }
        if let Some(v) = get("VEIL_MAX_TOOL_ROUNDS").and_then(|v| v.parse().ok()) {
            cfg.max_tool_rounds = v;
        }
        if let Some(v) = get("VEIL_CONTEXT_CHARS").and_then(|v| v.parse().ok()) {
            cfg.context_char_budget = v;
        }
        if let Some(v) = get("VEIL_TOOL_CONTEXT_CHARS").and_then(|v| v.parse().ok()) {
            cfg.tool_context_chars = v;
        }
        if let Some(v) = get("VEIL_NUM_PREDICT").and_then(|v| v.parse().ok()) {
            cfg.num_predict = v;
        }
        if let Some(v) = get("VEIL_USER_AGENT") {
            cfg.user_agent = v;
        }
        if let Some(v) = get("VEIL_ENABLE_TOR").and_then(|v| parse_bool(&v)) {
            cfg.proxy_enabled = v;
        }
        if let Some(v) = get("VEIL_TOR_BIN") {
            cfg.proxy_binary = Some(PathBuf::from(v));
        }
        if let Some(v) = get("VEIL_TOR_SOCKS_PORT").and_then(|v| v.parse().ok()) {
            cfg.socks_port = v;
        }
        if let Some(v) = get("VEIL_TOR_CONTROL_PORT").and_then(|v| v.parse().ok()) {
            cfg.control_port = v;
        }
        if let Some(v) = get("VEIL_TOR_LOG_LEVEL") {
            cfg.proxy_log_level = v;
        }
        if let Some(v) = get("VEIL_TOR_READY_TIMEOUT").and_then(|v| v.parse().ok()) {
            cfg.proxy_ready_timeout = Duration::from_secs(v);
        }
        if let Some(v) = get("VEIL_TOR_MAX_RELAUNCHES").and_then(|v| v.parse().ok()) {
            cfg.proxy_max_relaunches = v;
        }
        if let Some(v) = get("VEIL_TOR_RELAUNCH_BACKOFF_MS").and_then(|v| v.parse().ok()) {
            cfg.proxy_relaunch_backoff = Duration::from_millis(v);
        }
        if let Some(v) = get("VEIL_STORE_ROOT") {
            cfg.store_root = PathBuf::from(v);
        }
        if let Some(v) = get("VEIL_PYTHON") {
            cfg.python_bin = v;
        }
        if let Some(v) = get("VEIL_PYTHON_MAX_TIMEOUT").and_then(|v| v.parse().ok()) {
            cfg.python_max_timeout = Duration::from_secs(v);
        }
        if let Some(v) = get("VEIL_HOME_DIR") {
            cfg.home_dir = PathBuf::from(v);
        }
        if let Some(v) = get("OTEL_EXPORTER_OTLP_ENDPOINT") {
            cfg.otlp_endpoint = Some(v);
        }
        if let Some(v) = get("VEIL_LOG_JSON").and_then(|v| parse_bool(&v)) {
            cfg.log_json = v;
        }
        cfg
    }

    /// Settings for the agent loop
    pub fn agent(&self) -> AgentConfig {
        AgentConfig {
            model: self.model.clone(),
            think: self.think,
            model_timeout: self.model_timeout,
            max_tool_rounds: self.max_tool_rounds,
            context_char_budget: self.context_char_budget,
            tool_context_chars: self.tool_context_chars,
            num_predict: self.num_predict,
            proxy_ready_timeout: self.proxy_ready_timeout,
        }
    }

    /// Settings for the proxy supervisor
    pub fn proxy(&self) -> ProxyConfig {
        ProxyConfig {
            enabled: self.proxy_enabled,
            binary_override: self.proxy_binary.clone(),
            socks_port: self.socks_port,
            control_port: self.control_port,
            log_level: self.proxy_log_level.clone(),
            ready_timeout: self.proxy_ready_timeout,
            max_relaunches: self.proxy_max_relaunches,
            relaunch_backoff: self.proxy_relaunch_backoff,
            poll_interval: Duration::from_millis(500),
            shutdown_grace: Duration::from_secs(5),
        }
    }

    /// Settings for the python sandbox
    pub fn sandbox(&self) -> SandboxConfig {
        SandboxConfig {
            python_bin: self.python_bin.clone(),
            max_timeout: self.python_max_timeout,
            ..SandboxConfig::default()
        }
    }

    /// Settings for the tool executor
    pub fn tools(&self) -> ToolConfig {
        ToolConfig {
            timeout: self.tool_timeout,
            output_char_cap: self.output_char_cap,
            http_timeout: self.http_timeout,
            user_agent: self.user_agent.clone(),
            home_dir: self.home_dir.clone(),
        }
    }
}

/// Configuration for the agent loop
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub model: String,
    pub think: bool,
    pub model_timeout: Duration,
    pub max_tool_rounds: usize,
    pub context_char_budget: usize,
    pub tool_context_chars: usize,
    pub num_predict: u32,
    /// Bound on waiting for the proxy before a proxy-routed tool call
    pub proxy_ready_timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Config::default().agent()
    }
}

/// Configuration for the proxy supervisor
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub enabled: bool,
    pub binary_override: Option<PathBuf>,
    pub socks_port: u16,
    pub control_port: u16,
    pub log_level: String,
    pub ready_timeout: Duration,
    pub max_relaunches: u32,
    pub relaunch_backoff: Duration,
    /// Interval between control-port bootstrap polls
    pub poll_interval: Duration,
    /// Time allowed for a graceful exit before the process is killed
    pub shutdown_grace: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Config::default().proxy()
    }
}

/// Configuration for sandboxed python execution
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub python_bin: String,
    /// Timeout used when the call does not specify one
    pub default_timeout: Duration,
    /// Hard upper bound regardless of the requested timeout
    pub max_timeout: Duration,
    /// Maximum accepted source length
    pub max_code_chars: usize,
    /// Address-space limit for the child, in bytes
    pub memory_limit: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            python_bin: "python3".to_string(),
            default_timeout: Duration::from_secs(5),
            max_timeout: Duration::from_secs(60),
            max_code_chars: 20_000,
            memory_limit: 512 * 1024 * 1024,
        }
    }
}

/// Configuration for tool execution
#[derive(Debug, Clone)]
pub struct ToolConfig {
    pub timeout: Duration,
    pub output_char_cap: usize,
    pub http_timeout: Duration,
    pub user_agent: String,
    pub home_dir: PathBuf,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Config::default().tools()
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.model, DEFAULT_MODEL);
        assert_eq!(cfg.output_char_cap, 90_000);
        assert_eq!(cfg.socks_port, 0);
        assert_eq!(cfg.proxy_max_relaunches, 2);
        assert!(cfg.proxy_enabled);
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("VEIL_MODEL", "llama3.2"),
            ("VEIL_ENABLE_TOR", "off"),
            ("VEIL_TOR_SOCKS_PORT", "9150"),
            ("VEIL_MAX_TOOL_CHARS", "1000"),
            ("VEIL_OLLAMA_URL", "http://gpu:11434/"),
            ("VEIL_TOR_BIN", "   "),
        ]
        .into_iter()
        .collect();
        let cfg = Config::from_lookup(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(cfg.model, "llama3.2");
        assert!(!cfg.proxy_enabled);
        assert_eq!(cfg.socks_port, 9150);
        assert_eq!(cfg.output_char_cap, 1000);
        assert_eq!(cfg.ollama_url, "http://gpu:11434");
        assert!(cfg.proxy_binary.is_none());
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let cfg = Config::from_lookup(|k| match k {
            "VEIL_MAX_TOOL_ROUNDS" => Some("many".to_string()),
            "VEIL_THINK" => Some("maybe".to_string()),
            _ => None,
        });
        assert_eq!(cfg.max_tool_rounds, 8);
        assert!(cfg.think);
    }

    #[test]
    fn test_component_configs() {
        let cfg = Config::default();
        assert_eq!(cfg.proxy().relaunch_backoff, Duration::from_millis(500));
        assert_eq!(cfg.tools().output_char_cap, cfg.output_char_cap);
        assert_eq!(cfg.sandbox().default_timeout, Duration::from_secs(5));
    }
}
