//! Tool registry: the closed set of tools the model may call
//!
//! Each tool has a static [`ToolSpec`] (name, description, parameter table,
//! proxy requirement). Raw model arguments are validated against the table
//! and decoded into a typed [`ToolInvocation`] before anything runs.
//!
//! ```text
//! ToolCallRequest ──validate──▶ ToolInvocation ──ToolExecutor──▶ ToolResult
//!   (name + JSON)                 (typed enum)                    (capped text)
//! ```

pub mod executor;
pub mod files;
pub mod sandbox;
pub mod web;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ToolError, ToolErrorKind};
use crate::ollama::Tool;

pub use executor::{cap_output, cap_tool_output, ToolExecutor, MIN_OUTPUT_CHARS, TRUNCATION_MARKER};
pub use files::FileQuery;
pub use sandbox::{PythonRequest, Sandbox};
pub use web::{HttpWebTools, Route, WebTools};

/// Default search engine used by `tor_search`
pub const DEFAULT_TOR_SEARCH_URL: &str = "https://ahmia.fi/search/";

/// Every tool the agent knows about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolKind {
    DuckSearch,
    FetchUrl,
    TorSearch,
    TorFetch,
    OnionUp,
    LoadFile,
    SearchFiles,
    PythonExec,
}

impl ToolKind {
    pub const ALL: [ToolKind; 8] = [
        ToolKind::DuckSearch,
        ToolKind::FetchUrl,
        ToolKind::TorSearch,
        ToolKind::TorFetch,
        ToolKind::OnionUp,
        ToolKind::LoadFile,
        ToolKind::SearchFiles,
        ToolKind::PythonExec,
    ];

    pub fn from_name(name: &str) -> Option<ToolKind> {
        TOOL_SPECS.iter().find(|s| s.name == name).map(|s| s.kind)
    }

    pub fn spec(&self) -> &'static ToolSpec {
        match self {
            ToolKind::DuckSearch => &TOOL_SPECS[0],
            ToolKind::FetchUrl => &TOOL_SPECS[1],
            ToolKind::TorSearch => &TOOL_SPECS[2],
            ToolKind::TorFetch => &TOOL_SPECS[3],
            ToolKind::OnionUp => &TOOL_SPECS[4],
            ToolKind::LoadFile => &TOOL_SPECS[5],
            ToolKind::SearchFiles => &TOOL_SPECS[6],
            ToolKind::PythonExec => &TOOL_SPECS[7],
        }
    }

    pub fn name(&self) -> &'static str {
        self.spec().name
    }

    pub fn requires_proxy(&self) -> bool {
        self.spec().requires_proxy
    }
}

/// JSON type of a tool parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    String,
    Integer,
    Boolean,
    Object,
}

impl ParamType {
    fn json_name(&self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Integer => "integer",
            ParamType::Boolean => "boolean",
            ParamType::Object => "object",
        }
    }
}

/// One parameter in a tool schema
#[derive(Debug)]
pub struct ParamSpec {
    pub name: &'static str,
    pub ty: ParamType,
    pub required: bool,
    pub description: &'static str,
    /// Inclusive bounds for integer parameters
    pub range: Option<(i64, i64)>,
}

/// Static description of a tool
#[derive(Debug)]
pub struct ToolSpec {
    pub kind: ToolKind,
    pub name: &'static str,
    pub description: &'static str,
    pub params: &'static [ParamSpec],
    /// Only runnable while the proxy is Running
    pub requires_proxy: bool,
}

const fn param(
    name: &'static str,
    ty: ParamType,
    required: bool,
    description: &'static str,
) -> ParamSpec {
    ParamSpec {
        name,
        ty,
        required,
        description,
        range: None,
    }
}

const fn ranged(name: &'static str, min: i64, max: i64, description: &'static str) -> ParamSpec {
    ParamSpec {
        name,
        ty: ParamType::Integer,
        required: false,
        description,
        range: Some((min, max)),
    }
}

static TOOL_SPECS: [ToolSpec; 8] = [
    ToolSpec {
        kind: ToolKind::DuckSearch,
        name: "duck_search",
        description: "Search the web using DuckDuckGo and return relevant results.",
        params: &[
            param("query", ParamType::String, true, "The search query string."),
            ranged("max_results", 1, 25, "Max results to return (default 5)."),
        ],
        requires_proxy: false,
    },
    ToolSpec {
        kind: ToolKind::FetchUrl,
        name: "fetch_url",
        description: "Fetch a URL and return its main content, title, and outlinks.",
        params: &[
            param("url", ParamType::String, true, "The URL to fetch."),
            ranged("max_chars", 1, 1_000_000, "Cap extracted content characters (default 100000)."),
        ],
        requires_proxy: false,
    },
    ToolSpec {
        kind: ToolKind::TorSearch,
        name: "tor_search",
        description: "Search via the local Tor client (Ahmia or a compatible engine). Returns result titles, URLs and snippets.",
        params: &[
            param("query", ParamType::String, true, "The search query string."),
            param("base_url", ParamType::String, false, "Optional search engine base URL."),
        ],
        requires_proxy: true,
    },
    ToolSpec {
        kind: ToolKind::TorFetch,
        name: "tor_fetch",
        description: "Fetch a single page via the local Tor client.",
        params: &[param("url", ParamType::String, true, "The URL to fetch.")],
        requires_proxy: true,
    },
    ToolSpec {
        kind: ToolKind::OnionUp,
        name: "onion_up",
        description: "Return true/false if a given .onion host/URL is reachable via Tor.",
        params: &[
            param("address", ParamType::String, true, "A .onion hostname or full URL."),
            ranged("timeout", 1, 60, "Optional timeout seconds (default <= 20)."),
        ],
        requires_proxy: true,
    },
    ToolSpec {
        kind: ToolKind::LoadFile,
        name: "load_file",
        description: "Load a local file (.txt/.md/.html) under the home directory and return its text and metadata.",
        params: &[
            param("path", ParamType::String, true, "Path to the local file, relative to the home directory or absolute under it."),
            ranged("max_chars", 1, 1_000_000, "Cap extracted content characters (default 100000)."),
        ],
        requires_proxy: false,
    },
    ToolSpec {
        kind: ToolKind::SearchFiles,
        name: "search_files",
        description: "Search files under the home directory by name substring/regex, extension, and basic content match for text formats.",
        params: &[
            param("name", ParamType::String, false, "Name substring or regex (basename)."),
            param("ext", ParamType::String, false, "File extension filter, e.g. 'txt' or '.txt'."),
            param("contains", ParamType::String, false, "Search file contents (text formats)."),
            param("case_sensitive", ParamType::Boolean, false, "Case-sensitive matching (default false)."),
            param("regex", ParamType::Boolean, false, "Treat 'name' as a regex (default false)."),
            ranged("max_results", 1, 500, "Maximum files to return (default 50)."),
        ],
        requires_proxy: false,
    },
    ToolSpec {
        kind: ToolKind::PythonExec,
        name: "python_exec",
        description: "Run Python in an isolated sandbox without network access. Safe modules (math, statistics, random, re, itertools, functools, collections, decimal, fractions, datetime, json, textwrap) are importable; network and process modules are always blocked, others require allow_imports=true. Only basic builtins are available (no open, eval, getattr or globals) and attributes starting with '_' cannot be accessed. The value of the last expression (or a variable named `result`) is returned; `inputs` holds the inputs object.",
        params: &[
            param("code", ParamType::String, true, "Python source to execute."),
            param("inputs", ParamType::Object, false, "JSON object exposed to the code as `inputs`."),
            ranged("timeout", 1, 60, "Timeout in seconds (default 5)."),
            param("allow_imports", ParamType::Boolean, false, "Allow imports beyond the safe set (network modules stay blocked)."),
        ],
        requires_proxy: false,
    },
];

impl ToolSpec {
    /// JSON schema for the model
    pub fn schema(&self) -> Value {
        let mut properties = Map::new();
        for p in self.params {
            let mut prop = serde_json::json!({
                "type": p.ty.json_name(),
                "description": p.description,
            });
            if let Some((min, max)) = p.range {
                prop["minimum"] = min.into();
                prop["maximum"] = max.into();
            }
            properties.insert(p.name.to_string(), prop);
        }
        let required: Vec<&str> = self
            .params
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name)
            .collect();

        serde_json::json!({
            "type": "object",
            "properties": properties,
            "required": required,
            "additionalProperties": false,
        })
    }

    pub fn tool(&self) -> Tool {
        Tool::function(self.name, self.description, self.schema())
    }

    /// Check `arguments` against the parameter table
    pub fn validate<'a>(&self, arguments: &'a Value) -> Result<Args<'a>, ToolError> {
        let map = match arguments {
            Value::Object(map) => Some(map),
            Value::Null => None,
            other => {
                return Err(ToolError::invalid(format!(
                    "arguments for `{}` must be a JSON object, got {}",
                    self.name,
                    json_type(other)
                )))
            }
        };

        if let Some(map) = map {
            for key in map.keys() {
                if !self.params.iter().any(|p| p.name == key) {
                    return Err(ToolError::invalid(format!(
                        "unknown parameter `{}` for tool `{}`",
                        key, self.name
                    )));
                }
            }
        }

        for p in self.params {
            let value = map.and_then(|m| m.get(p.name)).filter(|v| !v.is_null());
            let Some(value) = value else {
                if p.required {
                    return Err(ToolError::invalid(format!(
                        "missing required parameter `{}`",
                        p.name
                    )));
                }
                continue;
            };

            let type_ok = match p.ty {
                ParamType::String => value.is_string(),
                ParamType::Integer => as_integer(value).is_some(),
                ParamType::Boolean => value.is_boolean(),
                ParamType::Object => value.is_object(),
            };
            if !type_ok {
                return Err(ToolError::invalid(format!(
                    "parameter `{}` must be {}, got {}",
                    p.name,
                    p.ty.json_name(),
                    json_type(value)
                )));
            }

            if p.required && p.ty == ParamType::String {
                if value.as_str().map(|s| s.trim().is_empty()).unwrap_or(false) {
                    return Err(ToolError::invalid(format!(
                        "parameter `{}` must be a non-empty string",
                        p.name
                    )));
                }
            }

            if let (Some((min, max)), Some(n)) = (p.range, as_integer(value)) {
                if n < min || n > max {
                    return Err(ToolError::invalid(format!(
                        "parameter `{}` must be between {} and {}, got {}",
                        p.name, min, max, n
                    )));
                }
            }
        }

        Ok(Args { map })
    }
}

/// Validated argument accessor
pub struct Args<'a> {
    map: Option<&'a Map<String, Value>>,
}

impl<'a> Args<'a> {
    fn get(&self, key: &str) -> Option<&'a Value> {
        self.map.and_then(|m| m.get(key)).filter(|v| !v.is_null())
    }

    pub fn str(&self, key: &str) -> Option<&'a str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn string(&self, key: &str) -> String {
        self.str(key).unwrap_or_default().to_string()
    }

    pub fn int(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(as_integer)
    }

    pub fn bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(Value::as_bool)
    }

    pub fn object(&self, key: &str) -> Option<&'a Value> {
        self.get(key).filter(|v| v.is_object())
    }
}

fn as_integer(value: &Value) -> Option<i64> {
    value.as_i64().or_else(|| {
        value
            .as_f64()
            .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
            .map(|f| f as i64)
    })
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Schemas for every tool, in registry order
pub fn tool_schemas() -> Vec<Tool> {
    TOOL_SPECS.iter().map(ToolSpec::tool).collect()
}

/// A tool call requested by the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub tool_name: String,
    #[serde(default)]
    pub arguments: Value,
    pub call_id: String,
}

impl ToolCallRequest {
    pub fn new(tool_name: impl Into<String>, arguments: Value, call_id: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
            arguments,
            call_id: call_id.into(),
        }
    }

    /// Generate a call id for backends that do not supply one
    pub fn generate_id() -> String {
        format!("call_{}", uuid::Uuid::now_v7().simple())
    }
}

/// Outcome of one tool call, folded into a tool turn
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub call_id: String,
    pub tool_name: String,
    /// Rendered output, never longer than the configured cap
    pub output: String,
    pub error: Option<ToolErrorKind>,
}

impl ToolResult {
    pub fn ok(call: &ToolCallRequest, output: String) -> Self {
        Self {
            call_id: call.call_id.clone(),
            tool_name: call.tool_name.clone(),
            output,
            error: None,
        }
    }

    pub fn err(call: &ToolCallRequest, error: &ToolError, cap: usize) -> Self {
        let text = format!("ERROR [{}]: {}", error.kind, error.message);
        Self {
            call_id: call.call_id.clone(),
            tool_name: call.tool_name.clone(),
            output: cap_tool_output(&text, cap).0,
            error: Some(error.kind),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// A validated, typed tool call
#[derive(Debug, Clone, PartialEq)]
pub enum ToolInvocation {
    DuckSearch { query: String, max_results: usize },
    FetchUrl { url: String, max_chars: usize },
    TorSearch { query: String, base_url: String },
    TorFetch { url: String },
    OnionUp { url: String, timeout: Option<Duration> },
    LoadFile { path: String, max_chars: usize },
    SearchFiles(FileQuery),
    PythonExec(PythonRequest),
}

impl ToolInvocation {
    /// Resolve the tool by name, validate arguments and decode them
    pub fn parse(tool_name: &str, arguments: &Value) -> Result<ToolInvocation, ToolError> {
        let kind = ToolKind::from_name(tool_name).ok_or_else(|| {
            ToolError::new(
                ToolErrorKind::NotFound,
                format!("tool `{}` is not available", tool_name),
            )
        })?;
        let args = kind.spec().validate(arguments)?;

        let invocation = match kind {
            ToolKind::DuckSearch => ToolInvocation::DuckSearch {
                query: args.string("query"),
                max_results: args.int("max_results").unwrap_or(5) as usize,
            },
            ToolKind::FetchUrl => ToolInvocation::FetchUrl {
                url: parse_http_url(&args.string("url"))?,
                max_chars: args.int("max_chars").unwrap_or(100_000) as usize,
            },
            ToolKind::TorSearch => ToolInvocation::TorSearch {
                query: args.string("query"),
                base_url: parse_http_url(args.str("base_url").unwrap_or(DEFAULT_TOR_SEARCH_URL))?,
            },
            ToolKind::TorFetch => ToolInvocation::TorFetch {
                url: parse_http_url(&args.string("url"))?,
            },
            ToolKind::OnionUp => ToolInvocation::OnionUp {
                url: onion_url(&args.string("address"))?,
                timeout: args.int("timeout").map(|s| Duration::from_secs(s as u64)),
            },
            ToolKind::LoadFile => ToolInvocation::LoadFile {
                path: args.string("path"),
                max_chars: args.int("max_chars").unwrap_or(100_000) as usize,
            },
            ToolKind::SearchFiles => ToolInvocation::SearchFiles(FileQuery {
                name: args.str("name").map(str::to_string),
                ext: args.str("ext").map(str::to_string),
                contains: args.str("contains").map(str::to_string),
                case_sensitive: args.bool("case_sensitive").unwrap_or(false),
                regex: args.bool("regex").unwrap_or(false),
                max_results: args.int("max_results").unwrap_or(50) as usize,
            }),
            ToolKind::PythonExec => ToolInvocation::PythonExec(PythonRequest {
                code: args.string("code"),
                inputs: args.object("inputs").cloned().unwrap_or_else(|| serde_json::json!({})),
                timeout: args.int("timeout").map(|s| Duration::from_secs(s as u64)),
                allow_imports: args.bool("allow_imports").unwrap_or(false),
            }),
        };
        Ok(invocation)
    }

    pub fn kind(&self) -> ToolKind {
        match self {
            ToolInvocation::DuckSearch { .. } => ToolKind::DuckSearch,
            ToolInvocation::FetchUrl { .. } => ToolKind::FetchUrl,
            ToolInvocation::TorSearch { .. } => ToolKind::TorSearch,
            ToolInvocation::TorFetch { .. } => ToolKind::TorFetch,
            ToolInvocation::OnionUp { .. } => ToolKind::OnionUp,
            ToolInvocation::LoadFile { .. } => ToolKind::LoadFile,
            ToolInvocation::SearchFiles(_) => ToolKind::SearchFiles,
            ToolInvocation::PythonExec(_) => ToolKind::PythonExec,
        }
    }
}

fn parse_http_url(raw: &str) -> Result<String, ToolError> {
    let parsed = url::Url::parse(raw.trim())
        .map_err(|e| ToolError::invalid(format!("invalid url {:?}: {}", raw, e)))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed.to_string()),
        other => Err(ToolError::invalid(format!(
            "unsupported url scheme `{}`; only http and https are allowed",
            other
        ))),
    }
}

/// Normalize a bare host or URL to `scheme://host` and require a .onion host
fn onion_url(address: &str) -> Result<String, ToolError> {
    let address = address.trim();
    let with_scheme = if address.contains("://") {
        address.to_string()
    } else {
        format!("http://{}", address)
    };
    let parsed = url::Url::parse(&with_scheme)
        .map_err(|e| ToolError::invalid(format!("invalid address {:?}: {}", address, e)))?;
    let host = parsed.host_str().unwrap_or_default().to_ascii_lowercase();
    if !host.ends_with(".onion") {
        return Err(ToolError::invalid("address must be a .onion host or URL"));
    }
    Ok(format!("{}://{}", parsed.scheme(), host))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_registry_is_closed_and_consistent() {
        for kind in ToolKind::ALL {
            assert_eq!(kind.spec().kind, kind);
            assert_eq!(ToolKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(ToolKind::from_name("execute_code"), None);
        assert_eq!(tool_schemas().len(), 8);
    }

    #[test]
    fn test_proxy_requirements() {
        let proxied: Vec<_> = ToolKind::ALL
            .iter()
            .filter(|k| k.requires_proxy())
            .map(|k| k.name())
            .collect();
        assert_eq!(proxied, vec!["tor_search", "tor_fetch", "onion_up"]);
    }

    #[test]
    fn test_schema_shape() {
        let schema = ToolKind::DuckSearch.spec().schema();
        assert_eq!(schema["required"], json!(["query"]));
        assert_eq!(schema["properties"]["max_results"]["type"], "integer");
        assert_eq!(schema["additionalProperties"], false);
    }

    #[test]
    fn test_unknown_tool() {
        let err = ToolInvocation::parse("rm_rf", &json!({})).unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::NotFound);
    }

    #[test]
    fn test_missing_required() {
        let err = ToolInvocation::parse("duck_search", &json!({})).unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::ArgumentInvalid);
        assert!(err.message.contains("query"));
    }

    #[test]
    fn test_wrong_type_and_unknown_field() {
        let err = ToolInvocation::parse("duck_search", &json!({"query": 3})).unwrap_err();
        assert!(err.message.contains("must be string"));

        let err =
            ToolInvocation::parse("duck_search", &json!({"query": "x", "region": "us"})).unwrap_err();
        assert!(err.message.contains("unknown parameter `region`"));

        let err = ToolInvocation::parse("tor_fetch", &json!("https://x")).unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::ArgumentInvalid);
    }

    #[test]
    fn test_range_checks() {
        let err =
            ToolInvocation::parse("python_exec", &json!({"code": "1", "timeout": 600})).unwrap_err();
        assert!(err.message.contains("between 1 and 60"));

        let inv = ToolInvocation::parse("python_exec", &json!({"code": "1", "timeout": 3.0})).unwrap();
        match inv {
            ToolInvocation::PythonExec(req) => assert_eq!(req.timeout, Some(Duration::from_secs(3))),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_defaults_applied() {
        let inv = ToolInvocation::parse("duck_search", &json!({"query": "rust"})).unwrap();
        assert_eq!(
            inv,
            ToolInvocation::DuckSearch {
                query: "rust".into(),
                max_results: 5
            }
        );

        let inv = ToolInvocation::parse("tor_search", &json!({"query": "q"})).unwrap();
        assert_eq!(
            inv,
            ToolInvocation::TorSearch {
                query: "q".into(),
                base_url: DEFAULT_TOR_SEARCH_URL.into()
            }
        );
    }

    #[test]
    fn test_url_validation() {
        let err = ToolInvocation::parse("fetch_url", &json!({"url": "file:///etc/passwd"})).unwrap_err();
        assert!(err.message.contains("scheme"));
        assert!(ToolInvocation::parse("fetch_url", &json!({"url": "not a url"})).is_err());
    }

    #[test]
    fn test_onion_normalization() {
        let inv = ToolInvocation::parse("onion_up", &json!({"address": "ExampleAbc.onion/path"})).unwrap();
        assert_eq!(
            inv,
            ToolInvocation::OnionUp {
                url: "http://exampleabc.onion".into(),
                timeout: None
            }
        );
        let err = ToolInvocation::parse("onion_up", &json!({"address": "example.com"})).unwrap_err();
        assert!(err.message.contains(".onion"));
    }

    #[test]
    fn test_empty_required_string_rejected() {
        let err = ToolInvocation::parse("load_file", &json!({"path": "  "})).unwrap_err();
        assert!(err.message.contains("non-empty"));
    }

    #[test]
    fn test_null_arguments_treated_as_empty() {
        let inv = ToolInvocation::parse("search_files", &Value::Null).unwrap();
        assert_eq!(inv.kind(), ToolKind::SearchFiles);
    }
}
