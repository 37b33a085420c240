//! Tool executor
//!
//! Runs one validated tool call: proxy gating, wall-clock timeout, output
//! cap. Tool failures never escape as errors; they come back as a
//! [`ToolResult`] carrying an error kind so the model can react.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, info_span, warn, Instrument};

use crate::config::ToolConfig;
use crate::error::{ToolError, ToolErrorKind};
use crate::metrics::{TOOL_CALLS, TOOL_DURATION, TOOL_OUTPUT_TRUNCATED};
use crate::proxy::ProxyProcessState;

use super::files;
use super::sandbox::Sandbox;
use super::web::{Route, WebTools};
use super::{ToolCallRequest, ToolInvocation, ToolResult};

/// Appended to capped output; counted against the cap
pub const TRUNCATION_MARKER: &str = "\n[output truncated]";

/// Longest `onion_up` check when the call does not specify one
const ONION_CHECK_DEFAULT: Duration = Duration::from_secs(20);

/// Extra time granted on top of the sandbox's own kill deadline
const SANDBOX_GRACE: Duration = Duration::from_secs(2);

/// Smallest cap accepted for tool output
pub const MIN_OUTPUT_CHARS: usize = 256;

/// Same length as the marker; replaces a marker the tool itself printed
const MARKER_LOOKALIKE: &str = "\n(output truncated)";

/// Cap `text` at `cap` characters, marker included
///
/// Caps below [`MIN_OUTPUT_CHARS`] are raised to it. Returns the (possibly)
/// shortened text and whether it was cut. Capping already capped text
/// leaves it unchanged.
pub fn cap_output(text: &str, cap: usize) -> (String, bool) {
    let cap = cap.max(MIN_OUTPUT_CHARS);
    let total = text.chars().count();
    if total <= cap {
        return (text.to_string(), false);
    }

    let marker_len = TRUNCATION_MARKER.chars().count();
    let mut out: String = text.chars().take(cap - marker_len).collect();
    out.push_str(TRUNCATION_MARKER);
    (out, true)
}

/// Cap raw tool output so the marker only ever ends text that was cut
pub fn cap_tool_output(text: &str, cap: usize) -> (String, bool) {
    match text.strip_suffix(TRUNCATION_MARKER) {
        Some(body) => cap_output(&format!("{}{}", body, MARKER_LOOKALIKE), cap),
        None => cap_output(text, cap),
    }
}

/// Executes tool calls against the web, file and sandbox backends
pub struct ToolExecutor {
    config: ToolConfig,
    web: Arc<dyn WebTools>,
    sandbox: Sandbox,
    home_dir: RwLock<PathBuf>,
}

impl ToolExecutor {
    pub fn new(mut config: ToolConfig, web: Arc<dyn WebTools>, sandbox: Sandbox) -> Self {
        config.output_char_cap = config.output_char_cap.max(MIN_OUTPUT_CHARS);
        let home_dir = RwLock::new(config.home_dir.clone());
        Self {
            config,
            web,
            sandbox,
            home_dir,
        }
    }

    pub fn output_cap(&self) -> usize {
        self.config.output_char_cap
    }

    /// Directory the file tools are confined to
    pub fn home_dir(&self) -> PathBuf {
        match self.home_dir.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn set_home_dir(&self, path: impl Into<PathBuf>) {
        let path = path.into();
        match self.home_dir.write() {
            Ok(mut guard) => *guard = path,
            Err(poisoned) => *poisoned.into_inner() = path,
        }
    }

    /// Run one tool call and fold the outcome into a [`ToolResult`]
    pub async fn dispatch(&self, call: &ToolCallRequest, proxy: &ProxyProcessState) -> ToolResult {
        let span = info_span!("tool_call", tool = %call.tool_name, call_id = %call.call_id);

        async {
            let started = Instant::now();
            let outcome = self.run(call, proxy).await;
            let elapsed = started.elapsed().as_secs_f64();

            let label = call.tool_name.as_str();
            TOOL_DURATION.with_label_values(&[label]).observe(elapsed);

            match outcome {
                Ok(value) => {
                    TOOL_CALLS.with_label_values(&[label, "ok"]).inc();
                    let (output, truncated) = cap_tool_output(&render(&value), self.config.output_char_cap);
                    if truncated {
                        TOOL_OUTPUT_TRUNCATED.with_label_values(&[label]).inc();
                    }
                    debug!(elapsed_secs = elapsed, chars = output.len(), truncated, "tool finished");
                    ToolResult::ok(call, output)
                }
                Err(e) => {
                    TOOL_CALLS.with_label_values(&[label, e.kind.as_str()]).inc();
                    warn!(error = %e, "tool failed");
                    ToolResult::err(call, &e, self.config.output_char_cap)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn run(&self, call: &ToolCallRequest, proxy: &ProxyProcessState) -> Result<Value, ToolError> {
        let invocation = ToolInvocation::parse(&call.tool_name, &call.arguments)?;

        if invocation.kind().requires_proxy() && !proxy.is_running() {
            return Err(ToolError::new(
                ToolErrorKind::ProxyUnavailable,
                format!("proxy is {}; anonymized tools are unavailable", proxy.status),
            ));
        }

        let bound = self.timeout_for(&invocation);
        match tokio::time::timeout(bound, self.execute(invocation, proxy)).await {
            Ok(result) => result,
            Err(_) => Err(ToolError::new(
                ToolErrorKind::Timeout,
                format!("tool did not finish within {}s", bound.as_secs()),
            )),
        }
    }

    fn timeout_for(&self, invocation: &ToolInvocation) -> Duration {
        match invocation {
            ToolInvocation::PythonExec(req) => self.sandbox.effective_timeout(req) + SANDBOX_GRACE,
            _ => self.config.timeout,
        }
    }

    async fn execute(&self, invocation: ToolInvocation, proxy: &ProxyProcessState) -> Result<Value, ToolError> {
        match invocation {
            ToolInvocation::DuckSearch { query, max_results } => {
                self.web.duck_search(&query, max_results).await
            }
            ToolInvocation::FetchUrl { url, max_chars } => {
                self.web.fetch_page(&url, max_chars, Route::Direct).await
            }
            ToolInvocation::TorSearch { query, base_url } => {
                let route = socks_route(proxy)?;
                self.web.tor_search(&query, &base_url, route).await
            }
            ToolInvocation::TorFetch { url } => {
                let route = socks_route(proxy)?;
                self.web.fetch_page(&url, 100_000, route).await
            }
            ToolInvocation::OnionUp { url, timeout } => {
                let route = socks_route(proxy)?;
                let bound = timeout.unwrap_or_else(|| self.config.http_timeout.min(ONION_CHECK_DEFAULT));
                self.web.onion_up(&url, bound, route).await
            }
            ToolInvocation::LoadFile { path, max_chars } => {
                let home = self.home_dir();
                blocking(move || files::load_file(&home, &path, max_chars)).await
            }
            ToolInvocation::SearchFiles(query) => {
                let home = self.home_dir();
                blocking(move || files::search_files(&home, &query)).await
            }
            ToolInvocation::PythonExec(request) => self.sandbox.run(&request).await,
        }
    }
}

fn socks_route(proxy: &ProxyProcessState) -> Result<Route, ToolError> {
    proxy.socks_port.map(Route::Socks).ok_or_else(|| {
        ToolError::new(ToolErrorKind::ProxyUnavailable, "proxy has no SOCKS port")
    })
}

async fn blocking<F>(f: F) -> Result<Value, ToolError>
where
    F: FnOnce() -> Result<Value, ToolError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ToolError::failed(format!("file task panicked: {}", e)))?
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}
