//! Prometheus metrics for the agent, tools, proxy and session store
//!
//! All metrics live in the default registry; `gather_text()` renders the
//! text exposition format for the `metrics` CLI subcommand.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_histogram, register_histogram_vec,
    CounterVec, Encoder, Gauge, Histogram, HistogramVec, TextEncoder,
};

lazy_static! {
    // ─────────────────────────────────────────────────────────────────────────────
    // Agent Loop Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    /// User turns by outcome.
    ///
    /// Labels:
    /// - outcome: "answered", "empty_answer", "max_rounds", "model_error", "cancelled", "storage_error"
    pub static ref AGENT_TURNS: CounterVec = register_counter_vec!(
        "veilagent_turns_total",
        "User turns processed by outcome",
        &["outcome"]
    ).expect("failed to register AGENT_TURNS metric");

    /// Tool round-trips per user turn.
    pub static ref AGENT_ROUNDS: Histogram = register_histogram!(
        "veilagent_turn_rounds",
        "Tool round-trips per user turn",
        vec![0.0, 1.0, 2.0, 3.0, 4.0, 6.0, 8.0, 12.0, 16.0]
    ).expect("failed to register AGENT_ROUNDS metric");

    /// Model calls by attempt mode and status.
    ///
    /// Labels:
    /// - mode: "full" or "reduced"
    /// - status: "ok" or the error kind
    pub static ref MODEL_CALLS: CounterVec = register_counter_vec!(
        "veilagent_model_calls_total",
        "Model backend calls by attempt mode and status",
        &["mode", "status"]
    ).expect("failed to register MODEL_CALLS metric");

    /// Model call latency by model tag.
    pub static ref MODEL_CALL_DURATION: HistogramVec = register_histogram_vec!(
        "veilagent_model_call_duration_seconds",
        "Model call latency",
        &["model"],
        vec![0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]
    ).expect("failed to register MODEL_CALL_DURATION metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Tool Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    /// Tool calls by tool and result.
    ///
    /// Labels:
    /// - tool: tool name as requested by the model
    /// - result: "ok" or the tool error kind
    pub static ref TOOL_CALLS: CounterVec = register_counter_vec!(
        "veilagent_tool_calls_total",
        "Tool calls by tool and result",
        &["tool", "result"]
    ).expect("failed to register TOOL_CALLS metric");

    /// Tool execution latency.
    pub static ref TOOL_DURATION: HistogramVec = register_histogram_vec!(
        "veilagent_tool_duration_seconds",
        "Tool execution latency",
        &["tool"],
        vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
    ).expect("failed to register TOOL_DURATION metric");

    /// Tool outputs cut at the character cap.
    pub static ref TOOL_OUTPUT_TRUNCATED: CounterVec = register_counter_vec!(
        "veilagent_tool_output_truncated_total",
        "Tool outputs truncated at the character cap",
        &["tool"]
    ).expect("failed to register TOOL_OUTPUT_TRUNCATED metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Proxy Supervisor Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    /// Whether the proxy daemon is bootstrapped (1) or not (0).
    pub static ref PROXY_RUNNING: Gauge = register_gauge!(
        "veilagent_proxy_running",
        "Whether the proxy daemon is bootstrapped (1) or not (0)"
    ).expect("failed to register PROXY_RUNNING metric");

    /// Proxy launches by result.
    ///
    /// Labels:
    /// - result: "ready", "failed", "timeout"
    pub static ref PROXY_LAUNCHES: CounterVec = register_counter_vec!(
        "veilagent_proxy_launches_total",
        "Proxy daemon launches by result",
        &["result"]
    ).expect("failed to register PROXY_LAUNCHES metric");

    /// Time from spawn to full bootstrap.
    pub static ref PROXY_BOOTSTRAP_DURATION: Histogram = register_histogram!(
        "veilagent_proxy_bootstrap_duration_seconds",
        "Time from spawn to full bootstrap",
        vec![1.0, 2.5, 5.0, 10.0, 20.0, 30.0, 60.0, 90.0, 120.0]
    ).expect("failed to register PROXY_BOOTSTRAP_DURATION metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Session Store Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    /// Session store operations by op and result.
    pub static ref SESSION_OPS: CounterVec = register_counter_vec!(
        "veilagent_session_ops_total",
        "Session store operations by op and result",
        &["op", "result"]
    ).expect("failed to register SESSION_OPS metric");
}

/// Render every registered metric in the Prometheus text format
pub fn gather_text() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        return format!("# failed to encode metrics: {}\n", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_includes_touched_metrics() {
        TOOL_CALLS.with_label_values(&["duck_search", "ok"]).inc();
        PROXY_RUNNING.set(0.0);
        let text = gather_text();
        assert!(text.contains("veilagent_tool_calls_total"));
        assert!(text.contains("veilagent_proxy_running"));
    }
}
