//! Logging and optional OpenTelemetry trace export
//!
//! Log lines always go to stderr so they never interleave with the REPL's
//! stdout. When an OTLP endpoint is configured, spans are additionally
//! exported through a batching OTLP pipeline.
//!
//! ```text
//! veilagent → tracing spans ─┬→ fmt layer (stderr, text or JSON)
//!                            └→ OTLP (gRPC) → collector   [optional]
//! ```

use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{runtime, trace as sdktrace, Resource};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Filter used when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "warn,veilagent=info";

/// Logging options
#[derive(Debug, Clone, Default)]
pub struct TracingOptions {
    /// OTLP collector endpoint; export is disabled when `None`
    pub otlp_endpoint: Option<String>,
    /// Emit JSON log lines
    pub json: bool,
    /// Filter directive overriding both `RUST_LOG` and the default
    pub filter: Option<String>,
}

/// Initialize the tracing subsystem
///
/// # Example
/// ```ignore
/// init_tracing("veilagent", &TracingOptions::default())?;
/// ```
pub fn init_tracing(
    service_name: &str,
    options: &TracingOptions,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let fmt_layer = if options.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .boxed()
    };

    let otel_layer = match options.otlp_endpoint.as_deref() {
        Some(endpoint) => {
            let exporter = opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint);

            let tracer = opentelemetry_otlp::new_pipeline()
                .tracing()
                .with_exporter(exporter)
                .with_trace_config(sdktrace::Config::default().with_resource(Resource::new(
                    vec![
                        KeyValue::new("service.name", service_name.to_string()),
                        KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                    ],
                )))
                .install_batch(runtime::Tokio)?;

            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    let filter = match options.filter.as_deref() {
        Some(directive) => EnvFilter::try_new(directive)?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(otel_layer)
        .with(filter)
        .try_init()?;

    if let Some(endpoint) = options.otlp_endpoint.as_deref() {
        tracing::info!(service = service_name, endpoint, "OpenTelemetry tracing initialized");
    }

    Ok(())
}

/// Flush pending spans to the collector
pub fn shutdown_tracing() {
    opentelemetry::global::shutdown_tracer_provider();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_parses() {
        assert!(EnvFilter::try_new(DEFAULT_FILTER).is_ok());
    }

    #[test]
    fn test_options_default_disables_export() {
        let opts = TracingOptions::default();
        assert!(opts.otlp_endpoint.is_none());
        assert!(!opts.json);
    }
}
