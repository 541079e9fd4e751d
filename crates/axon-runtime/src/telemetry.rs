//! Logging and optional OpenTelemetry export for Axon processes.
//!
//! Call [`init_tracing`] once at startup and keep the returned guard alive
//! for the lifetime of the process.  Logs go to stderr so that they never
//! interleave with operator output on stdout.
//!
//! # Environment variables
//!
//! | Variable | Effect |
//! |---|---|
//! | `RUST_LOG` | Log filter (default given by the caller, usually `"info"`). |
//! | `AXON_LOG_FORMAT=json` | Emit newline-delimited JSON logs. |
//! | `OTEL_EXPORTER_OTLP_ENDPOINT` | OTLP collector base URL.  When set, spans are exported over OTLP/HTTP. |

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{Resource, trace::SdkTracerProvider};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

impl LogFormat {
    /// Read `AXON_LOG_FORMAT`; anything other than `json` is compact.
    pub fn from_env() -> Self {
        Self::parse(std::env::var("AXON_LOG_FORMAT").ok().as_deref())
    }

    fn parse(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Compact,
        }
    }
}

/// Install the global subscriber.
///
/// `default_filter` applies when `RUST_LOG` is unset or invalid.  Calling
/// this twice is harmless: the second registration is ignored.
pub fn init_tracing(service_name: &str, default_filter: &str) -> TracerProviderGuard {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let format = LogFormat::from_env();
    let provider = build_provider(
        service_name,
        std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok(),
    );
    let otel_layer = provider
        .as_ref()
        .map(|p| tracing_opentelemetry::layer().with_tracer(p.tracer("axon")));

    let registry = tracing_subscriber::registry().with(env_filter).with(otel_layer);
    let _ = match format {
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        LogFormat::Compact => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .compact()
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    };

    TracerProviderGuard(provider)
}

/// Shuts the OTel provider down (flushing spans) when dropped.
pub struct TracerProviderGuard(Option<SdkTracerProvider>);

impl Drop for TracerProviderGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.0.take() {
            if let Err(e) = provider.shutdown() {
                eprintln!("[axon] OpenTelemetry provider shutdown error: {e}");
            }
        }
    }
}

fn build_provider(service_name: &str, endpoint: Option<String>) -> Option<SdkTracerProvider> {
    let endpoint = endpoint.filter(|e| !e.trim().is_empty())?;

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| eprintln!("[axon] OTLP exporter init failed: {e}"))
        .ok()?;

    let resource = Resource::builder()
        .with_service_name(service_name.to_string())
        .build();

    // Simple exporter: the CLI creates its Tokio runtime after this call, so
    // a batch exporter (which spawns tasks) cannot be used here.
    Some(
        SdkTracerProvider::builder()
            .with_resource(resource)
            .with_simple_exporter(exporter)
            .build(),
    )
}
