//! Tracing pipeline for the rove tools.
//!
//! Call [`init_tracing`] once at process startup and hold the returned guard.
//!
//! # Environment variables
//!
//! | Variable | Effect |
//! |---|---|
//! | `RUST_LOG` | Log filter (default `"info"`). |
//! | `ROVE_LOG_FORMAT=json` | Emit newline-delimited JSON logs. |
//! | `ROVE_TRACE_FRAMES=1` | Add `rove::link=trace`: one `frame_out` span per written frame and one `frame in` event per received frame, each carrying device, command and seq. |
//! | `OTEL_EXPORTER_OTLP_ENDPOINT` | OTLP collector base URL (e.g. `http://localhost:4318`). When set, spans are exported over OTLP/HTTP. |
//!
//! Span layout with frame tracing on:
//!
//! ```text
//! send_with_response{conn, kind, device, command}    caller task
//! rove_writer{conn}
//!   frame_out{device, command, seq, expects}
//! rove_pump{conn}
//!   frame in {kind, device, command, seq, delivered}
//! ```

use opentelemetry::KeyValue;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{Resource, trace::SdkTracerProvider};
use rove_middleware::LINK_TARGET;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_FILTER: &str = "info";

// ─────────────────────────────────────────────────────────────────────────────
// Settings
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

/// Everything [`init_tracing`] reads from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetrySettings {
    pub filter: String,
    pub format: LogFormat,
    pub trace_frames: bool,
    pub otlp_endpoint: Option<String>,
}

impl TelemetrySettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let format = match lookup("ROVE_LOG_FORMAT").as_deref() {
            Some("json") => LogFormat::Json,
            _ => LogFormat::Compact,
        };
        let trace_frames = lookup("ROVE_TRACE_FRAMES").is_some_and(|v| matches!(v.trim(), "1" | "true" | "yes"));
        Self {
            filter: lookup("RUST_LOG")
                .filter(|f| !f.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_FILTER.to_string()),
            format,
            trace_frames,
            otlp_endpoint: lookup("OTEL_EXPORTER_OTLP_ENDPOINT").filter(|e| !e.trim().is_empty()),
        }
    }

    /// Filter directives with the link target appended when frame tracing
    /// is on. A later directive for the same target wins.
    pub fn directives(&self) -> String {
        if self.trace_frames {
            format!("{},{LINK_TARGET}=trace", self.filter)
        } else {
            self.filter.clone()
        }
    }

    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_new(self.directives()).unwrap_or_else(|e| {
            eprintln!("[rove] invalid log filter {:?}: {e}", self.filter);
            EnvFilter::new(DEFAULT_FILTER)
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Public API
// ─────────────────────────────────────────────────────────────────────────────

/// Install the global `tracing` subscriber from [`TelemetrySettings::from_env`].
///
/// The returned [`TracerProviderGuard`] must be held for the lifetime of the
/// process; dropping it flushes pending spans.
pub fn init_tracing(service_name: &str) -> TracerProviderGuard {
    let settings = TelemetrySettings::from_env();
    let provider = settings
        .otlp_endpoint
        .as_deref()
        .and_then(|endpoint| build_provider(service_name, endpoint));

    tracing_subscriber::registry()
        .with(settings.env_filter())
        .with(
            provider
                .as_ref()
                .map(|p| tracing_opentelemetry::layer().with_tracer(p.tracer("rove"))),
        )
        .with((settings.format == LogFormat::Json).then(|| tracing_subscriber::fmt::layer().json()))
        .with((settings.format == LogFormat::Compact).then(|| tracing_subscriber::fmt::layer().compact()))
        .init();

    TracerProviderGuard(provider)
}

// ─────────────────────────────────────────────────────────────────────────────
// RAII guard
// ─────────────────────────────────────────────────────────────────────────────

/// Shuts down the OTel [`SdkTracerProvider`] on drop.
pub struct TracerProviderGuard(Option<SdkTracerProvider>);

impl Drop for TracerProviderGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.0.take()
            && let Err(e) = provider.shutdown()
        {
            eprintln!("[rove] OpenTelemetry provider shutdown error: {e}");
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Internal helpers
// ─────────────────────────────────────────────────────────────────────────────

/// `None` when the exporter fails to build.
fn build_provider(service_name: &str, endpoint: &str) -> Option<SdkTracerProvider> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| eprintln!("[rove] OTLP exporter init failed: {e}"))
        .ok()?;

    let resource = Resource::builder()
        .with_service_name(service_name.to_string())
        .with_attributes([
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
            KeyValue::new("rove.link.frame_len", rove_types::FRAME_LEN as i64),
        ])
        .build();

    Some(
        SdkTracerProvider::builder()
            .with_resource(resource)
            // The CLI builds its Tokio runtime after this call, so the batch
            // exporter (which spawns tasks) cannot be used here.
            .with_simple_exporter(exporter)
            .build(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(vars: &[(&str, &str)]) -> TelemetrySettings {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        TelemetrySettings::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_without_environment() {
        let s = settings(&[]);
        assert_eq!(s.filter, "info");
        assert_eq!(s.format, LogFormat::Compact);
        assert!(!s.trace_frames);
        assert_eq!(s.otlp_endpoint, None);
        assert_eq!(s.directives(), "info");
    }

    #[test]
    fn frame_tracing_appends_link_target() {
        let s = settings(&[("RUST_LOG", "warn,rove_runtime=debug"), ("ROVE_TRACE_FRAMES", "1")]);
        assert_eq!(s.directives(), "warn,rove_runtime=debug,rove::link=trace");
        assert!(EnvFilter::try_new(s.directives()).is_ok());
    }

    #[test]
    fn json_format_and_endpoint() {
        let s = settings(&[
            ("ROVE_LOG_FORMAT", "json"),
            ("ROVE_TRACE_FRAMES", "no"),
            ("OTEL_EXPORTER_OTLP_ENDPOINT", "http://localhost:4318"),
        ]);
        assert_eq!(s.format, LogFormat::Json);
        assert!(!s.trace_frames);
        assert_eq!(s.otlp_endpoint.as_deref(), Some("http://localhost:4318"));
    }

    #[test]
    fn blank_values_fall_back() {
        let s = settings(&[("RUST_LOG", "  "), ("OTEL_EXPORTER_OTLP_ENDPOINT", "")]);
        assert_eq!(s.filter, "info");
        assert_eq!(s.otlp_endpoint, None);
    }

    #[test]
    fn invalid_filter_falls_back_to_default() {
        let s = settings(&[("RUST_LOG", "rove=notalevel")]);
        assert!(EnvFilter::try_new(s.directives()).is_err());
        let _fallback = s.env_filter();
    }

    #[test]
    fn empty_guard_drops_cleanly() {
        drop(TracerProviderGuard(None));
    }
}
