//! OpenTelemetry initialization and shutdown
//!
//! Tracing always goes to stdout through `tracing-subscriber`; the OTLP
//! exporter is layered on top only when `OTEL_EXPORTER_OTLP_ENDPOINT` is set
//! (see `main.rs`).

use opentelemetry::trace::TraceError;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{runtime, trace as sdktrace, Resource};

/// Build an OTLP pipeline tracer for the injector.
///
/// The endpoint is taken from the standard `OTEL_EXPORTER_OTLP_ENDPOINT`
/// environment variable by the exporter itself.
pub fn init_tracer() -> Result<sdktrace::Tracer, TraceError> {
    opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(opentelemetry_otlp::new_exporter().tonic())
        .with_trace_config(sdktrace::config().with_resource(Resource::new(vec![
            KeyValue::new("service.name", "cabundle-injector"),
        ])))
        .install_batch(runtime::Tokio)
}

/// Flush any buffered spans and tear down the global tracer provider.
pub fn shutdown_telemetry() {
    opentelemetry::global::shutdown_tracer_provider();
}
