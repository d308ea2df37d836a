//! Observability setup for Autoflow: structured `tracing` output with an
//! optional OpenTelemetry span export.

pub mod tracing_setup;
