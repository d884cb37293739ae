//! Observability
//!
//! Structured logs to stdout and to a daily-rolling file, plus OpenTelemetry
//! span export when an OTLP endpoint is configured.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_sdk::{propagation::TraceContextPropagator, runtime, trace as sdktrace, Resource};
use std::path::Path;
use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

pub const DEFAULT_FILTER: &str = "fleet_orchestrator=info,tower_http=info";

/// Keeps the file writer alive and flushes spans on drop.
pub struct TelemetryGuard {
    _file: WorkerGuard,
    otel: bool,
}

impl TelemetryGuard {
    pub fn exports_spans(&self) -> bool {
        self.otel
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if self.otel {
            global::shutdown_tracer_provider();
        }
    }
}

pub fn init_telemetry(service_name: &str, log_dir: impl AsRef<Path>) -> anyhow::Result<TelemetryGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let appender = tracing_appender::rolling::daily(log_dir, format!("{}.log", service_name));
    let (writer, file_guard) = tracing_appender::non_blocking(appender);

    let otel_layer = match std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
        Ok(_) => Some(otel_layer(service_name)?),
        Err(_) => None,
    };
    let otel = otel_layer.is_some();

    Registry::default()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .with(fmt::layer().with_ansi(false).with_writer(writer))
        .with(otel_layer)
        .try_init()?;

    Ok(TelemetryGuard { _file: file_guard, otel })
}

fn otel_layer<S>(service_name: &str) -> anyhow::Result<OpenTelemetryLayer<S, sdktrace::Tracer>>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    global::set_text_map_propagator(TraceContextPropagator::new());

    let exporter = opentelemetry_otlp::new_exporter().tonic().build_span_exporter()?;
    let trace_config = sdktrace::Config::default().with_resource(Resource::new(vec![KeyValue::new(
        "service.name",
        service_name.to_string(),
    )]));

    let provider = sdktrace::TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_config(trace_config)
        .build();
    global::set_tracer_provider(provider.clone());

    let tracer = provider.tracer(service_name.to_string());
    Ok(tracing_opentelemetry::layer().with_tracer(tracer))
}
