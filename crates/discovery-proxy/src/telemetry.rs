//! OpenTelemetry integration for distributed tracing
//!
//! Spans from the proxy's `tracing` instrumentation are exported over OTLP
//! when telemetry is enabled; otherwise only the local log layer is installed.

use crate::config::{LoggingSettings, OtlpProtocol, TelemetrySettings};
use common::Error;
use opentelemetry::{KeyValue, trace::TracerProvider as _};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    Resource, runtime,
    trace::{RandomIdGenerator, Sampler, Tracer, TracerProvider},
};
use tracing_subscriber::{Layer, layer::SubscriberExt, util::SubscriberInitExt};

/// OpenTelemetry tracer guard
///
/// When dropped, flushes all pending spans and shuts down the tracer
pub struct TelemetryGuard;

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        opentelemetry::global::shutdown_tracer_provider();
    }
}

/// Initialize the OTLP exporter and tracer provider
///
/// Returns `None` when telemetry is disabled. The guard must be kept alive
/// for the duration of the program.
pub fn init_telemetry(settings: &TelemetrySettings) -> common::Result<Option<(TelemetryGuard, Tracer)>> {
    if !settings.enabled {
        return Ok(None);
    }

    let exporter = match settings.protocol {
        OtlpProtocol::Grpc => opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(settings.otlp_endpoint.as_str())
            .build(),
        OtlpProtocol::Http => opentelemetry_otlp::SpanExporter::builder()
            .with_http()
            .with_endpoint(settings.otlp_endpoint.as_str())
            .build(),
    }
    .map_err(|e| Error::other(format!("failed to build OTLP exporter: {}", e)))?;

    let resource = Resource::new(vec![
        KeyValue::new("service.name", settings.service_name.clone()),
        KeyValue::new("service.version", env!("CARGO_PKG_VERSION").to_string()),
    ]);

    let provider = TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_config(
            opentelemetry_sdk::trace::Config::default()
                .with_sampler(Sampler::AlwaysOn)
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(resource),
        )
        .build();

    let tracer = provider.tracer(settings.service_name.clone());
    opentelemetry::global::set_tracer_provider(provider);

    Ok(Some((TelemetryGuard, tracer)))
}

/// Setup tracing-subscriber, with an OpenTelemetry layer when enabled
pub fn setup_tracing_with_otel(
    telemetry: &TelemetrySettings,
    logging: &LoggingSettings,
) -> common::Result<Option<TelemetryGuard>> {
    let Some((guard, tracer)) = init_telemetry(telemetry)? else {
        common::logging::init_with(logging.level(), logging.is_json());
        tracing::info!("Tracing initialized without OpenTelemetry");
        return Ok(None);
    };

    let fmt_layer = if logging.is_json() {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(tracing_opentelemetry::layer().with_tracer(tracer))
        .with(common::logging::env_filter(logging.level()))
        .init();

    tracing::info!(
        service_name = %telemetry.service_name,
        otlp_endpoint = %telemetry.otlp_endpoint,
        protocol = ?telemetry.protocol,
        "Tracing initialized with OpenTelemetry integration"
    );

    Ok(Some(guard))
}
