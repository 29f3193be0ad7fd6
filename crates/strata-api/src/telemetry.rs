//! Tracing setup.
//!
//! JSON logs filtered by `RUST_LOG` (default `info`). When an OTLP endpoint
//! is configured, spans are also exported over gRPC.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::error::AppError;

const SERVICE_NAME: &str = "strata-api";

/// Handle to the span exporter. Call [`Telemetry::shutdown`] before exit
/// so buffered spans are flushed.
pub struct Telemetry {
    provider: Option<SdkTracerProvider>,
}

impl Telemetry {
    /// Flushes and stops the span exporter, if any.
    pub fn shutdown(self) {
        let Some(provider) = self.provider else {
            return;
        };
        if let Err(e) = provider.shutdown() {
            tracing::warn!(error = %e, "tracer provider shutdown failed");
        }
    }
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Installs the global tracing subscriber.
///
/// # Errors
///
/// Returns `AppError::Telemetry` if the exporter cannot be built or a
/// subscriber is already installed.
pub fn init(otlp_endpoint: Option<&str>) -> Result<Telemetry, AppError> {
    let fmt_layer = tracing_subscriber::fmt::layer().json();

    let Some(endpoint) = otlp_endpoint else {
        tracing_subscriber::registry()
            .with(env_filter())
            .with(fmt_layer)
            .try_init()
            .map_err(|e| AppError::Telemetry(e.to_string()))?;
        return Ok(Telemetry { provider: None });
    };

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| AppError::Telemetry(e.to_string()))?;
    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(Resource::builder().with_service_name(SERVICE_NAME).build())
        .build();
    let tracer = provider.tracer(SERVICE_NAME);

    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt_layer)
        .with(tracing_opentelemetry::layer().with_tracer(tracer))
        .try_init()
        .map_err(|e| AppError::Telemetry(e.to_string()))?;

    Ok(Telemetry {
        provider: Some(provider),
    })
}
