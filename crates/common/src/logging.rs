//! Tracing setup shared by the bridge binaries.
//!
//! Logs always go to stdout, filtered by `RUST_LOG`. When an OTLP collector URL is configured,
//! spans are exported to it as well.

use std::env;

use opentelemetry::trace::TracerProvider;
use opentelemetry_otlp::WithExportConfig;
use tracing::*;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Collector endpoint for span export.
pub const OTLP_URL_ENVVAR: &str = "CATBRIDGE_OTLP_URL";

/// Label distinguishing several instances of the same service.
pub const SVC_LABEL_ENVVAR: &str = "CATBRIDGE_SVC_LABEL";

const TRACER_NAME: &str = "catbridge";

/// Settings for [`init`].
#[derive(Debug, Clone)]
pub struct LoggerConfig {
    whoami: String,
    otlp_url: Option<String>,
}

impl LoggerConfig {
    /// Logs to stdout only, as service `whoami`.
    pub fn new(whoami: String) -> Self {
        Self {
            whoami,
            otlp_url: None,
        }
    }

    /// Names the service `base`, suffixed with the label from [`SVC_LABEL_ENVVAR`] if set.
    pub fn with_base_name(base: &str) -> Self {
        let whoami = match env::var(SVC_LABEL_ENVVAR) {
            Ok(label) => format!("{base}%{label}"),
            Err(_) => base.to_owned(),
        };
        Self::new(whoami)
    }

    /// Also exports spans to the OTLP collector at `url`.
    pub fn set_otlp_url(&mut self, url: String) {
        self.otlp_url = Some(url);
    }

    /// The service name, logged once the subscriber is installed.
    pub fn whoami(&self) -> &str {
        &self.whoami
    }
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self::with_base_name("catbridge")
    }
}

/// Installs the global subscriber.
///
/// Must be called from within a tokio runtime when an OTLP URL is set. If the exporter cannot be
/// built, logging falls back to stdout alone.
pub fn init(config: LoggerConfig) {
    let stdout = tracing_subscriber::fmt::layer()
        .compact()
        .with_filter(EnvFilter::from_default_env());

    let (otel, otel_err) = match config.otlp_url.as_deref().map(otel_layer) {
        Some(Ok(layer)) => (Some(layer), None),
        Some(Err(err)) => (None, Some(err)),
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(stdout)
        .with(otel)
        .init();

    if let Some(err) = otel_err {
        warn!(%err, "span export disabled");
    }
    info!(whoami = %config.whoami, otlp_url = ?config.otlp_url, "logging started");
}

fn otel_layer<S>(
    url: &str,
) -> Result<impl Layer<S>, opentelemetry::trace::TraceError>
where
    S: Subscriber + for<'span> tracing_subscriber::registry::LookupSpan<'span>,
{
    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(url);
    let provider = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(exporter)
        .install_batch(opentelemetry_sdk::runtime::Tokio)?;

    let tracer = provider.tracer(TRACER_NAME);
    opentelemetry::global::set_tracer_provider(provider);
    Ok(tracing_opentelemetry::layer().with_tracer(tracer))
}

/// Flushes buffered spans and tears down the exporter.
pub fn finalize() {
    info!("shutting down logging");
    opentelemetry::global::shutdown_tracer_provider();
}

/// Reads [`OTLP_URL_ENVVAR`].
pub fn get_otlp_url_from_env() -> Option<String> {
    env::var(OTLP_URL_ENVVAR).ok()
}
