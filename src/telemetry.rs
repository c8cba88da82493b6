//! OpenTelemetry tracing init.
//!
//! Exports traces to an OTLP-compatible backend (Jaeger, Tempo, etc.) when
//! enabled, otherwise falls back to plain `tracing-subscriber` stdout
//! logging. Ported near-verbatim from the teacher's telemetry module,
//! repointed at this engine's service name.

use anyhow::{Context, Result};
use opentelemetry::{
    global,
    trace::{TraceError, TracerProvider as _},
    KeyValue,
};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    trace::{self, RandomIdGenerator, Sampler},
    Resource,
};
use opentelemetry_semantic_conventions as semconv;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub service_version: String,
    pub environment: String,
    /// OTLP endpoint, e.g. `http://localhost:4317`.
    pub otlp_endpoint: String,
    pub enabled: bool,
    pub sampling_rate: f64,
    pub enable_stdout: bool,
    pub log_level: String,
    pub resource_attributes: Vec<(String, String)>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "review-engine".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            environment: "development".to_string(),
            otlp_endpoint: "http://localhost:4317".to_string(),
            enabled: false,
            sampling_rate: 1.0,
            enable_stdout: true,
            log_level: "info".to_string(),
            resource_attributes: Vec::new(),
        }
    }
}

impl TelemetryConfig {
    pub fn production(otlp_endpoint: String) -> Self {
        Self {
            environment: "production".to_string(),
            otlp_endpoint,
            enabled: true,
            sampling_rate: 0.1,
            enable_stdout: false,
            log_level: "warn".to_string(),
            ..Self::default()
        }
    }

    pub fn with_attribute(mut self, key: String, value: String) -> Self {
        self.resource_attributes.push((key, value));
        self
    }
}

/// Initialize tracing for the process. Idempotent failure mode: OTLP pipeline
/// errors are propagated (startup should fail loudly rather than run with
/// half-configured telemetry), but `enabled: false` always succeeds.
pub async fn init(config: TelemetryConfig) -> Result<()> {
    if !config.enabled {
        init_basic_logging(&config);
        return Ok(());
    }

    let resource = build_resource(&config);

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(&config.otlp_endpoint),
        )
        .with_trace_config(
            trace::config()
                .with_sampler(Sampler::TraceIdRatioBased(config.sampling_rate))
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(resource),
        )
        .install_batch(opentelemetry_sdk::runtime::Tokio)
        .context("failed to install OTLP tracer")?;

    let telemetry_layer = tracing_opentelemetry::layer().with_tracer(tracer);
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(env_filter).with(telemetry_layer);

    if config.enable_stdout {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_level(true)
            .with_filter(EnvFilter::new(&config.log_level));
        subscriber.with(fmt_layer).init();
    } else {
        subscriber.init();
    }

    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        environment = %config.environment,
        "telemetry initialized"
    );

    Ok(())
}

fn init_basic_logging(config: &TelemetryConfig) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_level(true),
        )
        .init();
}

fn build_resource(config: &TelemetryConfig) -> Resource {
    let mut attributes = vec![
        KeyValue::new(semconv::resource::SERVICE_NAME, config.service_name.clone()),
        KeyValue::new(semconv::resource::SERVICE_VERSION, config.service_version.clone()),
        KeyValue::new(semconv::resource::DEPLOYMENT_ENVIRONMENT, config.environment.clone()),
    ];
    for (key, value) in &config.resource_attributes {
        attributes.push(KeyValue::new(key.clone(), value.clone()));
    }
    Resource::new(attributes)
}

pub async fn shutdown() {
    global::shutdown_tracer_provider();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_config_never_touches_otlp() {
        let config = TelemetryConfig { enabled: false, ..Default::default() };
        assert!(init(config).await.is_ok());
    }

    #[test]
    fn defaults_are_development() {
        let config = TelemetryConfig::default();
        assert_eq!(config.service_name, "review-engine");
        assert_eq!(config.environment, "development");
        assert!(!config.enabled);
    }

    #[test]
    fn production_lowers_sampling_and_disables_stdout() {
        let config = TelemetryConfig::production("http://otel:4317".to_string());
        assert_eq!(config.environment, "production");
        assert!(config.enabled);
        assert_eq!(config.sampling_rate, 0.1);
        assert!(!config.enable_stdout);
    }
}
