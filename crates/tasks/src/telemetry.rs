//! Tracing and OpenTelemetry setup
//!
//! Console logging through `tracing-subscriber` filtered by `RUST_LOG` or
//! `LOG_LEVEL`, plus an OTLP span exporter when
//! `OTEL_EXPORTER_OTLP_ENDPOINT` is set.

use std::time::Duration;

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_otlp::{SpanExporter, WithExportConfig};
use opentelemetry_sdk::trace::{RandomIdGenerator, Sampler, SdkTracerProvider};
use opentelemetry_sdk::Resource;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_SERVICE_NAME: &str = "castplan-tasks";

/// Telemetry configuration
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub service_version: Option<String>,
    /// e.g. `http://localhost:4317`
    pub otlp_endpoint: Option<String>,
    pub enable_console: bool,
    /// `EnvFilter` directives, e.g. `castplan_tasks=debug`
    pub log_filter: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            service_version: Some(env!("CARGO_PKG_VERSION").to_string()),
            otlp_endpoint: None,
            enable_console: true,
            log_filter: None,
        }
    }
}

impl TelemetryConfig {
    /// Read `OTEL_SERVICE_NAME`, `OTEL_SERVICE_VERSION`,
    /// `OTEL_EXPORTER_OTLP_ENDPOINT` and `RUST_LOG` / `LOG_LEVEL`
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Self {
            service_name: lookup("OTEL_SERVICE_NAME").unwrap_or(defaults.service_name),
            service_version: lookup("OTEL_SERVICE_VERSION").or(defaults.service_version),
            otlp_endpoint: lookup("OTEL_EXPORTER_OTLP_ENDPOINT").filter(|e| !e.trim().is_empty()),
            enable_console: true,
            log_filter: lookup("RUST_LOG").or_else(|| lookup("LOG_LEVEL")),
        }
    }

    pub fn with_service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = name.into();
        self
    }

    pub fn with_log_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = Some(filter.into());
        self
    }
}

/// Shuts the tracer provider down on drop
///
/// Keep it alive for the lifetime of the process so buffered spans flush.
pub struct TelemetryGuard {
    provider: Option<SdkTracerProvider>,
}

impl TelemetryGuard {
    pub fn otlp_enabled(&self) -> bool {
        self.provider.is_some()
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.provider.take() {
            if let Err(e) = provider.shutdown() {
                eprintln!("Failed to shut down tracer provider: {e:?}");
            }
        }
    }
}

/// Install the global subscriber
///
/// A second call leaves the existing subscriber in place.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let filter = config
        .log_filter
        .as_deref()
        .and_then(|f| EnvFilter::try_new(f).ok())
        .unwrap_or_else(|| EnvFilter::new("info"));

    let console_layer = config.enable_console.then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_filter(filter)
    });

    let mut attributes = vec![KeyValue::new("service.name", config.service_name.clone())];
    if let Some(version) = &config.service_version {
        attributes.push(KeyValue::new("service.version", version.clone()));
    }
    let resource = Resource::builder().with_attributes(attributes).build();

    let (provider, otel_layer, otel_status) = match &config.otlp_endpoint {
        Some(endpoint) => match build_otlp_provider(endpoint, resource) {
            Ok(provider) => {
                let tracer = provider.tracer(DEFAULT_SERVICE_NAME);
                let layer = tracing_opentelemetry::layer().with_tracer(tracer);
                (Some(provider), Some(layer), Some(Ok(endpoint.clone())))
            }
            Err(e) => (None, None, Some(Err(e.to_string()))),
        },
        None => (None, None, None),
    };

    let installed = tracing_subscriber::registry()
        .with(console_layer)
        .with(otel_layer)
        .try_init()
        .is_ok();

    if installed {
        match otel_status {
            Some(Ok(endpoint)) => tracing::info!(endpoint = %endpoint, "OpenTelemetry tracing enabled"),
            Some(Err(e)) => tracing::warn!(error = %e, "Failed to initialize OTLP exporter, continuing without it"),
            None => tracing::debug!("OpenTelemetry tracing disabled, OTEL_EXPORTER_OTLP_ENDPOINT not set"),
        }
    }

    TelemetryGuard { provider }
}

fn build_otlp_provider(
    endpoint: &str,
    resource: Resource,
) -> Result<SdkTracerProvider, Box<dyn std::error::Error + Send + Sync>> {
    let exporter = SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .with_timeout(Duration::from_secs(10))
        .build()?;

    Ok(SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_sampler(Sampler::AlwaysOn)
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(resource)
        .build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_from_lookup() {
        let env: HashMap<&str, &str> = [
            ("OTEL_SERVICE_NAME", "render-workers"),
            ("LOG_LEVEL", "debug"),
            ("OTEL_EXPORTER_OTLP_ENDPOINT", " "),
        ]
        .into_iter()
        .collect();

        let config = TelemetryConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.service_name, "render-workers");
        assert_eq!(config.log_filter.as_deref(), Some("debug"));
        assert!(config.otlp_endpoint.is_none());
    }

    #[test]
    fn test_rust_log_wins_over_log_level() {
        let config = TelemetryConfig::from_lookup(|k| match k {
            "RUST_LOG" => Some("castplan_tasks=trace".to_string()),
            "LOG_LEVEL" => Some("warn".to_string()),
            _ => None,
        });
        assert_eq!(config.log_filter.as_deref(), Some("castplan_tasks=trace"));
        assert_eq!(config.service_name, DEFAULT_SERVICE_NAME);
    }

    #[test]
    fn test_init_without_endpoint_has_no_provider() {
        let guard = init_telemetry(TelemetryConfig::default().with_log_filter("off"));
        assert!(!guard.otlp_enabled());
    }
}
