//! Tracing subscriber setup with layered architecture
//!
//! Bridges `tracing` spans to the OpenTelemetry provider held by a
//! [`Telemetry`] handle and prints logs to stdout:
//!
//! ```text
//! Registry
//!   ├── OpenTelemetry Layer (only when the handle is active, unfiltered)
//!   └── Fmt Layer (json or pretty)
//!         └── EnvFilter (RUST_LOG, else logging.level)
//! ```
//!
//! The log level filters log output only. RPC spans reach the provider at
//! any level, sampling alone decides what is exported.

use super::init::{Telemetry, TelemetryError};
use crate::config::{LogFormat, LoggingConfig};
use opentelemetry_sdk::trace::Tracer;
use tracing::Subscriber;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{fmt, EnvFilter, Layer};

/// OpenTelemetry layer exporting through `telemetry`
///
/// For callers assembling their own subscriber.
pub fn telemetry_layer<S>(telemetry: &Telemetry) -> OpenTelemetryLayer<S, Tracer>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    tracing_opentelemetry::layer().with_tracer(telemetry.tracer().clone())
}

/// Install the global `tracing` subscriber
///
/// Fails when a global subscriber is already set.
///
/// # Example
///
/// ```no_run
/// use currency_telemetry::config::TelemetryConfig;
/// use currency_telemetry::telemetry::{init_subscriber, init_telemetry};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = TelemetryConfig::from_env()?;
/// let telemetry = init_telemetry(&config)?;
/// init_subscriber(&config.logging, &telemetry)?;
/// # Ok(())
/// # }
/// ```
pub fn init_subscriber(config: &LoggingConfig, telemetry: &Telemetry) -> Result<(), TelemetryError> {
    let subscriber = build_subscriber(config, telemetry)?;

    tracing::subscriber::set_global_default(subscriber).map_err(|e| {
        TelemetryError::Subscriber(format!("may already be initialized: {}", e))
    })
}

/// The subscriber installed by [`init_subscriber`], without installing it
pub fn build_subscriber(
    config: &LoggingConfig,
    telemetry: &Telemetry,
) -> Result<impl Subscriber + Send + Sync + 'static, TelemetryError> {
    let env_filter = env_filter(config)?;

    let otel_layer = telemetry.is_active().then(|| telemetry_layer(telemetry));

    // Per-layer filter: the level applies to log output only
    let fmt_layer = match config.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_line_number(true)
            .with_filter(env_filter)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_target(true)
            .with_filter(env_filter)
            .boxed(),
    };

    Ok(tracing_subscriber::registry().with(otel_layer).with(fmt_layer))
}

fn env_filter(config: &LoggingConfig) -> Result<EnvFilter, TelemetryError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(&config.level).map_err(|e| {
        TelemetryError::Subscriber(format!("invalid log level '{}': {}", config.level, e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExporterKind, ProcessorMode, SamplingStrategy, TelemetryConfig};
    use crate::telemetry::GrpcTraceLayer;
    use futures::future::BoxFuture;
    use hyper::{Request, Response, Uri};
    use opentelemetry_sdk::export::trace::{ExportResult, SpanData, SpanExporter};
    use std::convert::Infallible;
    use std::sync::{Arc, Mutex};
    use tower::{service_fn, ServiceBuilder, ServiceExt};

    #[derive(Debug, Clone, Default)]
    struct Collect(Arc<Mutex<Vec<SpanData>>>);

    impl SpanExporter for Collect {
        fn export(&mut self, batch: Vec<SpanData>) -> BoxFuture<'static, ExportResult> {
            if let Ok(mut spans) = self.0.lock() {
                spans.extend(batch);
            }
            Box::pin(async { Ok(()) })
        }
    }

    #[test]
    fn test_subscriber_init_disabled() {
        let config = TelemetryConfig {
            enabled: false,
            ..Default::default()
        };
        let telemetry = Telemetry::disabled(&config);

        // May fail if another test set the global subscriber first
        let _ = init_subscriber(&config.logging, &telemetry);
    }

    #[test]
    fn test_env_filter_accepts_directives() {
        let config = LoggingConfig {
            level: "currency_telemetry=debug,info".into(),
            format: LogFormat::Pretty,
        };
        assert!(env_filter(&config).is_ok());
    }

    #[tokio::test]
    async fn test_rpc_spans_exported_at_warn_level() {
        let mut config = TelemetryConfig::default();
        config.exporter.kind = ExporterKind::None;
        config.sampling.strategy = SamplingStrategy::Always;
        config.processor.mode = ProcessorMode::Simple;
        config.logging.level = "warn".into();

        let exporter = Collect::default();
        let telemetry = Telemetry::with_exporter(&config, exporter.clone()).unwrap();
        let subscriber = build_subscriber(&config.logging, &telemetry).unwrap();
        let _guard = tracing::subscriber::set_default(subscriber);

        let service = ServiceBuilder::new()
            .layer(GrpcTraceLayer::server())
            .service(service_fn(|_request: Request<()>| async {
                Ok::<_, Infallible>(Response::new(()))
            }));
        let mut request = Request::new(());
        *request.uri_mut() = Uri::from_static("/hipstershop.CurrencyService/Convert");
        service.oneshot(request).await.unwrap();

        telemetry.force_flush().unwrap();
        let spans = exporter.0.lock().unwrap();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].name, "hipstershop.CurrencyService/Convert");
    }
}
