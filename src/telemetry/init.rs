//! Tracer provider initialization and lifecycle management
//!
//! [`init_telemetry`] runs the startup sequence: exporter, sampler,
//! resource, span processor. The result is a [`Telemetry`] handle that the
//! caller passes to whatever needs a tracer. Registering the provider as
//! the process-wide default is a separate, explicit step
//! ([`Telemetry::install_global`]).

use crate::config::{ProcessorMode, TelemetryConfig};
use crate::exporter::{ExporterError, ServiceExporter};
use crate::telemetry::sampling::ServiceSampler;
use opentelemetry::global;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{Key, KeyValue, Value};
use opentelemetry_sdk::export::trace::SpanExporter;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::runtime;
use opentelemetry_sdk::trace::{
    self as sdktrace, BatchConfig as SdkBatchConfig, BatchSpanProcessor, Sampler, Tracer,
    TracerProvider,
};
use opentelemetry_sdk::Resource;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::RuntimeFlavor;
use tracing::{debug, info, warn};

/// Set once the first handle has been installed as the global provider
static GLOBAL_INSTALLED: AtomicBool = AtomicBool::new(false);

/// Errors that can occur during telemetry initialization
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Failed to initialize exporter: {0}")]
    Exporter(#[from] ExporterError),

    #[error("Failed to initialize tracer provider: {0}")]
    Provider(String),

    #[error("A tracer provider is already installed for this process")]
    AlreadyInstalled,

    #[error("Failed to set global subscriber: {0}")]
    Subscriber(String),
}

/// Handle to an initialized tracing pipeline
///
/// Flushes and shuts the provider down when dropped, so pending spans are
/// exported before the application exits.
#[derive(Debug)]
pub struct Telemetry {
    provider: Option<TracerProvider>,
    tracer: Tracer,
    resource: Resource,
    service_name: String,
    active: bool,
    installed: bool,
}

/// Initialize the tracing pipeline described by `config`
///
/// A disabled configuration yields an inactive handle whose tracer drops
/// every span. Network exporters and the batch processor need the
/// multi-thread Tokio runtime: flushing blocks the caller while the export
/// runs on another worker.
///
/// # Example
///
/// ```no_run
/// use currency_telemetry::config::TelemetryConfig;
/// use currency_telemetry::telemetry::init_telemetry;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = TelemetryConfig::from_env()?;
/// let mut telemetry = init_telemetry(&config)?;
/// telemetry.install_global()?;
/// # Ok(())
/// # }
/// ```
pub fn init_telemetry(config: &TelemetryConfig) -> Result<Telemetry, TelemetryError> {
    if !config.enabled {
        info!("Tracing disabled");
        return Ok(Telemetry::disabled(config));
    }

    match ServiceExporter::from_config(&config.exporter)? {
        Some(exporter) => {
            info!(
                destination = %exporter.inner().destination(),
                "Span exporter configured"
            );
            Telemetry::with_exporter(config, exporter)
        }
        None => {
            info!("No span exporter configured, spans are sampled but not shipped");
            build(config, None::<ServiceExporter>)
        }
    }
}

impl Telemetry {
    /// Wire `exporter` into a provider configured by `config`
    pub fn with_exporter<E>(config: &TelemetryConfig, exporter: E) -> Result<Self, TelemetryError>
    where
        E: SpanExporter + 'static,
    {
        if !config.enabled {
            return Ok(Self::disabled(config));
        }
        build(config, Some(exporter))
    }

    /// Inactive handle: no processor, every span dropped
    pub fn disabled(config: &TelemetryConfig) -> Self {
        let resource = service_resource(config);
        let provider = TracerProvider::builder()
            .with_config(
                sdktrace::config()
                    .with_sampler(Sampler::AlwaysOff)
                    .with_resource(resource.clone()),
            )
            .build();
        let tracer = provider.tracer(env!("CARGO_PKG_NAME"));

        Self {
            provider: Some(provider),
            tracer,
            resource,
            service_name: config.service_name.clone(),
            active: false,
            installed: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Resource attached to every span of this provider
    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    /// Value of one resource attribute
    pub fn resource_attribute(&self, key: &str) -> Option<Value> {
        self.resource.get(Key::new(key.to_string()))
    }

    /// The provider, `None` once shut down
    pub fn provider(&self) -> Option<&TracerProvider> {
        self.provider.as_ref()
    }

    /// Tracer for spans created through this handle
    pub fn tracer(&self) -> &Tracer {
        &self.tracer
    }

    /// Export every finished span still held by the processor
    pub fn force_flush(&self) -> Result<(), TelemetryError> {
        if let Some(provider) = &self.provider {
            for result in provider.force_flush() {
                result.map_err(|e| TelemetryError::Provider(e.to_string()))?;
            }
        }
        Ok(())
    }

    /// Register this provider as the process-wide default
    ///
    /// Also installs the W3C trace context propagator for code that reads
    /// the global propagator. Only the first call in a process succeeds.
    pub fn install_global(&mut self) -> Result<(), TelemetryError> {
        let provider = self
            .provider
            .as_ref()
            .ok_or_else(|| TelemetryError::Provider("provider is shut down".into()))?;

        if GLOBAL_INSTALLED
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(TelemetryError::AlreadyInstalled);
        }

        global::set_text_map_propagator(TraceContextPropagator::new());
        let _previous = global::set_tracer_provider(provider.clone());
        self.installed = true;

        info!(service = %self.service_name, "Tracer provider installed globally");
        Ok(())
    }

    /// Whether [`Telemetry::install_global`] succeeded on this handle
    pub fn is_installed(&self) -> bool {
        self.installed
    }

    /// Flush pending spans and release the provider
    ///
    /// The processor and exporter shut down once the last provider
    /// reference, the global one included, is gone.
    pub fn shutdown(mut self) -> Result<(), TelemetryError> {
        let flushed = self.force_flush();
        self.release();
        flushed
    }

    fn release(&mut self) {
        if self.provider.take().is_some() && self.installed {
            global::shutdown_tracer_provider();
            self.installed = false;
        }
        self.active = false;
    }
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        if self.provider.is_none() {
            return;
        }
        if self.active {
            if let Err(e) = self.force_flush() {
                warn!(error = %e, "Failed to flush spans on shutdown");
            }
        }
        self.release();
    }
}

impl TelemetryError {
    /// Whether a `fail_open` configuration may continue past this error
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, TelemetryError::AlreadyInstalled)
    }
}

fn build<E>(config: &TelemetryConfig, exporter: Option<E>) -> Result<Telemetry, TelemetryError>
where
    E: SpanExporter + 'static,
{
    let resource = service_resource(config);
    let sampler = ServiceSampler::from_config(&config.sampling);
    let sdk_config = sdktrace::config()
        .with_sampler(sampler)
        .with_resource(resource.clone());

    let mut builder = TracerProvider::builder().with_config(sdk_config);

    if let Some(exporter) = exporter {
        builder = match config.processor.mode {
            ProcessorMode::Simple => builder.with_simple_exporter(exporter),
            ProcessorMode::Batch => {
                // The flush blocks on the batch task, which needs a free worker
                match tokio::runtime::Handle::try_current() {
                    Err(_) => {
                        return Err(TelemetryError::Provider(
                            "batch span processor requires a Tokio runtime".into(),
                        ))
                    }
                    Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::CurrentThread => {
                        return Err(TelemetryError::Provider(
                            "batch span processor requires the multi-thread Tokio runtime".into(),
                        ))
                    }
                    Ok(_) => {}
                }
                let batch = &config.processor.batch;
                let batch_config = SdkBatchConfig::default()
                    .with_max_queue_size(batch.max_queue_size)
                    .with_scheduled_delay(Duration::from_millis(batch.scheduled_delay_millis))
                    .with_max_export_batch_size(batch.max_export_batch_size)
                    .with_max_export_timeout(Duration::from_secs(config.exporter.timeout_seconds));
                let processor = BatchSpanProcessor::builder(exporter, runtime::Tokio)
                    .with_batch_config(batch_config)
                    .build();
                builder.with_span_processor(processor)
            }
        };
    }

    let provider = builder.build();
    let tracer = provider.tracer(env!("CARGO_PKG_NAME"));

    debug!(
        service = %config.service_name,
        strategy = ?config.sampling.strategy,
        ratio = config.sampling.ratio,
        processor = ?config.processor.mode,
        "Tracer provider built"
    );

    Ok(Telemetry {
        provider: Some(provider),
        tracer,
        resource,
        service_name: config.service_name.clone(),
        active: true,
        installed: false,
    })
}

/// SDK defaults merged with the service name and configured attributes
fn service_resource(config: &TelemetryConfig) -> Resource {
    let mut attributes = vec![KeyValue::new("service.name", config.service_name.clone())];
    let mut extra: Vec<_> = config.resource_attributes.iter().collect();
    extra.sort();
    attributes.extend(
        extra
            .into_iter()
            .filter(|(key, _)| key.as_str() != "service.name")
            .map(|(key, value)| KeyValue::new(key.clone(), value.clone())),
    );

    Resource::default().merge(&Resource::new(attributes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use opentelemetry::trace::{Span, Tracer as _};
    use opentelemetry_sdk::export::trace::{ExportResult, SpanData};

    #[derive(Debug)]
    struct DiscardExporter;

    impl SpanExporter for DiscardExporter {
        fn export(&mut self, _batch: Vec<SpanData>) -> BoxFuture<'static, ExportResult> {
            Box::pin(async { Ok(()) })
        }
    }

    fn disabled_config() -> TelemetryConfig {
        TelemetryConfig {
            enabled: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_disabled_handle_is_inactive() {
        let telemetry = init_telemetry(&disabled_config()).unwrap();
        assert!(!telemetry.is_active());
        assert_eq!(
            telemetry.resource_attribute("service.name"),
            Some(Value::from("currencyservice"))
        );

        let span = telemetry.tracer().start("noop");
        assert!(!span.span_context().is_sampled());
    }

    #[test]
    fn test_resource_merges_extra_attributes() {
        let mut config = disabled_config();
        config
            .resource_attributes
            .insert("deployment.environment".into(), "test".into());
        config
            .resource_attributes
            .insert("service.name".into(), "ignored".into());

        let resource = service_resource(&config);
        assert_eq!(
            resource.get(Key::new("service.name")),
            Some(Value::from("currencyservice"))
        );
        assert_eq!(
            resource.get(Key::new("deployment.environment")),
            Some(Value::from("test"))
        );
        assert!(resource.get(Key::new("telemetry.sdk.name")).is_some());
    }

    #[test]
    fn test_batch_without_runtime_fails() {
        let config = TelemetryConfig::default();
        let result = Telemetry::with_exporter(&config, DiscardExporter);
        assert!(matches!(result, Err(TelemetryError::Provider(_))));
    }

    #[tokio::test]
    async fn test_batch_on_current_thread_runtime_fails() {
        let config = TelemetryConfig::default();
        let result = Telemetry::with_exporter(&config, DiscardExporter);
        match result {
            Err(TelemetryError::Provider(message)) => assert!(message.contains("multi-thread")),
            other => panic!("unexpected result {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_shutdown_releases_provider() {
        let telemetry = init_telemetry(&disabled_config()).unwrap();
        assert!(telemetry.provider().is_some());
        assert!(telemetry.shutdown().is_ok());
    }

    #[test]
    fn test_already_installed_is_not_recoverable() {
        assert!(!TelemetryError::AlreadyInstalled.is_recoverable());
        assert!(TelemetryError::Provider("x".into()).is_recoverable());
    }
}
