//! Span exporters
//!
//! Builds the exporter selected by [`ExporterConfig`]: the Application
//! Insights exporter, an OTLP gRPC exporter (feature `otlp`), or none.
//! Network exporters are bound to the Tokio runtime that builds them, see
//! [`runtime::RuntimeExporter`].

pub mod azure;
pub mod connection_string;
pub mod envelope;
pub mod runtime;

pub use azure::AzureMonitorExporter;
pub use connection_string::{ConnectionString, ConnectionStringError};
pub use runtime::RuntimeExporter;

use crate::config::{ExporterConfig, ExporterKind};
use futures::future::BoxFuture;
use opentelemetry::trace::TraceError;
use opentelemetry_sdk::export::trace::{ExportResult, SpanData, SpanExporter};
use std::time::Duration;
use thiserror::Error;

/// Errors raised while building an exporter
#[derive(Error, Debug)]
pub enum ExporterError {
    #[error("Invalid connection string: {0}")]
    ConnectionString(#[from] ConnectionStringError),

    #[error("Failed to build ingestion client: {0}")]
    Client(#[from] reqwest::Error),

    #[error("Failed to build OTLP exporter: {0}")]
    Otlp(#[from] TraceError),

    #[error("Exporter '{0}' is not available in this build")]
    Unsupported(&'static str),

    #[error("Network exporters must be created inside a Tokio runtime")]
    NoRuntime,

    #[error("Network exporters need the multi-thread Tokio runtime, a flush would block the only worker")]
    CurrentThreadRuntime,
}

/// The exporter selected by configuration
#[derive(Debug)]
pub enum ServiceExporter {
    AzureMonitor(AzureMonitorExporter),
    #[cfg(feature = "otlp")]
    Otlp(opentelemetry_otlp::SpanExporter),
}

impl ServiceExporter {
    /// Build the configured exporter, bound to the current Tokio runtime
    ///
    /// Returns `Ok(None)` for [`ExporterKind::None`].
    pub fn from_config(
        config: &ExporterConfig,
    ) -> Result<Option<RuntimeExporter<ServiceExporter>>, ExporterError> {
        if config.kind == ExporterKind::None {
            return Ok(None);
        }
        // tonic channels spawn onto the runtime while being built
        let handle = runtime::current_handle()?;
        let timeout = Duration::from_secs(config.timeout_seconds);

        let exporter = match config.kind {
            ExporterKind::None => return Ok(None),
            ExporterKind::AzureMonitor => {
                let connection = ConnectionString::parse(
                    config.connection_string.as_deref().unwrap_or_default(),
                )?;
                ServiceExporter::AzureMonitor(AzureMonitorExporter::new(connection, timeout)?)
            }
            ExporterKind::Otlp => Self::otlp(&config.otlp_endpoint, timeout)?,
        };

        Ok(Some(RuntimeExporter::new(exporter, handle)?))
    }

    #[cfg(feature = "otlp")]
    fn otlp(endpoint: &str, timeout: Duration) -> Result<Self, ExporterError> {
        use opentelemetry_otlp::WithExportConfig;

        let exporter = opentelemetry_otlp::new_exporter()
            .tonic()
            .with_endpoint(endpoint)
            .with_timeout(timeout)
            .build_span_exporter()?;
        Ok(ServiceExporter::Otlp(exporter))
    }

    #[cfg(not(feature = "otlp"))]
    fn otlp(_endpoint: &str, _timeout: Duration) -> Result<Self, ExporterError> {
        Err(ExporterError::Unsupported("otlp"))
    }

    /// Human readable destination, credential excluded
    pub fn destination(&self) -> String {
        match self {
            ServiceExporter::AzureMonitor(exporter) => exporter.track_url().to_string(),
            #[cfg(feature = "otlp")]
            ServiceExporter::Otlp(_) => "otlp".to_string(),
        }
    }
}

impl SpanExporter for ServiceExporter {
    fn export(&mut self, batch: Vec<SpanData>) -> BoxFuture<'static, ExportResult> {
        match self {
            ServiceExporter::AzureMonitor(exporter) => exporter.export(batch),
            #[cfg(feature = "otlp")]
            ServiceExporter::Otlp(exporter) => exporter.export(batch),
        }
    }

    fn shutdown(&mut self) {
        match self {
            ServiceExporter::AzureMonitor(exporter) => exporter.shutdown(),
            #[cfg(feature = "otlp")]
            ServiceExporter::Otlp(exporter) => exporter.shutdown(),
        }
    }
}
