//! Shared test helpers
//!
//! - In-memory span exporter
//! - Configurations that keep every span

#![allow(dead_code)]

use currency_telemetry::config::{
    ExporterKind, ProcessorMode, SamplingStrategy, TelemetryConfig,
};
use futures::future::BoxFuture;
use opentelemetry_sdk::export::trace::{ExportResult, SpanData, SpanExporter};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Exporter keeping every span it receives
#[derive(Debug, Clone, Default)]
pub struct CollectingExporter {
    spans: Arc<Mutex<Vec<SpanData>>>,
}

impl CollectingExporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spans(&self) -> Vec<SpanData> {
        self.spans.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Poll until at least `count` spans arrived or `timeout` elapsed
    pub fn wait_for(&self, count: usize, timeout: Duration) -> Vec<SpanData> {
        let deadline = Instant::now() + timeout;
        loop {
            let spans = self.spans();
            if spans.len() >= count || Instant::now() >= deadline {
                return spans;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

impl SpanExporter for CollectingExporter {
    fn export(&mut self, batch: Vec<SpanData>) -> BoxFuture<'static, ExportResult> {
        if let Ok(mut spans) = self.spans.lock() {
            spans.extend(batch);
        }
        Box::pin(async { Ok(()) })
    }
}

/// Enabled configuration sampling every trace, exporter left to the caller
pub fn sample_everything(mode: ProcessorMode) -> TelemetryConfig {
    let mut config = TelemetryConfig::default();
    config.exporter.kind = ExporterKind::None;
    config.sampling.strategy = SamplingStrategy::Always;
    config.sampling.ratio = 1.0;
    config.processor.mode = mode;
    config
}
