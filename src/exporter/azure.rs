//! Azure Monitor (Application Insights) span exporter
//!
//! Converts finished spans to Application Insights envelopes and posts
//! them as one JSON array per export call. Delivery is best effort: a
//! failed call is logged, counted and reported to the SDK, never retried.

use super::connection_string::ConnectionString;
use super::envelope::{span_to_envelopes, Envelope};
use super::ExporterError;
use crate::metrics;
use futures::future::BoxFuture;
use opentelemetry::trace::TraceError;
use opentelemetry_sdk::export::trace::{ExportResult, SpanData, SpanExporter};
use serde::Deserialize;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// Why an ingestion call did not go through
#[derive(Error, Debug)]
pub enum IngestionError {
    #[error("Failed to reach ingestion endpoint: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Ingestion endpoint rejected {items} items with status {status}: {body}")]
    Rejected {
        status: u16,
        items: usize,
        body: String,
    },

    #[error("Exporter is shut down")]
    ShutDown,
}

impl From<IngestionError> for TraceError {
    fn from(err: IngestionError) -> Self {
        TraceError::Other(Box::new(err))
    }
}

/// Body of a `206 Partial Content` answer
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrackResponse {
    #[serde(default)]
    items_received: usize,
    #[serde(default)]
    items_accepted: usize,
    #[serde(default)]
    errors: Vec<TrackItemError>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrackItemError {
    index: usize,
    status_code: u16,
    #[serde(default)]
    message: String,
}

/// Span exporter for the Application Insights ingestion endpoint
#[derive(Debug)]
pub struct AzureMonitorExporter {
    connection: ConnectionString,
    track_url: String,
    client: reqwest::Client,
    is_shutdown: bool,
}

impl AzureMonitorExporter {
    /// Create an exporter bound to the endpoint and key of `connection`
    ///
    /// Every ingestion call is bounded by `timeout`.
    pub fn new(connection: ConnectionString, timeout: Duration) -> Result<Self, ExporterError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("currency-telemetry/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            track_url: connection.track_url(),
            connection,
            client,
            is_shutdown: false,
        })
    }

    pub fn instrumentation_key(&self) -> &str {
        self.connection.instrumentation_key()
    }

    pub fn ingestion_endpoint(&self) -> &str {
        self.connection.ingestion_endpoint()
    }

    pub fn live_endpoint(&self) -> &str {
        self.connection.live_endpoint()
    }

    pub fn track_url(&self) -> &str {
        &self.track_url
    }

    /// Envelopes for a batch, in span order
    pub fn envelopes(&self, batch: &[SpanData]) -> Vec<Envelope> {
        batch
            .iter()
            .flat_map(|span| span_to_envelopes(span, self.connection.instrumentation_key()))
            .collect()
    }
}

impl SpanExporter for AzureMonitorExporter {
    fn export(&mut self, batch: Vec<SpanData>) -> BoxFuture<'static, ExportResult> {
        if self.is_shutdown {
            return Box::pin(std::future::ready(Err(TraceError::from(IngestionError::ShutDown))));
        }

        let envelopes = self.envelopes(&batch);
        if envelopes.is_empty() {
            return Box::pin(std::future::ready(Ok(())));
        }

        let client = self.client.clone();
        let url = self.track_url.clone();
        Box::pin(async move { send(client, url, envelopes).await.map_err(TraceError::from) })
    }

    fn shutdown(&mut self) {
        self.is_shutdown = true;
    }
}

async fn send(
    client: reqwest::Client,
    url: String,
    envelopes: Vec<Envelope>,
) -> Result<(), IngestionError> {
    let items = envelopes.len();
    let started = Instant::now();
    let result = client.post(&url).json(&envelopes).send().await;
    metrics::record_export_duration(started.elapsed().as_secs_f64());

    let response = match result {
        Ok(response) => response,
        Err(e) => {
            metrics::record_export_failure("transport");
            warn!(error = %e, items, "Telemetry export failed");
            return Err(e.into());
        }
    };

    match response.status().as_u16() {
        200 => {
            metrics::record_items(items, 0);
            debug!(items, "Telemetry exported");
            Ok(())
        }
        206 => {
            let accepted = match response.json::<TrackResponse>().await {
                Ok(body) => {
                    for error in &body.errors {
                        warn!(
                            index = error.index,
                            status = error.status_code,
                            message = %error.message,
                            "Telemetry item rejected"
                        );
                    }
                    debug!(
                        received = body.items_received,
                        accepted = body.items_accepted,
                        "Telemetry partially accepted"
                    );
                    body.items_accepted.min(items)
                }
                Err(_) => 0,
            };
            metrics::record_items(accepted, items - accepted);
            Ok(())
        }
        status => {
            let body = response.text().await.unwrap_or_default();
            metrics::record_items(0, items);
            metrics::record_export_failure("rejected");
            warn!(status, items, "Telemetry export rejected");
            Err(IngestionError::Rejected {
                status,
                items,
                body,
            })
        }
    }
}
