//! Application Insights connection strings
//!
//! A connection string bundles the credential and both endpoints:
//!
//! ```text
//! InstrumentationKey=00000000-0000-0000-0000-000000000000;IngestionEndpoint=https://eastus2-3.in.applicationinsights.azure.com/;LiveEndpoint=https://eastus2.livediagnostics.monitor.azure.com/
//! ```

use std::fmt;
use thiserror::Error;

const DEFAULT_INGESTION_ENDPOINT: &str = "https://dc.services.visualstudio.com";
const DEFAULT_LIVE_ENDPOINT: &str = "https://rt.services.visualstudio.com";
const TRACK_PATH: &str = "/v2.1/track";

/// Connection string errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStringError {
    #[error("Connection string is empty")]
    Empty,

    #[error("Malformed connection string segment '{0}': expected key=value")]
    MalformedSegment(String),

    #[error("Connection string has no InstrumentationKey")]
    MissingInstrumentationKey,

    #[error("Invalid {name} '{value}': must start with http:// or https://")]
    InvalidEndpoint { name: &'static str, value: String },
}

/// Parsed Application Insights connection string
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionString {
    instrumentation_key: String,
    ingestion_endpoint: String,
    live_endpoint: String,
}

impl ConnectionString {
    /// Parse a connection string
    ///
    /// Keys are case-insensitive and unknown keys are ignored. Without an
    /// explicit endpoint, `EndpointSuffix` (and optional `Location`) derive
    /// one, otherwise the global defaults apply.
    pub fn parse(input: &str) -> Result<Self, ConnectionStringError> {
        if input.trim().is_empty() {
            return Err(ConnectionStringError::Empty);
        }

        let mut instrumentation_key = None;
        let mut ingestion_endpoint = None;
        let mut live_endpoint = None;
        let mut endpoint_suffix = None;
        let mut location = None;

        for segment in input.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            let (key, value) = segment
                .split_once('=')
                .ok_or_else(|| ConnectionStringError::MalformedSegment(segment.to_string()))?;
            let value = value.trim();

            match key.trim().to_ascii_lowercase().as_str() {
                "instrumentationkey" => instrumentation_key = Some(value.to_string()),
                "ingestionendpoint" => ingestion_endpoint = Some(value.to_string()),
                "liveendpoint" => live_endpoint = Some(value.to_string()),
                "endpointsuffix" => endpoint_suffix = Some(value.trim_matches('.').to_string()),
                "location" => location = Some(value.trim_matches('.').to_string()),
                _ => {}
            }
        }

        let instrumentation_key = instrumentation_key
            .filter(|k| !k.is_empty())
            .ok_or(ConnectionStringError::MissingInstrumentationKey)?;

        let prefix = location
            .filter(|l| !l.is_empty())
            .map(|l| format!("{}.", l))
            .unwrap_or_default();
        let from_suffix = |service: &str| {
            endpoint_suffix
                .as_deref()
                .filter(|s| !s.is_empty())
                .map(|suffix| format!("https://{}{}.{}", prefix, service, suffix))
        };

        let ingestion_endpoint = ingestion_endpoint
            .or_else(|| from_suffix("dc"))
            .unwrap_or_else(|| DEFAULT_INGESTION_ENDPOINT.to_string());
        let live_endpoint = live_endpoint
            .or_else(|| from_suffix("live"))
            .unwrap_or_else(|| DEFAULT_LIVE_ENDPOINT.to_string());

        Ok(Self {
            instrumentation_key,
            ingestion_endpoint: normalize_endpoint("IngestionEndpoint", ingestion_endpoint)?,
            live_endpoint: normalize_endpoint("LiveEndpoint", live_endpoint)?,
        })
    }

    pub fn instrumentation_key(&self) -> &str {
        &self.instrumentation_key
    }

    /// Ingestion endpoint without a trailing slash
    pub fn ingestion_endpoint(&self) -> &str {
        &self.ingestion_endpoint
    }

    /// Live metrics endpoint without a trailing slash
    pub fn live_endpoint(&self) -> &str {
        &self.live_endpoint
    }

    /// URL that accepts telemetry envelopes
    pub fn track_url(&self) -> String {
        format!("{}{}", self.ingestion_endpoint, TRACK_PATH)
    }

    /// Printable form with the instrumentation key masked
    pub fn redacted(&self) -> String {
        format!(
            "InstrumentationKey={};IngestionEndpoint={};LiveEndpoint={}",
            mask(&self.instrumentation_key),
            self.ingestion_endpoint,
            self.live_endpoint
        )
    }
}

impl fmt::Debug for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionString")
            .field("instrumentation_key", &mask(&self.instrumentation_key))
            .field("ingestion_endpoint", &self.ingestion_endpoint)
            .field("live_endpoint", &self.live_endpoint)
            .finish()
    }
}

impl std::str::FromStr for ConnectionString {
    type Err = ConnectionStringError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn normalize_endpoint(
    name: &'static str,
    value: String,
) -> Result<String, ConnectionStringError> {
    if !crate::config::is_valid_http_url(&value) {
        return Err(ConnectionStringError::InvalidEndpoint { name, value });
    }
    Ok(value.trim_end_matches('/').to_string())
}

/// Keep the first four characters of a secret
fn mask(secret: &str) -> String {
    let visible: String = secret.chars().take(4).collect();
    format!("{}****", visible)
}
