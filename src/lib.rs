//! currency-telemetry
//!
//! Distributed tracing bootstrap for the currency service: Application
//! Insights export, trace ID sampling and gRPC instrumentation.
//!
//! # Features
//!
//! - **Azure Monitor export**: spans become Application Insights envelopes
//! - **Compatible sampling**: same keep/drop decision as the Application
//!   Insights SDKs for a given trace
//! - **Explicit handle**: the tracer provider is passed around, global
//!   registration is opt-in and happens once
//! - **gRPC layers**: server and client spans with W3C trace context
//!
//! # Example
//!
//! ```no_run
//! use currency_telemetry::{init_telemetry, TelemetryConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = TelemetryConfig::from_env()?;
//!     let mut telemetry = init_telemetry(&config)?;
//!     telemetry.install_global()?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod exporter;
pub mod metrics;
pub mod telemetry;

// Re-export commonly used types
pub use config::TelemetryConfig;
pub use telemetry::{init_telemetry, Telemetry};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
