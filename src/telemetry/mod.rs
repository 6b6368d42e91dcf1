//! OpenTelemetry distributed tracing for currencyservice
//!
//! The startup sequence, in order:
//!
//! 1. build the exporter from the connection string ([`crate::exporter`])
//! 2. build the sampler ([`sampling`])
//! 3. build the provider with the `service.name` resource ([`init`])
//! 4. attach the exporter through a simple or batch span processor
//! 5. optionally register the provider process-wide
//!    ([`Telemetry::install_global`])
//! 6. wrap gRPC servers and clients in [`GrpcTraceLayer`]
//!
//! # Example
//!
//! ```no_run
//! use currency_telemetry::config::TelemetryConfig;
//! use currency_telemetry::telemetry::{init_subscriber, init_telemetry, GrpcTraceLayer};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = TelemetryConfig::load("telemetry.yaml")?;
//! let mut telemetry = init_telemetry(&config)?;
//! telemetry.install_global()?;
//! init_subscriber(&config.logging, &telemetry)?;
//!
//! let layer = GrpcTraceLayer::server();
//! // Server::builder().layer(layer).add_service(...)
//! # let _ = layer;
//! // Spans are flushed when `telemetry` is dropped
//! # Ok(())
//! # }
//! ```

pub mod init;
pub mod instrumentation;
pub mod propagation;
pub mod sampling;
pub mod subscriber;

pub use init::{init_telemetry, Telemetry, TelemetryError};
pub use instrumentation::{GrpcTrace, GrpcTraceLayer, RpcRole};
pub use sampling::{ApplicationInsightsSampler, ServiceSampler};
pub use subscriber::{build_subscriber, init_subscriber, telemetry_layer};
