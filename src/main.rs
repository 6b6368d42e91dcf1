//! currency-telemetry - tracing bootstrap check tool
//!
//! Validates the telemetry configuration of the currency service and runs
//! the full startup sequence against the configured backend.

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use currency_telemetry::config::{ExporterKind, TelemetryConfig};
use currency_telemetry::exporter::ConnectionString;
use currency_telemetry::telemetry::{
    init_subscriber, init_telemetry, GrpcTraceLayer, Telemetry, TelemetryError,
};
use currency_telemetry::{metrics, VERSION};
use hyper::{Request, Response, Uri};
use opentelemetry::trace::TraceContextExt;
use std::convert::Infallible;
use std::path::PathBuf;
use tower::{service_fn, ServiceBuilder, ServiceExt};
use tracing::{info, warn};
use tracing_opentelemetry::OpenTelemetrySpanExt;

/// Tracing bootstrap for currencyservice
#[derive(Parser, Debug)]
#[command(name = "currency-telemetry")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file. Without it, defaults plus environment
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level or filter directives, overrides logging.level
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load and validate the configuration, then print it
    Check,
    /// Initialize tracing and send one server span with a nested client span
    EmitTestSpan {
        /// gRPC method of the test span
        #[arg(long, default_value = "hipstershop.CurrencyService/Convert")]
        name: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => TelemetryConfig::load(path)
            .with_context(|| format!("Failed to load configuration from {:?}", path))?,
        None => TelemetryConfig::from_env().context("Invalid configuration")?,
    };
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }

    match args.command {
        Command::Check => check(&config),
        Command::EmitTestSpan { name } => emit_test_span(&config, &name).await,
    }
}

fn check(config: &TelemetryConfig) -> anyhow::Result<()> {
    println!("service: {}", config.service_name);
    println!("enabled: {}", config.enabled);
    println!("exporter: {:?}", config.exporter.kind);

    if config.enabled {
        match config.exporter.kind {
            ExporterKind::AzureMonitor => {
                let connection = ConnectionString::parse(
                    config.exporter.connection_string.as_deref().unwrap_or_default(),
                )?;
                println!("  ingestion endpoint: {}", connection.ingestion_endpoint());
                println!("  live endpoint: {}", connection.live_endpoint());
                println!("  connection string: {}", connection.redacted());
            }
            ExporterKind::Otlp => println!("  endpoint: {}", config.exporter.otlp_endpoint),
            ExporterKind::None => {}
        }
        println!(
            "sampling: {:?} (ratio {})",
            config.sampling.strategy, config.sampling.ratio
        );
        println!("processor: {:?}", config.processor.mode);
    }

    println!("Configuration OK");
    Ok(())
}

async fn emit_test_span(config: &TelemetryConfig, name: &str) -> anyhow::Result<()> {
    let (mut telemetry, init_error) = match init_telemetry(config) {
        Ok(telemetry) => (telemetry, None),
        Err(e) if config.fail_open && e.is_recoverable() => (Telemetry::disabled(config), Some(e)),
        Err(e) => return Err(e.into()),
    };

    init_subscriber(&config.logging, &telemetry)?;
    info!("Starting currency-telemetry v{}", VERSION);
    if let Some(e) = init_error {
        warn!(error = %e, "Tracing initialization failed, continuing without telemetry");
    }

    if telemetry.is_active() {
        fail_open(config, telemetry.install_global())?;
    }

    let client = ServiceBuilder::new()
        .layer(GrpcTraceLayer::client())
        .service(service_fn(|_request: Request<()>| async {
            Ok::<_, Infallible>(Response::new(()))
        }));

    let server = ServiceBuilder::new()
        .layer(GrpcTraceLayer::server())
        .service(service_fn(move |_request: Request<()>| {
            let client = client.clone();
            async move {
                let trace_id = tracing::Span::current()
                    .context()
                    .span()
                    .span_context()
                    .trace_id();

                let mut outgoing = Request::new(());
                *outgoing.uri_mut() =
                    Uri::from_static("http://exchange-rates:7000/hipstershop.RateService/GetRates");
                client.oneshot(outgoing).await?;

                Ok::<_, Infallible>(Response::new(trace_id.to_string()))
            }
        }));

    let mut request = Request::new(());
    *request.uri_mut() = format!("/{}", name.trim_start_matches('/'))
        .parse::<Uri>()
        .with_context(|| format!("Invalid method name '{}'", name))?;

    let response = server.oneshot(request).await?;
    println!("trace id: {}", response.body());

    fail_open(config, telemetry.force_flush())?;
    print!("{}", metrics::gather_text());

    fail_open(config, telemetry.shutdown())?;
    Ok(())
}

/// Turn a telemetry error into a warning when `fail_open` is set
fn fail_open(config: &TelemetryConfig, result: Result<(), TelemetryError>) -> anyhow::Result<()> {
    match result {
        Err(e) if config.fail_open && e.is_recoverable() => {
            warn!(error = %e, "Telemetry operation failed, continuing");
            Ok(())
        }
        other => Ok(other?),
    }
}
