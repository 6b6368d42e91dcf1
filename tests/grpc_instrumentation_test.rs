//! gRPC instrumentation tests
//!
//! Drives the tower layers with in-process services and checks the spans
//! that reach the exporter.

mod common;

use common::{sample_everything, CollectingExporter};
use currency_telemetry::config::ProcessorMode;
use currency_telemetry::telemetry::{telemetry_layer, GrpcTraceLayer, Telemetry};
use hyper::header::HeaderValue;
use hyper::{Request, Response, Uri};
use opentelemetry::trace::{SpanId, SpanKind, Status, TraceId};
use opentelemetry::Value;
use opentelemetry_sdk::export::trace::SpanData;
use std::convert::Infallible;
use std::time::Duration;
use tower::{service_fn, ServiceBuilder, ServiceExt};
use tracing::subscriber::DefaultGuard;
use tracing_subscriber::layer::SubscriberExt;

const REMOTE_TRACE: &str = "0af7651916cd43dd8448eb211c80319c";
const REMOTE_SPAN: &str = "b7ad6b7169203331";

struct Pipeline {
    telemetry: Telemetry,
    exporter: CollectingExporter,
    _guard: DefaultGuard,
}

impl Pipeline {
    fn new() -> Self {
        let exporter = CollectingExporter::new();
        let config = sample_everything(ProcessorMode::Simple);
        let telemetry = Telemetry::with_exporter(&config, exporter.clone()).unwrap();
        let subscriber = tracing_subscriber::registry().with(telemetry_layer(&telemetry));
        let guard = tracing::subscriber::set_default(subscriber);

        Self {
            telemetry,
            exporter,
            _guard: guard,
        }
    }

    fn finished(&self, count: usize) -> Vec<SpanData> {
        self.telemetry.force_flush().unwrap();
        self.exporter.wait_for(count, Duration::from_secs(2))
    }
}

fn request(uri: &'static str) -> Request<()> {
    let mut request = Request::new(());
    *request.uri_mut() = Uri::from_static(uri);
    request
}

fn attribute(span: &SpanData, key: &str) -> Option<Value> {
    span.attributes
        .iter()
        .find(|kv| kv.key.as_str() == key)
        .map(|kv| kv.value.clone())
}

#[tokio::test]
async fn test_server_span_has_trace_and_service_name() {
    let pipeline = Pipeline::new();
    let service = ServiceBuilder::new()
        .layer(GrpcTraceLayer::server())
        .service(service_fn(|_request: Request<()>| async {
            Ok::<_, Infallible>(Response::new(()))
        }));

    service
        .oneshot(request("/hipstershop.CurrencyService/Convert"))
        .await
        .unwrap();

    let spans = pipeline.finished(1);
    assert_eq!(spans.len(), 1);
    let span = &spans[0];

    assert_eq!(span.name, "hipstershop.CurrencyService/Convert");
    assert_eq!(span.span_kind, SpanKind::Server);
    assert_ne!(span.span_context.trace_id(), TraceId::INVALID);
    assert_eq!(
        span.resource.get(opentelemetry::Key::new("service.name")),
        Some(Value::from("currencyservice"))
    );
    assert_eq!(attribute(span, "rpc.system"), Some(Value::from("grpc")));
    assert_eq!(
        attribute(span, "rpc.service"),
        Some(Value::from("hipstershop.CurrencyService"))
    );
    assert_eq!(attribute(span, "rpc.method"), Some(Value::from("Convert")));
    assert_eq!(attribute(span, "rpc.grpc.status_code"), Some(Value::I64(0)));
    assert_eq!(span.status, Status::Unset);
}

#[tokio::test]
async fn test_server_continues_remote_trace() {
    let pipeline = Pipeline::new();
    let service = ServiceBuilder::new()
        .layer(GrpcTraceLayer::server())
        .service(service_fn(|_request: Request<()>| async {
            Ok::<_, Infallible>(Response::new(()))
        }));

    let mut incoming = request("/hipstershop.CurrencyService/GetSupportedCurrencies");
    incoming.headers_mut().insert(
        "traceparent",
        HeaderValue::from_static("00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01"),
    );
    service.oneshot(incoming).await.unwrap();

    let spans = pipeline.finished(1);
    let span = &spans[0];
    assert_eq!(
        span.span_context.trace_id(),
        TraceId::from_hex(REMOTE_TRACE).unwrap()
    );
    assert_eq!(span.parent_span_id, SpanId::from_hex(REMOTE_SPAN).unwrap());
}

#[tokio::test]
async fn test_server_error_statuses() {
    let pipeline = Pipeline::new();

    for status in ["13", "5"] {
        let service = ServiceBuilder::new()
            .layer(GrpcTraceLayer::server())
            .service(service_fn(move |_request: Request<()>| async move {
                let mut response = Response::new(());
                response
                    .headers_mut()
                    .insert("grpc-status", HeaderValue::from_static(status));
                Ok::<_, Infallible>(response)
            }));
        service
            .oneshot(request("/hipstershop.CurrencyService/Convert"))
            .await
            .unwrap();
    }

    let spans = pipeline.finished(2);
    assert_eq!(spans.len(), 2);
    assert_eq!(attribute(&spans[0], "rpc.grpc.status_code"), Some(Value::I64(13)));
    assert!(matches!(spans[0].status, Status::Error { .. }));
    assert_eq!(attribute(&spans[1], "rpc.grpc.status_code"), Some(Value::I64(5)));
    assert_eq!(spans[1].status, Status::Unset);
}

#[tokio::test]
async fn test_client_injects_trace_context() {
    let pipeline = Pipeline::new();
    let client = ServiceBuilder::new()
        .layer(GrpcTraceLayer::client())
        .service(service_fn(|request: Request<()>| async move {
            let traceparent = request
                .headers()
                .get("traceparent")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            Ok::<_, Infallible>(Response::new(traceparent))
        }));

    let response = client
        .oneshot(request(
            "http://exchange-rates:7000/hipstershop.RateService/GetRates",
        ))
        .await
        .unwrap();
    let traceparent = response.into_body().expect("traceparent header");

    let spans = pipeline.finished(1);
    let span = &spans[0];
    assert_eq!(span.span_kind, SpanKind::Client);
    assert_eq!(
        traceparent,
        format!(
            "00-{}-{}-01",
            span.span_context.trace_id(),
            span.span_context.span_id()
        )
    );
    assert_eq!(
        attribute(span, "server.address"),
        Some(Value::from("exchange-rates"))
    );
    assert_eq!(attribute(span, "server.port"), Some(Value::I64(7000)));
}

#[tokio::test]
async fn test_client_marks_non_ok_as_error() {
    let pipeline = Pipeline::new();
    let client = ServiceBuilder::new()
        .layer(GrpcTraceLayer::client())
        .service(service_fn(|_request: Request<()>| async {
            let mut response = Response::new(());
            *response.status_mut() = hyper::StatusCode::SERVICE_UNAVAILABLE;
            Ok::<_, Infallible>(response)
        }));

    client
        .oneshot(request("http://rates/hipstershop.RateService/GetRates"))
        .await
        .unwrap();

    let spans = pipeline.finished(1);
    assert_eq!(attribute(&spans[0], "rpc.grpc.status_code"), Some(Value::I64(14)));
    assert!(matches!(spans[0].status, Status::Error { .. }));
}

#[tokio::test]
async fn test_client_reads_trailers_only_status() {
    let pipeline = Pipeline::new();
    let client = ServiceBuilder::new()
        .layer(GrpcTraceLayer::client())
        .service(service_fn(|_request: Request<()>| async {
            let mut response = Response::new(());
            response
                .headers_mut()
                .insert("grpc-status", HeaderValue::from_static("14"));
            Ok::<_, Infallible>(response)
        }));

    client
        .oneshot(request("http://rates/hipstershop.RateService/GetRates"))
        .await
        .unwrap();

    let spans = pipeline.finished(1);
    assert_eq!(attribute(&spans[0], "rpc.grpc.status_code"), Some(Value::I64(14)));
    assert!(matches!(spans[0].status, Status::Error { .. }));
}

#[tokio::test]
async fn test_transport_error_marks_span() {
    let pipeline = Pipeline::new();
    let client = ServiceBuilder::new()
        .layer(GrpcTraceLayer::client())
        .service(service_fn(|_request: Request<()>| async {
            Err::<Response<()>, _>(std::io::Error::other("connection reset"))
        }));

    let result = client
        .oneshot(request("http://rates/hipstershop.RateService/GetRates"))
        .await;
    assert!(result.is_err());

    let spans = pipeline.finished(1);
    match &spans[0].status {
        Status::Error { description } => assert_eq!(description, "connection reset"),
        other => panic!("unexpected status {:?}", other),
    }
}

#[tokio::test]
async fn test_client_inside_server_shares_trace() {
    let pipeline = Pipeline::new();
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
                client
                    .oneshot(request("http://rates/hipstershop.RateService/GetRates"))
                    .await
            }
        }));

    server
        .oneshot(request("/hipstershop.CurrencyService/Convert"))
        .await
        .unwrap();

    let spans = pipeline.finished(2);
    assert_eq!(spans.len(), 2);
    let client_span = spans.iter().find(|s| s.span_kind == SpanKind::Client).unwrap();
    let server_span = spans.iter().find(|s| s.span_kind == SpanKind::Server).unwrap();
    assert_eq!(
        client_span.span_context.trace_id(),
        server_span.span_context.trace_id()
    );
    assert_eq!(client_span.parent_span_id, server_span.span_context.span_id());
}
