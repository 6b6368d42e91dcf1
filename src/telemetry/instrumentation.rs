//! gRPC span instrumentation
//!
//! Tower layers that wrap every RPC in a span, following the
//! [OpenTelemetry semantic conventions for RPC](https://opentelemetry.io/docs/specs/semconv/rpc/grpc/).
//! They operate on plain `http` requests, which is the level tonic servers
//! and channels expose to middleware:
//!
//! ```ignore
//! // server
//! Server::builder()
//!     .layer(GrpcTraceLayer::server())
//!     .add_service(CurrencyServiceServer::new(service));
//!
//! // client
//! let channel = ServiceBuilder::new()
//!     .layer(GrpcTraceLayer::client())
//!     .service(channel);
//! ```
//!
//! | Attribute | Description | Example |
//! |-----------|-------------|---------|
//! | `rpc.system` | Always `grpc` | `grpc` |
//! | `rpc.service` | Fully qualified service | `hipstershop.CurrencyService` |
//! | `rpc.method` | Method name | `Convert` |
//! | `rpc.grpc.status_code` | Numeric status | `0` |
//! | `server.address` | Peer host (client spans) | `currencyservice` |
//! | `server.port` | Peer port (client spans) | `7000` |
//!
//! Spans only reach the exporter when the current `tracing` subscriber
//! carries the OpenTelemetry layer, see [`super::subscriber`].

use super::propagation::{extract_context, inject_context};
use hyper::header::HeaderMap;
use hyper::{Request, Response, StatusCode};
use pin_project_lite::pin_project;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tower::{Layer, Service};
use tracing::field::Empty;
use tracing::Span;
use tracing_opentelemetry::OpenTelemetrySpanExt;

/// Which side of the call is being traced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcRole {
    Server,
    Client,
}

impl RpcRole {
    fn span_kind(self) -> &'static str {
        match self {
            RpcRole::Server => "server",
            RpcRole::Client => "client",
        }
    }
}

/// gRPC status codes
pub mod code {
    pub const OK: i32 = 0;
    pub const UNKNOWN: i32 = 2;
    pub const DEADLINE_EXCEEDED: i32 = 4;
    pub const PERMISSION_DENIED: i32 = 7;
    pub const UNIMPLEMENTED: i32 = 12;
    pub const INTERNAL: i32 = 13;
    pub const UNAVAILABLE: i32 = 14;
    pub const DATA_LOSS: i32 = 15;
    pub const UNAUTHENTICATED: i32 = 16;
}

/// Layer producing [`GrpcTrace`] services
#[derive(Debug, Clone, Copy)]
pub struct GrpcTraceLayer {
    role: RpcRole,
}

impl GrpcTraceLayer {
    /// Trace incoming calls, continuing the caller's trace when present
    pub fn server() -> Self {
        Self {
            role: RpcRole::Server,
        }
    }

    /// Trace outgoing calls and propagate the trace to the callee
    ///
    /// The call status is read from the response head only: trailers-only
    /// responses and HTTP errors are classified, but a streamed response
    /// whose `grpc-status` arrives in the trailers is recorded as OK. The
    /// body is not wrapped, so the span ends when the head arrives.
    pub fn client() -> Self {
        Self {
            role: RpcRole::Client,
        }
    }

    pub fn role(&self) -> RpcRole {
        self.role
    }
}

impl<S> Layer<S> for GrpcTraceLayer {
    type Service = GrpcTrace<S>;

    fn layer(&self, inner: S) -> Self::Service {
        GrpcTrace {
            inner,
            role: self.role,
        }
    }
}

/// Service wrapping each call in an RPC span
#[derive(Debug, Clone)]
pub struct GrpcTrace<S> {
    inner: S,
    role: RpcRole,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for GrpcTrace<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
    S::Error: fmt::Display,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = ResponseFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request<ReqBody>) -> Self::Future {
        let span = create_rpc_span(self.role, &request);

        match self.role {
            RpcRole::Server => span.set_parent(extract_context(request.headers())),
            RpcRole::Client => inject_context(&span.context(), request.headers_mut()),
        }

        let inner = {
            let _enter = span.enter();
            self.inner.call(request)
        };

        ResponseFuture {
            inner,
            span,
            role: self.role,
        }
    }
}

pin_project! {
    /// Response future recording the call outcome on its span
    pub struct ResponseFuture<F> {
        #[pin]
        inner: F,
        span: Span,
        role: RpcRole,
    }
}

impl<F, ResBody, E> Future for ResponseFuture<F>
where
    F: Future<Output = Result<Response<ResBody>, E>>,
    E: fmt::Display,
{
    type Output = Result<Response<ResBody>, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let _enter = this.span.enter();
        let result = ready!(this.inner.poll(cx));

        match &result {
            Ok(response) => {
                let status = grpc_status(response.status(), response.headers());
                record_status(this.span, *this.role, status);
            }
            Err(e) => {
                this.span.record("otel.status_code", "ERROR");
                this.span.record("otel.status_message", e.to_string().as_str());
            }
        }

        Poll::Ready(result)
    }
}

/// Open the span for one call, fields left empty are filled on completion
fn create_rpc_span<B>(role: RpcRole, request: &Request<B>) -> Span {
    let (service, method) = parse_grpc_path(request.uri().path());
    let name = if service.is_empty() {
        method.to_string()
    } else {
        format!("{}/{}", service, method)
    };

    let span = tracing::info_span!(
        "grpc",
        otel.name = %name,
        otel.kind = role.span_kind(),
        otel.status_code = Empty,
        otel.status_message = Empty,
        rpc.system = "grpc",
        rpc.service = %service,
        rpc.method = %method,
        rpc.grpc.status_code = Empty,
        server.address = Empty,
        server.port = Empty,
    );

    if role == RpcRole::Client {
        if let Some(host) = request.uri().host() {
            span.record("server.address", host);
        }
        if let Some(port) = request.uri().port_u16() {
            span.record("server.port", i64::from(port));
        }
    }

    span
}

fn record_status(span: &Span, role: RpcRole, status: i32) {
    span.record("rpc.grpc.status_code", i64::from(status));
    if is_error(role, status) {
        span.record("otel.status_code", "ERROR");
    }
}

/// Split `/package.Service/Method` into service and method
///
/// Paths without that shape yield an empty service and the trimmed path
/// as method.
pub fn parse_grpc_path(path: &str) -> (&str, &str) {
    let trimmed = path.trim_start_matches('/');
    match trimmed.split_once('/') {
        Some((service, method)) if !service.is_empty() && !method.is_empty() => {
            (service, method)
        }
        _ => ("", trimmed),
    }
}

/// Status of a finished call
///
/// Trailers-only responses (every error returned by a handler) carry
/// `grpc-status` in the headers. Without it the HTTP status is mapped as
/// described by the gRPC HTTP/2 protocol guide.
pub fn grpc_status(http_status: StatusCode, headers: &HeaderMap) -> i32 {
    if let Some(status) = headers
        .get("grpc-status")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<i32>().ok())
    {
        return status;
    }

    match http_status.as_u16() {
        200 => code::OK,
        400 => code::INTERNAL,
        401 => code::UNAUTHENTICATED,
        403 => code::PERMISSION_DENIED,
        404 => code::UNIMPLEMENTED,
        429 | 502 | 503 | 504 => code::UNAVAILABLE,
        _ => code::UNKNOWN,
    }
}

/// Whether `status` marks the span as failed
///
/// Clients treat every non-OK status as an error. Servers only the codes
/// that point at the server itself.
pub fn is_error(role: RpcRole, status: i32) -> bool {
    match role {
        RpcRole::Client => status != code::OK,
        RpcRole::Server => matches!(
            status,
            code::UNKNOWN
                | code::DEADLINE_EXCEEDED
                | code::UNIMPLEMENTED
                | code::INTERNAL
                | code::UNAVAILABLE
                | code::DATA_LOSS
        ),
    }
}
