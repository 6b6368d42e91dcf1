//! Application Insights envelope model
//!
//! Maps finished spans to the JSON envelopes accepted by the ingestion
//! `track` endpoint. Server and consumer spans are requests, everything
//! else is a dependency call. Span events are carried as message or
//! exception envelopes parented to their span.

use chrono::{DateTime, SecondsFormat, Utc};
use opentelemetry::trace::{SpanId, SpanKind, Status};
use opentelemetry::{Key, KeyValue, Value};
use opentelemetry_sdk::export::trace::SpanData;
use opentelemetry_sdk::Resource;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};

/// Span attribute written by the Application Insights sampler
pub const SAMPLE_RATE_ATTRIBUTE: &str = "_MS.sampleRate";

const REQUEST_NAME: &str = "Microsoft.ApplicationInsights.Request";
const DEPENDENCY_NAME: &str = "Microsoft.ApplicationInsights.RemoteDependency";
const MESSAGE_NAME: &str = "Microsoft.ApplicationInsights.Message";
const EXCEPTION_NAME: &str = "Microsoft.ApplicationInsights.Exception";

const TAG_OPERATION_ID: &str = "ai.operation.id";
const TAG_OPERATION_PARENT_ID: &str = "ai.operation.parentId";
const TAG_OPERATION_NAME: &str = "ai.operation.name";
const TAG_CLOUD_ROLE: &str = "ai.cloud.role";
const TAG_CLOUD_ROLE_INSTANCE: &str = "ai.cloud.roleInstance";
const TAG_SDK_VERSION: &str = "ai.internal.sdkVersion";

const SCHEMA_VERSION: i32 = 2;

/// One telemetry item as sent to the `track` endpoint
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub name: &'static str,
    pub time: String,
    #[serde(rename = "iKey")]
    pub instrumentation_key: String,
    pub sample_rate: f64,
    pub tags: BTreeMap<&'static str, String>,
    pub data: Data,
}

/// Envelope payload, tagged by `baseType`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "baseType", content = "baseData")]
pub enum Data {
    RequestData(RequestData),
    RemoteDependencyData(RemoteDependencyData),
    MessageData(MessageData),
    ExceptionData(ExceptionData),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestData {
    pub ver: i32,
    pub id: String,
    pub name: String,
    pub duration: String,
    pub success: bool,
    pub response_code: String,
    pub properties: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteDependencyData {
    pub ver: i32,
    pub id: String,
    pub name: String,
    pub duration: String,
    pub success: bool,
    pub result_code: String,
    #[serde(rename = "type")]
    pub dependency_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    pub properties: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageData {
    pub ver: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity_level: Option<&'static str>,
    pub properties: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionData {
    pub ver: i32,
    pub exceptions: Vec<ExceptionDetails>,
    pub properties: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionDetails {
    pub type_name: String,
    pub message: String,
    pub has_full_stack: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

/// Map one finished span to its envelopes: the span itself first, then
/// one envelope per span event.
pub fn span_to_envelopes(span: &SpanData, instrumentation_key: &str) -> Vec<Envelope> {
    let sample_rate = attribute(&span.attributes, SAMPLE_RATE_ATTRIBUTE)
        .and_then(value_as_f64)
        .unwrap_or(100.0);
    let trace_id = span.span_context.trace_id().to_string();
    let span_id = span.span_context.span_id().to_string();
    let base_tags = resource_tags(&span.resource, &trace_id);

    let mut span_tags = base_tags.clone();
    if span.parent_span_id != SpanId::INVALID {
        span_tags.insert(TAG_OPERATION_PARENT_ID, span.parent_span_id.to_string());
    }

    let duration = format_duration(
        span.end_time
            .duration_since(span.start_time)
            .unwrap_or_default(),
    );
    let success = !matches!(span.status, Status::Error { .. });
    let span_properties = properties(&span.attributes);

    let (name, data) = match span.span_kind {
        SpanKind::Server | SpanKind::Consumer => {
            span_tags.insert(TAG_OPERATION_NAME, span.name.to_string());
            (
                REQUEST_NAME,
                Data::RequestData(RequestData {
                    ver: SCHEMA_VERSION,
                    id: span_id.clone(),
                    name: span.name.to_string(),
                    duration,
                    success,
                    response_code: result_code(&span.attributes),
                    properties: span_properties,
                }),
            )
        }
        SpanKind::Client | SpanKind::Producer | SpanKind::Internal => (
            DEPENDENCY_NAME,
            Data::RemoteDependencyData(RemoteDependencyData {
                ver: SCHEMA_VERSION,
                id: span_id.clone(),
                name: span.name.to_string(),
                duration,
                success,
                result_code: result_code(&span.attributes),
                dependency_type: dependency_type(&span.span_kind, &span.attributes),
                target: dependency_target(&span.attributes),
                data: rpc_full_method(&span.attributes),
                properties: span_properties,
            }),
        ),
    };

    let mut envelopes = vec![Envelope {
        name,
        time: format_time(span.start_time),
        instrumentation_key: instrumentation_key.to_string(),
        sample_rate,
        tags: span_tags,
        data,
    }];

    let mut event_tags = base_tags;
    event_tags.insert(TAG_OPERATION_PARENT_ID, span_id);

    for event in span.events.iter() {
        let (name, data) = if event.name == "exception" {
            (EXCEPTION_NAME, exception_data(&event.attributes))
        } else {
            (
                MESSAGE_NAME,
                Data::MessageData(MessageData {
                    ver: SCHEMA_VERSION,
                    message: event.name.to_string(),
                    severity_level: attribute(&event.attributes, "level")
                        .and_then(|level| severity_level(&level.to_string())),
                    properties: properties(&event.attributes),
                }),
            )
        };

        envelopes.push(Envelope {
            name,
            time: format_time(event.timestamp),
            instrumentation_key: instrumentation_key.to_string(),
            sample_rate,
            tags: event_tags.clone(),
            data,
        });
    }

    envelopes
}

fn exception_data(attributes: &[KeyValue]) -> Data {
    let text = |key: &str| attribute(attributes, key).map(|v| v.to_string());
    let stack = text("exception.stacktrace");

    Data::ExceptionData(ExceptionData {
        ver: SCHEMA_VERSION,
        exceptions: vec![ExceptionDetails {
            type_name: text("exception.type").unwrap_or_else(|| "Error".to_string()),
            message: text("exception.message").unwrap_or_default(),
            has_full_stack: stack.is_some(),
            stack,
        }],
        properties: properties(attributes),
    })
}

fn resource_tags(resource: &Resource, trace_id: &str) -> BTreeMap<&'static str, String> {
    let mut tags = BTreeMap::new();
    tags.insert(TAG_OPERATION_ID, trace_id.to_string());
    tags.insert(
        TAG_SDK_VERSION,
        format!("rust:{}", env!("CARGO_PKG_VERSION")),
    );

    if let Some(service) = resource.get(Key::from_static_str("service.name")) {
        tags.insert(TAG_CLOUD_ROLE, service.to_string());
    }

    let instance = resource
        .get(Key::from_static_str("service.instance.id"))
        .or_else(|| resource.get(Key::from_static_str("host.name")))
        .map(|v| v.to_string())
        .or_else(|| std::env::var("HOSTNAME").ok());
    if let Some(instance) = instance {
        tags.insert(TAG_CLOUD_ROLE_INSTANCE, instance);
    }

    tags
}

fn attribute<'a>(attributes: &'a [KeyValue], key: &str) -> Option<&'a Value> {
    attributes
        .iter()
        .find(|kv| kv.key.as_str() == key)
        .map(|kv| &kv.value)
}

fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::F64(v) => Some(*v),
        Value::I64(v) => Some(*v as f64),
        other => other.to_string().parse().ok(),
    }
}

fn properties(attributes: &[KeyValue]) -> BTreeMap<String, String> {
    attributes
        .iter()
        .filter(|kv| !kv.key.as_str().starts_with("_MS."))
        .map(|kv| (kv.key.as_str().to_string(), kv.value.to_string()))
        .collect()
}

fn result_code(attributes: &[KeyValue]) -> String {
    ["rpc.grpc.status_code", "http.response.status_code", "http.status_code"]
        .iter()
        .find_map(|key| attribute(attributes, key))
        .map(|v| v.to_string())
        .unwrap_or_else(|| "0".to_string())
}

fn dependency_type(kind: &SpanKind, attributes: &[KeyValue]) -> String {
    let rpc_system = attribute(attributes, "rpc.system").map(|v| v.to_string());
    match (kind, rpc_system.as_deref()) {
        (_, Some("grpc")) => "GRPC".to_string(),
        (SpanKind::Internal, _) => "InProc".to_string(),
        _ => "Dependency".to_string(),
    }
}

fn dependency_target(attributes: &[KeyValue]) -> Option<String> {
    let host = attribute(attributes, "server.address")
        .or_else(|| attribute(attributes, "net.peer.name"))?
        .to_string();
    let port = attribute(attributes, "server.port").or_else(|| attribute(attributes, "net.peer.port"));
    Some(match port {
        Some(port) => format!("{}:{}", host, port),
        None => host,
    })
}

fn rpc_full_method(attributes: &[KeyValue]) -> Option<String> {
    let service = attribute(attributes, "rpc.service")?;
    let method = attribute(attributes, "rpc.method")?;
    Some(format!("{}/{}", service, method))
}

fn severity_level(level: &str) -> Option<&'static str> {
    match level.to_ascii_uppercase().as_str() {
        "TRACE" | "DEBUG" => Some("Verbose"),
        "INFO" => Some("Information"),
        "WARN" => Some("Warning"),
        "ERROR" => Some("Error"),
        _ => None,
    }
}

/// RFC 3339 UTC with microsecond precision
pub fn format_time(time: SystemTime) -> String {
    DateTime::<Utc>::from(time).to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Application Insights timespan: `[d.]hh:mm:ss.ffffff`
pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    let days = total / 86_400;
    let hours = (total % 86_400) / 3_600;
    let minutes = (total % 3_600) / 60;
    let seconds = total % 60;
    let micros = duration.subsec_micros();

    if days > 0 {
        format!(
            "{}.{:02}:{:02}:{:02}.{:06}",
            days, hours, minutes, seconds, micros
        )
    } else {
        format!("{:02}:{:02}:{:02}.{:06}", hours, minutes, seconds, micros)
    }
}
