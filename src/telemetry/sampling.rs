//! Trace sampling
//!
//! Provides the sampler attached to the tracer provider:
//! - Application Insights sampling: a trace ID hash compatible with the
//!   Application Insights SDKs, so every service sharing a trace keeps or
//!   drops it together
//! - The SDK samplers (always, never, trace ID ratio, parent based)

use crate::config::{SamplingConfig, SamplingStrategy};
use crate::exporter::envelope::SAMPLE_RATE_ATTRIBUTE;
use crate::metrics;
use opentelemetry::trace::{
    Link, SamplingDecision, SamplingResult, SpanKind, TraceContextExt, TraceId, TraceState,
};
use opentelemetry::{Context, KeyValue};
use opentelemetry_sdk::trace::{Sampler, ShouldSample};

/// Application Insights compatible ratio sampler
///
/// Each trace is kept when its sampling score (0 to 100, derived from the
/// trace ID alone) is below the sample rate, `ratio * 100` rounded to a
/// whole percentage as the Application Insights SDKs do. Kept spans carry
/// the rate in the `_MS.sampleRate` attribute so the backend can scale
/// counts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ApplicationInsightsSampler {
    sample_rate: f64,
}

impl ApplicationInsightsSampler {
    /// Create a sampler keeping `ratio` (0.0 to 1.0) of all traces
    ///
    /// Values outside the range are clamped.
    pub fn new(ratio: f64) -> Self {
        let ratio = if ratio.is_nan() { 0.0 } else { ratio.clamp(0.0, 1.0) };
        Self {
            sample_rate: (ratio * 100.0).round(),
        }
    }

    /// Percentage of traces kept
    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// Keep or drop the trace with this ID
    pub fn keeps(&self, trace_id: TraceId) -> bool {
        if self.sample_rate >= 100.0 {
            return true;
        }
        if self.sample_rate <= 0.0 {
            return false;
        }
        sampling_score(&trace_id.to_string()) < self.sample_rate
    }
}

impl ShouldSample for ApplicationInsightsSampler {
    fn should_sample(
        &self,
        parent_context: Option<&Context>,
        trace_id: TraceId,
        _name: &str,
        _span_kind: &SpanKind,
        _attributes: &[KeyValue],
        _links: &[Link],
    ) -> SamplingResult {
        let sampled = self.keeps(trace_id);
        metrics::record_sampling_decision(sampled);

        let (decision, attributes) = if sampled {
            (
                SamplingDecision::RecordAndSample,
                vec![KeyValue::new(SAMPLE_RATE_ATTRIBUTE, self.sample_rate)],
            )
        } else {
            (SamplingDecision::Drop, Vec::new())
        };

        SamplingResult {
            decision,
            attributes,
            trace_state: parent_trace_state(parent_context),
        }
    }
}

fn parent_trace_state(parent_context: Option<&Context>) -> TraceState {
    parent_context
        .filter(|cx| cx.has_active_span())
        .map(|cx| cx.span().span_context().trace_state().clone())
        .unwrap_or_default()
}

/// Sampling score of a trace ID in `[0, 100]`
///
/// djb2 over the ID text with 32-bit signed wrapping arithmetic, then
/// normalized by `i32::MAX`. IDs shorter than eight characters are doubled
/// until long enough.
pub fn sampling_score(trace_id: &str) -> f64 {
    if trace_id.is_empty() {
        return 0.0;
    }

    let mut input = trace_id.to_string();
    while input.len() < 8 {
        input = input.repeat(2);
    }

    let mut hash: i32 = 5381;
    for byte in input.bytes() {
        hash = hash
            .wrapping_shl(5)
            .wrapping_add(hash)
            .wrapping_add(i32::from(byte));
    }

    let hash = if hash == i32::MIN { i32::MAX } else { hash.abs() };
    f64::from(hash) / f64::from(i32::MAX) * 100.0
}

/// The sampler selected by configuration
#[derive(Debug, Clone)]
pub enum ServiceSampler {
    /// One of the SDK samplers
    Sdk(Sampler),
    ApplicationInsights(ApplicationInsightsSampler),
}

impl ServiceSampler {
    pub fn from_config(config: &SamplingConfig) -> Self {
        match config.strategy {
            SamplingStrategy::Always => ServiceSampler::Sdk(Sampler::AlwaysOn),
            SamplingStrategy::Never => ServiceSampler::Sdk(Sampler::AlwaysOff),
            SamplingStrategy::Ratio => {
                ServiceSampler::Sdk(Sampler::TraceIdRatioBased(config.ratio))
            }
            SamplingStrategy::ParentBased => ServiceSampler::Sdk(Sampler::ParentBased(Box::new(
                Sampler::TraceIdRatioBased(config.ratio),
            ))),
            SamplingStrategy::ApplicationInsights => {
                ServiceSampler::ApplicationInsights(ApplicationInsightsSampler::new(config.ratio))
            }
        }
    }
}

impl ShouldSample for ServiceSampler {
    fn should_sample(
        &self,
        parent_context: Option<&Context>,
        trace_id: TraceId,
        name: &str,
        span_kind: &SpanKind,
        attributes: &[KeyValue],
        links: &[Link],
    ) -> SamplingResult {
        match self {
            ServiceSampler::Sdk(sampler) => {
                sampler.should_sample(parent_context, trace_id, name, span_kind, attributes, links)
            }
            ServiceSampler::ApplicationInsights(sampler) => {
                sampler.should_sample(parent_context, trace_id, name, span_kind, attributes, links)
            }
        }
    }
}
