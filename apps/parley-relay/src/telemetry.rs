//! Logging, optional span export and the relay's Prometheus metrics.
//!
//! Every metric the relay records goes through the helpers below so the
//! names and label sets stay in one place and are described on startup.

use anyhow::{Context, Result};
use metrics::{counter, describe_counter, describe_gauge, gauge, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use opentelemetry::{global, trace::TracerProvider, KeyValue};
use opentelemetry_sdk::{
    resource::Resource,
    trace::{Sampler, SdkTracerProvider},
};
use opentelemetry_stdout::SpanExporter;
use parley_proto::RefusalCode;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const SERVICE_NAME: &str = "parley-relay";

pub const JOINS_TOTAL: &str = "parley_relay_joins_total";
pub const REFUSALS_TOTAL: &str = "parley_relay_refusals_total";
pub const HANDSHAKE_FAILURES_TOTAL: &str = "parley_relay_handshake_failures_total";
pub const SIGNALS_RELAYED_TOTAL: &str = "parley_relay_signals_relayed_total";
pub const MALFORMED_FRAMES_TOTAL: &str = "parley_relay_malformed_frames_total";
pub const ROOMS_ACTIVE: &str = "parley_relay_rooms_active";
pub const CONNECTIONS_ACTIVE: &str = "parley_relay_connections_active";

/// Process-wide subscriber and metrics recorder. Dropping it flushes the
/// span exporter when one was enabled.
pub struct Telemetry {
    metrics_handle: PrometheusHandle,
    tracer_provider: Option<SdkTracerProvider>,
}

impl Telemetry {
    pub fn init(otel_stdout: bool) -> Result<Self> {
        let metrics_handle = PrometheusBuilder::new()
            .add_global_label("service", SERVICE_NAME)
            .install_recorder()
            .context("failed to install Prometheus metrics recorder")?;
        describe_metrics();

        let tracer_provider = otel_stdout.then(stdout_tracer_provider);
        let otel_layer = tracer_provider.as_ref().map(|provider| {
            tracing_opentelemetry::layer().with_tracer(provider.tracer(SERVICE_NAME))
        });
        tracing_subscriber::registry()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .with(otel_layer)
            .try_init()
            .context("failed to initialise tracing subscriber")?;

        if let Some(provider) = &tracer_provider {
            global::set_tracer_provider(provider.clone());
            info!(service = SERVICE_NAME, "OpenTelemetry stdout span exporter enabled");
        }

        Ok(Self {
            metrics_handle,
            tracer_provider,
        })
    }

    pub fn metrics_handle(&self) -> PrometheusHandle {
        self.metrics_handle.clone()
    }
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        if let Some(provider) = self.tracer_provider.take() {
            if let Err(err) = provider.shutdown() {
                warn!(error = %err, "failed to flush span exporter");
            }
        }
    }
}

fn stdout_tracer_provider() -> SdkTracerProvider {
    SdkTracerProvider::builder()
        .with_simple_exporter(SpanExporter::default())
        .with_sampler(Sampler::AlwaysOn)
        .with_resource(
            Resource::builder()
                .with_attributes(vec![KeyValue::new("service.name", SERVICE_NAME)])
                .build(),
        )
        .build()
}

fn describe_metrics() {
    describe_counter!(JOINS_TOTAL, Unit::Count, "Participants admitted into a room.");
    describe_counter!(
        REFUSALS_TOTAL,
        Unit::Count,
        "Join attempts refused, by refusal code."
    );
    describe_counter!(
        HANDSHAKE_FAILURES_TOTAL,
        Unit::Count,
        "Connections that never produced usable join parameters."
    );
    describe_counter!(
        SIGNALS_RELAYED_TOTAL,
        Unit::Count,
        "Peer signals delivered to another room member."
    );
    describe_counter!(
        MALFORMED_FRAMES_TOTAL,
        Unit::Count,
        "Client frames dropped because they could not be decoded."
    );
    describe_gauge!(ROOMS_ACTIVE, Unit::Count, "Rooms with at least one member.");
    describe_gauge!(
        CONNECTIONS_ACTIVE,
        Unit::Count,
        "Participants currently admitted across all rooms."
    );
}

pub fn record_join() {
    counter!(JOINS_TOTAL, 1);
}

pub fn record_refusal(code: RefusalCode) {
    counter!(REFUSALS_TOTAL, 1, "reason" => code.as_str());
}

pub fn record_handshake_failure(reason: &'static str) {
    counter!(HANDSHAKE_FAILURES_TOTAL, 1, "reason" => reason);
}

pub fn record_signals_relayed(delivered: usize) {
    if delivered > 0 {
        counter!(SIGNALS_RELAYED_TOTAL, delivered as u64);
    }
}

pub fn record_malformed_frame(reason: &'static str) {
    counter!(MALFORMED_FRAMES_TOTAL, 1, "reason" => reason);
}

pub fn record_occupancy(rooms: usize, connections: usize) {
    gauge!(ROOMS_ACTIVE, rooms as f64);
    gauge!(CONNECTIONS_ACTIVE, connections as f64);
}
