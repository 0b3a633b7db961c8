use std::sync::atomic::AtomicU64;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use opentelemetry::global;
use opentelemetry::metrics::MeterProvider;
use opentelemetry::metrics::{Counter, Histogram, ObservableGauge};
use opentelemetry_otlp::{MetricExporter, Protocol, SpanExporter, WithExportConfig};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::metrics::periodic_reader_with_async_runtime::PeriodicReader;
use opentelemetry_sdk::runtime;
use opentelemetry_sdk::trace::SdkTracerProvider;
use opentelemetry_sdk::trace::span_processor_with_async_runtime::BatchSpanProcessor;
use tracing::warn;

use crate::config::OtlpConfig;

#[derive(Clone)]
pub struct Metrics {
    pub requests: Counter<u64>,
    pub errors: Counter<u64>,
    pub latency_ms: Histogram<f64>,
    pub upstream_calls: Counter<u64>,
    pub quota_rejections: Counter<u64>,
    _inflight: ObservableGauge<i64>,
}

pub fn init_metrics(
    service_name: String,
    otlp: &OtlpConfig,
    inflight_count: Arc<AtomicU64>,
) -> Result<Metrics, String> {
    let exporter = MetricExporter::builder()
        .with_tonic()
        .with_endpoint(otlp.endpoint.clone())
        .with_protocol(Protocol::Grpc)
        .with_timeout(Duration::from_millis(otlp.timeout_ms))
        .build()
        .map_err(|e| format!("metrics exporter init error: {}", e))?;

    let reader = PeriodicReader::builder(exporter, runtime::Tokio).build();
    let provider = SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(Resource::builder().with_service_name(service_name).build())
        .build();

    let meter = provider.meter("messages-gateway");
    global::set_meter_provider(provider);

    Ok(build_instruments(meter, inflight_count))
}

pub fn init_metrics_noop(inflight_count: Arc<AtomicU64>) -> Metrics {
    build_instruments(global::meter("messages-gateway"), inflight_count)
}

fn build_instruments(
    meter: opentelemetry::metrics::Meter,
    inflight_count: Arc<AtomicU64>,
) -> Metrics {
    let requests = meter
        .u64_counter("gateway.requests")
        .with_description("Total requests")
        .build();
    let errors = meter
        .u64_counter("gateway.errors")
        .with_description("Total errors by kind")
        .build();
    let latency_ms = meter
        .f64_histogram("gateway.latency_ms")
        .with_unit("ms")
        .with_description("Request latency in ms")
        .build();
    let upstream_calls = meter
        .u64_counter("gateway.upstream_calls")
        .with_description("Calls admitted against the upstream quota")
        .build();
    let quota_rejections = meter
        .u64_counter("gateway.quota_rejections")
        .with_description("Requests rejected by the batch quota")
        .build();
    let inflight = meter
        .i64_observable_gauge("gateway.inflight")
        .with_description("In-flight requests")
        .with_callback(move |observer| {
            let value = inflight_count.load(std::sync::atomic::Ordering::Relaxed) as i64;
            observer.observe(value, &[]);
        })
        .build();

    Metrics {
        requests,
        errors,
        latency_ms,
        upstream_calls,
        quota_rejections,
        _inflight: inflight,
    }
}

pub fn init_tracer_grpc(
    otlp: &OtlpConfig,
    service_name: String,
) -> Result<SdkTracerProvider, String> {
    let exporter = SpanExporter::builder()
        .with_tonic()
        .with_endpoint(otlp.endpoint.clone())
        .with_timeout(Duration::from_millis(otlp.timeout_ms))
        .build()
        .map_err(|e| format!("trace exporter init error: {}", e))?;

    let batch = BatchSpanProcessor::builder(exporter, runtime::Tokio).build();
    let provider = SdkTracerProvider::builder()
        .with_span_processor(batch)
        .with_resource(Resource::builder().with_service_name(service_name).build())
        .build();

    hold_tracer_provider(provider.clone());
    Ok(provider)
}

pub fn init_tracer_noop(service_name: String) -> SdkTracerProvider {
    let provider = SdkTracerProvider::builder()
        .with_resource(Resource::builder().with_service_name(service_name).build())
        .build();
    hold_tracer_provider(provider.clone());
    provider
}

fn hold_tracer_provider(provider: SdkTracerProvider) {
    static GLOBAL_PROVIDER: OnceLock<SdkTracerProvider> = OnceLock::new();
    let _ = GLOBAL_PROVIDER.set(provider.clone());
    global::set_tracer_provider(provider);
}

pub fn spawn_tracer_watchdog(provider: SdkTracerProvider) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || loop {
        std::thread::sleep(Duration::from_secs(30));
        if let Err(err) = provider.force_flush() {
            warn!(
                "tracer provider force_flush failed (batch worker may be down): {}",
                err
            );
        }
    })
}
