use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;

use tracing_subscriber::Layer;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use messages_gateway::config::Config;
use messages_gateway::state::AppState;
use messages_gateway::telemetry::{
    init_metrics, init_metrics_noop, init_tracer_grpc, init_tracer_noop, spawn_tracer_watchdog,
};

fn parse_level(level: &str) -> LevelFilter {
    match level {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "warn" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        _ => LevelFilter::INFO,
    }
}

fn open_log_file(path: &str) -> Option<std::fs::File> {
    let path = Path::new(path);
    if let Some(parent) = path.parent() {
        if let Err(err) = std::fs::create_dir_all(parent) {
            eprintln!("log file create dir error: {}", err);
            return None;
        }
    }
    match OpenOptions::new().create(true).append(true).open(path) {
        Ok(file) => Some(file),
        Err(err) => {
            eprintln!("log file open error: {}", err);
            None
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("config error: {}", err);
            std::process::exit(1);
        }
    };

    let inflight_count = Arc::new(AtomicU64::new(0));
    let observability = &config.observability;

    let metrics = if observability.otlp.enabled {
        match init_metrics(
            observability.service_name.clone(),
            &observability.otlp,
            inflight_count.clone(),
        ) {
            Ok(m) => m,
            Err(err) => {
                eprintln!("metrics init error (fallback to noop): {}", err);
                init_metrics_noop(inflight_count.clone())
            }
        }
    } else {
        init_metrics_noop(inflight_count.clone())
    };

    let tracer_provider = if observability.otlp.enabled {
        match init_tracer_grpc(&observability.otlp, observability.service_name.clone()) {
            Ok(provider) => provider,
            Err(err) => {
                eprintln!("tracing init error (fallback to noop): {}", err);
                init_tracer_noop(observability.service_name.clone())
            }
        }
    } else {
        init_tracer_noop(observability.service_name.clone())
    };

    let log_level = parse_level(observability.logging.level.as_str());
    let file_writer = observability
        .logging
        .file
        .as_deref()
        .and_then(open_log_file)
        .map(Arc::new);

    let writer = match (observability.logging.stdout, file_writer) {
        (true, Some(file)) => BoxMakeWriter::new(std::io::stdout.and(file)),
        (true, None) => BoxMakeWriter::new(std::io::stdout),
        (false, Some(file)) => BoxMakeWriter::new(file),
        (false, None) => BoxMakeWriter::new(std::io::stdout),
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_filter(log_level);
    let telemetry = tracing_opentelemetry::layer();
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(telemetry)
        .init();

    tracing::info!(
        otlp_enabled = observability.otlp.enabled,
        otlp_endpoint = %observability.otlp.endpoint,
        "telemetry configured"
    );

    let _tracer_watchdog = spawn_tracer_watchdog(tracer_provider.clone());

    let bind_addr = config.server.bind_addr.clone();
    let state = match AppState::new(config, metrics, inflight_count) {
        Ok(state) => state,
        Err(err) => {
            eprintln!("state init error: {}", err);
            std::process::exit(1);
        }
    };

    let app = messages_gateway::router(state);

    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(err) => {
            eprintln!("bind error: {}", err);
            std::process::exit(1);
        }
    };

    tracing::info!("listening on {}", bind_addr);
    if let Err(err) = axum::serve(listener, app).await {
        eprintln!("server error: {}", err);
        std::process::exit(1);
    }
}
