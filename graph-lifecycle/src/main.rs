//! Host service owning one graph client: constructs it at startup, serves
//! readiness and metrics for it, and disposes of it on SIGINT/SIGTERM.
use std::sync::Arc;

use envconfig::Envconfig;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use graph_lifecycle::config::Config;
use graph_lifecycle::metrics::setup_metrics_recorder;
use graph_lifecycle::router::{self, AppState};
use graph_lifecycle::{BoltClientFactory, HealthProbe, LifecycleRegistry, MetricsBridge, ShutdownHooks};

#[tokio::main]
async fn main() {
    let config = Config::init_from_env().expect("Invalid configuration:");

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    let log_layer = if *config.log_json {
        tracing_subscriber::fmt::layer().json().with_filter(filter).boxed()
    } else {
        tracing_subscriber::fmt::layer().with_filter(filter).boxed()
    };
    tracing_subscriber::registry().with(log_layer).init();

    let recorder = setup_metrics_recorder();
    let connection = config.resolve(true);
    let name = config.client_name.as_str();

    let registry = LifecycleRegistry::new(Arc::new(BoltClientFactory));
    let hooks = ShutdownHooks::new();
    registry
        .register_with_shutdown(name, connection, &hooks)
        .await
        .expect("failed to construct graph client");

    let app = router::app(AppState {
        client: name.to_string(),
        probe: HealthProbe::new(registry.clone()),
        bridge: MetricsBridge::new(registry.clone()),
        recorder: Some(recorder),
    });

    let listener = tokio::net::TcpListener::bind(config.bind())
        .await
        .expect("could not bind port");
    let signals = hooks.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { signals.wait_for_signal().await })
        .await
        .expect("failed to serve");

    tracing::info!("Shutting down gracefully...");
    hooks.run().await;
}
