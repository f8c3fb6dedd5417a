use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Instant;

use axum::{body::Body, extract::MatchedPath, http::Request, middleware::Next, response::IntoResponse};
use common_bolt::PoolStats;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::registry::{HandleInner, LifecycleRegistry};

pub(crate) const METRIC_REGISTRATIONS: &str = "graph_client_registrations_total";
pub(crate) const METRIC_DISPOSALS: &str = "graph_client_disposals_total";

pub(crate) fn emit_registration(client: &str, result: &str) {
    metrics::counter!(
        METRIC_REGISTRATIONS,
        "client" => client.to_string(),
        "result" => result.to_string()
    )
    .increment(1);
}

pub(crate) fn emit_disposal(client: &str, result: &str) {
    metrics::counter!(
        METRIC_DISPOSALS,
        "client" => client.to_string(),
        "result" => result.to_string()
    )
    .increment(1);
}

/// Connection pool readings of one client, as exposed to the metrics sink.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolReadings {
    pub open_connections: u64,
    pub in_use_connections: u64,
    pub idle_connections: u64,
    pub created: u64,
    pub closed: u64,
    pub failed_to_create: u64,
    pub acquiring: u64,
    pub acquired: u64,
    pub timed_out_to_acquire: u64,
    pub total_acquisition_time_ms: u64,
    pub total_connection_time_ms: u64,
    pub total_in_use_time_ms: u64,
    pub total_in_use_count: u64,
}

impl From<&PoolStats> for PoolReadings {
    fn from(stats: &PoolStats) -> Self {
        Self {
            open_connections: stats.open(),
            in_use_connections: stats.in_use,
            idle_connections: stats.idle,
            created: stats.created,
            closed: stats.closed,
            failed_to_create: stats.failed_to_create,
            acquiring: stats.acquiring,
            acquired: stats.acquired,
            timed_out_to_acquire: stats.timed_out_to_acquire,
            total_acquisition_time_ms: stats.total_acquisition_time.as_millis() as u64,
            total_connection_time_ms: stats.total_connection_time.as_millis() as u64,
            total_in_use_time_ms: stats.total_in_use_time.as_millis() as u64,
            total_in_use_count: stats.total_in_use_count,
        }
    }
}

impl PoolReadings {
    /// Gauge name and value for every reading.
    pub fn gauges(&self) -> [(&'static str, u64); 13] {
        [
            ("graph_client_pool_open_connections", self.open_connections),
            ("graph_client_pool_in_use_connections", self.in_use_connections),
            ("graph_client_pool_idle_connections", self.idle_connections),
            ("graph_client_pool_created", self.created),
            ("graph_client_pool_closed", self.closed),
            ("graph_client_pool_failed_to_create", self.failed_to_create),
            ("graph_client_pool_acquiring", self.acquiring),
            ("graph_client_pool_acquired", self.acquired),
            ("graph_client_pool_timed_out_to_acquire", self.timed_out_to_acquire),
            ("graph_client_pool_acquisition_time_ms_total", self.total_acquisition_time_ms),
            ("graph_client_pool_connection_time_ms_total", self.total_connection_time_ms),
            ("graph_client_pool_in_use_time_ms_total", self.total_in_use_time_ms),
            ("graph_client_pool_in_use_count_total", self.total_in_use_count),
        ]
    }
}

/// Hands out metrics sources for registered clients.
#[derive(Clone)]
pub struct MetricsBridge {
    registry: LifecycleRegistry,
    // sources already published, kept so their gauges can be zeroed after disposal
    published: Arc<Mutex<HashMap<String, MetricsSource>>>,
}

impl MetricsBridge {
    pub fn new(registry: LifecycleRegistry) -> Self {
        Self {
            registry,
            published: Arc::default(),
        }
    }

    fn lock_published(&self) -> MutexGuard<'_, HashMap<String, MetricsSource>> {
        match self.published.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Publishes the readings of `name`, attaching on first use. A client
    /// published once keeps its gauges, at zero, after it is disposed.
    pub fn publish(&self, name: &str) -> bool {
        let mut published = self.lock_published();
        if !published.contains_key(name) {
            let Some(source) = self.attach(name) else {
                return false;
            };
            published.insert(name.to_string(), source);
        }
        published.get(name).is_some_and(MetricsSource::publish)
    }

    /// `None` when the client is not `Ready` or its metrics are disabled.
    pub fn attach(&self, name: &str) -> Option<MetricsSource> {
        let handle = self.registry.get(name)?;
        if !handle.config().metrics_enabled {
            tracing::debug!(client = %name, "graph client metrics disabled");
            return None;
        }
        Some(MetricsSource {
            client: name.to_string(),
            handle: handle.downgrade(),
        })
    }
}

/// Pool readings of one client. Holds no strong reference to the client and
/// goes quiet once the client is disposed.
#[derive(Clone)]
pub struct MetricsSource {
    client: String,
    handle: Weak<HandleInner>,
}

impl MetricsSource {
    pub fn client(&self) -> &str {
        &self.client
    }

    pub fn readings(&self) -> Option<PoolReadings> {
        let handle = self.handle.upgrade()?;
        if handle.is_disposed() {
            return None;
        }
        Some(PoolReadings::from(&handle.driver().pool_stats()))
    }

    /// Writes the current readings as gauges labelled with the client name.
    /// Once the client is gone every gauge is set to zero and this returns
    /// false.
    pub fn publish(&self) -> bool {
        let readings = self.readings();
        let live = readings.is_some();
        for (name, value) in readings.unwrap_or_default().gauges() {
            metrics::gauge!(name, "client" => self.client.clone()).set(value as f64);
        }
        live
    }
}

pub fn setup_metrics_recorder() -> PrometheusHandle {
    const EXPONENTIAL_SECONDS: &[f64] = &[
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(EXPONENTIAL_SECONDS)
        .expect("bucket list is not empty")
        .install_recorder()
        .expect("failed to install metrics recorder")
}

/// Middleware to record some common HTTP metrics
pub async fn track_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
    let start = Instant::now();

    let path = if let Some(matched_path) = req.extensions().get::<MatchedPath>() {
        matched_path.as_str().to_owned()
    } else {
        req.uri().path().to_owned()
    };

    let method = req.method().clone();

    let response = next.run(req).await;

    let latency = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    let labels = [
        ("method", method.to_string()),
        ("path", path),
        ("status", status),
    ];

    metrics::counter!("http_requests_total", &labels).increment(1);
    metrics::histogram!("http_requests_duration_seconds", &labels).record(latency);

    response
}
