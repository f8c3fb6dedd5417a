use std::fmt;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::registry::LifecycleRegistry;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    Up,
    Down(String),
    /// No `Ready` client, or health checks are disabled for it.
    Unknown,
}

impl HealthStatus {
    pub fn reason(&self) -> Option<&str> {
        match self {
            HealthStatus::Down(reason) => Some(reason.as_str()),
            HealthStatus::Up | HealthStatus::Unknown => None,
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Up => f.write_str("UP"),
            HealthStatus::Down(reason) => write!(f, "DOWN: {reason}"),
            HealthStatus::Unknown => f.write_str("UNKNOWN"),
        }
    }
}

/// Checks client liveness with a bounded protocol round trip. Probing only
/// reads the registry: it never constructs, publishes or disposes a client.
#[derive(Clone)]
pub struct HealthProbe {
    registry: LifecycleRegistry,
}

impl HealthProbe {
    pub fn new(registry: LifecycleRegistry) -> Self {
        Self { registry }
    }

    pub async fn check(&self, name: &str) -> HealthStatus {
        let Some(handle) = self.registry.get(name) else {
            return HealthStatus::Unknown;
        };
        let config = handle.config();
        if !config.health_enabled {
            return HealthStatus::Unknown;
        }

        match tokio::time::timeout(config.health_timeout, handle.driver().verify_connectivity())
            .await
        {
            Ok(Ok(())) => HealthStatus::Up,
            Ok(Err(err)) => {
                tracing::debug!(client = %name, error = %err, "graph client liveness query failed");
                HealthStatus::Down(err.to_string())
            }
            Err(_) => {
                tracing::debug!(
                    client = %name,
                    timeout = ?config.health_timeout,
                    "graph client liveness query timed out"
                );
                HealthStatus::Down("timeout".to_string())
            }
        }
    }

    pub async fn report(&self, name: &str) -> HealthReport {
        HealthReport {
            client: name.to_string(),
            status: self.check(name).await,
        }
    }
}

#[derive(Debug)]
pub struct HealthReport {
    pub client: String,
    pub status: HealthStatus,
}

impl IntoResponse for HealthReport {
    /// Only an `Up` client is ready to serve traffic.
    fn into_response(self) -> Response {
        let body = format!("{}: {}", self.client, self.status);
        match self.status {
            HealthStatus::Up => (StatusCode::OK, body),
            HealthStatus::Down(_) | HealthStatus::Unknown => (StatusCode::SERVICE_UNAVAILABLE, body),
        }
        .into_response()
    }
}
