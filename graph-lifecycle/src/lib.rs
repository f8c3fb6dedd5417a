pub mod config;
pub mod error;
pub mod factory;
pub mod health;
pub mod metrics;
pub mod registry;
pub mod router;
pub mod shutdown;

// Compiled into the library so integration tests can use it.
pub mod test_utils;

pub use config::{Config, ConnectionConfig};
pub use error::{DisposalFailure, InitError};
pub use factory::{BoltClientFactory, ClientFactory, SharedFactory};
pub use health::{HealthProbe, HealthReport, HealthStatus};
pub use metrics::{MetricsBridge, MetricsSource, PoolReadings};
pub use registry::{ClientHandle, DisposalOutcome, DisposalToken, LifecycleRegistry, LifecycleState};
pub use shutdown::{ShutdownCallback, ShutdownCoordinator, ShutdownHooks};
