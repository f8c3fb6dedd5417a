use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

mod config;
pub mod mock;
mod pool;
mod protocol;
pub mod test_utils;
mod tls;

pub use config::{Address, AuthToken, DriverConfig, TlsMode, DEFAULT_BOLT_PORT};
pub use pool::BoltDriver;
pub use protocol::BoltVersion;

#[derive(Error, Debug, Clone)]
pub enum DriverError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("Connection refused by {0}")]
    ConnectionRefused(String),
    #[error("Authentication rejected: {0}")]
    AuthRejected(String),
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
    #[error("TLS error: {0}")]
    Tls(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Server failure {code}: {message}")]
    ServerFailure { code: String, message: String },
    #[error(transparent)]
    Io(#[from] Arc<std::io::Error>),
    #[error("Driver is closed")]
    Closed,
}

impl From<std::io::Error> for DriverError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::ConnectionRefused => DriverError::ConnectionRefused(err.to_string()),
            _ => DriverError::Io(Arc::new(err)),
        }
    }
}

impl DriverError {
    /// Returns `true` for errors that will fail again on retry until the
    /// configuration changes: bad configuration, rejected credentials or a
    /// server that does not speak a supported Bolt dialect.
    pub fn is_unrecoverable_error(&self) -> bool {
        match self {
            DriverError::InvalidConfiguration(_) => true,
            DriverError::AuthRejected(_) => true,
            DriverError::Protocol(_) => true,
            DriverError::Closed => true,

            DriverError::ConnectionRefused(_)
            | DriverError::Timeout(_)
            | DriverError::Tls(_)
            | DriverError::Io(_) => false,

            // Neo.ClientError.* codes are caused by the request, everything else
            // (TransientError, DatabaseError) may succeed later
            DriverError::ServerFailure { code, .. } => code.starts_with("Neo.ClientError."),
        }
    }
}

pub type GraphDriver = Arc<dyn Driver + Send + Sync>;

/// A pooled client for a graph database.
///
/// The owner of a driver is responsible for calling [`Driver::close`] exactly
/// once; every other holder only observes it through
/// [`Driver::verify_connectivity`] and [`Driver::pool_stats`].
#[async_trait]
pub trait Driver {
    /// Lightweight protocol round trip on a pooled connection.
    async fn verify_connectivity(&self) -> Result<(), DriverError>;

    /// Snapshot of the pool counters. Never blocks on I/O.
    fn pool_stats(&self) -> PoolStats;

    /// Close every pooled connection. Connections that fail to say goodbye
    /// are still dropped; the error reports how many did.
    async fn close(&self) -> Result<(), DriverError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub created: u64,
    pub closed: u64,
    pub failed_to_create: u64,
    pub acquiring: u64,
    pub acquired: u64,
    pub timed_out_to_acquire: u64,
    pub in_use: u64,
    pub idle: u64,
    pub total_acquisition_time: Duration,
    pub total_connection_time: Duration,
    pub total_in_use_time: Duration,
    pub total_in_use_count: u64,
}

impl PoolStats {
    /// Connections currently open, pooled or handed out.
    pub fn open(&self) -> u64 {
        self.created.saturating_sub(self.closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_errors_are_unrecoverable() {
        assert!(DriverError::InvalidConfiguration("empty uri".to_string()).is_unrecoverable_error());
        assert!(DriverError::AuthRejected("bad password".to_string()).is_unrecoverable_error());
        assert!(DriverError::Protocol("no common version".to_string()).is_unrecoverable_error());
    }

    #[test]
    fn test_network_errors_are_recoverable() {
        assert!(!DriverError::Timeout(Duration::from_secs(1)).is_unrecoverable_error());
        assert!(!DriverError::ConnectionRefused("127.0.0.1:7687".to_string()).is_unrecoverable_error());

        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "broken pipe");
        assert!(!DriverError::from(io).is_unrecoverable_error());
    }

    #[test]
    fn test_io_connection_refused_is_classified() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(matches!(
            DriverError::from(io),
            DriverError::ConnectionRefused(_)
        ));
    }

    #[test]
    fn test_server_failure_classification() {
        let client = DriverError::ServerFailure {
            code: "Neo.ClientError.Request.Invalid".to_string(),
            message: "bad request".to_string(),
        };
        assert!(client.is_unrecoverable_error());

        let transient = DriverError::ServerFailure {
            code: "Neo.TransientError.General.DatabaseUnavailable".to_string(),
            message: "starting".to_string(),
        };
        assert!(!transient.is_unrecoverable_error());
    }

    #[test]
    fn test_open_connections() {
        let stats = PoolStats {
            created: 5,
            closed: 2,
            ..Default::default()
        };
        assert_eq!(stats.open(), 3);
        assert_eq!(PoolStats::default().open(), 0);
    }
}
