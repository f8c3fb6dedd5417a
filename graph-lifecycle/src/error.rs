use std::time::Duration;

use common_bolt::DriverError;
use thiserror::Error;

/// Why a client could not be constructed. Cloneable so that every caller
/// racing on the same registration observes the same error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InitError {
    #[error("invalid graph client configuration: {0}")]
    InvalidConfig(String),
    #[error("graph server refused the connection: {0}")]
    ConnectionRefused(String),
    #[error("graph server rejected the credentials: {0}")]
    AuthRejected(String),
    #[error("graph server did not answer within {0:?}")]
    ConnectTimeout(Duration),
    #[error("graph client {0} has already been disposed")]
    Disposed(String),
}

impl InitError {
    /// Whether calling register again without changing anything may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            InitError::ConnectionRefused(_) | InitError::ConnectTimeout(_) => true,
            InitError::InvalidConfig(_) | InitError::AuthRejected(_) | InitError::Disposed(_) => {
                false
            }
        }
    }

    pub(crate) fn as_label(&self) -> &'static str {
        match self {
            InitError::InvalidConfig(_) => "invalid_config",
            InitError::ConnectionRefused(_) => "connection_refused",
            InitError::AuthRejected(_) => "auth_rejected",
            InitError::ConnectTimeout(_) => "connect_timeout",
            InitError::Disposed(_) => "disposed",
        }
    }
}

impl From<DriverError> for InitError {
    fn from(err: DriverError) -> Self {
        match err {
            DriverError::InvalidConfiguration(msg) => InitError::InvalidConfig(msg),
            DriverError::AuthRejected(msg) => InitError::AuthRejected(msg),
            DriverError::Timeout(after) => InitError::ConnectTimeout(after),
            DriverError::ConnectionRefused(msg) => InitError::ConnectionRefused(msg),
            // the server answered but will keep refusing us until the
            // configuration changes
            other if other.is_unrecoverable_error() => InitError::InvalidConfig(other.to_string()),
            other => InitError::ConnectionRefused(other.to_string()),
        }
    }
}

/// A close that did not finish cleanly. Reported, never raised: the client
/// is considered disposed either way.
#[derive(Error, Debug, Clone)]
pub enum DisposalFailure {
    #[error("closing the graph client failed: {0}")]
    CloseFailed(#[source] DriverError),
    #[error("closing the graph client did not finish within {0:?}")]
    CloseTimedOut(Duration),
}
