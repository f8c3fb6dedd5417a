use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use crate::DriverError;

pub const DEFAULT_BOLT_PORT: u16 = 7687;

const DEFAULT_USER_AGENT: &str = concat!("graph-lifecycle/", env!("CARGO_PKG_VERSION"));

#[derive(Clone, PartialEq, Eq)]
pub enum AuthToken {
    None,
    Basic { username: String, password: String },
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthToken::None => f.write_str("None"),
            AuthToken::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlsMode {
    Disabled,
    /// Encrypted, server certificate checked against the webpki roots.
    Required,
    /// Encrypted, any server certificate accepted.
    TrustAll,
    /// Encrypted, server certificate checked against the PEM bundle at this path.
    CustomCa(PathBuf),
}

impl TlsMode {
    pub fn is_encrypted(&self) -> bool {
        !matches!(self, TlsMode::Disabled)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Where to connect and how to secure the connection, after the URI scheme
/// and the explicit TLS mode have been reconciled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Target {
    pub address: Address,
    pub tls: TlsMode,
}

#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub uri: String,
    pub auth: AuthToken,
    pub tls: TlsMode,
    pub hostname_verification: bool,
    pub max_pool_size: u32,
    pub connection_timeout: Duration,
    pub acquisition_timeout: Duration,
    pub max_connection_lifetime: Option<Duration>,
    pub user_agent: String,
}

impl DriverConfig {
    pub fn new(uri: impl Into<String>, auth: AuthToken) -> Self {
        Self {
            uri: uri.into(),
            auth,
            tls: TlsMode::Disabled,
            hostname_verification: true,
            max_pool_size: 100,
            connection_timeout: Duration::from_secs(30),
            acquisition_timeout: Duration::from_secs(60),
            max_connection_lifetime: Some(Duration::from_secs(3600)),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }

    /// Checks everything that can be checked without touching the network.
    pub fn validate(&self) -> Result<(), DriverError> {
        if self.max_pool_size == 0 {
            return Err(DriverError::InvalidConfiguration(
                "max pool size must be positive".to_string(),
            ));
        }
        if self.connection_timeout.is_zero() {
            return Err(DriverError::InvalidConfiguration(
                "connection timeout must be positive".to_string(),
            ));
        }
        if self.acquisition_timeout.is_zero() {
            return Err(DriverError::InvalidConfiguration(
                "connection acquisition timeout must be positive".to_string(),
            ));
        }
        if let Some(lifetime) = self.max_connection_lifetime {
            if lifetime.is_zero() {
                return Err(DriverError::InvalidConfiguration(
                    "max connection lifetime cannot be zero - use None to keep connections forever"
                        .to_string(),
                ));
            }
        }
        self.target().map(|_| ())
    }

    pub(crate) fn target(&self) -> Result<Target, DriverError> {
        if self.uri.trim().is_empty() {
            return Err(DriverError::InvalidConfiguration(
                "endpoint uri is empty".to_string(),
            ));
        }

        let url = Url::parse(&self.uri).map_err(|e| {
            DriverError::InvalidConfiguration(format!("invalid endpoint uri '{}': {e}", self.uri))
        })?;

        let (base, scheme_tls) = match url.scheme().split_once('+') {
            None => (url.scheme(), None),
            Some((base, "s")) => (base, Some(TlsMode::Required)),
            Some((base, "ssc")) => (base, Some(TlsMode::TrustAll)),
            Some(_) => {
                return Err(DriverError::InvalidConfiguration(format!(
                    "unsupported uri scheme '{}'",
                    url.scheme()
                )))
            }
        };
        if base != "bolt" && base != "neo4j" {
            return Err(DriverError::InvalidConfiguration(format!(
                "unsupported uri scheme '{}'",
                url.scheme()
            )));
        }

        let host = url
            .host_str()
            .map(|h| h.trim_start_matches('[').trim_end_matches(']'))
            .filter(|h| !h.is_empty())
            .ok_or_else(|| {
                DriverError::InvalidConfiguration(format!("endpoint uri '{}' has no host", self.uri))
            })?;

        let tls = match (scheme_tls, &self.tls) {
            (None, explicit) => explicit.clone(),
            (Some(implied), TlsMode::Disabled) => implied,
            (Some(_), _) => {
                return Err(DriverError::InvalidConfiguration(format!(
                    "scheme '{}' already selects TLS, the explicit TLS mode must stay disabled",
                    url.scheme()
                )))
            }
        };

        Ok(Target {
            address: Address {
                host: host.to_string(),
                port: url.port().unwrap_or(DEFAULT_BOLT_PORT),
            },
            tls,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(uri: &str) -> DriverConfig {
        DriverConfig::new(uri, AuthToken::None)
    }

    #[test]
    fn test_plain_bolt_uri() {
        let target = config("bolt://localhost:7687").target().unwrap();
        assert_eq!(
            target.address,
            Address {
                host: "localhost".to_string(),
                port: 7687
            }
        );
        assert_eq!(target.tls, TlsMode::Disabled);
    }

    #[test]
    fn test_default_port() {
        let target = config("neo4j://graph.internal").target().unwrap();
        assert_eq!(target.address.port, DEFAULT_BOLT_PORT);
        assert_eq!(target.address.to_string(), "graph.internal:7687");
    }

    #[test]
    fn test_ipv6_host() {
        let target = config("bolt://[::1]:9999").target().unwrap();
        assert_eq!(target.address.host, "::1");
        assert_eq!(target.address.to_string(), "[::1]:9999");
    }

    #[test]
    fn test_scheme_implies_tls() {
        assert_eq!(
            config("bolt+s://localhost").target().unwrap().tls,
            TlsMode::Required
        );
        assert_eq!(
            config("neo4j+ssc://localhost").target().unwrap().tls,
            TlsMode::TrustAll
        );
    }

    #[test]
    fn test_scheme_tls_conflicts_with_explicit_mode() {
        let mut cfg = config("bolt+s://localhost");
        cfg.tls = TlsMode::TrustAll;
        assert!(matches!(
            cfg.target(),
            Err(DriverError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_invalid_uris() {
        for uri in ["", "   ", "http://localhost:7474", "bolt+x://localhost", "not a uri"] {
            assert!(
                matches!(
                    config(uri).validate(),
                    Err(DriverError::InvalidConfiguration(_))
                ),
                "expected {uri:?} to be rejected"
            );
        }
    }

    #[test]
    fn test_invalid_limits() {
        let mut cfg = config("bolt://localhost:7687");
        cfg.max_pool_size = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = config("bolt://localhost:7687");
        cfg.connection_timeout = Duration::ZERO;
        assert!(cfg.validate().is_err());

        let mut cfg = config("bolt://localhost:7687");
        cfg.acquisition_timeout = Duration::ZERO;
        assert!(cfg.validate().is_err());

        let mut cfg = config("bolt://localhost:7687");
        cfg.max_connection_lifetime = Some(Duration::ZERO);
        assert!(cfg.validate().is_err());

        assert!(config("bolt://localhost:7687").validate().is_ok());
    }

    #[test]
    fn test_password_is_redacted() {
        let auth = AuthToken::Basic {
            username: "neo4j".to_string(),
            password: "s3cret".to_string(),
        };
        let printed = format!("{auth:?}");
        assert!(printed.contains("neo4j"));
        assert!(!printed.contains("s3cret"));
    }
}
