use std::ops::Deref;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use common_bolt::{AuthToken, DriverConfig, TlsMode};
use envconfig::Envconfig;

use crate::error::InitError;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3310")]
    pub port: u16,

    #[envconfig(from = "LOG_JSON", default = "false")]
    pub log_json: FlexBool,

    #[envconfig(from = "GRAPH_CLIENT_NAME", default = "default")]
    pub client_name: NonEmptyString,

    #[envconfig(from = "GRAPH_URI", default = "bolt://localhost:7687")]
    pub uri: String,

    #[envconfig(from = "GRAPH_AUTH_DISABLED", default = "false")]
    pub auth_disabled: FlexBool,

    #[envconfig(from = "GRAPH_USERNAME", default = "neo4j")]
    pub username: String,

    #[envconfig(from = "GRAPH_PASSWORD", default = "neo4j")]
    pub password: String,

    #[envconfig(from = "GRAPH_TLS_MODE", default = "disabled")]
    pub tls_mode: TlsModeKind,

    #[envconfig(from = "GRAPH_TLS_CA_FILE")]
    pub tls_ca_file: Option<String>,

    #[envconfig(from = "GRAPH_TLS_HOSTNAME_VERIFICATION", default = "true")]
    pub tls_hostname_verification: FlexBool,

    #[envconfig(from = "GRAPH_MAX_POOL_SIZE", default = "100")]
    pub max_pool_size: u32,

    #[envconfig(from = "GRAPH_CONNECTION_TIMEOUT_MS", default = "30000")]
    pub connection_timeout: EnvMsDuration,

    #[envconfig(from = "GRAPH_ACQUISITION_TIMEOUT_MS", default = "60000")]
    pub acquisition_timeout: EnvMsDuration,

    // 0 keeps pooled connections forever
    #[envconfig(from = "GRAPH_MAX_CONNECTION_LIFETIME_MS", default = "3600000")]
    pub max_connection_lifetime: EnvMsDuration,

    #[envconfig(from = "GRAPH_HEALTH_TIMEOUT_MS", default = "2000")]
    pub health_timeout: EnvMsDuration,

    #[envconfig(from = "GRAPH_DISPOSE_TIMEOUT_MS", default = "10000")]
    pub dispose_timeout: EnvMsDuration,

    #[envconfig(from = "GRAPH_HEALTH_ENABLED", default = "true")]
    pub health_enabled: FlexBool,

    // unset means "enabled when a metrics recorder is installed"
    #[envconfig(from = "GRAPH_METRICS_ENABLED")]
    pub metrics_enabled: Option<FlexBool>,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Resolves the environment into the immutable connection parameters.
    /// Performs no I/O; problems are reported by [`ConnectionConfig::validate`].
    pub fn resolve(&self, metrics_sink_present: bool) -> ConnectionConfig {
        let auth = if *self.auth_disabled {
            AuthToken::None
        } else {
            AuthToken::Basic {
                username: self.username.clone(),
                password: self.password.clone(),
            }
        };

        let tls = match self.tls_mode {
            TlsModeKind::Disabled => TlsMode::Disabled,
            TlsModeKind::Required => TlsMode::Required,
            TlsModeKind::TrustAll => TlsMode::TrustAll,
            TlsModeKind::CustomCa => {
                TlsMode::CustomCa(self.tls_ca_file.clone().map(PathBuf::from).unwrap_or_default())
            }
        };

        let lifetime = self.max_connection_lifetime.0;

        ConnectionConfig {
            endpoint: self.uri.clone(),
            auth,
            tls,
            hostname_verification: *self.tls_hostname_verification,
            max_pool_size: self.max_pool_size,
            connection_timeout: self.connection_timeout.0,
            acquisition_timeout: self.acquisition_timeout.0,
            max_connection_lifetime: (!lifetime.is_zero()).then_some(lifetime),
            health_timeout: self.health_timeout.0,
            dispose_timeout: self.dispose_timeout.0,
            health_enabled: *self.health_enabled,
            metrics_enabled: self
                .metrics_enabled
                .as_ref()
                .map_or(metrics_sink_present, |enabled| **enabled),
        }
    }
}

/// Connection parameters for one logical client, fixed once resolved.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub endpoint: String,
    pub auth: AuthToken,
    pub tls: TlsMode,
    pub hostname_verification: bool,
    pub max_pool_size: u32,
    pub connection_timeout: Duration,
    pub acquisition_timeout: Duration,
    pub max_connection_lifetime: Option<Duration>,
    pub health_timeout: Duration,
    pub dispose_timeout: Duration,
    pub health_enabled: bool,
    pub metrics_enabled: bool,
}

impl ConnectionConfig {
    /// Defaults for everything but the endpoint, with authentication disabled.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            auth: AuthToken::None,
            tls: TlsMode::Disabled,
            hostname_verification: true,
            max_pool_size: 100,
            connection_timeout: Duration::from_secs(30),
            acquisition_timeout: Duration::from_secs(60),
            max_connection_lifetime: Some(Duration::from_secs(3600)),
            health_timeout: Duration::from_secs(2),
            dispose_timeout: Duration::from_secs(10),
            health_enabled: true,
            metrics_enabled: false,
        }
    }

    pub fn validate(&self) -> Result<(), InitError> {
        if let TlsMode::CustomCa(path) = &self.tls {
            if path.as_os_str().is_empty() {
                return Err(InitError::InvalidConfig(
                    "TLS mode custom-ca requires a CA file".to_string(),
                ));
            }
        }
        if self.health_timeout.is_zero() {
            return Err(InitError::InvalidConfig(
                "health check timeout must be positive".to_string(),
            ));
        }
        if self.dispose_timeout.is_zero() {
            return Err(InitError::InvalidConfig(
                "dispose timeout must be positive".to_string(),
            ));
        }
        self.driver_config().validate()?;
        Ok(())
    }

    pub fn driver_config(&self) -> DriverConfig {
        let mut config = DriverConfig::new(self.endpoint.clone(), self.auth.clone());
        config.tls = self.tls.clone();
        config.hostname_verification = self.hostname_verification;
        config.max_pool_size = self.max_pool_size;
        config.connection_timeout = self.connection_timeout;
        config.acquisition_timeout = self.acquisition_timeout;
        config.max_connection_lifetime = self.max_connection_lifetime;
        config
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsModeKind {
    Disabled,
    Required,
    TrustAll,
    CustomCa,
}

impl FromStr for TlsModeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('_', "-").as_str() {
            "disabled" | "" => Ok(TlsModeKind::Disabled),
            "required" => Ok(TlsModeKind::Required),
            "trust-all" => Ok(TlsModeKind::TrustAll),
            "custom-ca" => Ok(TlsModeKind::CustomCa),
            _ => Err(format!("Invalid TLS mode: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(Duration::from_millis(ms)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlexBool(pub bool);

impl FromStr for FlexBool {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(FlexBool(true)),
            "false" | "0" | "no" | "off" | "" => Ok(FlexBool(false)),
            _ => Err(format!("Invalid boolean value: {}", s)),
        }
    }
}

impl Deref for FlexBool {
    type Target = bool;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Debug, Clone)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}
