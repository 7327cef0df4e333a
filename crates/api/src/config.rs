//! Process configuration: CLI flags, each overridable by an environment variable.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;

use companies_auth::Algorithm;
use companies_infra::ServicePolicy;
use companies_observability::ObservabilityError;

#[derive(Debug, Clone, Parser)]
#[command(name = "companies-api")]
#[command(about = "Company registry HTTP service.")]
pub struct Config {
    /// Address to bind the HTTP listener to
    #[arg(long = "listen", env = "LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: String,

    /// Log level used when RUST_LOG is not set
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// PostgreSQL URL; the in-memory store is used when absent
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    #[arg(long, env = "DATABASE_MAX_CONNECTIONS", default_value_t = 10)]
    pub database_max_connections: u32,

    /// Redis URL; the in-memory bus is used when absent
    #[arg(long, env = "REDIS_URL")]
    pub redis_url: Option<String>,

    /// Redis stream that change events are appended to
    #[arg(long, env = "EVENT_STREAM_KEY", default_value = "companies:events")]
    pub stream_key: String,

    /// Trim the stream to roughly this many entries; unbounded when absent
    #[arg(long, env = "EVENT_STREAM_MAX_LEN")]
    pub stream_max_len: Option<usize>,

    /// PEM file holding the token verification key
    #[arg(long, env = "AUTH_PUBLIC_KEY_FILE")]
    pub public_key_file: Option<PathBuf>,

    /// Inline PEM token verification key
    #[arg(long, env = "AUTH_PUBLIC_KEY")]
    pub public_key: Option<String>,

    /// Token signature algorithm (asymmetric only, e.g. RS256, ES256, EdDSA)
    #[arg(long, env = "AUTH_ALGORITHM", default_value = "RS256")]
    pub auth_algorithm: String,

    #[arg(long, env = "STORE_TIMEOUT_MS", default_value_t = 2_000)]
    pub store_timeout_ms: u64,

    /// Extra attempts when the store is unreachable
    #[arg(long, env = "STORE_RETRIES", default_value_t = 2)]
    pub store_retries: u32,

    #[arg(long, env = "EMIT_TIMEOUT_MS", default_value_t = 1_000)]
    pub emit_timeout_ms: u64,

    #[arg(long, env = "EMIT_ATTEMPTS", default_value_t = 3)]
    pub emit_attempts: u32,

    /// How long in-flight requests may drain after SIGINT/SIGTERM
    #[arg(long, env = "SHUTDOWN_GRACE_SECS", default_value_t = 30)]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid listen address '{0}'")]
    ListenAddr(String),

    #[error(transparent)]
    LogLevel(#[from] ObservabilityError),

    #[error("exactly one of --public-key-file / --public-key must be set")]
    PublicKeySource,

    #[error("failed to read public key file {path}: {source}")]
    PublicKeyFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("unsupported token algorithm '{0}' (use an asymmetric algorithm)")]
    Algorithm(String),

    #[error("{name} must start with one of {expected:?}")]
    UrlScheme {
        name: &'static str,
        expected: &'static [&'static str],
    },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

impl Config {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Check every setting before anything is started.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen_addr()?;
        companies_observability::parse_level(&self.log_level)?;
        self.algorithm()?;

        if self.public_key_file.is_some() == self.public_key.is_some() {
            return Err(ConfigError::PublicKeySource);
        }

        if let Some(url) = &self.database_url {
            check_scheme("DATABASE_URL", url, &["postgres://", "postgresql://"])?;
        }
        if let Some(url) = &self.redis_url {
            check_scheme("REDIS_URL", url, &["redis://", "rediss://"])?;
        }

        for (name, value) in [
            ("STORE_TIMEOUT_MS", self.store_timeout_ms),
            ("EMIT_TIMEOUT_MS", self.emit_timeout_ms),
            ("EMIT_ATTEMPTS", u64::from(self.emit_attempts)),
            ("DATABASE_MAX_CONNECTIONS", u64::from(self.database_max_connections)),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }
        if self.stream_max_len == Some(0) {
            return Err(ConfigError::Zero("EVENT_STREAM_MAX_LEN"));
        }
        if self.stream_key.trim().is_empty() {
            return Err(ConfigError::Zero("EVENT_STREAM_KEY length"));
        }

        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.listen_addr
            .parse()
            .map_err(|_| ConfigError::ListenAddr(self.listen_addr.clone()))
    }

    pub fn algorithm(&self) -> Result<Algorithm, ConfigError> {
        let algorithm = Algorithm::from_str(self.auth_algorithm.trim())
            .map_err(|_| ConfigError::Algorithm(self.auth_algorithm.clone()))?;
        match algorithm {
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => {
                Err(ConfigError::Algorithm(self.auth_algorithm.clone()))
            }
            other => Ok(other),
        }
    }

    /// PEM bytes of the verification key, from the file or the inline value.
    pub fn public_key_pem(&self) -> Result<Vec<u8>, ConfigError> {
        match (&self.public_key_file, &self.public_key) {
            (Some(path), None) => {
                std::fs::read(path).map_err(|source| ConfigError::PublicKeyFile {
                    path: path.clone(),
                    source,
                })
            }
            (None, Some(pem)) => Ok(pem.as_bytes().to_vec()),
            _ => Err(ConfigError::PublicKeySource),
        }
    }

    pub fn policy(&self) -> ServicePolicy {
        let defaults = ServicePolicy::default();
        ServicePolicy {
            store_timeout: Duration::from_millis(self.store_timeout_ms),
            store_retries: self.store_retries,
            emit_timeout: Duration::from_millis(self.emit_timeout_ms),
            emit_attempts: self.emit_attempts,
            store_backoff: defaults.store_backoff,
            emit_backoff: defaults.emit_backoff,
        }
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

fn check_scheme(
    name: &'static str,
    url: &str,
    expected: &'static [&'static str],
) -> Result<(), ConfigError> {
    if expected.iter().any(|scheme| url.starts_with(scheme)) {
        Ok(())
    } else {
        Err(ConfigError::UrlScheme { name, expected })
    }
}
