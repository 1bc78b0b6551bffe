use std::{fmt, net::SocketAddr, str::FromStr, time::Duration};

use super::{env_value, server_bind_address};

pub const DEFAULT_DATABASE_URL: &str = "sqlite://products.db?mode=rwc";
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;
pub const DEFAULT_NOTIFY_DELAY_MS: u64 = 5_000;
pub const DEFAULT_NOTIFY_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 30;

/// Application runtime environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => Err(ConfigError::InvalidEnvironment(other.to_string())),
        }
    }

    /// Returns the canonical name used for logging/metrics labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
        }
    }
}

/// Runtime configuration resolved from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub environment: Environment,
    /// Connection string handed to the product store.
    pub database_url: String,
    /// Number of notification events the queue buffers before overflowing.
    pub queue_capacity: usize,
    /// Simulated duration of one downstream notification.
    pub notify_delay: Duration,
    /// Deadline for one notification before the worker gives up on it.
    pub notify_timeout: Duration,
    /// Upper bound for the HTTP server's graceful stop.
    pub shutdown_timeout: Duration,
    /// Upper bound for draining the notification queue after the server stopped.
    pub drain_timeout: Duration,
}

impl AppConfig {
    /// Constructs the configuration by reading and validating environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let env_value_raw = env_value("APP_ENV").unwrap_or_else(|| "development".to_string());
        let environment = Environment::from_str(&env_value_raw)?;
        let bind_addr = server_bind_address().map_err(ConfigError::BindAddress)?;
        let database_url =
            env_value("DB_DSN").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string());

        let queue_capacity = parse_var("NOTIFY_QUEUE_CAPACITY", DEFAULT_QUEUE_CAPACITY)?;
        if queue_capacity == 0 {
            return Err(ConfigError::ZeroQueueCapacity);
        }

        let notify_delay =
            Duration::from_millis(parse_var("NOTIFY_DELAY_MS", DEFAULT_NOTIFY_DELAY_MS)?);
        let notify_timeout =
            Duration::from_millis(parse_var("NOTIFY_TIMEOUT_MS", DEFAULT_NOTIFY_TIMEOUT_MS)?);
        let shutdown_timeout = Duration::from_secs(parse_var(
            "SHUTDOWN_TIMEOUT_SECS",
            DEFAULT_SHUTDOWN_TIMEOUT_SECS,
        )?);
        let drain_timeout =
            Duration::from_secs(parse_var("DRAIN_TIMEOUT_SECS", DEFAULT_DRAIN_TIMEOUT_SECS)?);

        Ok(Self {
            bind_addr,
            environment,
            database_url,
            queue_capacity,
            notify_delay,
            notify_timeout,
            shutdown_timeout,
            drain_timeout,
        })
    }
}

fn parse_var<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env_value(name) {
        Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidNumber {
            variable: name,
            value: raw,
        }),
        None => Ok(default),
    }
}

/// Errors that can occur during configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    InvalidEnvironment(String),
    BindAddress(std::net::AddrParseError),
    InvalidNumber {
        variable: &'static str,
        value: String,
    },
    ZeroQueueCapacity,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEnvironment(value) => write!(
                f,
                "APP_ENV must be one of 'development', 'production', or 'test' (got {value})"
            ),
            Self::BindAddress(err) => write!(f, "invalid APP_HOST/APP_PORT value: {err}"),
            Self::InvalidNumber { variable, value } => {
                write!(f, "{variable} must be a non-negative integer (got {value})")
            }
            Self::ZeroQueueCapacity => write!(f, "NOTIFY_QUEUE_CAPACITY must be at least 1"),
        }
    }
}

impl std::error::Error for ConfigError {}
