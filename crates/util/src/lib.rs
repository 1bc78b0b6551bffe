pub mod config;

use std::{
    env,
    net::{AddrParseError, SocketAddr},
};

pub use config::{AppConfig, ConfigError, Environment};

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: &str = "8080";

/// Loads environment variables from `.env` when available.
///
/// Missing files are ignored so the function is safe in production builds
/// where dotenv files are not deployed.
pub fn load_env_file() {
    let _ = dotenvy::dotenv();
}

/// Reads an environment variable, treating blank values as unset.
pub fn env_value(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Returns the address the HTTP server should bind to.
///
/// The host comes from `APP_HOST` and the port from `APP_PORT`, falling back to
/// [`DEFAULT_HOST`] and [`DEFAULT_PORT`] respectively.
pub fn server_bind_address() -> Result<SocketAddr, AddrParseError> {
    let host = env_value("APP_HOST").unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = env_value("APP_PORT").unwrap_or_else(|| DEFAULT_PORT.to_string());
    format!("{host}:{port}").parse()
}

#[cfg(test)]
pub(crate) static ENV_GUARD: std::sync::LazyLock<std::sync::Mutex<()>> =
    std::sync::LazyLock::new(|| std::sync::Mutex::new(()));

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_default_address_when_env_missing() {
        let _lock = ENV_GUARD.lock().expect("env guard poisoned");
        env::remove_var("APP_HOST");
        env::remove_var("APP_PORT");
        let addr = server_bind_address().expect("default address is valid");
        assert_eq!(addr.to_string(), "0.0.0.0:8080");
    }

    #[test]
    fn parses_custom_port_from_env() {
        let _lock = ENV_GUARD.lock().expect("env guard poisoned");
        env::set_var("APP_HOST", "127.0.0.1");
        env::set_var("APP_PORT", "9000");
        let addr = server_bind_address().expect("custom address should parse");
        assert_eq!(addr.to_string(), "127.0.0.1:9000");
        env::remove_var("APP_HOST");
        env::remove_var("APP_PORT");
    }

    #[test]
    fn blank_port_falls_back_to_default() {
        let _lock = ENV_GUARD.lock().expect("env guard poisoned");
        env::remove_var("APP_HOST");
        env::set_var("APP_PORT", "   ");
        let addr = server_bind_address().expect("blank port uses default");
        assert_eq!(addr.port(), 8080);
        env::remove_var("APP_PORT");
    }

    #[test]
    fn rejects_non_numeric_port() {
        let _lock = ENV_GUARD.lock().expect("env guard poisoned");
        env::set_var("APP_PORT", "eighty");
        assert!(server_bind_address().is_err());
        env::remove_var("APP_PORT");
    }
}
