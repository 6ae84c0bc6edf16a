//! Service configuration.
//!
//! All values come from environment variables (a `.env` file is loaded by the
//! service binaries before this runs). Missing or unparsable values fall back
//! to defaults.

use std::collections::HashMap;

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8081;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_MAX_CONNECTIONS: u32 = 5;
const DEFAULT_DUMP_FLUSH_BYTES: usize = 64 * 1024;
const DEFAULT_PLATFORM_NAME: &str = "db-manager";
const DEFAULT_FLOW_SERVICE_URL: &str = "http://127.0.0.1:8083";

/// Application configuration shared by the services.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Service name, used in logs and response metadata.
    pub service_name: String,
    /// Listen host.
    pub host: String,
    /// Listen port.
    pub port: u16,
    /// Metadata store URL (`DATABASE_URL`). `None` runs with the in-memory store.
    pub database_url: Option<String>,
    /// Timeout for establishing a connection to a managed instance.
    pub connect_timeout_secs: u64,
    /// Pool size per managed relational connection.
    pub max_connections: u32,
    /// Buffered bytes after which the dump writer flushes.
    pub dump_flush_bytes: usize,
    /// Platform name written into dump headers.
    pub dump_platform_name: String,
    /// Secret the stored passwords are encrypted with.
    pub password_secret: String,
}

impl AppConfig {
    /// Loads the configuration for the named service from the process environment.
    pub fn load_with_service(service_name: &str) -> Self {
        Self::from_lookup(service_name, |key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup.
    pub fn from_lookup(service_name: &str, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parse = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        Self {
            service_name: service_name.to_string(),
            host: parse("SERVER_HOST").unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: parse("SERVER_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_PORT),
            database_url: parse("DATABASE_URL"),
            connect_timeout_secs: parse("DB_CONNECT_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS),
            max_connections: parse("DB_MAX_CONNECTIONS")
                .and_then(|v| v.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(DEFAULT_MAX_CONNECTIONS),
            dump_flush_bytes: parse("DUMP_FLUSH_BYTES")
                .and_then(|v| v.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(DEFAULT_DUMP_FLUSH_BYTES),
            dump_platform_name: parse("DUMP_PLATFORM_NAME")
                .unwrap_or_else(|| DEFAULT_PLATFORM_NAME.to_string()),
            password_secret: parse("PASSWORD_SECRET").unwrap_or_default(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::from_lookup("connection-service", |_| None)
    }
}

/// Addresses of the services this workspace talks to.
#[derive(Debug, Clone)]
pub struct ServiceUrls {
    /// Approval workflow service.
    pub flow_service: String,
}

impl ServiceUrls {
    /// Loads service URLs from the environment.
    pub fn load() -> Self {
        let vars: HashMap<String, String> = std::env::vars().collect();
        Self {
            flow_service: vars
                .get("FLOW_SERVICE_URL")
                .cloned()
                .unwrap_or_else(|| DEFAULT_FLOW_SERVICE_URL.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_unset() {
        let config = AppConfig::from_lookup("svc", |_| None);
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.dump_flush_bytes, DEFAULT_DUMP_FLUSH_BYTES);
        assert!(config.database_url.is_none());
    }

    #[test]
    fn test_values_from_lookup() {
        let env: HashMap<&str, &str> = [
            ("SERVER_PORT", "9000"),
            ("DB_CONNECT_TIMEOUT_SECS", "3"),
            ("DB_MAX_CONNECTIONS", "0"),
            ("DATABASE_URL", " mysql://root@localhost/meta "),
        ]
        .into_iter()
        .collect();
        let config = AppConfig::from_lookup("svc", |k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.port, 9000);
        assert_eq!(config.connect_timeout_secs, 3);
        assert_eq!(config.max_connections, DEFAULT_MAX_CONNECTIONS);
        assert_eq!(config.database_url.as_deref(), Some("mysql://root@localhost/meta"));
    }
}
