//! Configuration module for PingMeDaddy.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::fmt;

/// Application configuration loaded from environment variables.
#[derive(Clone)]
pub struct AppConfig {
    /// Path to the SQLite database file (default: "pingmedaddy.db")
    pub database_url: String,
    /// HTTP port for the API server (default: 8000)
    pub app_port: u16,
    /// Per-probe timeout in seconds (default: 2)
    pub ping_timeout: u64,
    /// Maximum number of in-flight probes across all targets (default: 50)
    pub ping_concurrency_limit: usize,
    /// Username accepted by /auth/login
    pub admin_username: String,
    /// Password accepted by /auth/login
    pub admin_password: String,
    /// HMAC secret for signing access tokens
    pub auth_secret: String,
    /// Access token lifetime in minutes (default: 60)
    pub auth_token_minutes: i64,
    /// Comma-separated list of allowed CORS origins, or "*"
    pub cors_origins: String,
    /// Traceroute binary to invoke (default: platform tool)
    pub traceroute_binary: String,
}

/// Redacts credentials so the config can be logged safely.
impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppConfig")
            .field("database_url", &self.database_url)
            .field("app_port", &self.app_port)
            .field("ping_timeout", &self.ping_timeout)
            .field("ping_concurrency_limit", &self.ping_concurrency_limit)
            .field("admin_username", &self.admin_username)
            .field("admin_password", &"[REDACTED]")
            .field("auth_secret", &"[REDACTED]")
            .field("auth_token_minutes", &self.auth_token_minutes)
            .field("cors_origins", &self.cors_origins)
            .field("traceroute_binary", &self.traceroute_binary)
            .finish()
    }
}

const DEFAULT_TRACEROUTE_BINARY: &str = if cfg!(windows) { "tracert" } else { "traceroute" };

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: "pingmedaddy.db".to_string(),
            app_port: 8000,
            ping_timeout: 2,
            ping_concurrency_limit: 50,
            admin_username: "admin".to_string(),
            admin_password: "admin".to_string(),
            auth_secret: "change-me".to_string(),
            auth_token_minutes: 60,
            cors_origins: "*".to_string(),
            traceroute_binary: DEFAULT_TRACEROUTE_BINARY.to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration from `PMD_*` environment variables.
    ///
    /// Unset or unparseable variables keep their defaults.
    pub fn load() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = env::var("PMD_DATABASE_URL") {
            cfg.database_url = v;
        }
        if let Ok(v) = env::var("PMD_APP_PORT") {
            if let Ok(port) = v.parse() {
                cfg.app_port = port;
            }
        }
        if let Ok(v) = env::var("PMD_PING_TIMEOUT") {
            if let Ok(secs) = v.parse() {
                cfg.ping_timeout = secs;
            }
        }
        if let Ok(v) = env::var("PMD_PING_CONCURRENCY_LIMIT") {
            if let Ok(limit) = v.parse::<usize>() {
                if limit > 0 {
                    cfg.ping_concurrency_limit = limit;
                }
            }
        }
        if let Ok(v) = env::var("PMD_ADMIN_USERNAME") {
            cfg.admin_username = v;
        }
        if let Ok(v) = env::var("PMD_ADMIN_PASSWORD") {
            cfg.admin_password = v;
        }
        if let Ok(v) = env::var("PMD_AUTH_SECRET") {
            cfg.auth_secret = v;
        }
        if let Ok(v) = env::var("PMD_AUTH_TOKEN_MINUTES") {
            if let Ok(minutes) = v.parse::<i64>() {
                if minutes > 0 {
                    cfg.auth_token_minutes = minutes;
                }
            }
        }
        if let Ok(v) = env::var("PMD_CORS_ORIGINS") {
            cfg.cors_origins = v;
        }
        if let Ok(v) = env::var("PMD_TRACEROUTE_BINARY") {
            cfg.traceroute_binary = v;
        }

        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.database_url, "pingmedaddy.db");
        assert_eq!(cfg.app_port, 8000);
        assert_eq!(cfg.ping_timeout, 2);
        assert_eq!(cfg.ping_concurrency_limit, 50);
        assert_eq!(cfg.auth_token_minutes, 60);
        assert_eq!(cfg.cors_origins, "*");
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let cfg = AppConfig::default();
        let dump = format!("{:?}", cfg);
        assert!(!dump.contains("change-me"));
        assert!(dump.contains("[REDACTED]"));
    }
}
