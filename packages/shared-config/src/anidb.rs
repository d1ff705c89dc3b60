//! AniDB integration configuration types

use crate::{get_env_or_default, parse_env, ConfigError, ConfigResult};
use std::env;
use std::fmt;

/// AniDB UDP API and HTTP API configuration
#[derive(Clone)]
pub struct AniDbConfig {
    /// AniDB account name (UDP API login)
    pub username: Option<String>,

    /// AniDB account password (UDP API login)
    pub password: Option<String>,

    /// UDP API host
    pub udp_host: String,

    /// UDP API port
    pub udp_port: u16,

    /// Local UDP port the client binds to
    pub client_port: u16,

    /// HTTP API endpoint
    pub http_url: String,

    /// Registered client name sent with every request
    pub client_name: String,

    /// Registered client version sent with every request
    pub client_version: u32,

    /// Keep-alive ping interval in seconds while a session is idle
    pub ping_interval_secs: u64,

    /// Idle time in seconds after which the session is logged out
    pub idle_logout_secs: u64,

    /// Length of a UDP ban window in hours
    pub udp_ban_hours: f64,

    /// Length of an HTTP ban window in hours
    pub http_ban_hours: f64,

    /// Timeout for a single request/response exchange in seconds
    pub request_timeout_secs: u64,
}

impl fmt::Debug for AniDbConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AniDbConfig")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("udp_host", &self.udp_host)
            .field("udp_port", &self.udp_port)
            .field("client_port", &self.client_port)
            .field("http_url", &self.http_url)
            .field("client_name", &self.client_name)
            .field("client_version", &self.client_version)
            .finish_non_exhaustive()
    }
}

impl AniDbConfig {
    /// Load AniDB configuration from environment variables
    ///
    /// Credentials are optional: without them the worker still runs, but
    /// jobs that need a UDP session stay paused.
    pub fn from_env() -> ConfigResult<Self> {
        let config = Self {
            username: non_empty_env("ANIDB_USERNAME"),
            password: non_empty_env("ANIDB_PASSWORD"),
            udp_host: get_env_or_default("ANIDB_UDP_HOST", "api.anidb.net"),
            udp_port: parse_env("ANIDB_UDP_PORT", 9000)?,
            client_port: parse_env("ANIDB_CLIENT_PORT", 4556)?,
            http_url: get_env_or_default("ANIDB_HTTP_URL", "http://api.anidb.net:9001/httpapi"),
            client_name: get_env_or_default("ANIDB_CLIENT_NAME", "tsundoku"),
            client_version: parse_env("ANIDB_CLIENT_VERSION", 1)?,
            ping_interval_secs: parse_env("ANIDB_PING_INTERVAL", 90)?,
            idle_logout_secs: parse_env("ANIDB_IDLE_LOGOUT", 300)?,
            udp_ban_hours: parse_env("ANIDB_UDP_BAN_HOURS", 1.5)?,
            http_ban_hours: parse_env("ANIDB_HTTP_BAN_HOURS", 12.0)?,
            request_timeout_secs: parse_env("ANIDB_REQUEST_TIMEOUT", 20)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check the values that would make the client unusable
    pub fn validate(&self) -> ConfigResult<()> {
        if self.udp_port == 0 {
            return Err(ConfigError::InvalidValue(
                "ANIDB_UDP_PORT".to_string(),
                "port cannot be 0".to_string(),
            ));
        }
        if self.client_port == 0 {
            return Err(ConfigError::InvalidValue(
                "ANIDB_CLIENT_PORT".to_string(),
                "port cannot be 0".to_string(),
            ));
        }
        if !self.http_url.starts_with("http://") && !self.http_url.starts_with("https://") {
            return Err(ConfigError::InvalidUrl(
                "ANIDB_HTTP_URL".to_string(),
                self.http_url.clone(),
            ));
        }
        if self.udp_ban_hours <= 0.0 || self.http_ban_hours <= 0.0 {
            return Err(ConfigError::ValidationError(
                "ban windows must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Username and password, if both are configured
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => Some((user.as_str(), pass.as_str())),
            _ => None,
        }
    }

    /// Address of the UDP API server as `host:port`
    pub fn udp_server_addr(&self) -> String {
        format!("{}:{}", self.udp_host, self.udp_port)
    }
}

impl Default for AniDbConfig {
    fn default() -> Self {
        Self {
            username: None,
            password: None,
            udp_host: "api.anidb.net".to_string(),
            udp_port: 9000,
            client_port: 4556,
            http_url: "http://api.anidb.net:9001/httpapi".to_string(),
            client_name: "tsundoku".to_string(),
            client_version: 1,
            ping_interval_secs: 90,
            idle_logout_secs: 300,
            udp_ban_hours: 1.5,
            http_ban_hours: 12.0,
            request_timeout_secs: 20,
        }
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AniDbConfig::default();
        assert_eq!(config.udp_server_addr(), "api.anidb.net:9000");
        assert!(config.credentials().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_credentials_require_both_values() {
        let config = AniDbConfig {
            username: Some("user".to_string()),
            ..AniDbConfig::default()
        };
        assert!(config.credentials().is_none());

        let config = AniDbConfig {
            username: Some("user".to_string()),
            password: Some("secret".to_string()),
            ..AniDbConfig::default()
        };
        assert_eq!(config.credentials(), Some(("user", "secret")));
    }

    #[test]
    fn test_debug_redacts_password() {
        let config = AniDbConfig {
            password: Some("hunter2".to_string()),
            ..AniDbConfig::default()
        };
        let debug_str = format!("{:?}", config);
        assert!(!debug_str.contains("hunter2"));
        assert!(debug_str.contains("[REDACTED]"));
    }

    #[test]
    fn test_validate_rejects_zero_port() {
        let config = AniDbConfig {
            client_port: 0,
            ..AniDbConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue(name, _)) if name == "ANIDB_CLIENT_PORT"
        ));
    }

    #[test]
    fn test_from_env_blank_credentials_are_ignored() {
        temp_env::with_vars(
            [
                ("ANIDB_USERNAME", Some("  ")),
                ("ANIDB_PASSWORD", Some("secret")),
                ("ANIDB_UDP_BAN_HOURS", Some("2")),
            ],
            || {
                let config = AniDbConfig::from_env().unwrap();
                assert!(config.username.is_none());
                assert!((config.udp_ban_hours - 2.0).abs() < f64::EPSILON);
            },
        );
    }

    #[test]
    fn test_from_env_rejects_bad_url() {
        temp_env::with_var("ANIDB_HTTP_URL", Some("ftp://anidb"), || {
            assert!(matches!(
                AniDbConfig::from_env(),
                Err(ConfigError::InvalidUrl(_, _))
            ));
        });
    }
}
