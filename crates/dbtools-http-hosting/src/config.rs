//! Web server configuration and its environment overlay

use std::net::SocketAddr;
use std::time::Duration;

use crate::HttpHostingError;
use crate::session::DEFAULT_SESSION_IDLE_TIMEOUT;

pub const ENV_CORS_ORIGINS: &str = "CORS_ORIGINS";
pub const ENV_ENABLE_DYNAMIC_CORS: &str = "ENABLE_DYNAMIC_CORS";
pub const ENV_DISABLE_KEEP_ALIVE: &str = "DISABLE_KEEP_ALIVE";
pub const ENV_LISTEN_ADDRESS: &str = "LISTEN_ADDRESS";
pub const ENV_LISTEN_PORT: &str = "LISTEN_PORT";

/// Configuration for the HTTP + WebSocket transport
#[derive(Debug, Clone)]
pub struct WebServerConfig {
    /// Address to listen on
    pub listen_address: String,
    /// Port to listen on
    pub listen_port: u16,
    /// Origins allowed to open connections and read responses
    pub cors_origins: Vec<String>,
    /// Allow every origin
    pub enable_dynamic_cors: bool,
    /// Stop sending keep-alive pings (useful while debugging clients)
    pub disable_keep_alive: bool,
    /// Interval between keep-alive pings
    pub ping_interval: Duration,
    /// How long a connection without a valid session stays open before it is closed
    pub reject_grace_period: Duration,
    /// Name of the cookie carrying the session id
    pub session_cookie_name: String,
    /// Mark the session cookie `Secure; SameSite=None`
    pub secure_cookie: bool,
    /// Path of the WebSocket push channel
    pub websocket_path: String,
    /// Maximum accepted request body size
    pub max_body_size: usize,
    /// How long a session without a WebSocket connection is kept
    pub session_idle_timeout: Duration,
}

impl Default for WebServerConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0".to_string(),
            listen_port: 8443,
            cors_origins: vec!["http://localhost".to_string()],
            enable_dynamic_cors: false,
            disable_keep_alive: false,
            ping_interval: Duration::from_secs(25),
            reject_grace_period: Duration::from_secs(1),
            session_cookie_name: "session_id".to_string(),
            secure_cookie: true,
            websocket_path: "/ws".to_string(),
            max_body_size: 16 * 1024 * 1024, // 16MB
            session_idle_timeout: DEFAULT_SESSION_IDLE_TIMEOUT,
        }
    }
}

impl WebServerConfig {
    /// Defaults overlaid with the process environment
    pub fn from_env() -> Result<Self, HttpHostingError> {
        Self::default().overlay_env(|key| std::env::var(key).ok())
    }

    /// Overlay values produced by `lookup` (keyed by environment variable name)
    pub fn overlay_env<F>(mut self, lookup: F) -> Result<Self, HttpHostingError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(origins) = lookup(ENV_CORS_ORIGINS) {
            self.cors_origins = parse_origins(&origins);
        }
        if let Some(value) = lookup(ENV_ENABLE_DYNAMIC_CORS) {
            self.enable_dynamic_cors = parse_flag(ENV_ENABLE_DYNAMIC_CORS, &value)?;
        }
        if let Some(value) = lookup(ENV_DISABLE_KEEP_ALIVE) {
            self.disable_keep_alive = parse_flag(ENV_DISABLE_KEEP_ALIVE, &value)?;
        }
        if let Some(address) = lookup(ENV_LISTEN_ADDRESS) {
            self.listen_address = address.trim().to_string();
        }
        if let Some(port) = lookup(ENV_LISTEN_PORT) {
            self.listen_port = port.trim().parse().map_err(|_| {
                HttpHostingError::InvalidConfig(format!(
                    "{} must be a port number, got '{}'",
                    ENV_LISTEN_PORT, port
                ))
            })?;
        }
        Ok(self)
    }

    pub fn listen_address(mut self, address: impl Into<String>) -> Self {
        self.listen_address = address.into();
        self
    }

    pub fn listen_port(mut self, port: u16) -> Self {
        self.listen_port = port;
        self
    }

    pub fn cors_origins(mut self, origins: Vec<String>) -> Self {
        self.cors_origins = origins;
        self
    }

    pub fn enable_dynamic_cors(mut self, enable: bool) -> Self {
        self.enable_dynamic_cors = enable;
        self
    }

    pub fn disable_keep_alive(mut self, disable: bool) -> Self {
        self.disable_keep_alive = disable;
        self
    }

    pub fn reject_grace_period(mut self, grace: Duration) -> Self {
        self.reject_grace_period = grace;
        self
    }

    pub fn session_idle_timeout(mut self, timeout: Duration) -> Self {
        self.session_idle_timeout = timeout;
        self
    }

    pub fn secure_cookie(mut self, secure: bool) -> Self {
        self.secure_cookie = secure;
        self
    }

    /// Ping interval, or `None` when keep-alive is disabled
    pub fn keep_alive_interval(&self) -> Option<Duration> {
        if self.disable_keep_alive {
            None
        } else {
            Some(self.ping_interval)
        }
    }

    pub fn bind_address(&self) -> Result<SocketAddr, HttpHostingError> {
        format!("{}:{}", self.listen_address, self.listen_port)
            .parse()
            .map_err(|e| {
                HttpHostingError::InvalidConfig(format!(
                    "invalid listen address {}:{}: {}",
                    self.listen_address, self.listen_port, e
                ))
            })
    }
}

/// Split a comma-separated origin list, dropping empty entries
pub fn parse_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_flag(name: &str, value: &str) -> Result<bool, HttpHostingError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(HttpHostingError::InvalidConfig(format!(
            "{} must be a boolean, got '{}'",
            name, other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = WebServerConfig::default();
        assert_eq!(config.bind_address().unwrap().to_string(), "0.0.0.0:8443");
        assert_eq!(config.cors_origins, vec!["http://localhost"]);
        assert_eq!(config.keep_alive_interval(), Some(Duration::from_secs(25)));
        assert_eq!(config.reject_grace_period, Duration::from_secs(1));
        assert_eq!(config.session_idle_timeout, Duration::from_secs(3600));
    }

    #[test]
    fn test_env_overlay() {
        let config = WebServerConfig::default()
            .overlay_env(lookup(&[
                (ENV_CORS_ORIGINS, " https://a.example , ,https://b.example"),
                (ENV_ENABLE_DYNAMIC_CORS, "true"),
                (ENV_DISABLE_KEEP_ALIVE, "1"),
                (ENV_LISTEN_ADDRESS, "127.0.0.1"),
                (ENV_LISTEN_PORT, "9000"),
            ]))
            .unwrap();

        assert_eq!(
            config.cors_origins,
            vec!["https://a.example", "https://b.example"]
        );
        assert!(config.enable_dynamic_cors);
        assert_eq!(config.keep_alive_interval(), None);
        assert_eq!(config.bind_address().unwrap().to_string(), "127.0.0.1:9000");
    }

    #[test]
    fn test_env_overlay_rejects_bad_values() {
        assert!(
            WebServerConfig::default()
                .overlay_env(lookup(&[(ENV_LISTEN_PORT, "eighty")]))
                .is_err()
        );
        assert!(
            WebServerConfig::default()
                .overlay_env(lookup(&[(ENV_ENABLE_DYNAMIC_CORS, "maybe")]))
                .is_err()
        );
    }
}
