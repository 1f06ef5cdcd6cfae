//! CORS policy for the HTTP endpoints and the WebSocket handshake

use hyper::HeaderMap;
use hyper::header::{
    ACCESS_CONTROL_ALLOW_CREDENTIALS, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue, VARY,
};

use crate::config::WebServerConfig;

const ALLOWED_HEADERS: &str = "Content-Type, Authorization";
const ALLOWED_METHODS: &str = "GET, POST, PUT, DELETE, OPTIONS";

/// Origin allow-list, or allow-all when dynamic CORS is enabled
#[derive(Debug, Clone)]
pub struct CorsPolicy {
    allowed_origins: Vec<String>,
    dynamic: bool,
}

impl CorsPolicy {
    pub fn new(allowed_origins: Vec<String>, dynamic: bool) -> Self {
        Self {
            allowed_origins,
            dynamic,
        }
    }

    pub fn from_config(config: &WebServerConfig) -> Self {
        Self::new(config.cors_origins.clone(), config.enable_dynamic_cors)
    }

    pub fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    pub fn is_allowed(&self, origin: &str) -> bool {
        self.dynamic
            || self
                .allowed_origins
                .iter()
                .any(|allowed| allowed == "*" || allowed.eq_ignore_ascii_case(origin))
    }

    /// Whether a request carrying `origin` may proceed. Requests without an
    /// `Origin` header are not cross-origin and always pass.
    pub fn permits(&self, origin: Option<&str>) -> bool {
        origin.is_none_or(|origin| self.is_allowed(origin))
    }

    /// Echo the origin back with credentials allowed. Disallowed or absent
    /// origins get no CORS headers.
    pub fn apply_headers(&self, headers: &mut HeaderMap, origin: Option<&str>) {
        let Some(origin) = origin else {
            return;
        };
        if !self.is_allowed(origin) {
            return;
        }
        let Ok(origin_value) = HeaderValue::from_str(origin) else {
            return;
        };

        headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, origin_value);
        headers.insert(
            ACCESS_CONTROL_ALLOW_CREDENTIALS,
            HeaderValue::from_static("true"),
        );
        headers.insert(
            ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static(ALLOWED_HEADERS),
        );
        headers.insert(
            ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static(ALLOWED_METHODS),
        );
        headers.append(VARY, HeaderValue::from_static("Origin"));
    }
}
