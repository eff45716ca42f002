//! Proxy authentication middleware
//!
//! Handles Basic authentication for the forwarding proxy.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hyper::header::{HeaderMap, HeaderValue, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION};
use hyper::{Response, StatusCode};
use tracing::{debug, warn};

/// Proxy authentication handler
#[derive(Clone)]
pub struct ProxyAuth {
    /// Whether authentication is enabled
    enabled: bool,
    /// Expected username
    username: String,
    /// Expected password
    password: String,
}

impl ProxyAuth {
    /// Create an auth handler requiring the given credentials
    pub fn new(username: String, password: String) -> Self {
        Self {
            enabled: true,
            username,
            password,
        }
    }

    /// Create a disabled auth handler
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            username: String::new(),
            password: String::new(),
        }
    }

    /// Enabled only when both credentials are configured
    pub fn from_config(username: Option<&str>, password: Option<&str>) -> Self {
        match (username, password) {
            (Some(u), Some(p)) => Self::new(u.to_string(), p.to_string()),
            _ => Self::disabled(),
        }
    }

    /// Check if authentication is enabled
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Extract Basic credentials from the Proxy-Authorization header
    pub fn credentials(&self, headers: &HeaderMap) -> Option<(String, String)> {
        let auth_str = headers.get(PROXY_AUTHORIZATION)?.to_str().ok()?;

        // Parse "Basic <base64>"
        let Some(encoded) = auth_str.strip_prefix("Basic ") else {
            warn!("Invalid auth scheme, expected Basic");
            return None;
        };

        let decoded = BASE64.decode(encoded.trim()).ok()?;
        let credentials = String::from_utf8(decoded).ok()?;
        let (user, pass) = credentials.split_once(':')?;

        Some((user.to_string(), pass.to_string()))
    }

    /// Check supplied credentials against the configured ones
    pub fn accepts(&self, username: &str, password: &str) -> bool {
        if !self.enabled {
            return true;
        }

        if username == self.username && password == self.password {
            debug!("Proxy authentication successful for user: {}", username);
            true
        } else {
            warn!("Proxy authentication failed for user: {}", username);
            false
        }
    }

    /// Create a 407 Proxy Authentication Required response
    pub fn challenge_response<T>() -> Response<T>
    where
        T: Default,
    {
        let mut response = Response::new(T::default());
        *response.status_mut() = StatusCode::PROXY_AUTHENTICATION_REQUIRED;
        response.headers_mut().insert(
            PROXY_AUTHENTICATE,
            HeaderValue::from_static("Basic realm=\"torproxy\""),
        );
        response
    }
}
