//! Target addressing and connection types shared by the dialers and the handler

use hyper::Uri;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{Result, TorProxyError};

/// Trait for upstream connections
pub trait ProxyConnection: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> ProxyConnection for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// An established upstream byte stream
pub type BoxedConnection = Box<dyn ProxyConnection>;

/// Destination of an upstream connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetAddr {
    /// Bare host: a domain name or an IP literal without brackets
    pub host: String,
    pub port: u16,
}

impl TargetAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse a `host:port` string, including bracketed IPv6 like `[::1]:8080`
    pub fn parse(addr: &str) -> Result<Self> {
        let url = url::Url::parse(&format!("http://{}", addr)).map_err(|e| {
            TorProxyError::InvalidRequest(format!("Invalid address '{}': {}", addr, e))
        })?;

        let host = url.host_str().ok_or_else(|| {
            TorProxyError::InvalidRequest(format!("Invalid address '{}': missing host", addr))
        })?;

        let has_port = addr
            .rsplit_once(':')
            .is_some_and(|(_, p)| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()));

        // Url reports no port when it equals the scheme default (80).
        let port = url
            .port_or_known_default()
            .filter(|_| has_port)
            .ok_or_else(|| {
                TorProxyError::InvalidRequest(format!("Invalid address '{}': missing port", addr))
            })?;

        Ok(Self::new(strip_brackets(host), port))
    }

    /// Target of a CONNECT request (`CONNECT host:port`), port defaults to 443
    pub fn from_authority(uri: &Uri) -> Result<Self> {
        let authority = uri
            .authority()
            .ok_or_else(|| TorProxyError::InvalidRequest("CONNECT without authority".into()))?;

        let host = authority.host();
        if host.is_empty() {
            return Err(TorProxyError::InvalidRequest("Missing host in CONNECT".into()));
        }

        Ok(Self::new(
            strip_brackets(host),
            authority.port_u16().unwrap_or(443),
        ))
    }

    /// Target of an absolute-form proxy request (`GET http://host/path`)
    pub fn from_absolute_uri(uri: &Uri) -> Result<Self> {
        let scheme = uri.scheme_str().ok_or_else(|| {
            TorProxyError::InvalidRequest(format!("Expected absolute URI, got '{}'", uri))
        })?;

        let host = uri
            .host()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| TorProxyError::InvalidRequest("Missing host in URI".to_string()))?;

        let port = match (uri.port_u16(), scheme) {
            (Some(port), _) => port,
            (None, "http") => 80,
            (None, "https") => 443,
            (None, other) => {
                return Err(TorProxyError::InvalidRequest(format!(
                    "Unsupported scheme: {}",
                    other
                )))
            }
        };

        Ok(Self::new(strip_brackets(host), port))
    }
}

impl std::fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

fn strip_brackets(host: &str) -> String {
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
        .to_string()
}
