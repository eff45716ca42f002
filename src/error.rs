use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitStatus;

use hyper::StatusCode;
use thiserror::Error;

/// Unified error type for torproxy
#[derive(Error, Debug)]
pub enum TorProxyError {
    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to read forbidden list {}: {source}", path.display())]
    ForbiddenList {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Startup errors
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Anonymizing client failed: {0}")]
    AnonClient(String),

    #[error("Browser not found: {0}")]
    BrowserNotFound(String),

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Process exited with {0}")]
    ProcessExited(ExitStatus),

    // Dial errors
    #[error("Connect to {addr} failed: {source}")]
    Dial {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("SOCKS5 connect to {addr} via {proxy} failed: {source}")]
    Socks {
        addr: String,
        proxy: SocketAddr,
        #[source]
        source: tokio_socks::Error,
    },

    #[error("Operation timed out")]
    Timeout,

    // Request errors
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // HTTP errors
    #[error("HTTP error: {0}")]
    Http(String),
}

/// Result type alias for torproxy operations
pub type Result<T> = std::result::Result<T, TorProxyError>;

impl TorProxyError {
    /// Status code of the proxy response sent when this error ends a request
    pub fn status_code(&self) -> StatusCode {
        match self {
            TorProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,

            TorProxyError::Dial { .. }
            | TorProxyError::Socks { .. }
            | TorProxyError::Upstream(_) => StatusCode::BAD_GATEWAY,

            TorProxyError::Timeout => StatusCode::GATEWAY_TIMEOUT,

            TorProxyError::InvalidConfig(_)
            | TorProxyError::ForbiddenList { .. }
            | TorProxyError::Bind { .. }
            | TorProxyError::AnonClient(_)
            | TorProxyError::BrowserNotFound(_)
            | TorProxyError::Spawn { .. }
            | TorProxyError::ProcessExited(_)
            | TorProxyError::Io(_)
            | TorProxyError::Http(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether this error aborts the whole session when raised during startup
    pub fn is_fatal_startup(&self) -> bool {
        matches!(
            self,
            TorProxyError::InvalidConfig(_)
                | TorProxyError::ForbiddenList { .. }
                | TorProxyError::Bind { .. }
                | TorProxyError::AnonClient(_)
                | TorProxyError::BrowserNotFound(_)
                | TorProxyError::Spawn { .. }
        )
    }

    /// Check if this is a server error (5xx)
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }
}

// Convert from hyper errors
impl From<hyper::Error> for TorProxyError {
    fn from(err: hyper::Error) -> Self {
        TorProxyError::Http(err.to_string())
    }
}
