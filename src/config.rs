use crate::error::{Result, TorProxyError};
use std::env;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Forwarding proxy configuration
    pub proxy: ProxyServerConfig,
    /// Tor client configuration
    pub tor: TorConfig,
    /// Browser launch configuration
    pub browser: BrowserConfig,
    /// Logging configuration
    pub log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct ProxyServerConfig {
    /// Address to bind to (default: 127.0.0.1)
    pub host: IpAddr,
    /// Port for the forwarding proxy (default: 9046, 0 disables it)
    pub port: u16,
    /// Route only hidden-service destinations through Tor
    pub split_networks: bool,
    /// Newline-delimited list of forbidden destination patterns
    pub forbidden_list: Option<PathBuf>,
    /// Proxy authentication username
    pub auth_username: Option<String>,
    /// Proxy authentication password
    pub auth_password: Option<String>,
    /// Upstream dial timeout in seconds
    pub dial_timeout: u64,
    /// Idle timeout for tunnels and upstream responses in seconds
    pub idle_timeout: u64,
    /// Grace period for in-flight connections on shutdown in seconds
    pub shutdown_grace: u64,
    /// Retries when the SOCKS endpoint refuses connections
    pub socks_retries: u32,
}

#[derive(Debug, Clone)]
pub struct TorConfig {
    /// Local SOCKS5 port (default: 9045)
    pub socks_port: u16,
    /// Tor binary to spawn when nothing listens on the SOCKS port
    pub binary: PathBuf,
    /// How long to wait for the SOCKS port in seconds
    pub startup_timeout: u64,
    /// Inherit stdout/stderr of the tor process
    pub verbose: bool,
}

#[derive(Debug, Clone)]
pub struct BrowserConfig {
    /// Explicit browser executable, otherwise PATH is searched
    pub binary: Option<PathBuf>,
    /// Extra launch arguments
    pub extra_args: Vec<String>,
    /// Launch in incognito mode
    pub incognito: bool,
    /// Browser profile directory
    pub profile_dir: Option<PathBuf>,
    /// Inherit stdout/stderr of the browser process
    pub verbose: bool,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

impl Default for ProxyServerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 9046,
            split_networks: false,
            forbidden_list: None,
            auth_username: None,
            auth_password: None,
            dial_timeout: 30,
            idle_timeout: 300,
            shutdown_grace: 5,
            socks_retries: 3,
        }
    }
}

impl ProxyServerConfig {
    /// Whether the forwarding proxy should be started
    pub fn enabled(&self) -> bool {
        self.port > 0
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace)
    }
}

impl Default for TorConfig {
    fn default() -> Self {
        Self {
            socks_port: 9045,
            binary: PathBuf::from("tor"),
            startup_timeout: 120,
            verbose: false,
        }
    }
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            binary: None,
            extra_args: Vec::new(),
            incognito: true,
            profile_dir: None,
            verbose: false,
        }
    }
}

impl LogConfig {
    /// Logging settings never fail to load so tracing can start first
    pub fn from_env() -> Self {
        LogConfig {
            level: get_env_or("LOG_LEVEL", "info"),
            format: get_env_or("LOG_FORMAT", "pretty"),
        }
    }

    pub fn is_json(&self) -> bool {
        self.format.eq_ignore_ascii_case("json")
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let verbose = parse_bool("TORPROXY_VERBOSE", false)?;

        Ok(Config {
            proxy: ProxyServerConfig {
                host: IpAddr::V4(Ipv4Addr::LOCALHOST),
                port: parse_env("TORPROXY_HTTP_PORT", 9046)?,
                split_networks: parse_bool("TORPROXY_SPLIT", false)?,
                forbidden_list: get_env_opt("TORPROXY_FORBIDDEN_LIST").map(PathBuf::from),
                auth_username: get_env_opt("TORPROXY_AUTH_USERNAME"),
                auth_password: get_env_opt("TORPROXY_AUTH_PASSWORD"),
                dial_timeout: parse_env("TORPROXY_DIAL_TIMEOUT", 30)?,
                idle_timeout: parse_env("TORPROXY_IDLE_TIMEOUT", 300)?,
                shutdown_grace: parse_env("TORPROXY_SHUTDOWN_GRACE", 5)?,
                socks_retries: parse_env("TORPROXY_SOCKS_RETRIES", 3)?,
            },
            tor: TorConfig {
                socks_port: parse_env("TORPROXY_SOCKS_PORT", 9045)?,
                binary: PathBuf::from(get_env_or("TORPROXY_TOR_BIN", "tor")),
                startup_timeout: parse_env("TORPROXY_TOR_STARTUP_TIMEOUT", 120)?,
                verbose,
            },
            browser: BrowserConfig {
                binary: get_env_opt("TORPROXY_BROWSER_BIN").map(PathBuf::from),
                extra_args: get_env_or("TORPROXY_BROWSER_ARGS", "")
                    .split_whitespace()
                    .map(str::to_string)
                    .collect(),
                incognito: !parse_bool("TORPROXY_NO_INCOGNITO", false)?,
                profile_dir: get_env_opt("TORPROXY_PROFILE_DIR").map(PathBuf::from),
                verbose,
            },
            log: LogConfig::from_env(),
        }
        .validated()?)
    }

    fn validated(self) -> Result<Self> {
        if self.tor.socks_port == 0 {
            return Err(TorProxyError::InvalidConfig(
                "TORPROXY_SOCKS_PORT must not be 0".into(),
            ));
        }
        if self.proxy.enabled() && self.proxy.port == self.tor.socks_port {
            return Err(TorProxyError::InvalidConfig(
                "TORPROXY_HTTP_PORT and TORPROXY_SOCKS_PORT must differ".into(),
            ));
        }
        if self.proxy.auth_username.is_some() != self.proxy.auth_password.is_some() {
            return Err(TorProxyError::InvalidConfig(
                "TORPROXY_AUTH_USERNAME and TORPROXY_AUTH_PASSWORD must be set together".into(),
            ));
        }
        Ok(self)
    }
}

fn parse_env<T: FromStr>(key: &str, default: T) -> Result<T> {
    match get_env_opt(key) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|_| {
            TorProxyError::InvalidConfig(format!("{} has an invalid value: {}", key, raw))
        }),
    }
}

fn parse_bool(key: &str, default: bool) -> Result<bool> {
    match get_env_opt(key) {
        None => Ok(default),
        Some(raw) => match raw.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(TorProxyError::InvalidConfig(format!(
                "{} must be a boolean, got: {}",
                key, raw
            ))),
        },
    }
}

/// Get environment variable, treating blank values as unset
fn get_env_opt(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    get_env_opt(key).unwrap_or_else(|| default.to_string())
}
