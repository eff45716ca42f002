//! Anonymizing network client
//!
//! [`TorProcess`] reuses a Tor SOCKS port that is already listening, or
//! spawns `tor` with a generated torrc and waits for the port to come up.

use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::config::TorConfig;
use crate::error::{Result, TorProxyError};
use crate::models::Endpoint;
use crate::supervisor::process::{spawn_child, supervise_child};
use crate::supervisor::task::{SupervisedTask, TaskKind};

const READY_POLL_INTERVAL: Duration = Duration::from_millis(250);
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Settings handed to an [`AnonymizingClient`]
#[derive(Debug, Clone)]
pub struct AnonClientConfig {
    pub socks_port: u16,
    pub binary: PathBuf,
    pub startup_timeout: Duration,
    pub verbose: bool,
}

impl AnonClientConfig {
    /// SOCKS address; always loopback
    pub fn socks_addr(&self) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], self.socks_port))
    }
}

impl From<&TorConfig> for AnonClientConfig {
    fn from(config: &TorConfig) -> Self {
        Self {
            socks_port: config.socks_port,
            binary: config.binary.clone(),
            startup_timeout: Duration::from_secs(config.startup_timeout),
            verbose: config.verbose,
        }
    }
}

/// A started anonymizing client
pub struct AnonClientHandle {
    /// Ready SOCKS5 endpoint
    pub endpoint: Endpoint,
    /// Background task, absent when an existing client was reused
    pub task: Option<SupervisedTask>,
}

/// Brings up a local SOCKS5 endpoint into the anonymizing network
#[async_trait]
pub trait AnonymizingClient: Send + Sync {
    /// Start the client and return once its SOCKS endpoint accepts connections
    async fn start(&self, config: &AnonClientConfig) -> Result<AnonClientHandle>;
}

/// Tor configuration file contents
#[derive(Debug, Clone)]
pub struct Torrc {
    pub socks_addr: SocketAddr,
    pub data_dir: PathBuf,
    pub verbose: bool,
}

impl fmt::Display for Torrc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "SocksPort {}", self.socks_addr)?;
        // Only local clients may use the SOCKS port
        writeln!(f, "SocksPolicy accept 127.0.0.0/8")?;
        writeln!(f, "SocksPolicy reject *")?;
        writeln!(f, "DataDirectory {}", self.data_dir.display())?;
        if self.verbose {
            writeln!(f, "Log notice stderr")?;
        }
        Ok(())
    }
}

/// Tor run as a child process
#[derive(Debug, Clone, Copy, Default)]
pub struct TorProcess;

impl TorProcess {
    async fn write_torrc(dir: &Path, torrc: &Torrc) -> Result<PathBuf> {
        let path = dir.join("torrc");
        tokio::fs::write(&path, torrc.to_string())
            .await
            .map_err(|e| TorProxyError::AnonClient(format!("Failed to write torrc: {}", e)))?;
        Ok(path)
    }
}

#[async_trait]
impl AnonymizingClient for TorProcess {
    async fn start(&self, config: &AnonClientConfig) -> Result<AnonClientHandle> {
        let socks_addr = config.socks_addr();
        let endpoint = Endpoint::socks5(socks_addr);

        if is_listening(socks_addr).await {
            info!("Reusing Tor SOCKS port already listening on {}", socks_addr);
            return Ok(AnonClientHandle {
                endpoint,
                task: None,
            });
        }

        let data_dir = tempfile::Builder::new()
            .prefix("torproxy-tor-")
            .tempdir()
            .map_err(|e| {
                TorProxyError::AnonClient(format!("Failed to create data directory: {}", e))
            })?;

        let torrc = Torrc {
            socks_addr,
            data_dir: data_dir.path().join("data"),
            verbose: config.verbose,
        };
        let torrc_path = Self::write_torrc(data_dir.path(), &torrc).await?;

        let args = vec!["-f".to_string(), torrc_path.display().to_string()];
        let mut child = spawn_child(&config.binary, &args, config.verbose)?;

        let started = Instant::now();
        loop {
            if let Some(status) = child.try_wait()? {
                return Err(TorProxyError::AnonClient(format!(
                    "tor exited before its SOCKS port was ready ({})",
                    status
                )));
            }
            if is_listening(socks_addr).await {
                break;
            }
            if started.elapsed() >= config.startup_timeout {
                // kill_on_drop reaps the child
                return Err(TorProxyError::AnonClient(format!(
                    "SOCKS port {} not ready after {:?}",
                    socks_addr, config.startup_timeout
                )));
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }

        info!(
            "Tor SOCKS endpoint ready on {} after {:?}",
            socks_addr,
            started.elapsed()
        );

        let task = SupervisedTask::spawn(TaskKind::AnonClient, move |stop| async move {
            let result = supervise_child(child, "tor", stop).await;
            drop(data_dir);
            result
        });

        Ok(AnonClientHandle {
            endpoint,
            task: Some(task),
        })
    }
}

/// Whether something accepts TCP connections on `addr`
pub async fn is_listening(addr: SocketAddr) -> bool {
    match tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            debug!(addr = %addr, "Port probe failed: {}", e);
            false
        }
        Err(_) => false,
    }
}
