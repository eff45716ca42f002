//! Upstream dialers
//!
//! - [`SocksDialer`] tunnels through the Tor SOCKS5 endpoint
//! - [`DirectDialer`] connects in the clear
//! - [`SplitDialer`] picks one of the two per destination

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;
use tracing::{debug, warn};

use crate::error::{Result, TorProxyError};
use crate::proxy::classifier::{Classifier, RoutingDecision};
use crate::proxy::transport::{BoxedConnection, TargetAddr};

/// Something that can open a byte stream to a target
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Open a connection to `target`
    async fn dial(&self, target: &TargetAddr) -> Result<BoxedConnection>;

    /// Short name used in logs
    fn name(&self) -> &'static str;
}

/// Plain TCP dialer
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectDialer;

#[async_trait]
impl Dialer for DirectDialer {
    async fn dial(&self, target: &TargetAddr) -> Result<BoxedConnection> {
        let stream = TcpStream::connect((target.host.as_str(), target.port))
            .await
            .map_err(|source| TorProxyError::Dial {
                addr: target.to_string(),
                source,
            })?;
        let _ = stream.set_nodelay(true);
        Ok(Box::new(stream))
    }

    fn name(&self) -> &'static str {
        "direct"
    }
}

/// Dialer going through a SOCKS5 endpoint
///
/// Host names are handed to the SOCKS server unresolved so that name
/// resolution happens inside the anonymizing network.
#[derive(Debug, Clone)]
pub struct SocksDialer {
    proxy: SocketAddr,
    retries: u32,
    retry_delay: Duration,
}

impl SocksDialer {
    pub fn new(proxy: SocketAddr) -> Self {
        Self {
            proxy,
            retries: 0,
            retry_delay: Duration::from_millis(500),
        }
    }

    /// Retry refused connections to the SOCKS endpoint itself, which happens
    /// while the anonymizing client restarts. Handshake and upstream failures
    /// are never retried.
    pub fn with_retries(mut self, retries: u32, retry_delay: Duration) -> Self {
        self.retries = retries;
        self.retry_delay = retry_delay;
        self
    }

    async fn connect_proxy(&self) -> Result<TcpStream> {
        let mut attempt = 0;
        loop {
            match TcpStream::connect(self.proxy).await {
                Ok(stream) => return Ok(stream),
                Err(e)
                    if e.kind() == std::io::ErrorKind::ConnectionRefused
                        && attempt < self.retries =>
                {
                    attempt += 1;
                    warn!(
                        proxy = %self.proxy,
                        "SOCKS endpoint refused connection (retry {}/{})",
                        attempt, self.retries
                    );
                    tokio::time::sleep(self.retry_delay * attempt).await;
                }
                Err(source) => {
                    return Err(TorProxyError::Dial {
                        addr: self.proxy.to_string(),
                        source,
                    })
                }
            }
        }
    }
}

#[async_trait]
impl Dialer for SocksDialer {
    async fn dial(&self, target: &TargetAddr) -> Result<BoxedConnection> {
        let socket = self.connect_proxy().await?;

        let stream = Socks5Stream::connect_with_socket(socket, (target.host.as_str(), target.port))
            .await
            .map_err(|source| TorProxyError::Socks {
                addr: target.to_string(),
                proxy: self.proxy,
                source,
            })?;

        debug!(proxy = %self.proxy, target = %target, "SOCKS5 connection established");
        Ok(Box::new(stream.into_inner()))
    }

    fn name(&self) -> &'static str {
        "socks5"
    }
}

/// Routes each dial to the anonymized or the direct dialer
///
/// A destination classified as direct falls back to the anonymized dialer
/// when no direct dialer is configured; it never connects in the clear
/// unless asked to.
#[derive(Clone)]
pub struct SplitDialer {
    classifier: Classifier,
    anonymized: Arc<dyn Dialer>,
    direct: Option<Arc<dyn Dialer>>,
}

impl SplitDialer {
    pub fn new(classifier: Classifier, anonymized: Arc<dyn Dialer>) -> Self {
        Self {
            classifier,
            anonymized,
            direct: None,
        }
    }

    pub fn with_direct(mut self, direct: Arc<dyn Dialer>) -> Self {
        self.direct = Some(direct);
        self
    }

    /// Dialer over a Tor SOCKS endpoint; split mode adds a direct dialer for
    /// clearnet destinations
    pub fn over_socks(socks: SocksDialer, split: bool) -> Self {
        let dialer = Self::new(Classifier::new(split), Arc::new(socks));
        if split {
            dialer.with_direct(Arc::new(DirectDialer))
        } else {
            dialer
        }
    }

    /// Routing decision and the dialer that will serve it
    pub fn route(&self, host: &str) -> (RoutingDecision, &dyn Dialer) {
        let decision = self.classifier.classify(host);
        let dialer = match (decision, &self.direct) {
            (RoutingDecision::Direct, Some(direct)) => direct.as_ref(),
            _ => self.anonymized.as_ref(),
        };
        (decision, dialer)
    }
}

#[async_trait]
impl Dialer for SplitDialer {
    async fn dial(&self, target: &TargetAddr) -> Result<BoxedConnection> {
        let (decision, dialer) = self.route(&target.host);
        debug!(
            target = %target,
            decision = %decision,
            dialer = dialer.name(),
            "Dialing upstream"
        );
        dialer.dial(target).await
    }

    fn name(&self) -> &'static str {
        "split"
    }
}
