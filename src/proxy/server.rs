//! Proxy server implementation using hyper
//!
//! Accepts HTTP/1.1 forward-proxy connections and hands each request to the
//! [`ProxyHandler`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Empty;
use hyper::body::Incoming;
use hyper::header::{HOST, VIA};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use crate::config::ProxyServerConfig;
use crate::error::{Result, TorProxyError};
use crate::models::Endpoint;
use crate::proxy::dialer::Dialer;
use crate::proxy::handler::{is_own_via, ProxyBody, ProxyHandler, ProxyHandlerConfig};
use crate::proxy::policy::ConnectionPolicy;
use crate::proxy::tunnel::TunnelConfig;
use crate::supervisor::stop_requested;

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Result of binding the forwarding proxy
pub enum BindOutcome {
    /// Listener bound, ready to [`run`](BoundProxyServer::run)
    Bound(BoundProxyServer),
    /// Another instance already serves this address
    AlreadyRunning(Endpoint),
}

/// Proxy server
pub struct ProxyServer {
    config: ProxyServerConfig,
    dialer: Arc<dyn Dialer>,
    policy: ConnectionPolicy,
}

impl ProxyServer {
    /// Create a new proxy server
    pub fn new(config: ProxyServerConfig, dialer: Arc<dyn Dialer>, policy: ConnectionPolicy) -> Self {
        Self {
            config,
            dialer,
            policy,
        }
    }

    /// Bind the listen address
    ///
    /// An address already held by a running instance of this proxy is not an
    /// error; anything else holding it is.
    pub async fn bind(self) -> Result<BindOutcome> {
        let addr = self.config.listen_addr();

        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(source) if source.kind() == std::io::ErrorKind::AddrInUse => {
                if probe_existing(addr).await {
                    info!("Forwarding proxy already running on {}", addr);
                    return Ok(BindOutcome::AlreadyRunning(Endpoint::http_forward(addr)));
                }
                return Err(TorProxyError::Bind { addr, source });
            }
            Err(source) => return Err(TorProxyError::Bind { addr, source }),
        };

        let local_addr = listener
            .local_addr()
            .map_err(|source| TorProxyError::Bind { addr, source })?;
        info!("Proxy server listening on {}", local_addr);

        Ok(BindOutcome::Bound(BoundProxyServer {
            listener,
            local_addr,
            config: self.config,
            dialer: self.dialer,
            policy: self.policy,
        }))
    }
}

/// A proxy server holding its listener
pub struct BoundProxyServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: ProxyServerConfig,
    dialer: Arc<dyn Dialer>,
    policy: ConnectionPolicy,
}

impl BoundProxyServer {
    /// Endpoint clients should be pointed at
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::http_forward(self.local_addr)
    }

    /// Run the proxy server until `shutdown` flips to `true`
    #[instrument(skip_all, fields(addr = %self.local_addr))]
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let handler = Arc::new(ProxyHandler::new(
            self.dialer,
            self.policy,
            ProxyHandlerConfig {
                dial_timeout: self.config.dial_timeout(),
                response_timeout: self.config.idle_timeout(),
                tunnel: TunnelConfig {
                    idle_timeout: self.config.idle_timeout(),
                    ..TunnelConfig::default()
                },
                shutdown_grace: self.config.shutdown_grace(),
            },
            shutdown.clone(),
        ));

        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, client_addr)) => {
                            let handler = handler.clone();
                            let shutdown = shutdown.clone();

                            connections.spawn(async move {
                                if let Err(e) =
                                    handle_connection(stream, client_addr, handler, shutdown).await
                                {
                                    debug!("Connection error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                            accept_backoff(&mut shutdown).await;
                            if *shutdown.borrow() {
                                info!("Proxy server shutting down");
                                break;
                            }
                        }
                    }
                }
                // Reap finished connections so the set does not grow
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        drop(self.listener);

        let grace = self.config.shutdown_grace();
        let drained = tokio::time::timeout(grace, async {
            while connections.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(
                remaining = connections.len(),
                "Connections still open after {:?}, aborting", grace
            );
            connections.abort_all();
            while connections.join_next().await.is_some() {}
        }

        Ok(())
    }
}

/// Handle a single connection
async fn handle_connection(
    stream: TcpStream,
    client_addr: SocketAddr,
    handler: Arc<ProxyHandler>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let _ = stream.set_nodelay(true);
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let handler = handler.clone();

        async move {
            match handler.handle(req, client_addr).await {
                Ok(response) => Ok::<Response<ProxyBody>, hyper::Error>(response),
                Err(e) => {
                    if e.is_server_error() {
                        warn!(client = %client_addr, "Request failed: {}", e);
                    } else {
                        debug!(client = %client_addr, "Request refused: {}", e);
                    }
                    Ok(handler.error_response(e.status_code(), &e.to_string()))
                }
            }
        }
    });

    let conn = http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(io, service)
        .with_upgrades();
    tokio::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => {
            result.map_err(TorProxyError::from)?;
        }
        _ = stop_requested(&mut shutdown) => {
            conn.as_mut().graceful_shutdown();
            conn.await.map_err(TorProxyError::from)?;
        }
    }

    Ok(())
}

/// Check whether the process on `addr` is an instance of this proxy
///
/// Sends an origin-form request, which this proxy always answers with an
/// error response carrying its own `Via` token.
/// Pause after a failed accept; returns early once shutdown is requested
async fn accept_backoff(shutdown: &mut watch::Receiver<bool>) {
    tokio::select! {
        _ = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => {}
        _ = stop_requested(shutdown) => {}
    }
}

async fn probe_existing(addr: SocketAddr) -> bool {
    let probe = async {
        let stream = TcpStream::connect(addr).await.ok()?;
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .ok()?;
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let request = Request::builder()
            .uri("/")
            .header(HOST, addr.to_string())
            .body(Empty::<Bytes>::new())
            .ok()?;
        let response = sender.send_request(request).await.ok()?;

        Some(response.headers().get_all(VIA).iter().any(is_own_via))
    };

    matches!(tokio::time::timeout(PROBE_TIMEOUT, probe).await, Ok(Some(true)))
}
