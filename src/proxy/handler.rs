//! Proxy request handler
//!
//! Applies the connection policy, then either opens a CONNECT tunnel or
//! forwards a plain request through the split dialer.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, CONTENT_TYPE, HOST, VIA};
use hyper::upgrade::OnUpgrade;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::error::{Result, TorProxyError};
use crate::proxy::dialer::Dialer;
use crate::proxy::middleware::ProxyAuth;
use crate::proxy::policy::{Admission, ConnectAction, ConnectionPolicy, RequestContext};
use crate::proxy::transport::{BoxedConnection, TargetAddr};
use crate::proxy::tunnel::{TunnelConfig, TunnelHandler};
use crate::supervisor::stop_requested;

/// Token this proxy puts in the `Via` header of every response
pub const VIA_TOKEN: &str = "torproxy";

const VIA_VALUE: &str = "1.1 torproxy";

/// Response body type produced by the proxy
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Configuration for proxy handler
#[derive(Clone)]
pub struct ProxyHandlerConfig {
    /// Timeout for upstream dials
    pub dial_timeout: Duration,
    /// Timeout waiting for an upstream response head
    pub response_timeout: Duration,
    /// Tunnel timing
    pub tunnel: TunnelConfig,
    /// Grace period for open tunnels once shutdown starts
    pub shutdown_grace: Duration,
}

impl Default for ProxyHandlerConfig {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(30),
            response_timeout: Duration::from_secs(300),
            tunnel: TunnelConfig::default(),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// Proxy request handler
pub struct ProxyHandler {
    dialer: Arc<dyn Dialer>,
    policy: ConnectionPolicy,
    config: ProxyHandlerConfig,
    shutdown: watch::Receiver<bool>,
}

impl ProxyHandler {
    pub fn new(
        dialer: Arc<dyn Dialer>,
        policy: ConnectionPolicy,
        config: ProxyHandlerConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            dialer,
            policy,
            config,
            shutdown,
        }
    }

    /// Handle an incoming proxy request
    #[instrument(skip(self, req), fields(method = %req.method(), uri = %req.uri()))]
    pub async fn handle(
        &self,
        req: Request<Incoming>,
        client: SocketAddr,
    ) -> Result<Response<ProxyBody>> {
        let method = req.method().clone();

        let target = if method == Method::CONNECT {
            TargetAddr::from_authority(req.uri())?
        } else {
            TargetAddr::from_absolute_uri(req.uri())?
        };

        let ctx = RequestContext {
            client,
            method,
            target,
        };

        match self.policy.admit(&ctx, req.headers()) {
            Admission::Allowed => {}
            Admission::Unauthorized => {
                debug!(client = %client, "Proxy authentication required");
                let mut response: Response<ProxyBody> = ProxyAuth::challenge_response();
                add_via(response.headers_mut());
                return Ok(response);
            }
            Admission::Rejected(reason) => {
                return Ok(self.error_response(StatusCode::FORBIDDEN, &reason));
            }
        }

        // Handle CONNECT requests (HTTPS tunneling)
        if ctx.method == Method::CONNECT {
            return self.handle_connect(req, ctx).await;
        }

        // Handle regular HTTP requests
        self.handle_http(req, ctx).await
    }

    /// Handle HTTP CONNECT request (HTTPS tunneling)
    async fn handle_connect(
        &self,
        req: Request<Incoming>,
        ctx: RequestContext,
    ) -> Result<Response<ProxyBody>> {
        let target = match self.policy.hooks().on_connect(&ctx) {
            ConnectAction::Proxy(target) => target,
            ConnectAction::Reject => {
                info!(client = %ctx.client, target = %ctx.target, "CONNECT rejected by hook");
                return Ok(self.error_response(StatusCode::FORBIDDEN, "CONNECT rejected"));
            }
        };

        // Don't respond 200 until the upstream is connected
        let upstream = self.dial(&target).await?;

        let on_upgrade: OnUpgrade = hyper::upgrade::on(req);
        let tunnel = self.config.tunnel.clone();
        let grace = self.config.shutdown_grace;
        let mut shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let relay = async {
                match on_upgrade.await {
                    Ok(upgraded) => {
                        let client = TokioIo::new(upgraded);
                        let _ = TunnelHandler::copy_bidirectional(client, upstream, &tunnel).await;
                    }
                    Err(e) => {
                        debug!("CONNECT upgrade failed: {}", e);
                    }
                }
            };

            tokio::select! {
                _ = relay => {}
                _ = async {
                    stop_requested(&mut shutdown).await;
                    tokio::time::sleep(grace).await;
                } => {
                    debug!(target = %target, "Tunnel closed by shutdown");
                }
            }
        });

        debug!(client = %ctx.client, target = %ctx.target, "CONNECT tunnel established");

        Ok(Response::builder()
            .status(StatusCode::OK)
            .header(VIA, VIA_VALUE)
            .body(empty())
            .map_err(|e| TorProxyError::Http(e.to_string()))?)
    }

    /// Handle regular HTTP request
    async fn handle_http(
        &self,
        req: Request<Incoming>,
        ctx: RequestContext,
    ) -> Result<Response<ProxyBody>> {
        let (mut parts, body) = req.into_parts();

        let authority = parts
            .uri
            .authority()
            .map(|a| a.as_str().to_string())
            .ok_or_else(|| TorProxyError::InvalidRequest("Missing host in URI".into()))?;

        // Upstream gets origin-form
        let path = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        parts.uri = path
            .parse::<Uri>()
            .map_err(|e| TorProxyError::InvalidRequest(format!("Invalid path: {}", e)))?;

        strip_hop_by_hop_headers(&mut parts.headers);
        if !parts.headers.contains_key(HOST) {
            let host = HeaderValue::from_str(&authority)
                .map_err(|e| TorProxyError::InvalidRequest(format!("Invalid host: {}", e)))?;
            parts.headers.insert(HOST, host);
        }

        self.policy.hooks().on_request(&ctx, &mut parts);

        let upstream = self.dial(&ctx.target).await?;
        let response = self
            .forward_request(upstream, Request::from_parts(parts, body))
            .await?;

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop_headers(&mut parts.headers);
        add_via(&mut parts.headers);

        self.policy.hooks().on_response(&ctx, &mut parts);

        Ok(Response::from_parts(parts, body.boxed()))
    }

    /// Send the request over a fresh HTTP/1.1 connection to the target
    async fn forward_request(
        &self,
        upstream: BoxedConnection,
        request: Request<Incoming>,
    ) -> Result<Response<Incoming>> {
        let io = TokioIo::new(upstream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| TorProxyError::Upstream(format!("Handshake failed: {}", e)))?;

        // Spawn connection handler
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("Upstream connection ended: {}", e);
            }
        });

        tokio::time::timeout(self.config.response_timeout, sender.send_request(request))
            .await
            .map_err(|_| TorProxyError::Timeout)?
            .map_err(|e| TorProxyError::Upstream(format!("Request failed: {}", e)))
    }

    async fn dial(&self, target: &TargetAddr) -> Result<BoxedConnection> {
        match tokio::time::timeout(self.config.dial_timeout, self.dialer.dial(target)).await {
            Ok(Ok(connection)) => Ok(connection),
            Ok(Err(e)) => {
                warn!(target = %target, error = %e, "Upstream dial failed");
                Err(e)
            }
            Err(_) => {
                warn!(target = %target, "Upstream dial timed out");
                Err(TorProxyError::Timeout)
            }
        }
    }

    /// Create an error response
    pub fn error_response(&self, status: StatusCode, message: &str) -> Response<ProxyBody> {
        let mut response = Response::new(full(message.to_string()));
        *response.status_mut() = status;
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        add_via(response.headers_mut());
        response
    }
}

fn add_via(headers: &mut HeaderMap) {
    headers.append(VIA, HeaderValue::from_static(VIA_VALUE));
}

/// Whether a `Via` header value names this proxy
pub fn is_own_via(value: &HeaderValue) -> bool {
    value
        .to_str()
        .map(|v| v.split(',').any(|hop| hop.trim().ends_with(VIA_TOKEN)))
        .unwrap_or(false)
}

fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

fn full<T: Into<Bytes>>(chunk: T) -> ProxyBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

/// Remove hop-by-hop headers, including any named in `Connection`
fn strip_hop_by_hop_headers(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }

    let hop_by_hop: Vec<HeaderName> = headers
        .keys()
        .filter(|name| is_hop_by_hop_header(name.as_str()))
        .cloned()
        .collect();

    for name in hop_by_hop {
        headers.remove(name);
    }
}

/// Check if a header is a hop-by-hop header that should not be forwarded
fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name.to_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}
