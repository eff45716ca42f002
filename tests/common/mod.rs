//! Test infrastructure for proxy tests.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{HeaderMap, Request, Response};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use torproxy::config::ProxyServerConfig;
use torproxy::proxy::transport::{BoxedConnection, TargetAddr};
use torproxy::proxy::{BindOutcome, ConnectionPolicy, Dialer, DirectDialer, ProxyServer};

// ---------------------------------------------------------------------------
// TestProxy
// ---------------------------------------------------------------------------

/// A forwarding proxy bound to an ephemeral loopback port.
pub struct TestProxy {
    addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    handle: tokio::task::JoinHandle<torproxy::Result<()>>,
}

impl TestProxy {
    pub async fn start(dialer: Arc<dyn Dialer>, policy: ConnectionPolicy) -> Self {
        Self::start_with(proxy_config(0), dialer, policy).await
    }

    pub async fn start_with(
        config: ProxyServerConfig,
        dialer: Arc<dyn Dialer>,
        policy: ConnectionPolicy,
    ) -> Self {
        let bound = match ProxyServer::new(config, dialer, policy).bind().await.unwrap() {
            BindOutcome::Bound(bound) => bound,
            BindOutcome::AlreadyRunning(endpoint) => {
                panic!("unexpected proxy already running on {endpoint}")
            }
        };
        let addr = bound.endpoint().addr;
        let (shutdown, rx) = watch::channel(false);
        let handle = tokio::spawn(bound.run(rx));

        Self {
            addr,
            shutdown,
            handle,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop the proxy and wait for it to finish
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("proxy did not shut down")
            .unwrap()
            .unwrap();
    }
}

pub fn proxy_config(port: u16) -> ProxyServerConfig {
    ProxyServerConfig {
        port,
        dial_timeout: 5,
        idle_timeout: 10,
        shutdown_grace: 1,
        socks_retries: 0,
        ..ProxyServerConfig::default()
    }
}

// ---------------------------------------------------------------------------
// Dialers
// ---------------------------------------------------------------------------

/// Counts dials and delegates to a direct dialer.
pub struct CountingDialer {
    dials: AtomicUsize,
}

impl CountingDialer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            dials: AtomicUsize::new(0),
        })
    }

    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dialer for CountingDialer {
    async fn dial(&self, target: &TargetAddr) -> torproxy::Result<BoxedConnection> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        DirectDialer.dial(target).await
    }

    fn name(&self) -> &'static str {
        "counting"
    }
}

/// Dialer whose connections never complete.
pub struct StallingDialer;

#[async_trait]
impl Dialer for StallingDialer {
    async fn dial(&self, _target: &TargetAddr) -> torproxy::Result<BoxedConnection> {
        std::future::pending().await
    }

    fn name(&self) -> &'static str {
        "stalling"
    }
}

// ---------------------------------------------------------------------------
// Upstreams
// ---------------------------------------------------------------------------

/// TCP server echoing everything back until the client closes.
pub async fn start_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
                let _ = writer.shutdown().await;
            });
        }
    });

    addr
}

/// TCP server that writes `greeting` and hangs up.
pub async fn start_closing_server(greeting: &'static [u8]) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let _ = stream.write_all(greeting).await;
            let _ = stream.shutdown().await;
        }
    });

    addr
}

/// A request as seen by [`HttpUpstream`].
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub uri: String,
    pub headers: HeaderMap,
}

/// HTTP/1.1 server recording requests and answering `200 hello upstream`.
pub struct HttpUpstream {
    pub addr: SocketAddr,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl HttpUpstream {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));

        let recorded = requests.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let recorded = recorded.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let recorded = recorded.clone();
                        async move {
                            recorded.lock().unwrap().push(RecordedRequest {
                                method: req.method().to_string(),
                                uri: req.uri().to_string(),
                                headers: req.headers().clone(),
                            });
                            Ok::<_, hyper::Error>(
                                Response::builder()
                                    .header("x-upstream", "yes")
                                    .body(Full::new(Bytes::from("hello upstream")))
                                    .unwrap(),
                            )
                        }
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        Self { addr, requests }
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

// ---------------------------------------------------------------------------
// FakeSocks
// ---------------------------------------------------------------------------

/// Minimal SOCKS5 server (no auth, CONNECT only).
///
/// Records every requested target and connects all of them to `upstream`,
/// so hidden-service names can be tested against a local server.
pub struct FakeSocks {
    pub addr: SocketAddr,
    targets: Arc<Mutex<Vec<String>>>,
}

impl FakeSocks {
    pub async fn start(upstream: SocketAddr) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let targets = Arc::new(Mutex::new(Vec::new()));

        let recorded = targets.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let recorded = recorded.clone();
                tokio::spawn(async move {
                    let _ = serve_socks(stream, upstream, recorded).await;
                });
            }
        });

        Self { addr, targets }
    }

    pub fn targets(&self) -> Vec<String> {
        self.targets.lock().unwrap().clone()
    }
}

async fn serve_socks(
    mut client: TcpStream,
    upstream: SocketAddr,
    targets: Arc<Mutex<Vec<String>>>,
) -> std::io::Result<()> {
    // Greeting: VER NMETHODS METHODS
    let mut head = [0u8; 2];
    client.read_exact(&mut head).await?;
    let mut methods = vec![0u8; head[1] as usize];
    client.read_exact(&mut methods).await?;
    client.write_all(&[0x05, 0x00]).await?;

    // Request: VER CMD RSV ATYP
    let mut request = [0u8; 4];
    client.read_exact(&mut request).await?;
    let host = match request[3] {
        0x01 => {
            let mut ip = [0u8; 4];
            client.read_exact(&mut ip).await?;
            std::net::Ipv4Addr::from(ip).to_string()
        }
        0x03 => {
            let len = client.read_u8().await? as usize;
            let mut name = vec![0u8; len];
            client.read_exact(&mut name).await?;
            String::from_utf8_lossy(&name).into_owned()
        }
        0x04 => {
            let mut ip = [0u8; 16];
            client.read_exact(&mut ip).await?;
            format!("[{}]", std::net::Ipv6Addr::from(ip))
        }
        _ => return Ok(()),
    };
    let port = client.read_u16().await?;
    targets.lock().unwrap().push(format!("{}:{}", host, port));

    let mut server = TcpStream::connect(upstream).await?;
    client
        .write_all(&[0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0, 0])
        .await?;

    tokio::io::copy_bidirectional(&mut client, &mut server).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Clients
// ---------------------------------------------------------------------------

/// Send `CONNECT target` and return the stream with the response status.
pub async fn connect_through(proxy: SocketAddr, target: &str, extra: &str) -> (TcpStream, u16) {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    let request = format!(
        "CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n{extra}\r\n"
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    // Read the response head byte by byte so no tunnel data is consumed
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).await.unwrap();
        assert_ne!(n, 0, "proxy closed before finishing the response head");
        head.push(byte[0]);
    }

    let head = String::from_utf8(head).unwrap();
    let status = head
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .expect("malformed status line");
    (stream, status)
}

/// Send one request through the proxy over a fresh connection.
pub async fn send_via_proxy(
    proxy: SocketAddr,
    request: Request<Empty<Bytes>>,
) -> (Response<()>, Bytes) {
    let stream = TcpStream::connect(proxy).await.unwrap();
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let response = sender.send_request(request).await.unwrap();
    let (parts, body) = response.into_parts();
    let body = body.collect().await.unwrap().to_bytes();
    (Response::from_parts(parts, ()), body)
}

/// A loopback port nothing listens on.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}
