use std::net::SocketAddr;

/// Protocol spoken by a local proxy endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointProtocol {
    Socks5,
    HttpForward,
}

impl EndpointProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointProtocol::Socks5 => "socks5",
            EndpointProtocol::HttpForward => "http",
        }
    }
}

impl std::fmt::Display for EndpointProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A bound local proxy endpoint
///
/// Produced by the anonymizing client (SOCKS5) or the forwarding proxy
/// (HTTP) and never changed afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub addr: SocketAddr,
    pub protocol: EndpointProtocol,
}

impl Endpoint {
    pub fn socks5(addr: SocketAddr) -> Self {
        Self {
            addr,
            protocol: EndpointProtocol::Socks5,
        }
    }

    pub fn http_forward(addr: SocketAddr) -> Self {
        Self {
            addr,
            protocol: EndpointProtocol::HttpForward,
        }
    }

    /// URL handed to clients, e.g. `socks5://127.0.0.1:9045`
    pub fn proxy_url(&self) -> String {
        format!("{}://{}", self.protocol, self.addr)
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.proxy_url())
    }
}
