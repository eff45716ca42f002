//! Forwarding proxy
//!
//! This module provides the proxy server functionality including:
//! - HTTP forward proxying and CONNECT tunnels
//! - Split routing between Tor and direct connections
//! - Forbidden destinations and policy hooks

pub mod classifier;
pub mod dialer;
pub mod handler;
pub mod middleware;
pub mod policy;
pub mod server;
pub mod transport;
pub mod tunnel;

pub use classifier::{Classifier, RoutingDecision};
pub use dialer::{Dialer, DirectDialer, SocksDialer, SplitDialer};
pub use handler::ProxyHandler;
pub use policy::{ConnectionPolicy, ForbiddenList, LoggingHooks, NoopHooks, PolicyHooks};
pub use server::{BindOutcome, BoundProxyServer, ProxyServer};
pub use transport::TargetAddr;
pub use tunnel::TunnelHandler;
