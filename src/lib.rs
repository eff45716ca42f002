//! torproxy - Tor browsing session launcher
//!
//! Brings up a Tor client, optionally exposes a local HTTP forward proxy
//! bridging into it, and launches a browser pointed at one of the two.
//!
//! ## Features
//!
//! - HTTP forward proxy with CONNECT tunneling over Tor's SOCKS5 port
//! - Split mode: only `.onion` destinations go through Tor
//! - Forbidden destination list and policy hooks
//! - Supervision of the Tor and browser processes

pub mod config;
pub mod error;
pub mod models;
pub mod proxy;
pub mod supervisor;

pub use config::Config;
pub use error::{Result, TorProxyError};
pub use supervisor::{Supervisor, SupervisorExit, SupervisorState};
