//! Proxy middleware for authentication

mod auth;

pub use auth::ProxyAuth;
