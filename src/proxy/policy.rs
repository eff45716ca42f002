//! Connection policy: forbidden destinations and policy hooks
//!
//! The policy is built once at startup and shared read-only between
//! connections. Hooks are a trait with no-op defaults so an implementation
//! only overrides the stages it cares about.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use hyper::header::VIA;
use hyper::{HeaderMap, Method};
use tracing::{debug, info};

use crate::error::{Result, TorProxyError};
use crate::proxy::middleware::ProxyAuth;
use crate::proxy::transport::TargetAddr;

/// Outcome of the forbidden-destination check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDecision {
    Allow,
    Block,
}

/// Ordered substring patterns of forbidden destinations
#[derive(Debug, Clone, Default)]
pub struct ForbiddenList {
    patterns: Vec<String>,
}

impl ForbiddenList {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            patterns: patterns
                .into_iter()
                .map(|p| {
                    let p: String = p.into();
                    p.trim().to_string()
                })
                .collect(),
        }
    }

    /// Parse a newline-delimited list (CRLF tolerated)
    pub fn parse(contents: &str) -> Self {
        Self::new(contents.lines())
    }

    /// Load the list from a file; only called at startup
    pub async fn load(path: &Path) -> Result<Self> {
        let contents =
            tokio::fs::read_to_string(path)
                .await
                .map_err(|source| TorProxyError::ForbiddenList {
                    path: path.to_path_buf(),
                    source,
                })?;
        let list = Self::parse(&contents);
        info!(
            "Loaded {} forbidden patterns from {}",
            list.active_len(),
            path.display()
        );
        Ok(list)
    }

    /// First non-empty pattern contained in `destination`
    fn matching_pattern(&self, destination: &str) -> Option<&str> {
        self.patterns
            .iter()
            .map(String::as_str)
            .find(|p| !p.is_empty() && destination.contains(p))
    }

    /// Block if any non-empty pattern is a substring of `host:port`
    pub fn evaluate(&self, destination: &str) -> PolicyDecision {
        match self.matching_pattern(destination) {
            Some(pattern) => {
                debug!(destination, pattern, "Forbidden pattern matched");
                PolicyDecision::Block
            }
            None => PolicyDecision::Allow,
        }
    }

    /// Number of patterns that can match (empty lines excluded)
    pub fn active_len(&self) -> usize {
        self.patterns.iter().filter(|p| !p.is_empty()).count()
    }
}

/// What the hooks see of a request
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub client: SocketAddr,
    pub method: Method,
    pub target: TargetAddr,
}

/// Decision of the CONNECT hook
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectAction {
    /// Tunnel opaquely to the given target
    Proxy(TargetAddr),
    Reject,
}

/// Hook points around each proxied request
///
/// `on_accept`, `on_auth` and `on_connect` gate the request and are consulted
/// exactly once per request. `on_request` and `on_response` only observe or
/// rewrite.
pub trait PolicyHooks: Send + Sync {
    /// Pre-dial gate; `false` rejects the request
    fn on_accept(&self, _ctx: &RequestContext) -> bool {
        true
    }

    /// Proxy-level credential check, called when credentials were supplied
    fn on_auth(&self, _ctx: &RequestContext, _username: &str, _password: &str) -> bool {
        true
    }

    /// CONNECT negotiation
    fn on_connect(&self, ctx: &RequestContext) -> ConnectAction {
        ConnectAction::Proxy(ctx.target.clone())
    }

    /// Called before a plain request is forwarded
    fn on_request(&self, _ctx: &RequestContext, _request: &mut http::request::Parts) {}

    /// Called before a forwarded response is returned to the client
    fn on_response(&self, _ctx: &RequestContext, _response: &mut http::response::Parts) {}
}

/// Hooks that do nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

impl PolicyHooks for NoopHooks {}

/// Default hooks: log every stage, never interfere
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingHooks;

impl PolicyHooks for LoggingHooks {
    fn on_accept(&self, ctx: &RequestContext) -> bool {
        info!(client = %ctx.client, method = %ctx.method, target = %ctx.target, "Accepted");
        true
    }

    fn on_connect(&self, ctx: &RequestContext) -> ConnectAction {
        info!(client = %ctx.client, target = %ctx.target, "CONNECT");
        ConnectAction::Proxy(ctx.target.clone())
    }

    fn on_request(&self, ctx: &RequestContext, request: &mut http::request::Parts) {
        debug!(
            client = %ctx.client,
            method = %request.method,
            uri = %request.uri,
            target = %ctx.target,
            "Forwarding request"
        );
    }

    fn on_response(&self, ctx: &RequestContext, response: &mut http::response::Parts) {
        debug!(
            client = %ctx.client,
            target = %ctx.target,
            status = response.status.as_u16(),
            via = ?response.headers.get(VIA),
            "Forwarding response"
        );
    }
}

/// Verdict of the gating stages
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// Credentials missing or refused
    Unauthorized,
    /// Refused by a hook or the forbidden list
    Rejected(String),
}

/// Immutable policy shared by all connections
#[derive(Clone)]
pub struct ConnectionPolicy {
    forbidden: Arc<ForbiddenList>,
    hooks: Arc<dyn PolicyHooks>,
    auth: ProxyAuth,
}

impl ConnectionPolicy {
    pub fn new(forbidden: Arc<ForbiddenList>, hooks: Arc<dyn PolicyHooks>) -> Self {
        Self {
            forbidden,
            hooks,
            auth: ProxyAuth::disabled(),
        }
    }

    /// Allow everything, log nothing
    pub fn permissive() -> Self {
        Self::new(Arc::new(ForbiddenList::default()), Arc::new(NoopHooks))
    }

    pub fn with_auth(mut self, auth: ProxyAuth) -> Self {
        self.auth = auth;
        self
    }

    pub fn hooks(&self) -> &dyn PolicyHooks {
        self.hooks.as_ref()
    }

    /// Run credentials, `on_accept` and the forbidden list for a request
    pub fn admit(&self, ctx: &RequestContext, headers: &HeaderMap) -> Admission {
        match self.auth.credentials(headers) {
            Some((username, password)) => {
                if !self.auth.accepts(&username, &password)
                    || !self.hooks.on_auth(ctx, &username, &password)
                {
                    return Admission::Unauthorized;
                }
            }
            None if self.auth.is_enabled() => return Admission::Unauthorized,
            None => {}
        }

        if !self.hooks.on_accept(ctx) {
            return Admission::Rejected("rejected by accept hook".to_string());
        }

        let destination = ctx.target.to_string();
        if self.forbidden.evaluate(&destination) == PolicyDecision::Block {
            info!(
                client = %ctx.client,
                target = %destination,
                "Blocked forbidden destination"
            );
            return Admission::Rejected(format!("{} is forbidden", destination));
        }

        Admission::Allowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use hyper::header::PROXY_AUTHORIZATION;
    use hyper::header::HeaderValue;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ctx(target: &str) -> RequestContext {
        RequestContext {
            client: "127.0.0.1:50000".parse().unwrap(),
            method: Method::CONNECT,
            target: TargetAddr::parse(target).unwrap(),
        }
    }

    #[test]
    fn test_forbidden_substring_blocks() {
        let list = ForbiddenList::new(["evil.example"]);
        assert_eq!(list.evaluate("api.evil.example:443"), PolicyDecision::Block);
        assert_eq!(list.evaluate("good.example:443"), PolicyDecision::Allow);
    }

    #[test]
    fn test_empty_patterns_never_match() {
        let list = ForbiddenList::parse("\n\r\n   \n");
        assert_eq!(list.active_len(), 0);
        assert_eq!(list.evaluate("good.example:443"), PolicyDecision::Allow);
        assert_eq!(list.evaluate(""), PolicyDecision::Allow);
    }

    #[test]
    fn test_parse_trims_crlf() {
        let list = ForbiddenList::parse("ads.example\r\n\r\ntracker.example\r\n");
        assert_eq!(list.evaluate("ads.example:80"), PolicyDecision::Block);
        assert_eq!(list.evaluate("cdn.tracker.example:443"), PolicyDecision::Block);
        assert_eq!(list.matching_pattern("tracker.example:1"), Some("tracker.example"));
    }

    #[test]
    fn test_pattern_can_match_port() {
        let list = ForbiddenList::new([":25"]);
        assert_eq!(list.evaluate("mail.example:25"), PolicyDecision::Block);
        assert_eq!(list.evaluate("mail.example:443"), PolicyDecision::Allow);
    }

    #[tokio::test]
    async fn test_load_missing_file_is_error() {
        let err = ForbiddenList::load(Path::new("/nonexistent/torproxy/forbidden.txt"))
            .await
            .unwrap_err();
        assert!(matches!(err, TorProxyError::ForbiddenList { .. }));
    }

    #[tokio::test]
    async fn test_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("forbidden.txt");
        tokio::fs::write(&path, "evil.example\n\nads.example\n").await.unwrap();

        let list = ForbiddenList::load(&path).await.unwrap();
        assert_eq!(list.active_len(), 2);
        assert_eq!(list.evaluate("x.ads.example:443"), PolicyDecision::Block);
    }

    #[test]
    fn test_admit_blocks_forbidden() {
        let policy = ConnectionPolicy::new(
            Arc::new(ForbiddenList::new(["evil.example"])),
            Arc::new(NoopHooks),
        );
        assert_eq!(
            policy.admit(&ctx("good.example:443"), &HeaderMap::new()),
            Admission::Allowed
        );
        assert!(matches!(
            policy.admit(&ctx("api.evil.example:443"), &HeaderMap::new()),
            Admission::Rejected(_)
        ));
    }

    #[test]
    fn test_admit_agrees_with_evaluate() {
        let list = ForbiddenList::parse("evil.example\n\n:25\n");
        let policy = ConnectionPolicy::new(Arc::new(list.clone()), Arc::new(NoopHooks));

        for target in [
            "good.example:443",
            "evil.example:443",
            "mail.example:25",
            "mail.example:2525",
            "evil.example.org:80",
        ] {
            let admitted = policy.admit(&ctx(target), &HeaderMap::new()) == Admission::Allowed;
            assert_eq!(
                admitted,
                list.evaluate(target) == PolicyDecision::Allow,
                "{target}"
            );
        }
    }

    struct CountingHooks {
        accepts: AtomicUsize,
        allow: bool,
    }

    impl PolicyHooks for CountingHooks {
        fn on_accept(&self, _ctx: &RequestContext) -> bool {
            self.accepts.fetch_add(1, Ordering::SeqCst);
            self.allow
        }
    }

    #[test]
    fn test_admit_consults_accept_hook_once() {
        let hooks = Arc::new(CountingHooks {
            accepts: AtomicUsize::new(0),
            allow: false,
        });
        let policy = ConnectionPolicy::new(Arc::new(ForbiddenList::default()), hooks.clone());

        assert!(matches!(
            policy.admit(&ctx("good.example:443"), &HeaderMap::new()),
            Admission::Rejected(_)
        ));
        assert_eq!(hooks.accepts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_admit_requires_credentials_when_enabled() {
        let policy = ConnectionPolicy::permissive()
            .with_auth(ProxyAuth::new("user".to_string(), "pass".to_string()));

        assert_eq!(
            policy.admit(&ctx("good.example:443"), &HeaderMap::new()),
            Admission::Unauthorized
        );

        let mut headers = HeaderMap::new();
        let value = format!("Basic {}", BASE64.encode(b"user:pass"));
        headers.insert(PROXY_AUTHORIZATION, HeaderValue::from_str(&value).unwrap());
        assert_eq!(
            policy.admit(&ctx("good.example:443"), &headers),
            Admission::Allowed
        );
    }

    #[test]
    fn test_default_connect_hook_keeps_target() {
        let context = ctx("example.com:443");
        assert_eq!(
            NoopHooks.on_connect(&context),
            ConnectAction::Proxy(TargetAddr::new("example.com", 443))
        );
    }
}
