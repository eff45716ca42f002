//! Destination classification for split-tunnel routing

/// Reserved top-level suffix of Tor hidden services
pub const HIDDEN_SERVICE_SUFFIX: &str = ".onion";

/// Where a connection to a destination is routed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingDecision {
    /// Through the anonymizing network
    Anonymized,
    /// Straight to the destination
    Direct,
}

impl RoutingDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoutingDecision::Anonymized => "anonymized",
            RoutingDecision::Direct => "direct",
        }
    }
}

impl std::fmt::Display for RoutingDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Decides per destination host whether traffic is tunneled
#[derive(Debug, Clone, Copy, Default)]
pub struct Classifier {
    split: bool,
}

impl Classifier {
    pub fn new(split: bool) -> Self {
        Self { split }
    }

    /// Classify a bare host (no port)
    ///
    /// Without split mode everything is anonymized. With split mode only
    /// hidden-service names are; anything else, including garbage, goes direct.
    pub fn classify(&self, host: &str) -> RoutingDecision {
        if !self.split || is_hidden_service(host) {
            RoutingDecision::Anonymized
        } else {
            RoutingDecision::Direct
        }
    }
}

/// Whether `host` is under the hidden-service suffix (case-insensitive,
/// trailing root dot allowed)
pub fn is_hidden_service(host: &str) -> bool {
    let host = host.strip_suffix('.').unwrap_or(host).as_bytes();
    let suffix = HIDDEN_SERVICE_SUFFIX.as_bytes();

    host.len() >= suffix.len() && host[host.len() - suffix.len()..].eq_ignore_ascii_case(suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOSTS: &[&str] = &[
        "example.com",
        "duckduckgogg42xjoc72x3sjasowoarfbgcmvfimaftt6twagswzczad.onion",
        "www.example.onion",
        "127.0.0.1",
        "::1",
        "",
        ".",
        ".onion",
        "onion",
        "exa mple..\u{0}",
        "ünïcødé.onion",
    ];

    #[test]
    fn test_split_off_always_anonymized() {
        let classifier = Classifier::new(false);
        for host in HOSTS {
            assert_eq!(classifier.classify(host), RoutingDecision::Anonymized, "{host:?}");
        }
    }

    #[test]
    fn test_split_on_hidden_services_anonymized() {
        let classifier = Classifier::new(true);
        assert_eq!(classifier.classify("www.example.onion"), RoutingDecision::Anonymized);
        assert_eq!(classifier.classify("EXAMPLE.ONION"), RoutingDecision::Anonymized);
        assert_eq!(classifier.classify("example.onion."), RoutingDecision::Anonymized);
        assert_eq!(classifier.classify("ünïcødé.onion"), RoutingDecision::Anonymized);
        assert_eq!(classifier.classify(".onion"), RoutingDecision::Anonymized);
        assert_eq!(classifier.classify(".ONION."), RoutingDecision::Anonymized);
    }

    #[test]
    fn test_split_on_everything_else_direct() {
        let classifier = Classifier::new(true);
        for host in [
            "example.com",
            "onion.example.com",
            "example.onion.com",
            "127.0.0.1",
            "::1",
            "",
            ".",
            "onion",
            "xonion",
            "exa mple..\u{0}",
        ] {
            assert_eq!(classifier.classify(host), RoutingDecision::Direct, "{host:?}");
        }
    }
}
