// Source-IP filtering shared by agent and collector.

use std::net::IpAddr;

/// Source addresses that are loopback or empty-source noise. Events
/// carrying these are dropped before they ever reach the wire.
const IGNORED_SOURCES: [&str; 4] = ["-", "0.0.0.0", "::1", "127.0.0.1"];

/// True when the value is a placeholder or loopback source that should
/// never be shipped or persisted.
pub fn is_ignored_source(ip: &str) -> bool {
    ip.is_empty() || IGNORED_SOURCES.contains(&ip)
}

/// True when the value parses as an IPv4 dotted-quad or IPv6 literal.
pub fn is_valid_ip(value: &str) -> bool {
    value.parse::<IpAddr>().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_and_placeholder_sources_ignored() {
        for ip in ["-", "", "0.0.0.0", "::1", "127.0.0.1"] {
            assert!(is_ignored_source(ip), "{} should be ignored", ip);
        }
        assert!(!is_ignored_source("203.0.113.10"));
    }

    #[test]
    fn test_ip_validation() {
        assert!(is_valid_ip("203.0.113.10"));
        assert!(is_valid_ip("2001:db8::1"));
        assert!(!is_valid_ip("203.0.113"));
        assert!(!is_valid_ip("not-an-ip"));
        assert!(!is_valid_ip(""));
    }
}
