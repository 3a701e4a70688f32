// Client-side dedup fingerprints.

use sha2::{Digest, Sha256};

/// Hex prefix length kept from the SHA-256 digest. 64 bits of digest is
/// plenty for a seen-set capped at 50k entries, and keeps the persisted
/// file small.
const FINGERPRINT_HEX_LEN: usize = 16;

/// Fingerprint of a failed-login event for agent-side deduplication.
///
/// `raw_utc` MUST be the unmodified SystemTime string from the event
/// XML, never the normalized local timestamp. Local time shifts with
/// the host timezone; the raw UTC string does not, so fingerprints stay
/// stable across timezone changes and agent restarts.
pub fn event_fingerprint(raw_utc: &str, ip: &str, username: &str, source_port: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw_utc.as_bytes());
    hasher.update(b"|");
    hasher.update(ip.as_bytes());
    hasher.update(b"|");
    hasher.update(username.as_bytes());
    hasher.update(b"|");
    hasher.update(source_port.as_bytes());

    let digest = format!("{:x}", hasher.finalize());
    digest[..FINGERPRINT_HEX_LEN].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_stable() {
        let a = event_fingerprint("2026-02-21T16:42:04.7999016Z", "203.0.113.10", "admin", "445");
        let b = event_fingerprint("2026-02-21T16:42:04.7999016Z", "203.0.113.10", "admin", "445");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn test_fingerprint_distinguishes_timestamps() {
        let a = event_fingerprint("2026-02-21T16:42:04.7999016Z", "203.0.113.10", "admin", "445");
        let b = event_fingerprint("2026-02-21T16:42:05.0000000Z", "203.0.113.10", "admin", "445");
        assert_ne!(a, b);
    }

    #[test]
    fn test_fingerprint_handles_empty_fields() {
        let a = event_fingerprint("2026-02-21T16:42:04Z", "203.0.113.10", "", "");
        let b = event_fingerprint("2026-02-21T16:42:04Z", "203.0.113.10", "", "445");
        assert_ne!(a, b);
    }
}
