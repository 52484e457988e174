//! Identity keys for quota and exclusivity.
//!
//! An identity is the caller's network address combined with the client
//! fingerprint the frontend sends in `X-Client-Fingerprint`. The key is built
//! from request data and passed explicitly down every call chain.

/// Header carrying the client fingerprint.
pub const FINGERPRINT_HEADER: &str = "X-Client-Fingerprint";

const UNKNOWN: &str = "unknown";

/// Build the identity key from a remote address and an optional fingerprint.
///
/// Ports are stripped so reconnects from the same host map to the same identity.
pub fn identity_key(remote_addr: Option<&str>, fingerprint: Option<&str>) -> String {
    let addr = remote_addr
        .map(strip_port)
        .filter(|a| !a.is_empty())
        .unwrap_or(UNKNOWN);
    let fingerprint = fingerprint
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .unwrap_or(UNKNOWN);
    format!("{}|{}", addr, fingerprint.to_ascii_lowercase())
}

fn strip_port(addr: &str) -> &str {
    let addr = addr.trim();
    // [v6]:port
    if let Some(rest) = addr.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    // v4:port (a bare v6 address has more than one colon)
    match addr.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') && port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => addr,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_key() {
        assert_eq!(identity_key(Some("10.0.0.7:52311"), Some("ABC123")), "10.0.0.7|abc123");
        assert_eq!(identity_key(Some("10.0.0.7"), Some(" abc123 ")), "10.0.0.7|abc123");
        assert_eq!(identity_key(Some("[::1]:8080"), Some("fp")), "::1|fp");
        assert_eq!(identity_key(Some("fe80::1"), None), "fe80::1|unknown");
        assert_eq!(identity_key(None, Some("")), "unknown|unknown");
    }
}
