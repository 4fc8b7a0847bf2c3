//! Caller identity for bucket keys.
//!
//! An authenticated principal always wins over the network address, so a
//! logged-in user keeps one bucket across devices and NATed users do not
//! share one.

use std::net::IpAddr;

use axum::http::HeaderMap;

/// Header carrying the authenticated user id, set by the auth layer.
pub const USER_ID_HEADER: &str = "x-user-id";

/// Proxy-appended client address chain.
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

/// Identity for the principal `user_id`, if it is usable.
pub fn user_identity(user_id: &str) -> Option<String> {
    let user_id = user_id.trim();
    (!user_id.is_empty()).then(|| format!("user:{user_id}"))
}

/// Identity for a network peer.
pub fn peer_identity(addr: IpAddr) -> String {
    format!("ip:{addr}")
}

/// Derive the limiter identity for an HTTP request.
///
/// Order: `x-user-id` header, then the first `x-forwarded-for` hop when
/// `trust_forwarded_for` is set, then the socket peer. `None` when nothing
/// identifies the caller.
pub fn derive_identity(headers: &HeaderMap, peer: Option<IpAddr>, trust_forwarded_for: bool) -> Option<String> {
    if let Some(identity) = headers.get(USER_ID_HEADER).and_then(|v| v.to_str().ok()).and_then(user_identity) {
        return Some(identity);
    }

    if trust_forwarded_for
        && let Some(addr) = first_forwarded_hop(headers)
    {
        return Some(peer_identity(addr));
    }

    peer.map(peer_identity)
}

fn first_forwarded_hop(headers: &HeaderMap) -> Option<IpAddr> {
    let chain = headers.get(FORWARDED_FOR_HEADER)?.to_str().ok()?;
    chain.split(',').next()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use axum::http::HeaderValue;

    use super::*;

    const PEER: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20));

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn user_header_wins() {
        let h = headers(&[(USER_ID_HEADER, "42"), (FORWARDED_FOR_HEADER, "203.0.113.9")]);
        assert_eq!(derive_identity(&h, Some(PEER), true).as_deref(), Some("user:42"));
    }

    #[test]
    fn blank_user_header_falls_back_to_peer() {
        let h = headers(&[(USER_ID_HEADER, "  ")]);
        assert_eq!(derive_identity(&h, Some(PEER), false).as_deref(), Some("ip:192.168.1.20"));
    }

    #[test]
    fn forwarded_for_ignored_unless_trusted() {
        let h = headers(&[(FORWARDED_FOR_HEADER, "203.0.113.9, 10.0.0.1")]);
        assert_eq!(derive_identity(&h, Some(PEER), false).as_deref(), Some("ip:192.168.1.20"));
        assert_eq!(derive_identity(&h, Some(PEER), true).as_deref(), Some("ip:203.0.113.9"));
    }

    #[test]
    fn garbage_forwarded_for_falls_back_to_peer() {
        let h = headers(&[(FORWARDED_FOR_HEADER, "not-an-ip")]);
        assert_eq!(derive_identity(&h, Some(PEER), true).as_deref(), Some("ip:192.168.1.20"));
    }

    #[test]
    fn no_identity_without_header_or_peer() {
        assert_eq!(derive_identity(&HeaderMap::new(), None, true), None);
    }

    #[test]
    fn ipv6_peer() {
        let peer: IpAddr = "2001:db8::1".parse().unwrap();
        assert_eq!(derive_identity(&HeaderMap::new(), Some(peer), false).as_deref(), Some("ip:2001:db8::1"));
    }
}
