//! Caller network identity.
//!
//! Unauthenticated requests are rate limited per network address, so the
//! address has to be hard to forge.
//!
//! # Resolution Order
//!
//! 1. The TCP peer address (`ConnectInfo<SocketAddr>`), unless the peer is a
//!    trusted proxy
//! 2. When the peer lies inside `TRUSTED_PROXIES`: the first
//!    `X-Forwarded-For` hop, then `X-Real-IP`, then the peer itself
//! 3. Without connection info (in-process tests): the header chain, falling
//!    back to [`UNKNOWN_IP`]
//!
//! # IP Spoofing
//!
//! Forwarding headers are client-controlled. With no trusted proxies
//! configured they are ignored whenever the peer address is known, so
//! rotating `X-Forwarded-For` values cannot dodge the limiter. Behind a load
//! balancer, list its network in `TRUSTED_PROXIES` and have it overwrite
//! (not append to) the header:
//!
//! ```nginx
//! proxy_set_header X-Forwarded-For $remote_addr;
//! ```

use std::borrow::Cow;
use std::net::{IpAddr, SocketAddr};

use axum::http::HeaderMap;
use tracing::{debug, warn};

/// Fallback identity when no address can be determined.
///
/// All such requests share one rate-limit window.
pub const UNKNOWN_IP: &str = "unknown";

// =============================================================================
// Trusted Proxy CIDR Matching
// =============================================================================

/// Parsed CIDR network range.
#[derive(Debug, Clone)]
pub struct CidrRange {
    network: IpAddr,
    prefix_len: u8,
}

impl CidrRange {
    /// Parse a CIDR notation string (e.g., "10.0.0.0/8" or "::1/128").
    ///
    /// A bare address is treated as a single-host range.
    pub fn parse(cidr: &str) -> Option<Self> {
        let (addr, prefix) = match cidr.trim().split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (cidr.trim(), None),
        };

        let network: IpAddr = addr.parse().ok()?;
        let max_prefix = match network {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        let prefix_len = match prefix {
            Some(p) => p.parse::<u8>().ok().filter(|len| *len <= max_prefix)?,
            None => max_prefix,
        };

        Some(Self {
            network,
            prefix_len,
        })
    }

    /// Check if an IP address is contained within this CIDR range.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (&self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(addr)) => {
                let mask = u32::MAX.checked_shl(32 - u32::from(self.prefix_len)).unwrap_or(0);
                (u32::from(*net) & mask) == (u32::from(*addr) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(addr)) => {
                let mask = u128::MAX
                    .checked_shl(128 - u32::from(self.prefix_len))
                    .unwrap_or(0);
                (u128::from(*net) & mask) == (u128::from(*addr) & mask)
            }
            _ => false,
        }
    }
}

/// Networks whose forwarding headers are believed.
#[derive(Debug, Clone, Default)]
pub struct TrustedProxyConfig {
    ranges: Vec<CidrRange>,
}

impl TrustedProxyConfig {
    /// Build from CIDR strings. Invalid entries are logged and skipped.
    pub fn new(cidrs: &[String]) -> Self {
        let ranges: Vec<CidrRange> = cidrs
            .iter()
            .filter_map(|cidr| {
                let parsed = CidrRange::parse(cidr);
                if parsed.is_none() {
                    warn!(cidr = %cidr, "Invalid CIDR range in TRUSTED_PROXIES, skipping");
                }
                parsed
            })
            .collect();

        if !ranges.is_empty() {
            debug!(count = ranges.len(), "Trusted proxy validation enabled");
        }

        Self { ranges }
    }

    pub fn is_enabled(&self) -> bool {
        !self.ranges.is_empty()
    }

    /// Whether `peer` is one of our proxies. Always `false` when no ranges
    /// are configured.
    pub fn is_trusted(&self, peer: &IpAddr) -> bool {
        self.ranges.iter().any(|range| range.contains(peer))
    }
}

// =============================================================================
// Header Extraction
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExtractedIp<'a> {
    /// First hop of `X-Forwarded-For`.
    FromXff(&'a str),
    FromRealIp(&'a str),
    NotFound,
}

#[inline]
fn extract_ip_from_headers(headers: &HeaderMap) -> ExtractedIp<'_> {
    // Format: "client, proxy1, proxy2" - we want the first (client) IP
    if let Some(forwarded) = headers.get("x-forwarded-for")
        && let Ok(value) = forwarded.to_str()
        && let Some(first_ip) = value.split(',').next().map(str::trim)
        && !first_ip.is_empty()
    {
        return ExtractedIp::FromXff(first_ip);
    }

    if let Some(real_ip) = headers.get("x-real-ip")
        && let Ok(value) = real_ip.to_str()
        && !value.trim().is_empty()
    {
        return ExtractedIp::FromRealIp(value.trim());
    }

    ExtractedIp::NotFound
}

/// Resolve the network identity of a caller.
///
/// See the module documentation for the resolution order.
pub fn client_identity(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    trusted_proxies: &TrustedProxyConfig,
) -> Cow<'static, str> {
    let Some(peer) = peer else {
        return match extract_ip_from_headers(headers) {
            ExtractedIp::FromXff(ip) | ExtractedIp::FromRealIp(ip) => Cow::Owned(ip.to_string()),
            ExtractedIp::NotFound => Cow::Borrowed(UNKNOWN_IP),
        };
    };

    let peer_ip = peer.ip();
    if !trusted_proxies.is_trusted(&peer_ip) {
        return Cow::Owned(peer_ip.to_string());
    }

    match extract_ip_from_headers(headers) {
        ExtractedIp::FromXff(ip) => {
            debug!(client_ip = %ip, proxy = %peer_ip, "Client IP taken from X-Forwarded-For");
            Cow::Owned(ip.to_string())
        }
        ExtractedIp::FromRealIp(ip) => {
            debug!(client_ip = %ip, proxy = %peer_ip, "Client IP taken from X-Real-IP");
            Cow::Owned(ip.to_string())
        }
        ExtractedIp::NotFound => {
            debug!(proxy = %peer_ip, "Trusted proxy sent no client address, using peer");
            Cow::Owned(peer_ip.to_string())
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, value.parse().unwrap());
        }
        map
    }

    fn peer(ip: &str) -> Option<SocketAddr> {
        Some(SocketAddr::new(ip.parse().unwrap(), 40000))
    }

    fn proxies(cidrs: &[&str]) -> TrustedProxyConfig {
        TrustedProxyConfig::new(&cidrs.iter().map(|c| c.to_string()).collect::<Vec<_>>())
    }

    #[test]
    fn test_cidr_parse() {
        assert_eq!(CidrRange::parse("10.0.0.0/8").unwrap().prefix_len, 8);
        assert_eq!(CidrRange::parse("::1/128").unwrap().prefix_len, 128);
        assert_eq!(CidrRange::parse("192.168.1.1").unwrap().prefix_len, 32);
        assert!(CidrRange::parse("not-an-ip").is_none());
        assert!(CidrRange::parse("10.0.0.0/33").is_none());
    }

    #[test]
    fn test_cidr_contains() {
        let cidr = CidrRange::parse("10.0.0.0/8").unwrap();
        assert!(cidr.contains(&"10.255.255.255".parse().unwrap()));
        assert!(!cidr.contains(&"11.0.0.1".parse().unwrap()));
        assert!(!cidr.contains(&"::1".parse().unwrap()));

        let everything = CidrRange::parse("0.0.0.0/0").unwrap();
        assert!(everything.contains(&"8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn test_untrusted_peer_ignores_forwarding_headers() {
        let h = headers(&[("x-forwarded-for", "203.0.113.9")]);
        let id = client_identity(&h, peer("198.51.100.7"), &TrustedProxyConfig::default());
        assert_eq!(id, "198.51.100.7");
    }

    #[test]
    fn test_trusted_peer_uses_first_xff_hop() {
        let h = headers(&[("x-forwarded-for", " 203.0.113.9 , 10.0.0.2")]);
        let id = client_identity(&h, peer("10.0.0.1"), &proxies(&["10.0.0.0/8"]));
        assert_eq!(id, "203.0.113.9");
    }

    #[test]
    fn test_trusted_peer_falls_back_to_real_ip_then_peer() {
        let trusted = proxies(&["10.0.0.0/8"]);

        let h = headers(&[("x-real-ip", "203.0.113.10")]);
        assert_eq!(client_identity(&h, peer("10.1.1.1"), &trusted), "203.0.113.10");

        assert_eq!(
            client_identity(&HeaderMap::new(), peer("10.1.1.1"), &trusted),
            "10.1.1.1"
        );
    }

    #[test]
    fn test_no_peer_uses_headers_or_unknown() {
        let none = TrustedProxyConfig::default();

        let h = headers(&[("x-forwarded-for", "2001:db8::1, 10.0.0.1")]);
        assert_eq!(client_identity(&h, None, &none), "2001:db8::1");

        let id = client_identity(&HeaderMap::new(), None, &none);
        assert_eq!(id, "unknown");
        assert!(matches!(id, Cow::Borrowed(_)));

        let blank = headers(&[("x-forwarded-for", "   ")]);
        assert_eq!(client_identity(&blank, None, &none), "unknown");
    }

    #[test]
    fn test_invalid_cidrs_are_skipped() {
        let config = proxies(&["bogus", "172.16.0.0/12"]);
        assert!(config.is_enabled());
        assert!(config.is_trusted(&"172.31.255.255".parse().unwrap()));
        assert!(!config.is_trusted(&"8.8.8.8".parse().unwrap()));
    }
}
