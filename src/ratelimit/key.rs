//! Rate limit key resolution and address normalization.

use std::fmt;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use super::category::Category;

/// Key used when no address could be determined.
const UNKNOWN_ADDRESS: &str = "unknown";

/// The handle requests are counted against.
///
/// The variant is part of the key's identity, so an address that happens to
/// look like a user id never shares a window with that user.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RateLimitKey {
    /// An authenticated principal
    Identity(String),
    /// A normalized network origin
    Address(String),
}

impl RateLimitKey {
    /// `"identity"` or `"address"`.
    pub fn kind(&self) -> &'static str {
        match self {
            RateLimitKey::Identity(_) => "identity",
            RateLimitKey::Address(_) => "address",
        }
    }

    pub fn value(&self) -> &str {
        match self {
            RateLimitKey::Identity(v) | RateLimitKey::Address(v) => v,
        }
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.value())
    }
}

/// Map key for one window: a category and the key charged within it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntryKey {
    pub category: Category,
    pub key: RateLimitKey,
}

impl EntryKey {
    pub fn new(category: Category, key: RateLimitKey) -> Self {
        Self { category, key }
    }
}

impl fmt::Display for EntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.category, self.key)
    }
}

/// Derives the limiting key for a request.
#[derive(Debug, Clone, Copy)]
pub struct KeyResolver {
    ipv6_prefix_len: u8,
}

impl KeyResolver {
    /// A resolver that groups IPv6 origins by their first `ipv6_prefix_len` bits.
    ///
    /// 128 keeps every IPv6 address distinct. Values above 128 are clamped.
    pub fn new(ipv6_prefix_len: u8) -> Self {
        Self {
            ipv6_prefix_len: ipv6_prefix_len.min(128),
        }
    }

    /// Pick the key to charge: the identity when present, the address otherwise.
    pub fn resolve(&self, identity: Option<&str>, address: &str) -> RateLimitKey {
        match identity.map(str::trim).filter(|id| !id.is_empty()) {
            Some(id) => RateLimitKey::Identity(id.to_string()),
            None => RateLimitKey::Address(self.normalize_address(address)),
        }
    }

    /// Canonical string for a network address.
    ///
    /// Ports, brackets and zone ids are dropped, IPv4-mapped IPv6 becomes
    /// IPv4, and IPv6 is rendered in compressed lowercase form. Anything that
    /// does not parse as an IP is kept as lowercased text.
    pub fn normalize_address(&self, address: &str) -> String {
        let trimmed = address.trim();
        if trimmed.is_empty() {
            return UNKNOWN_ADDRESS.to_string();
        }

        match parse_ip(trimmed) {
            Some(ip) => self.render_ip(ip),
            None => trimmed.to_ascii_lowercase(),
        }
    }

    fn render_ip(&self, ip: IpAddr) -> String {
        match ip {
            IpAddr::V4(v4) => v4.to_string(),
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => v4.to_string(),
                None if self.ipv6_prefix_len < 128 => {
                    let mask = if self.ipv6_prefix_len == 0 {
                        0
                    } else {
                        !0u128 << (128 - u32::from(self.ipv6_prefix_len))
                    };
                    Ipv6Addr::from(u128::from(v6) & mask).to_string()
                }
                None => v6.to_string(),
            },
        }
    }
}

impl Default for KeyResolver {
    fn default() -> Self {
        Self::new(128)
    }
}

fn parse_ip(s: &str) -> Option<IpAddr> {
    if let Ok(ip) = s.parse::<IpAddr>() {
        return Some(ip);
    }
    if let Ok(sock) = s.parse::<SocketAddr>() {
        return Some(sock.ip());
    }

    // `[v6]`, `[v6%zone]:port` and bare `v6%zone`
    let unbracketed = match s.strip_prefix('[') {
        Some(rest) => rest.split(']').next()?,
        None => s,
    };
    let without_zone = unbracketed.split('%').next()?;
    without_zone.parse::<IpAddr>().ok()
}

/// The originating client address of a request.
///
/// Uses the first entry of `X-Forwarded-For`, then `X-Real-IP`, then the
/// socket peer. Only call this when the headers come from a trusted proxy.
pub fn client_address<'a>(
    forwarded_for: Option<&'a str>,
    real_ip: Option<&'a str>,
    remote_addr: &'a str,
) -> &'a str {
    forwarded_for
        .and_then(|header| header.split(',').next())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .or_else(|| real_ip.map(str::trim).filter(|s| !s.is_empty()))
        .unwrap_or(remote_addr)
}
