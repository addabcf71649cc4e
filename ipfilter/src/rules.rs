//! Blacklist entries and rate-limit rules.
//!
//! Addresses are host-order `u32` throughout the userspace model; the BPF
//! backend converts to network order at the map boundary.

use std::fmt;
use std::net::Ipv4Addr;
use std::num::NonZeroU32;
use std::str::FromStr;

use ipfilter_common::{min_interval_ns, prefix_contains, prefix_mask, MAX_PREFIX_LEN};
use serde::Serialize;

use crate::error::ConfigWarning;

// =============================================================================
// Blacklist
// =============================================================================

/// A blacklisted prefix. Host bits of `network` are always zero, so two
/// entries naming the same prefix compare equal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlacklistEntry {
    network: u32,
    prefix_len: u8,
}

impl BlacklistEntry {
    /// Returns `None` for prefix lengths above 32.
    pub fn new(network: u32, prefix_len: u8) -> Option<Self> {
        if prefix_len > MAX_PREFIX_LEN {
            return None;
        }
        Some(Self {
            network: network & prefix_mask(prefix_len),
            prefix_len,
        })
    }

    /// Single-host entry (`/32`).
    pub fn host(ip: u32) -> Self {
        Self { network: ip, prefix_len: MAX_PREFIX_LEN }
    }

    pub fn network(&self) -> u32 {
        self.network
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub fn contains(&self, ip: u32) -> bool {
        prefix_contains(self.network, self.prefix_len, ip)
    }

    /// Packed key used by the in-memory trie: prefix length above the
    /// network bits.
    pub(crate) fn table_key(&self) -> u64 {
        (u64::from(self.prefix_len) << 32) | u64::from(self.network)
    }

    pub(crate) fn from_table_key(key: u64) -> Option<Self> {
        Self::new(key as u32, (key >> 32) as u8)
    }
}

impl fmt::Display for BlacklistEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", Ipv4Addr::from(self.network), self.prefix_len)
    }
}

/// `a.b.c.d` or `a.b.c.d/len`. A bare address is a `/32`.
impl FromStr for BlacklistEntry {
    type Err = ConfigWarning;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        let (addr, len) = match token.split_once('/') {
            Some((addr, len)) => (addr, Some(len)),
            None => (token, None),
        };

        let ip = parse_ipv4(addr)
            .ok_or_else(|| ConfigWarning::InvalidAddress { token: token.to_string() })?;

        let prefix_len = match len {
            None => MAX_PREFIX_LEN,
            Some(len) => parse_decimal::<u8>(len)
                .filter(|l| *l <= MAX_PREFIX_LEN)
                .ok_or_else(|| ConfigWarning::InvalidPrefixLength { token: token.to_string() })?,
        };

        // prefix_len is range-checked above
        Self::new(ip, prefix_len)
            .ok_or_else(|| ConfigWarning::InvalidPrefixLength { token: token.to_string() })
    }
}

impl Serialize for BlacklistEntry {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

// =============================================================================
// Rate limits
// =============================================================================

/// Per-source rate limit: at most one admitted packet per `min_interval_ns`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct RateLimitRule {
    #[serde(serialize_with = "serialize_ip")]
    ip: u32,
    packets_per_second: NonZeroU32,
    min_interval_ns: u64,
}

impl RateLimitRule {
    pub fn new(ip: u32, packets_per_second: NonZeroU32) -> Self {
        Self {
            ip,
            packets_per_second,
            min_interval_ns: min_interval_ns(packets_per_second),
        }
    }

    pub fn ip(&self) -> u32 {
        self.ip
    }

    pub fn packets_per_second(&self) -> NonZeroU32 {
        self.packets_per_second
    }

    pub fn min_interval_ns(&self) -> u64 {
        self.min_interval_ns
    }
}

impl fmt::Display for RateLimitRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", Ipv4Addr::from(self.ip), self.packets_per_second)
    }
}

/// `a.b.c.d:pps` with `pps` a positive 32-bit integer.
impl FromStr for RateLimitRule {
    type Err = ConfigWarning;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        let (addr, pps) = token
            .split_once(':')
            .ok_or_else(|| ConfigWarning::MalformedRateLimit { token: token.to_string() })?;

        let ip = parse_ipv4(addr)
            .ok_or_else(|| ConfigWarning::InvalidAddress { token: token.to_string() })?;

        let pps = parse_decimal::<u32>(pps)
            .and_then(NonZeroU32::new)
            .ok_or_else(|| ConfigWarning::InvalidRate { token: token.to_string() })?;

        Ok(Self::new(ip, pps))
    }
}

fn parse_ipv4(s: &str) -> Option<u32> {
    s.parse::<Ipv4Addr>().ok().map(u32::from)
}

/// Plain decimal digits with no sign and no leading zero, the same form
/// `Ipv4Addr` accepts for an octet.
fn parse_decimal<T: FromStr>(s: &str) -> Option<T> {
    let canonical = match s.as_bytes() {
        [] => false,
        [b'0', _, ..] => false,
        digits => digits.iter().all(u8::is_ascii_digit),
    };
    canonical.then(|| s.parse().ok()).flatten()
}

fn serialize_ip<S: serde::Serializer>(ip: &u32, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(&Ipv4Addr::from(*ip))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> u32 {
        u32::from(s.parse::<Ipv4Addr>().unwrap())
    }

    #[test]
    fn test_entry_is_canonicalised() {
        let entry = BlacklistEntry::new(ip("10.1.2.3"), 8).unwrap();
        assert_eq!(entry.network(), ip("10.0.0.0"));
        assert_eq!(entry, BlacklistEntry::new(ip("10.0.0.0"), 8).unwrap());
        assert_eq!(entry.to_string(), "10.0.0.0/8");
        assert!(BlacklistEntry::new(0, 33).is_none());
    }

    #[test]
    fn test_entry_from_str() {
        assert_eq!(
            "192.168.1.1".parse::<BlacklistEntry>().unwrap(),
            BlacklistEntry::host(ip("192.168.1.1"))
        );
        assert_eq!(
            "10.9.9.9/8".parse::<BlacklistEntry>().unwrap(),
            BlacklistEntry::new(ip("10.0.0.0"), 8).unwrap()
        );
        assert_eq!(
            "0.0.0.0/0".parse::<BlacklistEntry>().unwrap().prefix_len(),
            0
        );
    }

    #[test]
    fn test_entry_from_str_errors() {
        assert!(matches!(
            "10.0.0.0/33".parse::<BlacklistEntry>(),
            Err(ConfigWarning::InvalidPrefixLength { .. })
        ));
        assert!(matches!(
            "10.0.0.0/".parse::<BlacklistEntry>(),
            Err(ConfigWarning::InvalidPrefixLength { .. })
        ));
        assert!(matches!(
            "10.0.0.0/x".parse::<BlacklistEntry>(),
            Err(ConfigWarning::InvalidPrefixLength { .. })
        ));
        assert!(matches!(
            "10.0.0.0/+8".parse::<BlacklistEntry>(),
            Err(ConfigWarning::InvalidPrefixLength { .. })
        ));
        assert!(matches!(
            "10.0.0.0/08".parse::<BlacklistEntry>(),
            Err(ConfigWarning::InvalidPrefixLength { .. })
        ));
        assert!(matches!(
            "10.0.0.0/ 8".parse::<BlacklistEntry>(),
            Err(ConfigWarning::InvalidPrefixLength { .. })
        ));
        assert!(matches!(
            "10.0.0/8".parse::<BlacklistEntry>(),
            Err(ConfigWarning::InvalidAddress { .. })
        ));
        assert!(matches!(
            "256.1.1.1".parse::<BlacklistEntry>(),
            Err(ConfigWarning::InvalidAddress { .. })
        ));
    }

    #[test]
    fn test_numeric_fields_are_plain_decimal() {
        assert_eq!("10.0.0.0/0".parse::<BlacklistEntry>().unwrap().prefix_len(), 0);
        assert_eq!("10.0.0.0/8".parse::<BlacklistEntry>().unwrap().prefix_len(), 8);
        assert_eq!("10.0.0.0/32".parse::<BlacklistEntry>().unwrap().prefix_len(), 32);
        assert_eq!(parse_decimal::<u32>("100"), Some(100));
        assert_eq!(parse_decimal::<u32>("0"), Some(0));
        assert_eq!(parse_decimal::<u32>("007"), None);
        assert_eq!(parse_decimal::<u32>("-0"), None);
        assert_eq!(parse_decimal::<u32>(""), None);
        assert_eq!(parse_decimal::<u8>("256"), None);
    }

    #[test]
    fn test_entry_table_key_roundtrip() {
        let entry = BlacklistEntry::new(ip("172.16.0.0"), 12).unwrap();
        assert_eq!(BlacklistEntry::from_table_key(entry.table_key()), Some(entry));
    }

    #[test]
    fn test_rate_limit_from_str() {
        let rule: RateLimitRule = "10.0.0.1:100".parse().unwrap();
        assert_eq!(rule.ip(), ip("10.0.0.1"));
        assert_eq!(rule.packets_per_second().get(), 100);
        assert_eq!(rule.min_interval_ns(), 10_000_000);
        assert_eq!(rule.to_string(), "10.0.0.1:100");
    }

    #[test]
    fn test_rate_limit_from_str_errors() {
        assert!(matches!(
            "10.0.0.1".parse::<RateLimitRule>(),
            Err(ConfigWarning::MalformedRateLimit { .. })
        ));
        assert!(matches!(
            "10.0.0.1:0".parse::<RateLimitRule>(),
            Err(ConfigWarning::InvalidRate { .. })
        ));
        assert!(matches!(
            "10.0.0.1:-5".parse::<RateLimitRule>(),
            Err(ConfigWarning::InvalidRate { .. })
        ));
        assert!(matches!(
            "10.0.0.1:+5".parse::<RateLimitRule>(),
            Err(ConfigWarning::InvalidRate { .. })
        ));
        assert!(matches!(
            "10.0.0.1:05".parse::<RateLimitRule>(),
            Err(ConfigWarning::InvalidRate { .. })
        ));
        assert!(matches!(
            "10.0.0.1:4294967296".parse::<RateLimitRule>(),
            Err(ConfigWarning::InvalidRate { .. })
        ));
        assert!(matches!(
            "host:10".parse::<RateLimitRule>(),
            Err(ConfigWarning::InvalidAddress { .. })
        ));
    }

    #[test]
    fn test_serialize_as_strings() {
        let entry = BlacklistEntry::new(ip("10.0.0.0"), 8).unwrap();
        assert_eq!(serde_json::to_string(&entry).unwrap(), r#""10.0.0.0/8""#);

        let rule: RateLimitRule = "1.2.3.4:5".parse().unwrap();
        assert_eq!(
            serde_json::to_string(&rule).unwrap(),
            r#"{"ip":"1.2.3.4","packets_per_second":5,"min_interval_ns":200000000}"#
        );
    }
}
