//! `key=value` config file parsing.
//!
//! ```text
//! # comment
//! interface=eth0
//! ip_blacklist=192.168.1.100, 10.0.0.0/8
//! ip_rate_limits=172.16.0.5:100, 172.16.0.6:20
//! ```
//!
//! A key that is absent leaves the corresponding table untouched. A key
//! present with an empty list clears it. Bad tokens become warnings and are
//! skipped.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::error::ConfigWarning;
use crate::rules::{BlacklistEntry, RateLimitRule};

pub const KEY_INTERFACE: &str = "interface";
pub const KEY_BLACKLIST: &str = "ip_blacklist";
pub const KEY_RATE_LIMITS: &str = "ip_rate_limits";

/// One parsed config file. `None` means the key did not appear.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterConfig {
    pub interface: Option<String>,
    pub blacklist: Option<BTreeSet<BlacklistEntry>>,
    /// Keyed by source IP. A later token for the same IP replaces an earlier
    /// one.
    pub rate_limits: Option<BTreeMap<u32, RateLimitRule>>,
    pub warnings: Vec<ConfigWarning>,
}

impl FilterConfig {
    pub fn parse(raw: &str) -> Self {
        let mut config = FilterConfig::default();

        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                debug!("Ignoring config line without '=': {}", line);
                continue;
            };
            let value = value.trim();

            match key.trim() {
                KEY_INTERFACE => {
                    config.interface = (!value.is_empty()).then(|| value.to_string());
                }
                KEY_BLACKLIST => {
                    let entries = parse_blacklist(value, &mut config.warnings);
                    config.blacklist = Some(entries);
                }
                KEY_RATE_LIMITS => {
                    let rules = parse_rate_limits(value, &mut config.warnings);
                    config.rate_limits = Some(rules);
                }
                other => debug!("Ignoring unknown config key '{}'", other),
            }
        }

        config
    }
}

fn tokens(list: &str) -> impl Iterator<Item = &str> {
    list.split(',').map(str::trim).filter(|t| !t.is_empty())
}

/// Comma-separated `ip` or `ip/len` tokens. Duplicates collapse.
pub fn parse_blacklist(list: &str, warnings: &mut Vec<ConfigWarning>) -> BTreeSet<BlacklistEntry> {
    let mut entries = BTreeSet::new();
    for token in tokens(list) {
        match token.parse::<BlacklistEntry>() {
            Ok(entry) => {
                entries.insert(entry);
            }
            Err(w) => warnings.push(w),
        }
    }
    entries
}

/// Comma-separated `ip:pps` tokens.
pub fn parse_rate_limits(
    list: &str,
    warnings: &mut Vec<ConfigWarning>,
) -> BTreeMap<u32, RateLimitRule> {
    let mut rules = BTreeMap::new();
    for token in tokens(list) {
        match token.parse::<RateLimitRule>() {
            Ok(rule) => {
                rules.insert(rule.ip(), rule);
            }
            Err(w) => warnings.push(w),
        }
    }
    rules
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(s: &str) -> u32 {
        u32::from(s.parse::<Ipv4Addr>().unwrap())
    }

    #[test]
    fn test_parse_full_config() {
        let raw = "\
# filter config
interface = eth0

ip_blacklist=192.168.1.100, 10.0.0.0/8
ip_rate_limits= 172.16.0.5:100 ,172.16.0.6:20
";
        let config = FilterConfig::parse(raw);
        assert_eq!(config.interface.as_deref(), Some("eth0"));

        let blacklist = config.blacklist.unwrap();
        assert_eq!(blacklist.len(), 2);
        assert!(blacklist.contains(&"10.0.0.0/8".parse::<BlacklistEntry>().unwrap()));

        let rules = config.rate_limits.unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[&ip("172.16.0.5")].packets_per_second().get(), 100);
        assert!(config.warnings.is_empty());
    }

    #[test]
    fn test_absent_vs_empty_keys() {
        let config = FilterConfig::parse("interface=eth0\nip_blacklist=\n");
        assert_eq!(config.blacklist, Some(BTreeSet::new()));
        assert_eq!(config.rate_limits, None);
    }

    #[test]
    fn test_missing_or_empty_interface() {
        assert_eq!(FilterConfig::parse("ip_blacklist=1.1.1.1").interface, None);
        assert_eq!(FilterConfig::parse("interface=  ").interface, None);
    }

    #[test]
    fn test_last_line_for_key_wins() {
        let config = FilterConfig::parse("interface=eth0\ninterface=eth1\nip_blacklist=1.1.1.1\nip_blacklist=2.2.2.2");
        assert_eq!(config.interface.as_deref(), Some("eth1"));
        assert_eq!(
            config.blacklist.unwrap().into_iter().collect::<Vec<_>>(),
            vec!["2.2.2.2".parse::<BlacklistEntry>().unwrap()]
        );
    }

    #[test]
    fn test_duplicate_rate_limit_last_wins() {
        let mut warnings = Vec::new();
        let rules = parse_rate_limits("10.0.0.1:5, 10.0.0.1:50", &mut warnings);
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[&ip("10.0.0.1")].packets_per_second().get(), 50);
    }

    #[test]
    fn test_duplicate_blacklist_collapses() {
        let mut warnings = Vec::new();
        let entries = parse_blacklist("10.1.2.3/8, 10.0.0.0/8, 10.0.0.0/8", &mut warnings);
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_bad_tokens_are_warnings() {
        let config = FilterConfig::parse(
            "interface=eth0\nip_blacklist=1.1.1.1, 999.0.0.1, 10.0.0.0/40,, \nip_rate_limits=2.2.2.2:0, 3.3.3.3, 4.4.4.4:10",
        );
        assert_eq!(config.blacklist.unwrap().len(), 1);
        assert_eq!(config.rate_limits.unwrap().len(), 1);

        let tokens: Vec<&str> = config.warnings.iter().map(ConfigWarning::token).collect();
        assert_eq!(tokens, vec!["999.0.0.1", "10.0.0.0/40", "2.2.2.2:0", "3.3.3.3"]);
        assert!(matches!(config.warnings[0], ConfigWarning::InvalidAddress { .. }));
        assert!(matches!(config.warnings[1], ConfigWarning::InvalidPrefixLength { .. }));
        assert!(matches!(config.warnings[2], ConfigWarning::InvalidRate { .. }));
        assert!(matches!(config.warnings[3], ConfigWarning::MalformedRateLimit { .. }));
    }

    #[test]
    fn test_unknown_keys_and_junk_lines_ignored() {
        let config = FilterConfig::parse("interface=eth0\nfoo=bar\njust some text\n");
        assert_eq!(config.interface.as_deref(), Some("eth0"));
        assert!(config.blacklist.is_none());
        assert!(config.warnings.is_empty());
    }
}
