use serde::Serialize;
use thiserror::Error;

/// Fatal reconciliation errors. A pass that returns one of these has not
/// touched any table.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("config must contain 'interface='")]
    MissingInterface,

    #[error("changing interface from '{bound}' to '{requested}' is not supported, restart required")]
    InterfaceChangeUnsupported { bound: String, requested: String },
}

/// Per-token problems. The offending token is skipped, the pass continues.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConfigWarning {
    #[error("invalid IP address in '{token}'")]
    InvalidAddress { token: String },

    #[error("invalid prefix length in '{token}'")]
    InvalidPrefixLength { token: String },

    #[error("rate limit '{token}' is not in ip:pps form")]
    MalformedRateLimit { token: String },

    #[error("packets per second must be a positive integer in '{token}'")]
    InvalidRate { token: String },
}

impl ConfigWarning {
    pub fn token(&self) -> &str {
        match self {
            ConfigWarning::InvalidAddress { token }
            | ConfigWarning::InvalidPrefixLength { token }
            | ConfigWarning::MalformedRateLimit { token }
            | ConfigWarning::InvalidRate { token } => token,
        }
    }
}

/// Shared state table failures.
#[derive(Debug, Error)]
pub enum TableError {
    #[error("{table} table is full ({capacity} entries)")]
    Full { table: &'static str, capacity: usize },

    #[error("{table} map operation failed: {reason}")]
    Map { table: &'static str, reason: String },
}

impl TableError {
    pub fn is_full(&self) -> bool {
        matches!(self, TableError::Full { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::InterfaceChangeUnsupported {
            bound: "eth0".to_string(),
            requested: "wlan0".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "changing interface from 'eth0' to 'wlan0' is not supported, restart required"
        );
        assert_eq!(
            ConfigError::MissingInterface.to_string(),
            "config must contain 'interface='"
        );
    }

    #[test]
    fn test_warning_token() {
        let w = ConfigWarning::InvalidPrefixLength { token: "10.0.0.0/40".to_string() };
        assert_eq!(w.token(), "10.0.0.0/40");
        assert_eq!(w.to_string(), "invalid prefix length in '10.0.0.0/40'");
    }

    #[test]
    fn test_warning_serializes_with_kind() {
        let w = ConfigWarning::InvalidAddress { token: "nope".to_string() };
        let json = serde_json::to_string(&w).unwrap();
        assert_eq!(json, r#"{"kind":"invalid_address","token":"nope"}"#);
    }

    #[test]
    fn test_table_error_is_full() {
        let err = TableError::Full { table: "blacklist", capacity: 4 };
        assert!(err.is_full());
        assert_eq!(err.to_string(), "blacklist table is full (4 entries)");

        let err = TableError::Map { table: "rate_limits", reason: "EPERM".to_string() };
        assert!(!err.is_full());
    }
}
