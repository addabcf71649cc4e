//! ipfilter - IPv4 source filter for XDP
//!
//! Userspace side of the filter:
//! - Config parsing and reconciliation of the blacklist (longest-prefix
//!   match) and per-source rate limits into the shared tables
//! - XDP program loading and the kernel map backend ([`IpFilter`], [`BpfMaps`])
//! - An in-process classifier over lock-free tables ([`Classifier`],
//!   [`MemoryTables`]) with the same decision procedure as the XDP program
//! - Statistics snapshots and the `stats.txt` table
//!
//! ```no_run
//! use ipfilter::{Classifier, MemoryTables, Reconciler};
//!
//! let tables = MemoryTables::shared();
//! let mut reconciler = Reconciler::new(tables.clone());
//! reconciler.reconcile("interface=eth0\nip_blacklist=10.0.0.0/8").unwrap();
//!
//! let classifier = Classifier::new(tables);
//! let verdict = classifier.classify(0x0A00_0001, ipfilter::monotonic_ns());
//! assert!(verdict.is_drop());
//! ```

pub mod bpf;
pub mod classifier;
mod clock;
pub mod config;
pub mod error;
pub mod rate_limiter;
pub mod reconciler;
pub mod report;
pub mod rules;
pub mod state;
pub mod table;

pub use bpf::{BpfMaps, IpFilter};
pub use classifier::Classifier;
pub use clock::monotonic_ns;
pub use config::FilterConfig;
pub use error::{ConfigError, ConfigWarning, TableError};
pub use ipfilter_common::{Admission, Verdict, MAX_ENTRIES};
pub use reconciler::{ReconcileReport, Reconciler, TableDelta};
pub use report::{report, GlobalTotals, IpStats, StatsReport};
pub use rules::{BlacklistEntry, RateLimitRule};
pub use state::{FilterMaps, MemoryTables, StatsSource};
