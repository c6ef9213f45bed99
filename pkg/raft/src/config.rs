//! Tunable parameters (spec.md §6 "Configuration parameters") plus the
//! explicit option struct that replaces the duck-typed options map the
//! original spec's `createTransaction` took (spec.md §9).

use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding `log-<index>-<term>.bin` files (spec.md §6
    /// "Persisted layout").
    pub log_dir: PathBuf,
    pub min_election_timeout: Duration,
    pub max_election_timeout: Duration,
    pub heartbeat_timeout: Duration,
    pub max_transaction_duration: Duration,
    pub commit_timeout: Duration,
    pub tcp_port: u16,
    pub follower_probing_enabled: bool,
    pub disable_sync: bool,
    pub dump_conflicts: bool,
    /// Bound used when computing a leader lease timeout (spec.md §4.6.1):
    /// subtracted from the quorum's last-heard time to account for clock
    /// drift between peers.
    pub max_clock_drift: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_dir: PathBuf::from("./data/log"),
            min_election_timeout: Duration::from_millis(750),
            max_election_timeout: Duration::from_millis(1000),
            heartbeat_timeout: Duration::from_millis(200),
            max_transaction_duration: Duration::from_millis(5000),
            commit_timeout: Duration::from_millis(5000),
            tcp_port: 9660,
            follower_probing_enabled: true,
            disable_sync: false,
            dump_conflicts: false,
            max_clock_drift: Duration::from_millis(50),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error(
        "heartbeat timeout ({heartbeat:?}) must be less than min election timeout ({min:?})"
    )]
    HeartbeatTooSlow { heartbeat: Duration, min: Duration },

    #[error("min election timeout ({min:?}) must be <= max election timeout ({max:?})")]
    ElectionRangeInverted { min: Duration, max: Duration },
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_timeout >= self.min_election_timeout {
            return Err(ConfigError::HeartbeatTooSlow {
                heartbeat: self.heartbeat_timeout,
                min: self.min_election_timeout,
            });
        }
        if self.min_election_timeout > self.max_election_timeout {
            return Err(ConfigError::ElectionRangeInverted {
                min: self.min_election_timeout,
                max: self.max_election_timeout,
            });
        }
        Ok(())
    }
}

/// Consistency level requested when opening a transaction (spec.md §6
/// "Consistency options").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consistency {
    /// Default: linearizable reads and writes.
    Linearizable,
    /// Read-only, view = last log entry, no leader round trip.
    Eventual,
    /// Read-only, view = last committed entry, immediate commit.
    EventualCommitted,
    /// Read-only, immediate commit, no commit info.
    Uncommitted,
}

/// Explicit, enumerated replacement for the duck-typed options map passed to
/// `createTransaction` (spec.md §9 "Duck-typed config objects").
#[derive(Debug, Clone)]
pub struct TransactionOptions {
    pub consistency: Consistency,
    pub high_priority: bool,
    /// 0 = unlimited.
    pub timeout_ms: u64,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        TransactionOptions {
            consistency: Consistency::Linearizable,
            high_priority: false,
            timeout_ms: 5000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn heartbeat_must_be_faster_than_election() {
        let mut c = Config::default();
        c.heartbeat_timeout = c.min_election_timeout;
        assert!(matches!(c.validate(), Err(ConfigError::HeartbeatTooSlow { .. })));
    }

    #[test]
    fn election_range_must_not_invert() {
        let mut c = Config::default();
        c.max_election_timeout = c.min_election_timeout - Duration::from_millis(1);
        assert!(matches!(c.validate(), Err(ConfigError::ElectionRangeInverted { .. })));
    }
}
