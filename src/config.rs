//! Configuration for a recovery log deployment.
//!
//! Every field has a default, so an empty JSON object is a valid
//! config. Durations are whole milliseconds.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::errors::LogException;
use crate::errors::RecoveryLogError;
use crate::errors::Result;
use crate::model::OwnerId;

/// Environment variable consulted by [`crate::tracing::setup_from_env`].
pub const LOG_LEVEL_ENV: &str = "RECOVERY_LOG_LOG_LEVEL";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RecoveryLogConfig {
    /// Identity this process uses when holding leases.
    pub owner_id: OwnerId,
    pub lease: LeaseConfig,
    pub retry: RetryPolicy,
    pub keypoint: KeypointPolicy,
    pub corrupt_records: CorruptRecordPolicy,
    pub store: StoreConfig,
}

impl Default for RecoveryLogConfig {
    fn default() -> Self {
        Self {
            owner_id: OwnerId::new(default_owner_id()),
            lease: LeaseConfig::default(),
            retry: RetryPolicy::default(),
            keypoint: KeypointPolicy::default(),
            corrupt_records: CorruptRecordPolicy::default(),
            store: StoreConfig::default(),
        }
    }
}

fn default_owner_id() -> String {
    format!("pid-{}", std::process::id())
}

impl RecoveryLogConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).reraise("Error parsing recovery log config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        tracing::debug!("Loading recovery log config from {path:?}");
        let json = std::fs::read_to_string(path).reraise("Error reading recovery log config")?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if self.owner_id.0.is_empty() {
            return Err(RecoveryLogError::InvalidConfig(
                "owner_id must not be empty".to_owned(),
            ));
        }
        if self.lease.duration_ms == 0 {
            return Err(RecoveryLogError::InvalidConfig(
                "lease.duration_ms must be positive".to_owned(),
            ));
        }
        if self.lease.renew_interval_ms == 0 || self.lease.renew_interval_ms >= self.lease.duration_ms {
            return Err(RecoveryLogError::InvalidConfig(format!(
                "lease.renew_interval_ms ({}) must be positive and shorter than lease.duration_ms ({})",
                self.lease.renew_interval_ms, self.lease.duration_ms
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(RecoveryLogError::InvalidConfig(
                "retry.max_attempts must be at least 1".to_owned(),
            ));
        }
        if self.store.read_batch_size == 0 {
            return Err(RecoveryLogError::InvalidConfig(
                "store.read_batch_size must be positive".to_owned(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LeaseConfig {
    /// How far in the future each acquire or renew pushes the expiry.
    pub duration_ms: u64,
    /// How often the heartbeat renews.
    pub renew_interval_ms: u64,
    /// Extra time granted to another owner's lease before it counts
    /// as expired, to tolerate clock drift between servers.
    pub leeway_ms: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            duration_ms: 20_000,
            renew_interval_ms: 5_000,
            leeway_ms: 2_000,
        }
    }
}

impl LeaseConfig {
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    pub fn renew_interval(&self) -> Duration {
        Duration::from_millis(self.renew_interval_ms)
    }

    pub fn leeway(&self) -> Duration {
        Duration::from_millis(self.leeway_ms)
    }
}

/// Bounded exponential backoff for retryable store errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 50,
            max_backoff_ms: 2_000,
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts; for tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
        }
    }

    /// Wait before the attempt after `failed_attempt` (1-based).
    ///
    /// Doubles from `initial_backoff_ms`, capped at `max_backoff_ms`,
    /// plus up to a quarter of that again as jitter.
    pub fn backoff(&self, failed_attempt: u32) -> Duration {
        let exp = failed_attempt.saturating_sub(1).min(32);
        let base = self
            .initial_backoff_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_backoff_ms);
        let jitter = if base >= 4 {
            fastrand::u64(..=base / 4)
        } else {
            0
        };
        Duration::from_millis(base + jitter)
    }
}

/// When to compact sections. Unset triggers never fire; manual
/// keypoints always work.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KeypointPolicy {
    /// Keypoint every section after this many successful flushes.
    pub after_flushes: Option<u64>,
    /// Keypoint a section once this many of its stored rows no longer
    /// back a live unit.
    pub dead_record_threshold: Option<u64>,
    /// Keypoint every section once this much time has passed since
    /// the last keypoint.
    pub interval_ms: Option<u64>,
}

impl KeypointPolicy {
    pub fn interval(&self) -> Option<Duration> {
        self.interval_ms.map(Duration::from_millis)
    }
}

/// What replay does with a record that fails to decode.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorruptRecordPolicy {
    /// Fail the open; the scope stays out of service.
    #[default]
    Abort,
    /// Skip the record, report it in the replay result and warn.
    Quarantine,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    /// How long a store call waits on a locked database before
    /// failing as unavailable.
    pub busy_timeout_ms: u64,
    /// Rows fetched per round trip during replay.
    pub read_batch_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
            read_batch_size: 1_000,
        }
    }
}

#[test]
fn empty_json_is_default() {
    let config = RecoveryLogConfig::from_json("{}").unwrap();
    assert_eq!(config.lease.duration_ms, 20_000);
    assert_eq!(config.retry.max_attempts, 5);
    assert_eq!(config.corrupt_records, CorruptRecordPolicy::Abort);
    assert!(config.keypoint.after_flushes.is_none());
}

#[test]
fn partial_json_overrides() {
    let config = RecoveryLogConfig::from_json(
        r#"{
            "owner_id": "server2",
            "lease": { "duration_ms": 1000, "renew_interval_ms": 250 },
            "corrupt_records": "quarantine",
            "keypoint": { "dead_record_threshold": 64 }
        }"#,
    )
    .unwrap();
    assert_eq!(config.owner_id, OwnerId::new("server2"));
    assert_eq!(config.lease.duration(), Duration::from_secs(1));
    assert_eq!(config.lease.leeway_ms, 2_000);
    assert_eq!(config.corrupt_records, CorruptRecordPolicy::Quarantine);
    assert_eq!(config.keypoint.dead_record_threshold, Some(64));
}

#[test]
fn renew_slower_than_lease_is_invalid() {
    let res = RecoveryLogConfig::from_json(
        r#"{ "lease": { "duration_ms": 1000, "renew_interval_ms": 1000 } }"#,
    );
    assert!(matches!(res, Err(RecoveryLogError::InvalidConfig(..))));
}

#[test]
fn unknown_field_is_invalid() {
    let res = RecoveryLogConfig::from_json(r#"{ "lease_ms": 5 }"#);
    assert!(matches!(
        res.map_err(|err| err.root().to_string()),
        Err(msg) if msg.contains("lease_ms")
    ));
}

#[test]
fn corrupt_policy_tokens() {
    use serde_test::assert_tokens;
    use serde_test::Token;

    assert_tokens(
        &CorruptRecordPolicy::Quarantine,
        &[Token::UnitVariant {
            name: "CorruptRecordPolicy",
            variant: "quarantine",
        }],
    );
}

#[test]
fn backoff_doubles_and_caps() {
    let policy = RetryPolicy {
        max_attempts: 10,
        initial_backoff_ms: 100,
        max_backoff_ms: 1_000,
    };
    let first = policy.backoff(1);
    assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(125));
    let third = policy.backoff(3);
    assert!(third >= Duration::from_millis(400) && third <= Duration::from_millis(500));
    let capped = policy.backoff(30);
    assert!(capped >= Duration::from_millis(1_000) && capped <= Duration::from_millis(1_250));
    assert_eq!(RetryPolicy::immediate(3).backoff(2), Duration::ZERO);
}
