use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::controller::ControllerConfig;
use crate::error::SyncError;
use crate::heartbeat::HeartbeatConfig;
use crate::queue::{OverflowPolicy, OverflowStrategy, QueueConfig};
use crate::retry::RetryPolicy;
use crate::scheduler::{BatchRule, PriorityTier, SchedulerConfig};
use crate::transport::TransportConfig;

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   config.toml:     [reconnect]
//                    max_attempts = 5
//
//   env var:         AGENT_SYNC_RECONNECT__MAX_ATTEMPTS=5   (double underscore = nesting)
//
//   (single underscore stays within field names: AGENT_SYNC_HEARTBEAT__INTERVAL_SECS)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub reconnect: ReconnectFileConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatFileConfig,
    #[serde(default)]
    pub queue: QueueFileConfig,
    #[serde(default)]
    pub scheduler: SchedulerFileConfig,
    #[serde(default)]
    pub transport: TransportFileConfig,
}

/// Backoff tunables (lives under `[reconnect]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReconnectFileConfig {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// 0 = retry forever
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(default = "default_jitter_min")]
    pub jitter_min: f64,
    #[serde(default = "default_jitter_max")]
    pub jitter_max: f64,
}

impl Default for ReconnectFileConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
            backoff_factor: default_backoff_factor(),
            jitter_min: default_jitter_min(),
            jitter_max: default_jitter_max(),
        }
    }
}

/// Liveness probing (lives under `[heartbeat]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HeartbeatFileConfig {
    #[serde(default = "default_heartbeat_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for HeartbeatFileConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_heartbeat_interval_secs(),
            timeout_secs: default_heartbeat_timeout_secs(),
        }
    }
}

/// Outgoing action buffering (lives under `[queue]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueFileConfig {
    /// "unbounded" or "bounded"
    #[serde(default = "default_queue_policy")]
    pub policy: String,
    /// Hard limit when bounded.
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,
    /// "drop_oldest" or "reject_new"; only used when bounded.
    #[serde(default = "default_queue_strategy")]
    pub strategy: String,
    /// Soft limit when unbounded: a warning observation is emitted past it.
    #[serde(default = "default_queue_warn_threshold")]
    pub warn_threshold: usize,
    #[serde(default = "default_queue_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for QueueFileConfig {
    fn default() -> Self {
        Self {
            policy: default_queue_policy(),
            capacity: default_queue_capacity(),
            strategy: default_queue_strategy(),
            warn_threshold: default_queue_warn_threshold(),
            ttl_secs: default_queue_ttl_secs(),
        }
    }
}

/// Batching window for one event type.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BatchFileRule {
    pub max_events: usize,
    pub window_ms: u64,
}

/// Inbound dispatch tuning (lives under `[scheduler]` in config.toml).
///
/// ```toml
/// [scheduler.priorities]
/// activity = "low"
///
/// [scheduler.batch.file_changed]
/// max_events = 20
/// window_ms = 500
///
/// [scheduler.throttle_ms]
/// progress = 250
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SchedulerFileConfig {
    /// Per-type tier overrides on top of the built-in classification.
    #[serde(default)]
    pub priorities: BTreeMap<String, PriorityTier>,
    #[serde(default = "default_batch_rules")]
    pub batch: BTreeMap<String, BatchFileRule>,
    #[serde(default = "default_throttle_rules")]
    pub throttle_ms: BTreeMap<String, u64>,
}

impl Default for SchedulerFileConfig {
    fn default() -> Self {
        Self {
            priorities: BTreeMap::new(),
            batch: default_batch_rules(),
            throttle_ms: default_throttle_rules(),
        }
    }
}

/// Link tunables (lives under `[transport]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransportFileConfig {
    /// Endpoint used when none is given on the command line.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Outbound frames buffered per link before `transmit` waits.
    #[serde(default = "default_send_buffer")]
    pub send_buffer: usize,
}

impl Default for TransportFileConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            connect_timeout_secs: default_connect_timeout_secs(),
            send_buffer: default_send_buffer(),
        }
    }
}

fn default_initial_delay_ms() -> u64 {
    1000
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_max_attempts() -> u32 {
    10
}
fn default_backoff_factor() -> f64 {
    2.0
}
fn default_jitter_min() -> f64 {
    0.8
}
fn default_jitter_max() -> f64 {
    1.2
}
fn default_heartbeat_interval_secs() -> u64 {
    15
}
fn default_heartbeat_timeout_secs() -> u64 {
    10
}
fn default_queue_policy() -> String {
    "unbounded".to_string()
}
fn default_queue_capacity() -> usize {
    1000
}
fn default_queue_strategy() -> String {
    "drop_oldest".to_string()
}
fn default_queue_warn_threshold() -> usize {
    500
}
fn default_queue_ttl_secs() -> u64 {
    24 * 60 * 60
}
fn default_batch_rules() -> BTreeMap<String, BatchFileRule> {
    BTreeMap::from([(
        "file_changed".to_string(),
        BatchFileRule {
            max_events: 20,
            window_ms: 500,
        },
    )])
}
fn default_throttle_rules() -> BTreeMap<String, u64> {
    BTreeMap::from([("progress".to_string(), 250)])
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_send_buffer() -> usize {
    64
}

/// Build a figment that layers: defaults → config.toml → AGENT_SYNC_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `AGENT_SYNC_RECONNECT__MAX_ATTEMPTS=5`  →  `reconnect.max_attempts = 5`
///   `AGENT_SYNC_QUEUE__POLICY=bounded`      →  `queue.policy = "bounded"`
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("AGENT_SYNC_").split("__"))
}

// =============================================================================
// Runtime config structs (derived from FileConfig, used by the components)
// =============================================================================

#[derive(Clone, Debug)]
pub struct SyncConfig {
    pub retry: RetryPolicy,
    pub heartbeat: HeartbeatConfig,
    pub queue: QueueConfig,
    pub scheduler: SchedulerConfig,
    pub transport: TransportConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            heartbeat: HeartbeatConfig::default(),
            queue: QueueConfig::default(),
            scheduler: SchedulerConfig::default(),
            transport: TransportConfig::default(),
        }
    }
}

impl SyncConfig {
    pub fn from_file(fc: &FileConfig) -> Result<Self, SyncError> {
        Ok(Self {
            retry: retry_from_file(&fc.reconnect)?,
            heartbeat: heartbeat_from_file(&fc.heartbeat)?,
            queue: queue_from_file(&fc.queue)?,
            scheduler: scheduler_from_file(&fc.scheduler)?,
            transport: TransportConfig {
                connect_timeout: Duration::from_secs(fc.transport.connect_timeout_secs.max(1)),
                send_buffer: fc.transport.send_buffer.max(1),
            },
        })
    }

    pub fn controller(&self) -> ControllerConfig {
        ControllerConfig {
            retry: self.retry.clone(),
            heartbeat: self.heartbeat.clone(),
            transport: self.transport.clone(),
        }
    }

    /// Extract and validate from a figment built by [`load_config`].
    pub fn load(data_dir: &Path) -> Result<(FileConfig, Self), SyncError> {
        let fc: FileConfig = load_config(data_dir)
            .extract()
            .map_err(|e| SyncError::Config(e.to_string()))?;
        let config = Self::from_file(&fc)?;
        Ok((fc, config))
    }
}

fn retry_from_file(fc: &ReconnectFileConfig) -> Result<RetryPolicy, SyncError> {
    if !(fc.backoff_factor >= 1.0) {
        return Err(SyncError::Config(format!(
            "reconnect.backoff_factor must be >= 1.0, got {}",
            fc.backoff_factor
        )));
    }
    if !(fc.jitter_min > 0.0 && fc.jitter_min <= fc.jitter_max) {
        return Err(SyncError::Config(format!(
            "reconnect jitter range {}..={} is invalid",
            fc.jitter_min, fc.jitter_max
        )));
    }
    if fc.initial_delay_ms > fc.max_delay_ms {
        return Err(SyncError::Config(
            "reconnect.initial_delay_ms exceeds reconnect.max_delay_ms".into(),
        ));
    }
    Ok(RetryPolicy {
        initial_delay: Duration::from_millis(fc.initial_delay_ms),
        max_delay: Duration::from_millis(fc.max_delay_ms),
        max_attempts: (fc.max_attempts > 0).then_some(fc.max_attempts),
        backoff_factor: fc.backoff_factor,
        jitter_range: fc.jitter_min..=fc.jitter_max,
    })
}

fn heartbeat_from_file(fc: &HeartbeatFileConfig) -> Result<HeartbeatConfig, SyncError> {
    if fc.interval_secs == 0 {
        return Err(SyncError::Config("heartbeat.interval_secs must be > 0".into()));
    }
    Ok(HeartbeatConfig {
        interval: Duration::from_secs(fc.interval_secs),
        timeout: Duration::from_secs(fc.timeout_secs),
    })
}

fn queue_from_file(fc: &QueueFileConfig) -> Result<QueueConfig, SyncError> {
    let overflow = match fc.policy.as_str() {
        "unbounded" => OverflowPolicy::Unbounded {
            warn_threshold: fc.warn_threshold,
        },
        "bounded" => {
            if fc.capacity == 0 {
                return Err(SyncError::Config("queue.capacity must be > 0".into()));
            }
            let strategy = match fc.strategy.as_str() {
                "drop_oldest" => OverflowStrategy::DropOldest,
                "reject_new" => OverflowStrategy::RejectNew,
                other => {
                    return Err(SyncError::Config(format!(
                        "unknown queue.strategy '{other}' (expected drop_oldest or reject_new)"
                    )));
                }
            };
            OverflowPolicy::Bounded {
                capacity: fc.capacity,
                strategy,
            }
        }
        other => {
            return Err(SyncError::Config(format!(
                "unknown queue.policy '{other}' (expected unbounded or bounded)"
            )));
        }
    };
    Ok(QueueConfig {
        overflow,
        ttl: Duration::from_secs(fc.ttl_secs),
    })
}

fn scheduler_from_file(fc: &SchedulerFileConfig) -> Result<SchedulerConfig, SyncError> {
    let mut batching = BTreeMap::new();
    for (event_type, rule) in &fc.batch {
        if rule.max_events == 0 {
            return Err(SyncError::Config(format!(
                "scheduler.batch.{event_type}.max_events must be > 0"
            )));
        }
        batching.insert(
            event_type.clone(),
            BatchRule {
                max_events: rule.max_events,
                window: Duration::from_millis(rule.window_ms),
            },
        );
    }
    let throttling = fc
        .throttle_ms
        .iter()
        .map(|(event_type, ms)| (event_type.clone(), Duration::from_millis(*ms)))
        .collect();
    Ok(SchedulerConfig {
        priorities: fc.priorities.clone(),
        batching,
        throttling,
    })
}

// =============================================================================
// Directory layout (derived from --data-dir, not tunable via figment)
// =============================================================================

#[derive(Clone, Debug)]
pub struct SyncPaths {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
}

impl SyncPaths {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self, SyncError> {
        let data_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .ok_or_else(|| SyncError::Config("could not find home directory".into()))?
                .join(".agent-sync"),
        };

        std::fs::create_dir_all(&data_dir).map_err(|e| {
            SyncError::Config(format!("failed to create data directory {data_dir:?}: {e}"))
        })?;

        let db_path = data_dir.join("agent-sync.db");

        info!("Data directory: {}", data_dir.display());

        Ok(Self { data_dir, db_path })
    }

    pub fn db_url(&self) -> String {
        format!("sqlite://{}?mode=rwc", self.db_path.display())
    }

    pub fn config_toml_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── defaults ────────────────────────────────────────────────────────

    #[test]
    fn test_reconnect_file_config_defaults() {
        let d = ReconnectFileConfig::default();
        assert_eq!(d.initial_delay_ms, 1000);
        assert_eq!(d.max_delay_ms, 30_000);
        assert_eq!(d.max_attempts, 10);
        assert_eq!(d.backoff_factor, 2.0);
    }

    #[test]
    fn test_default_file_config_matches_runtime_defaults() {
        let sc = SyncConfig::from_file(&FileConfig::default()).unwrap();
        let defaults = SyncConfig::default();
        assert_eq!(sc.retry, defaults.retry);
        assert_eq!(sc.heartbeat, defaults.heartbeat);
        assert_eq!(sc.queue, defaults.queue);
        assert_eq!(sc.scheduler, defaults.scheduler);
        assert_eq!(sc.transport, defaults.transport);
    }

    // ── from_file ───────────────────────────────────────────────────────

    #[test]
    fn test_zero_max_attempts_means_forever() {
        let fc = FileConfig {
            reconnect: ReconnectFileConfig {
                max_attempts: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        let sc = SyncConfig::from_file(&fc).unwrap();
        assert_eq!(sc.retry.max_attempts, None);
    }

    #[test]
    fn test_bounded_queue_from_file() {
        let fc = FileConfig {
            queue: QueueFileConfig {
                policy: "bounded".into(),
                capacity: 3,
                strategy: "reject_new".into(),
                ..Default::default()
            },
            ..Default::default()
        };
        let sc = SyncConfig::from_file(&fc).unwrap();
        assert_eq!(
            sc.queue.overflow,
            OverflowPolicy::Bounded {
                capacity: 3,
                strategy: OverflowStrategy::RejectNew
            }
        );
    }

    #[test]
    fn test_invalid_values_rejected() {
        let bad_policy = FileConfig {
            queue: QueueFileConfig {
                policy: "sometimes".into(),
                ..Default::default()
            },
            ..Default::default()
        };
        let err = SyncConfig::from_file(&bad_policy).unwrap_err();
        assert_eq!(err.error_code(), "config_error");

        let bad_factor = FileConfig {
            reconnect: ReconnectFileConfig {
                backoff_factor: 0.5,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(SyncConfig::from_file(&bad_factor).is_err());

        let bad_batch = FileConfig {
            scheduler: SchedulerFileConfig {
                batch: BTreeMap::from([(
                    "file_changed".to_string(),
                    BatchFileRule {
                        max_events: 0,
                        window_ms: 500,
                    },
                )]),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(SyncConfig::from_file(&bad_batch).is_err());
    }

    // ── SyncPaths ───────────────────────────────────────────────────────

    #[test]
    fn test_sync_paths_with_custom_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = SyncPaths::new(Some(tmp.path().to_path_buf())).unwrap();

        assert_eq!(paths.data_dir, tmp.path());
        assert_eq!(paths.db_path, tmp.path().join("agent-sync.db"));
        assert_eq!(paths.config_toml_path(), tmp.path().join("config.toml"));

        let url = paths.db_url();
        assert!(url.starts_with("sqlite://"));
        assert!(url.ends_with("agent-sync.db?mode=rwc"));
    }

    // ── load_config ─────────────────────────────────────────────────────

    #[test]
    fn test_load_config_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let fc: FileConfig = load_config(tmp.path()).extract().unwrap();
        assert_eq!(fc.heartbeat.interval_secs, 15);
        assert_eq!(fc.queue.policy, "unbounded");
        assert!(fc.scheduler.batch.contains_key("file_changed"));
    }

    #[test]
    fn test_load_config_toml_sets_values() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("config.toml"),
            "[heartbeat]\ninterval_secs = 5\n\n[scheduler.throttle_ms]\nprogress = 100\n\n[scheduler.priorities]\nfile_changed = \"low\"\n",
        )
        .unwrap();
        let (fc, sc) = SyncConfig::load(tmp.path()).unwrap();
        assert_eq!(fc.heartbeat.interval_secs, 5);
        assert_eq!(sc.heartbeat.interval, Duration::from_secs(5));
        assert_eq!(
            sc.scheduler.throttling.get("progress"),
            Some(&Duration::from_millis(100))
        );
        assert_eq!(
            sc.scheduler.priorities.get("file_changed"),
            Some(&PriorityTier::Low)
        );
    }
}
