//! Store Configuration
//!
//! Plain data consumed by [`TieredStore`](crate::TieredStore). Embedding
//! applications normally build these structs directly; [`StoreConfig::from_file`]
//! exists for the CLI and for applications that keep store settings in JSON.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// =============================================================================
// Defaults
// =============================================================================

/// Default number of segments in the hot tier
pub const DEFAULT_SEGMENT_COUNT: usize = 64;

/// Default expiry sweep interval in seconds
pub const DEFAULT_EXPIRY_INTERVAL_SECS: u64 = 120;

/// Default number of entries sampled per eviction decision
pub const DEFAULT_SAMPLE_SIZE: usize = 30;

/// Default spool queue budget (30 MiB)
pub const DEFAULT_SPOOL_BUFFER_BYTES: u64 = 30 * 1024 * 1024;

/// Default tolerance between data and index modification times
pub const DEFAULT_STALENESS_TOLERANCE_MS: u64 = 1000;

// =============================================================================
// Eviction policy selector
// =============================================================================

/// Which eviction selector the store uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyKind {
    /// Least recently used
    #[default]
    Lru,
    /// Least frequently used
    Lfu,
    /// First in, first out
    Fifo,
    /// Per-segment clock scan instead of random sampling
    Clock,
}

impl std::fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolicyKind::Lru => write!(f, "LRU"),
            PolicyKind::Lfu => write!(f, "LFU"),
            PolicyKind::Fifo => write!(f, "FIFO"),
            PolicyKind::Clock => write!(f, "CLOCK"),
        }
    }
}

impl std::str::FromStr for PolicyKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "lru" => Ok(PolicyKind::Lru),
            "lfu" => Ok(PolicyKind::Lfu),
            "fifo" => Ok(PolicyKind::Fifo),
            "clock" => Ok(PolicyKind::Clock),
            other => Err(Error::Config(format!("unknown eviction policy: {}", other))),
        }
    }
}

// =============================================================================
// Disk tier
// =============================================================================

/// Configuration of the overflow (disk) tier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskConfig {
    /// Directory holding `<name>.data` and `<name>.index`
    pub directory: PathBuf,

    /// Keep data across restarts
    pub persistent: bool,

    /// Maximum on-disk element count (0 = unbounded)
    pub max_elements_on_disk: usize,

    /// Maximum on-disk bytes (0 = unbounded)
    pub max_bytes_on_disk: u64,

    /// Queued spool bytes above which puts back off
    pub spool_buffer_bytes: u64,

    /// Keep the just-written element attached to its marker until first read
    pub cache_written_elements: bool,

    /// Re-admit disk hits into the hot tier
    pub fault_in: bool,

    /// Allowed gap between data file and index modification times
    pub index_staleness_tolerance_ms: u64,
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            directory: std::env::temp_dir().join("tierstore"),
            persistent: false,
            max_elements_on_disk: 0,
            max_bytes_on_disk: 0,
            spool_buffer_bytes: DEFAULT_SPOOL_BUFFER_BYTES,
            cache_written_elements: false,
            fault_in: true,
            index_staleness_tolerance_ms: DEFAULT_STALENESS_TOLERANCE_MS,
        }
    }
}

impl DiskConfig {
    /// Disk tier rooted at `directory` with default limits
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            ..Default::default()
        }
    }

    /// Staleness tolerance as a Duration
    pub fn staleness_tolerance(&self) -> Duration {
        Duration::from_millis(self.index_staleness_tolerance_ms)
    }

    /// Data file path for a store name
    pub fn data_path(&self, name: &str) -> PathBuf {
        self.directory.join(format!("{}.data", name))
    }

    /// Index file path for a store name
    pub fn index_path(&self, name: &str) -> PathBuf {
        self.directory.join(format!("{}.index", name))
    }
}

// =============================================================================
// Store
// =============================================================================

/// Configuration of a tiered store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Store name, also the data/index file stem
    pub name: String,

    /// Number of hot-tier segments (power of two)
    pub segment_count: usize,

    /// Maximum resident element count (0 = unbounded)
    pub max_elements_in_memory: usize,

    /// Maximum resident bytes (0 = unbounded)
    pub max_bytes_in_memory: u64,

    /// Eviction selector
    pub eviction_policy: PolicyKind,

    /// Default time-to-live for elements without their own lifespan
    pub default_ttl_secs: u32,

    /// Default time-to-idle for elements without their own lifespan
    pub default_tti_secs: u32,

    /// Elements without their own lifespan never expire
    pub eternal: bool,

    /// Interval between background expiry sweeps
    pub expiry_interval_secs: u64,

    /// Entries sampled per eviction decision
    pub eviction_sample_size: usize,

    /// Overflow tier, if any
    pub disk: Option<DiskConfig>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            segment_count: DEFAULT_SEGMENT_COUNT,
            max_elements_in_memory: 10_000,
            max_bytes_in_memory: 0,
            eviction_policy: PolicyKind::default(),
            default_ttl_secs: 0,
            default_tti_secs: 0,
            eternal: false,
            expiry_interval_secs: DEFAULT_EXPIRY_INTERVAL_SECS,
            eviction_sample_size: DEFAULT_SAMPLE_SIZE,
            disk: None,
        }
    }
}

impl StoreConfig {
    /// Memory-only store with the given name and resident capacity
    pub fn new(name: impl Into<String>, max_elements_in_memory: usize) -> Self {
        Self {
            name: name.into(),
            max_elements_in_memory,
            ..Default::default()
        }
    }

    /// Attach an overflow tier
    pub fn with_disk(mut self, disk: DiskConfig) -> Self {
        self.disk = Some(disk);
        self
    }

    /// Select the eviction policy
    pub fn with_policy(mut self, policy: PolicyKind) -> Self {
        self.eviction_policy = policy;
        self
    }

    /// Expiry sweep interval as a Duration
    pub fn expiry_interval(&self) -> Duration {
        Duration::from_secs(self.expiry_interval_secs)
    }

    /// Load a configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read config {}: {}", path.display(), e))
        })?;
        let config: StoreConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Config("store name must not be empty".into()));
        }
        if self
            .name
            .chars()
            .any(|c| std::path::is_separator(c) || c == '\0')
        {
            return Err(Error::Config(format!(
                "store name {:?} must not contain path separators",
                self.name
            )));
        }
        if self.segment_count == 0 || !self.segment_count.is_power_of_two() {
            return Err(Error::Config(
                "segment_count must be a power of 2".into(),
            ));
        }
        if self.segment_count > 1 << 16 {
            return Err(Error::Config("segment_count must be <= 65536".into()));
        }
        if self.expiry_interval_secs == 0 {
            return Err(Error::Config("expiry_interval_secs must be > 0".into()));
        }
        if self.eviction_sample_size == 0 {
            return Err(Error::Config("eviction_sample_size must be > 0".into()));
        }
        if let Some(disk) = &self.disk {
            if disk.directory.as_os_str().is_empty() {
                return Err(Error::Config("disk directory must not be empty".into()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = StoreConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.segment_count, 64);
        assert_eq!(config.eviction_policy, PolicyKind::Lru);
        assert!(config.disk.is_none());
    }

    #[test]
    fn test_segment_count_must_be_power_of_two() {
        let config = StoreConfig {
            segment_count: 48,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_name_with_separator_rejected() {
        let config = StoreConfig::new("a/b", 10);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!("LFU".parse::<PolicyKind>().unwrap(), PolicyKind::Lfu);
        assert_eq!("clock".parse::<PolicyKind>().unwrap(), PolicyKind::Clock);
        assert!("mru".parse::<PolicyKind>().is_err());
        assert_eq!(format!("{}", PolicyKind::Fifo), "FIFO");
    }

    #[test]
    fn test_json_partial_uses_defaults() {
        let raw = r#"{
            "name": "sessions",
            "max_elements_in_memory": 500,
            "eviction_policy": "lfu",
            "disk": { "directory": "/var/tmp/sessions", "persistent": true }
        }"#;
        let config: StoreConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.name, "sessions");
        assert_eq!(config.max_elements_in_memory, 500);
        assert_eq!(config.eviction_policy, PolicyKind::Lfu);
        assert_eq!(config.segment_count, DEFAULT_SEGMENT_COUNT);

        let disk = config.disk.unwrap();
        assert!(disk.persistent);
        assert!(disk.fault_in);
        assert_eq!(disk.spool_buffer_bytes, DEFAULT_SPOOL_BUFFER_BYTES);
        assert_eq!(
            disk.data_path("sessions"),
            PathBuf::from("/var/tmp/sessions/sessions.data")
        );
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(&path, r#"{"name": "f", "expiry_interval_secs": 5}"#).unwrap();

        let config = StoreConfig::from_file(&path).unwrap();
        assert_eq!(config.expiry_interval(), Duration::from_secs(5));

        std::fs::write(&path, r#"{"name": "f", "expiry_interval_secs": 0}"#).unwrap();
        assert!(StoreConfig::from_file(&path).is_err());
    }
}
