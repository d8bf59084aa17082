//! Configuration for the dispatcher.

use anyhow::Result;

/// Built-in disk floor for staging, applied when no explicit minimum is
/// configured. There is no equivalent built-in memory floor.
pub const DEFAULT_STAGING_DISK_MB: u64 = 4096;

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Minimum memory requested for a staging attempt, in MB. Zero means the
    /// app's own requirement is used as-is.
    pub min_staging_memory_mb: u64,

    /// Minimum disk requested for a staging attempt, in MB. Unset falls back
    /// to [`DEFAULT_STAGING_DISK_MB`].
    pub min_staging_disk_mb: Option<u64>,

    /// Seed addresses for the placement-tracking service.
    pub placement_addrs: Vec<String>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let min_staging_memory_mb = std::env::var("STAGEHAND_MIN_STAGING_MEMORY_MB")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);

        let min_staging_disk_mb = std::env::var("STAGEHAND_MIN_STAGING_DISK_MB")
            .ok()
            .and_then(|s| s.parse().ok());

        let placement_addrs = std::env::var("STAGEHAND_PLACEMENT_ADDRS")
            .map(|s| {
                s.split(',')
                    .map(str::trim)
                    .filter(|a| !a.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let log_level = std::env::var("STAGEHAND_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            min_staging_memory_mb,
            min_staging_disk_mb,
            placement_addrs,
            log_level,
        })
    }

    /// Memory floor for staging placement, in MB.
    pub fn staging_memory_floor_mb(&self) -> u64 {
        self.min_staging_memory_mb
    }

    /// Disk floor for staging placement, in MB.
    pub fn staging_disk_floor_mb(&self) -> u64 {
        self.min_staging_disk_mb.unwrap_or(DEFAULT_STAGING_DISK_MB)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            min_staging_memory_mb: 0,
            min_staging_disk_mb: None,
            placement_addrs: Vec::new(),
            log_level: "info".to_string(),
        }
    }
}
