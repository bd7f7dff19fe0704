//! Store Configuration
//!
//! ## StoreConfig
//!
//! Controls the segment lifecycle and the coordinator's resource bounds:
//!
//! - **directory**: where segment files and the index database live
//! - **segment_max_size**: soft cap per segment; the current segment rolls
//!   when the append offset reaches it (default: 256MB)
//! - **sync_interval_ms**: group-commit timer period (default: 5ms)
//! - **read_handle_cache_size**: max cached read descriptors (default: 256)
//! - **message_cache_max_bytes**: payload cache budget (default: 10MB)
//! - **op_queue_depth**: coordinator inbox capacity (default: 1024)
//! - **start_mode**: which location-index backend to start with
//!
//! ## Usage
//!
//! ```ignore
//! use queuehouse_store::{StoreConfig, StorageMode};
//!
//! // Production defaults
//! let config = StoreConfig {
//!     directory: "/var/lib/queuehouse".into(),
//!     ..Default::default()
//! };
//!
//! // Small segments for fast tests
//! let config = StoreConfig {
//!     directory: temp_dir.path().to_path_buf(),
//!     segment_max_size: 64 * 1024,
//!     ..Default::default()
//! };
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Which backend holds the message location index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    /// In-memory hash table (low latency).
    RamDisk,
    /// Disk-resident table (low memory).
    DiskOnly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory holding segment files and the index database.
    pub directory: PathBuf,

    /// Soft segment size cap in bytes before rolling (default: 256MB).
    #[serde(default = "default_segment_max_size")]
    pub segment_max_size: u64,

    /// Group-commit interval in milliseconds (default: 5ms).
    #[serde(default = "default_sync_interval_ms")]
    pub sync_interval_ms: u64,

    /// Maximum number of cached read descriptors (default: 256).
    #[serde(default = "default_read_handle_cache_size")]
    pub read_handle_cache_size: usize,

    /// Payload cache budget in bytes (default: 10MB).
    #[serde(default = "default_message_cache_max_bytes")]
    pub message_cache_max_bytes: u64,

    /// Coordinator inbox capacity (default: 1024).
    #[serde(default = "default_op_queue_depth")]
    pub op_queue_depth: usize,

    /// Location-index backend to start with (default: ram_disk).
    #[serde(default = "default_start_mode")]
    pub start_mode: StorageMode,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./data"),
            segment_max_size: default_segment_max_size(),
            sync_interval_ms: default_sync_interval_ms(),
            read_handle_cache_size: default_read_handle_cache_size(),
            message_cache_max_bytes: default_message_cache_max_bytes(),
            op_queue_depth: default_op_queue_depth(),
            start_mode: default_start_mode(),
        }
    }
}

fn default_segment_max_size() -> u64 {
    256 * 1024 * 1024 // 256MB
}

fn default_sync_interval_ms() -> u64 {
    5
}

fn default_read_handle_cache_size() -> usize {
    256
}

fn default_message_cache_max_bytes() -> u64 {
    10 * 1024 * 1024 // 10MB
}

fn default_op_queue_depth() -> usize {
    1024
}

fn default_start_mode() -> StorageMode {
    StorageMode::RamDisk
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StoreConfig::default();
        assert_eq!(config.segment_max_size, 256 * 1024 * 1024);
        assert_eq!(config.sync_interval_ms, 5);
        assert_eq!(config.read_handle_cache_size, 256);
        assert_eq!(config.message_cache_max_bytes, 10 * 1024 * 1024);
        assert_eq!(config.start_mode, StorageMode::RamDisk);
    }

    #[test]
    fn test_serde_fills_defaults() {
        let config: StoreConfig =
            serde_json::from_str(r#"{"directory": "/tmp/qh"}"#).unwrap();
        assert_eq!(config.directory, PathBuf::from("/tmp/qh"));
        assert_eq!(config.segment_max_size, 256 * 1024 * 1024);
        assert_eq!(config.start_mode, StorageMode::RamDisk);
    }

    #[test]
    fn test_serde_mode_names() {
        let config: StoreConfig =
            serde_json::from_str(r#"{"directory": "/tmp/qh", "start_mode": "disk_only"}"#)
                .unwrap();
        assert_eq!(config.start_mode, StorageMode::DiskOnly);
    }
}
