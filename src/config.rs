use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, WorkerError};
use crate::messages::Platform;

const DEFAULT_CAS_CACHE_MAX_SIZE_BYTES: u64 = 1 << 30;
const DEFAULT_TREE_PAGE_SIZE: u32 = 1024;
const DEFAULT_OPERATION_POLL_PERIOD_MS: u64 = 1_000;
const DEFAULT_OPERATION_QUEUE_CAPACITY: usize = 10_000;

/// Policy for inserting captured content into the CAS.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CasInsertionPolicy {
    #[default]
    Unknown,
    AlwaysInsert,
    InsertAboveLimit,
    NeverInsert,
}

/// Size-bounded inlining/insertion control for one stream or output class.
///
/// Content at or below `limit` is inlined into the result; whether it is
/// also (or instead) inserted into the CAS depends on the policy.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct CasInsertionControl {
    #[serde(default)]
    pub limit: u64,
    #[serde(default)]
    pub policy: CasInsertionPolicy,
}

impl CasInsertionControl {
    pub fn within_limit(&self, size: u64) -> bool {
        size <= self.limit
    }

    pub fn should_insert(&self, size: u64) -> bool {
        match self.policy {
            CasInsertionPolicy::AlwaysInsert => true,
            CasInsertionPolicy::InsertAboveLimit => size > self.limit,
            CasInsertionPolicy::Unknown | CasInsertionPolicy::NeverInsert => false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MemoryInstanceConfig {
    #[serde(default = "default_operation_queue_capacity")]
    pub operation_queue_capacity: usize,
}

impl Default for MemoryInstanceConfig {
    fn default() -> Self {
        Self {
            operation_queue_capacity: DEFAULT_OPERATION_QUEUE_CAPACITY,
        }
    }
}

/// Which instance client the worker talks to.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceConfig {
    MemoryInstance(MemoryInstanceConfig),
}

impl Default for InstanceConfig {
    fn default() -> Self {
        InstanceConfig::MemoryInstance(MemoryInstanceConfig::default())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerConfig {
    #[serde(default)]
    pub instance_name: String,
    /// Server target for the operation queue. Unused by the memory instance.
    #[serde(default)]
    pub operation_queue: String,
    #[serde(default)]
    pub root: String,
    /// Relative paths resolve under `root`.
    #[serde(default)]
    pub cas_cache_directory: String,
    #[serde(default = "default_cas_cache_max_size_bytes")]
    pub cas_cache_max_size_bytes: u64,
    #[serde(default)]
    pub stream_stdout: bool,
    #[serde(default)]
    pub stream_stderr: bool,
    #[serde(default)]
    pub stdout_cas_control: CasInsertionControl,
    #[serde(default)]
    pub stderr_cas_control: CasInsertionControl,
    #[serde(default)]
    pub file_cas_control: CasInsertionControl,
    #[serde(default)]
    pub requeue_on_failure: bool,
    #[serde(default = "default_tree_page_size")]
    pub tree_page_size: u32,
    #[serde(default = "default_operation_poll_period_ms")]
    pub operation_poll_period_ms: u64,
    #[serde(default)]
    pub platform: Platform,
    #[serde(default)]
    pub instance: InstanceConfig,
}

fn default_cas_cache_max_size_bytes() -> u64 {
    DEFAULT_CAS_CACHE_MAX_SIZE_BYTES
}

fn default_tree_page_size() -> u32 {
    DEFAULT_TREE_PAGE_SIZE
}

fn default_operation_poll_period_ms() -> u64 {
    DEFAULT_OPERATION_POLL_PERIOD_MS
}

fn default_operation_queue_capacity() -> usize {
    DEFAULT_OPERATION_QUEUE_CAPACITY
}

impl WorkerConfig {
    pub fn from_path(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|source| WorkerError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&data).map_err(|source| WorkerError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Base directory for all worker state. Missing value is a fatal
    /// configuration error.
    pub fn validated_root(&self) -> Result<PathBuf> {
        if self.root.is_empty() {
            return Err(WorkerError::MissingRoot);
        }
        Ok(PathBuf::from(&self.root))
    }

    pub fn validated_cas_cache_directory(&self, root: &Path) -> Result<PathBuf> {
        if self.cas_cache_directory.is_empty() {
            return Err(WorkerError::MissingCasCacheDirectory);
        }
        Ok(root.join(&self.cas_cache_directory))
    }

    pub fn operation_poll_period(&self) -> Duration {
        Duration::from_millis(self.operation_poll_period_ms)
    }
}
