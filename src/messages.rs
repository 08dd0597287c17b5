//! Protocol messages exchanged with the operation queue and the CAS.
//!
//! Blobs referenced by digest (`Action`, `Command`, `Directory`) are encoded
//! as canonical JSON: directories sort their entries by name before encoding
//! so a directory's own digest is stable regardless of entry order.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::digest::Digest;

/// A hermetic unit of work: command + input tree + output declarations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Action {
    pub command_digest: Digest,
    pub input_root_digest: Digest,
    #[serde(default)]
    pub output_files: Vec<String>,
    #[serde(default)]
    pub output_directories: Vec<String>,
    #[serde(default)]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub do_not_cache: bool,
}

impl Action {
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentVariable {
    pub name: String,
    pub value: String,
}

/// Argument vector plus an environment that fully replaces the inherited one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Command {
    pub arguments: Vec<String>,
    #[serde(default)]
    pub environment_variables: Vec<EnvironmentVariable>,
}

impl Command {
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileNode {
    pub name: String,
    pub digest: Digest,
    #[serde(default)]
    pub is_executable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryNode {
    pub name: String,
    pub digest: Digest,
}

/// One level of an input tree: file entries and subdirectory entries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Directory {
    #[serde(default)]
    pub files: Vec<FileNode>,
    #[serde(default)]
    pub directories: Vec<DirectoryNode>,
}

impl Directory {
    /// Canonical bytes: entries sorted by name.
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        let mut canonical = self.clone();
        canonical.files.sort_by(|a, b| a.name.cmp(&b.name));
        canonical.directories.sort_by(|a, b| a.name.cmp(&b.name));
        serde_json::to_vec(&canonical)
    }

    pub fn decode(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    pub fn digest(&self) -> serde_json::Result<Digest> {
        Ok(Digest::of(&self.encode()?))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Property {
    pub name: String,
    pub value: String,
}

/// Capabilities a worker declares when matching operations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Platform {
    #[serde(default)]
    pub properties: Vec<Property>,
}

/// Execution stage of an operation. The worker only advances forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Unknown,
    Queued,
    Executing,
    Completed,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Unknown => write!(f, "unknown"),
            Stage::Queued => write!(f, "queued"),
            Stage::Executing => write!(f, "executing"),
            Stage::Completed => write!(f, "completed"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteOperationMetadata {
    pub stage: Stage,
    pub action_digest: Digest,
    #[serde(default)]
    pub stdout_stream_name: String,
    #[serde(default)]
    pub stderr_stream_name: String,
}

/// Server-side tracking object for an in-flight or completed action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub name: String,
    pub metadata: ExecuteOperationMetadata,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub response: Option<ExecuteResponse>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub result: ActionResult,
    #[serde(default)]
    pub cached_result: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputFile {
    pub path: String,
    #[serde(default)]
    pub content: Option<Vec<u8>>,
    #[serde(default)]
    pub digest: Option<Digest>,
    #[serde(default)]
    pub is_executable: bool,
}

/// Outcome of a completed action. For each captured stream, `raw` and
/// `digest` are independent: either, neither, or both may be set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionResult {
    pub exit_code: i32,
    #[serde(default)]
    pub output_files: Vec<OutputFile>,
    #[serde(default)]
    pub stdout_raw: Option<Vec<u8>>,
    #[serde(default)]
    pub stdout_digest: Option<Digest>,
    #[serde(default)]
    pub stderr_raw: Option<Vec<u8>>,
    #[serde(default)]
    pub stderr_digest: Option<Digest>,
}
