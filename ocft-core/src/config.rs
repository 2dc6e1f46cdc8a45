//! Per-node engine configuration, passed to the engine at construction.

use std::path::PathBuf;

use serde::Deserialize;

use crate::chunk::DEFAULT_CHUNK_SIZE;

/// Node identity, secret and limits. Deserializable so hosts can load it from a file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    /// This node's peer id; messages addressed elsewhere are ignored.
    #[serde(default = "default_node_id")]
    pub node_id: String,
    /// Secret that lets peers' offers be auto-accepted.
    #[serde(default)]
    pub secret: Option<String>,
    /// Lifetime in seconds of the secret claim attached to outgoing offers. None = no expiry.
    #[serde(default)]
    pub secret_ttl_secs: Option<u64>,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u32,
    /// Offers larger than this are rejected without creating a transfer.
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    /// Where received files are written.
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// Auto-accept any unexpired trusted peer, even without a secret match.
    #[serde(default)]
    pub auto_accept_trusted: bool,
    /// Consecutive nacks for one chunk before the sender gives up.
    #[serde(default = "default_max_chunk_retries")]
    pub max_chunk_retries: u32,
}

fn default_node_id() -> String {
    format!("ocft-{}", uuid::Uuid::new_v4().simple())
}
fn default_chunk_size() -> u32 {
    DEFAULT_CHUNK_SIZE
}
fn default_max_file_size() -> u64 {
    100 * 1024 * 1024
}
fn default_download_dir() -> PathBuf {
    PathBuf::from("downloads")
}
fn default_max_chunk_retries() -> u32 {
    5
}

impl NodeConfig {
    /// Defaults with the given node id.
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            ..Self::default()
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            secret: None,
            secret_ttl_secs: None,
            chunk_size: default_chunk_size(),
            max_file_size: default_max_file_size(),
            download_dir: default_download_dir(),
            auto_accept_trusted: false,
            max_chunk_retries: default_max_chunk_retries(),
        }
    }
}
