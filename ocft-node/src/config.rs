//! Load node config from file and environment.

use std::path::{Path, PathBuf};

use anyhow::Context;
use ocft_core::{MemoryTrustStore, NodeConfig, TrustedPeer};
use serde::Deserialize;

/// Node configuration. File: ~/.config/ocft/config.toml or /etc/ocft/config.toml, or `--config`.
/// Env overrides: OCFT_NODE_ID, OCFT_SECRET, OCFT_DOWNLOAD_DIR, OCFT_MAX_FILE_SIZE,
/// OCFT_CHUNK_SIZE.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    /// Peers whose offers may be auto-accepted and whose secrets go into our offers.
    #[serde(default)]
    pub trusted_peers: Vec<TrustedPeer>,
}

impl Config {
    pub fn trust_store(&self) -> MemoryTrustStore {
        self.trusted_peers.iter().cloned().collect()
    }
}

/// Load config: explicit path if given, else the first default path that exists, else defaults.
/// Env vars are applied last.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let mut c = match explicit {
        Some(path) => load_file(path)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(path) => load_file(&path)?,
            None => Config::default(),
        },
    };
    apply_env(&mut c, |key| std::env::var(key).ok());
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/ocft/config.toml"));
    }
    out.push(PathBuf::from("/etc/ocft/config.toml"));
    out
}

fn load_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let c = toml::from_str::<Config>(&s)
        .with_context(|| format!("parsing config {}", path.display()))?;
    tracing::debug!(path = %path.display(), "loaded config");
    Ok(c)
}

/// Apply OCFT_* overrides from `lookup`. Unparseable numbers are ignored with a warning.
fn apply_env(c: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(s) = lookup("OCFT_NODE_ID") {
        c.node.node_id = s;
    }
    if let Some(s) = lookup("OCFT_SECRET") {
        c.node.secret = Some(s);
    }
    if let Some(s) = lookup("OCFT_DOWNLOAD_DIR") {
        c.node.download_dir = PathBuf::from(s);
    }
    if let Some(s) = lookup("OCFT_MAX_FILE_SIZE") {
        match s.parse::<u64>() {
            Ok(n) => c.node.max_file_size = n,
            Err(_) => tracing::warn!(value = %s, "ignoring invalid OCFT_MAX_FILE_SIZE"),
        }
    }
    if let Some(s) = lookup("OCFT_CHUNK_SIZE") {
        match s.parse::<u32>() {
            Ok(n) if n > 0 => c.node.chunk_size = n,
            _ => tracing::warn!(value = %s, "ignoring invalid OCFT_CHUNK_SIZE"),
        }
    }
}
