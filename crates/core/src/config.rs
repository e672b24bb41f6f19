//! Explicit configuration, passed by reference into every component.
//!
//! The source pattern this replaces kept the store behind a process-wide
//! ambient singleton. Here there is no global: callers build one `Config`
//! and thread it through `StoreManager::new`.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Resolves the two storage file locations. The only contract a caller
/// needs to satisfy; see spec §6.
pub trait PathResolver {
    fn global_db_path(&self) -> PathBuf;
    fn project_db_path(&self) -> PathBuf;
}

/// A fixed pair of paths, the common case for CLI hooks and the tool
/// server alike.
#[derive(Debug, Clone)]
pub struct FixedPaths {
    pub global: PathBuf,
    pub project: PathBuf,
}

impl PathResolver for FixedPaths {
    fn global_db_path(&self) -> PathBuf {
        self.global.clone()
    }

    fn project_db_path(&self) -> PathBuf {
        self.project.clone()
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Minimum time to retry acquiring a write lock before surfacing
    /// `Error::StorageBusy`. Spec requires at least 5s.
    pub busy_timeout: Duration,
    /// How long a `proposed` fact may live before the Sweeper retracts it.
    pub proposed_ttl: Duration,
    /// How long a `disputed` fact may live before the Sweeper retracts it.
    pub disputed_ttl: Duration,
    /// How long a content item with no provenance may live before pruning.
    pub content_ttl: Duration,
    /// Confidence tolerance used by the resolver's supersession rule.
    pub confidence_epsilon: f32,
    /// Fixed embedding dimension for this deployment. `None` until the
    /// first embedding is ever inserted, at which point the vector index
    /// locks it in.
    pub embedding_dim: Option<usize>,
    /// RRF rank constant (spec default 60).
    pub rrf_k: f32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_secs(5),
            proposed_ttl: Duration::from_secs(14 * 24 * 3600),
            disputed_ttl: Duration::from_secs(30 * 24 * 3600),
            content_ttl: Duration::from_secs(90 * 24 * 3600),
            confidence_epsilon: 0.05,
            embedding_dim: None,
            rrf_k: 60.0,
        }
    }
}

impl Config {
    pub fn global_config_dir() -> PathBuf {
        dirs_config_dir().join("archivist")
    }

    pub fn project_config_dir(project_path: &Path) -> PathBuf {
        project_path.join(".archivist")
    }
}

/// Minimal stand-in for a `dirs`-style config-dir lookup, grounded in the
/// `XDG_CONFIG_HOME` / `HOME` conventions without pulling in the `dirs`
/// crate for one call site.
fn dirs_config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        if !xdg.is_empty() {
            return PathBuf::from(xdg);
        }
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".config");
    }
    PathBuf::from(".config")
}
