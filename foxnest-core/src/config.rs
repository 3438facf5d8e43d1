//! Repository and host configuration

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::packfile::PackOptions;

/// Port assumed when an origin is given as a bare host
pub const DEFAULT_PORT: u16 = 5000;

fn default_gc_threshold() -> u64 {
    20
}

fn default_compression_level() -> i32 {
    3
}

fn default_lock_timeout_ms() -> Option<u64> {
    Some(30_000)
}

fn default_delta_window() -> usize {
    10
}

fn default_max_delta_depth() -> usize {
    50
}

/// Per-repository configuration stored at `<repo>/config.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoConfig {
    /// Identifier used on the wire
    #[serde(default)]
    pub repo_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub author: String,
    /// Origin URL, already normalised
    #[serde(default)]
    pub remote: Option<String>,
    /// Run gc automatically once more than this many commits accumulate (0 disables)
    #[serde(default = "default_gc_threshold")]
    pub gc_threshold: u64,
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,
    /// `None` waits for the lock forever
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: Option<u64>,
    #[serde(default = "default_delta_window")]
    pub delta_window: usize,
    #[serde(default = "default_max_delta_depth")]
    pub max_delta_depth: usize,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            repo_id: String::new(),
            name: String::new(),
            author: String::new(),
            remote: None,
            gc_threshold: default_gc_threshold(),
            compression_level: default_compression_level(),
            lock_timeout_ms: default_lock_timeout_ms(),
            delta_window: default_delta_window(),
            max_delta_depth: default_max_delta_depth(),
        }
    }
}

impl RepoConfig {
    /// Configuration for a new client repository
    pub fn for_client(name: &str, author: &str) -> Self {
        Self {
            repo_id: derive_repo_id(author, name),
            name: name.to_string(),
            author: author.to_string(),
            ..Default::default()
        }
    }

    /// Load configuration from a repository path, falling back to defaults
    pub fn load(repo_path: &Path) -> Result<Self> {
        let path = Self::config_file_path(repo_path);
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&data)?)
    }

    pub fn save(&self, repo_path: &Path) -> Result<()> {
        let path = Self::config_file_path(repo_path);
        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, serde_json::to_string_pretty(self)?)?;
        fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    pub fn lock_timeout(&self) -> Option<Duration> {
        self.lock_timeout_ms.map(Duration::from_millis)
    }

    pub fn pack_options(&self) -> PackOptions {
        PackOptions {
            window: self.delta_window,
            max_depth: self.max_delta_depth,
            compression_level: self.compression_level,
        }
    }

    fn config_file_path(repo_path: &Path) -> PathBuf {
        repo_path.join("config.json")
    }
}

/// Settings shared by every repository a server hosts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostConfig {
    /// Repositories live under `<root>/repositories/<id>`
    pub root: PathBuf,
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: Option<u64>,
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,
    #[serde(default = "default_gc_threshold")]
    pub gc_threshold: u64,
}

impl HostConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock_timeout_ms: default_lock_timeout_ms(),
            compression_level: default_compression_level(),
            gc_threshold: default_gc_threshold(),
        }
    }

    /// Configuration written into a repository created on first push
    pub fn repo_config(&self, repo_id: &str) -> RepoConfig {
        RepoConfig {
            repo_id: repo_id.to_string(),
            name: repo_id.to_string(),
            gc_threshold: self.gc_threshold,
            compression_level: self.compression_level,
            lock_timeout_ms: self.lock_timeout_ms,
            ..Default::default()
        }
    }
}

/// First 16 hex digits of SHA-256(`"<author>_<name>"`)
pub fn derive_repo_id(author: &str, name: &str) -> String {
    let digest = Sha256::digest(format!("{}_{}", author, name).as_bytes());
    let mut id = hex::encode(digest);
    id.truncate(16);
    id
}

/// Accept `host`, `host:port` or a full URL; always return a URL with a scheme.
pub fn normalize_remote_url(input: &str) -> String {
    let trimmed = input.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        return trimmed.to_string();
    }
    let has_port = trimmed
        .rsplit_once(':')
        .is_some_and(|(_, port)| !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()));
    if has_port {
        format!("http://{}", trimmed)
    } else {
        format!("http://{}:{}", trimmed, DEFAULT_PORT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = RepoConfig::default();
        assert_eq!(config.gc_threshold, 20);
        assert_eq!(config.lock_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.pack_options().max_depth, 50);
    }

    #[test]
    fn test_config_save_load() {
        let tmp = TempDir::new().unwrap();
        let mut config = RepoConfig::for_client("notes", "alice");
        config.remote = Some(normalize_remote_url("10.0.0.2:8080"));
        config.save(tmp.path()).unwrap();

        assert_eq!(RepoConfig::load(tmp.path()).unwrap(), config);
    }

    #[test]
    fn test_missing_fields_take_defaults() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("config.json"), r#"{"repo_id":"abc"}"#).unwrap();
        let config = RepoConfig::load(tmp.path()).unwrap();
        assert_eq!(config.repo_id, "abc");
        assert_eq!(config.gc_threshold, 20);
        assert_eq!(config.delta_window, 10);
    }

    #[test]
    fn test_repo_id_derivation() {
        let id = derive_repo_id("alice", "notes");
        assert_eq!(id.len(), 16);
        assert_eq!(id, derive_repo_id("alice", "notes"));
        assert_ne!(id, derive_repo_id("bob", "notes"));
    }

    #[test]
    fn test_normalize_remote_url() {
        assert_eq!(normalize_remote_url("192.168.1.5:9000"), "http://192.168.1.5:9000");
        assert_eq!(normalize_remote_url("fox.example"), "http://fox.example:5000");
        assert_eq!(normalize_remote_url("https://fox.example/"), "https://fox.example");
        assert_eq!(normalize_remote_url("http://localhost:5000"), "http://localhost:5000");
    }
}
