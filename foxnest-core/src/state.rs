//! Repository state record
//!
//! The only mutable part of a repository: head pointer, archive flag and gc
//! counters, persisted as `state.json` and replaced atomically on every save.
//! Callers hold the repository lock while they load, mutate and save it.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{FoxError, Result};
use crate::object::ObjectId;

/// When and why a repository was archived
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveInfo {
    pub archived_at: DateTime<Utc>,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryState {
    /// Latest commit; `None` for an empty repository
    pub head: Option<ObjectId>,
    /// Present while the repository is archived
    #[serde(default)]
    pub archive: Option<ArchiveInfo>,
    #[serde(default)]
    pub commits_since_gc: u64,
    #[serde(default)]
    pub loose_objects_since_gc: u64,
    #[serde(default)]
    pub last_gc_at: Option<DateTime<Utc>>,
}

impl RepositoryState {
    /// Load the state, or the initial (empty, active) state if none was saved
    pub fn load(repo_path: &Path) -> Result<Self> {
        let path = Self::state_file_path(repo_path);
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&data)?)
    }

    pub fn save(&self, repo_path: &Path) -> Result<()> {
        let path = Self::state_file_path(repo_path);
        let tmp_path = path.with_extension("tmp");
        let data = serde_json::to_string_pretty(self)?;
        {
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(data.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    pub fn is_archived(&self) -> bool {
        self.archive.is_some()
    }

    /// Active -> Archived
    pub fn archive(&mut self, reason: impl Into<String>) -> Result<&ArchiveInfo> {
        if self.archive.is_some() {
            return Err(FoxError::AlreadyArchived);
        }
        Ok(self.archive.insert(ArchiveInfo {
            archived_at: Utc::now(),
            reason: reason.into(),
        }))
    }

    /// Archived -> Active; returns the cleared archive record
    pub fn unarchive(&mut self) -> Result<ArchiveInfo> {
        self.archive.take().ok_or(FoxError::NotArchived)
    }

    /// Advance head after a commit or an accepted transfer
    pub fn advance(&mut self, head: ObjectId, commits: u64, loose_objects: u64) {
        self.head = Some(head);
        self.commits_since_gc += commits;
        self.loose_objects_since_gc += loose_objects;
    }

    /// True once the commits since the last gc exceed `threshold`; 0 disables it
    pub fn gc_due(&self, threshold: u64) -> bool {
        threshold > 0 && self.commits_since_gc > threshold
    }

    pub fn record_gc(&mut self) {
        self.commits_since_gc = 0;
        self.loose_objects_since_gc = 0;
        self.last_gc_at = Some(Utc::now());
    }

    fn state_file_path(repo_path: &Path) -> PathBuf {
        repo_path.join("state.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectKind;
    use tempfile::TempDir;

    #[test]
    fn test_state_load_nonexistent() {
        let tmp = TempDir::new().unwrap();
        let state = RepositoryState::load(tmp.path()).unwrap();
        assert_eq!(state, RepositoryState::default());
        assert!(!state.is_archived());
    }

    #[test]
    fn test_state_save_load() {
        let tmp = TempDir::new().unwrap();
        let mut state = RepositoryState::default();
        state.advance(ObjectId::compute(ObjectKind::Commit, b"c1"), 1, 3);
        state.archive("end of term").unwrap();
        state.save(tmp.path()).unwrap();

        let loaded = RepositoryState::load(tmp.path()).unwrap();
        assert_eq!(loaded, state);
        assert!(!tmp.path().join("state.tmp").exists());

        let raw = fs::read_to_string(tmp.path().join("state.json")).unwrap();
        assert!(raw.contains(&state.head.unwrap().to_hex()));
    }

    #[test]
    fn test_archive_transitions() {
        let mut state = RepositoryState::default();
        assert!(matches!(state.unarchive(), Err(FoxError::NotArchived)));

        assert_eq!(state.archive("frozen").unwrap().reason, "frozen");
        assert!(matches!(state.archive("again"), Err(FoxError::AlreadyArchived)));
        assert_eq!(state.archive.as_ref().unwrap().reason, "frozen");

        let cleared = state.unarchive().unwrap();
        assert_eq!(cleared.reason, "frozen");
        assert!(!state.is_archived());
    }

    #[test]
    fn test_gc_counters() {
        let mut state = RepositoryState::default();
        let head = ObjectId::compute(ObjectKind::Commit, b"c");
        for _ in 0..20 {
            state.advance(head, 1, 2);
        }
        assert!(!state.gc_due(20));
        state.advance(head, 1, 2);
        assert!(state.gc_due(20));
        assert!(!state.gc_due(0));

        state.record_gc();
        assert_eq!(state.commits_since_gc, 0);
        assert!(state.last_gc_at.is_some());
    }
}
