//! A repository on disk
//!
//! ```text
//! <repo>/config.json   RepoConfig
//! <repo>/state.json    RepositoryState (head, archive, gc counters)
//! <repo>/lock          advisory lock
//! <repo>/objects/      loose fanout + pack/
//! ```
//!
//! Every mutation takes the repository lock, writes objects first and moves
//! head last, so a failure at any point leaves the previous head valid.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::RepoConfig;
use crate::error::{FoxError, Result};
use crate::gc::{GarbageCollector, GcReport};
use crate::lock::RepoLock;
use crate::object::{
    validate_entry_name, Commit, Object, ObjectId, ObjectKind, Tree, TreeEntry, MODE_DIRECTORY,
    MODE_EXECUTABLE, MODE_FILE,
};
use crate::odb::{ObjectDatabase, StorageStats};
use crate::protocol::{display_head, WireObject};
use crate::state::{ArchiveInfo, RepositoryState};

/// A single edit applied on top of the head tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    Upsert {
        path: String,
        content: Vec<u8>,
        executable: bool,
    },
    /// Removes a file, or everything below a directory
    Remove { path: String },
}

/// A file in a flattened tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub id: ObjectId,
    pub mode: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryStats {
    pub head: Option<ObjectId>,
    pub commits: u64,
    pub archived: bool,
    pub storage: StorageStats,
}

/// Split a user path into validated segments joined by `/`
pub fn normalize_path(path: &str) -> Result<String> {
    let segments: Vec<&str> = path
        .split(['/', '\\'])
        .filter(|s| !s.is_empty() && *s != ".")
        .collect();
    if segments.is_empty() {
        return Err(FoxError::invalid(None, format!("empty path {:?}", path)));
    }
    for segment in &segments {
        validate_entry_name(segment)?;
    }
    Ok(segments.join("/"))
}

#[derive(Default)]
struct DirNode {
    files: BTreeMap<String, (ObjectId, u32)>,
    dirs: BTreeMap<String, DirNode>,
}

pub struct Repository {
    path: PathBuf,
    config: RepoConfig,
    odb: ObjectDatabase,
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("path", &self.path)
            .field("repo_id", &self.config.repo_id)
            .finish()
    }
}

impl Repository {
    /// Create a new, empty and active repository
    pub fn init(path: &Path, config: RepoConfig) -> Result<Self> {
        if path.join("config.json").exists() {
            return Err(FoxError::AlreadyInitialized(path.to_path_buf()));
        }
        fs::create_dir_all(path)?;
        config.save(path)?;
        RepositoryState::default().save(path)?;
        info!("Initialized repository {:?} at {:?}", config.repo_id, path);
        Self::open(path)
    }

    pub fn open(path: &Path) -> Result<Self> {
        if !path.join("config.json").exists() {
            return Err(FoxError::NotInitialized(path.to_path_buf()));
        }
        let config = RepoConfig::load(path)?;
        let odb = ObjectDatabase::open(&path.join("objects"), config.compression_level)?;
        Ok(Self {
            path: path.to_path_buf(),
            config,
            odb,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &RepoConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: RepoConfig) -> Result<()> {
        config.save(&self.path)?;
        self.config = config;
        Ok(())
    }

    pub fn odb(&self) -> &ObjectDatabase {
        &self.odb
    }

    pub fn lock(&self) -> Result<RepoLock> {
        RepoLock::acquire(&self.path, self.config.lock_timeout())
    }

    /// Snapshot of the state record; mutate it only while holding the lock
    pub fn state(&self) -> Result<RepositoryState> {
        RepositoryState::load(&self.path)
    }

    pub fn head(&self) -> Result<Option<ObjectId>> {
        Ok(self.state()?.head)
    }

    fn store(&self, kind: ObjectKind, payload: &[u8], written: &mut u64) -> Result<ObjectId> {
        let id = ObjectId::compute(kind, payload);
        if !self.odb.has(&id)? {
            self.odb.put(kind, payload)?;
            *written += 1;
        }
        Ok(id)
    }

    /// Flatten a tree into `path -> (blob, mode)`
    fn flatten(&self, tree_id: &ObjectId) -> Result<BTreeMap<String, (ObjectId, u32)>> {
        let mut files = BTreeMap::new();
        let mut stack = vec![(String::new(), *tree_id)];
        while let Some((prefix, id)) = stack.pop() {
            for entry in self.odb.get_tree(&id)?.iter() {
                let path = if prefix.is_empty() {
                    entry.name.clone()
                } else {
                    format!("{}/{}", prefix, entry.name)
                };
                if entry.is_dir() {
                    stack.push((path, entry.id));
                } else {
                    files.insert(path, (entry.id, entry.mode));
                }
            }
        }
        Ok(files)
    }

    fn write_tree(&self, files: &BTreeMap<String, (ObjectId, u32)>, written: &mut u64) -> Result<ObjectId> {
        let mut root = DirNode::default();
        for (path, entry) in files {
            let mut segments: Vec<&str> = path.split('/').collect();
            let Some(name) = segments.pop() else { continue };
            let mut node = &mut root;
            for segment in segments {
                node = node.dirs.entry(segment.to_string()).or_default();
            }
            node.files.insert(name.to_string(), *entry);
        }
        self.write_node(&root, written)
    }

    fn write_node(&self, node: &DirNode, written: &mut u64) -> Result<ObjectId> {
        let mut tree = Tree::new();
        for (name, child) in &node.dirs {
            let id = self.write_node(child, written)?;
            tree.insert(TreeEntry::new(name.clone(), id, ObjectKind::Tree, MODE_DIRECTORY));
        }
        for (name, (id, mode)) in &node.files {
            tree.insert(TreeEntry::new(name.clone(), *id, ObjectKind::Blob, *mode));
        }
        self.store(ObjectKind::Tree, &tree.to_payload()?, written)
    }

    /// Apply `changes` to the head tree and record a new commit
    pub fn commit(&self, changes: &[Change], author: &str, message: &str) -> Result<ObjectId> {
        let _lock = self.lock()?;
        let mut state = self.state()?;

        let parent = state.head;
        let (mut files, parent_tree) = match parent {
            Some(head) => {
                let commit = self.odb.get_commit(&head)?;
                (self.flatten(&commit.tree)?, Some(commit.tree))
            }
            None => (BTreeMap::new(), None),
        };

        let mut written = 0;
        for change in changes {
            match change {
                Change::Upsert {
                    path,
                    content,
                    executable,
                } => {
                    let path = normalize_path(path)?;
                    let blob = self.store(ObjectKind::Blob, content, &mut written)?;
                    // A file replaces a directory of the same name and vice versa.
                    let below = format!("{}/", path);
                    files.retain(|p, _| !p.starts_with(&below));
                    let mut ancestor = path.as_str();
                    while let Some((parent_dir, _)) = ancestor.rsplit_once('/') {
                        files.remove(parent_dir);
                        ancestor = parent_dir;
                    }
                    let mode = if *executable { MODE_EXECUTABLE } else { MODE_FILE };
                    files.insert(path, (blob, mode));
                }
                Change::Remove { path } => {
                    let path = normalize_path(path)?;
                    let below = format!("{}/", path);
                    files.remove(&path);
                    files.retain(|p, _| !p.starts_with(&below));
                }
            }
        }

        let tree = self.write_tree(&files, &mut written)?;
        let unchanged = match parent_tree {
            Some(previous) => previous == tree,
            None => files.is_empty(),
        };
        if unchanged {
            return Err(FoxError::NothingToCommit);
        }

        let commit = Commit::new(tree, parent, author.to_string(), Utc::now().timestamp(), message.to_string());
        let id = self.store(ObjectKind::Commit, &commit.to_payload()?, &mut written)?;

        state.advance(id, 1, written);
        state.save(&self.path)?;
        info!("Committed {} ({} new objects)", id.short(), written);

        self.maybe_gc(&mut state);
        Ok(id)
    }

    /// Run gc once the commit threshold is exceeded; caller holds the lock
    pub(crate) fn maybe_gc(&self, state: &mut RepositoryState) {
        if !state.gc_due(self.config.gc_threshold) {
            return;
        }
        info!(
            "{} commits since last gc (threshold {}), compacting",
            state.commits_since_gc, self.config.gc_threshold
        );
        if let Err(e) = self.gc_locked(state) {
            warn!("Automatic gc failed: {}", e);
        }
    }

    fn gc_locked(&self, state: &mut RepositoryState) -> Result<GcReport> {
        let roots: Vec<ObjectId> = state.head.into_iter().collect();
        let report = GarbageCollector::new(&self.odb, self.config.pack_options()).run(&roots)?;
        state.record_gc();
        state.save(&self.path)?;
        Ok(report)
    }

    pub fn gc(&self) -> Result<GcReport> {
        let _lock = self.lock()?;
        let mut state = self.state()?;
        self.gc_locked(&mut state)
    }

    pub fn archive(&self, reason: &str) -> Result<ArchiveInfo> {
        let _lock = self.lock()?;
        let mut state = self.state()?;
        let info = state.archive(reason)?.clone();
        state.save(&self.path)?;
        info!("Archived {:?}: {}", self.config.repo_id, reason);
        Ok(info)
    }

    pub fn unarchive(&self) -> Result<ArchiveInfo> {
        let _lock = self.lock()?;
        let mut state = self.state()?;
        let previous = state.unarchive()?;
        state.save(&self.path)?;
        info!("Unarchived {:?}", self.config.repo_id);
        Ok(previous)
    }

    /// Store a received object stream and move head to `new_head`, all or
    /// nothing. Takes the lock and saves the state.
    pub fn apply_objects(
        &self,
        objects: &[WireObject],
        new_head: ObjectId,
        expected_head: Option<ObjectId>,
    ) -> Result<u64> {
        let _lock = self.lock()?;
        let mut state = self.state()?;
        let written = self.apply_locked(&mut state, objects, new_head, expected_head)?;
        state.save(&self.path)?;
        self.maybe_gc(&mut state);
        Ok(written)
    }

    /// Validate and store a stream while the caller holds the lock. Updates
    /// `state` in memory only; nothing is written when validation fails.
    pub(crate) fn apply_locked(
        &self,
        state: &mut RepositoryState,
        objects: &[WireObject],
        new_head: ObjectId,
        expected_head: Option<ObjectId>,
    ) -> Result<u64> {
        for object in objects {
            object.verify()?;
        }

        let stream = stream_view(objects);
        self.odb.check_dependency_order(&stream)?;

        match objects.iter().find(|o| o.id == new_head) {
            Some(object) if object.kind != ObjectKind::Commit => {
                return Err(FoxError::invalid(Some(new_head), "new head is not a commit"));
            }
            Some(_) => {}
            None => {
                self.odb.get_commit(&new_head)?;
            }
        }

        if state.head != expected_head {
            return Err(FoxError::Diverged {
                local: display_head(state.head),
                remote: display_head(expected_head),
            });
        }

        let mut written = 0;
        let mut commits = 0;
        for object in objects {
            self.store(object.kind, &object.payload, &mut written)?;
            if object.kind == ObjectKind::Commit {
                commits += 1;
            }
        }
        state.advance(new_head, commits, written);
        info!(
            "Applied {} objects ({} new), head {} -> {}",
            objects.len(),
            written,
            display_head(expected_head),
            new_head.short()
        );
        Ok(written)
    }

    /// Every object a peer is missing to go from `base` to `head`, dependencies first
    pub fn collect_objects(&self, head: &ObjectId, base: Option<&ObjectId>) -> Result<Vec<WireObject>> {
        self.odb
            .transfer_order(head, base)?
            .into_iter()
            .map(|id| {
                let (kind, payload) = self.odb.get(&id)?;
                Ok(WireObject::new(id, kind, payload))
            })
            .collect()
    }

    pub fn files_at(&self, commit_id: &ObjectId) -> Result<Vec<FileEntry>> {
        let commit = self.odb.get_commit(commit_id)?;
        Ok(self
            .flatten(&commit.tree)?
            .into_iter()
            .map(|(path, (id, mode))| FileEntry { path, id, mode })
            .collect())
    }

    pub fn read_file(&self, commit_id: &ObjectId, path: &str) -> Result<Vec<u8>> {
        let path = normalize_path(path)?;
        let mut tree = self.odb.get_tree(&self.odb.get_commit(commit_id)?.tree)?;
        let mut segments = path.split('/').peekable();
        while let Some(segment) = segments.next() {
            let entry = tree
                .get(segment)
                .ok_or_else(|| FoxError::invalid(None, format!("{} not found in {}", path, commit_id.short())))?
                .clone();
            if segments.peek().is_none() {
                if entry.is_dir() {
                    return Err(FoxError::invalid(Some(entry.id), format!("{} is a directory", path)));
                }
                return self.odb.get_blob(&entry.id);
            }
            if !entry.is_dir() {
                return Err(FoxError::invalid(Some(entry.id), format!("{} is not a directory", segment)));
            }
            tree = self.odb.get_tree(&entry.id)?;
        }
        Err(FoxError::invalid(None, format!("empty path {:?}", path)))
    }

    /// First-parent history from head, newest first
    pub fn log(&self, limit: Option<usize>) -> Result<Vec<(ObjectId, Commit)>> {
        let mut entries = Vec::new();
        let mut seen = HashSet::new();
        let mut next = self.head()?;
        while let Some(id) = next {
            if limit.is_some_and(|n| entries.len() >= n) || !seen.insert(id) {
                break;
            }
            let commit = self.odb.get_commit(&id)?;
            next = commit.parent;
            entries.push((id, commit));
        }
        Ok(entries)
    }

    /// Whether `ancestor` is `descendant` or one of its parents
    pub fn is_ancestor(&self, ancestor: &ObjectId, descendant: &ObjectId) -> Result<bool> {
        let mut seen = HashSet::new();
        let mut next = Some(*descendant);
        while let Some(id) = next {
            if id == *ancestor {
                return Ok(true);
            }
            if !seen.insert(id) || !self.odb.has(&id)? {
                return Ok(false);
            }
            next = self.odb.get_commit(&id)?.parent;
        }
        Ok(false)
    }

    pub fn stats(&self) -> Result<RepositoryStats> {
        let state = self.state()?;
        let mut commits = 0;
        let mut next = state.head;
        let mut seen = HashSet::new();
        while let Some(id) = next {
            if !seen.insert(id) {
                break;
            }
            commits += 1;
            next = self.odb.get_commit(&id)?.parent;
        }
        Ok(RepositoryStats {
            head: state.head,
            commits,
            archived: state.is_archived(),
            storage: self.odb.stats()?,
        })
    }

    /// Decoded object, for inspection tools
    pub fn object(&self, id: &ObjectId) -> Result<Object> {
        self.odb.get_object(id)
    }
}

fn stream_view(objects: &[WireObject]) -> Vec<(ObjectId, ObjectKind, &[u8])> {
    objects
        .iter()
        .map(|o| (o.id, o.kind, o.payload.as_slice()))
        .collect()
}

/// The checks `apply_locked` makes, for a repository that does not exist
/// yet: the stream must stand alone and start from an empty history.
pub(crate) fn admit_into_empty(
    objects: &[WireObject],
    new_head: ObjectId,
    expected_head: Option<ObjectId>,
) -> Result<()> {
    for object in objects {
        object.verify()?;
    }
    crate::odb::check_stream_order(&stream_view(objects), |_| Ok(false))?;

    match objects.iter().find(|o| o.id == new_head) {
        Some(object) if object.kind == ObjectKind::Commit => {}
        Some(_) => return Err(FoxError::invalid(Some(new_head), "new head is not a commit")),
        None => return Err(FoxError::ObjectNotFound(new_head)),
    }

    if expected_head.is_some() {
        return Err(FoxError::Diverged {
            local: display_head(None),
            remote: display_head(expected_head),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn upsert(path: &str, content: &str) -> Change {
        Change::Upsert {
            path: path.to_string(),
            content: content.as_bytes().to_vec(),
            executable: false,
        }
    }

    fn repo(tmp: &TempDir) -> Repository {
        Repository::init(&tmp.path().join("repo"), RepoConfig::for_client("notes", "alice")).unwrap()
    }

    #[test]
    fn test_init_twice_fails() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("repo");
        Repository::init(&path, RepoConfig::default()).unwrap();
        assert!(matches!(
            Repository::init(&path, RepoConfig::default()),
            Err(FoxError::AlreadyInitialized(_))
        ));
        assert!(matches!(
            Repository::open(&tmp.path().join("missing")),
            Err(FoxError::NotInitialized(_))
        ));
    }

    #[test]
    fn test_commit_and_read_back() {
        let tmp = TempDir::new().unwrap();
        let repo = repo(&tmp);
        let c1 = repo
            .commit(&[upsert("README.md", "hello"), upsert("src/lib.rs", "pub fn a() {}")], "alice", "first")
            .unwrap();

        assert_eq!(repo.head().unwrap(), Some(c1));
        assert_eq!(repo.read_file(&c1, "src/lib.rs").unwrap(), b"pub fn a() {}");
        let paths: Vec<String> = repo.files_at(&c1).unwrap().into_iter().map(|f| f.path).collect();
        assert_eq!(paths, vec!["README.md", "src/lib.rs"]);
    }

    #[test]
    fn test_nothing_to_commit() {
        let tmp = TempDir::new().unwrap();
        let repo = repo(&tmp);
        assert!(matches!(repo.commit(&[], "alice", "empty"), Err(FoxError::NothingToCommit)));

        repo.commit(&[upsert("a.txt", "same")], "alice", "first").unwrap();
        assert!(matches!(
            repo.commit(&[upsert("a.txt", "same")], "alice", "again"),
            Err(FoxError::NothingToCommit)
        ));
        assert_eq!(repo.log(None).unwrap().len(), 1);
    }

    #[test]
    fn test_remove_and_replace_directory() {
        let tmp = TempDir::new().unwrap();
        let repo = repo(&tmp);
        repo.commit(&[upsert("docs/a.md", "a"), upsert("docs/b.md", "b"), upsert("keep", "k")], "alice", "1")
            .unwrap();
        let c2 = repo
            .commit(&[Change::Remove { path: "docs".into() }], "alice", "2")
            .unwrap();
        let paths: Vec<String> = repo.files_at(&c2).unwrap().into_iter().map(|f| f.path).collect();
        assert_eq!(paths, vec!["keep"]);

        let c3 = repo.commit(&[upsert("keep/inner.txt", "now a dir")], "alice", "3").unwrap();
        let paths: Vec<String> = repo.files_at(&c3).unwrap().into_iter().map(|f| f.path).collect();
        assert_eq!(paths, vec!["keep/inner.txt"]);
    }

    #[test]
    fn test_log_and_ancestry() {
        let tmp = TempDir::new().unwrap();
        let repo = repo(&tmp);
        let c1 = repo.commit(&[upsert("f", "1")], "alice", "one").unwrap();
        let c2 = repo.commit(&[upsert("f", "2")], "alice", "two").unwrap();
        let c3 = repo.commit(&[upsert("f", "3")], "alice", "three").unwrap();

        let log = repo.log(None).unwrap();
        let ids: Vec<ObjectId> = log.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![c3, c2, c1]);
        assert_eq!(log[0].1.message, "three");
        assert_eq!(repo.log(Some(2)).unwrap().len(), 2);

        assert!(repo.is_ancestor(&c1, &c3).unwrap());
        assert!(repo.is_ancestor(&c3, &c3).unwrap());
        assert!(!repo.is_ancestor(&c3, &c1).unwrap());
        assert_eq!(repo.stats().unwrap().commits, 3);
    }

    #[test]
    fn test_executable_mode() {
        let tmp = TempDir::new().unwrap();
        let repo = repo(&tmp);
        let c1 = repo
            .commit(
                &[Change::Upsert {
                    path: "run.sh".into(),
                    content: b"#!/bin/sh\n".to_vec(),
                    executable: true,
                }],
                "alice",
                "script",
            )
            .unwrap();
        assert_eq!(repo.files_at(&c1).unwrap()[0].mode, MODE_EXECUTABLE);
    }

    #[test]
    fn test_rejects_escaping_paths() {
        let tmp = TempDir::new().unwrap();
        let repo = repo(&tmp);
        assert!(repo.commit(&[upsert("../outside", "x")], "alice", "bad").is_err());
        assert_eq!(normalize_path("./a//b\\c").unwrap(), "a/b/c");
    }

    #[test]
    fn test_archive_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let repo = repo(&tmp);
        let info = repo.archive("read only").unwrap();
        assert_eq!(info.reason, "read only");
        assert!(repo.state().unwrap().is_archived());
        assert!(matches!(repo.archive("again"), Err(FoxError::AlreadyArchived)));
        repo.unarchive().unwrap();
        assert!(matches!(repo.unarchive(), Err(FoxError::NotArchived)));
    }

    #[test]
    fn test_automatic_gc_after_threshold() {
        let tmp = TempDir::new().unwrap();
        let mut config = RepoConfig::for_client("notes", "alice");
        config.gc_threshold = 5;
        let repo = Repository::init(&tmp.path().join("repo"), config).unwrap();

        for i in 0..5 {
            repo.commit(&[upsert("log.txt", &"line\n".repeat(i + 20))], "alice", "more").unwrap();
        }
        // Reaching the threshold is not enough
        assert_eq!(repo.state().unwrap().commits_since_gc, 5);
        assert_eq!(repo.stats().unwrap().storage.packs, 0);

        repo.commit(&[upsert("log.txt", "sixth")], "alice", "more").unwrap();
        let state = repo.state().unwrap();
        assert_eq!(state.commits_since_gc, 0);
        assert!(state.last_gc_at.is_some());

        let stats = repo.stats().unwrap();
        assert_eq!(stats.storage.loose_objects, 0);
        assert_eq!(stats.storage.packs, 1);
        assert_eq!(stats.commits, 6);
    }

    #[test]
    fn test_apply_objects_between_repositories() {
        let tmp = TempDir::new().unwrap();
        let source = repo(&tmp);
        let c1 = source.commit(&[upsert("a", "1")], "alice", "one").unwrap();
        let c2 = source.commit(&[upsert("a", "2")], "alice", "two").unwrap();

        let target = Repository::init(&tmp.path().join("mirror"), RepoConfig::default()).unwrap();
        let first = source.collect_objects(&c1, None).unwrap();
        target.apply_objects(&first, c1, None).unwrap();

        let second = source.collect_objects(&c2, Some(&c1)).unwrap();
        assert_eq!(second.len(), 3);
        let stale = target.apply_objects(&second, c2, None);
        assert!(matches!(stale, Err(FoxError::Diverged { .. })));
        assert_eq!(target.head().unwrap(), Some(c1));

        target.apply_objects(&second, c2, Some(c1)).unwrap();
        assert_eq!(target.read_file(&c2, "a").unwrap(), b"2");
    }
}
