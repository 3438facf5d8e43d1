//! Client working directory
//!
//! A workspace is a directory with a repository in `.fox/` and a staging
//! index at `.fox/index.json`: an ordered set of paths to include in the next
//! commit. A staged path that no longer exists on disk commits as a removal.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{normalize_remote_url, RepoConfig};
use crate::error::{FoxError, Result};
use crate::object::{ObjectId, ObjectKind, MODE_EXECUTABLE};
use crate::repository::{normalize_path, Change, Repository};

/// Name of the repository directory inside a workspace
pub const FOX_DIR: &str = ".fox";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct StagingIndex {
    staged: Vec<String>,
}

/// Working tree compared with head
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceStatus {
    pub staged: Vec<String>,
    pub modified: Vec<String>,
    pub untracked: Vec<String>,
    pub deleted: Vec<String>,
}

impl WorkspaceStatus {
    pub fn is_clean(&self) -> bool {
        self.staged.is_empty() && self.modified.is_empty() && self.untracked.is_empty() && self.deleted.is_empty()
    }
}

pub struct Workspace {
    root: PathBuf,
    repo: Repository,
}

impl Workspace {
    pub fn init(dir: &Path, name: &str, author: &str) -> Result<Self> {
        let repo = Repository::init(&dir.join(FOX_DIR), RepoConfig::for_client(name, author))?;
        let workspace = Self {
            root: dir.to_path_buf(),
            repo,
        };
        workspace.save_index(&StagingIndex::default())?;
        Ok(workspace)
    }

    pub fn open(dir: &Path) -> Result<Self> {
        let repo = Repository::open(&dir.join(FOX_DIR)).map_err(|e| match e {
            FoxError::NotInitialized(_) => FoxError::NotInitialized(dir.to_path_buf()),
            other => other,
        })?;
        Ok(Self {
            root: dir.to_path_buf(),
            repo,
        })
    }

    /// Open the workspace containing `start` or any of its parents
    pub fn discover(start: &Path) -> Result<Self> {
        let mut dir = Some(start);
        while let Some(candidate) = dir {
            if candidate.join(FOX_DIR).join("config.json").exists() {
                return Self::open(candidate);
            }
            dir = candidate.parent();
        }
        Err(FoxError::NotInitialized(start.to_path_buf()))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn repository(&self) -> &Repository {
        &self.repo
    }

    pub fn config(&self) -> &RepoConfig {
        self.repo.config()
    }

    fn index_path(&self) -> PathBuf {
        self.root.join(FOX_DIR).join("index.json")
    }

    fn load_index(&self) -> Result<StagingIndex> {
        let path = self.index_path();
        if !path.exists() {
            return Ok(StagingIndex::default());
        }
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }

    fn save_index(&self, index: &StagingIndex) -> Result<()> {
        let path = self.index_path();
        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, serde_json::to_string_pretty(index)?)?;
        fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    pub fn staged(&self) -> Result<Vec<String>> {
        Ok(self.load_index()?.staged)
    }

    /// Workspace-relative `/`-separated form of a user path
    fn relative(&self, path: &Path) -> Result<String> {
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };
        let relative = absolute.strip_prefix(&self.root).map_err(|_| {
            FoxError::invalid(None, format!("{:?} is outside the workspace {:?}", path, self.root))
        })?;
        normalize_path(&relative.to_string_lossy())
    }

    fn is_root(&self, path: &Path) -> bool {
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };
        absolute
            .strip_prefix(&self.root)
            .is_ok_and(|rest| rest.components().all(|c| matches!(c, Component::CurDir)))
    }

    /// Every file under the workspace, except `.fox`
    fn working_files(&self) -> Result<BTreeSet<String>> {
        self.files_below(&self.root)
    }

    fn files_below(&self, dir: &Path) -> Result<BTreeSet<String>> {
        let mut files = BTreeSet::new();
        let mut stack = vec![dir.to_path_buf()];
        while let Some(current) = stack.pop() {
            for entry in fs::read_dir(&current)? {
                let entry = entry?;
                let path = entry.path();
                if current == self.root && entry.file_name() == FOX_DIR {
                    continue;
                }
                let file_type = entry.file_type()?;
                if file_type.is_dir() {
                    stack.push(path);
                } else if file_type.is_file() {
                    files.insert(self.relative(&path)?);
                }
            }
        }
        Ok(files)
    }

    fn head_files(&self) -> Result<BTreeMap<String, (ObjectId, u32)>> {
        match self.repo.head()? {
            Some(head) => Ok(self
                .repo
                .files_at(&head)?
                .into_iter()
                .map(|f| (f.path, (f.id, f.mode)))
                .collect()),
            None => Ok(BTreeMap::new()),
        }
    }

    /// Stage paths; directories expand to the files below them. Returns the
    /// newly staged paths.
    pub fn add(&self, paths: &[PathBuf]) -> Result<Vec<String>> {
        let tracked = self.head_files()?;
        let mut index = self.load_index()?;
        let mut added = Vec::new();

        for path in paths {
            if self.is_root(path) {
                let mut everything: Vec<String> = self.working_files()?.into_iter().collect();
                everything.extend(tracked.keys().filter(|p| !self.root.join(p).exists()).cloned());
                for p in everything {
                    if !index.staged.contains(&p) {
                        index.staged.push(p.clone());
                        added.push(p);
                    }
                }
                continue;
            }
            let relative = self.relative(path)?;
            let absolute = self.root.join(&relative);
            if relative == FOX_DIR || relative.starts_with(&format!("{}/", FOX_DIR)) {
                continue;
            }
            let expanded: Vec<String> = if absolute.is_dir() {
                let mut below: Vec<String> = self.files_below(&absolute)?.into_iter().collect();
                let prefix = format!("{}/", relative);
                below.extend(
                    tracked
                        .keys()
                        .filter(|p| p.starts_with(&prefix) && !self.root.join(p).exists())
                        .cloned(),
                );
                below
            } else if absolute.is_file() || tracked.contains_key(&relative) {
                vec![relative]
            } else {
                warn!("{} does not exist and is not tracked", relative);
                continue;
            };
            for p in expanded {
                if !index.staged.contains(&p) {
                    index.staged.push(p.clone());
                    added.push(p);
                }
            }
        }
        self.save_index(&index)?;
        debug!("Staged {} path(s)", added.len());
        Ok(added)
    }

    /// Stage every new, modified or deleted file
    pub fn add_all(&self) -> Result<Vec<String>> {
        let status = self.status()?;
        let paths: Vec<PathBuf> = status
            .modified
            .iter()
            .chain(&status.untracked)
            .chain(&status.deleted)
            .map(PathBuf::from)
            .collect();
        self.add(&paths)
    }

    fn is_executable(path: &Path) -> Result<bool> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            Ok(fs::metadata(path)?.permissions().mode() & 0o111 != 0)
        }
        #[cfg(not(unix))]
        {
            let _ = path;
            Ok(false)
        }
    }

    /// Commit the staged paths and clear the index
    pub fn commit(&self, message: &str) -> Result<ObjectId> {
        let mut index = self.load_index()?;
        if index.staged.is_empty() {
            return Err(FoxError::NothingToCommit);
        }
        let mut changes = Vec::with_capacity(index.staged.len());
        for path in &index.staged {
            let absolute = self.root.join(path);
            if absolute.is_file() {
                changes.push(Change::Upsert {
                    path: path.clone(),
                    content: fs::read(&absolute)?,
                    executable: Self::is_executable(&absolute)?,
                });
            } else {
                changes.push(Change::Remove { path: path.clone() });
            }
        }
        let author = self.config().author.clone();
        let id = self.repo.commit(&changes, &author, message)?;
        index.staged.clear();
        self.save_index(&index)?;
        Ok(id)
    }

    pub fn status(&self) -> Result<WorkspaceStatus> {
        let staged = self.staged()?;
        let staged_set: BTreeSet<&String> = staged.iter().collect();
        let tracked = self.head_files()?;
        let working = self.working_files()?;

        let mut status = WorkspaceStatus {
            staged: staged.clone(),
            ..Default::default()
        };
        for path in &working {
            if staged_set.contains(path) {
                continue;
            }
            match tracked.get(path) {
                Some((id, _)) => {
                    let content = fs::read(self.root.join(path))?;
                    if ObjectId::compute(ObjectKind::Blob, &content) != *id {
                        status.modified.push(path.clone());
                    }
                }
                None => status.untracked.push(path.clone()),
            }
        }
        for path in tracked.keys() {
            if !working.contains(path) && !staged_set.contains(path) {
                status.deleted.push(path.clone());
            }
        }
        Ok(status)
    }

    /// Make the working directory match head. Files tracked by `previous`
    /// but absent from head are removed. Returns the number of files written.
    pub fn checkout_head(&self, previous: Option<ObjectId>) -> Result<usize> {
        let Some(head) = self.repo.head()? else {
            return Ok(0);
        };
        let current = self.repo.files_at(&head)?;
        let keep: BTreeSet<&str> = current.iter().map(|f| f.path.as_str()).collect();

        if let Some(previous) = previous {
            for file in self.repo.files_at(&previous)? {
                if !keep.contains(file.path.as_str()) {
                    let path = self.root.join(&file.path);
                    if path.is_file() {
                        fs::remove_file(&path)?;
                    }
                }
            }
        }

        let mut written = 0;
        for file in &current {
            let path = self.root.join(&file.path);
            let content = self.repo.odb().get_blob(&file.id)?;
            if path.is_file() && fs::read(&path)? == content {
                continue;
            }
            if let Some(parent) = path.parent() {
                if parent.is_file() {
                    fs::remove_file(parent)?;
                }
                fs::create_dir_all(parent)?;
            }
            if path.is_dir() {
                fs::remove_dir_all(&path)?;
            }
            fs::write(&path, &content)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let mode = if file.mode == MODE_EXECUTABLE { 0o755 } else { 0o644 };
                fs::set_permissions(&path, fs::Permissions::from_mode(mode))?;
            }
            written += 1;
        }
        Ok(written)
    }

    /// Store the origin URL, normalised; returns the stored form
    pub fn set_remote(&mut self, url: &str) -> Result<String> {
        let normalized = normalize_remote_url(url);
        let mut config = self.repo.config().clone();
        config.remote = Some(normalized.clone());
        self.repo.set_config(config)?;
        Ok(normalized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(root: &Path, path: &str, content: &str) {
        let path = root.join(path);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_init_and_reopen() {
        let tmp = TempDir::new().unwrap();
        let ws = Workspace::init(tmp.path(), "notes", "alice").unwrap();
        assert_eq!(ws.config().repo_id.len(), 16);
        assert!(tmp.path().join(".fox/index.json").exists());

        fs::create_dir_all(tmp.path().join("deep/inside")).unwrap();
        let found = Workspace::discover(&tmp.path().join("deep/inside")).unwrap();
        assert_eq!(found.root(), tmp.path());

        let other = TempDir::new().unwrap();
        assert!(matches!(Workspace::open(other.path()), Err(FoxError::NotInitialized(_))));
    }

    #[test]
    fn test_add_commit_status() {
        let tmp = TempDir::new().unwrap();
        let ws = Workspace::init(tmp.path(), "notes", "alice").unwrap();
        write(tmp.path(), "a.txt", "a");
        write(tmp.path(), "docs/b.md", "b");
        write(tmp.path(), "loose.txt", "untracked");

        let added = ws.add(&[PathBuf::from("a.txt"), PathBuf::from("docs"), PathBuf::from(".fox")]).unwrap();
        assert_eq!(added, vec!["a.txt", "docs/b.md"]);
        assert_eq!(ws.add(&[PathBuf::from("a.txt")]).unwrap(), Vec::<String>::new());

        let status = ws.status().unwrap();
        assert_eq!(status.staged, vec!["a.txt", "docs/b.md"]);
        assert_eq!(status.untracked, vec!["loose.txt"]);

        ws.commit("first").unwrap();
        assert!(ws.staged().unwrap().is_empty());
        assert!(matches!(ws.commit("again"), Err(FoxError::NothingToCommit)));

        write(tmp.path(), "a.txt", "changed");
        fs::remove_file(tmp.path().join("docs/b.md")).unwrap();
        let status = ws.status().unwrap();
        assert_eq!(status.modified, vec!["a.txt"]);
        assert_eq!(status.deleted, vec!["docs/b.md"]);
        assert_eq!(status.untracked, vec!["loose.txt"]);
    }

    #[test]
    fn test_add_workspace_root() {
        let tmp = TempDir::new().unwrap();
        let ws = Workspace::init(tmp.path(), "notes", "alice").unwrap();
        write(tmp.path(), "a.txt", "a");
        write(tmp.path(), "nested/b.txt", "b");
        assert_eq!(ws.add(&[PathBuf::from(".")]).unwrap(), vec!["a.txt", "nested/b.txt"]);
        assert_eq!(ws.add(&[tmp.path().to_path_buf()]).unwrap(), Vec::<String>::new());
    }

    #[test]
    fn test_staged_deletion() {
        let tmp = TempDir::new().unwrap();
        let ws = Workspace::init(tmp.path(), "notes", "alice").unwrap();
        write(tmp.path(), "gone.txt", "soon");
        write(tmp.path(), "stay.txt", "here");
        ws.add_all().unwrap();
        ws.commit("first").unwrap();

        fs::remove_file(tmp.path().join("gone.txt")).unwrap();
        assert_eq!(ws.add_all().unwrap(), vec!["gone.txt"]);
        let c2 = ws.commit("remove").unwrap();

        let files = ws.repository().files_at(&c2).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, "stay.txt");
        assert!(ws.status().unwrap().is_clean());
    }

    #[test]
    fn test_add_outside_workspace_fails() {
        let tmp = TempDir::new().unwrap();
        let other = TempDir::new().unwrap();
        let ws = Workspace::init(tmp.path(), "notes", "alice").unwrap();
        assert!(ws.add(&[other.path().join("x")]).is_err());
    }

    #[test]
    fn test_checkout_head_restores_files() {
        let tmp = TempDir::new().unwrap();
        let ws = Workspace::init(tmp.path(), "notes", "alice").unwrap();
        write(tmp.path(), "old.txt", "old");
        ws.add_all().unwrap();
        let c1 = ws.commit("one").unwrap();

        write(tmp.path(), "src/new.rs", "fn new() {}");
        fs::remove_file(tmp.path().join("old.txt")).unwrap();
        ws.add_all().unwrap();
        ws.commit("two").unwrap();

        // Simulate a working tree still at c1
        fs::remove_dir_all(tmp.path().join("src")).unwrap();
        write(tmp.path(), "old.txt", "old");

        assert_eq!(ws.checkout_head(Some(c1)).unwrap(), 1);
        assert!(!tmp.path().join("old.txt").exists());
        assert_eq!(fs::read_to_string(tmp.path().join("src/new.rs")).unwrap(), "fn new() {}");
    }

    #[test]
    fn test_set_remote_normalizes() {
        let tmp = TempDir::new().unwrap();
        let mut ws = Workspace::init(tmp.path(), "notes", "alice").unwrap();
        assert_eq!(ws.set_remote("10.1.1.1").unwrap(), "http://10.1.1.1:5000");
        let reopened = Workspace::open(tmp.path()).unwrap();
        assert_eq!(reopened.config().remote.as_deref(), Some("http://10.1.1.1:5000"));
    }
}
