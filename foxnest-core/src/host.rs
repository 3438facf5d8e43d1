//! Server side of the sync protocol
//!
//! A [`RepositoryHost`] owns `<root>/repositories/<id>` for many repositories
//! and answers [`SyncRequest`]s against them. Each repository is serialised
//! by its own lock, so unrelated repositories make independent progress.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::HostConfig;
use crate::error::{FoxError, Result};
use crate::object::{Commit, ObjectId};
use crate::odb::StorageStats;
use crate::protocol::{
    display_head, SyncMessage, SyncOperation, SyncRequest, SyncResponse, SyncStatus, PROTOCOL_VERSION,
};
use crate::repository::Repository;
use crate::state::ArchiveInfo;
use crate::sync::Remote;

/// Longest accepted repository id
pub const MAX_REPO_ID_LEN: usize = 64;

/// Ids become directory names, so only `[A-Za-z0-9_-]` is allowed
pub fn validate_repo_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id.len() <= MAX_REPO_ID_LEN
        && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(FoxError::InvalidRepositoryId(id.to_string()))
    }
}

/// What the JSON API reports about one hosted repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositorySummary {
    pub id: String,
    pub head: Option<ObjectId>,
    pub archived: bool,
    pub archive: Option<ArchiveInfo>,
    pub commits: u64,
    pub last_gc_at: Option<DateTime<Utc>>,
    pub storage: StorageStats,
}

pub struct RepositoryHost {
    config: HostConfig,
    repositories: Mutex<HashMap<String, Arc<Repository>>>,
}

impl RepositoryHost {
    pub fn new(config: HostConfig) -> Result<Self> {
        fs::create_dir_all(config.root.join("repositories"))?;
        Ok(Self {
            config,
            repositories: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn repo_path(&self, id: &str) -> PathBuf {
        self.config.root.join("repositories").join(id)
    }

    /// An existing repository, or `None`
    pub fn open(&self, id: &str) -> Result<Option<Arc<Repository>>> {
        validate_repo_id(id)?;
        let mut repositories = self.repositories.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(repo) = repositories.get(id) {
            return Ok(Some(repo.clone()));
        }
        let path = self.repo_path(id);
        if !path.join("config.json").exists() {
            return Ok(None);
        }
        let repo = Arc::new(Repository::open(&path)?);
        repositories.insert(id.to_string(), repo.clone());
        Ok(Some(repo))
    }

    pub fn get(&self, id: &str) -> Result<Arc<Repository>> {
        self.open(id)?.ok_or_else(|| FoxError::RepositoryNotFound(id.to_string()))
    }

    /// Open a repository, creating it empty if it does not exist yet
    pub fn open_or_create(&self, id: &str) -> Result<Arc<Repository>> {
        if let Some(repo) = self.open(id)? {
            return Ok(repo);
        }
        let mut repositories = self.repositories.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(repo) = repositories.get(id) {
            return Ok(repo.clone());
        }
        let path = self.repo_path(id);
        let repo = match Repository::init(&path, self.config.repo_config(id)) {
            Ok(repo) => repo,
            // Lost a race with another process creating it
            Err(FoxError::AlreadyInitialized(_)) => Repository::open(&path)?,
            Err(e) => return Err(e),
        };
        info!("Created hosted repository {}", id);
        let repo = Arc::new(repo);
        repositories.insert(id.to_string(), repo.clone());
        Ok(repo)
    }

    pub fn summary(&self, id: &str) -> Result<RepositorySummary> {
        let repo = self.get(id)?;
        let state = repo.state()?;
        let stats = repo.stats()?;
        Ok(RepositorySummary {
            id: id.to_string(),
            head: state.head,
            archived: state.is_archived(),
            archive: state.archive,
            commits: stats.commits,
            last_gc_at: state.last_gc_at,
            storage: stats.storage,
        })
    }

    /// First-parent history of a hosted repository, newest first
    pub fn history(&self, id: &str, limit: Option<usize>) -> Result<Vec<(ObjectId, Commit)>> {
        self.get(id)?.log(limit)
    }

    /// Ids of every hosted repository, sorted
    pub fn list(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(self.config.root.join("repositories"))? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if validate_repo_id(&name).is_ok() && entry.path().join("config.json").exists() {
                ids.push(name);
            }
        }
        ids.sort();
        Ok(ids)
    }

    pub fn archive(&self, id: &str, reason: &str) -> Result<ArchiveInfo> {
        self.get(id)?.archive(reason)
    }

    pub fn unarchive(&self, id: &str) -> Result<ArchiveInfo> {
        self.get(id)?.unarchive()
    }

    /// Answer one request; failures become a status, never a panic
    pub fn handle(&self, request: &SyncRequest) -> SyncResponse {
        match self.dispatch(request) {
            Ok(response) => response,
            Err(e) => {
                warn!("{:?} {} failed: {}", request.operation, request.repository_id, e);
                SyncResponse::from_error(&request.repository_id, &e)
            }
        }
    }

    fn dispatch(&self, request: &SyncRequest) -> Result<SyncResponse> {
        if request.protocol_version != PROTOCOL_VERSION {
            return Err(FoxError::Protocol(format!(
                "unsupported protocol version {}",
                request.protocol_version
            )));
        }
        let id = request.repository_id.as_str();
        validate_repo_id(id)?;

        match request.operation {
            SyncOperation::Negotiate => self.negotiate(id),
            SyncOperation::Info => {
                self.get(id)?;
                self.negotiate(id)
            }
            SyncOperation::Push => self.accept_push(id, request),
            SyncOperation::Pull => self.serve_pull(id, request),
            SyncOperation::Archive => {
                let reason = request.reason.as_deref().unwrap_or("archived");
                self.archive(id, reason)?;
                self.negotiate(id).map(|r| Self::with_status(r, SyncStatus::Applied))
            }
            SyncOperation::Unarchive => {
                self.unarchive(id)?;
                self.negotiate(id).map(|r| Self::with_status(r, SyncStatus::Applied))
            }
        }
    }

    fn with_status(mut response: SyncResponse, status: SyncStatus) -> SyncResponse {
        response.status = status;
        response
    }

    /// Head and archive state; an unknown repository looks empty and active
    fn negotiate(&self, id: &str) -> Result<SyncResponse> {
        let mut response = SyncResponse::new(SyncStatus::Ready, id);
        if let Some(repo) = self.open(id)? {
            let state = repo.state()?;
            response.server_head = state.head;
            response.archived = state.is_archived();
            response.archive = state.archive;
        }
        Ok(response)
    }

    fn accept_push(&self, id: &str, request: &SyncRequest) -> Result<SyncResponse> {
        let new_head = request
            .client_head
            .ok_or_else(|| FoxError::Protocol("push without a head".into()))?;

        // A repository is only created for a push that would be applied.
        match self.open(id)? {
            Some(repo) => {
                if repo.state()?.is_archived() {
                    return Err(FoxError::RepositoryArchived(id.to_string()));
                }
            }
            None => crate::repository::admit_into_empty(&request.objects, new_head, request.base_head)?,
        }

        let repo = self.open_or_create(id)?;
        let _lock = repo.lock()?;
        let mut state = repo.state()?;
        if state.is_archived() {
            return Err(FoxError::RepositoryArchived(id.to_string()));
        }

        let mut response = SyncResponse::new(SyncStatus::Applied, id);
        if state.head == Some(new_head) {
            response.status = SyncStatus::UpToDate;
        } else {
            response.objects_written = repo.apply_locked(&mut state, &request.objects, new_head, request.base_head)?;
        }
        if request.archive {
            state.archive(crate::sync::ARCHIVE_ON_PUSH_REASON)?;
        }
        state.save(repo.path())?;
        repo.maybe_gc(&mut state);
        info!(
            "{}: accepted push, head {} ({} new objects{})",
            id,
            new_head.short(),
            response.objects_written,
            if request.archive { ", archived" } else { "" }
        );

        response.server_head = state.head;
        response.archived = state.is_archived();
        response.archive = state.archive.clone();
        Ok(response)
    }

    fn serve_pull(&self, id: &str, request: &SyncRequest) -> Result<SyncResponse> {
        let repo = self.get(id)?;
        let state = repo.state()?;
        let mut response = SyncResponse::new(SyncStatus::UpToDate, id);
        response.archived = state.is_archived();
        response.archive = state.archive.clone();
        response.server_head = state.head;

        let Some(head) = state.head else {
            return Ok(response);
        };
        if request.client_head == Some(head) {
            return Ok(response);
        }
        if let Some(client) = request.client_head {
            if !repo.odb().has(&client)? || !repo.is_ancestor(&client, &head)? {
                return Err(FoxError::Diverged {
                    local: client.to_hex(),
                    remote: head.to_hex(),
                });
            }
        }

        response.objects = repo.collect_objects(&head, request.client_head.as_ref())?;
        response.status = SyncStatus::Applied;
        info!(
            "{}: serving {} objects, {} -> {}",
            id,
            response.objects.len(),
            display_head(request.client_head),
            head.short()
        );
        Ok(response)
    }
}

/// Talks to a host in the same process, through the same framing the HTTP
/// transport uses.
#[derive(Clone)]
pub struct LocalRemote {
    host: Arc<RepositoryHost>,
}

impl LocalRemote {
    pub fn new(host: Arc<RepositoryHost>) -> Self {
        Self { host }
    }

    pub fn host(&self) -> &RepositoryHost {
        &self.host
    }
}

impl Remote for LocalRemote {
    fn exchange(&self, request: SyncRequest) -> Result<SyncResponse> {
        let request = SyncMessage::decode(&SyncMessage::Request(request).encode()?)?.into_request()?;
        let response = self.host.handle(&request);
        SyncMessage::decode(&SyncMessage::Response(response).encode()?)?.into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn host(tmp: &TempDir) -> RepositoryHost {
        RepositoryHost::new(HostConfig::new(tmp.path())).unwrap()
    }

    #[test]
    fn test_validate_repo_id() {
        assert!(validate_repo_id("a1b2c3d4e5f60718").is_ok());
        assert!(validate_repo_id("team_repo-2").is_ok());
        assert!(validate_repo_id("").is_err());
        assert!(validate_repo_id("../etc").is_err());
        assert!(validate_repo_id(&"x".repeat(65)).is_err());
    }

    #[test]
    fn test_negotiate_unknown_repository() {
        let tmp = TempDir::new().unwrap();
        let host = host(&tmp);
        let response = host.handle(&SyncRequest::negotiate("fresh", None));
        assert_eq!(response.status, SyncStatus::Ready);
        assert!(response.server_head.is_none());
        assert!(!response.archived);
        assert!(host.list().unwrap().is_empty());

        let info = host.handle(&SyncRequest::info("fresh"));
        assert_eq!(info.status, SyncStatus::NotFound);
    }

    #[test]
    fn test_invalid_id_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let host = host(&tmp);
        let response = host.handle(&SyncRequest::negotiate("../escape", None));
        assert_eq!(response.status, SyncStatus::InvalidRequest);
    }

    #[test]
    fn test_protocol_version_mismatch() {
        let tmp = TempDir::new().unwrap();
        let host = host(&tmp);
        let mut request = SyncRequest::negotiate("repo", None);
        request.protocol_version = 99;
        assert_eq!(host.handle(&request).status, SyncStatus::InvalidRequest);
    }

    #[test]
    fn test_history_of_unknown_repository() {
        let tmp = TempDir::new().unwrap();
        let host = host(&tmp);
        assert!(matches!(host.history("missing", None), Err(FoxError::RepositoryNotFound(_))));
        assert!(matches!(host.history("../x", None), Err(FoxError::InvalidRepositoryId(_))));
    }

    #[test]
    fn test_archive_unknown_repository() {
        let tmp = TempDir::new().unwrap();
        let host = host(&tmp);
        let response = host.handle(&SyncRequest::archive("missing", None));
        assert_eq!(response.status, SyncStatus::NotFound);
    }
}
