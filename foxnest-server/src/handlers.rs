//! HTTP endpoints for hosted repositories.
//!
//! Endpoints:
//!   GET  /                               → health
//!   GET  /api/repositories               → hosted repository ids
//!   GET  /api/repository/{id}            → head, archive state, storage
//!   GET  /api/repository/{id}/commits    → first-parent history, newest first
//!   POST /api/repository/{id}/sync       → framed SyncMessage in, framed SyncMessage out
//!   POST /api/repository/{id}/archive    → archive, JSON body `{"reason": ...}` optional
//!   POST /api/repository/{id}/unarchive  → unarchive

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use foxnest_core::{
    FoxError, ObjectId, RepositoryHost, StorageStats, SyncMessage, SyncOperation, SyncResponse,
    SyncStatus, PROTOCOL_VERSION,
};
use http_body_util::Full;
use hyper::Response;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Reason recorded when an archive request does not give one
const DEFAULT_ARCHIVE_REASON: &str = "archived by administrator";

const CONTENT_TYPE_SYNC: &str = "application/x-foxnest-sync";

/// Route one API request. `path` excludes the query string.
pub async fn handle_api_request(
    method: &str,
    path: &str,
    body: &[u8],
    host: &Arc<RepositoryHost>,
) -> Response<Full<Bytes>> {
    let segments: Vec<&str> = path.trim_matches('/').split('/').filter(|s| !s.is_empty()).collect();

    match (method, segments.as_slice()) {
        ("GET", []) => handle_health(),
        ("GET", ["api", "repositories"]) => handle_list(host).await,
        ("GET", ["api", "repository", id]) => handle_summary(host, id).await,
        ("GET", ["api", "repository", id, "commits"]) => handle_commits(host, id).await,
        ("POST", ["api", "repository", id, "sync"]) => handle_sync(host, id, body).await,
        ("POST", ["api", "repository", id, "archive"]) => handle_archive(host, id, body).await,
        ("POST", ["api", "repository", id, "unarchive"]) => handle_unarchive(host, id).await,
        _ => json_error(404, &format!("Unknown endpoint: {} {}", method, path)),
    }
}

// ─────────────────────────────────────────────────────
// GET /
// ─────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthBody {
    pub status: String,
    pub service: String,
    pub version: String,
    pub protocol_version: u32,
}

fn handle_health() -> Response<Full<Bytes>> {
    json_ok(&HealthBody {
        status: "ok".into(),
        service: "foxnest".into(),
        version: env!("CARGO_PKG_VERSION").into(),
        protocol_version: PROTOCOL_VERSION,
    })
}

// ─────────────────────────────────────────────────────
// GET /api/repositories
// ─────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct RepositoryList {
    pub repositories: Vec<String>,
}

async fn handle_list(host: &Arc<RepositoryHost>) -> Response<Full<Bytes>> {
    let host = host.clone();
    match blocking(move || host.list()).await {
        Ok(repositories) => json_ok(&RepositoryList { repositories }),
        Err(e) => fox_error(&e),
    }
}

// ─────────────────────────────────────────────────────
// GET /api/repository/{id}
// ─────────────────────────────────────────────────────

/// Flattened view of a hosted repository
#[derive(Debug, Serialize, Deserialize)]
pub struct SummaryBody {
    pub id: String,
    pub head: Option<ObjectId>,
    pub archived: bool,
    pub archived_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
    pub commits: u64,
    pub last_gc_at: Option<DateTime<Utc>>,
    pub storage: StorageStats,
}

async fn handle_summary(host: &Arc<RepositoryHost>, id: &str) -> Response<Full<Bytes>> {
    let host = host.clone();
    let id = id.to_string();
    match blocking(move || host.summary(&id)).await {
        Ok(summary) => {
            let (archived_at, reason) = match summary.archive {
                Some(info) => (Some(info.archived_at), Some(info.reason)),
                None => (None, None),
            };
            json_ok(&SummaryBody {
                id: summary.id,
                head: summary.head,
                archived: summary.archived,
                archived_at,
                reason,
                commits: summary.commits,
                last_gc_at: summary.last_gc_at,
                storage: summary.storage,
            })
        }
        Err(e) => fox_error(&e),
    }
}

// ─────────────────────────────────────────────────────
// GET /api/repository/{id}/commits
// ─────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct CommitEntry {
    pub id: ObjectId,
    pub tree: ObjectId,
    pub parent: Option<ObjectId>,
    pub author: String,
    /// Unix seconds
    pub timestamp: i64,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CommitList {
    pub id: String,
    pub commits: Vec<CommitEntry>,
}

async fn handle_commits(host: &Arc<RepositoryHost>, id: &str) -> Response<Full<Bytes>> {
    let host = host.clone();
    let repo_id = id.to_string();
    match blocking(move || host.history(&repo_id, None)).await {
        Ok(history) => json_ok(&CommitList {
            id: id.to_string(),
            commits: history
                .into_iter()
                .map(|(id, commit)| CommitEntry {
                    id,
                    tree: commit.tree,
                    parent: commit.parent,
                    author: commit.author,
                    timestamp: commit.timestamp,
                    message: commit.message,
                })
                .collect(),
        }),
        Err(e) => fox_error(&e),
    }
}

// ─────────────────────────────────────────────────────
// POST /api/repository/{id}/sync
// ─────────────────────────────────────────────────────

async fn handle_sync(host: &Arc<RepositoryHost>, id: &str, body: &[u8]) -> Response<Full<Bytes>> {
    let request = match SyncMessage::decode(body).and_then(SyncMessage::into_request) {
        Ok(request) => request,
        Err(e) => return json_error(400, &format!("Invalid sync message: {}", e)),
    };
    if request.repository_id != id {
        return json_error(
            400,
            &format!(
                "Repository id mismatch: path says {:?}, message says {:?}",
                id, request.repository_id
            ),
        );
    }

    let pushed = request.objects.len() as u64;
    let operation = request.operation;
    let host = host.clone();
    let response = match tokio::task::spawn_blocking(move || host.handle(&request)).await {
        Ok(response) => response,
        Err(e) => return json_error(500, &format!("Sync worker failed: {}", e)),
    };
    record_metrics(operation, &response, pushed);

    match SyncMessage::Response(response).encode() {
        Ok(frame) => Response::builder()
            .status(200)
            .header("Content-Type", CONTENT_TYPE_SYNC)
            .body(Full::new(Bytes::from(frame)))
            .unwrap_or_else(|_| internal_error()),
        Err(e) => json_error(500, &format!("Failed to encode response: {}", e)),
    }
}

fn record_metrics(operation: SyncOperation, response: &SyncResponse, pushed: u64) {
    match operation {
        SyncOperation::Push => {
            metrics::counter!("foxnest_push_total").increment(1);
            if response.status.is_success() {
                metrics::counter!("foxnest_objects_received_total").increment(pushed);
            } else {
                warn!("Push to {} rejected: {:?}", response.repository_id, response.status);
                metrics::counter!("foxnest_push_rejected_total", "reason" => rejection_reason(response.status))
                    .increment(1);
            }
        }
        SyncOperation::Pull => {
            metrics::counter!("foxnest_pull_total").increment(1);
        }
        _ => {}
    }
}

fn rejection_reason(status: SyncStatus) -> &'static str {
    match status {
        SyncStatus::RepositoryArchived => "archived",
        SyncStatus::IntegrityError => "integrity",
        SyncStatus::IncompleteTransfer => "incomplete",
        SyncStatus::Diverged => "diverged",
        SyncStatus::LockTimeout => "lock_timeout",
        SyncStatus::InvalidRequest => "invalid",
        _ => "error",
    }
}

// ─────────────────────────────────────────────────────
// POST /api/repository/{id}/archive, /unarchive
// ─────────────────────────────────────────────────────

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ArchiveRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ArchiveResult {
    pub id: String,
    pub archived: bool,
    pub archived_at: DateTime<Utc>,
    pub reason: String,
}

async fn handle_archive(host: &Arc<RepositoryHost>, id: &str, body: &[u8]) -> Response<Full<Bytes>> {
    let request: ArchiveRequest = if body.iter().all(u8::is_ascii_whitespace) {
        ArchiveRequest::default()
    } else {
        match serde_json::from_slice(body) {
            Ok(r) => r,
            Err(e) => return json_error(400, &format!("Invalid JSON body: {}", e)),
        }
    };
    let reason = request
        .reason
        .filter(|r| !r.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_ARCHIVE_REASON.to_string());

    let host = host.clone();
    let repo_id = id.to_string();
    match blocking(move || host.archive(&repo_id, &reason)).await {
        Ok(info) => {
            info!("Repository {} archived: {}", id, info.reason);
            json_ok(&ArchiveResult {
                id: id.to_string(),
                archived: true,
                archived_at: info.archived_at,
                reason: info.reason,
            })
        }
        Err(e) => fox_error(&e),
    }
}

async fn handle_unarchive(host: &Arc<RepositoryHost>, id: &str) -> Response<Full<Bytes>> {
    let host = host.clone();
    let repo_id = id.to_string();
    match blocking(move || host.unarchive(&repo_id)).await {
        Ok(previous) => {
            info!("Repository {} unarchived", id);
            json_ok(&ArchiveResult {
                id: id.to_string(),
                archived: false,
                archived_at: previous.archived_at,
                reason: previous.reason,
            })
        }
        Err(e) => fox_error(&e),
    }
}

// ─────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────

/// Run repository work off the async executor
async fn blocking<T, F>(work: F) -> foxnest_core::Result<T>
where
    F: FnOnce() -> foxnest_core::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| FoxError::Io(std::io::Error::other(e.to_string())))?
}

fn fox_error(error: &FoxError) -> Response<Full<Bytes>> {
    let status = match error {
        FoxError::RepositoryNotFound(_) => 404,
        FoxError::InvalidRepositoryId(_) => 400,
        FoxError::AlreadyArchived | FoxError::NotArchived => 409,
        FoxError::LockTimeout { .. } => 503,
        _ => 500,
    };
    json_error(status, &error.to_string())
}

fn json_ok<T: Serialize>(data: &T) -> Response<Full<Bytes>> {
    let body = serde_json::to_vec(data).unwrap_or_default();
    Response::builder()
        .status(200)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .unwrap_or_else(|_| internal_error())
}

/// JSON error body, `{"error": "..."}`
pub fn json_error(status: u16, message: &str) -> Response<Full<Bytes>> {
    #[derive(Serialize)]
    struct ErrorBody {
        error: String,
    }
    let body = serde_json::to_vec(&ErrorBody {
        error: message.to_string(),
    })
    .unwrap_or_default();
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .unwrap_or_else(|_| internal_error())
}

fn internal_error() -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(b"Internal Server Error")));
    *response.status_mut() = hyper::StatusCode::INTERNAL_SERVER_ERROR;
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_reasons() {
        assert_eq!(rejection_reason(SyncStatus::RepositoryArchived), "archived");
        assert_eq!(rejection_reason(SyncStatus::IntegrityError), "integrity");
        assert_eq!(rejection_reason(SyncStatus::Error), "error");
    }

    #[test]
    fn test_fox_error_status_codes() {
        assert_eq!(fox_error(&FoxError::RepositoryNotFound("x".into())).status(), 404);
        assert_eq!(fox_error(&FoxError::InvalidRepositoryId("../x".into())).status(), 400);
        assert_eq!(fox_error(&FoxError::AlreadyArchived).status(), 409);
        assert_eq!(fox_error(&FoxError::NothingToCommit).status(), 500);
    }

    #[test]
    fn test_archive_request_defaults() {
        let request: ArchiveRequest = serde_json::from_str("{}").unwrap();
        assert!(request.reason.is_none());
    }
}
