//! Client side of push and pull
//!
//! Both directions start with a `Negotiate` round trip that reports the
//! server's head and archive state, so an archived repository rejects a push
//! before a single object is sent.

use tracing::{debug, info};

use crate::error::{FoxError, Result};
use crate::object::ObjectId;
use crate::protocol::{display_head, SyncRequest, SyncResponse};
use crate::repository::Repository;

/// Reason recorded when a push also archives the repository
pub const ARCHIVE_ON_PUSH_REASON: &str = "archived on push";

/// A request/response channel to a server
pub trait Remote {
    /// Send one request and wait for its response. Transport failures are
    /// reported as [`FoxError::Connectivity`]; failure statuses are returned
    /// as ordinary responses.
    fn exchange(&self, request: SyncRequest) -> Result<SyncResponse>;
}

impl<R: Remote + ?Sized> Remote for &R {
    fn exchange(&self, request: SyncRequest) -> Result<SyncResponse> {
        (**self).exchange(request)
    }
}

impl<R: Remote + ?Sized> Remote for Box<R> {
    fn exchange(&self, request: SyncRequest) -> Result<SyncResponse> {
        (**self).exchange(request)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    /// Server already had our head; nothing was sent
    UpToDate { head: ObjectId, archived: bool },
    Applied {
        head: ObjectId,
        objects_sent: usize,
        objects_written: u64,
        archived: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullOutcome {
    UpToDate { head: Option<ObjectId> },
    Applied {
        previous: Option<ObjectId>,
        head: ObjectId,
        objects_received: usize,
        objects_written: u64,
    },
}

fn negotiate(remote: &dyn Remote, repo_id: &str, local: Option<ObjectId>) -> Result<SyncResponse> {
    let response = remote
        .exchange(SyncRequest::negotiate(repo_id, local))?
        .into_result(local)?;
    debug!(
        "Negotiated {}: server head {}, archived {}",
        repo_id,
        display_head(response.server_head),
        response.archived
    );
    Ok(response)
}

/// Send every commit the server lacks. With `archive`, the server repository
/// is archived once it holds our head.
pub fn push(repo: &Repository, remote: &dyn Remote, repo_id: &str, archive: bool) -> Result<PushOutcome> {
    let local = repo.head()?.ok_or(FoxError::NothingToCommit)?;
    let negotiated = negotiate(remote, repo_id, Some(local))?;

    if negotiated.archived {
        return Err(FoxError::RepositoryArchived(repo_id.to_string()));
    }

    if negotiated.server_head == Some(local) {
        info!("{}: everything up-to-date", repo_id);
        let archived = if archive {
            archive_remote(remote, repo_id, ARCHIVE_ON_PUSH_REASON)?;
            true
        } else {
            false
        };
        return Ok(PushOutcome::UpToDate { head: local, archived });
    }

    if let Some(server) = negotiated.server_head {
        if !repo.is_ancestor(&server, &local)? {
            return Err(FoxError::Diverged {
                local: local.to_hex(),
                remote: server.to_hex(),
            });
        }
    }

    let objects = repo.collect_objects(&local, negotiated.server_head.as_ref())?;
    let objects_sent = objects.len();
    info!("{}: pushing {} objects, head {}", repo_id, objects_sent, local.short());

    let request = SyncRequest::push(repo_id, local, negotiated.server_head, objects, archive);
    let response = remote.exchange(request)?.into_result(Some(local))?;

    Ok(PushOutcome::Applied {
        head: local,
        objects_sent,
        objects_written: response.objects_written,
        archived: response.archived,
    })
}

/// Fetch and apply whatever the server has beyond our head
pub fn pull(repo: &Repository, remote: &dyn Remote, repo_id: &str) -> Result<PullOutcome> {
    let local = repo.head()?;
    let negotiated = negotiate(remote, repo_id, local)?;

    let Some(server) = negotiated.server_head else {
        return Ok(PullOutcome::UpToDate { head: local });
    };
    if local == Some(server) {
        return Ok(PullOutcome::UpToDate { head: local });
    }
    if let Some(local_head) = local {
        if repo.odb().has(&server)? && repo.is_ancestor(&server, &local_head)? {
            return Ok(PullOutcome::UpToDate { head: local });
        }
    }

    let response = remote
        .exchange(SyncRequest::pull(repo_id, local))?
        .into_result(local)?;
    let head = response
        .server_head
        .ok_or_else(|| FoxError::Protocol("pull response carries no head".into()))?;

    let objects_received = response.objects.len();
    let objects_written = repo.apply_objects(&response.objects, head, local)?;
    info!(
        "{}: pulled {} objects, head {} -> {}",
        repo_id,
        objects_received,
        display_head(local),
        head.short()
    );
    Ok(PullOutcome::Applied {
        previous: local,
        head,
        objects_received,
        objects_written,
    })
}

pub fn archive_remote(remote: &dyn Remote, repo_id: &str, reason: &str) -> Result<SyncResponse> {
    remote
        .exchange(SyncRequest::archive(repo_id, Some(reason.to_string())))?
        .into_result(None)
}

pub fn unarchive_remote(remote: &dyn Remote, repo_id: &str) -> Result<SyncResponse> {
    remote.exchange(SyncRequest::unarchive(repo_id))?.into_result(None)
}

pub fn remote_info(remote: &dyn Remote, repo_id: &str) -> Result<SyncResponse> {
    remote.exchange(SyncRequest::info(repo_id))?.into_result(None)
}
