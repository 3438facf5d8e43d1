//! FoxNest Core Library
//!
//! Core functionality for FoxNest including:
//! - Object model (Blob, Tree, Commit) with SHA-256 identities
//! - Loose object store and delta-compressed packfiles
//! - Garbage collection that packs reachable loose objects
//! - Repository state, archive flag and per-repository locking
//! - Push/pull sync protocol, server-side repository host
//! - Client workspace with a staging index

pub mod config;
pub mod delta;
pub mod error;
pub mod gc;
pub mod host;
pub mod lock;
pub mod loose;
pub mod object;
pub mod odb;
pub mod packfile;
pub mod protocol;
pub mod repository;
pub mod state;
pub mod sync;
pub mod workspace;

pub use config::{derive_repo_id, normalize_remote_url, HostConfig, RepoConfig};
pub use error::{FoxError, Result};
pub use gc::{GarbageCollector, GcReport, GcState};
pub use host::{LocalRemote, RepositoryHost, RepositorySummary};
pub use lock::RepoLock;
pub use object::{Blob, Commit, Object, ObjectId, ObjectKind, Tree, TreeEntry};
pub use odb::{ObjectDatabase, StorageStats};
pub use packfile::{PackOptions, PackReader, PackWriter};
pub use protocol::{
    SyncMessage, SyncOperation, SyncRequest, SyncResponse, SyncStatus, WireObject, PROTOCOL_MAGIC,
    PROTOCOL_VERSION,
};
pub use repository::{Change, FileEntry, Repository, RepositoryStats};
pub use state::{ArchiveInfo, RepositoryState};
pub use sync::{pull, push, PullOutcome, PushOutcome, Remote};
pub use workspace::{Workspace, WorkspaceStatus};
