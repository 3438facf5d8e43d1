//! Push/pull wire protocol
//!
//! One request, one response. Messages travel inside a [`SyncMessage`]
//! envelope, bincode-encoded and zstd-compressed behind a small header:
//!
//! ```text
//! [magic "FOXN"(4)] [flags(1)] [uncompressed_len(4)] [compressed_len(4)] [data]
//! ```

use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FoxError, Result};
use crate::object::{ObjectId, ObjectKind};
use crate::state::ArchiveInfo;

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Magic bytes for protocol identification
pub const PROTOCOL_MAGIC: &[u8; 4] = b"FOXN";

/// Maximum decoded message size (256 MB)
pub const MAX_MESSAGE_SIZE: usize = 256 * 1024 * 1024;

const FLAG_COMPRESSED: u8 = 0x01;
const FRAME_HEADER_LEN: usize = 13;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncOperation {
    /// Report head and archive state; never transfers objects
    Negotiate,
    Push,
    Pull,
    Archive,
    Unarchive,
    Info,
}

/// One object in a transfer stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireObject {
    pub id: ObjectId,
    pub kind: ObjectKind,
    pub length: u64,
    pub payload: Vec<u8>,
}

impl WireObject {
    pub fn new(id: ObjectId, kind: ObjectKind, payload: Vec<u8>) -> Self {
        Self {
            id,
            kind,
            length: payload.len() as u64,
            payload,
        }
    }

    /// Recompute the digest and compare it with the claimed identity
    pub fn verify(&self) -> Result<()> {
        if self.length != self.payload.len() as u64 {
            return Err(FoxError::Protocol(format!(
                "object {} declares {} bytes but carries {}",
                self.id.short(),
                self.length,
                self.payload.len()
            )));
        }
        let actual = ObjectId::compute(self.kind, &self.payload);
        if actual != self.id {
            return Err(FoxError::Integrity {
                claimed: self.id,
                actual,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub protocol_version: u32,
    pub operation: SyncOperation,
    pub repository_id: String,
    /// The sender's current head
    pub client_head: Option<ObjectId>,
    /// Server head the client observed when negotiating (push only)
    pub base_head: Option<ObjectId>,
    /// Archive the repository once the push is applied
    pub archive: bool,
    pub reason: Option<String>,
    pub objects: Vec<WireObject>,
}

impl SyncRequest {
    fn new(operation: SyncOperation, repository_id: &str) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            operation,
            repository_id: repository_id.to_string(),
            client_head: None,
            base_head: None,
            archive: false,
            reason: None,
            objects: Vec::new(),
        }
    }

    pub fn negotiate(repository_id: &str, client_head: Option<ObjectId>) -> Self {
        Self {
            client_head,
            ..Self::new(SyncOperation::Negotiate, repository_id)
        }
    }

    pub fn push(
        repository_id: &str,
        client_head: ObjectId,
        base_head: Option<ObjectId>,
        objects: Vec<WireObject>,
        archive: bool,
    ) -> Self {
        Self {
            client_head: Some(client_head),
            base_head,
            objects,
            archive,
            ..Self::new(SyncOperation::Push, repository_id)
        }
    }

    pub fn pull(repository_id: &str, client_head: Option<ObjectId>) -> Self {
        Self {
            client_head,
            ..Self::new(SyncOperation::Pull, repository_id)
        }
    }

    pub fn archive(repository_id: &str, reason: Option<String>) -> Self {
        Self {
            reason,
            ..Self::new(SyncOperation::Archive, repository_id)
        }
    }

    pub fn unarchive(repository_id: &str) -> Self {
        Self::new(SyncOperation::Unarchive, repository_id)
    }

    pub fn info(repository_id: &str) -> Self {
        Self::new(SyncOperation::Info, repository_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStatus {
    /// Negotiation answer; the caller may proceed
    Ready,
    UpToDate,
    Applied,
    RepositoryArchived,
    AlreadyArchived,
    NotArchived,
    IntegrityError,
    IncompleteTransfer,
    Diverged,
    NotFound,
    LockTimeout,
    InvalidRequest,
    Error,
}

impl SyncStatus {
    pub fn is_success(self) -> bool {
        matches!(self, SyncStatus::Ready | SyncStatus::UpToDate | SyncStatus::Applied)
    }
}

/// The object a server rejected and what it actually hashed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityDetail {
    pub claimed: ObjectId,
    pub actual: ObjectId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResponse {
    pub status: SyncStatus,
    pub repository_id: String,
    pub server_head: Option<ObjectId>,
    pub archived: bool,
    pub archive: Option<ArchiveInfo>,
    pub objects: Vec<WireObject>,
    /// How many objects the server stored for a push
    pub objects_written: u64,
    pub integrity: Option<IntegrityDetail>,
    pub message: Option<String>,
}

impl SyncResponse {
    pub fn new(status: SyncStatus, repository_id: &str) -> Self {
        Self {
            status,
            repository_id: repository_id.to_string(),
            server_head: None,
            archived: false,
            archive: None,
            objects: Vec::new(),
            objects_written: 0,
            integrity: None,
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Server side: describe a failed operation
    pub fn from_error(repository_id: &str, error: &FoxError) -> Self {
        let status = match error {
            FoxError::RepositoryArchived(_) => SyncStatus::RepositoryArchived,
            FoxError::AlreadyArchived => SyncStatus::AlreadyArchived,
            FoxError::NotArchived => SyncStatus::NotArchived,
            FoxError::Integrity { .. } => SyncStatus::IntegrityError,
            FoxError::IncompleteTransfer { .. } => SyncStatus::IncompleteTransfer,
            FoxError::Diverged { .. } => SyncStatus::Diverged,
            FoxError::RepositoryNotFound(_) => SyncStatus::NotFound,
            FoxError::LockTimeout { .. } => SyncStatus::LockTimeout,
            FoxError::InvalidRepositoryId(_) | FoxError::Protocol(_) | FoxError::InvalidObject { .. } => {
                SyncStatus::InvalidRequest
            }
            _ => SyncStatus::Error,
        };
        let mut response = Self::new(status, repository_id).with_message(error.to_string());
        if let FoxError::Integrity { claimed, actual } = error {
            response.integrity = Some(IntegrityDetail {
                claimed: *claimed,
                actual: *actual,
            });
        }
        response
    }

    /// Client side: turn a failure status back into a typed error
    pub fn into_result(self, client_head: Option<ObjectId>) -> Result<Self> {
        if self.status.is_success() {
            return Ok(self);
        }
        let message = self.message.clone().unwrap_or_else(|| format!("{:?}", self.status));
        Err(match self.status {
            SyncStatus::RepositoryArchived => FoxError::RepositoryArchived(self.repository_id),
            SyncStatus::AlreadyArchived => FoxError::AlreadyArchived,
            SyncStatus::NotArchived => FoxError::NotArchived,
            SyncStatus::IntegrityError => match self.integrity {
                Some(detail) => FoxError::Integrity {
                    claimed: detail.claimed,
                    actual: detail.actual,
                },
                None => FoxError::Protocol(message),
            },
            SyncStatus::Diverged => FoxError::Diverged {
                local: display_head(client_head),
                remote: display_head(self.server_head),
            },
            SyncStatus::NotFound => FoxError::RepositoryNotFound(self.repository_id),
            SyncStatus::LockTimeout => FoxError::LockTimeout {
                path: PathBuf::from(format!("remote:{}", self.repository_id)),
                waited: Duration::ZERO,
            },
            _ => FoxError::Protocol(message),
        })
    }
}

/// Hex of a head, or `(empty)`
pub fn display_head(head: Option<ObjectId>) -> String {
    head.map(|h| h.to_hex()).unwrap_or_else(|| "(empty)".to_string())
}

/// Envelope for all protocol messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMessage {
    Request(SyncRequest),
    Response(SyncResponse),
}

impl SyncMessage {
    /// Encode with zstd compression.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload = bincode::serialize(self)?;
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(FoxError::Protocol(format!(
                "Message too large: {} bytes (max {})",
                payload.len(),
                MAX_MESSAGE_SIZE
            )));
        }
        let compressed = zstd::encode_all(&payload[..], 3)?;
        let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + compressed.len());
        buf.extend_from_slice(PROTOCOL_MAGIC);
        buf.push(FLAG_COMPRESSED);
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&(compressed.len() as u32).to_le_bytes());
        buf.extend_from_slice(&compressed);
        Ok(buf)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < FRAME_HEADER_LEN {
            return Err(FoxError::Protocol("Message too short for header".into()));
        }
        if &data[0..4] != PROTOCOL_MAGIC {
            return Err(FoxError::Protocol("Invalid protocol magic".into()));
        }
        let flags = data[4];
        let uncompressed_len = read_u32(&data[5..9]) as usize;
        let body_len = read_u32(&data[9..13]) as usize;
        if uncompressed_len > MAX_MESSAGE_SIZE {
            return Err(FoxError::Protocol(format!(
                "Message too large: {} bytes (max {})",
                uncompressed_len, MAX_MESSAGE_SIZE
            )));
        }
        let body = data
            .get(FRAME_HEADER_LEN..FRAME_HEADER_LEN + body_len)
            .ok_or_else(|| FoxError::Protocol("Message truncated".into()))?;

        let payload = if flags & FLAG_COMPRESSED != 0 {
            // Never inflate past the declared length
            let decoder = zstd::stream::read::Decoder::new(body)
                .map_err(|e| FoxError::Protocol(format!("Failed to decompress: {}", e)))?;
            let mut payload = Vec::new();
            decoder
                .take(uncompressed_len as u64 + 1)
                .read_to_end(&mut payload)
                .map_err(|e| FoxError::Protocol(format!("Failed to decompress: {}", e)))?;
            payload
        } else {
            body.to_vec()
        };
        if payload.len() != uncompressed_len {
            return Err(FoxError::Protocol("Decoded length does not match header".into()));
        }
        Ok(bincode::deserialize(&payload)?)
    }

    pub fn into_request(self) -> Result<SyncRequest> {
        match self {
            SyncMessage::Request(request) => Ok(request),
            SyncMessage::Response(_) => Err(FoxError::Protocol("expected a request, got a response".into())),
        }
    }

    pub fn into_response(self) -> Result<SyncResponse> {
        match self {
            SyncMessage::Response(response) => Ok(response),
            SyncMessage::Request(_) => Err(FoxError::Protocol("expected a response, got a request".into())),
        }
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(bytes);
    u32::from_le_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(data: &[u8]) -> WireObject {
        WireObject::new(ObjectId::compute(ObjectKind::Blob, data), ObjectKind::Blob, data.to_vec())
    }

    #[test]
    fn test_decode_stops_at_declared_length() {
        let inflated = zstd::encode_all(&vec![0u8; 4 * 1024 * 1024][..], 3).unwrap();
        let mut frame = Vec::new();
        frame.extend_from_slice(PROTOCOL_MAGIC);
        frame.push(FLAG_COMPRESSED);
        frame.extend_from_slice(&16u32.to_le_bytes());
        frame.extend_from_slice(&(inflated.len() as u32).to_le_bytes());
        frame.extend_from_slice(&inflated);

        let err = SyncMessage::decode(&frame).unwrap_err();
        assert!(matches!(err, FoxError::Protocol(ref m) if m.contains("does not match")), "got {err}");
    }

    #[test]
    fn test_sync_message_roundtrip() {
        let head = ObjectId::compute(ObjectKind::Commit, b"head");
        let msg = SyncMessage::Request(SyncRequest::push("repo-1", head, None, vec![blob(b"fn main() {}")], true));
        let encoded = msg.encode().unwrap();
        assert_eq!(&encoded[0..4], PROTOCOL_MAGIC);

        let decoded = SyncMessage::decode(&encoded).unwrap();
        assert_eq!(decoded, msg);
        let request = decoded.into_request().unwrap();
        assert!(request.archive);
        assert_eq!(request.objects.len(), 1);
    }

    #[test]
    fn test_decode_rejects_bad_frames() {
        assert!(SyncMessage::decode(b"short").is_err());

        let mut encoded = SyncMessage::Request(SyncRequest::info("r")).encode().unwrap();
        encoded[0] = b'X';
        assert!(SyncMessage::decode(&encoded).is_err());

        let encoded = SyncMessage::Request(SyncRequest::info("r")).encode().unwrap();
        assert!(SyncMessage::decode(&encoded[..encoded.len() - 1]).is_err());
    }

    #[test]
    fn test_wire_object_verify() {
        let good = blob(b"payload");
        assert!(good.verify().is_ok());

        let mut flipped = good.clone();
        flipped.payload[0] ^= 0x01;
        assert!(matches!(flipped.verify(), Err(FoxError::Integrity { claimed, .. }) if claimed == good.id));

        let mut lying = good;
        lying.length += 1;
        assert!(matches!(lying.verify(), Err(FoxError::Protocol(_))));
    }

    #[test]
    fn test_error_status_roundtrip() {
        let claimed = ObjectId::compute(ObjectKind::Blob, b"a");
        let actual = ObjectId::compute(ObjectKind::Blob, b"b");
        let response = SyncResponse::from_error("r", &FoxError::Integrity { claimed, actual });
        assert_eq!(response.status, SyncStatus::IntegrityError);
        assert!(matches!(
            response.into_result(None),
            Err(FoxError::Integrity { claimed: c, actual: a }) if c == claimed && a == actual
        ));

        let archived = SyncResponse::from_error("r", &FoxError::RepositoryArchived("r".into()));
        assert!(matches!(archived.into_result(None), Err(FoxError::RepositoryArchived(id)) if id == "r"));

        let busy = SyncResponse::from_error(
            "r",
            &FoxError::LockTimeout {
                path: PathBuf::from("/srv/r/lock"),
                waited: Duration::from_secs(1),
            },
        );
        assert!(busy.into_result(None).unwrap_err().is_retryable());
    }

    #[test]
    fn test_success_passes_through() {
        let response = SyncResponse::new(SyncStatus::UpToDate, "r");
        assert_eq!(response.clone().into_result(None).unwrap(), response);
    }
}
