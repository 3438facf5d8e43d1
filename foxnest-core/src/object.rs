//! Core object model for FoxNest
//!
//! Implements content-addressable storage with Blob, Tree, and Commit objects.
//! An object's identity is the SHA-256 of `"<kind> <len>\0" || payload`, so two
//! objects share an identity exactly when their kind and payload are equal.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::str::FromStr;

use crate::error::{FoxError, Result};

/// Regular file mode
pub const MODE_FILE: u32 = 0o100644;
/// Executable file mode
pub const MODE_EXECUTABLE: u32 = 0o100755;
/// Directory mode
pub const MODE_DIRECTORY: u32 = 0o040000;

/// Unique identifier for any stored object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId([u8; 32]);

impl ObjectId {
    /// Create a new ObjectId from raw bytes
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Compute the identity of a payload of the given kind
    pub fn compute(kind: ObjectKind, payload: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(header(kind, payload.len()));
        hasher.update(payload);
        Self(hasher.finalize().into())
    }

    /// Convert to hexadecimal string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First 12 hex digits, for display
    pub fn short(&self) -> String {
        let mut hex = self.to_hex();
        hex.truncate(12);
        hex
    }

    /// Parse from hexadecimal string
    pub fn from_hex(hex_str: &str) -> std::result::Result<Self, hex::FromHexError> {
        let bytes = hex::decode(hex_str)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Hex in JSON, raw bytes in bincode
impl Serialize for ObjectId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_hex())
        } else {
            self.0.serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            let hex_str = String::deserialize(deserializer)?;
            Self::from_hex(&hex_str).map_err(serde::de::Error::custom)
        } else {
            <[u8; 32]>::deserialize(deserializer).map(Self)
        }
    }
}

impl FromStr for ObjectId {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

/// Object type discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ObjectKind {
    Blob,
    Tree,
    Commit,
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Blob => "blob",
            ObjectKind::Tree => "tree",
            ObjectKind::Commit => "commit",
        }
    }

    /// Single-byte tag used in pack records
    pub fn to_u8(self) -> u8 {
        match self {
            ObjectKind::Blob => 1,
            ObjectKind::Tree => 2,
            ObjectKind::Commit => 3,
        }
    }

    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(ObjectKind::Blob),
            2 => Some(ObjectKind::Tree),
            3 => Some(ObjectKind::Commit),
            _ => None,
        }
    }
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObjectKind {
    type Err = FoxError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "blob" => Ok(ObjectKind::Blob),
            "tree" => Ok(ObjectKind::Tree),
            "commit" => Ok(ObjectKind::Commit),
            other => Err(FoxError::invalid(None, format!("unknown object kind {:?}", other))),
        }
    }
}

/// `"<kind> <len>\0"`
pub fn header(kind: ObjectKind, len: usize) -> Vec<u8> {
    format!("{} {}\0", kind.as_str(), len).into_bytes()
}

/// Header followed by payload; this is what loose objects store (compressed)
pub fn encode_with_header(kind: ObjectKind, payload: &[u8]) -> Vec<u8> {
    let mut buf = header(kind, payload.len());
    buf.extend_from_slice(payload);
    buf
}

/// Split a header-prefixed buffer back into kind and payload.
pub fn decode_with_header(data: &[u8]) -> Result<(ObjectKind, &[u8])> {
    let nul = data
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| FoxError::invalid(None, "missing header terminator"))?;
    let head = std::str::from_utf8(&data[..nul])
        .map_err(|_| FoxError::invalid(None, "header is not UTF-8"))?;
    let (kind, len) = head
        .split_once(' ')
        .ok_or_else(|| FoxError::invalid(None, "malformed header"))?;
    let kind: ObjectKind = kind.parse()?;
    let len: usize = len
        .parse()
        .map_err(|_| FoxError::invalid(None, format!("bad length in header {:?}", head)))?;
    let payload = &data[nul + 1..];
    if payload.len() != len {
        return Err(FoxError::invalid(
            None,
            format!("header declares {} bytes, found {}", len, payload.len()),
        ));
    }
    Ok((kind, payload))
}

/// File content object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    /// Raw content data
    pub data: Vec<u8>,
}

impl Blob {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Compute the object ID
    pub fn id(&self) -> ObjectId {
        ObjectId::compute(ObjectKind::Blob, &self.data)
    }
}

/// Directory tree entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEntry {
    /// Name of the entry (one path segment)
    pub name: String,
    /// Object ID (points to Blob or Tree)
    pub id: ObjectId,
    /// Entry type
    pub kind: ObjectKind,
    /// POSIX-style mode
    pub mode: u32,
}

impl TreeEntry {
    /// Create a new tree entry
    pub fn new(name: String, id: ObjectId, kind: ObjectKind, mode: u32) -> Self {
        Self {
            name,
            id,
            kind,
            mode,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == ObjectKind::Tree
    }
}

/// Reject names that would break path reconstruction.
pub fn validate_entry_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\0')
    {
        return Err(FoxError::invalid(None, format!("invalid tree entry name {:?}", name)));
    }
    Ok(())
}

/// Directory object
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tree {
    /// Sorted entries for deterministic hashing
    pub entries: BTreeMap<String, TreeEntry>,
}

impl Tree {
    /// Create an empty tree
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or update an entry
    pub fn insert(&mut self, entry: TreeEntry) {
        self.entries.insert(entry.name.clone(), entry);
    }

    /// Remove an entry
    pub fn remove(&mut self, name: &str) -> Option<TreeEntry> {
        self.entries.remove(name)
    }

    /// Get an entry
    pub fn get(&self, name: &str) -> Option<&TreeEntry> {
        self.entries.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over entries in name order
    pub fn iter(&self) -> impl Iterator<Item = &TreeEntry> {
        self.entries.values()
    }

    pub fn to_payload(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_payload(data: &[u8]) -> Result<Self> {
        let tree: Tree = bincode::deserialize(data)?;
        for (key, entry) in &tree.entries {
            validate_entry_name(key)?;
            if *key != entry.name {
                return Err(FoxError::invalid(
                    None,
                    format!("tree key {:?} does not match entry name {:?}", key, entry.name),
                ));
            }
            if entry.kind == ObjectKind::Commit {
                return Err(FoxError::invalid(None, "tree entries cannot reference commits"));
            }
        }
        Ok(tree)
    }

    /// Compute the object ID
    pub fn id(&self) -> Result<ObjectId> {
        Ok(ObjectId::compute(ObjectKind::Tree, &self.to_payload()?))
    }
}

/// Commit object; history is linear, so there is at most one parent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    /// Root tree of this snapshot
    pub tree: ObjectId,
    /// Parent commit (None for the initial commit)
    pub parent: Option<ObjectId>,
    /// Author name
    pub author: String,
    /// Commit timestamp (UTC, Unix seconds)
    pub timestamp: i64,
    /// Commit message
    pub message: String,
}

impl Commit {
    pub fn new(
        tree: ObjectId,
        parent: Option<ObjectId>,
        author: String,
        timestamp: i64,
        message: String,
    ) -> Self {
        Self {
            tree,
            parent,
            author,
            timestamp,
            message,
        }
    }

    pub fn to_payload(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_payload(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }

    /// Compute the object ID
    pub fn id(&self) -> Result<ObjectId> {
        Ok(ObjectId::compute(ObjectKind::Commit, &self.to_payload()?))
    }

    /// Check if this is an initial commit (no parent)
    pub fn is_initial(&self) -> bool {
        self.parent.is_none()
    }
}

/// Generic decoded object
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Object {
    Blob(Blob),
    Tree(Tree),
    Commit(Commit),
}

impl Object {
    /// Decode a payload of a known kind
    pub fn decode(kind: ObjectKind, payload: &[u8]) -> Result<Self> {
        Ok(match kind {
            ObjectKind::Blob => Object::Blob(Blob::new(payload.to_vec())),
            ObjectKind::Tree => Object::Tree(Tree::from_payload(payload)?),
            ObjectKind::Commit => Object::Commit(Commit::from_payload(payload)?),
        })
    }

    /// Get the object kind
    pub fn kind(&self) -> ObjectKind {
        match self {
            Object::Blob(_) => ObjectKind::Blob,
            Object::Tree(_) => ObjectKind::Tree,
            Object::Commit(_) => ObjectKind::Commit,
        }
    }

    pub fn to_payload(&self) -> Result<Vec<u8>> {
        match self {
            Object::Blob(blob) => Ok(blob.data.clone()),
            Object::Tree(tree) => tree.to_payload(),
            Object::Commit(commit) => commit.to_payload(),
        }
    }

    /// Objects this one points at: a tree's children, a commit's tree and parent
    pub fn references(&self) -> Vec<ObjectId> {
        match self {
            Object::Blob(_) => Vec::new(),
            Object::Tree(tree) => tree.iter().map(|e| e.id).collect(),
            Object::Commit(commit) => {
                let mut refs = vec![commit.tree];
                refs.extend(commit.parent);
                refs
            }
        }
    }
}

/// References of a raw payload, without keeping the decoded object around
pub fn payload_references(kind: ObjectKind, payload: &[u8]) -> Result<Vec<ObjectId>> {
    match kind {
        ObjectKind::Blob => Ok(Vec::new()),
        _ => Ok(Object::decode(kind, payload)?.references()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_id_roundtrip() {
        let id = ObjectId::new([42u8; 32]);
        let hex = id.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(ObjectId::from_hex(&hex).unwrap(), id);
        assert_eq!(id.short().len(), 12);
    }

    #[test]
    fn test_object_id_serde_forms() {
        let id = ObjectId::compute(ObjectKind::Blob, b"serde");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.to_hex()));
        assert_eq!(serde_json::from_str::<ObjectId>(&json).unwrap(), id);

        let bin = bincode::serialize(&id).unwrap();
        assert_eq!(bin.len(), 32);
        assert_eq!(bincode::deserialize::<ObjectId>(&bin).unwrap(), id);
    }

    #[test]
    fn test_identity_covers_kind() {
        let blob = ObjectId::compute(ObjectKind::Blob, b"same bytes");
        let tree = ObjectId::compute(ObjectKind::Tree, b"same bytes");
        assert_ne!(blob, tree);
        assert_eq!(blob, ObjectId::compute(ObjectKind::Blob, b"same bytes"));
    }

    #[test]
    fn test_header_roundtrip() {
        let encoded = encode_with_header(ObjectKind::Commit, b"payload");
        assert!(encoded.starts_with(b"commit 7\0"));
        let (kind, payload) = decode_with_header(&encoded).unwrap();
        assert_eq!(kind, ObjectKind::Commit);
        assert_eq!(payload, b"payload");
    }

    #[test]
    fn test_header_length_mismatch() {
        let mut encoded = encode_with_header(ObjectKind::Blob, b"abc");
        encoded.push(b'd');
        assert!(decode_with_header(&encoded).is_err());
    }

    #[test]
    fn test_tree_insert_remove() {
        let mut tree = Tree::new();
        tree.insert(TreeEntry::new(
            "test.txt".to_string(),
            ObjectId::new([0u8; 32]),
            ObjectKind::Blob,
            MODE_FILE,
        ));
        assert!(tree.get("test.txt").is_some());
        tree.remove("test.txt");
        assert!(tree.get("test.txt").is_none());
    }

    #[test]
    fn test_tree_id_independent_of_insert_order() {
        let a = TreeEntry::new("a".into(), ObjectId::new([1; 32]), ObjectKind::Blob, MODE_FILE);
        let b = TreeEntry::new("b".into(), ObjectId::new([2; 32]), ObjectKind::Tree, MODE_DIRECTORY);

        let mut t1 = Tree::new();
        t1.insert(a.clone());
        t1.insert(b.clone());
        let mut t2 = Tree::new();
        t2.insert(b);
        t2.insert(a);

        assert_eq!(t1.id().unwrap(), t2.id().unwrap());
    }

    #[test]
    fn test_tree_rejects_bad_names() {
        assert!(validate_entry_name("ok.txt").is_ok());
        assert!(validate_entry_name("").is_err());
        assert!(validate_entry_name("..").is_err());
        assert!(validate_entry_name("a/b").is_err());
    }

    #[test]
    fn test_commit_serialization() {
        let commit = Commit::new(
            ObjectId::new([1u8; 32]),
            Some(ObjectId::new([2u8; 32])),
            "Test Author".to_string(),
            1234567890,
            "Test message".to_string(),
        );
        let payload = commit.to_payload().unwrap();
        let commit2 = Commit::from_payload(&payload).unwrap();
        assert_eq!(commit, commit2);
        assert_eq!(commit.id().unwrap(), commit2.id().unwrap());
    }

    #[test]
    fn test_references() {
        let tree_id = ObjectId::new([3; 32]);
        let parent = ObjectId::new([4; 32]);
        let commit = Object::Commit(Commit::new(tree_id, Some(parent), "a".into(), 0, "m".into()));
        assert_eq!(commit.references(), vec![tree_id, parent]);
        assert!(Object::Blob(Blob::new(b"x".to_vec())).references().is_empty());
    }
}
