//! Loose object storage
//!
//! One zstd-compressed file per object under a two-hex-digit fanout:
//! `objects/{hash[0..2]}/{hash[2..]}`. The fanout only bounds directory size.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{FoxError, Result};
use crate::object::{decode_with_header, encode_with_header, ObjectId, ObjectKind};

/// Content-addressed store of individually compressed objects
#[derive(Debug, Clone)]
pub struct LooseStore {
    dir: PathBuf,
    compression_level: i32,
}

impl LooseStore {
    /// Open (creating if needed) a loose store rooted at `dir`
    pub fn open(dir: &Path, compression_level: i32) -> Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            compression_level,
        })
    }

    pub fn object_path(&self, id: &ObjectId) -> PathBuf {
        let hex = id.to_hex();
        self.dir.join(&hex[..2]).join(&hex[2..])
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        self.object_path(id).is_file()
    }

    /// Store a payload whose identity is already known. Returns false when the
    /// object was present (content-addressed = idempotent).
    pub fn write(&self, id: &ObjectId, kind: ObjectKind, payload: &[u8]) -> Result<bool> {
        let path = self.object_path(id);
        if path.exists() {
            return Ok(false);
        }
        let parent = path
            .parent()
            .ok_or_else(|| FoxError::invalid(Some(*id), "object path has no parent"))?;
        fs::create_dir_all(parent)?;

        let raw = encode_with_header(kind, payload);
        let compressed = zstd::encode_all(&raw[..], self.compression_level)?;

        // Write atomically via temp file; the object is durable before any
        // pointer may reference it.
        let tmp_path = path.with_extension(format!("tmp-{}", std::process::id()));
        {
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(&compressed)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &path)?;
        debug!("Stored loose {} {} ({} bytes)", kind, id.short(), payload.len());
        Ok(true)
    }

    /// Read and decompress an object; `None` if it is not stored loose
    pub fn read(&self, id: &ObjectId) -> Result<Option<(ObjectKind, Vec<u8>)>> {
        let path = self.object_path(id);
        let compressed = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let raw = zstd::decode_all(&compressed[..]).map_err(|e| {
            FoxError::invalid(Some(*id), format!("failed to decompress {:?}: {}", path, e))
        })?;
        let (kind, payload) = decode_with_header(&raw).map_err(|e| match e {
            FoxError::InvalidObject { reason, .. } => FoxError::invalid(Some(*id), reason),
            other => other,
        })?;
        Ok(Some((kind, payload.to_vec())))
    }

    /// Delete a loose copy. Missing files are not an error.
    pub fn remove(&self, id: &ObjectId) -> Result<bool> {
        let path = self.object_path(id);
        match fs::remove_file(&path) {
            Ok(()) => {
                if let Some(parent) = path.parent() {
                    // Only succeeds once the fanout directory is empty
                    let _ = fs::remove_dir(parent);
                }
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Enumerate every loose object id
    pub fn list(&self) -> Result<Vec<ObjectId>> {
        let mut ids = Vec::new();
        for fanout in fs::read_dir(&self.dir)? {
            let fanout = fanout?;
            if !fanout.file_type()?.is_dir() {
                continue;
            }
            let prefix = fanout.file_name().to_string_lossy().to_string();
            if prefix.len() != 2 {
                continue;
            }
            for entry in fs::read_dir(fanout.path())? {
                let entry = entry?;
                let rest = entry.file_name().to_string_lossy().to_string();
                // Skips leftover temp files as well
                if let Ok(id) = ObjectId::from_hex(&format!("{}{}", prefix, rest)) {
                    ids.push(id);
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Number of loose objects and their on-disk size in bytes
    pub fn usage(&self) -> Result<(u64, u64)> {
        let mut count = 0u64;
        let mut bytes = 0u64;
        for id in self.list()? {
            if let Ok(meta) = fs::metadata(self.object_path(&id)) {
                count += 1;
                bytes += meta.len();
            }
        }
        Ok((count, bytes))
    }
}
