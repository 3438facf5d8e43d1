//! Packfile storage
//!
//! Bundles many objects into one immutable file, storing similar objects as
//! deltas against an earlier record of the same pack.
//!
//! Layout of `pack-<name>.pack`:
//!
//! ```text
//! "FXPK" | u32 version | u32 count
//! record*: u8 type | u8 kind | [32] id | [32] base id (delta only)
//!          | u64 object len | u32 stored len | zstd(payload or delta)
//! [32] SHA-256 of everything above
//! ```
//!
//! `pack-<name>.idx` holds the id → offset table sorted by id, followed by the
//! pack checksum. A pack only becomes visible once its index is renamed into
//! place, and it is never rewritten afterwards.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::io::Write;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use lru::LruCache;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::delta;
use crate::error::{FoxError, Result};
use crate::object::{ObjectId, ObjectKind};

/// Magic bytes opening a pack
pub const PACK_MAGIC: &[u8; 4] = b"FXPK";
/// Magic bytes opening a pack index
pub const INDEX_MAGIC: &[u8; 4] = b"FXIX";
/// Packfile version
pub const PACK_VERSION: u32 = 1;
/// Hard limit enforced while resolving; the builder caps chains well below it
pub const MAX_CHAIN_DEPTH: usize = 64;

const RECORD_FULL: u8 = 1;
const RECORD_DELTA: u8 = 2;
const HEADER_LEN: usize = 12;
const CHECKSUM_LEN: usize = 32;
/// Objects smaller than this are never delta candidates
const MIN_DELTA_SIZE: usize = 64;
const BASE_CACHE_SIZE: NonZeroUsize = match NonZeroUsize::new(64) {
    Some(n) => n,
    None => unreachable!(),
};

/// Tuning for pack building
#[derive(Debug, Clone)]
pub struct PackOptions {
    /// How many previously packed objects of the same kind to try as bases
    pub window: usize,
    /// Longest delta chain the builder may create
    pub max_depth: usize,
    /// zstd level for stored records
    pub compression_level: i32,
}

impl Default for PackOptions {
    fn default() -> Self {
        Self {
            window: 10,
            max_depth: 50,
            compression_level: 3,
        }
    }
}

/// Packfile index entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackEntry {
    pub object_id: ObjectId,
    pub offset: u64,
}

/// Packfile index
#[derive(Debug, Clone)]
pub struct PackIndex {
    /// Sorted by object id
    pub entries: Vec<PackEntry>,
    /// Checksum trailer of the matching pack
    pub checksum: [u8; 32],
}

impl PackIndex {
    pub fn find(&self, id: &ObjectId) -> Option<u64> {
        self.entries
            .binary_search_by(|e| e.object_id.cmp(id))
            .ok()
            .map(|i| self.entries[i].offset)
    }

    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.entries.len() * 40 + CHECKSUM_LEN);
        buf.extend_from_slice(INDEX_MAGIC);
        buf.extend_from_slice(&PACK_VERSION.to_le_bytes());
        buf.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());
        for entry in &self.entries {
            buf.extend_from_slice(entry.object_id.as_bytes());
            buf.extend_from_slice(&entry.offset.to_le_bytes());
        }
        buf.extend_from_slice(&self.checksum);
        buf
    }

    fn decode(path: &Path, data: &[u8]) -> Result<Self> {
        let corrupt = |reason: &str| FoxError::CorruptPack {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        };
        if data.len() < HEADER_LEN + CHECKSUM_LEN || &data[0..4] != INDEX_MAGIC {
            return Err(corrupt("bad index header"));
        }
        let mut cursor = Cursor::new(data, 4);
        let version = cursor.u32().ok_or_else(|| corrupt("truncated index"))?;
        if version != PACK_VERSION {
            return Err(corrupt(&format!("unknown index version {}", version)));
        }
        let count = cursor.u32().ok_or_else(|| corrupt("truncated index"))? as usize;
        if data.len() != HEADER_LEN + count * 40 + CHECKSUM_LEN {
            return Err(corrupt("index length does not match entry count"));
        }
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let object_id = cursor.id().ok_or_else(|| corrupt("truncated index entry"))?;
            let offset = cursor.u64().ok_or_else(|| corrupt("truncated index entry"))?;
            entries.push(PackEntry { object_id, offset });
        }
        if entries.windows(2).any(|w| w[0].object_id >= w[1].object_id) {
            return Err(corrupt("index entries are not sorted"));
        }
        let checksum = cursor.id().ok_or_else(|| corrupt("missing checksum"))?;
        Ok(Self {
            entries,
            checksum: *checksum.as_bytes(),
        })
    }
}

/// What went into a freshly written pack
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackStats {
    pub objects: usize,
    pub deltas: usize,
    pub raw_bytes: u64,
    pub pack_bytes: u64,
    pub longest_chain: usize,
}

/// A pack written to disk
#[derive(Debug, Clone)]
pub struct PackHandle {
    /// Hex name shared by the `.pack` and `.idx` files
    pub name: String,
    pub pack_path: PathBuf,
    pub index_path: PathBuf,
    pub stats: PackStats,
}

impl PackHandle {
    /// Remove both files; used when a freshly built pack fails verification
    pub fn discard(&self) -> Result<()> {
        for path in [&self.index_path, &self.pack_path] {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

/// `pack-<name>.pack` / `pack-<name>.idx`
pub fn pack_paths(dir: &Path, name: &str) -> (PathBuf, PathBuf) {
    (
        dir.join(format!("pack-{}.pack", name)),
        dir.join(format!("pack-{}.idx", name)),
    )
}

struct PendingObject {
    id: ObjectId,
    kind: ObjectKind,
    payload: Vec<u8>,
}

struct PlannedRecord {
    index: usize,
    base: Option<ObjectId>,
    data: Vec<u8>,
}

/// Packfile writer
pub struct PackWriter {
    objects: Vec<PendingObject>,
    seen: HashSet<ObjectId>,
    options: PackOptions,
}

impl PackWriter {
    /// Create a new packfile writer
    pub fn new(options: PackOptions) -> Self {
        Self {
            objects: Vec::new(),
            seen: HashSet::new(),
            options,
        }
    }

    /// Add object to pack; duplicates are ignored
    pub fn add_object(&mut self, id: ObjectId, kind: ObjectKind, payload: Vec<u8>) {
        if self.seen.insert(id) {
            self.objects.push(PendingObject { id, kind, payload });
        }
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Choose a base for every object. Objects are visited grouped by kind and
    /// in decreasing size, so each one is compared against slightly larger
    /// neighbours of the same kind that are already planned.
    fn plan(&self) -> (Vec<PlannedRecord>, usize) {
        let mut order: Vec<usize> = (0..self.objects.len()).collect();
        order.sort_by(|&a, &b| {
            let (oa, ob) = (&self.objects[a], &self.objects[b]);
            oa.kind
                .cmp(&ob.kind)
                .then(ob.payload.len().cmp(&oa.payload.len()))
                .then(oa.id.cmp(&ob.id))
        });

        let mut depth: HashMap<ObjectId, usize> = HashMap::new();
        let mut windows: HashMap<ObjectKind, VecDeque<usize>> = HashMap::new();
        let mut planned = Vec::with_capacity(order.len());
        let mut longest = 0;

        for idx in order {
            let object = &self.objects[idx];
            let window = windows.entry(object.kind).or_default();

            let mut best: Option<(usize, Vec<u8>)> = None;
            if object.payload.len() >= MIN_DELTA_SIZE && self.options.max_depth > 0 {
                for &candidate in window.iter().rev() {
                    let base = &self.objects[candidate];
                    if depth.get(&base.id).copied().unwrap_or(0) >= self.options.max_depth {
                        continue;
                    }
                    let (small, large) = if base.payload.len() < object.payload.len() {
                        (base.payload.len(), object.payload.len())
                    } else {
                        (object.payload.len(), base.payload.len())
                    };
                    if large > small * 2 {
                        continue;
                    }
                    let encoded = delta::encode(&base.payload, &object.payload);
                    if best.as_ref().is_none_or(|(_, d)| encoded.len() < d.len()) {
                        best = Some((candidate, encoded));
                    }
                }
            }

            let record = match best {
                Some((base_idx, encoded)) if encoded.len() < object.payload.len() / 2 => {
                    let base_id = self.objects[base_idx].id;
                    let d = depth.get(&base_id).copied().unwrap_or(0) + 1;
                    longest = longest.max(d);
                    depth.insert(object.id, d);
                    PlannedRecord {
                        index: idx,
                        base: Some(base_id),
                        data: encoded,
                    }
                }
                _ => {
                    depth.insert(object.id, 0);
                    PlannedRecord {
                        index: idx,
                        base: None,
                        data: object.payload.clone(),
                    }
                }
            };
            planned.push(record);

            window.push_back(idx);
            if window.len() > self.options.window {
                window.pop_front();
            }
        }
        (planned, longest)
    }

    /// Write the pack and its index into `dir`
    pub fn write(&self, dir: &Path) -> Result<PackHandle> {
        fs::create_dir_all(dir)?;

        let mut ids: Vec<ObjectId> = self.objects.iter().map(|o| o.id).collect();
        ids.sort();
        let mut hasher = Sha256::new();
        for id in &ids {
            hasher.update(id.as_bytes());
        }
        let name = hex::encode(hasher.finalize());
        let (pack_path, index_path) = pack_paths(dir, &name);

        let (planned, longest_chain) = self.plan();

        let mut buf = Vec::new();
        buf.extend_from_slice(PACK_MAGIC);
        buf.extend_from_slice(&PACK_VERSION.to_le_bytes());
        buf.extend_from_slice(&(planned.len() as u32).to_le_bytes());

        let mut stats = PackStats {
            objects: planned.len(),
            longest_chain,
            ..Default::default()
        };
        let mut entries = Vec::with_capacity(planned.len());

        for record in &planned {
            let object = &self.objects[record.index];
            entries.push(PackEntry {
                object_id: object.id,
                offset: buf.len() as u64,
            });

            let stored = zstd::encode_all(&record.data[..], self.options.compression_level)?;
            let stored_len = u32::try_from(stored.len()).map_err(|_| {
                FoxError::invalid(Some(object.id), "object too large for a pack record")
            })?;

            match record.base {
                Some(base) => {
                    buf.push(RECORD_DELTA);
                    buf.push(object.kind.to_u8());
                    buf.extend_from_slice(object.id.as_bytes());
                    buf.extend_from_slice(base.as_bytes());
                    stats.deltas += 1;
                }
                None => {
                    buf.push(RECORD_FULL);
                    buf.push(object.kind.to_u8());
                    buf.extend_from_slice(object.id.as_bytes());
                }
            }
            buf.extend_from_slice(&(object.payload.len() as u64).to_le_bytes());
            buf.extend_from_slice(&stored_len.to_le_bytes());
            buf.extend_from_slice(&stored);
            stats.raw_bytes += object.payload.len() as u64;
        }

        let checksum: [u8; 32] = Sha256::digest(&buf).into();
        buf.extend_from_slice(&checksum);
        stats.pack_bytes = buf.len() as u64;

        entries.sort_by(|a, b| a.object_id.cmp(&b.object_id));
        let index = PackIndex { entries, checksum };

        // Pack first, index second: readers discover packs through the index.
        write_atomic(&pack_path, &buf)?;
        write_atomic(&index_path, &index.encode())?;

        info!(
            "Wrote pack {} ({} objects, {} deltas, {} -> {} bytes)",
            &name[..12],
            stats.objects,
            stats.deltas,
            stats.raw_bytes,
            stats.pack_bytes
        );

        Ok(PackHandle {
            name,
            pack_path,
            index_path,
            stats,
        })
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let tmp_path = path.with_extension(format!("tmp-{}", std::process::id()));
    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8], pos: usize) -> Self {
        Self { data, pos }
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let slice = self.data.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u32(&mut self) -> Option<u32> {
        self.take(4).and_then(|b| b.try_into().ok()).map(u32::from_le_bytes)
    }

    fn u64(&mut self) -> Option<u64> {
        self.take(8).and_then(|b| b.try_into().ok()).map(u64::from_le_bytes)
    }

    fn id(&mut self) -> Option<ObjectId> {
        let bytes: [u8; 32] = self.take(32)?.try_into().ok()?;
        Some(ObjectId::new(bytes))
    }
}

struct Record<'a> {
    id: ObjectId,
    kind: ObjectKind,
    base: Option<ObjectId>,
    len: u64,
    stored: &'a [u8],
}

/// Packfile reader
pub struct PackReader {
    name: String,
    path: PathBuf,
    index: PackIndex,
    data: Vec<u8>,
    cache: Mutex<LruCache<ObjectId, Arc<Vec<u8>>>>,
}

impl std::fmt::Debug for PackReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackReader")
            .field("name", &self.name)
            .field("objects", &self.index.entries.len())
            .finish()
    }
}

impl PackReader {
    /// Open a pack through its index file
    pub fn open(index_path: &Path) -> Result<Self> {
        let index_data = fs::read(index_path)?;
        let index = PackIndex::decode(index_path, &index_data)?;

        let file_name = index_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let name = file_name
            .strip_prefix("pack-")
            .and_then(|n| n.strip_suffix(".idx"))
            .ok_or_else(|| FoxError::CorruptPack {
                path: index_path.to_path_buf(),
                reason: "index file name is not pack-<name>.idx".to_string(),
            })?
            .to_string();
        let path = index_path.with_extension("pack");
        let data = fs::read(&path)?;

        let corrupt = |reason: &str| FoxError::CorruptPack {
            path: path.clone(),
            reason: reason.to_string(),
        };
        if data.len() < HEADER_LEN + CHECKSUM_LEN || &data[0..4] != PACK_MAGIC {
            return Err(corrupt("bad pack header"));
        }
        let mut cursor = Cursor::new(&data, 4);
        let version = cursor.u32().ok_or_else(|| corrupt("truncated header"))?;
        if version != PACK_VERSION {
            return Err(corrupt(&format!("unknown pack version {}", version)));
        }
        let count = cursor.u32().ok_or_else(|| corrupt("truncated header"))? as usize;
        if count != index.entries.len() {
            return Err(corrupt("pack and index disagree on object count"));
        }
        let body_len = data.len() - CHECKSUM_LEN;
        let checksum: [u8; 32] = Sha256::digest(&data[..body_len]).into();
        if checksum[..] != data[body_len..] || checksum != index.checksum {
            return Err(corrupt("checksum mismatch"));
        }

        debug!("Opened pack {} ({} objects)", &name, count);
        Ok(Self {
            name,
            path,
            index,
            data,
            cache: Mutex::new(LruCache::new(BASE_CACHE_SIZE)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        self.index.find(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.index.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.entries.is_empty()
    }

    /// Size of the pack file in bytes
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    /// Get all object IDs
    pub fn object_ids(&self) -> Vec<ObjectId> {
        self.index.entries.iter().map(|e| e.object_id).collect()
    }

    fn corrupt(&self, reason: String) -> FoxError {
        FoxError::CorruptPack {
            path: self.path.clone(),
            reason,
        }
    }

    fn record_at(&self, offset: u64) -> Result<Record<'_>> {
        let body_len = self.data.len() - CHECKSUM_LEN;
        let offset = usize::try_from(offset)
            .ok()
            .filter(|o| *o >= HEADER_LEN && *o < body_len)
            .ok_or_else(|| self.corrupt(format!("record offset {} out of range", offset)))?;
        let mut cursor = Cursor::new(&self.data[..body_len], offset);
        let truncated = || self.corrupt(format!("truncated record at {}", offset));

        let record_type = cursor.u8().ok_or_else(truncated)?;
        let kind_tag = cursor.u8().ok_or_else(truncated)?;
        let kind = ObjectKind::from_u8(kind_tag)
            .ok_or_else(|| self.corrupt(format!("unknown object kind {}", kind_tag)))?;
        let id = cursor.id().ok_or_else(truncated)?;
        let base = match record_type {
            RECORD_FULL => None,
            RECORD_DELTA => Some(cursor.id().ok_or_else(truncated)?),
            other => return Err(self.corrupt(format!("unknown record type {}", other))),
        };
        let len = cursor.u64().ok_or_else(truncated)?;
        let stored_len = cursor.u32().ok_or_else(truncated)? as usize;
        let stored = cursor.take(stored_len).ok_or_else(truncated)?;
        Ok(Record {
            id,
            kind,
            base,
            len,
            stored,
        })
    }

    fn inflate(&self, record: &Record<'_>) -> Result<Vec<u8>> {
        zstd::decode_all(record.stored)
            .map_err(|e| self.corrupt(format!("failed to decompress {}: {}", record.id, e)))
    }

    /// Resolve an object, following its delta chain with an explicit bounded loop
    pub fn get(&self, id: &ObjectId) -> Result<Option<(ObjectKind, Vec<u8>)>> {
        let Some(offset) = self.index.find(id) else {
            return Ok(None);
        };

        let mut expected = *id;
        let mut offset = offset;
        let mut chain: Vec<(ObjectId, ObjectKind, u64, Vec<u8>)> = Vec::new();
        let mut kind_of_target = None;

        let mut payload: Arc<Vec<u8>> = loop {
            let record = self.record_at(offset)?;
            if record.id != expected {
                return Err(self.corrupt(format!(
                    "index points {} at a record for {}",
                    expected, record.id
                )));
            }
            kind_of_target.get_or_insert(record.kind);

            if let Some(cached) = self.cache_get(&record.id) {
                if chain.is_empty() {
                    return Ok(Some((record.kind, cached.as_ref().clone())));
                }
                break cached;
            }

            match record.base {
                None => {
                    let payload = self.inflate(&record)?;
                    if payload.len() as u64 != record.len {
                        return Err(self.corrupt(format!("length mismatch for {}", record.id)));
                    }
                    break Arc::new(payload);
                }
                Some(base) => {
                    if chain.len() >= MAX_CHAIN_DEPTH {
                        return Err(self.corrupt(format!(
                            "delta chain for {} exceeds {} links",
                            id, MAX_CHAIN_DEPTH
                        )));
                    }
                    let delta_bytes = self.inflate(&record)?;
                    chain.push((record.id, record.kind, record.len, delta_bytes));
                    expected = base;
                    offset = self.index.find(&base).ok_or_else(|| {
                        self.corrupt(format!("delta base {} of {} is not in the pack", base, record.id))
                    })?;
                }
            }
        };

        let Some(kind) = kind_of_target else {
            return Ok(None);
        };

        if !chain.is_empty() {
            self.cache_put(expected, payload.clone());
        }
        while let Some((link_id, _link_kind, len, delta_bytes)) = chain.pop() {
            let resolved = delta::apply(&payload, &delta_bytes)
                .map_err(|e| self.corrupt(format!("bad delta for {}: {}", link_id, e)))?;
            if resolved.len() as u64 != len {
                return Err(self.corrupt(format!("length mismatch for {}", link_id)));
            }
            payload = Arc::new(resolved);
            if !chain.is_empty() {
                self.cache_put(link_id, payload.clone());
            }
        }

        let payload = Arc::try_unwrap(payload).unwrap_or_else(|shared| shared.as_ref().clone());
        Ok(Some((kind, payload)))
    }

    fn cache_get(&self, id: &ObjectId) -> Option<Arc<Vec<u8>>> {
        let mut cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        cache.get(id).cloned()
    }

    fn cache_put(&self, id: ObjectId, payload: Arc<Vec<u8>>) {
        let mut cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        cache.put(id, payload);
    }

    /// Whether a stored record is a delta, and against which base
    pub fn delta_base(&self, id: &ObjectId) -> Result<Option<ObjectId>> {
        match self.index.find(id) {
            Some(offset) => Ok(self.record_at(offset)?.base),
            None => Ok(None),
        }
    }
}
