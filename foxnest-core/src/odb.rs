//! Object database: loose objects plus read-only packs
//!
//! Lookups consult the loose store first and fall back to the pack indices.
//! Packs written by another process (for example a gc) are picked up by
//! rescanning the pack directory on a miss.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{FoxError, Result};
use crate::loose::LooseStore;
use crate::object::{payload_references, Commit, Object, ObjectId, ObjectKind, Tree};
use crate::packfile::{PackHandle, PackReader};

/// Storage breakdown of one object database
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageStats {
    pub loose_objects: u64,
    pub loose_bytes: u64,
    pub packs: u64,
    pub packed_objects: u64,
    pub pack_bytes: u64,
}

impl StorageStats {
    pub fn total_bytes(&self) -> u64 {
        self.loose_bytes + self.pack_bytes
    }
}

/// Content-addressed object database rooted at `<repo>/objects`
pub struct ObjectDatabase {
    loose: LooseStore,
    pack_dir: PathBuf,
    packs: RwLock<Vec<Arc<PackReader>>>,
}

impl std::fmt::Debug for ObjectDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectDatabase")
            .field("pack_dir", &self.pack_dir)
            .finish()
    }
}

impl ObjectDatabase {
    pub fn open(objects_dir: &Path, compression_level: i32) -> Result<Self> {
        let loose = LooseStore::open(objects_dir, compression_level)?;
        let pack_dir = objects_dir.join("pack");
        fs::create_dir_all(&pack_dir)?;
        let odb = Self {
            loose,
            pack_dir,
            packs: RwLock::new(Vec::new()),
        };
        odb.reload_packs()?;
        Ok(odb)
    }

    pub fn loose(&self) -> &LooseStore {
        &self.loose
    }

    pub fn pack_dir(&self) -> &Path {
        &self.pack_dir
    }

    pub fn packs(&self) -> Vec<Arc<PackReader>> {
        self.packs.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn index_files(&self) -> Result<Vec<PathBuf>> {
        let mut found = Vec::new();
        for entry in fs::read_dir(&self.pack_dir)? {
            let path = entry?.path();
            let is_index = path.extension().is_some_and(|e| e == "idx")
                && path
                    .file_name()
                    .is_some_and(|n| n.to_string_lossy().starts_with("pack-"));
            if is_index {
                found.push(path);
            }
        }
        found.sort();
        Ok(found)
    }

    /// Open packs that appeared since the last scan. Returns how many were added.
    pub fn reload_packs(&self) -> Result<usize> {
        let index_files = self.index_files()?;
        let mut packs = self.packs.write().unwrap_or_else(|p| p.into_inner());
        let known: HashSet<String> = packs.iter().map(|p| p.name().to_string()).collect();

        let mut added = 0;
        for index_path in index_files {
            let name = index_path
                .file_stem()
                .map(|s| s.to_string_lossy().trim_start_matches("pack-").to_string())
                .unwrap_or_default();
            if known.contains(&name) {
                continue;
            }
            packs.push(Arc::new(PackReader::open(&index_path)?));
            added += 1;
        }
        if added > 0 {
            debug!("Loaded {} new pack(s) from {:?}", added, self.pack_dir);
        }
        Ok(added)
    }

    /// Make a pack written by this process visible without a rescan
    pub fn install_pack(&self, handle: &PackHandle) -> Result<Arc<PackReader>> {
        let reader = Arc::new(PackReader::open(&handle.index_path)?);
        let mut packs = self.packs.write().unwrap_or_else(|p| p.into_inner());
        packs.retain(|p| p.name() != reader.name());
        packs.push(reader.clone());
        Ok(reader)
    }

    fn packed(&self, id: &ObjectId) -> Result<Option<(ObjectKind, Vec<u8>)>> {
        for pack in self.packs() {
            if let Some(found) = pack.get(id)? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    pub(crate) fn in_pack(&self, id: &ObjectId) -> bool {
        self.packs().iter().any(|p| p.contains(id))
    }

    /// Store an object, returning its identity. Idempotent.
    pub fn put(&self, kind: ObjectKind, payload: &[u8]) -> Result<ObjectId> {
        let id = ObjectId::compute(kind, payload);
        if self.loose.contains(&id) || self.in_pack(&id) {
            return Ok(id);
        }
        self.loose.write(&id, kind, payload)?;
        Ok(id)
    }

    pub fn put_object(&self, object: &Object) -> Result<ObjectId> {
        self.put(object.kind(), &object.to_payload()?)
    }

    /// Fetch an object, or `None` if neither loose nor packed
    pub fn try_get(&self, id: &ObjectId) -> Result<Option<(ObjectKind, Vec<u8>)>> {
        if let Some(found) = self.loose.read(id)? {
            return Ok(Some(found));
        }
        if let Some(found) = self.packed(id)? {
            return Ok(Some(found));
        }
        // A concurrent gc may have moved it from loose into a new pack.
        if self.reload_packs()? > 0 {
            return self.packed(id);
        }
        if let Some(found) = self.loose.read(id)? {
            return Ok(Some(found));
        }
        Ok(None)
    }

    pub fn get(&self, id: &ObjectId) -> Result<(ObjectKind, Vec<u8>)> {
        self.try_get(id)?.ok_or(FoxError::ObjectNotFound(*id))
    }

    pub fn has(&self, id: &ObjectId) -> Result<bool> {
        if self.loose.contains(id) || self.in_pack(id) {
            return Ok(true);
        }
        Ok(self.reload_packs()? > 0 && self.in_pack(id))
    }

    pub fn get_object(&self, id: &ObjectId) -> Result<Object> {
        let (kind, payload) = self.get(id)?;
        Object::decode(kind, &payload)
    }

    fn expect_kind(&self, id: &ObjectId, expected: ObjectKind) -> Result<Vec<u8>> {
        let (kind, payload) = self.get(id)?;
        if kind != expected {
            return Err(FoxError::invalid(
                Some(*id),
                format!("expected {} {}, found {}", expected, id.short(), kind),
            ));
        }
        Ok(payload)
    }

    pub fn get_commit(&self, id: &ObjectId) -> Result<Commit> {
        Commit::from_payload(&self.expect_kind(id, ObjectKind::Commit)?)
    }

    pub fn get_tree(&self, id: &ObjectId) -> Result<Tree> {
        Tree::from_payload(&self.expect_kind(id, ObjectKind::Tree)?)
    }

    pub fn get_blob(&self, id: &ObjectId) -> Result<Vec<u8>> {
        self.expect_kind(id, ObjectKind::Blob)
    }

    /// Every object reachable from `roots` through commit parents, commit
    /// trees and tree entries. Iterative with a visited set, so a corrupt
    /// store containing a cycle still terminates.
    pub fn walk_reachable(&self, roots: &[ObjectId]) -> Result<HashSet<ObjectId>> {
        let mut visited = HashSet::new();
        let mut stack: Vec<(ObjectId, Option<ObjectKind>)> =
            roots.iter().map(|id| (*id, None)).collect();

        while let Some((id, hint)) = stack.pop() {
            if !visited.insert(id) {
                continue;
            }
            if hint == Some(ObjectKind::Blob) {
                if !self.has(&id)? {
                    return Err(FoxError::ObjectNotFound(id));
                }
                continue;
            }
            for (child, kind) in self.children(&id)? {
                if !visited.contains(&child) {
                    stack.push((child, kind));
                }
            }
        }
        Ok(visited)
    }

    /// References of an object together with the kind the referrer declares
    fn children(&self, id: &ObjectId) -> Result<Vec<(ObjectId, Option<ObjectKind>)>> {
        let (kind, payload) = self.get(id)?;
        Ok(match Object::decode(kind, &payload)? {
            Object::Blob(_) => Vec::new(),
            Object::Tree(tree) => tree.iter().map(|e| (e.id, Some(e.kind))).collect(),
            Object::Commit(commit) => {
                let mut refs = vec![(commit.tree, Some(ObjectKind::Tree))];
                refs.extend(commit.parent.map(|p| (p, Some(ObjectKind::Commit))));
                refs
            }
        })
    }

    /// Objects reachable from `head` but not from `exclude`, ordered so that
    /// every object comes after everything it references.
    pub fn transfer_order(&self, head: &ObjectId, exclude: Option<&ObjectId>) -> Result<Vec<ObjectId>> {
        let excluded = match exclude {
            Some(base) => self.walk_reachable(&[*base])?,
            None => HashSet::new(),
        };

        let mut order = Vec::new();
        let mut visited = HashSet::new();
        let mut stack: Vec<(ObjectId, Option<ObjectKind>, bool)> = vec![(*head, None, false)];

        while let Some((id, hint, expanded)) = stack.pop() {
            if expanded {
                order.push(id);
                continue;
            }
            if excluded.contains(&id) || !visited.insert(id) {
                continue;
            }
            stack.push((id, hint, true));
            if hint == Some(ObjectKind::Blob) {
                continue;
            }
            let mut children = self.children(&id)?;
            children.reverse();
            for (child, kind) in children {
                if !excluded.contains(&child) && !visited.contains(&child) {
                    stack.push((child, kind, false));
                }
            }
        }
        Ok(order)
    }

    /// Check that every object in a stream only references objects that are
    /// already stored or appear earlier in the stream.
    pub fn check_dependency_order(&self, objects: &[(ObjectId, ObjectKind, &[u8])]) -> Result<()> {
        check_stream_order(objects, |id| self.has(id))
    }

    pub fn stats(&self) -> Result<StorageStats> {
        let (loose_objects, loose_bytes) = self.loose.usage()?;
        let mut stats = StorageStats {
            loose_objects,
            loose_bytes,
            ..Default::default()
        };
        for pack in self.packs() {
            stats.packs += 1;
            stats.packed_objects += pack.len() as u64;
            stats.pack_bytes += pack.size();
        }
        Ok(stats)
    }

    /// Delete a loose copy that is known to be packed
    pub fn retire_loose(&self, id: &ObjectId) -> Result<bool> {
        if !self.in_pack(id) {
            warn!("Refusing to delete loose {}: not present in any pack", id.short());
            return Ok(false);
        }
        self.loose.remove(id)
    }
}

/// Dependency order of a stream on its own. `stored` answers for
/// references that do not appear earlier in the stream.
pub(crate) fn check_stream_order(
    objects: &[(ObjectId, ObjectKind, &[u8])],
    stored: impl Fn(&ObjectId) -> Result<bool>,
) -> Result<()> {
    let mut seen: HashMap<ObjectId, ObjectKind> = HashMap::with_capacity(objects.len());
    for (id, kind, payload) in objects {
        for dependency in payload_references(*kind, payload)? {
            if !seen.contains_key(&dependency) && !stored(&dependency)? {
                return Err(FoxError::IncompleteTransfer {
                    object: *id,
                    dependency,
                });
            }
        }
        seen.insert(*id, *kind);
    }
    Ok(())
}
