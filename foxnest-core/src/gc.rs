//! Garbage collection
//!
//! Compacts reachable loose objects into a new pack and removes the loose
//! copies, but only after every packed object has been resolved and checked
//! against its identity. A failed check leaves the store exactly as it was.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::error::{FoxError, Result};
use crate::object::{ObjectId, ObjectKind};
use crate::odb::ObjectDatabase;
use crate::packfile::{PackHandle, PackOptions, PackReader, PackWriter};

/// Collector state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcState {
    Idle,
    Compacting,
}

/// Outcome of one gc cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcReport {
    /// Objects reachable from the roots
    pub reachable: usize,
    /// Loose objects written into the new pack
    pub packed: usize,
    /// How many of those were stored as deltas
    pub deltas: usize,
    /// Loose copies deleted after verification
    pub loose_removed: usize,
    /// Name of the new pack, if one was written
    pub pack: Option<String>,
    pub bytes_before: u64,
    pub bytes_after: u64,
    pub elapsed_ms: u64,
}

pub struct GarbageCollector<'a> {
    odb: &'a ObjectDatabase,
    options: PackOptions,
    state: GcState,
}

impl<'a> GarbageCollector<'a> {
    pub fn new(odb: &'a ObjectDatabase, options: PackOptions) -> Self {
        Self {
            odb,
            options,
            state: GcState::Idle,
        }
    }

    pub fn state(&self) -> GcState {
        self.state
    }

    /// Run one cycle over everything reachable from `roots`
    pub fn run(&mut self, roots: &[ObjectId]) -> Result<GcReport> {
        self.state = GcState::Compacting;
        let result = self.compact(roots);
        self.state = GcState::Idle;
        result
    }

    fn compact(&self, roots: &[ObjectId]) -> Result<GcReport> {
        let started = Instant::now();
        let bytes_before = self.odb.stats()?.total_bytes();

        let reachable = self.odb.walk_reachable(roots)?;
        // A loose copy of an already packed object is only retired; packing it
        // again would rewrite the pack that holds it.
        let (already_packed, mut candidates): (Vec<ObjectId>, Vec<ObjectId>) = self
            .odb
            .loose()
            .list()?
            .into_iter()
            .filter(|id| reachable.contains(id))
            .partition(|id| self.odb.in_pack(id));
        candidates.sort();

        let mut report = GcReport {
            reachable: reachable.len(),
            bytes_before,
            bytes_after: bytes_before,
            ..Default::default()
        };
        for id in &already_packed {
            if self.odb.retire_loose(id)? {
                report.loose_removed += 1;
            }
        }
        if candidates.is_empty() {
            info!(
                "gc: nothing to pack ({} reachable objects, {} duplicate loose copies removed)",
                reachable.len(),
                report.loose_removed
            );
            report.bytes_after = self.odb.stats()?.total_bytes();
            report.elapsed_ms = started.elapsed().as_millis() as u64;
            return Ok(report);
        }

        let mut originals: Vec<(ObjectId, ObjectKind, Vec<u8>)> = Vec::with_capacity(candidates.len());
        let mut writer = PackWriter::new(self.options.clone());
        for id in &candidates {
            let (kind, payload) = self.read_loose_checked(id)?;
            writer.add_object(*id, kind, payload.clone());
            originals.push((*id, kind, payload));
        }

        let handle = writer.write(self.odb.pack_dir())?;
        if let Err(e) = self.verify(&handle, &originals) {
            error!("gc: verification of pack {} failed: {}", handle.name, e);
            handle.discard()?;
            return Err(match e {
                FoxError::CorruptionDetected(_) => e,
                other => FoxError::CorruptionDetected(other.to_string()),
            });
        }

        self.odb.install_pack(&handle)?;
        for (id, _, _) in &originals {
            if self.odb.retire_loose(id)? {
                report.loose_removed += 1;
            }
        }

        report.packed = handle.stats.objects;
        report.deltas = handle.stats.deltas;
        report.pack = Some(handle.name.clone());
        report.bytes_after = self.odb.stats()?.total_bytes();
        report.elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            "gc: packed {} objects ({} deltas), removed {} loose, {} -> {} bytes",
            report.packed, report.deltas, report.loose_removed, report.bytes_before, report.bytes_after
        );
        Ok(report)
    }

    fn read_loose_checked(&self, id: &ObjectId) -> Result<(ObjectKind, Vec<u8>)> {
        let (kind, payload) = match self.odb.loose().read(id) {
            Ok(Some(found)) => found,
            Ok(None) => return Err(FoxError::ObjectNotFound(*id)),
            Err(e) => {
                return Err(FoxError::CorruptionDetected(format!(
                    "loose object {} is unreadable: {}",
                    id, e
                )))
            }
        };
        let actual = ObjectId::compute(kind, &payload);
        if actual != *id {
            return Err(FoxError::CorruptionDetected(format!(
                "loose object {} hashes to {}",
                id, actual
            )));
        }
        Ok((kind, payload))
    }

    /// Resolve every object from the pack on disk and compare it with the
    /// loose original.
    fn verify(&self, handle: &PackHandle, originals: &[(ObjectId, ObjectKind, Vec<u8>)]) -> Result<()> {
        let reader = PackReader::open(&handle.index_path)?;
        if reader.len() != originals.len() {
            return Err(FoxError::CorruptionDetected(format!(
                "pack holds {} objects, expected {}",
                reader.len(),
                originals.len()
            )));
        }
        for (id, kind, payload) in originals {
            let Some((packed_kind, packed)) = reader.get(id)? else {
                return Err(FoxError::CorruptionDetected(format!("{} missing from pack", id)));
            };
            if packed_kind != *kind || packed != *payload || ObjectId::compute(packed_kind, &packed) != *id {
                return Err(FoxError::CorruptionDetected(format!(
                    "{} does not resolve to its original payload",
                    id
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{encode_with_header, Commit, Object, Tree, TreeEntry, MODE_FILE};
    use std::fs;
    use tempfile::TempDir;

    fn commit_file(odb: &ObjectDatabase, content: &[u8], parent: Option<ObjectId>) -> ObjectId {
        let blob = odb.put(ObjectKind::Blob, content).unwrap();
        let mut tree = Tree::new();
        tree.insert(TreeEntry::new("notes.txt".into(), blob, ObjectKind::Blob, MODE_FILE));
        let tree_id = odb.put_object(&Object::Tree(tree)).unwrap();
        let commit = Commit::new(tree_id, parent, "gc".into(), 0, "update".into());
        odb.put_object(&Object::Commit(commit)).unwrap()
    }

    fn history(odb: &ObjectDatabase, n: usize) -> ObjectId {
        let mut text = String::new();
        let mut head = None;
        for i in 0..n {
            text.push_str(&format!("entry {}: some reasonably long line of notes\n", i));
            head = Some(commit_file(odb, text.as_bytes(), head));
        }
        head.unwrap()
    }

    #[test]
    fn test_gc_preserves_reachable_set() {
        let tmp = TempDir::new().unwrap();
        let odb = ObjectDatabase::open(&tmp.path().join("objects"), 3).unwrap();
        let head = history(&odb, 15);
        let before = odb.walk_reachable(&[head]).unwrap();

        let mut gc = GarbageCollector::new(&odb, PackOptions::default());
        let report = gc.run(&[head]).unwrap();
        assert_eq!(gc.state(), GcState::Idle);
        assert_eq!(report.packed, before.len());
        assert_eq!(report.loose_removed, before.len());
        assert!(report.deltas > 0);

        assert_eq!(odb.walk_reachable(&[head]).unwrap(), before);
        assert_eq!(odb.stats().unwrap().loose_objects, 0);
        for id in &before {
            let (kind, payload) = odb.get(id).unwrap();
            assert_eq!(ObjectId::compute(kind, &payload), *id);
        }
    }

    #[test]
    fn test_gc_leaves_unreachable_loose_objects() {
        let tmp = TempDir::new().unwrap();
        let odb = ObjectDatabase::open(&tmp.path().join("objects"), 3).unwrap();
        let head = history(&odb, 3);
        let stray = odb.put(ObjectKind::Blob, b"not referenced by any commit").unwrap();

        GarbageCollector::new(&odb, PackOptions::default()).run(&[head]).unwrap();
        assert!(odb.loose().contains(&stray));
    }

    #[test]
    fn test_gc_with_nothing_loose_is_a_noop() {
        let tmp = TempDir::new().unwrap();
        let odb = ObjectDatabase::open(&tmp.path().join("objects"), 3).unwrap();
        let head = history(&odb, 2);
        let mut gc = GarbageCollector::new(&odb, PackOptions::default());
        gc.run(&[head]).unwrap();

        let second = gc.run(&[head]).unwrap();
        assert_eq!(second.packed, 0);
        assert!(second.pack.is_none());
        assert_eq!(odb.stats().unwrap().packs, 1);
    }

    #[test]
    fn test_gc_aborts_on_corrupt_loose_object() {
        let tmp = TempDir::new().unwrap();
        let odb = ObjectDatabase::open(&tmp.path().join("objects"), 3).unwrap();
        let head = history(&odb, 4);
        let loose_before = odb.loose().list().unwrap();

        // Replace a blob's file with a valid encoding of different content.
        let commit = odb.get_commit(&head).unwrap();
        let tree = odb.get_tree(&commit.tree).unwrap();
        let blob = tree.get("notes.txt").unwrap().id;
        let path = odb.loose().object_path(&blob);
        let forged = encode_with_header(ObjectKind::Blob, b"forged");
        fs::write(&path, zstd::encode_all(&forged[..], 3).unwrap()).unwrap();

        let mut gc = GarbageCollector::new(&odb, PackOptions::default());
        let err = gc.run(&[head]).unwrap_err();
        assert!(matches!(err, FoxError::CorruptionDetected(_)));
        assert_eq!(gc.state(), GcState::Idle);

        assert_eq!(odb.loose().list().unwrap(), loose_before);
        assert_eq!(odb.stats().unwrap().packs, 0);
        assert_eq!(fs::read_dir(odb.pack_dir()).unwrap().count(), 0);
    }
}
