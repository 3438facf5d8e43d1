//! Garbage collection on real repositories.

use std::fs;

use foxnest_core::{Change, FoxError, ObjectKind, RepoConfig, Repository};
use tempfile::TempDir;

fn repo_with_history(tmp: &TempDir, commits: usize) -> Repository {
    let mut config = RepoConfig::for_client("gc", "tester");
    config.gc_threshold = 0;
    let repo = Repository::init(&tmp.path().join("repo"), config).unwrap();
    let mut body = String::new();
    for i in 0..commits {
        body.push_str(&format!("{:04} the same paragraph keeps growing a little each time\n", i));
        repo.commit(
            &[
                Change::Upsert {
                    path: "book/chapter.txt".into(),
                    content: body.clone().into_bytes(),
                    executable: false,
                },
                Change::Upsert {
                    path: format!("notes/{}.txt", i % 3),
                    content: format!("note revision {}", i).into_bytes(),
                    executable: false,
                },
            ],
            "tester",
            &format!("commit {}", i),
        )
        .unwrap();
    }
    repo
}

#[test]
fn test_gc_keeps_reachable_set_and_content() {
    let tmp = TempDir::new().unwrap();
    let repo = repo_with_history(&tmp, 25);
    let head = repo.head().unwrap().unwrap();
    let reachable = repo.odb().walk_reachable(&[head]).unwrap();
    let files = repo.files_at(&head).unwrap();

    let report = repo.gc().unwrap();
    assert_eq!(report.packed, reachable.len());
    assert!(report.deltas > 0);

    let after = repo.stats().unwrap();
    assert_eq!(after.storage.loose_objects, 0);
    assert_eq!(after.storage.packed_objects as usize, reachable.len());
    assert_eq!(repo.odb().walk_reachable(&[head]).unwrap(), reachable);
    assert_eq!(repo.files_at(&head).unwrap(), files);
    assert_eq!(repo.log(None).unwrap().len(), 25);

    let state = repo.state().unwrap();
    assert_eq!(state.commits_since_gc, 0);
    assert!(state.last_gc_at.is_some());
}

#[test]
fn test_repository_reopens_packed_objects() {
    let tmp = TempDir::new().unwrap();
    let path = {
        let repo = repo_with_history(&tmp, 6);
        repo.gc().unwrap();
        repo.path().to_path_buf()
    };
    let reopened = Repository::open(&path).unwrap();
    let head = reopened.head().unwrap().unwrap();
    assert!(reopened.read_file(&head, "book/chapter.txt").unwrap().starts_with(b"0000"));
}

#[test]
fn test_commits_after_gc_mix_loose_and_packed() {
    let tmp = TempDir::new().unwrap();
    let repo = repo_with_history(&tmp, 4);
    repo.gc().unwrap();

    let c = repo
        .commit(
            &[Change::Upsert {
                path: "book/chapter.txt".into(),
                content: b"rewritten".to_vec(),
                executable: false,
            }],
            "tester",
            "after gc",
        )
        .unwrap();
    assert_eq!(repo.read_file(&c, "book/chapter.txt").unwrap(), b"rewritten");
    assert!(repo.stats().unwrap().storage.loose_objects > 0);

    let second = repo.gc().unwrap();
    assert_eq!(second.packed, 4);
    assert_eq!(repo.stats().unwrap().storage.packs, 2);
}

#[test]
fn test_gc_verification_failure_is_not_destructive() {
    let tmp = TempDir::new().unwrap();
    let repo = repo_with_history(&tmp, 5);
    let loose_before = repo.odb().loose().list().unwrap();

    // Flip a byte inside a compressed loose blob.
    let head = repo.head().unwrap().unwrap();
    let blob = repo
        .files_at(&head)
        .unwrap()
        .into_iter()
        .find(|f| f.path == "book/chapter.txt")
        .unwrap()
        .id;
    let path = repo.odb().loose().object_path(&blob);
    let mut raw = fs::read(&path).unwrap();
    let middle = raw.len() / 2;
    raw[middle] ^= 0x5a;
    fs::write(&path, raw).unwrap();

    let err = repo.gc().unwrap_err();
    assert!(matches!(err, FoxError::CorruptionDetected(_)), "got {err}");
    assert_eq!(repo.odb().loose().list().unwrap(), loose_before);
    assert_eq!(repo.stats().unwrap().storage.packs, 0);
    assert_eq!(repo.state().unwrap().commits_since_gc, 5);
}

#[test]
fn test_gc_on_empty_repository() {
    let tmp = TempDir::new().unwrap();
    let repo = Repository::init(&tmp.path().join("repo"), RepoConfig::default()).unwrap();
    let report = repo.gc().unwrap();
    assert_eq!(report.packed, 0);
    assert!(report.pack.is_none());
}

#[test]
fn test_unreachable_objects_survive_gc() {
    let tmp = TempDir::new().unwrap();
    let repo = repo_with_history(&tmp, 2);
    let stray = repo.odb().put(ObjectKind::Blob, b"dangling").unwrap();
    repo.gc().unwrap();
    assert!(repo.odb().loose().contains(&stray));
    assert_eq!(repo.odb().get(&stray).unwrap().1, b"dangling");
}

#[test]
fn test_loose_copy_of_packed_object_is_retired_not_repacked() {
    let tmp = TempDir::new().unwrap();
    let repo = repo_with_history(&tmp, 3);
    let first = repo.gc().unwrap();
    let pack_name = first.pack.unwrap();

    // Bring one packed object back as a loose file
    let head = repo.head().unwrap().unwrap();
    let (kind, payload) = repo.odb().get(&head).unwrap();
    assert!(repo.odb().loose().write(&head, kind, &payload).unwrap());
    assert_eq!(repo.stats().unwrap().storage.loose_objects, 1);

    let second = repo.gc().unwrap();
    assert_eq!(second.packed, 0);
    assert_eq!(second.loose_removed, 1);
    assert!(second.pack.is_none());

    let storage = repo.stats().unwrap().storage;
    assert_eq!(storage.packs, 1);
    assert_eq!(storage.loose_objects, 0);
    assert_eq!(storage.packed_objects as usize, first.packed);
    assert!(fs::read_dir(repo.odb().pack_dir())
        .unwrap()
        .any(|e| e.unwrap().file_name().to_string_lossy().contains(&pack_name)));

    let reopened = Repository::open(repo.path()).unwrap();
    assert_eq!(reopened.log(None).unwrap().len(), 3);
    assert_eq!(reopened.odb().get(&head).unwrap(), (kind, payload));
}
