use std::fs;
use std::path::Path;
use std::process::Command;

use snapkeep::snapshot::{Entry, Payload, Snapshot, SnapshotRecord};
use snapkeep::{codec, hasher};
use snapkeep::{
    BackupOptions, Error, Passphrase, RestoreOptions, RunKind, SnapshotId, SnapshotKind,
    StorageMode, Vault, VaultConfig,
};

fn create_dir_tree(root: &Path, files: &[(&str, &[u8])]) {
    for (rel_path, content) in files {
        let full = root.join(rel_path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&full, content).unwrap();
    }
}

fn collect_dir_tree(root: &Path) -> Vec<(String, Vec<u8>)> {
    let mut entries = Vec::new();
    collect_recursive(root, root, &mut entries);
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    entries
}

fn collect_recursive(root: &Path, current: &Path, entries: &mut Vec<(String, Vec<u8>)>) {
    let mut dir_entries: Vec<_> = fs::read_dir(current).unwrap().collect::<Result<_, _>>().unwrap();
    dir_entries.sort_by_key(|e| e.file_name());

    for entry in dir_entries {
        let path = entry.path();
        let rel = path.strip_prefix(root).unwrap().to_str().unwrap().replace('\\', "/");

        if path.is_dir() {
            collect_recursive(root, &path, entries);
        } else {
            let content = fs::read(&path).unwrap();
            entries.push((rel, content));
        }
    }
}

fn test_vault(store: &Path) -> Vault {
    let config = VaultConfig {
        workers: 2,
        ..VaultConfig::default()
    };
    Vault::open(store, config).unwrap()
}

async fn backup(vault: &Vault, target: &Path) -> snapkeep::BackupReport {
    vault
        .run_backup(target, BackupOptions::default())
        .await
        .unwrap()
}

fn restore_options(snapshot: SnapshotId) -> RestoreOptions {
    RestoreOptions {
        snapshot: Some(snapshot),
        ..RestoreOptions::default()
    }
}

#[tokio::test]
async fn test_end_to_end_snapshot_cycle() {
    let store = tempfile::tempdir().unwrap();
    let target = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();
    let vault = test_vault(store.path());

    create_dir_tree(target.path(), &[("a.txt", b"hello"), ("b.txt", b"world")]);
    let s1 = backup(&vault, target.path()).await;
    assert_eq!(s1.kind, SnapshotKind::Full);
    assert_eq!(s1.stored, 2);

    create_dir_tree(target.path(), &[("a.txt", b"hello!"), ("c.txt", b"new")]);
    let s2 = backup(&vault, target.path()).await;
    assert_eq!(s2.kind, SnapshotKind::Incremental { parent: s1.id });

    // Only the changed files are carried, in the expected form.
    let repo = vault.repository(target.path()).unwrap();
    let record = repo.catalog().get(s2.id).cloned().unwrap();
    let snapshot = repo.load_snapshot(&record, None).unwrap();
    let modes: Vec<(&str, StorageMode)> = snapshot
        .entries
        .values()
        .map(|e| (e.path.as_str(), e.storage_mode()))
        .collect();
    assert_eq!(
        modes,
        vec![("a.txt", StorageMode::Delta), ("c.txt", StorageMode::Stored)]
    );

    let report = vault
        .run_restore(target.path(), dest.path(), restore_options(s2.id))
        .await
        .unwrap();
    assert!(report.is_clean());
    assert_eq!(report.restored, vec!["a.txt", "b.txt", "c.txt"]);
    assert_eq!(
        collect_dir_tree(dest.path()),
        vec![
            ("a.txt".to_string(), b"hello!".to_vec()),
            ("b.txt".to_string(), b"world".to_vec()),
            ("c.txt".to_string(), b"new".to_vec()),
        ]
    );

    // The older snapshot is still restorable on its own.
    let older = tempfile::tempdir().unwrap();
    vault
        .run_restore(target.path(), older.path(), restore_options(s1.id))
        .await
        .unwrap();
    assert_eq!(
        collect_dir_tree(older.path()),
        vec![
            ("a.txt".to_string(), b"hello".to_vec()),
            ("b.txt".to_string(), b"world".to_vec()),
        ]
    );
}

#[tokio::test]
async fn test_selective_restore() {
    let store = tempfile::tempdir().unwrap();
    let target = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();
    let vault = test_vault(store.path());

    create_dir_tree(
        target.path(),
        &[("a.txt", b"hello"), ("b.txt", b"world"), ("docs/guide.md", b"# guide")],
    );
    backup(&vault, target.path()).await;
    create_dir_tree(target.path(), &[("c.txt", b"new")]);
    let s2 = backup(&vault, target.path()).await;

    let options = RestoreOptions {
        filter: Some(vec!["c.txt".into(), "docs".into(), "missing.txt".into()]),
        ..restore_options(s2.id)
    };
    let report = vault
        .run_restore(target.path(), dest.path(), options)
        .await
        .unwrap();
    assert_eq!(report.restored, vec!["c.txt", "docs/guide.md"]);
    assert_eq!(report.unmatched, vec!["missing.txt"]);
    assert_eq!(
        collect_dir_tree(dest.path()),
        vec![
            ("c.txt".to_string(), b"new".to_vec()),
            ("docs/guide.md".to_string(), b"# guide".to_vec()),
        ]
    );
}

#[tokio::test]
async fn test_unchanged_tree_gives_empty_incremental() {
    let store = tempfile::tempdir().unwrap();
    let target = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();
    let vault = test_vault(store.path());

    create_dir_tree(
        target.path(),
        &[("one.bin", &[7u8; 10_000]), ("nested/two.txt", b"two")],
    );
    backup(&vault, target.path()).await;
    let s2 = backup(&vault, target.path()).await;
    assert_eq!(s2.unchanged, 2);
    assert_eq!(s2.stored + s2.deltas, 0);

    let records = vault.records(target.path()).unwrap();
    assert_eq!(records[1].entry_count, 0);

    vault
        .run_restore(target.path(), dest.path(), restore_options(s2.id))
        .await
        .unwrap();
    assert_eq!(collect_dir_tree(dest.path()), collect_dir_tree(target.path()));
}

#[tokio::test]
async fn test_large_edit_stored_as_small_delta() {
    let store = tempfile::tempdir().unwrap();
    let target = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();
    let vault = test_vault(store.path());

    let mut data: Vec<u8> = (0..200_000u32).map(|i| (i.wrapping_mul(2654435761) >> 13) as u8).collect();
    create_dir_tree(target.path(), &[("data.bin", &data)]);
    let s1 = backup(&vault, target.path()).await;

    data[100_000..100_016].copy_from_slice(b"patched in place");
    data.extend_from_slice(b"appended tail");
    create_dir_tree(target.path(), &[("data.bin", &data)]);
    let s2 = backup(&vault, target.path()).await;
    assert_eq!(s2.deltas, 1);
    assert!(s2.container_bytes < s1.container_bytes / 4);

    vault
        .run_restore(target.path(), dest.path(), restore_options(s2.id))
        .await
        .unwrap();
    assert_eq!(fs::read(dest.path().join("data.bin")).unwrap(), data);
}

#[tokio::test]
async fn test_deleted_files_not_resurrected() {
    let store = tempfile::tempdir().unwrap();
    let target = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();
    let vault = test_vault(store.path());

    create_dir_tree(target.path(), &[("keep.txt", b"keep"), ("gone/old.txt", b"old")]);
    backup(&vault, target.path()).await;
    fs::remove_dir_all(target.path().join("gone")).unwrap();
    let s2 = backup(&vault, target.path()).await;
    assert_eq!(s2.removed, 1);

    vault
        .run_restore(target.path(), dest.path(), RestoreOptions::default())
        .await
        .unwrap();
    assert_eq!(
        collect_dir_tree(dest.path()),
        vec![("keep.txt".to_string(), b"keep".to_vec())]
    );
}

#[tokio::test]
async fn test_missing_container_breaks_chain() {
    let store = tempfile::tempdir().unwrap();
    let target = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();
    let vault = test_vault(store.path());

    create_dir_tree(target.path(), &[("a.txt", b"v1")]);
    backup(&vault, target.path()).await;
    create_dir_tree(target.path(), &[("a.txt", b"v2")]);
    let s2 = backup(&vault, target.path()).await;
    create_dir_tree(target.path(), &[("a.txt", b"v3")]);
    let s3 = backup(&vault, target.path()).await;

    let repo = vault.repository(target.path()).unwrap();
    fs::remove_file(repo.container_path(s2.id)).unwrap();

    let result = vault
        .run_restore(target.path(), dest.path(), restore_options(s3.id))
        .await;
    assert!(matches!(result, Err(Error::BrokenChain { missing }) if missing == s2.id));
    assert!(collect_dir_tree(dest.path()).is_empty());
    assert!(!vault.verify(target.path(), s3.id).await.unwrap());

    // The next backup cannot build on the broken chain and starts over.
    let s4 = backup(&vault, target.path()).await;
    assert_eq!(s4.kind, SnapshotKind::Full);
    assert!(vault.verify(target.path(), s4.id).await.unwrap());
}

#[tokio::test]
async fn test_tampered_container_fails_verification() {
    let store = tempfile::tempdir().unwrap();
    let target = tempfile::tempdir().unwrap();
    let vault = test_vault(store.path());

    create_dir_tree(target.path(), &[("a.txt", b"hello"), ("b.txt", b"world")]);
    let s1 = backup(&vault, target.path()).await;
    assert!(vault.verify(target.path(), s1.id).await.unwrap());

    let path = vault.repository(target.path()).unwrap().container_path(s1.id);
    let mut bytes = fs::read(&path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0x01;
    fs::write(&path, &bytes).unwrap();

    assert!(!vault.verify(target.path(), s1.id).await.unwrap());
    let dest = tempfile::tempdir().unwrap();
    let result = vault
        .run_restore(target.path(), dest.path(), RestoreOptions::default())
        .await;
    assert!(matches!(result, Err(Error::ContainerChecksum { .. })));
}

#[tokio::test]
async fn test_encrypted_store_needs_right_passphrase() {
    let store = tempfile::tempdir().unwrap();
    let target = tempfile::tempdir().unwrap();
    create_dir_tree(target.path(), &[("secret.txt", b"attack at dawn")]);

    let vault = test_vault(store.path()).with_passphrase(Passphrase::new("correct horse").unwrap());
    let s1 = backup(&vault, target.path()).await;
    assert!(vault.records(target.path()).unwrap()[0].encrypted);

    let container = vault.repository(target.path()).unwrap().container_path(s1.id);
    let raw = fs::read(container).unwrap();
    assert!(!raw.windows(6).any(|w| w == b"attack"));

    let wrong = test_vault(store.path()).with_passphrase(Passphrase::new("battery staple").unwrap());
    let dest = tempfile::tempdir().unwrap();
    let result = wrong
        .run_restore(target.path(), dest.path(), RestoreOptions::default())
        .await;
    assert!(matches!(result, Err(Error::Authentication)));

    let keyless = test_vault(store.path());
    let result = keyless
        .run_restore(target.path(), dest.path(), RestoreOptions::default())
        .await;
    assert!(matches!(result, Err(Error::MissingKey)));

    let report = vault
        .run_restore(target.path(), dest.path(), RestoreOptions::default())
        .await
        .unwrap();
    assert_eq!(report.restored, vec!["secret.txt"]);
    assert_eq!(fs::read(dest.path().join("secret.txt")).unwrap(), b"attack at dawn");
}

#[tokio::test]
async fn test_prune_keeps_needed_ancestors() {
    let store = tempfile::tempdir().unwrap();
    let target = tempfile::tempdir().unwrap();
    let vault = test_vault(store.path());

    let mut ids = Vec::new();
    for (round, force_full) in [false, false, true, false].into_iter().enumerate() {
        create_dir_tree(target.path(), &[("log.txt", format!("round {round}").as_bytes())]);
        let options = BackupOptions {
            force_full,
            ..BackupOptions::default()
        };
        ids.push(vault.run_backup(target.path(), options).await.unwrap().id);
    }

    // Keeping the newest keeps its full parent too.
    let removed = vault.prune(target.path(), 1).unwrap();
    assert_eq!(removed, vec![ids[1], ids[0]]);
    let left: Vec<SnapshotId> = vault
        .list_snapshots(target.path())
        .unwrap()
        .iter()
        .map(|s| s.id)
        .collect();
    assert_eq!(left, vec![ids[2], ids[3]]);
    assert!(vault.verify(target.path(), ids[3]).await.unwrap());

    // Ids are never reused after removal.
    create_dir_tree(target.path(), &[("log.txt", b"round 4")]);
    let next = backup(&vault, target.path()).await;
    assert!(next.id > ids[3]);
}

#[tokio::test]
async fn test_concurrent_backup_is_busy() {
    let store = tempfile::tempdir().unwrap();
    let target = tempfile::tempdir().unwrap();
    let other = tempfile::tempdir().unwrap();
    let vault = test_vault(store.path());
    create_dir_tree(target.path(), &[("a.txt", b"a")]);
    create_dir_tree(other.path(), &[("b.txt", b"b")]);

    let repo = vault.repository(target.path()).unwrap();
    let held = repo.try_lock(RunKind::Backup).unwrap();
    let result = vault.run_backup(target.path(), BackupOptions::default()).await;
    assert!(matches!(result, Err(Error::Busy { run: RunKind::Backup, .. })));

    // Other targets are unaffected.
    backup(&vault, other.path()).await;
    drop(held);
    backup(&vault, target.path()).await;
}

#[tokio::test]
async fn test_overlapping_runs_on_one_target() {
    let store = tempfile::tempdir().unwrap();
    let target = tempfile::tempdir().unwrap();
    let vault = test_vault(store.path());
    create_dir_tree(target.path(), &[("a.txt", b"a"), ("b.txt", b"b")]);

    let (first, second) = tokio::join!(
        vault.run_backup(target.path(), BackupOptions::default()),
        vault.run_backup(target.path(), BackupOptions::default()),
    );
    let (report, busy) = match (first, second) {
        (Ok(report), Err(e)) | (Err(e), Ok(report)) => (report, e),
        other => panic!("expected exactly one backup to run: {other:?}"),
    };
    assert!(matches!(busy, Error::Busy { run: RunKind::Backup, .. }));
    assert_eq!(vault.list_snapshots(target.path()).unwrap().len(), 1);

    let one = tempfile::tempdir().unwrap();
    let two = tempfile::tempdir().unwrap();
    let (a, b) = tokio::join!(
        vault.run_restore(target.path(), one.path(), restore_options(report.id)),
        vault.run_restore(target.path(), two.path(), restore_options(report.id)),
    );
    let (restored, busy) = match (a, b) {
        (Ok(restored), Err(e)) | (Err(e), Ok(restored)) => (restored, e),
        other => panic!("expected exactly one restore to run: {other:?}"),
    };
    assert_eq!(restored.restored, vec!["a.txt", "b.txt"]);
    assert!(matches!(busy, Error::Busy { run: RunKind::Restore, .. }));
    let mut trees = [collect_dir_tree(one.path()), collect_dir_tree(two.path())];
    trees.sort_by_key(Vec::len);
    assert!(trees[0].is_empty());
    assert_eq!(trees[1].len(), 2);

    // A restore does not block a backup of the same target.
    let held = vault
        .repository(target.path())
        .unwrap()
        .try_lock(RunKind::Restore)
        .unwrap();
    backup(&vault, target.path()).await;
    drop(held);
}

/// Register a snapshot whose `bad.txt` entry claims a fingerprint its
/// content does not have.
fn register_corrupt_snapshot(vault: &Vault, target: &Path) -> SnapshotId {
    let repo = vault.repository(target).unwrap();
    let id = repo.catalog().next_id();
    let mut snapshot = Snapshot::new(id, SnapshotKind::Full);
    let entry = |path: &str, content: &[u8], claimed: &[u8]| Entry {
        path: path.to_string(),
        size: content.len() as u64,
        mode: 0o644,
        fingerprint: hasher::fingerprint(claimed),
        payload: Payload::Stored(content.to_vec()),
    };
    snapshot.insert(entry("bad.txt", b"bad!", b"something else"));
    snapshot.insert(entry("good.txt", b"good", b"good"));
    snapshot.insert(entry("sub/fine.txt", b"fine", b"fine"));

    let bytes = codec::encode(&snapshot, None, 3).unwrap();
    repo.write_container(id, &bytes).unwrap();
    repo.catalog()
        .append(SnapshotRecord {
            id,
            timestamp: snapshot.timestamp,
            kind: snapshot.kind,
            label: None,
            verified: true,
            encrypted: false,
            checksum: hasher::fingerprint(&bytes),
            entry_count: snapshot.entries.len(),
            removed_count: 0,
            stored_bytes: bytes.len() as u64,
            source_bytes: snapshot.source_bytes(),
        })
        .unwrap();
    id
}

#[tokio::test]
async fn test_corrupt_file_skipped_or_aborts_restore() {
    let store = tempfile::tempdir().unwrap();
    let target = tempfile::tempdir().unwrap();
    let vault = test_vault(store.path());
    let id = register_corrupt_snapshot(&vault, target.path());

    let dest = tempfile::tempdir().unwrap();
    let report = vault
        .run_restore(target.path(), dest.path(), restore_options(id))
        .await
        .unwrap();
    assert!(report.complete);
    assert!(!report.is_clean());
    assert_eq!(report.restored, vec!["good.txt", "sub/fine.txt"]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].path, "bad.txt");
    assert!(matches!(report.failed[0].error, Error::Integrity { .. }));
    assert_eq!(
        collect_dir_tree(dest.path()),
        vec![
            ("good.txt".to_string(), b"good".to_vec()),
            ("sub/fine.txt".to_string(), b"fine".to_vec()),
        ]
    );

    let strict = tempfile::tempdir().unwrap();
    let options = RestoreOptions {
        all_or_nothing: Some(true),
        ..restore_options(id)
    };
    let result = vault.run_restore(target.path(), strict.path(), options).await;
    assert!(matches!(result, Err(Error::Integrity { ref path, .. }) if path == "bad.txt"));
    assert!(collect_dir_tree(strict.path()).is_empty());
    assert!(!vault.verify(target.path(), id).await.unwrap());
}

#[tokio::test]
async fn test_cancelled_restore_is_incomplete() {
    let store = tempfile::tempdir().unwrap();
    let target = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();
    let vault = test_vault(store.path());
    create_dir_tree(target.path(), &[("a.txt", b"v1"), ("b.txt", b"b")]);
    let s1 = backup(&vault, target.path()).await;
    vault
        .run_restore(target.path(), dest.path(), restore_options(s1.id))
        .await
        .unwrap();

    create_dir_tree(target.path(), &[("a.txt", b"v2")]);
    let s2 = backup(&vault, target.path()).await;
    let options = restore_options(s2.id);
    options.cancel.cancel();
    let report = vault
        .run_restore(target.path(), dest.path(), options)
        .await
        .unwrap();
    assert!(!report.complete);
    assert!(!report.is_clean());
    assert!(report.restored.is_empty());
    assert!(report.failed.is_empty());
    // Files from the earlier restore are left as they were.
    assert_eq!(
        collect_dir_tree(dest.path()),
        vec![
            ("a.txt".to_string(), b"v1".to_vec()),
            ("b.txt".to_string(), b"b".to_vec()),
        ]
    );

    let options = RestoreOptions {
        all_or_nothing: Some(true),
        ..restore_options(s2.id)
    };
    options.cancel.cancel();
    let result = vault.run_restore(target.path(), dest.path(), options).await;
    assert!(matches!(result, Err(Error::Cancelled)));
}

#[tokio::test]
async fn test_store_inside_target_is_skipped() {
    let target = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();
    create_dir_tree(target.path(), &[("a.txt", b"a"), ("docs/b.txt", b"b")]);
    let vault = test_vault(&target.path().join(".snapkeep"));

    let s1 = backup(&vault, target.path()).await;
    assert_eq!(s1.files_scanned, 2);
    assert_eq!(s1.scanned_bytes, 2);
    let s2 = backup(&vault, target.path()).await;
    assert_eq!(s2.files_scanned, 2);
    assert_eq!(s2.unchanged, 2);
    assert_eq!(s2.stored + s2.deltas, 0);

    vault
        .run_restore(target.path(), dest.path(), restore_options(s2.id))
        .await
        .unwrap();
    assert_eq!(
        collect_dir_tree(dest.path()),
        vec![
            ("a.txt".to_string(), b"a".to_vec()),
            ("docs/b.txt".to_string(), b"b".to_vec()),
        ]
    );
}

#[cfg(unix)]
#[tokio::test]
async fn test_colon_and_backslash_names_round_trip() {
    let store = tempfile::tempdir().unwrap();
    let target = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();
    let vault = test_vault(store.path());
    create_dir_tree(
        target.path(),
        &[
            ("1:00.log", b"one"),
            ("C:notes", b"notes"),
            ("logs/12:30:00.txt", b"half past"),
            ("a\\b", b"backslash"),
        ],
    );

    let s1 = backup(&vault, target.path()).await;
    assert_eq!(s1.files_scanned, 4);
    let report = vault
        .run_restore(target.path(), dest.path(), restore_options(s1.id))
        .await
        .unwrap();
    assert!(report.is_clean());
    assert!(report.restored.contains(&"a\\b".to_string()));
    assert_eq!(fs::read(dest.path().join("a\\b")).unwrap(), b"backslash");
    assert_eq!(fs::read(dest.path().join("1:00.log")).unwrap(), b"one");
    assert_eq!(fs::read(dest.path().join("C:notes")).unwrap(), b"notes");
    assert_eq!(
        fs::read(dest.path().join("logs").join("12:30:00.txt")).unwrap(),
        b"half past"
    );
}

#[cfg(unix)]
#[tokio::test]
async fn test_file_modes_restored() {
    use std::os::unix::fs::PermissionsExt;

    let store = tempfile::tempdir().unwrap();
    let target = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();
    let vault = test_vault(store.path());

    create_dir_tree(target.path(), &[("run.sh", b"#!/bin/sh\necho hi\n")]);
    let script = target.path().join("run.sh");
    fs::set_permissions(&script, fs::Permissions::from_mode(0o644)).unwrap();
    backup(&vault, target.path()).await;

    // A mode-only change still produces an entry.
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
    let s2 = backup(&vault, target.path()).await;
    assert_eq!(s2.unchanged, 0);

    vault
        .run_restore(target.path(), dest.path(), RestoreOptions::default())
        .await
        .unwrap();
    let mode = fs::metadata(dest.path().join("run.sh")).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o755);
}

#[test]
fn test_cli_backup_list_restore() {
    let store = tempfile::tempdir().unwrap();
    let target = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();
    create_dir_tree(target.path(), &[("readme.txt", b"v1"), ("src/lib.rs", b"pub fn x() {}")]);

    let run = |args: &[&str]| {
        let output = Command::new(env!("CARGO_BIN_EXE_snapkeep"))
            .arg("--store")
            .arg(store.path())
            .args(args)
            .env_remove("SNAPKEEP_PASSPHRASE")
            .env_remove("SNAPKEEP_STORE")
            .output()
            .expect("failed to run snapkeep");
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        assert!(
            output.status.success(),
            "snapkeep {args:?} failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        stdout
    };

    let target_arg = target.path().to_str().unwrap();
    let out = run(&["backup", target_arg, "--label", "first"]);
    assert!(out.contains("Snapshot 00000001 registered"), "{out}");

    fs::write(target.path().join("readme.txt"), "v2").unwrap();
    run(&["backup", target_arg]);

    let listing = run(&["list", target_arg]);
    assert!(listing.contains("00000001"));
    assert!(listing.contains("00000002"));
    assert!(listing.contains("[first]"));

    run(&["verify", target_arg]);
    run(&["restore", target_arg, dest.path().to_str().unwrap(), "--snapshot", "1"]);
    assert_eq!(
        collect_dir_tree(dest.path()),
        vec![
            ("readme.txt".to_string(), b"v1".to_vec()),
            ("src/lib.rs".to_string(), b"pub fn x() {}".to_vec()),
        ]
    );
}
