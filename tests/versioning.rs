mod common;

use std::path::Path;

use common::Fixture;
use revisionfs::error::FsError;

#[tokio::test]
async fn repeated_writes_accumulate_revisions_on_disk() {
    let fx = Fixture::new();
    for _ in 0..3 {
        let rev = fx.engine.resolve_for_write(Path::new("/doc")).await.unwrap();
        tokio::fs::write(&rev, b"x").await.unwrap();
    }
    let vdir = fx.version_dir("/doc");
    let mut read_dir = tokio::fs::read_dir(&vdir).await.unwrap();
    let mut names = Vec::new();
    while let Some(e) = read_dir.next_entry().await.unwrap() {
        names.push(e.file_name());
    }
    let mut revisions: Vec<_> = names.iter().filter_map(|n| n.to_str()?.parse::<u64>().ok()).collect();
    revisions.sort();
    assert_eq!(revisions, vec![0, 1, 2]);
}

#[tokio::test]
async fn delete_then_recreate_round_trips_through_tombstone() {
    let fx = Fixture::new();
    fx.engine.resolve_for_write(Path::new("/a")).await.unwrap();
    fx.engine.tombstone(Path::new("/a")).await.unwrap();

    // Tombstoned: invisible to reads and to directory listings.
    assert_eq!(fx.engine.resolve_for_read(Path::new("/a")).await, Err(FsError::NotFound));

    // `create` over a tombstone untombstones and allocates the next
    // revision rather than failing EEXIST (mkdir is the only op that still
    // refuses a tombstoned path).
    let recreated = fx.engine.create_file(Path::new("/a"), 0o600).await.unwrap();
    assert_eq!(recreated.file_name().unwrap(), "1");
    assert_eq!(
        fx.engine.node_state(Path::new("/a")).await.unwrap(),
        revisionfs::engine::NodeState::LiveFile(1)
    );
    assert!(fx.engine.resolve_for_read(Path::new("/a")).await.is_ok());
}

#[tokio::test]
async fn create_over_tombstone_after_multiple_revisions_allocates_past_the_highest() {
    let fx = Fixture::new();
    let rev0 = fx.engine.resolve_for_write(Path::new("/hello")).await.unwrap();
    tokio::fs::write(&rev0, b"v0").await.unwrap();
    fx.engine.resolve_for_write(Path::new("/hello")).await.unwrap();
    fx.engine.tombstone(Path::new("/hello")).await.unwrap();

    let recreated = fx.engine.create_file(Path::new("/hello"), 0o600).await.unwrap();
    assert_eq!(recreated.file_name().unwrap(), "2");
    assert!(!fx.version_dir("/hello").join("deleted").exists());
}

#[tokio::test]
async fn nested_directories_are_created_component_by_component() {
    let fx = Fixture::new();
    fx.engine.create_directory(Path::new("/a"), 0o755).await.unwrap();
    fx.engine.create_directory(Path::new("/a/b"), 0o755).await.unwrap();
    fx.engine.resolve_for_write(Path::new("/a/b/c")).await.unwrap();

    let entries = fx.engine.read_directory(Path::new("/a/b")).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, "c");
    assert!(!entries[0].is_dir);
}

#[tokio::test]
async fn renaming_a_regular_file_tombstones_the_source_and_clones_to_the_destination() {
    let fx = Fixture::new();
    fx.engine.create_directory(Path::new("/d"), 0o755).await.unwrap();
    let rev0 = fx.engine.resolve_for_write(Path::new("/d/f")).await.unwrap();
    tokio::fs::write(&rev0, b"payload").await.unwrap();

    fx.engine.rename(Path::new("/d/f"), Path::new("/d/g")).await.unwrap();

    assert!(fx.version_dir("/d/f").join("deleted").exists());
    assert_eq!(fx.engine.resolve_for_read(Path::new("/d/f")).await, Err(FsError::NotFound));

    let dest_rev = fx.engine.resolve_for_read(Path::new("/d/g")).await.unwrap();
    assert_eq!(dest_rev.file_name().unwrap(), "0");
    assert_eq!(tokio::fs::read(&dest_rev).await.unwrap(), b"payload");
}

#[tokio::test]
async fn renaming_a_directory_keeps_no_tombstone_behind() {
    let fx = Fixture::new();
    fx.engine.create_directory(Path::new("/src"), 0o755).await.unwrap();
    fx.engine.resolve_for_write(Path::new("/src/file")).await.unwrap();

    fx.engine.rename(Path::new("/src"), Path::new("/dst")).await.unwrap();

    assert_eq!(fx.engine.node_state(Path::new("/src")).await.unwrap(), revisionfs::engine::NodeState::Absent);
    let entries = fx.engine.read_directory(Path::new("/dst")).await.unwrap();
    assert_eq!(entries[0].name, "file");
}

#[tokio::test]
async fn rmdir_on_nonempty_directory_is_rejected_by_the_dispatcher_contract() {
    let fx = Fixture::new();
    fx.engine.create_directory(Path::new("/d"), 0o755).await.unwrap();
    fx.engine.resolve_for_write(Path::new("/d/child")).await.unwrap();

    let entries = fx.engine.read_directory(Path::new("/d")).await.unwrap();
    assert_eq!(entries.len(), 1, "dispatcher's rmdir must see this and refuse with ENOTEMPTY");
}

#[tokio::test]
async fn engine_does_not_itself_police_writes_under_a_file_parent() {
    // The version directory backing a file node is, physically, still a
    // directory on the host filesystem (it holds sentinels and revisions),
    // so the engine has no structural way to refuse this on its own. The
    // kernel never presents this case in practice: once `getattr` reports
    // `/leaf` as a regular file, the VFS resolves `/leaf/nested` to ENOTDIR
    // without ever calling back into the dispatcher.
    let fx = Fixture::new();
    fx.engine.resolve_for_write(Path::new("/leaf")).await.unwrap();
    assert!(fx.engine.resolve_for_write(Path::new("/leaf/nested")).await.is_ok());
}
