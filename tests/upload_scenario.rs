//! End-to-end upload tests
//!
//! Drives uploads through the committer against an on-disk sled store and
//! disk file store, then checks the resulting reference tree.

use blobber::digest;
use blobber::filestore::{merkle_root, FileInputData, MERKLE_CHUNK_SIZE};
use blobber::reference::directory_hash;
use blobber::{
    setup_entities, AllocationChangeCollector, AllocationLocks, DiskFileStore, EntityRegistry,
    FileStore, RefType, ReferenceStore, SledStore, UploadFormData, WriteCommitter,
};
use blobber::datastore::SledStoreConfig;
use std::sync::Arc;
use tempfile::TempDir;

const ALLOCATION: &str = "A1";
const CLIENT: &str = "client1";

struct Node {
    registry: Arc<EntityRegistry>,
    refs: Arc<ReferenceStore>,
    files: Arc<DiskFileStore>,
    committer: WriteCommitter,
    _temp: TempDir,
}

/// Node with an empty, committed root for the test allocation
async fn create_node() -> Node {
    let temp_dir = TempDir::new().unwrap();
    let store = Arc::new(
        SledStore::open(&SledStoreConfig {
            db_path: temp_dir.path().join("blobberstate.sled"),
            ..Default::default()
        })
        .unwrap(),
    );
    let registry = Arc::new(setup_entities(store));
    let refs = Arc::new(ReferenceStore::new(Arc::clone(&registry)));
    let files = Arc::new(DiskFileStore::new(temp_dir.path().join("files")).await.unwrap());
    let committer = WriteCommitter::new(
        Arc::clone(&registry),
        Arc::clone(&refs),
        files.clone(),
        Arc::new(AllocationLocks::new()),
    );

    let ctx = registry.begin();
    refs.ensure_directory_chain(&ctx, ALLOCATION, "/").unwrap();
    ctx.commit().unwrap();

    Node {
        registry,
        refs,
        files,
        committer,
        _temp: temp_dir,
    }
}

fn form(connection_id: &str, path: &str, data: &[u8]) -> UploadFormData {
    let hash = digest::hash(data);
    UploadFormData {
        connection_id: connection_id.to_string(),
        filename: String::new(),
        path: path.to_string(),
        hash: hash.clone(),
        merkle_root: String::new(),
        actual_hash: hash,
        actual_size: data.len() as i64,
        custom_meta: String::new(),
    }
}

async fn stage(node: &Node, connection_id: &str, path: &str, data: &[u8]) {
    let ctx = node.registry.begin();
    node.committer
        .stage_upload(&ctx, ALLOCATION, CLIENT, form(connection_id, path, data), data)
        .await
        .unwrap();
    ctx.commit().unwrap();
}

/// Upload /docs/readme.txt into an empty allocation
#[tokio::test]
async fn test_readme_upload_updates_root() {
    let node = create_node().await;
    let data = vec![b'x'; 120];
    let h1 = digest::hash(&data);

    let before = node.refs.get_root(&node.registry.begin(), ALLOCATION).unwrap();
    assert_eq!(before.hash, directory_hash(std::iter::empty()));

    stage(&node, "C1", "/docs/readme.txt", &data).await;
    let ctx = node.registry.begin();
    let root = node.committer.commit(&ctx, ALLOCATION, "C1").await.unwrap();

    let ctx = node.registry.begin();
    let docs = node.refs.get_ref(&ctx, ALLOCATION, "/docs").unwrap();
    assert_eq!(docs.ref_type(), RefType::Directory);

    let readme = node.refs.get_ref(&ctx, ALLOCATION, "/docs/readme.txt").unwrap();
    let expected = digest::hash(format!(
        "A1:f:readme.txt:/docs/readme.txt:120:{}:{}:120:{}",
        h1,
        merkle_root(&data, MERKLE_CHUNK_SIZE),
        h1
    ));
    assert_eq!(readme.hash, expected);
    assert_eq!(docs.hash, directory_hash([readme.hash.as_str()]));

    let stored_root = node.refs.get_root(&ctx, ALLOCATION).unwrap();
    assert_eq!(stored_root.hash, directory_hash([docs.hash.as_str()]));
    assert_eq!(stored_root.hash, root.hash);
    assert_ne!(stored_root.hash, before.hash);
    assert!(stored_root.children().unwrap().contains_key("docs"));

    assert_eq!(node.refs.verify_tree(&ctx, ALLOCATION).unwrap(), root.hash);
    assert_eq!(node.files.get(ALLOCATION, &h1).await.unwrap(), data);

    // The connection record is gone once committed
    let err = AllocationChangeCollector::load(&node.registry, &ctx, ALLOCATION, "C1").unwrap_err();
    assert!(err.is_not_found());
}

/// A commit that fails part way never moves the stored root
#[tokio::test]
async fn test_failed_commit_keeps_root() {
    let node = create_node().await;
    stage(&node, "C1", "/docs/readme.txt", b"first").await;
    let before = node
        .committer
        .commit(&node.registry.begin(), ALLOCATION, "C1")
        .await
        .unwrap();

    let data = b"second file";
    stage(&node, "C2", "/docs/notes.txt", data).await;
    stage(&node, "C2", "/docs/todo.txt", b"third file").await;

    // Lose the second staged file before commit
    let lost = FileInputData {
        name: "todo.txt".into(),
        path: "/docs/todo.txt".into(),
        hash: digest::hash(b"third file"),
    };
    node.files.delete_temp_file(ALLOCATION, &lost, "C2").await.unwrap();

    let ctx = node.registry.begin();
    assert!(node.committer.commit(&ctx, ALLOCATION, "C2").await.is_err());

    let ctx = node.registry.begin();
    let after = node.refs.get_root(&ctx, ALLOCATION).unwrap();
    assert_eq!(after.hash, before.hash);
    assert!(node.refs.get_ref(&ctx, ALLOCATION, "/docs/notes.txt").unwrap_err().is_not_found());

    // The collector survives for a later abort
    let collector = AllocationChangeCollector::load(&node.registry, &ctx, ALLOCATION, "C2").unwrap();
    assert_eq!(collector.changes.len(), 2);
    assert_eq!(collector.size, (data.len() + b"third file".len()) as i64);
}

/// A connection whose commit failed part way can be committed once repaired
#[tokio::test]
async fn test_commit_retry_after_partial_failure() {
    let node = create_node().await;
    stage(&node, "C2", "/docs/notes.txt", b"second file").await;
    stage(&node, "C2", "/docs/todo.txt", b"third file").await;

    let lost = FileInputData {
        name: "todo.txt".into(),
        path: "/docs/todo.txt".into(),
        hash: digest::hash(b"third file"),
    };
    node.files.delete_temp_file(ALLOCATION, &lost, "C2").await.unwrap();
    assert!(node
        .committer
        .commit(&node.registry.begin(), ALLOCATION, "C2")
        .await
        .is_err());

    // notes.txt already sits in permanent storage; re-stage only todo.txt
    stage(&node, "C2", "/docs/todo.txt", b"third file").await;
    let root = node
        .committer
        .commit(&node.registry.begin(), ALLOCATION, "C2")
        .await
        .unwrap();

    let ctx = node.registry.begin();
    let notes = node.refs.get_ref(&ctx, ALLOCATION, "/docs/notes.txt").unwrap();
    assert_eq!(notes.file_content().unwrap().content_hash, digest::hash(b"second file"));
    assert!(node.refs.get_ref(&ctx, ALLOCATION, "/docs/todo.txt").is_ok());
    assert_eq!(node.refs.verify_tree(&ctx, ALLOCATION).unwrap(), root.hash);
    assert_eq!(
        node.files.get(ALLOCATION, &digest::hash(b"second file")).await.unwrap(),
        b"second file"
    );
}

/// Aborting a connection removes each staged file and the record
#[tokio::test]
async fn test_abort_removes_temp_files() {
    let node = create_node().await;
    let paths = ["/a.txt", "/b/c.txt", "/b/d/e.txt"];
    for (i, path) in paths.iter().enumerate() {
        stage(&node, "C3", path, format!("content {}", i).as_bytes()).await;
    }

    let temp_paths: Vec<_> = paths
        .iter()
        .map(|path| {
            let input = FileInputData {
                path: path.to_string(),
                ..Default::default()
            };
            node.files.temp_path(ALLOCATION, &input, "C3").unwrap()
        })
        .collect();
    assert!(temp_paths.iter().all(|p| p.exists()));

    let ctx = node.registry.begin();
    let deleted = node.committer.abort(&ctx, ALLOCATION, "C3").await.unwrap();
    assert_eq!(deleted, paths.len());
    assert!(temp_paths.iter().all(|p| !p.exists()));

    let ctx = node.registry.begin();
    let err = AllocationChangeCollector::load(&node.registry, &ctx, ALLOCATION, "C3").unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(
        node.refs.get_root(&ctx, ALLOCATION).unwrap().hash,
        directory_hash(std::iter::empty())
    );
}

/// Uploads on two connections of the same allocation both land
#[tokio::test]
async fn test_sequential_connections_accumulate() {
    let node = create_node().await;
    stage(&node, "C1", "/docs/a.txt", b"alpha").await;
    stage(&node, "C2", "/docs/b.txt", b"beta").await;

    node.committer
        .commit(&node.registry.begin(), ALLOCATION, "C1")
        .await
        .unwrap();
    let root = node
        .committer
        .commit(&node.registry.begin(), ALLOCATION, "C2")
        .await
        .unwrap();

    let ctx = node.registry.begin();
    let rows = node.refs.list_directory(&ctx, ALLOCATION, "/docs").unwrap();
    let names: Vec<_> = rows.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["a.txt", "b.txt"]);
    assert_eq!(node.refs.recompute_root_hash(&ctx, ALLOCATION).unwrap(), root.hash);
}
