//! File-system layer workflows over a live loopback overlay.

use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use kadfs::{Contact, Dfs, DhtNode, NodeId, RpcClient, RpcServer, FILE_CHUNK_SIZE};

static PORT_COUNTER: AtomicU16 = AtomicU16::new(37000);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

async fn spawn_node() -> DhtNode<RpcClient> {
    let contact = Contact::new(NodeId::random(), "127.0.0.1", next_port());
    let node = DhtNode::new(contact.clone(), RpcClient::new(contact.clone()));
    let server = RpcServer::bind(&contact.addr(), node.clone())
        .await
        .expect("bind failed");
    server.spawn().expect("server spawn failed");
    node
}

/// A meshed overlay plus a formatted file-system on its first node.
async fn overlay_with_fs(size: usize) -> (Vec<DhtNode<RpcClient>>, Dfs<RpcClient>) {
    let mut nodes = Vec::with_capacity(size);
    for _ in 0..size {
        nodes.push(spawn_node().await);
    }
    for node in &nodes {
        for other in &nodes {
            if other.self_id() != node.self_id() {
                node.observe(other.contact());
            }
        }
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    let fs = Dfs::format(nodes[0].clone()).await.expect("format failed");
    (nodes, fs)
}

#[tokio::test]
async fn mkdir_and_ls() {
    let (_nodes, fs) = overlay_with_fs(3).await;

    fs.mkdir("/", "docs").await.expect("mkdir failed");
    fs.mkdir("/docs", "drafts").await.expect("nested mkdir failed");

    assert_eq!(fs.ls("/").await.unwrap(), vec!["docs".to_string()]);
    assert_eq!(fs.ls("/docs").await.unwrap(), vec!["drafts".to_string()]);
    assert!(fs.ls("/docs/drafts").await.unwrap().is_empty());
}

#[tokio::test]
async fn duplicate_names_are_rejected() {
    let (_nodes, fs) = overlay_with_fs(3).await;

    fs.mkdir("/", "once").await.unwrap();
    let err = fs.mkdir("/", "once").await.unwrap_err();
    assert!(err.to_string().contains("already exists"));

    fs.put("/", "note", b"hello").await.unwrap();
    let err = fs.put("/", "note", b"again").await.unwrap_err();
    assert!(err.to_string().contains("already exists"));
}

#[tokio::test]
async fn small_file_round_trip() {
    let (_nodes, fs) = overlay_with_fs(3).await;

    fs.put("/", "greeting.txt", b"hello overlay").await.unwrap();
    let listing = fs.ls("/").await.unwrap();
    assert_eq!(listing, vec!["file greeting.txt".to_string()]);

    let contents = fs.get("/", "greeting.txt").await.unwrap();
    assert_eq!(contents, b"hello overlay".to_vec());
}

#[tokio::test]
async fn multi_chunk_file_round_trip() {
    let (_nodes, fs) = overlay_with_fs(4).await;

    // Three chunks, the last one partial.
    let contents: Vec<u8> = (0..FILE_CHUNK_SIZE * 2 + 123)
        .map(|i| (i % 251) as u8)
        .collect();
    fs.mkdir("/", "blobs").await.unwrap();
    fs.put("/blobs", "data.bin", &contents).await.unwrap();

    let fetched = fs.get("/blobs", "data.bin").await.unwrap();
    assert_eq!(fetched, contents);
}

#[tokio::test]
async fn empty_file_round_trip() {
    let (_nodes, fs) = overlay_with_fs(3).await;
    fs.put("/", "empty", b"").await.unwrap();
    assert_eq!(fs.get("/", "empty").await.unwrap(), Vec::<u8>::new());
}

#[tokio::test]
async fn missing_paths_and_files_error() {
    let (_nodes, fs) = overlay_with_fs(3).await;

    let err = fs.ls("/nowhere").await.unwrap_err();
    assert!(err.to_string().contains("could not find path component"));

    let err = fs.get("/", "ghost").await.unwrap_err();
    assert!(err.to_string().contains("could not find file"));
}

#[tokio::test]
async fn tree_is_readable_from_another_node() {
    let (nodes, fs) = overlay_with_fs(4).await;

    fs.mkdir("/", "shared").await.unwrap();
    fs.put("/shared", "readme", b"visible everywhere").await.unwrap();

    // A different node attaches to the same root and reads the tree.
    let other = Dfs::attach(nodes[2].clone(), fs.root_id());
    assert_eq!(other.ls("/").await.unwrap(), vec!["shared".to_string()]);
    assert_eq!(
        other.get("/shared", "readme").await.unwrap(),
        b"visible everywhere".to_vec()
    );
}
