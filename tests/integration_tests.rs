// Integration tests for the hoard distributed file store
// These tests validate end-to-end replication across small node clusters

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::sleep;

use hoard::crypto::{copy_decrypt, hash_key, new_encryption_key};
use hoard::message::STORE_FILE_TAG;
use hoard::server::{FileServer, FileServerOpts};
use hoard::store::{cas_path_transform, Store};
use hoard::transport::{noop_handshake, TcpTransport, TcpTransportOpts, MESSAGE_TAG};
use hoard::{BLOCK_SIZE, KEY_SIZE};

fn temp_root(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("hoard_it_{}_{}", tag, std::process::id()))
}

fn cleanup(roots: &[&Path]) {
    for root in roots {
        let _ = std::fs::remove_dir_all(root);
    }
}

async fn spawn_node(
    port: u16,
    root: &Path,
    bootstrap_ports: &[u16],
    enc_key: Option<[u8; KEY_SIZE]>,
) -> Arc<FileServer> {
    let transport = TcpTransport::new(TcpTransportOpts {
        listen_addr: format!("127.0.0.1:{port}"),
        handshake: noop_handshake,
    });
    let server = FileServer::new(FileServerOpts {
        id: None,
        enc_key,
        storage_folder: root.to_string_lossy().into_owned(),
        bootstrap_nodes: bootstrap_ports
            .iter()
            .map(|p| format!("127.0.0.1:{p}"))
            .collect(),
        path_transform: cas_path_transform,
        transport,
    });
    server.start().await.expect("server should start");
    server
}

async fn wait_for_peers(server: &FileServer, n: usize) {
    for _ in 0..100 {
        if server.peer_count() >= n {
            return;
        }
        sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {n} peers");
}

async fn wait_for_blob(store: &Store, id: &str, key: &str) {
    for _ in 0..100 {
        if store.has(id, key).await {
            return;
        }
        sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for blob ({key}) under ({id})");
}

async fn wait_for_gone(store: &Store, id: &str, key: &str) {
    for _ in 0..100 {
        if !store.has(id, key).await {
            return;
        }
        sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for blob ({key}) to disappear");
}

async fn read_all(store: &Store, id: &str, key: &str) -> Vec<u8> {
    let (_, mut f) = store.read(id, key).await.expect("blob should exist");
    let mut out = Vec::new();
    f.read_to_end(&mut out).await.unwrap();
    out
}

// ============================================================================
// Replication
// ============================================================================

#[tokio::test]
async fn store_replicates_ciphertext_to_peers() {
    let (ra, rb, rc) = (temp_root("rep_a"), temp_root("rep_b"), temp_root("rep_c"));
    cleanup(&[&ra, &rb, &rc]);

    let a_key = new_encryption_key();
    let a = spawn_node(43101, &ra, &[], Some(a_key)).await;
    let b = spawn_node(43102, &rb, &[43101], None).await;
    let c = spawn_node(43103, &rc, &[43101, 43102], None).await;
    wait_for_peers(&a, 2).await;
    wait_for_peers(&b, 2).await;
    wait_for_peers(&c, 2).await;

    a.store("k1", &b"hello"[..], true).await.unwrap();

    // The origin holds plaintext under the raw key
    assert_eq!(read_all(a.store_ref(), a.id(), "k1").await, b"hello");

    // Replicas hold ciphertext under the origin's namespace and key hash
    let key_hash = hash_key("k1");
    for replica in [&b, &c] {
        wait_for_blob(replica.store_ref(), a.id(), &key_hash).await;
        let ciphertext = read_all(replica.store_ref(), a.id(), &key_hash).await;
        assert_eq!(ciphertext.len(), 5 + BLOCK_SIZE);

        let mut plaintext = Vec::new();
        copy_decrypt(&a_key, &mut &ciphertext[..], &mut plaintext)
            .await
            .unwrap();
        assert_eq!(&plaintext[..], b"hello");
    }

    // Both replicas landed at the same relative path
    assert_eq!(
        read_all(b.store_ref(), a.id(), &key_hash).await,
        read_all(c.store_ref(), a.id(), &key_hash).await
    );

    a.stop();
    b.stop();
    c.stop();
    cleanup(&[&ra, &rb, &rc]);
}

// ============================================================================
// Delete propagation
// ============================================================================

#[tokio::test]
async fn delete_propagates_and_get_reports_not_found() {
    let (ra, rb, rc) = (temp_root("del_a"), temp_root("del_b"), temp_root("del_c"));
    cleanup(&[&ra, &rb, &rc]);

    let a = spawn_node(43111, &ra, &[], None).await;
    let b = spawn_node(43112, &rb, &[43111], None).await;
    let c = spawn_node(43113, &rc, &[43111, 43112], None).await;
    wait_for_peers(&a, 2).await;
    wait_for_peers(&c, 2).await;

    a.store("k2", &b"x"[..], true).await.unwrap();
    let key_hash = hash_key("k2");
    wait_for_blob(b.store_ref(), a.id(), &key_hash).await;
    wait_for_blob(c.store_ref(), a.id(), &key_hash).await;

    a.delete("k2").await.unwrap();
    assert!(!a.store_ref().has(a.id(), "k2").await);
    wait_for_gone(b.store_ref(), a.id(), &key_hash).await;
    wait_for_gone(c.store_ref(), a.id(), &key_hash).await;

    // Nobody holds k2 any more, so the network search comes back empty
    let err = a.get("k2").await.unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::NotFound);

    a.stop();
    b.stop();
    c.stop();
    cleanup(&[&ra, &rb, &rc]);
}

// ============================================================================
// Network refetch
// ============================================================================

#[tokio::test]
async fn network_refetch_restores_plaintext() {
    let (ra, rb, rc) = (temp_root("get_a"), temp_root("get_b"), temp_root("get_c"));
    cleanup(&[&ra, &rb, &rc]);

    let a = spawn_node(43121, &ra, &[], None).await;
    let b = spawn_node(43122, &rb, &[43121], None).await;
    let c = spawn_node(43123, &rc, &[43121, 43122], None).await;
    wait_for_peers(&a, 2).await;
    wait_for_peers(&c, 2).await;

    let blob: Vec<u8> = (0..1024 * 1024).map(|i| (i % 239) as u8).collect();
    a.store("k3", &blob[..], true).await.unwrap();

    let key_hash = hash_key("k3");
    wait_for_blob(b.store_ref(), a.id(), &key_hash).await;
    wait_for_blob(c.store_ref(), a.id(), &key_hash).await;

    // Replicas hold the advertised ciphertext size
    let ciphertext = read_all(b.store_ref(), a.id(), &key_hash).await;
    assert_eq!(ciphertext.len(), blob.len() + BLOCK_SIZE);

    // Drop the origin's local copy, then fetch it back over the network
    a.store_ref().delete(a.id(), "k3").await.unwrap();
    assert!(!a.store_ref().has(a.id(), "k3").await);

    let mut r = a.get("k3").await.expect("network refetch should succeed");
    let mut fetched = Vec::new();
    r.read_to_end(&mut fetched).await.unwrap();
    assert_eq!(fetched, blob);

    // The refetched plaintext is back on the origin's disk
    assert_eq!(read_all(a.store_ref(), a.id(), "k3").await, blob);

    a.stop();
    b.stop();
    c.stop();
    cleanup(&[&ra, &rb, &rc]);
}

// ============================================================================
// Unreplicated stores
// ============================================================================

#[tokio::test]
async fn unreplicated_store_stays_local() {
    let (ra, rb) = (temp_root("loc_a"), temp_root("loc_b"));
    cleanup(&[&ra, &rb]);

    let a = spawn_node(43131, &ra, &[], None).await;
    a.store("k4", &b"local only"[..], false).await.unwrap();

    // B joins after the fact and never hears about k4
    let b = spawn_node(43132, &rb, &[43131], None).await;
    wait_for_peers(&a, 1).await;
    wait_for_peers(&b, 1).await;
    sleep(Duration::from_millis(200)).await;

    let key_hash = hash_key("k4");
    assert!(!b.store_ref().has(a.id(), &key_hash).await);

    // B never originated k4, so the network search finds nothing either
    let err = b.get("k4").await.unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::NotFound);

    // A still serves its own copy locally
    assert_eq!(read_all(a.store_ref(), a.id(), "k4").await, b"local only");

    a.stop();
    b.stop();
    cleanup(&[&ra, &rb]);
}

// ============================================================================
// Concurrent writes
// ============================================================================

#[tokio::test]
async fn concurrent_stores_leave_one_complete_value() {
    let ra = temp_root("conc_a");
    cleanup(&[&ra]);

    let a = spawn_node(43141, &ra, &[], None).await;
    let d1 = vec![0xAAu8; 1024];
    let d2 = vec![0xBBu8; 1024];

    let (r1, r2) = tokio::join!(
        a.store("k5", &d1[..], false),
        a.store("k5", &d2[..], false)
    );
    r1.unwrap();
    r2.unwrap();

    // Whole-value atomicity: one of the writes wins outright
    let out = read_all(a.store_ref(), a.id(), "k5").await;
    assert!(out == d1 || out == d2, "interleaved bytes on disk");

    a.stop();
    cleanup(&[&ra]);
}

// ============================================================================
// Peer failure tolerance
// ============================================================================

#[tokio::test]
async fn dead_peer_does_not_fail_replication() {
    let (ra, rb, rc) = (temp_root("dead_a"), temp_root("dead_b"), temp_root("dead_c"));
    cleanup(&[&ra, &rb, &rc]);

    let a = spawn_node(43151, &ra, &[], None).await;
    let b = spawn_node(43152, &rb, &[43151], None).await;
    let c = spawn_node(43153, &rc, &[43151], None).await;
    wait_for_peers(&a, 2).await;

    // Kill B; A notices the closed connection and drops the peer
    b.stop();
    for _ in 0..100 {
        if a.peer_count() == 1 {
            break;
        }
        sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(a.peer_count(), 1);

    // Replication still succeeds for the surviving peer
    a.store("k6", &b"hi"[..], true).await.unwrap();
    assert_eq!(read_all(a.store_ref(), a.id(), "k6").await, b"hi");

    let key_hash = hash_key("k6");
    wait_for_blob(c.store_ref(), a.id(), &key_hash).await;
    let ciphertext = read_all(c.store_ref(), a.id(), &key_hash).await;
    assert_eq!(ciphertext.len(), 2 + BLOCK_SIZE);

    a.stop();
    c.stop();
    cleanup(&[&ra, &rb, &rc]);
}

// ============================================================================
// Malformed remote input
// ============================================================================

#[tokio::test]
async fn malformed_frames_do_not_kill_the_control_loop() {
    let (ra, rb) = (temp_root("mal_a"), temp_root("mal_b"));
    cleanup(&[&ra, &rb]);

    let a = spawn_node(43161, &ra, &[], None).await;
    let b = spawn_node(43162, &rb, &[43161], None).await;
    wait_for_peers(&a, 1).await;
    wait_for_peers(&b, 1).await;

    // A rogue client passes the no-op handshake like anyone else
    let mut rogue = TcpStream::connect("127.0.0.1:43161").await.unwrap();
    wait_for_peers(&a, 2).await;

    // Unknown variant tag inside a control frame
    rogue
        .write_all(&[MESSAGE_TAG, 0x7f, 0xde, 0xad])
        .await
        .unwrap();
    rogue.flush().await.unwrap();
    sleep(Duration::from_millis(50)).await;

    // Truncated StoreFile frame: variant tag with half a length prefix
    rogue
        .write_all(&[MESSAGE_TAG, STORE_FILE_TAG, 0xff])
        .await
        .unwrap();
    rogue.flush().await.unwrap();
    sleep(Duration::from_millis(50)).await;

    // Both frames were logged and skipped: a legitimate replication from
    // B still lands on A afterwards
    b.store("k7", &b"still alive"[..], true).await.unwrap();
    let key_hash = hash_key("k7");
    wait_for_blob(a.store_ref(), b.id(), &key_hash).await;
    let ciphertext = read_all(a.store_ref(), b.id(), &key_hash).await;
    assert_eq!(ciphertext.len(), 11 + BLOCK_SIZE);

    // And A's own operations keep working
    a.store("k8", &b"locally fine"[..], false).await.unwrap();
    assert_eq!(read_all(a.store_ref(), a.id(), "k8").await, b"locally fine");
    let mut r = a.get("k8").await.unwrap();
    let mut out = Vec::new();
    r.read_to_end(&mut out).await.unwrap();
    assert_eq!(out, b"locally fine");

    drop(rogue);
    a.stop();
    b.stop();
    cleanup(&[&ra, &rb]);
}
