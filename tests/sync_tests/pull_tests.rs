use std::time::{Duration, SystemTime};

use map_macro::map;

use crate::filesystem_node::*;
use crate::folder;
use crate::test_framework::*;

const ALICE: &str = "alice@example.com";
const BOB: &str = "bob@example.com";

/// A remote file appears locally after one sync pass, with the remote's
/// contents, size and modification time.
#[tokio::test]
async fn test_pull_new_file() {
    let modified = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_100);
    let server = TestServer::start_seeded(|snapshot| {
        save_filesystem_node_to_disk(
            &folder! {
                "syftperm.yaml" => world_readable(ALICE),
                "a.txt" => file_with_modified("hello", modified),
            },
            &snapshot.join(ALICE),
        );
    })
    .await;

    let bob = TestClient::connect(&server, BOB).await;
    assert_eq!(bob.load(&format!("{ALICE}/a.txt")), None);

    bob.sync().await;

    assert_eq!(bob.load(&format!("{ALICE}/a.txt")), Some(file("hello")));
    // The local modification time is pinned to the remote's
    assert_eq!(bob.mtime(&format!("{ALICE}/a.txt")), modified);

    let meta = bob.remote_metadata(&format!("{ALICE}/a.txt")).await.unwrap();
    assert_eq!(meta.file_size, 5);
    assert_eq!(meta.hash, syftbox::metadata::hash_bytes(b"hello"));
}

/// A whole nested tree comes across in one pass.
#[tokio::test]
async fn test_pull_nested_tree() {
    let server = TestServer::start_seeded(|snapshot| {
        save_filesystem_node_to_disk(
            &folder! {
                "syftperm.yaml" => world_readable(ALICE),
                "top.txt" => file("top"),
                "sub" => folder! {
                    "mid.txt" => file("mid"),
                    "deeper" => folder! {
                        "leaf.txt" => file("leaf"),
                    },
                },
            },
            &snapshot.join(ALICE),
        );
    })
    .await;

    let bob = TestClient::connect(&server, BOB).await;
    bob.sync().await;

    assert_eq!(bob.load(&format!("{ALICE}/top.txt")), Some(file("top")));
    assert_eq!(bob.load(&format!("{ALICE}/sub/mid.txt")), Some(file("mid")));
    assert_eq!(bob.load(&format!("{ALICE}/sub/deeper/leaf.txt")), Some(file("leaf")));
}

/// An update made by the owner propagates to a peer that already holds an
/// older copy (the diff path, not a fresh download).
#[tokio::test]
async fn test_pull_update_to_existing_file() {
    let old = SystemTime::now() - Duration::from_secs(3600);
    let server = TestServer::start_seeded(|snapshot| {
        save_filesystem_node_to_disk(
            &folder! {
                "syftperm.yaml" => world_readable(ALICE),
                "doc.txt" => file_with_modified("version one of the document", old),
            },
            &snapshot.join(ALICE),
        );
    })
    .await;

    let bob = TestClient::connect(&server, BOB).await;
    bob.sync().await;
    assert_eq!(bob.load(&format!("{ALICE}/doc.txt")), Some(file("version one of the document")));

    // The owner's agent replaces the content (her local copy is newer)
    let alice = TestClient::connect(&server, ALICE).await;
    alice.sync().await;
    alice.delete(&format!("{ALICE}/doc.txt"));
    alice.save(&format!("{ALICE}/doc.txt"), &file("version two of the document"));
    alice.sync().await;
    assert_file_everywhere(&server, &[&alice], &format!("{ALICE}/doc.txt"), "version two of the document");

    // Bob's next pass brings his stale copy up to date
    bob.sync().await;
    assert_eq!(bob.load(&format!("{ALICE}/doc.txt")), Some(file("version two of the document")));
}
