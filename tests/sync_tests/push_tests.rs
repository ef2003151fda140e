use std::time::{Duration, SystemTime};

use map_macro::map;

use crate::filesystem_node::*;
use crate::folder;
use crate::test_framework::*;

const ALICE: &str = "alice@example.com";

/// A file created in the owner's datasite reaches the server as a
/// whole-file create.
#[tokio::test]
async fn test_push_new_file() {
    let server = TestServer::start().await;
    let alice = TestClient::connect(&server, ALICE).await;

    alice.save(&format!("{ALICE}/notes/hello.txt"), &file("first file"));
    alice.sync().await;

    assert_file_everywhere(&server, &[&alice], &format!("{ALICE}/notes/hello.txt"), "first file");
    assert_eq!(server.mutating_requests(), vec!["POST /sync/create"]);
}

/// An update to a file the server already holds travels as a diff:
/// `apply_diff` is issued and `create` is not.
#[tokio::test]
async fn test_push_update_via_diff() {
    let old = SystemTime::now() - Duration::from_secs(3600);
    let server = TestServer::start_seeded(|snapshot| {
        save_filesystem_node_to_disk(
            &folder! {
                "b.txt" => file_with_modified("AAAA CCCC", old),
            },
            &snapshot.join(ALICE),
        );
    })
    .await;

    let alice = TestClient::connect(&server, ALICE).await;
    alice.save(&format!("{ALICE}/b.txt"), &file("AAAA BBBB"));
    alice.sync().await;

    assert_file_everywhere(&server, &[&alice], &format!("{ALICE}/b.txt"), "AAAA BBBB");
    // The push went through the differential path, not a fresh upload
    assert_eq!(server.mutating_requests(), vec!["POST /sync/apply_diff"]);
}

/// Deleting a synced file locally deletes it on the server: exactly one
/// `delete` on the wire, and the metadata row is gone.
#[tokio::test]
async fn test_delete_propagates_to_server() {
    let server = TestServer::start().await;
    let alice = TestClient::connect(&server, ALICE).await;

    alice.save(&format!("{ALICE}/c.txt"), &file("doomed"));
    alice.sync().await;
    assert!(server.load(&format!("{ALICE}/c.txt")).is_some());

    alice.delete(&format!("{ALICE}/c.txt"));
    alice.sync().await;

    assert_eq!(server.load(&format!("{ALICE}/c.txt")), None);
    assert_eq!(alice.remote_metadata(&format!("{ALICE}/c.txt")).await, None);
    let deletes: Vec<String> =
        server.requests().into_iter().filter(|r| r.ends_with("/sync/delete")).collect();
    assert_eq!(deletes.len(), 1);
}

/// A fresh workspace for the owner restores their data from the server
/// rather than treating the empty disk as a mass deletion.
#[tokio::test]
async fn test_fresh_owner_workspace_restores() {
    let server = TestServer::start_seeded(|snapshot| {
        save_filesystem_node_to_disk(
            &folder! {
                "precious.txt" => file("survived the reinstall"),
            },
            &snapshot.join(ALICE),
        );
    })
    .await;

    let alice = TestClient::connect(&server, ALICE).await;
    alice.sync().await;

    assert_file_everywhere(&server, &[&alice], &format!("{ALICE}/precious.txt"), "survived the reinstall");
    // Restoring must not have issued any destructive call
    assert!(server.requests().iter().all(|r| !r.ends_with("/sync/delete")));
}
