use std::time::{Duration, SystemTime};

use map_macro::map;

use crate::filesystem_node::*;
use crate::folder;
use crate::test_framework::*;

const ALICE: &str = "alice@example.com";

/// The same path modified on both sides: the strictly newer local copy
/// wins and the server ends up with the local bytes.
#[tokio::test]
async fn test_conflict_newer_local_wins() {
    let old = SystemTime::now() - Duration::from_secs(3600);
    let server = TestServer::start_seeded(|snapshot| {
        save_filesystem_node_to_disk(
            &folder! {
                "d.txt" => file_with_modified("server version", old),
            },
            &snapshot.join(ALICE),
        );
    })
    .await;

    let alice = TestClient::connect(&server, ALICE).await;
    alice.save(&format!("{ALICE}/d.txt"), &file("local version"));
    alice.sync().await;

    assert_file_everywhere(&server, &[&alice], &format!("{ALICE}/d.txt"), "local version");
}

/// The mirror image: a strictly newer remote copy overwrites the local one.
#[tokio::test]
async fn test_conflict_newer_remote_wins() {
    let future = SystemTime::now() + Duration::from_secs(3600);
    let server = TestServer::start_seeded(|snapshot| {
        save_filesystem_node_to_disk(
            &folder! {
                "e.txt" => file_with_modified("server version", future),
            },
            &snapshot.join(ALICE),
        );
    })
    .await;

    let alice = TestClient::connect(&server, ALICE).await;
    alice.save(&format!("{ALICE}/e.txt"), &file("local version"));
    alice.sync().await;

    assert_file_everywhere(&server, &[&alice], &format!("{ALICE}/e.txt"), "server version");
    // The losing local copy must not have reached the server
    assert!(server.requests().iter().all(|r| !r.ends_with("/sync/apply_diff")));
}
