use std::time::{Duration, SystemTime};

use map_macro::map;

use crate::filesystem_node::*;
use crate::folder;
use crate::test_framework::*;

const ALICE: &str = "alice@example.com";
const BOB: &str = "bob@example.com";

/// A write into someone else's datasite without `write` permission is
/// refused: the server keeps its bytes, the local copy stays, and the
/// consumer moves on to the next item.
#[tokio::test]
async fn test_push_without_write_permission_is_denied() {
    let old = SystemTime::now() - Duration::from_secs(3600);
    let server = TestServer::start_seeded(|snapshot| {
        save_filesystem_node_to_disk(
            &folder! {
                "syftperm.yaml" => world_readable(ALICE),
                "private" => folder! {
                    "x.txt" => file_with_modified("secret", old),
                },
            },
            &snapshot.join(ALICE),
        );
    })
    .await;

    let bob = TestClient::connect(&server, BOB).await;
    bob.sync().await;
    assert_eq!(bob.load(&format!("{ALICE}/private/x.txt")), Some(file("secret")));

    // Bob edits alice's file locally and also creates one of his own
    bob.delete(&format!("{ALICE}/private/x.txt"));
    bob.save(&format!("{ALICE}/private/x.txt"), &file("bob was here"));
    bob.save(&format!("{BOB}/mine.txt"), &file("bob's own data"));
    bob.sync().await;

    // The server is unchanged, bob's local edit remains, and the failure
    // didn't stop his own file from syncing
    assert_eq!(server.load(&format!("{ALICE}/private/x.txt")), Some(file("secret")));
    assert_eq!(bob.load(&format!("{ALICE}/private/x.txt")), Some(file("bob was here")));
    assert_file_everywhere(&server, &[&bob], &format!("{BOB}/mine.txt"), "bob's own data");
}

/// Within one sync pass, a permission-file update reaches the server
/// strictly before any data-file operation from the same pass.
#[tokio::test]
async fn test_permission_update_lands_before_data() {
    let server = TestServer::start().await;
    let alice = TestClient::connect(&server, ALICE).await;

    // First pass: establish the permission file (grants bob nothing yet)
    alice.save(
        &format!("{ALICE}/shared/syftperm.yaml"),
        &file("- path: 'nothing/**'\n  user: bob@example.com\n  permissions: [read]\n"),
    );
    alice.sync().await;

    // Second pass carries both a permission-file update (now granting bob
    // read) and a new data file
    let before = server.mutating_requests().len();
    alice.delete(&format!("{ALICE}/shared/syftperm.yaml"));
    alice.save(
        &format!("{ALICE}/shared/syftperm.yaml"),
        &file("- path: '**'\n  user: bob@example.com\n  permissions: [read]\n"),
    );
    alice.save(&format!("{ALICE}/shared/data.txt"), &file("now visible to bob"));
    alice.sync().await;

    // The permission update is an apply_diff (the file existed), the data
    // file is a create; the permission write must come first
    let pass: Vec<String> = server.mutating_requests().split_off(before);
    assert_eq!(pass, vec!["POST /sync/apply_diff", "POST /sync/create"]);

    // And the grant is effective: bob can pull the data file
    let bob = TestClient::connect(&server, BOB).await;
    bob.sync().await;
    assert_eq!(bob.load(&format!("{ALICE}/shared/data.txt")), Some(file("now visible to bob")));
}

/// Listings only show what the caller may read: without a rule, another
/// user's files never reach a peer.
#[tokio::test]
async fn test_unreadable_files_are_invisible() {
    let server = TestServer::start_seeded(|snapshot| {
        save_filesystem_node_to_disk(
            &folder! {
                "syftperm.yaml" => file(
                    "- path: '**'\n  user: alice@example.com\n  permissions: [admin, read, create, write]\n\
                     - path: 'public/**'\n  user: '*'\n  permissions: [read]\n"
                ),
                "public" => folder! {
                    "open.txt" => file("anyone may see this"),
                },
                "private" => folder! {
                    "hidden.txt" => file("only alice may see this"),
                },
            },
            &snapshot.join(ALICE),
        );
    })
    .await;

    let bob = TestClient::connect(&server, BOB).await;
    bob.sync().await;

    assert_eq!(bob.load(&format!("{ALICE}/public/open.txt")), Some(file("anyone may see this")));
    assert_eq!(bob.load(&format!("{ALICE}/private/hidden.txt")), None);
}

/// A deeper disallow rule carves a subtree out of a broad grant, on the
/// wire and not just in unit tests.
#[tokio::test]
async fn test_deeper_disallow_overrides_shallower_grant() {
    let server = TestServer::start_seeded(|snapshot| {
        save_filesystem_node_to_disk(
            &folder! {
                "syftperm.yaml" => world_readable(ALICE),
                "open.txt" => file("readable"),
                "vault" => folder! {
                    "syftperm.yaml" => file(
                        "- path: '**'\n  user: '*'\n  permissions: [read]\n  type: disallow\n"
                    ),
                    "sealed.txt" => file("not for anyone else"),
                },
            },
            &snapshot.join(ALICE),
        );
    })
    .await;

    let bob = TestClient::connect(&server, BOB).await;
    bob.sync().await;

    assert_eq!(bob.load(&format!("{ALICE}/open.txt")), Some(file("readable")));
    assert_eq!(bob.load(&format!("{ALICE}/vault/sealed.txt")), None);
}
