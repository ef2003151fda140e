use std::io::Read;

use map_macro::map;

use crate::filesystem_node::*;
use crate::folder;
use crate::test_framework::*;

use syftbox::sync_path::SyncPath;

const ALICE: &str = "alice@example.com";
const BOB: &str = "bob@example.com";

/// Running a second pass over an already-synced state issues no further
/// mutating requests.
#[tokio::test]
async fn test_second_pass_is_idempotent() {
    let server = TestServer::start_seeded(|snapshot| {
        save_filesystem_node_to_disk(
            &folder! {
                "syftperm.yaml" => world_readable(ALICE),
                "a.txt" => file("some remote content"),
            },
            &snapshot.join(ALICE),
        );
    })
    .await;

    let bob = TestClient::connect(&server, BOB).await;
    bob.save(&format!("{BOB}/own.txt"), &file("bob's file"));
    bob.sync().await;

    assert_file_everywhere(&server, &[&bob], &format!("{BOB}/own.txt"), "bob's file");
    let after_first = server.mutating_requests();

    bob.sync().await;
    assert_eq!(server.mutating_requests(), after_first, "second pass must not mutate anything");

    bob.sync().await;
    assert_eq!(server.mutating_requests(), after_first, "nor any later pass");
}

/// Paths matched by the ignore rules are invisible to the whole pipeline.
#[tokio::test]
async fn test_ignored_files_never_reach_the_server() {
    let server = TestServer::start().await;
    let alice = TestClient::connect(&server, ALICE).await;

    alice.save(&format!("{ALICE}/real.txt"), &file("syncs"));
    alice.save(&format!("{ALICE}/scratch.tmp"), &file("ignored"));
    alice.save(&format!("{ALICE}/.hidden"), &file("ignored"));
    alice.sync().await;

    assert!(server.load(&format!("{ALICE}/real.txt")).is_some());
    assert_eq!(server.load(&format!("{ALICE}/scratch.tmp")), None);
    assert_eq!(server.load(&format!("{ALICE}/.hidden")), None);
    assert_eq!(alice.remote_metadata(&format!("{ALICE}/scratch.tmp")).await, None);
}

/// `download_bulk` bundles the readable subset of the requested paths
/// into a zip archive.
#[tokio::test]
async fn test_download_bulk_returns_readable_zip() {
    let server = TestServer::start_seeded(|snapshot| {
        save_filesystem_node_to_disk(
            &folder! {
                "syftperm.yaml" => file(
                    "- path: '**'\n  user: alice@example.com\n  permissions: [admin, read, create, write]\n\
                     - path: 'public/**'\n  user: '*'\n  permissions: [read]\n"
                ),
                "public" => folder! {
                    "one.txt" => file("first"),
                    "two.txt" => file("second"),
                },
                "private" => folder! {
                    "keep-out.txt" => file("not bob's business"),
                },
            },
            &snapshot.join(ALICE),
        );
    })
    .await;

    let bob = TestClient::connect(&server, BOB).await;
    let bytes = bob
        .manager
        .api()
        .download_bulk(&[
            SyncPath::try_from(format!("{ALICE}/public/one.txt").as_str()).unwrap(),
            SyncPath::try_from(format!("{ALICE}/public/two.txt").as_str()).unwrap(),
            SyncPath::try_from(format!("{ALICE}/private/keep-out.txt").as_str()).unwrap(),
            SyncPath::try_from(format!("{ALICE}/public/does-not-exist.txt").as_str()).unwrap(),
        ])
        .await
        .unwrap();

    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes)).unwrap();
    let names: Vec<String> = (0..archive.len()).map(|i| archive.by_index(i).unwrap().name().to_string()).collect();
    assert_eq!(archive.len(), 2);
    assert!(names.contains(&format!("{ALICE}/public/one.txt")));
    assert!(names.contains(&format!("{ALICE}/public/two.txt")));

    let mut contents = String::new();
    archive
        .by_name(&format!("{ALICE}/public/one.txt"))
        .unwrap()
        .read_to_string(&mut contents)
        .unwrap();
    assert_eq!(contents, "first");
}

/// `dir_state` lists the readable files under a directory prefix.
#[tokio::test]
async fn test_dir_state_lists_readable_subtree() {
    let server = TestServer::start_seeded(|snapshot| {
        save_filesystem_node_to_disk(
            &folder! {
                "syftperm.yaml" => file(
                    "- path: '**'\n  user: alice@example.com\n  permissions: [admin, read, create, write]\n\
                     - path: 'public/**'\n  user: '*'\n  permissions: [read]\n"
                ),
                "public" => folder! {
                    "open.txt" => file("visible"),
                },
                "private" => folder! {
                    "hidden.txt" => file("invisible"),
                },
            },
            &snapshot.join(ALICE),
        );
    })
    .await;

    let bob = TestClient::connect(&server, BOB).await;
    let listed = bob.manager.api().dir_state(&format!("{ALICE}/public")).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].path.to_string(), format!("{ALICE}/public/open.txt"));

    // The wider prefix still only shows what bob may read
    let listed = bob.manager.api().dir_state(ALICE).await.unwrap();
    let names: Vec<String> = listed.iter().map(|m| m.path.to_string()).collect();
    assert_eq!(names, vec![format!("{ALICE}/public/open.txt")]);
}

/// The email-token flow: an unusable bearer is rejected, a requested email
/// token exchanges for an access token, and `whoami` then resolves it.
#[tokio::test]
async fn test_auth_token_flow() {
    let server = TestServer::start_with_auth().await;
    let api = syftbox::transport::ApiClient::new(
        &server.server.url(),
        BOB,
        "not-a-real-token".to_string(),
        std::time::Duration::from_secs(5),
    )
    .unwrap();

    assert!(api.whoami().await.is_err());

    let email_token = api.request_email_token(BOB).await.unwrap();
    // validate_email_token installs the returned access token on the client
    api.validate_email_token(&email_token).await.unwrap();
    assert_eq!(api.whoami().await.unwrap(), BOB);
}

/// A permission file that no longer parses is rejected at write time and
/// the previously compiled rules stay in force.
#[tokio::test]
async fn test_invalid_permission_file_keeps_previous_rules() {
    let server = TestServer::start().await;
    let alice = TestClient::connect(&server, ALICE).await;

    let good = "- path: '**'\n  user: bob@example.com\n  permissions: [read]\n";
    alice.save(&format!("{ALICE}/shared/syftperm.yaml"), &file(good));
    alice.save(&format!("{ALICE}/shared/data.txt"), &file("shared with bob"));
    alice.sync().await;

    let bob = TestClient::connect(&server, BOB).await;
    bob.sync().await;
    assert_eq!(bob.load(&format!("{ALICE}/shared/data.txt")), Some(file("shared with bob")));

    // Alice breaks the file (unknown key): the push is refused
    alice.delete(&format!("{ALICE}/shared/syftperm.yaml"));
    alice.save(
        &format!("{ALICE}/shared/syftperm.yaml"),
        &file("- path: '**'\n  user: bob@example.com\n  permissions: [read]\n  surprise: true\n"),
    );
    alice.sync().await;

    // Server copy and effective rules are unchanged
    assert_eq!(server.load(&format!("{ALICE}/shared/syftperm.yaml")), Some(file(good)));
    assert!(alice.remote_metadata(&format!("{ALICE}/shared/data.txt")).await.is_some());
    let bob2 = TestClient::connect(&server, BOB).await;
    bob2.sync().await;
    assert_eq!(bob2.load(&format!("{ALICE}/shared/data.txt")), Some(file("shared with bob")));
}
