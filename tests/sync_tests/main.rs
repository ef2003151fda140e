#[path = "../filesystem_node.rs"]
#[allow(unused)]
mod filesystem_node;
#[allow(unused)]
mod test_framework;

mod conflict_tests;
mod consistency_tests;
mod permission_sync_tests;
mod pull_tests;
mod push_tests;
