mod common;

use common::*;
use sorng_ftp_engine::engine::queue::NewItem;
use sorng_ftp_engine::engine::types::*;

fn tree(server: &MockServer) {
    server
        .mkdir("/d")
        .mkdir("/d/sub")
        .put_file("/d/x.txt", b"x")
        .put_file("/d/sub/y.txt", b"y")
        .put_file("/keep.txt", b"k");
}

#[tokio::test]
async fn test_delete_directory_tree() {
    let server = MockServer::new();
    tree(&server);
    let coordinator = coordinator(&server, fast_config());
    let id = coordinator.add_item(NewItem::server(ItemType::DeleteExploreDir, "/", "d"));
    run_to_end(&coordinator).await;

    let root = coordinator.item(id).unwrap();
    assert_eq!(root.kind, ItemType::DeleteDir);
    assert_eq!(root.state, ItemState::Done);
    let items = coordinator.items();
    assert_eq!(items.len(), 4);
    assert!(items.iter().all(|i| i.state == ItemState::Done));

    let st = server.state();
    assert_eq!(st.files.keys().collect::<Vec<_>>(), vec!["/keep.txt"]);
    assert_eq!(st.dirs.iter().collect::<Vec<_>>(), vec!["/"]);
}

#[tokio::test]
async fn test_change_attributes_of_tree() {
    let server = MockServer::new();
    tree(&server);
    let coordinator = coordinator(&server, fast_config());
    coordinator.add_item(NewItem::server(ItemType::ChAttrsExploreDir, "/", "d").with_attrs(0o750));
    run_to_end(&coordinator).await;

    assert!(coordinator.items().iter().all(|i| i.state == ItemState::Done));
    let st = server.state();
    for path in ["/d", "/d/sub", "/d/x.txt", "/d/sub/y.txt"] {
        assert_eq!(st.modes.get(path), Some(&0o750), "{}", path);
    }
    assert!(!st.modes.contains_key("/keep.txt"));
}

#[tokio::test]
async fn test_failed_delete_can_be_retried() {
    let server = MockServer::new();
    server.mkdir("/d");
    let coordinator = coordinator(&server, fast_config());
    let id = coordinator.add_item(NewItem::server(ItemType::DeleteFile, "/d", "late.txt"));
    run_to_end(&coordinator).await;

    let item = coordinator.item(id).unwrap();
    assert_eq!(item.state, ItemState::Failed);
    assert_eq!(item.error.unwrap().problem, ProblemCode::UnableToDeleteFile);
    assert_eq!(coordinator.first_error_index(), Some(0));
    assert_eq!(coordinator.simple_progress().failed, 1);

    server.put_file("/d/late.txt", b"now here");
    coordinator.retry_item(id).unwrap();
    run_to_end(&coordinator).await;

    assert_eq!(coordinator.item(id).unwrap().state, ItemState::Done);
    assert_eq!(server.file("/d/late.txt"), None);
    assert_eq!(coordinator.first_error_index(), None);
}

#[tokio::test]
async fn test_failed_child_forces_parent_to_fail() {
    let server = MockServer::new();
    server.mkdir("/d").put_file("/d/x.txt", b"x").put_file("/d/locked.txt", b"l");
    server.state().protected.insert("/d/locked.txt".to_string());
    let coordinator = coordinator(&server, fast_config());
    let id = coordinator.add_item(NewItem::server(ItemType::DeleteExploreDir, "/", "d"));
    run_to_end(&coordinator).await;

    let root = coordinator.item(id).unwrap();
    assert_eq!(root.state, ItemState::ForcedToFail);
    assert_eq!(root.error.unwrap().problem, ProblemCode::ChildItemsFailed);
    assert!(server.state().dirs.contains("/d"));
    assert_eq!(server.count("RMD"), 0);
    let locked = coordinator
        .items()
        .into_iter()
        .find(|i| i.name == "locked.txt")
        .unwrap();
    assert_eq!(locked.state, ItemState::Failed);

    server.state().protected.clear();
    coordinator.retry_item(locked.id).unwrap();
    assert_eq!(coordinator.item(id).unwrap().state, ItemState::Delayed);
    run_to_end(&coordinator).await;

    assert_eq!(coordinator.item(id).unwrap().state, ItemState::Done);
    assert!(!server.state().dirs.contains("/d"));
    assert!(coordinator.is_finished());
}
