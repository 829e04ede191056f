mod common;

use common::*;
use sorng_ftp_engine::engine::config::EngineConfig;
use sorng_ftp_engine::engine::disk::DiskWorkDispatcher;
use sorng_ftp_engine::engine::listing_cache::ListingCache;
use sorng_ftp_engine::engine::opened_files::OpenedFiles;
use sorng_ftp_engine::engine::queue::NewItem;
use sorng_ftp_engine::engine::types::*;
use sorng_ftp_engine::engine::OperationCoordinator;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn dir_str(path: &Path) -> &str {
    path.to_str().unwrap()
}

fn logged(coordinator: &OperationCoordinator, text: &str) -> bool {
    coordinator.log_entries().iter().any(|e| e.message.contains(text))
}

#[tokio::test]
async fn test_upload_to_empty_directory() {
    let server = MockServer::new();
    server.mkdir("/up");
    let local = tempfile::tempdir().unwrap();
    std::fs::write(local.path().join("a.txt"), b"hello world\n").unwrap();

    let config = EngineConfig {
        max_workers: 1,
        ..fast_config()
    };
    let coordinator = coordinator(&server, config);
    let id = coordinator.add_item(NewItem::upload(dir_str(local.path()), "a.txt", "/up"));
    run_to_end(&coordinator).await;

    let item = coordinator.item(id).unwrap();
    assert_eq!(item.state, ItemState::Done);
    assert_eq!(item.tgt_file_state, TgtFileState::Transferred);
    assert_eq!(server.file("/up/a.txt"), Some(b"hello world\n".to_vec()));

    let commands: Vec<String> = server
        .commands()
        .into_iter()
        .filter(|c| c != "QUIT")
        .collect();
    assert_eq!(
        commands,
        vec!["CWD /up", "TYPE A", "PASV", "LIST", "TYPE I", "PASV", "STOR a.txt"]
    );
    let progress = coordinator.copy_progress();
    assert_eq!(progress.total_bytes, 12);
    assert_eq!(progress.done_bytes, 12);
}

#[tokio::test]
async fn test_resume_unsupported_falls_back_to_overwrite() {
    let source = binary(5000);
    let server = MockServer::new();
    server.mkdir("/up").put_file("/up/a.bin", &source[..2000]);
    server.state().appe_supported = false;
    let local = tempfile::tempdir().unwrap();
    std::fs::write(local.path().join("a.bin"), &source).unwrap();

    let config = EngineConfig {
        upload_file_already_exists: FileExistsPolicy::ResumeOrOverwrite,
        ..fast_config()
    };
    let coordinator = coordinator(&server, config);
    let id = coordinator.add_item(NewItem::upload(dir_str(local.path()), "a.bin", "/up"));
    run_to_end(&coordinator).await;

    assert_eq!(coordinator.item(id).unwrap().state, ItemState::Done);
    assert_eq!(server.file("/up/a.bin"), Some(source));
    assert_eq!(server.count("APPE"), 1);
    assert_eq!(server.count("STOR"), 1);
    assert!(logged(&coordinator, "Resume failed, overwriting target file"));
    assert_eq!(coordinator.simple_progress().needs_input, 0);
}

#[tokio::test]
async fn test_connection_drop_during_store_resumes() {
    let source = binary(64 * 1024);
    let server = MockServer::new();
    server.mkdir("/up");
    server.state().drop_after_bytes = Some(32 * 1024);
    let local = tempfile::tempdir().unwrap();
    std::fs::write(local.path().join("big.bin"), &source).unwrap();

    let config = EngineConfig {
        max_workers: 1,
        ..fast_config()
    };
    let coordinator = coordinator(&server, config);
    let id = coordinator.add_item(NewItem::upload(dir_str(local.path()), "big.bin", "/up"));
    run_to_end(&coordinator).await;

    let item = coordinator.item(id).unwrap();
    assert_eq!(item.state, ItemState::Done);
    assert_eq!(server.file("/up/big.bin"), Some(source));
    assert_eq!(server.count("STOR"), 1);
    assert_eq!(server.count("SIZE big.bin"), 1);
    assert_eq!(server.count("APPE big.bin"), 1);
    assert_eq!(server.state().logins, 2);
    assert!(logged(&coordinator, "Resuming at 32768"));
}

#[tokio::test]
async fn test_resumed_upload_never_shrinks_target() {
    let source = binary(4096);
    for offset in [0, 1, source.len() - 1] {
        let server = MockServer::new();
        server.mkdir("/up").put_file("/up/r.bin", &source[..offset]);
        let local = tempfile::tempdir().unwrap();
        std::fs::write(local.path().join("r.bin"), &source).unwrap();

        let config = EngineConfig {
            upload_file_already_exists: FileExistsPolicy::Resume,
            resume_min_file_size: 0,
            ..fast_config()
        };
        let coordinator = coordinator(&server, config);
        let id = coordinator.add_item(NewItem::upload(dir_str(local.path()), "r.bin", "/up"));
        run_to_end(&coordinator).await;

        let item = coordinator.item(id).unwrap();
        assert_eq!(item.state, ItemState::Done, "offset {}", offset);
        let uploaded = server.file("/up/r.bin").unwrap();
        assert!(uploaded.len() >= offset);
        assert_eq!(uploaded, source, "offset {}", offset);
        assert_eq!(server.count("APPE r.bin"), 1, "offset {}", offset);
        assert_eq!(server.count("STOR"), 0, "offset {}", offset);
    }
}

#[tokio::test]
async fn test_lost_store_reply_is_verified_by_size() {
    let text: String = (0..50).map(|i| format!("line {}\n", i)).collect();
    let server = MockServer::new();
    server.mkdir("/up");
    {
        let mut st = server.state();
        st.swallow_store_reply = true;
        st.ascii_strip_cr = true;
    }
    let local = tempfile::tempdir().unwrap();
    std::fs::write(local.path().join("notes.txt"), &text).unwrap();

    let config = EngineConfig {
        max_workers: 1,
        server_replies_timeout_sec: 1,
        ..fast_config()
    };
    let coordinator = coordinator(&server, config);
    let item = NewItem::upload(dir_str(local.path()), "notes.txt", "/up").with_type(TransferType::Ascii);
    let id = coordinator.add_item(item);
    run_to_end(&coordinator).await;

    let item = coordinator.item(id).unwrap();
    assert_eq!(item.state, ItemState::Done);
    assert_eq!(item.tgt_file_state, TgtFileState::Transferred);
    assert_eq!(server.count("STOR"), 1);
    assert_eq!(server.count("SIZE notes.txt"), 1);
    assert_eq!(server.file("/up/notes.txt"), Some(text.into_bytes()));
    assert!(logged(&coordinator, "upload had finished"));
}

#[tokio::test]
async fn test_forced_overwrite_does_not_ask_again() {
    let server = MockServer::new();
    server.mkdir("/up").put_file("/up/a.txt", b"old");
    let local = tempfile::tempdir().unwrap();
    std::fs::write(local.path().join("a.txt"), b"new content").unwrap();

    let coordinator = coordinator(&server, fast_config());
    let id = coordinator.add_item(NewItem::upload(dir_str(local.path()), "a.txt", "/up"));
    start_until(&coordinator, id, ItemState::UserInputNeeded).await;

    let item = coordinator.item(id).unwrap();
    assert_eq!(item.error.unwrap().problem, ProblemCode::UploadTgtFileAlreadyExists);
    assert_eq!(coordinator.first_error_index(), Some(0));
    assert!(!coordinator.is_finished());

    coordinator.solve_error(id, ForceAction::Overwrite).unwrap();
    finish(&coordinator).await;

    let item = coordinator.item(id).unwrap();
    assert_eq!(item.state, ItemState::Done);
    assert_eq!(item.force_action, ForceAction::None);
    assert_eq!(server.file("/up/a.txt"), Some(b"new content".to_vec()));
    assert_eq!(server.count("STOR"), 1);
    assert_eq!(coordinator.first_error_index(), None);
}

/// Upload over an existing "big.bin": the user answers the collision with
/// `action`, then the connection drops halfway through the store.
async fn interrupted_after_user_choice(action: ForceAction) -> (MockServer, OperationCoordinator, ItemId, Vec<u8>) {
    let source = binary(64 * 1024);
    let server = MockServer::new();
    server.mkdir("/up").put_file("/up/big.bin", b"old");
    let local = tempfile::tempdir().unwrap();
    std::fs::write(local.path().join("big.bin"), &source).unwrap();

    let config = EngineConfig {
        max_workers: 1,
        ..fast_config()
    };
    let coordinator = coordinator(&server, config);
    let id = coordinator.add_item(NewItem::upload(dir_str(local.path()), "big.bin", "/up"));
    start_until(&coordinator, id, ItemState::UserInputNeeded).await;

    server.state().drop_after_bytes = Some(32 * 1024);
    coordinator.solve_error(id, action).unwrap();
    finish(&coordinator).await;
    (server, coordinator, id, source)
}

#[tokio::test]
async fn test_autorenamed_upload_resumes_after_connection_drop() {
    let (server, coordinator, id, source) = interrupted_after_user_choice(ForceAction::UseAutorename).await;

    let item = coordinator.item(id).unwrap();
    assert_eq!(item.state, ItemState::Done);
    assert_eq!(item.tgt_name, "big (2).bin");
    assert_eq!(item.force_action, ForceAction::None);
    assert_eq!(server.file("/up/big (2).bin"), Some(source));
    assert_eq!(server.file("/up/big (3).bin"), None);
    assert_eq!(server.file("/up/big.bin"), Some(b"old".to_vec()));
    assert_eq!(server.count("STOR"), 1);
    assert_eq!(server.count("APPE big (2).bin"), 1);
    assert_eq!(server.state().logins, 2);
}

#[tokio::test]
async fn test_overwrite_resumes_after_connection_drop() {
    let (server, coordinator, id, source) = interrupted_after_user_choice(ForceAction::Overwrite).await;

    let item = coordinator.item(id).unwrap();
    assert_eq!(item.state, ItemState::Done);
    assert_eq!(item.force_action, ForceAction::None);
    assert_eq!(server.file("/up/big.bin"), Some(source));
    assert_eq!(server.count("STOR"), 1);
    assert_eq!(server.count("APPE big.bin"), 1);
    assert!(logged(&coordinator, "Resuming at 32768"));
}

#[tokio::test]
async fn test_many_uploads_share_one_listing() {
    let server = MockServer::new();
    server.mkdir("/up");
    let local = tempfile::tempdir().unwrap();
    let names: Vec<String> = (0..20).map(|i| format!("f{:02}.bin", i)).collect();
    for (i, name) in names.iter().enumerate() {
        std::fs::write(local.path().join(name), binary(1000 + i)).unwrap();
    }

    let config = EngineConfig {
        max_workers: 4,
        ..fast_config()
    };
    let coordinator = coordinator(&server, config);
    let ids = coordinator.add_items(
        names
            .iter()
            .map(|n| NewItem::upload(dir_str(local.path()), n, "/up")),
    );
    run_to_end(&coordinator).await;

    for id in &ids {
        assert_eq!(coordinator.item(*id).unwrap().state, ItemState::Done);
    }
    for (i, name) in names.iter().enumerate() {
        assert_eq!(server.file(&format!("/up/{}", name)), Some(binary(1000 + i)));
        assert_eq!(server.count(&format!("STOR {}", name)), 1);
    }
    assert_eq!(server.count("LIST"), 1);
    let progress = coordinator.simple_progress();
    assert_eq!(progress.done_items, 20);
    assert_eq!(progress.unresolved, 0);
}

#[tokio::test]
async fn test_download_move_deletes_source() {
    let content = binary(10_000);
    let server = MockServer::new();
    server.mkdir("/pub").put_file("/pub/data.bin", &content);
    let local = tempfile::tempdir().unwrap();

    let coordinator = coordinator(&server, fast_config());
    let item = NewItem::download_move("/pub", "data.bin", dir_str(local.path())).with_size(10_000);
    let id = coordinator.add_item(item);
    run_to_end(&coordinator).await;

    assert_eq!(coordinator.item(id).unwrap().state, ItemState::Done);
    assert_eq!(std::fs::read(local.path().join("data.bin")).unwrap(), content);
    assert_eq!(server.file("/pub/data.bin"), None);
    assert_eq!(server.count("DELE /pub/data.bin"), 1);
}

#[tokio::test]
async fn test_stop_during_download_releases_everything() {
    let server = MockServer::new();
    server.mkdir("/pub").put_file("/pub/slow.bin", &binary(400 * 1024));
    server.state().retr_delay = Some(Duration::from_millis(20));
    let local = tempfile::tempdir().unwrap();

    let opened = Arc::new(OpenedFiles::new());
    let disk = Arc::new(DiskWorkDispatcher::new().unwrap());
    let coordinator = OperationCoordinator::with_shared_state(
        EngineConfig {
            max_workers: 1,
            ..fast_config()
        },
        server.login(),
        server.connector(),
        Arc::new(ListingCache::new()),
        Arc::clone(&opened),
        Arc::clone(&disk),
    );
    let id = coordinator.add_item(NewItem::download("/pub", "slow.bin", dir_str(local.path())).with_size(400 * 1024));
    coordinator.start();

    let mut moving = false;
    for _ in 0..500 {
        if coordinator.worker_statuses().iter().any(|s| s.item_done_bytes > 0) {
            moving = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(moving, "download never started");
    assert!(!opened.is_empty());

    coordinator.stop_all().await;
    assert_eq!(coordinator.item(id).unwrap().state, ItemState::Waiting);
    assert!(opened.is_empty());
    assert_eq!(disk.queued(), 0);
    assert!(!coordinator.some_worker_is_working());
}

#[tokio::test]
async fn test_rejected_login_waits_for_new_credentials() {
    let server = MockServer::new();
    server.mkdir("/up");
    let local = tempfile::tempdir().unwrap();
    std::fs::write(local.path().join("a.txt"), b"x").unwrap();

    let mut login = server.login();
    login.password = "wrong".into();
    let config = EngineConfig {
        max_workers: 1,
        ..fast_config()
    };
    let coordinator = OperationCoordinator::new(config, login, server.connector()).unwrap();
    let id = coordinator.add_item(NewItem::upload(dir_str(local.path()), "a.txt", "/up"));
    let workers = coordinator.start();

    let mut stuck = false;
    for _ in 0..200 {
        if coordinator.have_error(0) {
            stuck = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(stuck);
    assert_eq!(coordinator.item(id).unwrap().state, ItemState::Waiting);

    coordinator
        .solve_connection_error(workers[0], Some(server.login()))
        .unwrap();
    tokio::time::timeout(Duration::from_secs(20), coordinator.wait_until_finished())
        .await
        .expect("operation did not finish");
    coordinator.stop_all().await;
    assert_eq!(coordinator.item(id).unwrap().state, ItemState::Done);
    assert_eq!(server.file("/up/a.txt"), Some(b"x".to_vec()));
}
