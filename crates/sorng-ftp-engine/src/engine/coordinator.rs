//! High-level orchestrator. Owns the queue, the shared caches and the
//! worker pool of one operation and exposes the snapshot and command API
//! the UI layer talks to.

use crate::engine::config::{EngineConfig, LoginParams};
use crate::engine::connection::{Connector, TcpConnector};
use crate::engine::disk::DiskWorkDispatcher;
use crate::engine::error::{FtpResult, QueueError};
use crate::engine::listing_cache::ListingCache;
use crate::engine::opened_files::OpenedFiles;
use crate::engine::oplog::LogEntry;
use crate::engine::pool::WorkerPool;
use crate::engine::queue::{ChangedItems, NewItem, OperationQueue};
use crate::engine::types::*;
use crate::engine::worker::{OperationShared, WorkerCommand};
use log::info;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

pub struct OperationCoordinator {
    shared: Arc<OperationShared>,
    pool: WorkerPool,
    started: Mutex<Option<Instant>>,
}

impl OperationCoordinator {
    /// Operation with its own listing cache, opened-files table and disk
    /// dispatcher.
    pub fn new(config: EngineConfig, login: LoginParams, connector: Arc<dyn Connector>) -> FtpResult<Self> {
        config.validate()?;
        let disk = Arc::new(DiskWorkDispatcher::new()?);
        Ok(Self::with_shared_state(
            config,
            login,
            connector,
            Arc::new(ListingCache::new()),
            Arc::new(OpenedFiles::new()),
            disk,
        ))
    }

    /// Operation over plain TCP.
    pub fn tcp(config: EngineConfig, login: LoginParams) -> FtpResult<Self> {
        let connector = TcpConnector::new(
            Duration::from_secs(config.server_replies_timeout_sec.max(1)),
            config.reply_timeout(),
            config.data_timeout(),
        );
        Self::new(config, login, Arc::new(connector))
    }

    /// Operation sharing the listing cache, opened-files table and disk
    /// dispatcher with other operations of the same process.
    pub fn with_shared_state(
        config: EngineConfig,
        login: LoginParams,
        connector: Arc<dyn Connector>,
        cache: Arc<ListingCache>,
        opened: Arc<OpenedFiles>,
        disk: Arc<DiskWorkDispatcher>,
    ) -> Self {
        let shared = Arc::new(OperationShared::new(config, login, connector, cache, opened, disk));
        let pool = WorkerPool::new(Arc::clone(&shared));
        Self {
            shared,
            pool,
            started: Mutex::new(None),
        }
    }

    pub fn queue(&self) -> &OperationQueue {
        &self.shared.queue
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    // ─── Building the operation ──────────────────────────────────

    pub fn add_item(&self, item: NewItem) -> ItemId {
        let id = self.shared.queue.add_item(item);
        self.pool.post_new_work_available(true);
        id
    }

    pub fn add_items(&self, items: impl IntoIterator<Item = NewItem>) -> Vec<ItemId> {
        let ids = self.shared.queue.add_items(items);
        self.pool.post_new_work_available(false);
        ids
    }

    /// Spawn `maxWorkers` workers. Must be called inside a tokio runtime.
    pub fn start(&self) -> Vec<WorkerId> {
        let count = self.shared.config.max_workers;
        self.started
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_insert_with(Instant::now);
        info!("Starting operation with {} workers on {}", count, self.shared.login().host);
        self.pool.start(count)
    }

    // ─── Snapshots ───────────────────────────────────────────────

    pub fn copy_progress(&self) -> CopyProgress {
        let (total_bytes, finished_bytes) = self.shared.queue.byte_totals();
        let in_flight = self.pool.current_item_bytes();
        let done_bytes = (finished_bytes + in_flight).min(total_bytes);
        let speed_bps = self.shared.speed().speed();
        let eta_secs = (speed_bps > 0).then(|| (total_bytes - done_bytes) / speed_bps);
        let elapsed_secs = self
            .started
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .map_or(0, |t| t.elapsed().as_secs());
        CopyProgress {
            total_bytes,
            done_bytes,
            speed_bps,
            eta_secs,
            elapsed_secs,
        }
    }

    pub fn simple_progress(&self) -> SimpleProgress {
        self.shared.queue.simple_progress()
    }

    pub fn worker_statuses(&self) -> Vec<WorkerStatus> {
        self.pool.statuses()
    }

    pub fn worker_status(&self, worker: WorkerId) -> Option<WorkerStatus> {
        self.pool.status(worker)
    }

    pub fn items(&self) -> Vec<QueueItem> {
        self.shared.queue.items()
    }

    pub fn item(&self, id: ItemId) -> Option<QueueItem> {
        self.shared.queue.get(id)
    }

    pub fn changed_items(&self) -> ChangedItems {
        self.shared.queue.get_changed_items()
    }

    pub fn log_entries(&self) -> Vec<LogEntry> {
        self.shared.oplog.entries()
    }

    pub fn log_entries_since(&self, from: usize) -> Vec<LogEntry> {
        self.shared.oplog.entries_since(from)
    }

    pub fn first_error_index(&self) -> Option<usize> {
        self.shared.queue.first_error_index()
    }

    pub fn is_finished(&self) -> bool {
        self.shared.queue.is_finished()
    }

    pub fn some_worker_is_working(&self) -> bool {
        self.pool.some_worker_is_working()
    }

    pub fn have_error(&self, index: usize) -> bool {
        self.pool.have_error(index)
    }

    /// Resolves once no item is unresolved or waiting for the user.
    pub async fn wait_until_finished(&self) {
        loop {
            let mut rx = self.shared.queue.subscribe();
            if self.shared.queue.is_finished() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    // ─── Worker commands ─────────────────────────────────────────

    pub fn pause_worker(&self, worker: WorkerId) -> Result<(), QueueError> {
        self.pool.post(worker, WorkerCommand::Pause)
    }

    pub fn resume_worker(&self, worker: WorkerId) -> Result<(), QueueError> {
        self.pool.post(worker, WorkerCommand::Resume)
    }

    pub fn pause_all(&self) {
        self.pool.post_all(WorkerCommand::Pause);
    }

    pub fn resume_all(&self) {
        self.pool.post_all(WorkerCommand::Resume);
    }

    pub async fn stop_worker(&self, worker: WorkerId) -> Result<(), QueueError> {
        self.pool.remove_worker(worker).await
    }

    pub async fn stop_all(&self) {
        self.pool.stop_all().await;
        info!("Operation stopped");
    }

    pub fn add_worker(&self) -> WorkerId {
        self.pool.add_worker()
    }

    pub async fn remove_worker(&self, worker: WorkerId) -> Result<(), QueueError> {
        self.pool.remove_worker(worker).await
    }

    // ─── Item commands ───────────────────────────────────────────

    pub fn retry_item(&self, id: ItemId) -> Result<(), QueueError> {
        self.shared.queue.retry_item(id)?;
        self.shared.caps.reset_resume();
        self.pool.post_new_work_available(true);
        Ok(())
    }

    pub fn skip_item(&self, id: ItemId) -> Result<(), QueueError> {
        self.shared.queue.skip_item(id)?;
        self.pool.post_new_work_available(true);
        Ok(())
    }

    /// Re-queue an item with the user's answer to its problem.
    pub fn solve_error(&self, id: ItemId, action: ForceAction) -> Result<(), QueueError> {
        self.shared.queue.solve_error(id, action)?;
        self.shared.caps.reset_resume();
        self.pool.post_new_work_available(true);
        Ok(())
    }

    // ─── Connection commands ─────────────────────────────────────

    /// Let a worker stuck in `ConnectionError` try again, optionally with
    /// new credentials.
    pub fn solve_connection_error(&self, worker: WorkerId, login: Option<LoginParams>) -> Result<(), QueueError> {
        let status = self.pool.status(worker).ok_or(QueueError::WorkerNotFound(worker))?;
        if status.state != WorkerState::ConnectionError {
            return Err(QueueError::NoConnectionError(worker));
        }
        if let Some(login) = login {
            self.shared.set_login(login);
        }
        self.pool.post_login_changed(Some(worker))
    }

    /// Replace the login parameters of every worker.
    pub fn set_login(&self, login: LoginParams) {
        self.shared.set_login(login);
        let _ = self.pool.post_login_changed(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::connection::ControlConnection;
    use crate::engine::error::FtpError;
    use async_trait::async_trait;

    struct Unreachable;

    #[async_trait]
    impl Connector for Unreachable {
        async fn connect(&self, _login: &LoginParams) -> FtpResult<Box<dyn ControlConnection>> {
            Err(FtpError::auth_failed("530 Not logged in"))
        }
    }

    fn coordinator() -> OperationCoordinator {
        OperationCoordinator::new(
            EngineConfig::default(),
            LoginParams::new("ftp.example.com", 21, "anna", "pw"),
            Arc::new(Unreachable),
        )
        .unwrap()
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = EngineConfig {
            max_workers: 0,
            ..EngineConfig::default()
        };
        let result = OperationCoordinator::new(config, LoginParams::new("h", 21, "u", "p"), Arc::new(Unreachable));
        assert!(result.is_err());
    }

    #[test]
    fn test_progress_is_read_only() {
        let coordinator = coordinator();
        coordinator.add_items(vec![
            NewItem::upload("/l", "a", "/r").with_size(100),
            NewItem::upload("/l", "b", "/r").with_size(50),
            NewItem::server(ItemType::DeleteFile, "/r", "c"),
        ]);
        let before = coordinator.items();
        let progress = coordinator.copy_progress();
        assert_eq!(progress.total_bytes, 150);
        assert_eq!(progress.done_bytes, 0);
        assert_eq!(progress.eta_secs, None);
        assert_eq!(progress.elapsed_secs, 0);
        let simple = coordinator.simple_progress();
        assert_eq!(simple.total_items, 3);
        assert_eq!(simple.unresolved, 3);
        assert_eq!(coordinator.items(), before);
        assert!(!coordinator.is_finished());
    }

    #[test]
    fn test_item_commands_check_state() {
        let coordinator = coordinator();
        let id = coordinator.add_item(NewItem::server(ItemType::DeleteFile, "/r", "c"));
        assert_eq!(
            coordinator.retry_item(id),
            Err(QueueError::InvalidState {
                id,
                state: ItemState::Waiting
            })
        );
        assert_eq!(coordinator.retry_item(ItemId(77)), Err(QueueError::ItemNotFound(ItemId(77))));
        coordinator.skip_item(id).unwrap();
        assert!(coordinator.is_finished());
        assert_eq!(coordinator.simple_progress().skipped, 1);
    }

    #[tokio::test]
    async fn test_solve_connection_error() {
        let coordinator = coordinator();
        coordinator.add_item(NewItem::server(ItemType::DeleteFile, "/r", "c"));
        assert_eq!(
            coordinator.solve_connection_error(WorkerId(1), None),
            Err(QueueError::WorkerNotFound(WorkerId(1)))
        );
        let workers = coordinator.start();
        assert_eq!(workers.len(), 3);
        let mut stuck = false;
        for _ in 0..200 {
            if coordinator.have_error(0) {
                stuck = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(stuck);
        let login = LoginParams::new("ftp.example.com", 21, "anna", "new password");
        assert_eq!(coordinator.solve_connection_error(workers[0], Some(login)), Ok(()));
        coordinator.stop_all().await;
        assert!(coordinator.worker_statuses().is_empty());
        assert_eq!(coordinator.queue().state_of(ItemId(1)), Some(ItemState::Waiting));
    }
}
