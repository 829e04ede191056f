//! Worker pool: spawns worker tasks and keeps a handle per worker.

use crate::engine::error::QueueError;
use crate::engine::types::*;
use crate::engine::worker::{OperationShared, Worker, WorkerCommand};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

struct WorkerHandle {
    id: WorkerId,
    commands: mpsc::UnboundedSender<WorkerCommand>,
    status: Arc<Mutex<WorkerStatus>>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    fn status(&self) -> WorkerStatus {
        self.status.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn post(&self, cmd: WorkerCommand) {
        if self.commands.send(cmd).is_err() {
            log::debug!("{} is gone, {:?} dropped", self.id, cmd);
        }
    }
}

/// The workers of one operation, in creation order.
pub struct WorkerPool {
    shared: Arc<OperationShared>,
    workers: Mutex<Vec<WorkerHandle>>,
    ids: IdAllocator,
}

impl WorkerPool {
    pub fn new(shared: Arc<OperationShared>) -> Self {
        Self {
            shared,
            workers: Mutex::new(Vec::new()),
            ids: IdAllocator::new(),
        }
    }

    fn workers(&self) -> MutexGuard<'_, Vec<WorkerHandle>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawn `count` workers. Must be called inside a tokio runtime.
    pub fn start(&self, count: usize) -> Vec<WorkerId> {
        (0..count).map(|_| self.add_worker()).collect()
    }

    pub fn add_worker(&self) -> WorkerId {
        let id = WorkerId(self.ids.allocate());
        let (tx, rx) = mpsc::unbounded_channel();
        let status = Arc::new(Mutex::new(WorkerStatus::new(id)));
        let worker = Worker::new(id, Arc::clone(&self.shared), rx, Arc::clone(&status));
        let task = tokio::spawn(worker.run());
        self.workers().push(WorkerHandle {
            id,
            commands: tx,
            status,
            task,
        });
        log::info!("{} spawned", id);
        id
    }

    /// Stop a worker and wait until it has finished.
    pub async fn remove_worker(&self, id: WorkerId) -> Result<(), QueueError> {
        let handle = {
            let mut workers = self.workers();
            let pos = workers
                .iter()
                .position(|w| w.id == id)
                .ok_or(QueueError::WorkerNotFound(id))?;
            workers.remove(pos)
        };
        handle.post(WorkerCommand::Stop);
        if let Err(e) = handle.task.await {
            log::error!("{} task failed: {}", id, e);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.workers().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn worker_ids(&self) -> Vec<WorkerId> {
        self.workers().iter().map(|w| w.id).collect()
    }

    pub fn statuses(&self) -> Vec<WorkerStatus> {
        self.workers().iter().map(WorkerHandle::status).collect()
    }

    pub fn status(&self, id: WorkerId) -> Option<WorkerStatus> {
        self.workers().iter().find(|w| w.id == id).map(WorkerHandle::status)
    }

    pub fn post(&self, id: WorkerId, cmd: WorkerCommand) -> Result<(), QueueError> {
        let workers = self.workers();
        let handle = workers
            .iter()
            .find(|w| w.id == id)
            .ok_or(QueueError::WorkerNotFound(id))?;
        handle.post(cmd);
        Ok(())
    }

    pub fn post_all(&self, cmd: WorkerCommand) {
        for handle in self.workers().iter() {
            handle.post(cmd);
        }
    }

    // ── Aggregates ───────────────────────────────────────────────────

    pub fn some_worker_is_working(&self) -> bool {
        self.count_working() > 0
    }

    pub fn count_working(&self) -> usize {
        self.statuses()
            .iter()
            .filter(|s| s.state == WorkerState::Working)
            .count()
    }

    /// The worker at `index` is stuck on a connection error.
    pub fn have_error(&self, index: usize) -> bool {
        self.workers()
            .get(index)
            .map_or(false, |w| w.status().state == WorkerState::ConnectionError)
    }

    pub fn any_error(&self) -> bool {
        self.statuses()
            .iter()
            .any(|s| s.state == WorkerState::ConnectionError)
    }

    pub fn any_paused(&self) -> bool {
        self.statuses().iter().any(|s| s.paused)
    }

    /// Bytes of unfinished items moved so far.
    pub fn current_item_bytes(&self) -> u64 {
        self.statuses()
            .iter()
            .filter(|s| s.current_item.is_some())
            .map(|s| s.item_done_bytes)
            .sum()
    }

    // ── Signals ──────────────────────────────────────────────────────

    /// New login parameters for one worker or, with `None`, for all.
    pub fn post_login_changed(&self, worker: Option<WorkerId>) -> Result<(), QueueError> {
        match worker {
            Some(id) => self.post(id, WorkerCommand::LoginChanged),
            None => {
                self.post_all(WorkerCommand::LoginChanged);
                Ok(())
            }
        }
    }

    /// Wake idle workers; with `first_only` just the first idle one.
    pub fn post_new_work_available(&self, first_only: bool) {
        let workers = self.workers();
        let idle = workers.iter().filter(|w| {
            matches!(
                w.status().state,
                WorkerState::LookingForWork | WorkerState::Sleeping
            )
        });
        if first_only {
            if let Some(handle) = idle.take(1).next() {
                handle.post(WorkerCommand::WakeUp);
            }
        } else {
            idle.for_each(|w| w.post(WorkerCommand::WakeUp));
        }
    }

    /// Stop every worker and wait for all of them.
    pub async fn stop_all(&self) {
        let handles: Vec<WorkerHandle> = self.workers().drain(..).collect();
        for handle in &handles {
            handle.post(WorkerCommand::Stop);
        }
        for handle in handles {
            if let Err(e) = handle.task.await {
                log::error!("{} task failed: {}", handle.id, e);
            }
        }
        log::info!("All workers stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for handle in self.workers().iter() {
            handle.task.abort();
        }
    }
}
