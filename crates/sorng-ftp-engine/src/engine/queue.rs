//! Operation queue: the items of one operation and their states.
//!
//! Items live in an id-addressed arena; workers only ever hold an
//! [`ItemId`]. Every state change goes through
//! [`OperationQueue::update_item_state`] (or the command API built on it),
//! which also keeps the parent/child counters of explored directories
//! consistent and bumps the change generation once per call.

use crate::engine::error::QueueError;
use crate::engine::types::*;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

/// Description of an item to add.
#[derive(Debug, Clone, PartialEq)]
pub struct NewItem {
    pub kind: ItemType,
    pub path: String,
    pub name: String,
    pub tgt_path: String,
    pub tgt_name: String,
    pub size: Option<u64>,
    pub transfer_type: TransferType,
    pub attrs: Option<u32>,
}

impl NewItem {
    fn new(kind: ItemType, path: &str, name: &str, tgt_path: &str, tgt_name: &str) -> Self {
        Self {
            kind,
            path: path.to_string(),
            name: name.to_string(),
            tgt_path: tgt_path.to_string(),
            tgt_name: tgt_name.to_string(),
            size: None,
            transfer_type: TransferType::Binary,
            attrs: None,
        }
    }

    /// Copy `local_dir/name` to `server_dir/name`.
    pub fn upload(local_dir: &str, name: &str, server_dir: &str) -> Self {
        Self::new(ItemType::UploadCopyFile, local_dir, name, server_dir, name)
    }

    pub fn upload_move(local_dir: &str, name: &str, server_dir: &str) -> Self {
        Self::new(ItemType::UploadMoveFile, local_dir, name, server_dir, name)
    }

    /// Copy `server_dir/name` to `local_dir/name`.
    pub fn download(server_dir: &str, name: &str, local_dir: &str) -> Self {
        Self::new(ItemType::DownloadCopyFile, server_dir, name, local_dir, name)
    }

    pub fn download_move(server_dir: &str, name: &str, local_dir: &str) -> Self {
        Self::new(ItemType::DownloadMoveFile, server_dir, name, local_dir, name)
    }

    /// Server-side item without a target (delete / change attributes).
    pub fn server(kind: ItemType, server_dir: &str, name: &str) -> Self {
        Self::new(kind, server_dir, name, "", "")
    }

    pub fn with_tgt_name(mut self, tgt_name: &str) -> Self {
        self.tgt_name = tgt_name.to_string();
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_type(mut self, transfer_type: TransferType) -> Self {
        self.transfer_type = transfer_type;
        self
    }

    pub fn with_attrs(mut self, mode: u32) -> Self {
        self.attrs = Some(mode);
        self
    }

    fn into_item(self, id: ItemId, parent: Option<ItemId>) -> QueueItem {
        QueueItem {
            id,
            kind: self.kind,
            parent,
            path: self.path,
            name: self.name,
            tgt_path: self.tgt_path,
            tgt_name: self.tgt_name,
            renamed_name: None,
            size: self.size,
            transfer_type: self.transfer_type,
            size_with_crlf_eols: 0,
            number_of_eols: 0,
            attrs: self.attrs,
            state: ItemState::Waiting,
            worker: None,
            force_action: ForceAction::None,
            tgt_file_state: TgtFileState::Unknown,
            autorename_phase: AutorenamePhase::Suffix,
            error: None,
            children_unresolved: 0,
            children_in_error: 0,
        }
    }
}

/// Items changed since the last poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangedItems {
    None,
    One(ItemId),
    Two(ItemId, ItemId),
    /// Too many to list; rescan everything.
    Many,
}

impl ChangedItems {
    fn record(&mut self, id: ItemId) {
        *self = match *self {
            Self::None => Self::One(id),
            Self::One(a) if a == id => Self::One(a),
            Self::One(a) => Self::Two(a, id),
            Self::Two(a, b) if a == id || b == id => Self::Two(a, b),
            _ => Self::Many,
        };
    }
}

#[derive(Debug)]
struct QueueInner {
    items: HashMap<ItemId, QueueItem>,
    order: Vec<ItemId>,
    changed: ChangedItems,
}

impl QueueInner {
    fn item(&self, id: ItemId) -> Result<&QueueItem, QueueError> {
        self.items.get(&id).ok_or(QueueError::ItemNotFound(id))
    }

    fn insert(&mut self, item: QueueItem, at: Option<usize>) {
        let id = item.id;
        let parent = item.parent;
        self.items.insert(id, item);
        match at {
            Some(pos) if pos <= self.order.len() => self.order.insert(pos, id),
            _ => self.order.push(id),
        }
        self.changed = ChangedItems::Many;
        if let Some(parent) = parent {
            if let Some(p) = self.items.get_mut(&parent) {
                p.children_unresolved += 1;
            }
        }
    }

    /// Set state + error and propagate the change up the parent chain.
    fn set_state(&mut self, id: ItemId, requested: ItemState, error: Option<ItemError>) {
        let Some(item) = self.items.get_mut(&id) else {
            return;
        };
        let old = item.state;
        let new = if requested == ItemState::Waiting {
            parent_state(item.children_unresolved, item.children_in_error)
        } else {
            requested
        };
        item.state = new;
        item.error = match new {
            ItemState::ForcedToFail if requested == ItemState::Waiting => Some(ItemError {
                problem: ProblemCode::ChildItemsFailed,
                os_error: None,
                detail: None,
            }),
            _ if new.is_error() => error,
            _ => None,
        };
        if new != ItemState::Processing {
            item.worker = None;
        }
        self.changed.record(id);
        self.propagate(id, old, new);
    }

    fn propagate(&mut self, mut id: ItemId, mut old: ItemState, mut new: ItemState) {
        loop {
            let Some(parent_id) = self.items.get(&id).and_then(|i| i.parent) else {
                return;
            };
            let Some(parent) = self.items.get_mut(&parent_id) else {
                return;
            };
            match (old.is_unresolved(), new.is_unresolved()) {
                (true, false) => parent.children_unresolved = parent.children_unresolved.saturating_sub(1),
                (false, true) => parent.children_unresolved += 1,
                _ => {}
            }
            match (old.is_error(), new.is_error()) {
                (true, false) => parent.children_in_error = parent.children_in_error.saturating_sub(1),
                (false, true) => parent.children_in_error += 1,
                _ => {}
            }
            let parent_old = parent.state;
            if !matches!(
                parent_old,
                ItemState::Delayed | ItemState::Waiting | ItemState::ForcedToFail
            ) {
                return;
            }
            let parent_new = parent_state(parent.children_unresolved, parent.children_in_error);
            if parent_new == parent_old {
                return;
            }
            parent.state = parent_new;
            parent.error = (parent_new == ItemState::ForcedToFail).then(|| ItemError {
                problem: ProblemCode::ChildItemsFailed,
                os_error: None,
                detail: None,
            });
            self.changed.record(parent_id);
            id = parent_id;
            old = parent_old;
            new = parent_new;
        }
    }
}

fn parent_state(unresolved: u32, in_error: u32) -> ItemState {
    if unresolved > 0 {
        ItemState::Delayed
    } else if in_error > 0 {
        ItemState::ForcedToFail
    } else {
        ItemState::Waiting
    }
}

fn error_to_solve(state: ItemState) -> bool {
    matches!(
        state,
        ItemState::Failed | ItemState::UserInputNeeded | ItemState::Skipped
    )
}

#[derive(Debug)]
pub struct OperationQueue {
    inner: Mutex<QueueInner>,
    ids: IdAllocator,
    generation: watch::Sender<u64>,
}

impl Default for OperationQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationQueue {
    pub fn new() -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            inner: Mutex::new(QueueInner {
                items: HashMap::new(),
                order: Vec::new(),
                changed: ChangedItems::None,
            }),
            ids: IdAllocator::new(),
            generation,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self) {
        self.generation.send_modify(|g| *g += 1);
    }

    /// Receiver bumped once per queue change.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    // ── Building ─────────────────────────────────────────────────────

    pub fn add_item(&self, item: NewItem) -> ItemId {
        let id = ItemId(self.ids.allocate());
        self.lock().insert(item.into_item(id, None), None);
        self.notify();
        id
    }

    pub fn add_items(&self, items: impl IntoIterator<Item = NewItem>) -> Vec<ItemId> {
        let ids: Vec<ItemId> = {
            let mut inner = self.lock();
            items
                .into_iter()
                .map(|item| {
                    let id = ItemId(self.ids.allocate());
                    inner.insert(item.into_item(id, None), None);
                    id
                })
                .collect()
        };
        self.notify();
        ids
    }

    /// Turn an explored directory into `new_kind` waiting on `children`.
    pub fn expand_explore_item(
        &self,
        id: ItemId,
        new_kind: ItemType,
        children: Vec<NewItem>,
    ) -> Result<Vec<ItemId>, QueueError> {
        let ids = {
            let mut inner = self.lock();
            let item = inner.item(id)?;
            if !item.kind.is_explore() {
                return Err(QueueError::InvalidState { id, state: item.state });
            }
            let pos = inner.order.iter().position(|i| *i == id).map(|p| p + 1);
            if let Some(item) = inner.items.get_mut(&id) {
                item.kind = new_kind;
            }
            let mut ids = Vec::with_capacity(children.len());
            for (offset, child) in children.into_iter().enumerate() {
                let child_id = ItemId(self.ids.allocate());
                inner.insert(child.into_item(child_id, Some(id)), pos.map(|p| p + offset));
                ids.push(child_id);
            }
            inner.set_state(id, ItemState::Waiting, None);
            ids
        };
        self.notify();
        Ok(ids)
    }

    // ── Reading ──────────────────────────────────────────────────────

    pub fn get(&self, id: ItemId) -> Option<QueueItem> {
        self.lock().items.get(&id).cloned()
    }

    pub fn state_of(&self, id: ItemId) -> Option<ItemState> {
        self.lock().items.get(&id).map(|i| i.state)
    }

    /// Snapshot of all items in queue order.
    pub fn items(&self) -> Vec<QueueItem> {
        let inner = self.lock();
        inner
            .order
            .iter()
            .filter_map(|id| inner.items.get(id).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_waiting(&self) -> bool {
        self.lock().items.values().any(|i| i.state == ItemState::Waiting)
    }

    /// Any item still Waiting, Processing or Delayed.
    pub fn has_unresolved(&self) -> bool {
        self.lock().items.values().any(|i| i.state.is_unresolved())
    }

    /// Nothing left to do and nothing waiting for the user.
    pub fn is_finished(&self) -> bool {
        !self
            .lock()
            .items
            .values()
            .any(|i| i.state.is_unresolved() || i.state == ItemState::UserInputNeeded)
    }

    /// Items changed since the previous call.
    pub fn get_changed_items(&self) -> ChangedItems {
        std::mem::replace(&mut self.lock().changed, ChangedItems::None)
    }

    /// Whether retry / skip / solve-error apply to the item.
    pub fn is_item_with_error_to_solve(&self, id: ItemId) -> bool {
        self.state_of(id).map_or(false, error_to_solve)
    }

    /// Queue position of the first item in an error state.
    pub fn first_error_index(&self) -> Option<usize> {
        let inner = self.lock();
        inner
            .order
            .iter()
            .position(|id| inner.items.get(id).map_or(false, |i| error_to_solve(i.state)))
    }

    pub fn simple_progress(&self) -> SimpleProgress {
        let inner = self.lock();
        let mut progress = SimpleProgress {
            total_items: inner.items.len(),
            ..SimpleProgress::default()
        };
        for item in inner.items.values() {
            match item.state {
                ItemState::Done => progress.done_items += 1,
                ItemState::Skipped => progress.skipped += 1,
                ItemState::Failed | ItemState::ForcedToFail => progress.failed += 1,
                ItemState::UserInputNeeded => progress.needs_input += 1,
                _ => progress.unresolved += 1,
            }
        }
        progress
    }

    /// (sum of known sizes of data items, sum of those already Done).
    pub fn byte_totals(&self) -> (u64, u64) {
        let inner = self.lock();
        inner
            .items
            .values()
            .filter(|i| i.kind.transfers_data())
            .fold((0, 0), |(total, done), i| {
                let size = i.size.unwrap_or(0);
                let done_add = if i.state == ItemState::Done { size } else { 0 };
                (total + size, done + done_add)
            })
    }

    // ── Work distribution ────────────────────────────────────────────

    /// Hand the next Waiting item to `worker`; explore items first.
    pub fn take_next_waiting(&self, worker: WorkerId) -> Option<ItemId> {
        let id = {
            let mut inner = self.lock();
            let waiting = |id: &&ItemId| {
                inner
                    .items
                    .get(*id)
                    .map_or(false, |i| i.state == ItemState::Waiting)
            };
            let explore = inner
                .order
                .iter()
                .filter(waiting)
                .find(|id| inner.items.get(*id).map_or(false, |i| i.kind.is_explore()))
                .copied();
            let id = explore.or_else(|| inner.order.iter().find(waiting).copied())?;
            inner.set_state(id, ItemState::Processing, None);
            if let Some(item) = inner.items.get_mut(&id) {
                item.worker = Some(worker);
            }
            id
        };
        self.notify();
        log::debug!("{} took item {}", worker, id);
        Some(id)
    }

    /// Put every item held by `worker` back to Waiting.
    pub fn release_items_of_worker(&self, worker: WorkerId) -> usize {
        let released = {
            let mut inner = self.lock();
            let held: Vec<ItemId> = inner
                .items
                .values()
                .filter(|i| i.state == ItemState::Processing && i.worker == Some(worker))
                .map(|i| i.id)
                .collect();
            for id in &held {
                inner.set_state(*id, ItemState::Waiting, None);
            }
            held.len()
        };
        if released > 0 {
            self.notify();
        }
        released
    }

    // ── Updating ─────────────────────────────────────────────────────

    /// The single state-changing entry point.
    pub fn update_item_state(
        &self,
        id: ItemId,
        state: ItemState,
        problem: ProblemCode,
        os_error: Option<i32>,
        detail: Option<String>,
    ) -> Result<(), QueueError> {
        {
            let mut inner = self.lock();
            inner.item(id)?;
            let error = (problem != ProblemCode::Ok || os_error.is_some() || detail.is_some())
                .then(|| ItemError {
                    problem,
                    os_error,
                    detail,
                });
            inner.set_state(id, state, error);
        }
        self.notify();
        Ok(())
    }

    /// Change non-state fields of an item. State, worker and error are
    /// restored afterwards; use [`update_item_state`](Self::update_item_state)
    /// for those.
    pub fn edit_item(&self, id: ItemId, f: impl FnOnce(&mut QueueItem)) -> Result<(), QueueError> {
        {
            let mut inner = self.lock();
            let item = inner.items.get_mut(&id).ok_or(QueueError::ItemNotFound(id))?;
            let (state, worker, error, parent, kind) =
                (item.state, item.worker, item.error.take(), item.parent, item.kind);
            let counters = (item.children_unresolved, item.children_in_error);
            f(item);
            item.state = state;
            item.worker = worker;
            item.error = error;
            item.parent = parent;
            item.kind = kind;
            item.id = id;
            (item.children_unresolved, item.children_in_error) = counters;
            inner.changed.record(id);
        }
        self.notify();
        Ok(())
    }

    // ── Command API ──────────────────────────────────────────────────

    fn require_error_to_solve(inner: &QueueInner, id: ItemId) -> Result<(), QueueError> {
        let item = inner.item(id)?;
        if error_to_solve(item.state) {
            Ok(())
        } else {
            Err(QueueError::InvalidState { id, state: item.state })
        }
    }

    /// Put an item in an error state back to Waiting, unchanged otherwise.
    pub fn retry_item(&self, id: ItemId) -> Result<(), QueueError> {
        {
            let mut inner = self.lock();
            Self::require_error_to_solve(&inner, id)?;
            inner.set_state(id, ItemState::Waiting, None);
        }
        self.notify();
        Ok(())
    }

    /// Skip an item that is waiting or in an error state.
    pub fn skip_item(&self, id: ItemId) -> Result<(), QueueError> {
        {
            let mut inner = self.lock();
            let item = inner.item(id)?;
            if !(error_to_solve(item.state) || item.state == ItemState::Waiting) {
                return Err(QueueError::InvalidState { id, state: item.state });
            }
            inner.set_state(
                id,
                ItemState::Skipped,
                Some(ItemError {
                    problem: ProblemCode::SkippedByUser,
                    os_error: None,
                    detail: None,
                }),
            );
        }
        self.notify();
        Ok(())
    }

    /// Re-queue with the user's decision. Solving an ASCII-for-binary
    /// problem switches the item to binary.
    pub fn solve_error(&self, id: ItemId, action: ForceAction) -> Result<(), QueueError> {
        {
            let mut inner = self.lock();
            Self::require_error_to_solve(&inner, id)?;
            if let Some(item) = inner.items.get_mut(&id) {
                item.force_action = action;
                if item.error.as_ref().map(|e| e.problem) == Some(ProblemCode::AsciiTransferForBinaryFile) {
                    item.transfer_type = TransferType::Binary;
                }
            }
            inner.set_state(id, ItemState::Waiting, None);
        }
        self.notify();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upload(name: &str) -> NewItem {
        NewItem::upload("/local", name, "/remote").with_size(10)
    }

    #[test]
    fn test_take_next_waiting_is_exclusive() {
        let queue = OperationQueue::new();
        let a = queue.add_item(upload("a"));
        let b = queue.add_item(upload("b"));
        assert_eq!(queue.take_next_waiting(WorkerId(1)), Some(a));
        assert_eq!(queue.take_next_waiting(WorkerId(2)), Some(b));
        assert_eq!(queue.take_next_waiting(WorkerId(3)), None);
        assert_eq!(queue.get(a).unwrap().worker, Some(WorkerId(1)));
    }

    #[test]
    fn test_explore_items_first() {
        let queue = OperationQueue::new();
        queue.add_item(NewItem::server(ItemType::DeleteFile, "/d", "f"));
        let explore = queue.add_item(NewItem::server(ItemType::DeleteExploreDir, "/d", "sub"));
        assert_eq!(queue.take_next_waiting(WorkerId(1)), Some(explore));
    }

    #[test]
    fn test_update_sets_error_and_clears_worker() {
        let queue = OperationQueue::new();
        let a = queue.add_item(upload("a"));
        queue.take_next_waiting(WorkerId(1));
        queue
            .update_item_state(a, ItemState::Failed, ProblemCode::TgtFileInUse, None, Some("busy".into()))
            .unwrap();
        let item = queue.get(a).unwrap();
        assert_eq!(item.state, ItemState::Failed);
        assert_eq!(item.worker, None);
        assert_eq!(item.error.unwrap().problem, ProblemCode::TgtFileInUse);
        assert!(queue.is_item_with_error_to_solve(a));
        assert_eq!(queue.first_error_index(), Some(0));
    }

    #[test]
    fn test_changed_items() {
        let queue = OperationQueue::new();
        let a = queue.add_item(upload("a"));
        let b = queue.add_item(upload("b"));
        let c = queue.add_item(upload("c"));
        assert_eq!(queue.get_changed_items(), ChangedItems::Many);
        assert_eq!(queue.get_changed_items(), ChangedItems::None);
        queue.update_item_state(a, ItemState::Done, ProblemCode::Ok, None, None).unwrap();
        assert_eq!(queue.get_changed_items(), ChangedItems::One(a));
        queue.update_item_state(a, ItemState::Waiting, ProblemCode::Ok, None, None).unwrap();
        queue.update_item_state(b, ItemState::Done, ProblemCode::Ok, None, None).unwrap();
        assert_eq!(queue.get_changed_items(), ChangedItems::Two(a, b));
        for id in [a, b, c] {
            queue.update_item_state(id, ItemState::Skipped, ProblemCode::SkippedByUser, None, None).unwrap();
        }
        assert_eq!(queue.get_changed_items(), ChangedItems::Many);
    }

    #[test]
    fn test_one_notification_per_update() {
        let queue = OperationQueue::new();
        let a = queue.add_item(upload("a"));
        let rx = queue.subscribe();
        let before = *rx.borrow();
        queue.update_item_state(a, ItemState::Done, ProblemCode::Ok, None, None).unwrap();
        assert_eq!(*rx.borrow(), before + 1);
    }

    #[test]
    fn test_explore_expansion_and_parent_states() {
        let queue = OperationQueue::new();
        let dir = queue.add_item(NewItem::server(ItemType::DeleteExploreDir, "/", "tmp"));
        assert_eq!(queue.take_next_waiting(WorkerId(1)), Some(dir));
        let kids = queue
            .expand_explore_item(
                dir,
                ItemType::DeleteDir,
                vec![
                    NewItem::server(ItemType::DeleteFile, "/tmp", "a"),
                    NewItem::server(ItemType::DeleteFile, "/tmp", "b"),
                ],
            )
            .unwrap();
        let parent = queue.get(dir).unwrap();
        assert_eq!(parent.kind, ItemType::DeleteDir);
        assert_eq!(parent.state, ItemState::Delayed);
        assert_eq!(parent.children_unresolved, 2);

        queue.update_item_state(kids[0], ItemState::Done, ProblemCode::Ok, None, None).unwrap();
        queue
            .update_item_state(kids[1], ItemState::Failed, ProblemCode::UnableToDeleteFile, None, None)
            .unwrap();
        let parent = queue.get(dir).unwrap();
        assert_eq!(parent.state, ItemState::ForcedToFail);
        assert_eq!(parent.error.unwrap().problem, ProblemCode::ChildItemsFailed);
        assert!(!queue.is_item_with_error_to_solve(dir));

        queue.retry_item(kids[1]).unwrap();
        assert_eq!(queue.state_of(dir), Some(ItemState::Delayed));
        queue.update_item_state(kids[1], ItemState::Done, ProblemCode::Ok, None, None).unwrap();
        assert_eq!(queue.state_of(dir), Some(ItemState::Waiting));
    }

    #[test]
    fn test_nested_parents() {
        let queue = OperationQueue::new();
        let top = queue.add_item(NewItem::server(ItemType::DeleteExploreDir, "/", "a"));
        queue.take_next_waiting(WorkerId(1));
        let sub = queue
            .expand_explore_item(top, ItemType::DeleteDir, vec![NewItem::server(ItemType::DeleteExploreDir, "/a", "b")])
            .unwrap()[0];
        assert_eq!(queue.take_next_waiting(WorkerId(1)), Some(sub));
        let leaf = queue
            .expand_explore_item(sub, ItemType::DeleteDir, vec![NewItem::server(ItemType::DeleteFile, "/a/b", "f")])
            .unwrap()[0];
        queue.update_item_state(leaf, ItemState::Skipped, ProblemCode::SkippedByUser, None, None).unwrap();
        assert_eq!(queue.state_of(sub), Some(ItemState::ForcedToFail));
        assert_eq!(queue.state_of(top), Some(ItemState::ForcedToFail));
    }

    #[test]
    fn test_command_api_rejects_wrong_states() {
        let queue = OperationQueue::new();
        let a = queue.add_item(upload("a"));
        assert_eq!(
            queue.retry_item(a),
            Err(QueueError::InvalidState { id: a, state: ItemState::Waiting })
        );
        assert_eq!(queue.retry_item(ItemId(999)), Err(QueueError::ItemNotFound(ItemId(999))));
        queue.skip_item(a).unwrap();
        assert_eq!(queue.get(a).unwrap().error.unwrap().problem, ProblemCode::SkippedByUser);
        queue.retry_item(a).unwrap();
        assert_eq!(queue.state_of(a), Some(ItemState::Waiting));
    }

    #[test]
    fn test_solve_error_sets_force_action() {
        let queue = OperationQueue::new();
        let a = queue.add_item(upload("a").with_type(TransferType::Ascii));
        queue
            .update_item_state(a, ItemState::UserInputNeeded, ProblemCode::AsciiTransferForBinaryFile, None, None)
            .unwrap();
        queue.solve_error(a, ForceAction::Overwrite).unwrap();
        let item = queue.get(a).unwrap();
        assert_eq!(item.state, ItemState::Waiting);
        assert_eq!(item.force_action, ForceAction::Overwrite);
        assert_eq!(item.transfer_type, TransferType::Binary);
        assert!(item.error.is_none());
    }

    #[test]
    fn test_edit_item_cannot_change_state() {
        let queue = OperationQueue::new();
        let a = queue.add_item(upload("a"));
        queue
            .edit_item(a, |item| {
                item.state = ItemState::Done;
                item.tgt_file_state = TgtFileState::Created;
            })
            .unwrap();
        let item = queue.get(a).unwrap();
        assert_eq!(item.state, ItemState::Waiting);
        assert_eq!(item.tgt_file_state, TgtFileState::Created);
    }

    #[test]
    fn test_progress_and_finish() {
        let queue = OperationQueue::new();
        let a = queue.add_item(upload("a"));
        let b = queue.add_item(upload("b"));
        assert!(!queue.is_finished());
        queue.update_item_state(a, ItemState::Done, ProblemCode::Ok, None, None).unwrap();
        queue
            .update_item_state(b, ItemState::UserInputNeeded, ProblemCode::UploadTgtFileAlreadyExists, None, None)
            .unwrap();
        assert!(!queue.has_unresolved());
        assert!(!queue.is_finished());
        assert_eq!(queue.byte_totals(), (20, 10));
        let p = queue.simple_progress();
        assert_eq!((p.total_items, p.done_items, p.needs_input), (2, 1, 1));
        queue.skip_item(b).unwrap();
        assert!(queue.is_finished());
    }

    #[test]
    fn test_release_items_of_worker() {
        let queue = OperationQueue::new();
        let a = queue.add_item(upload("a"));
        queue.take_next_waiting(WorkerId(4));
        assert_eq!(queue.release_items_of_worker(WorkerId(4)), 1);
        assert_eq!(queue.state_of(a), Some(ItemState::Waiting));
    }
}
