//! Shared cache of server directory listings.
//!
//! Keyed by (user, host, port, path). Exactly one worker is told to
//! fetch a missing listing; everybody else asking meanwhile is told to
//! wait and is woken through the generation counter returned by
//! [`ListingCache::subscribe`]. Workers keep the cache in step with their
//! own STOR/DELE/RMD instead of re-listing after every change.

use crate::engine::types::{EntryKind, ListedSize, ListingEntry, ServerScope, WorkerId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ListingKey {
    scope: ServerScope,
    path: String,
}

impl ListingKey {
    fn new(scope: &ServerScope, path: &str) -> Self {
        Self {
            scope: scope.clone(),
            path: path.to_string(),
        }
    }
}

#[derive(Debug)]
enum Slot {
    Ready(Arc<Vec<ListingEntry>>),
    InProgress { fetcher: WorkerId, stale: bool },
    NotAccessible,
}

/// Answer of [`ListingCache::get_listing`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListingQuery {
    Ready(Arc<Vec<ListingEntry>>),
    /// The caller must run LIST and report the result.
    Fetch,
    /// Somebody else is fetching; re-query after the next generation bump.
    Wait,
    NotAccessible,
}

/// Find `name` in a listing.
pub fn find_entry<'a>(listing: &'a [ListingEntry], name: &str) -> Option<&'a ListingEntry> {
    listing.iter().find(|e| e.name == name)
}

#[derive(Debug)]
pub struct ListingCache {
    slots: Mutex<HashMap<ListingKey, Slot>>,
    generation: watch::Sender<u64>,
}

impl Default for ListingCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ListingCache {
    pub fn new() -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            slots: Mutex::new(HashMap::new()),
            generation,
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<ListingKey, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bump(&self) {
        self.generation.send_modify(|g| *g += 1);
    }

    /// Receiver that changes whenever a fetch ends or a listing is dropped.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    pub fn get_listing(&self, scope: &ServerScope, path: &str, worker: WorkerId) -> ListingQuery {
        let key = ListingKey::new(scope, path);
        let mut slots = self.slots();
        match slots.get(&key) {
            Some(Slot::Ready(listing)) => ListingQuery::Ready(Arc::clone(listing)),
            Some(Slot::NotAccessible) => ListingQuery::NotAccessible,
            Some(Slot::InProgress { fetcher, .. }) if *fetcher == worker => ListingQuery::Fetch,
            Some(Slot::InProgress { .. }) => ListingQuery::Wait,
            None => {
                slots.insert(key, Slot::InProgress { fetcher: worker, stale: false });
                log::debug!("{} fetches listing of {}", worker, path);
                ListingQuery::Fetch
            }
        }
    }

    /// Store the listing fetched by `worker`.
    pub fn listing_finished(
        &self,
        scope: &ServerScope,
        path: &str,
        worker: WorkerId,
        entries: Vec<ListingEntry>,
    ) {
        let key = ListingKey::new(scope, path);
        {
            let mut slots = self.slots();
            let stale = match slots.get(&key) {
                Some(Slot::InProgress { fetcher, stale }) if *fetcher == worker => *stale,
                _ => return,
            };
            if stale {
                slots.remove(&key);
            } else {
                slots.insert(key, Slot::Ready(Arc::new(entries)));
            }
        }
        self.bump();
    }

    /// The fetch by `worker` ended without a listing. With `not_accessible`
    /// the path is remembered as unlistable; otherwise the next query
    /// fetches again.
    pub fn listing_failed(&self, scope: &ServerScope, path: &str, worker: WorkerId, not_accessible: bool) {
        let key = ListingKey::new(scope, path);
        {
            let mut slots = self.slots();
            if !matches!(slots.get(&key), Some(Slot::InProgress { fetcher, .. }) if *fetcher == worker) {
                return;
            }
            if not_accessible {
                slots.insert(key, Slot::NotAccessible);
            } else {
                slots.remove(&key);
            }
        }
        self.bump();
    }

    /// STOR/APPE was sent for `name`: it exists now, size unknown until reported.
    pub fn report_store_file(&self, scope: &ServerScope, path: &str, name: &str) {
        self.with_listing(scope, path, |entries| {
            match entries.iter_mut().find(|e| e.name == name) {
                Some(entry) => {
                    entry.kind = EntryKind::File;
                    entry.size = ListedSize::NeedsUpdate;
                }
                None => entries.push(ListingEntry {
                    name: name.to_string(),
                    kind: EntryKind::File,
                    size: ListedSize::NeedsUpdate,
                }),
            }
        });
    }

    /// Upload of `name` finished with the given size.
    pub fn report_file_uploaded(&self, scope: &ServerScope, path: &str, name: &str, size: ListedSize) {
        self.with_listing(scope, path, |entries| {
            match entries.iter_mut().find(|e| e.name == name) {
                Some(entry) => entry.size = size,
                None => entries.push(ListingEntry {
                    name: name.to_string(),
                    kind: EntryKind::File,
                    size,
                }),
            }
        });
    }

    /// `name` was deleted (DELE or RMD).
    pub fn report_delete(&self, scope: &ServerScope, path: &str, name: &str) {
        self.with_listing(scope, path, |entries| entries.retain(|e| e.name != name));
    }

    /// Forget the listing; a running fetch is discarded when it ends.
    pub fn invalidate_path_listing(&self, scope: &ServerScope, path: &str) {
        let key = ListingKey::new(scope, path);
        let changed = {
            let mut slots = self.slots();
            let drop_slot = match slots.get_mut(&key) {
                Some(Slot::InProgress { stale, .. }) => {
                    *stale = true;
                    false
                }
                Some(_) => true,
                None => false,
            };
            if drop_slot {
                slots.remove(&key);
            }
            drop_slot
        };
        if changed {
            log::debug!("Listing of {} invalidated", path);
            self.bump();
        }
    }

    /// Edit a ready listing in place (copy-on-write against readers
    /// still holding the previous snapshot).
    fn with_listing(&self, scope: &ServerScope, path: &str, f: impl FnOnce(&mut Vec<ListingEntry>)) {
        let key = ListingKey::new(scope, path);
        let mut slots = self.slots();
        if let Some(Slot::Ready(listing)) = slots.get_mut(&key) {
            f(Arc::make_mut(listing));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope() -> ServerScope {
        ServerScope::new("anonymous", "ftp.example.com", 21)
    }

    fn file(name: &str, size: u64) -> ListingEntry {
        ListingEntry {
            name: name.into(),
            kind: EntryKind::File,
            size: ListedSize::Known(size),
        }
    }

    #[test]
    fn test_single_fetcher() {
        let cache = ListingCache::new();
        let (w1, w2, w3) = (WorkerId(1), WorkerId(2), WorkerId(3));
        assert_eq!(cache.get_listing(&scope(), "/up", w1), ListingQuery::Fetch);
        assert_eq!(cache.get_listing(&scope(), "/up", w2), ListingQuery::Wait);
        assert_eq!(cache.get_listing(&scope(), "/up", w3), ListingQuery::Wait);
        cache.listing_finished(&scope(), "/up", w1, vec![file("a.txt", 3)]);
        match cache.get_listing(&scope(), "/up", w2) {
            ListingQuery::Ready(l) => assert_eq!(find_entry(&l, "a.txt"), Some(&file("a.txt", 3))),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_failed_fetch_hands_over() {
        let cache = ListingCache::new();
        let mut rx = cache.subscribe();
        rx.borrow_and_update();
        assert_eq!(cache.get_listing(&scope(), "/d", WorkerId(1)), ListingQuery::Fetch);
        assert_eq!(cache.get_listing(&scope(), "/d", WorkerId(2)), ListingQuery::Wait);
        cache.listing_failed(&scope(), "/d", WorkerId(1), false);
        assert!(rx.has_changed().unwrap());
        assert_eq!(cache.get_listing(&scope(), "/d", WorkerId(2)), ListingQuery::Fetch);
    }

    #[test]
    fn test_not_accessible() {
        let cache = ListingCache::new();
        cache.get_listing(&scope(), "/secret", WorkerId(1));
        cache.listing_failed(&scope(), "/secret", WorkerId(1), true);
        assert_eq!(cache.get_listing(&scope(), "/secret", WorkerId(2)), ListingQuery::NotAccessible);
        cache.invalidate_path_listing(&scope(), "/secret");
        assert_eq!(cache.get_listing(&scope(), "/secret", WorkerId(2)), ListingQuery::Fetch);
    }

    #[test]
    fn test_reports_update_listing() {
        let cache = ListingCache::new();
        cache.get_listing(&scope(), "/up", WorkerId(1));
        cache.listing_finished(&scope(), "/up", WorkerId(1), vec![file("old.bin", 9)]);
        let before = match cache.get_listing(&scope(), "/up", WorkerId(1)) {
            ListingQuery::Ready(l) => l,
            other => panic!("unexpected {:?}", other),
        };

        cache.report_store_file(&scope(), "/up", "new.bin");
        cache.report_delete(&scope(), "/up", "old.bin");
        let after = match cache.get_listing(&scope(), "/up", WorkerId(1)) {
            ListingQuery::Ready(l) => l,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].size, ListedSize::NeedsUpdate);
        assert_eq!(before.len(), 1);
        assert_eq!(before[0].name, "old.bin");

        cache.report_file_uploaded(&scope(), "/up", "new.bin", ListedSize::Known(42));
        match cache.get_listing(&scope(), "/up", WorkerId(1)) {
            ListingQuery::Ready(l) => assert_eq!(l[0].size, ListedSize::Known(42)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_invalidate_during_fetch_discards_result() {
        let cache = ListingCache::new();
        cache.get_listing(&scope(), "/up", WorkerId(1));
        cache.invalidate_path_listing(&scope(), "/up");
        cache.listing_finished(&scope(), "/up", WorkerId(1), vec![file("x", 1)]);
        assert_eq!(cache.get_listing(&scope(), "/up", WorkerId(2)), ListingQuery::Fetch);
    }
}
