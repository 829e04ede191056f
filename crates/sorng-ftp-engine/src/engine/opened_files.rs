//! Server files currently targeted by some worker.
//!
//! Two workers must never write the same server file, and nobody may
//! write a file another worker is reading. Readers share, a writer is
//! exclusive. A lock lives as long as the returned [`FileLock`].

use crate::engine::types::ServerScope;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileAccess {
    Read,
    Write,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct OpenedKey {
    scope: ServerScope,
    path: String,
    name: String,
}

#[derive(Debug, Default)]
struct Usage {
    readers: u32,
    writer: bool,
}

type Table = Arc<Mutex<HashMap<OpenedKey, Usage>>>;

fn guard(table: &Table) -> MutexGuard<'_, HashMap<OpenedKey, Usage>> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Process-wide table; clones share the same storage.
#[derive(Debug, Clone, Default)]
pub struct OpenedFiles {
    table: Table,
}

impl OpenedFiles {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `path/name` for `access`; `None` when it conflicts with
    /// a lock held elsewhere.
    pub fn try_lock(
        &self,
        scope: &ServerScope,
        path: &str,
        name: &str,
        access: FileAccess,
    ) -> Option<FileLock> {
        let key = OpenedKey {
            scope: scope.clone(),
            path: path.to_string(),
            name: name.to_string(),
        };
        let mut table = guard(&self.table);
        let usage = table.entry(key.clone()).or_default();
        match access {
            FileAccess::Read if !usage.writer => usage.readers += 1,
            FileAccess::Write if !usage.writer && usage.readers == 0 => usage.writer = true,
            _ => return None,
        }
        log::debug!("Locked {}/{} for {:?}", path, name, access);
        Some(FileLock {
            table: Arc::clone(&self.table),
            key,
            access,
        })
    }

    /// Whether anybody holds `path/name`.
    pub fn is_locked(&self, scope: &ServerScope, path: &str, name: &str) -> bool {
        let key = OpenedKey {
            scope: scope.clone(),
            path: path.to_string(),
            name: name.to_string(),
        };
        guard(&self.table).contains_key(&key)
    }

    pub fn len(&self) -> usize {
        guard(&self.table).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Held registration in [`OpenedFiles`]; released on drop.
#[derive(Debug)]
pub struct FileLock {
    table: Table,
    key: OpenedKey,
    access: FileAccess,
}

impl FileLock {
    pub fn name(&self) -> &str {
        &self.key.name
    }

    pub fn access(&self) -> FileAccess {
        self.access
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let mut table = guard(&self.table);
        let remove = match table.get_mut(&self.key) {
            Some(usage) => {
                match self.access {
                    FileAccess::Read => usage.readers = usage.readers.saturating_sub(1),
                    FileAccess::Write => usage.writer = false,
                }
                usage.readers == 0 && !usage.writer
            }
            None => false,
        };
        if remove {
            table.remove(&self.key);
        }
    }
}
