//! Operation log: what the engine decided, in words the user sees.

use crate::engine::types::{ItemId, WorkerId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub time: DateTime<Utc>,
    pub worker: Option<WorkerId>,
    pub item: Option<ItemId>,
    pub message: String,
    pub is_error: bool,
}

/// Append-only; every entry is mirrored to the `log` facade.
#[derive(Debug, Default)]
pub struct OperationLog {
    entries: Mutex<Vec<LogEntry>>,
}

impl OperationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn info(&self, worker: Option<WorkerId>, item: Option<ItemId>, message: impl Into<String>) {
        self.push(worker, item, message.into(), false);
    }

    pub fn error(&self, worker: Option<WorkerId>, item: Option<ItemId>, message: impl Into<String>) {
        self.push(worker, item, message.into(), true);
    }

    fn push(&self, worker: Option<WorkerId>, item: Option<ItemId>, message: String, is_error: bool) {
        let tag = match (worker, item) {
            (Some(w), Some(i)) => format!("[{} {}] ", w, i),
            (Some(w), None) => format!("[{}] ", w),
            (None, Some(i)) => format!("[{}] ", i),
            (None, None) => String::new(),
        };
        if is_error {
            log::warn!("{}{}", tag, message);
        } else {
            log::info!("{}{}", tag, message);
        }
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(LogEntry {
                time: Utc::now(),
                worker,
                item,
                message,
                is_error,
            });
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Entries from index `from` on, for incremental polling.
    pub fn entries_since(&self, from: usize) -> Vec<LogEntry> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.get(from..).map(<[LogEntry]>::to_vec).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
