//! Server capabilities learned while an operation runs, shared by all
//! of its workers.

use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug)]
pub struct ServerCaps {
    size_supported: AtomicBool,
    resume_supported: AtomicBool,
    passive_supported: AtomicBool,
    use_delete_for_overwrite: AtomicBool,
}

impl Default for ServerCaps {
    fn default() -> Self {
        Self {
            size_supported: AtomicBool::new(true),
            resume_supported: AtomicBool::new(true),
            passive_supported: AtomicBool::new(true),
            use_delete_for_overwrite: AtomicBool::new(false),
        }
    }
}

impl ServerCaps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn size_supported(&self) -> bool {
        self.size_supported.load(Ordering::Relaxed)
    }

    pub fn set_size_unsupported(&self) {
        if self.size_supported.swap(false, Ordering::Relaxed) {
            log::warn!("Server does not support SIZE");
        }
    }

    pub fn resume_supported(&self) -> bool {
        self.resume_supported.load(Ordering::Relaxed)
    }

    pub fn set_resume_unsupported(&self) {
        if self.resume_supported.swap(false, Ordering::Relaxed) {
            log::warn!("Server does not support resume");
        }
    }

    /// Give resume another chance (user retried an item).
    pub fn reset_resume(&self) {
        self.resume_supported.store(true, Ordering::Relaxed);
    }

    pub fn passive_supported(&self) -> bool {
        self.passive_supported.load(Ordering::Relaxed)
    }

    pub fn set_passive_unsupported(&self) {
        if self.passive_supported.swap(false, Ordering::Relaxed) {
            log::warn!("PASV failed, switching to active mode");
        }
    }

    /// Delete the target before STOR when overwriting.
    pub fn use_delete_for_overwrite(&self) -> bool {
        self.use_delete_for_overwrite.load(Ordering::Relaxed)
    }

    pub fn set_use_delete_for_overwrite(&self) {
        self.use_delete_for_overwrite.store(true, Ordering::Relaxed);
    }
}
