//! CWD + LIST sub-sequence.
//!
//! Started when the listing cache hands this worker a fetch. The result
//! always goes back into the cache (finished or failed) so waiting
//! workers are released, then processing continues where it asked for
//! the listing.

use super::*;
use crate::engine::parser::parse_listing;

impl Run<'_, '_> {
    pub(super) fn begin_listing(&mut self, dir: String, ret: ListingReturn) {
        self.status(format!("Listing {}", dir));
        let cached = self.core.conn.cwd.as_deref() == Some(dir.as_str());
        self.job.listing = Some(ListingJob {
            dir: dir.clone(),
            ret,
            buf: Vec::new(),
            fetching: true,
        });
        if cached {
            self.list_type();
        } else {
            self.send(Command::Cwd(dir), SubState::ListCwd);
        }
    }

    /// Park until another worker's fetch ends.
    pub(super) fn wait_for_listing(&mut self, dir: &str, ret: ListingReturn) {
        self.job.listing = Some(ListingJob {
            dir: dir.to_string(),
            ret,
            buf: Vec::new(),
            fetching: false,
        });
        self.enter(SubState::WaitForListing);
    }

    fn listing_dir(&self) -> String {
        self.job
            .listing
            .as_ref()
            .map(|l| l.dir.clone())
            .unwrap_or_default()
    }

    pub(super) fn on_list_cwd(&mut self, reply: Reply) {
        let dir = self.listing_dir();
        if reply.is_success() {
            self.core.conn.cwd = Some(dir);
            self.list_type();
        } else {
            self.core.conn.cwd = None;
            self.listing_done(Err(true));
        }
    }

    fn list_type(&mut self) {
        if self.core.conn.transfer_type == Some(TransferType::Ascii) {
            self.alloc_data(DataPurpose::List);
        } else {
            self.send(Command::Type(TransferType::Ascii), SubState::ListType);
        }
    }

    pub(super) fn on_list_type(&mut self, reply: Reply) {
        self.core.conn.transfer_type = reply.is_success().then_some(TransferType::Ascii);
        self.alloc_data(DataPurpose::List);
    }

    pub(super) fn send_list(&mut self) {
        if let Some(listing) = self.job.listing.as_mut() {
            listing.buf.clear();
        }
        self.start_transfer(Command::List, SubState::ListTransfer);
    }

    pub(super) fn evaluate_listing(&mut self) {
        let Some(reply) = self.job.reply.take() else {
            return;
        };
        if reply.is_success() && self.job.data_error.is_none() {
            let raw = self
                .job
                .listing
                .as_ref()
                .map(|l| String::from_utf8_lossy(&l.buf).into_owned())
                .unwrap_or_default();
            match parse_listing(&raw) {
                Ok(entries) => self.listing_done(Ok(entries)),
                Err(e) => {
                    self.abandon_listing();
                    self.fail(ProblemCode::UnableToParseListing, None, Some(e.message));
                }
            }
        } else if reply.is_retryable_transient() || self.job.no_data_timeout {
            self.abandon_listing();
            self.delayed_retry();
        } else {
            self.listing_done(Err(reply.is_permanent()));
        }
    }

    /// Store the result (`Err(not_accessible)` on failure) and continue.
    fn listing_done(&mut self, result: Result<Vec<ListingEntry>, bool>) {
        let dir = self.listing_dir();
        if let Some(listing) = self.job.listing.as_mut() {
            listing.fetching = false;
        }
        match result {
            Ok(entries) => {
                log::debug!("{} listed {} ({} entries)", self.core.worker, dir, entries.len());
                self.env
                    .cache
                    .listing_finished(self.env.scope, &dir, self.core.worker, entries);
            }
            Err(not_accessible) => {
                self.log_info(format!("Unable to list {}", dir));
                self.env
                    .cache
                    .listing_failed(self.env.scope, &dir, self.core.worker, not_accessible);
                if !not_accessible {
                    let problem = match self.job.listing.as_ref().map(|l| l.ret) {
                        Some(ListingReturn::Explore) => ProblemCode::UnableToCwd,
                        _ => ProblemCode::UploadCannotListTgtPath,
                    };
                    self.fail(problem, None, Some(dir));
                    return;
                }
            }
        }
        self.resume_after_listing();
    }

    /// Continue where the listing was requested.
    pub(super) fn resume_after_listing(&mut self) {
        let Some(listing) = self.job.listing.take() else {
            return;
        };
        match listing.ret {
            ListingReturn::Determine => self.determine_target(),
            ListingReturn::Rename => self.set_target_path(),
            ListingReturn::Explore => self.explore(),
        }
    }
}
