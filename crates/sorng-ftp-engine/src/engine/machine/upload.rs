//! Upload of one local file.
//!
//! Open source → determine target (listing lookup, collision policy) →
//! CWD → TYPE → [SIZE] → [autorename] → lock → [DELE] → data connection →
//! STOR/APPE → evaluate → [delete local source].

use super::*;
use crate::engine::autorename::NameGenerator;
use crate::engine::listing_cache::{find_entry, ListingQuery};
use crate::engine::opened_files::FileAccess;
use crate::engine::reply::parse_size_reply;

const MAX_RENAME_CANDIDATES: usize = 10_000;

fn valid_upload_name(name: &str) -> bool {
    !(name.is_empty() || name == "." || name == ".." || name.contains('/'))
}

impl Run<'_, '_> {
    pub(super) fn start_upload(&mut self) {
        if self.job.item.tgt_file_state == TgtFileState::Transferred {
            self.upload_finished();
            return;
        }
        let path = PathBuf::from(&self.job.item.path).join(&self.job.item.name);
        self.status(format!("Uploading {}", self.job.item.name));
        self.effect(Effect::Disk(DiskRequest::Open { path }));
        self.enter(SubState::UpOpenSource);
    }

    pub(super) fn on_source_opened(&mut self, ev: DiskEvent) {
        match ev {
            DiskEvent::Opened { size } => {
                self.job.src_size = size;
                if self.job.item.size != Some(size) {
                    self.edit(move |i| i.size = Some(size));
                }
                self.determine_target();
            }
            DiskEvent::Failed(e) => self.fail(ProblemCode::UploadCannotOpenSrcFile, e.os_error, Some(e.message)),
            other => log::warn!("{} unexpected {:?}", self.core.worker, other),
        }
    }

    // ── Target state ─────────────────────────────────────────────────

    pub(super) fn determine_target(&mut self) {
        let dir = self.job.item.tgt_path.clone();
        match self.env.cache.get_listing(self.env.scope, &dir, self.core.worker) {
            ListingQuery::Fetch => self.begin_listing(dir, ListingReturn::Determine),
            ListingQuery::Wait => self.wait_for_listing(&dir, ListingReturn::Determine),
            ListingQuery::NotAccessible => self.fail(ProblemCode::UploadCannotListTgtPath, None, Some(dir)),
            ListingQuery::Ready(listing) => self.choose_upload_action(&listing),
        }
    }

    fn choose_upload_action(&mut self, listing: &[ListingEntry]) {
        match self.job.item.force_action {
            ForceAction::UploadForceAutorename => {
                self.edit(|i| i.autorename_phase = AutorenamePhase::Suffix);
                return self.upload_start(UploadMode::Autorename);
            }
            ForceAction::UploadContinueAutorename => return self.upload_start(UploadMode::Autorename),
            ForceAction::UploadTestIfFinished => return self.upload_start(UploadMode::TestIfFinished),
            _ => {}
        }

        let name = self.job.item.tgt_name.clone();
        if !valid_upload_name(&name) {
            return self.cannot_create();
        }
        match find_entry(listing, &name).map(|e| e.kind) {
            None => self.upload_start(UploadMode::NewFile),
            Some(EntryKind::Directory) => self.cannot_create(),
            Some(EntryKind::File) => self.file_exists(),
            Some(EntryKind::Link) => {
                self.core.conn.cwd = None;
                let target = server_join(&self.job.item.tgt_path, &name);
                self.send(Command::Cwd(target), SubState::UpResolveLink);
            }
        }
    }

    /// CWD into a link: success means it points to a directory. A 5xx is
    /// taken to mean "points to a file", which is all 550 can tell.
    pub(super) fn on_resolve_link(&mut self, reply: Reply) {
        if reply.is_success() {
            self.cannot_create();
        } else if reply.is_permanent() {
            self.file_exists();
        } else {
            self.fail(ProblemCode::UnableToResolveLink, None, Some(reply.text()));
        }
    }

    /// The target exists as a file.
    fn file_exists(&mut self) {
        let cfg = self.env.config;
        let policy = match self.job.item.force_action {
            ForceAction::Resume => FileExistsPolicy::Resume,
            ForceAction::ResumeOrOverwrite => FileExistsPolicy::ResumeOrOverwrite,
            ForceAction::Overwrite => FileExistsPolicy::Overwrite,
            ForceAction::UseAutorename => FileExistsPolicy::Autorename,
            _ => match self.job.item.tgt_file_state {
                TgtFileState::Created => cfg.upload_retry_on_created_file,
                TgtFileState::Resumed => cfg.upload_retry_on_resumed_file,
                _ => cfg.upload_file_already_exists,
            },
        };
        let problem = match self.job.item.tgt_file_state {
            TgtFileState::Created => ProblemCode::RetryOnCreatedFile,
            TgtFileState::Resumed => ProblemCode::RetryOnResumedFile,
            _ => ProblemCode::UploadTgtFileAlreadyExists,
        };
        let resumable = !self.job.item.is_ascii() && self.env.caps.resume_supported();
        match policy {
            FileExistsPolicy::UserPrompt => self.ask_user(problem),
            FileExistsPolicy::Skip => self.skip(problem),
            FileExistsPolicy::Autorename => {
                self.edit(|i| i.autorename_phase = AutorenamePhase::Suffix);
                self.upload_start(UploadMode::Autorename);
            }
            FileExistsPolicy::Overwrite => self.upload_start(UploadMode::Overwrite),
            FileExistsPolicy::Resume if self.job.item.is_ascii() => {
                self.fail(ProblemCode::UploadAsciiResumeNotSupported, None, None)
            }
            FileExistsPolicy::Resume if !resumable => self.fail(ProblemCode::UnableToResume, None, None),
            FileExistsPolicy::Resume => self.upload_start(UploadMode::Resume),
            FileExistsPolicy::ResumeOrOverwrite if !resumable => {
                self.log_info("Resume not possible, overwriting target file");
                self.upload_start(UploadMode::Overwrite);
            }
            FileExistsPolicy::ResumeOrOverwrite => self.upload_start(UploadMode::ResumeOrOverwrite),
        }
    }

    /// The target name cannot be created as a file.
    fn cannot_create(&mut self) {
        let policy = if self.job.item.force_action == ForceAction::UseAutorename {
            CannotCreatePolicy::Autorename
        } else {
            self.env.config.upload_cannot_create_file
        };
        match policy {
            CannotCreatePolicy::UserPrompt => self.ask_user(ProblemCode::UploadCannotCreateTgtFile),
            CannotCreatePolicy::Skip => self.skip(ProblemCode::UploadCannotCreateTgtFile),
            CannotCreatePolicy::Autorename => {
                self.edit(|i| i.autorename_phase = AutorenamePhase::Suffix);
                self.upload_start(UploadMode::Autorename);
            }
        }
    }

    fn upload_start(&mut self, mode: UploadMode) {
        log::debug!("{} {} upload mode {:?}", self.core.worker, self.job.item.id, mode);
        self.job.mode = mode;
        self.job.resume_offset = None;
        self.set_target_path();
    }

    // ── CWD / TYPE ───────────────────────────────────────────────────

    pub(super) fn set_target_path(&mut self) {
        let dir = self.job.item.tgt_path.clone();
        if self.core.conn.cwd.as_deref() == Some(dir.as_str()) {
            self.set_upload_type();
        } else {
            self.send(Command::Cwd(dir), SubState::UpCwd);
        }
    }

    pub(super) fn on_upload_cwd(&mut self, reply: Reply) {
        if reply.is_success() {
            self.core.conn.cwd = Some(self.job.item.tgt_path.clone());
            self.set_upload_type();
        } else {
            self.core.conn.cwd = None;
            self.fail(ProblemCode::UnableToCwdOnlyPath, None, Some(reply.text()));
        }
    }

    fn set_upload_type(&mut self) {
        let want = self.job.item.transfer_type;
        if self.core.conn.transfer_type == Some(want) {
            self.after_type();
        } else {
            self.send(Command::Type(want), SubState::UpType);
        }
    }

    pub(super) fn on_upload_type(&mut self, reply: Reply) {
        if reply.is_success() {
            self.core.conn.transfer_type = Some(self.job.item.transfer_type);
        } else {
            log::warn!("{} TYPE rejected: {}", self.core.worker, reply.text());
            self.core.conn.transfer_type = None;
        }
        self.after_type();
    }

    fn after_type(&mut self) {
        match self.job.mode {
            UploadMode::Resume | UploadMode::ResumeOrOverwrite | UploadMode::TestIfFinished => self.get_file_size(),
            UploadMode::Autorename => self.gen_new_name(),
            UploadMode::NewFile | UploadMode::Overwrite => self.lock_file(),
        }
    }

    // ── Target size ──────────────────────────────────────────────────

    fn get_file_size(&mut self) {
        if self.env.caps.size_supported() {
            let name = self.job.item.tgt_name.clone();
            self.send(Command::Size(name), SubState::UpSize);
        } else {
            self.size_from_listing();
        }
    }

    pub(super) fn on_size(&mut self, reply: Reply) {
        match parse_size_reply(&reply) {
            Some(size) => self.size_known(size),
            None => {
                if reply.is_unsupported_command() {
                    self.env.caps.set_size_unsupported();
                }
                self.size_from_listing();
            }
        }
    }

    fn size_from_listing(&mut self) {
        let dir = self.job.item.tgt_path.clone();
        match self.env.cache.get_listing(self.env.scope, &dir, self.core.worker) {
            ListingQuery::Ready(listing) => {
                let size = find_entry(&listing, &self.job.item.tgt_name).map(|e| e.size);
                match size {
                    Some(ListedSize::Known(n)) => self.size_known(n),
                    Some(ListedSize::NeedsUpdate) => {
                        self.env.cache.invalidate_path_listing(self.env.scope, &dir);
                        self.determine_target();
                    }
                    _ => self.size_unknown(),
                }
            }
            ListingQuery::Fetch => self.begin_listing(dir, ListingReturn::Determine),
            ListingQuery::Wait => self.wait_for_listing(&dir, ListingReturn::Determine),
            ListingQuery::NotAccessible => self.size_unknown(),
        }
    }

    fn size_unknown(&mut self) {
        match self.job.mode {
            UploadMode::ResumeOrOverwrite => {
                self.log_info("Target size unknown, overwriting target file");
                self.job.mode = UploadMode::Overwrite;
                self.lock_file();
            }
            UploadMode::TestIfFinished => {
                self.set_force(ForceAction::None);
                self.file_exists();
            }
            _ => self.fail(ProblemCode::UploadUnableToResumeUnknownSize, None, None),
        }
    }

    fn size_known(&mut self, target: u64) {
        let source = self.job.src_size;
        match self.job.mode {
            UploadMode::TestIfFinished => {
                let item = &self.job.item;
                let finished = if item.is_ascii() {
                    let sent = item.size_with_crlf_eols;
                    target == sent || target == sent.saturating_sub(item.number_of_eols)
                } else {
                    target == source
                };
                self.set_force(ForceAction::None);
                if finished {
                    self.log_info("Target file is complete, upload had finished");
                    self.edit(|i| i.tgt_file_state = TgtFileState::Transferred);
                    self.upload_finished();
                } else {
                    self.file_exists();
                }
            }
            mode if target > source => {
                if mode == UploadMode::ResumeOrOverwrite {
                    self.log_info("Target file is larger than source, overwriting");
                    self.job.mode = UploadMode::Overwrite;
                    self.lock_file();
                } else {
                    self.fail(ProblemCode::UploadUnableToResumeBigTarget, None, None);
                }
            }
            _ if target < self.env.config.resume_min_file_size => {
                self.log_info("Target file too small to resume, overwriting");
                self.job.mode = UploadMode::Overwrite;
                self.lock_file();
            }
            _ => {
                self.log_info(format!("Resuming at {}", target));
                self.job.resume_offset = Some(target);
                self.lock_file();
            }
        }
    }

    // ── Autorename ───────────────────────────────────────────────────

    fn gen_new_name(&mut self) {
        let dir = self.job.item.tgt_path.clone();
        let listing = match self.env.cache.get_listing(self.env.scope, &dir, self.core.worker) {
            ListingQuery::Ready(listing) => listing,
            ListingQuery::Fetch => return self.begin_listing(dir, ListingReturn::Rename),
            ListingQuery::Wait => return self.wait_for_listing(&dir, ListingReturn::Rename),
            ListingQuery::NotAccessible => {
                return self.fail(ProblemCode::UploadCannotListTgtPath, None, Some(dir))
            }
        };

        let item = &self.job.item;
        let mut names = NameGenerator::new(&item.tgt_name, item.autorename_phase, item.tgt_name != item.name);
        self.job.lock = None;
        for _ in 0..MAX_RENAME_CANDIDATES {
            let Some(candidate) = names.next_name() else {
                break;
            };
            if find_entry(&listing, &candidate).is_some() {
                continue;
            }
            let lock = self
                .env
                .opened
                .try_lock(self.env.scope, &dir, &candidate, FileAccess::Write);
            if let Some(lock) = lock {
                self.job.lock = Some(lock);
                self.job.phase_after = names.phase_after();
                self.log_info(format!("Uploading {} as {}", self.job.item.tgt_name, candidate));
                self.edit(move |i| i.renamed_name = Some(candidate.clone()));
                return self.lock_file();
            }
        }
        self.fail(ProblemCode::UploadFileAutorenameFailed, None, None);
    }

    // ── Transfer ─────────────────────────────────────────────────────

    fn lock_file(&mut self) {
        if self.job.lock.is_none() {
            let name = self.job.item.effective_tgt_name().to_string();
            let lock = self
                .env
                .opened
                .try_lock(self.env.scope, &self.job.item.tgt_path, &name, FileAccess::Write);
            match lock {
                Some(lock) => self.job.lock = Some(lock),
                None => return self.fail(ProblemCode::TgtFileInUse, None, Some(name)),
            }
        }
        if self.job.mode == UploadMode::Overwrite && self.env.caps.use_delete_for_overwrite() {
            let name = self.job.item.effective_tgt_name().to_string();
            self.send(Command::Dele(name), SubState::UpDeleteExisting);
        } else {
            self.alloc_data(DataPurpose::Store);
        }
    }

    pub(super) fn on_delete_existing(&mut self, reply: Reply) {
        if reply.is_success() {
            let name = self.job.item.effective_tgt_name().to_string();
            self.env
                .cache
                .report_delete(self.env.scope, &self.job.item.tgt_path, &name);
        } else {
            log::debug!("{} DELE before overwrite failed: {}", self.core.worker, reply.text());
        }
        self.alloc_data(DataPurpose::Store);
    }

    pub(super) fn send_store(&mut self) {
        let name = self.job.item.effective_tgt_name().to_string();
        let (cmd, state) = match self.job.resume_offset {
            Some(_) => (Command::Appe(name.clone()), TgtFileState::Resumed),
            None => (Command::Stor(name.clone()), TgtFileState::Created),
        };
        self.job.pump.file_offset = self.job.resume_offset.unwrap_or(0);
        self.edit(move |i| i.tgt_file_state = state);
        self.env
            .cache
            .report_store_file(self.env.scope, &self.job.item.tgt_path, &name);
        self.start_transfer(cmd, SubState::UpStore);
    }

    pub(super) fn read_next_chunk(&mut self) {
        let request = DiskRequest::Read {
            offset: self.job.pump.file_offset,
            len: self.env.config.disk_chunk_size,
            ascii: self.job.item.is_ascii(),
            prev_cr: self.job.pump.last_cr,
        };
        self.effect(Effect::Disk(request));
    }

    pub(super) fn on_upload_chunk(&mut self, ev: DiskEvent) {
        if self.core.data_closing || !self.core.data_open {
            return;
        }
        match ev {
            DiskEvent::Read(chunk) => {
                if self.job.item.is_ascii() && chunk.binary {
                    self.job.local_error = Some(LocalError::AsciiBinary);
                    return self.close_data();
                }
                let pump = &mut self.job.pump;
                pump.file_offset += chunk.raw_len as u64;
                pump.eols += chunk.eols;
                pump.last_cr = chunk.last_cr;
                pump.pending_eof = chunk.eof;
                if chunk.data.is_empty() {
                    if chunk.eof {
                        pump.sent_all = true;
                        self.finish_data();
                    } else {
                        self.read_next_chunk();
                    }
                } else {
                    self.effect(Effect::WriteData(chunk.data));
                }
            }
            DiskEvent::Failed(e) => {
                self.job.local_error = Some(LocalError::SrcRead(e));
                self.close_data();
            }
            other => log::warn!("{} unexpected {:?}", self.core.worker, other),
        }
    }

    pub(super) fn upload_chunk_sent(&mut self, bytes: usize) {
        self.job.pump.transferred += bytes as u64;
        let done = self.job.pump.file_offset;
        self.effect(Effect::Progress {
            done,
            delta: bytes as u64,
        });
        if self.job.pump.pending_eof {
            self.job.pump.sent_all = true;
            self.finish_data();
        } else {
            self.read_next_chunk();
        }
    }

    /// STOR/APPE reply and data connection both done.
    pub(super) fn evaluate_store(&mut self) {
        let Some(reply) = self.job.reply.take() else {
            return;
        };
        let dir = self.job.item.tgt_path.clone();
        let name = self.job.item.effective_tgt_name().to_string();

        match self.job.local_error.take() {
            Some(LocalError::AsciiBinary) => {
                self.env.cache.invalidate_path_listing(self.env.scope, &dir);
                self.log_info("File contains binary data, ASCII transfer aborted");
                self.send(Command::Dele(name), SubState::UpDeleteAsciiBinary);
                return;
            }
            Some(LocalError::SrcRead(e)) => {
                self.env.cache.invalidate_path_listing(self.env.scope, &dir);
                return self.fail(ProblemCode::SrcFileReadError, e.os_error, Some(e.message));
            }
            _ => {}
        }

        if reply.is_success() && self.job.data_error.is_none() && self.job.pump.sent_all {
            let size = if self.job.item.is_ascii() || self.job.resume_offset.is_some() {
                ListedSize::NeedsUpdate
            } else {
                ListedSize::Known(self.job.src_size)
            };
            self.env
                .cache
                .report_file_uploaded(self.env.scope, &dir, &name, size);
            self.adopt_renamed();
            self.edit(|i| {
                i.tgt_file_state = TgtFileState::Transferred;
                i.force_action = ForceAction::None;
            });
            return self.upload_finished();
        }

        self.env.cache.invalidate_path_listing(self.env.scope, &dir);
        let resuming = self.job.resume_offset.is_some();
        let mode = self.job.mode;

        if (!resuming || self.job.data_connected)
            && (reply.is_retryable_transient() || self.job.no_data_timeout)
        {
            if self.job.data_connected {
                self.adopt_renamed();
            }
            self.set_force(ForceAction::None);
            return self.delayed_retry();
        }

        let nothing_uploaded = reply.is_permanent() && !resuming && self.job.pump.transferred == 0;
        if nothing_uploaded {
            self.edit(|i| i.tgt_file_state = TgtFileState::Unknown);
            if mode == UploadMode::Overwrite && !self.env.caps.use_delete_for_overwrite() {
                self.env.caps.set_use_delete_for_overwrite();
                self.log_info("Overwrite rejected, deleting target before storing");
                self.set_force(ForceAction::Overwrite);
                return self.requeue();
            }
            if mode == UploadMode::Autorename {
                let next = self.job.phase_after;
                if next == AutorenamePhase::Exhausted {
                    return self.fail(ProblemCode::UploadFileAutorenameFailed, None, Some(reply.text()));
                }
                self.edit(move |i| {
                    i.force_action = ForceAction::UploadContinueAutorename;
                    i.autorename_phase = next;
                });
                return self.requeue();
            }
            if self.job.item.force_action == ForceAction::UseAutorename {
                self.set_force(ForceAction::UploadForceAutorename);
                return self.requeue();
            }
            self.set_force(ForceAction::None);
            return self.cannot_create();
        }

        self.adopt_renamed();
        if resuming {
            if reply.is_unsupported_command() {
                self.env.caps.set_resume_unsupported();
                if mode != UploadMode::ResumeOrOverwrite {
                    return self.fail(ProblemCode::UnableToResume, None, Some(reply.text()));
                }
            }
            if mode == UploadMode::ResumeOrOverwrite {
                self.log_info("Resume failed, overwriting target file");
                self.set_force(ForceAction::Overwrite);
                return self.requeue();
            }
        }

        self.set_force(ForceAction::None);
        self.fail(ProblemCode::IncompleteUpload, None, Some(reply.text()));
    }

    pub(super) fn on_ascii_binary_deleted(&mut self, reply: Reply) {
        if reply.is_success() {
            let name = self.job.item.effective_tgt_name().to_string();
            self.env
                .cache
                .report_delete(self.env.scope, &self.job.item.tgt_path, &name);
        }
        self.edit(|i| i.tgt_file_state = TgtFileState::Unknown);
        match self.env.config.ascii_transfer_for_binary_file {
            AsciiForBinaryPolicy::UserPrompt => self.ask_user(ProblemCode::AsciiTransferForBinaryFile),
            AsciiForBinaryPolicy::Skip => self.skip(ProblemCode::AsciiTransferForBinaryFile),
            AsciiForBinaryPolicy::TransferInBinary => {
                self.log_info("Transferring in binary mode instead");
                self.edit(|i| i.transfer_type = TransferType::Binary);
                self.requeue();
            }
        }
    }

    /// Connection lost while storing.
    pub(super) fn store_connection_lost(&mut self, reply_timeout: bool) {
        self.adopt_renamed();
        let dir = self.job.item.tgt_path.clone();
        self.env.cache.invalidate_path_listing(self.env.scope, &dir);
        // A forced action was for this attempt only; the retry goes by the
        // target file state.
        if self.job.pump.sent_all && reply_timeout {
            let sent = self.job.pump.transferred;
            let eols = self.job.pump.eols;
            self.log_info("All data sent but no reply, will verify the target size");
            self.edit(move |i| {
                i.size_with_crlf_eols = sent;
                i.number_of_eols = eols;
                i.force_action = ForceAction::UploadTestIfFinished;
            });
        } else if self.job.item.force_action != ForceAction::None {
            self.set_force(ForceAction::None);
        }
        self.release(Outcome::Reconnect);
    }

    /// The renamed target may exist now; later attempts use its name.
    fn adopt_renamed(&mut self) {
        if self.job.item.renamed_name.is_some() {
            self.edit(|i| {
                if let Some(new_name) = i.renamed_name.take() {
                    i.tgt_name = new_name;
                }
            });
        }
    }

    fn upload_finished(&mut self) {
        self.effect(Effect::CloseFile);
        if self.job.item.kind.is_move() {
            let path = PathBuf::from(&self.job.item.path).join(&self.job.item.name);
            self.effect(Effect::Disk(DiskRequest::Delete { path }));
            self.enter(SubState::UpDeleteSource);
        } else {
            self.done();
        }
    }

    pub(super) fn on_local_source_deleted(&mut self, ev: DiskEvent) {
        match ev {
            DiskEvent::Deleted => self.done(),
            DiskEvent::Failed(e) => self.fail(ProblemCode::UnableToDeleteDiskFile, e.os_error, Some(e.message)),
            other => log::warn!("{} unexpected {:?}", self.core.worker, other),
        }
    }
}
