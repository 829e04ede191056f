//! Download of one server file.

use super::*;
use crate::engine::disk::DiskFailureKind;
use crate::engine::opened_files::FileAccess;

impl Run<'_, '_> {
    pub(super) fn start_download(&mut self) {
        if self.job.item.tgt_file_state == TgtFileState::Transferred {
            self.download_finished();
            return;
        }
        let item = &self.job.item;
        let lock = self
            .env
            .opened
            .try_lock(self.env.scope, &item.path, &item.name, FileAccess::Read);
        let Some(lock) = lock else {
            let name = self.job.item.name.clone();
            return self.fail(ProblemCode::SrcFileInUse, None, Some(name));
        };
        self.job.lock = Some(lock);
        self.status(format!("Downloading {}", self.job.item.name));
        let mode = match self.job.item.force_action {
            ForceAction::Overwrite => CreateMode::Overwrite,
            ForceAction::Resume | ForceAction::ResumeOrOverwrite => CreateMode::Resume,
            ForceAction::UseAutorename => CreateMode::Autorename,
            _ => CreateMode::CreateNew,
        };
        self.create_target(mode);
    }

    fn create_target(&mut self, mode: CreateMode) {
        self.job.download_mode = mode;
        let request = DiskRequest::Create {
            dir: PathBuf::from(&self.job.item.tgt_path),
            name: self.job.item.tgt_name.clone(),
            mode,
        };
        self.effect(Effect::Disk(request));
        self.enter(SubState::DnCreateTarget);
    }

    pub(super) fn on_target_created(&mut self, ev: DiskEvent) {
        match ev {
            DiskEvent::Created { name, existing_size } => {
                if name != self.job.item.tgt_name {
                    self.log_info(format!("Downloading {} as {}", self.job.item.name, name));
                    self.edit(move |i| i.tgt_name = name.clone());
                }
                if self.job.download_mode == CreateMode::Resume {
                    self.check_resume(existing_size);
                } else {
                    self.job.resume_offset = None;
                    self.edit(|i| i.tgt_file_state = TgtFileState::Created);
                    self.download_cwd();
                }
            }
            DiskEvent::Failed(e) => match e.kind {
                DiskFailureKind::AlreadyExists { .. } => self.local_file_exists(),
                DiskFailureKind::Io => self.local_cannot_create(e),
            },
            other => log::warn!("{} unexpected {:?}", self.core.worker, other),
        }
    }

    fn local_file_exists(&mut self) {
        let cfg = self.env.config;
        let policy = match self.job.item.tgt_file_state {
            TgtFileState::Created => cfg.download_retry_on_created_file,
            TgtFileState::Resumed => cfg.download_retry_on_resumed_file,
            _ => cfg.download_file_already_exists,
        };
        let problem = match self.job.item.tgt_file_state {
            TgtFileState::Created => ProblemCode::RetryOnCreatedFile,
            TgtFileState::Resumed => ProblemCode::RetryOnResumedFile,
            _ => ProblemCode::TgtFileAlreadyExists,
        };
        let resumable = !self.job.item.is_ascii() && self.env.caps.resume_supported();
        match policy {
            FileExistsPolicy::UserPrompt => self.ask_user(problem),
            FileExistsPolicy::Skip => self.skip(problem),
            FileExistsPolicy::Autorename => self.create_target(CreateMode::Autorename),
            FileExistsPolicy::Overwrite => self.create_target(CreateMode::Overwrite),
            FileExistsPolicy::Resume if !resumable => self.fail(ProblemCode::UnableToResume, None, None),
            FileExistsPolicy::ResumeOrOverwrite if !resumable => {
                self.log_info("Resume not possible, overwriting local file");
                self.create_target(CreateMode::Overwrite);
            }
            FileExistsPolicy::Resume | FileExistsPolicy::ResumeOrOverwrite => {
                let force = if policy == FileExistsPolicy::Resume {
                    ForceAction::Resume
                } else {
                    ForceAction::ResumeOrOverwrite
                };
                self.set_force(force);
                self.create_target(CreateMode::Resume);
            }
        }
    }

    fn local_cannot_create(&mut self, e: DiskFailure) {
        match self.env.config.download_cannot_create_file {
            CannotCreatePolicy::Autorename if self.job.download_mode != CreateMode::Autorename => {
                self.create_target(CreateMode::Autorename)
            }
            CannotCreatePolicy::Skip => self.skip(ProblemCode::CannotCreateTgtFile),
            CannotCreatePolicy::UserPrompt => self.ask_user(ProblemCode::CannotCreateTgtFile),
            CannotCreatePolicy::Autorename => {
                self.fail(ProblemCode::CannotCreateTgtFile, e.os_error, Some(e.message))
            }
        }
    }

    /// Decide the REST offset from what is already on disk.
    fn check_resume(&mut self, existing: u64) {
        let or_overwrite = self.job.item.force_action != ForceAction::Resume;
        if existing == 0 {
            self.job.resume_offset = None;
            self.edit(|i| i.tgt_file_state = TgtFileState::Created);
            return self.download_cwd();
        }
        if self.job.item.is_ascii() || existing < self.env.config.resume_min_file_size {
            self.log_info("Local file cannot be resumed, overwriting");
            return self.create_target(CreateMode::Overwrite);
        }
        if self.job.item.size.map_or(false, |size| existing > size) {
            if or_overwrite {
                self.log_info("Local file is larger than source, overwriting");
                return self.create_target(CreateMode::Overwrite);
            }
            return self.fail(ProblemCode::ResumeTestFailed, None, Some("local file is larger than source".into()));
        }
        let overlap = self.env.config.resume_overlap.min(existing);
        let offset = existing - overlap;
        self.log_info(format!("Resuming at {}", offset));
        self.job.resume_offset = Some(offset);
        self.job.pump.verify_remaining = overlap;
        self.edit(|i| i.tgt_file_state = TgtFileState::Resumed);
        self.download_cwd();
    }

    fn download_cwd(&mut self) {
        let dir = self.job.item.path.clone();
        if self.core.conn.cwd.as_deref() == Some(dir.as_str()) {
            self.download_type();
        } else {
            self.send(Command::Cwd(dir), SubState::DnCwd);
        }
    }

    pub(super) fn on_download_cwd(&mut self, reply: Reply) {
        if reply.is_success() {
            self.core.conn.cwd = Some(self.job.item.path.clone());
            self.download_type();
        } else {
            self.core.conn.cwd = None;
            self.fail(ProblemCode::UnableToCwd, None, Some(reply.text()));
        }
    }

    fn download_type(&mut self) {
        let want = self.job.item.transfer_type;
        if self.core.conn.transfer_type == Some(want) {
            self.alloc_retrieve();
        } else {
            self.send(Command::Type(want), SubState::DnType);
        }
    }

    pub(super) fn on_download_type(&mut self, reply: Reply) {
        self.core.conn.transfer_type = reply.is_success().then_some(self.job.item.transfer_type);
        self.alloc_retrieve();
    }

    fn alloc_retrieve(&mut self) {
        let verify = self.job.pump.verify_remaining;
        self.alloc_data(DataPurpose::Retrieve);
        self.job.pump.verify_remaining = verify;
    }

    pub(super) fn send_rest_or_retr(&mut self) {
        match self.job.resume_offset {
            Some(offset) if offset > 0 => self.send(Command::Rest(offset), SubState::DnRest),
            _ => self.send_retr(),
        }
    }

    pub(super) fn on_rest(&mut self, reply: Reply) {
        if reply.class() == crate::engine::reply::ReplyClass::Intermediate {
            return self.send_retr();
        }
        self.env.caps.set_resume_unsupported();
        if self.job.item.force_action == ForceAction::ResumeOrOverwrite {
            self.log_info("Server cannot resume, overwriting local file");
            self.set_force(ForceAction::Overwrite);
            self.requeue();
        } else {
            self.fail(ProblemCode::UnableToResume, None, Some(reply.text()));
        }
    }

    fn send_retr(&mut self) {
        self.job.pump.file_offset = self.job.resume_offset.unwrap_or(0);
        let name = self.job.item.name.clone();
        self.start_transfer(Command::Retr(name), SubState::DnRetr);
    }

    pub(super) fn write_received(&mut self, data: Vec<u8>) {
        let len = data.len();
        let verify_len = (self.job.pump.verify_remaining.min(len as u64)) as usize;
        self.job.pump.pending_len = len;
        let request = DiskRequest::Write {
            offset: self.job.pump.file_offset,
            data,
            verify_len,
        };
        self.effect(Effect::Disk(request));
    }

    pub(super) fn on_chunk_written(&mut self, ev: DiskEvent) {
        match ev {
            DiskEvent::Written { mismatch: true } => {
                self.job.local_error = Some(LocalError::VerifyMismatch);
                self.close_data();
            }
            DiskEvent::Written { mismatch: false } => {
                let len = self.job.pump.pending_len as u64;
                let pump = &mut self.job.pump;
                pump.file_offset += len;
                pump.transferred += len;
                pump.verify_remaining = pump.verify_remaining.saturating_sub(len);
                pump.pending_len = 0;
                let done = pump.file_offset;
                self.effect(Effect::Progress { done, delta: len });
                if self.core.data_open && !self.core.data_closing {
                    self.effect(Effect::ReadData);
                } else if self.job.reply.is_some() && !self.core.data_open {
                    self.evaluate_retrieve();
                }
            }
            DiskEvent::Failed(e) => {
                self.job.local_error = Some(LocalError::TgtWrite(e));
                self.close_data();
            }
            other => log::warn!("{} unexpected {:?}", self.core.worker, other),
        }
    }

    /// RETR reply and data connection both done.
    pub(super) fn evaluate_retrieve(&mut self) {
        if self.job.pump.pending_len > 0 {
            return;
        }
        let Some(reply) = self.job.reply.take() else {
            return;
        };
        match self.job.local_error.take() {
            Some(LocalError::VerifyMismatch) => {
                return self.fail(ProblemCode::ResumeTestFailed, None, None);
            }
            Some(LocalError::TgtWrite(e)) => {
                return self.fail(ProblemCode::TgtFileWriteError, e.os_error, Some(e.message));
            }
            _ => {}
        }
        if reply.is_success() && self.job.data_error.is_none() {
            self.edit(|i| {
                i.tgt_file_state = TgtFileState::Transferred;
                i.force_action = ForceAction::None;
            });
            self.effect(Effect::CloseFile);
            return self.download_finished();
        }
        let resuming = self.job.resume_offset.map_or(false, |o| o > 0);
        if (!resuming || self.job.data_connected) && (reply.is_retryable_transient() || self.job.no_data_timeout) {
            return self.delayed_retry();
        }
        self.fail(ProblemCode::IncompleteDownload, None, Some(reply.text()));
    }

    fn download_finished(&mut self) {
        if self.job.item.kind.is_move() {
            let path = server_join(&self.job.item.path, &self.job.item.name);
            self.send(Command::Dele(path), SubState::DnDeleteSource);
        } else {
            self.done();
        }
    }

    pub(super) fn on_download_source_deleted(&mut self, reply: Reply) {
        if reply.is_success() {
            self.env
                .cache
                .report_delete(self.env.scope, &self.job.item.path, &self.job.item.name);
            self.done();
        } else {
            self.fail(ProblemCode::UnableToDeleteSrcFile, None, Some(reply.text()));
        }
    }
}
