//! Worker protocol state machine.
//!
//! The machine is pure: it consumes one [`Event`] at a time and answers
//! with the [`Effect`]s the driver must carry out (send a command, open
//! the data connection, submit disk work…) plus an [`Outcome`] telling the
//! driver whether the current item is still being worked on. It never
//! blocks and never touches a socket or a file, which keeps every
//! transition testable without a network.
//!
//! Item processing is split by item kind:
//! - `upload`: collision detection, autorename, resume, STOR/APPE
//! - `download`: local target creation, REST, RETR
//! - `simple`: DELE / RMD / SITE CHMOD and directory exploration
//! - `listing`: CWD + LIST sub-sequence feeding the listing cache
//! - `data`: PASV / PORT data connection setup

mod data;
mod download;
mod listing;
mod simple;
mod upload;

use crate::engine::caps::ServerCaps;
use crate::engine::config::EngineConfig;
use crate::engine::disk::{CreateMode, DiskFailure, ReadChunk};
use crate::engine::listing_cache::ListingCache;
use crate::engine::opened_files::{FileLock, OpenedFiles};
use crate::engine::oplog::OperationLog;
use crate::engine::protocol::Command;
use crate::engine::queue::OperationQueue;
use crate::engine::reply::Reply;
use crate::engine::types::*;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Input to the machine.
#[derive(Debug)]
pub enum Event {
    ShouldStop,
    Pause,
    /// Final (non-1xx) reply to the outstanding command.
    Reply(Reply),
    /// Preliminary 1xx reply.
    Info(Reply),
    ConnectionClosed { reply_timeout: bool },
    /// A listing this worker was waiting for may be available now.
    ListingFinished,
    DelayedRetryTimer,
    DataListening(SocketAddr),
    DataListenFailed(String),
    DataConnected,
    DataWritten { bytes: usize },
    DataReceived(Vec<u8>),
    /// The data connection is gone; `error` is `None` for a clean end.
    DataClosed { error: Option<String>, no_data_timeout: bool },
    DiskFinished(DiskEvent),
}

/// Result of a [`DiskRequest`], the file itself stays with the driver.
#[derive(Debug)]
pub enum DiskEvent {
    Opened { size: u64 },
    Read(ReadChunk),
    Created { name: String, existing_size: u64 },
    Written { mismatch: bool },
    Deleted,
    Failed(DiskFailure),
}

/// Disk work on the item's local file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiskRequest {
    Open { path: PathBuf },
    Read { offset: u64, len: usize, ascii: bool, prev_cr: bool },
    Create { dir: PathBuf, name: String, mode: CreateMode },
    Write { offset: u64, data: Vec<u8>, verify_len: usize },
    Delete { path: PathBuf },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataTarget {
    Passive(SocketAddr),
    /// Accept on the listener opened by [`Effect::Listen`].
    Active,
}

/// Work for the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Send(Command),
    /// Best-effort QUIT, then close.
    Quit,
    Listen,
    ActivateData(DataTarget),
    WriteData(Vec<u8>),
    ReadData,
    /// Flush and close cleanly.
    FinishData,
    /// Abort.
    CloseData,
    Disk(DiskRequest),
    CloseFile,
    StartTimer(Duration),
    Progress { done: u64, delta: u64 },
    Status(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Continue,
    /// The item left this worker; look for more work.
    ItemDone,
    /// As `ItemDone`, but the connection must be dropped first.
    Reconnect,
    Stopped,
}

#[derive(Debug)]
pub struct Step {
    pub effects: Vec<Effect>,
    pub outcome: Outcome,
}

/// Shared state a transition may consult or update.
pub struct MachineEnv<'a> {
    pub queue: &'a OperationQueue,
    pub cache: &'a ListingCache,
    pub opened: &'a OpenedFiles,
    pub config: &'a EngineConfig,
    pub caps: &'a ServerCaps,
    pub oplog: &'a OperationLog,
    pub scope: &'a ServerScope,
}

/// Position within the processing of one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubState {
    Idle,
    WaitForListing,
    DelayedRetry,
    // listing
    ListCwd,
    ListType,
    ListTransfer,
    // data connection
    DataPasv,
    DataListen,
    DataPort,
    // upload
    UpOpenSource,
    UpResolveLink,
    UpCwd,
    UpType,
    UpSize,
    UpDeleteExisting,
    UpStore,
    UpDeleteAsciiBinary,
    UpDeleteSource,
    // download
    DnCreateTarget,
    DnCwd,
    DnType,
    DnRest,
    DnRetr,
    DnDeleteSource,
    // delete / chattrs
    SimpleCwd,
    SimpleCommand,
}

/// What the server knows about this connection, reset on reconnect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct ConnCache {
    cwd: Option<String>,
    transfer_type: Option<TransferType>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UploadMode {
    NewFile,
    Autorename,
    Resume,
    ResumeOrOverwrite,
    Overwrite,
    TestIfFinished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DataPurpose {
    Store,
    Retrieve,
    List,
}

/// Where to continue once a listing is available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListingReturn {
    Determine,
    Rename,
    Explore,
}

#[derive(Debug)]
struct ListingJob {
    dir: String,
    ret: ListingReturn,
    buf: Vec<u8>,
    /// This worker holds the fetch in the cache.
    fetching: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum LocalError {
    AsciiBinary,
    SrcRead(DiskFailure),
    TgtWrite(DiskFailure),
    VerifyMismatch,
}

/// Byte accounting of the running transfer.
#[derive(Debug, Default)]
struct Pump {
    file_offset: u64,
    /// Bytes that went over the data connection.
    transferred: u64,
    eols: u64,
    last_cr: bool,
    pending_eof: bool,
    sent_all: bool,
    pending_len: usize,
    verify_remaining: u64,
}

/// Per-item scratch.
#[derive(Debug)]
struct Job {
    item: QueueItem,
    mode: UploadMode,
    download_mode: CreateMode,
    src_size: u64,
    lock: Option<FileLock>,
    resume_offset: Option<u64>,
    phase_after: AutorenamePhase,
    data_for: DataPurpose,
    data_target: Option<DataTarget>,
    data_connected: bool,
    data_error: Option<String>,
    no_data_timeout: bool,
    reply: Option<Reply>,
    listing: Option<ListingJob>,
    local_error: Option<LocalError>,
    pump: Pump,
}

impl Job {
    fn new(item: QueueItem) -> Self {
        Self {
            src_size: item.size.unwrap_or(0),
            item,
            mode: UploadMode::NewFile,
            download_mode: CreateMode::CreateNew,
            lock: None,
            resume_offset: None,
            phase_after: AutorenamePhase::Exhausted,
            data_for: DataPurpose::Store,
            data_target: None,
            data_connected: false,
            data_error: None,
            no_data_timeout: false,
            reply: None,
            listing: None,
            local_error: None,
            pump: Pump::default(),
        }
    }

    fn reset_transfer(&mut self) {
        self.data_target = None;
        self.data_connected = false;
        self.data_error = None;
        self.no_data_timeout = false;
        self.reply = None;
        self.local_error = None;
        self.pump = Pump::default();
    }
}

#[derive(Debug)]
struct Core {
    worker: WorkerId,
    sub: SubState,
    conn: ConnCache,
    awaiting_reply: bool,
    data_open: bool,
    data_closing: bool,
    stopping: bool,
    out: Vec<Effect>,
    outcome: Outcome,
}

impl Core {
    fn reset_item_flags(&mut self) {
        self.sub = SubState::Idle;
        self.awaiting_reply = false;
        self.data_open = false;
        self.data_closing = false;
    }
}

/// The protocol state machine of one worker.
#[derive(Debug)]
pub struct Machine {
    core: Core,
    job: Option<Job>,
}

impl Machine {
    pub fn new(worker: WorkerId) -> Self {
        Self {
            core: Core {
                worker,
                sub: SubState::Idle,
                conn: ConnCache::default(),
                awaiting_reply: false,
                data_open: false,
                data_closing: false,
                stopping: false,
                out: Vec::new(),
                outcome: Outcome::Continue,
            },
            job: None,
        }
    }

    pub fn worker(&self) -> WorkerId {
        self.core.worker
    }

    pub fn sub_state(&self) -> SubState {
        self.core.sub
    }

    pub fn current_item(&self) -> Option<ItemId> {
        self.job.as_ref().map(|j| j.item.id)
    }

    /// A command was sent and its final reply has not arrived yet.
    pub fn awaiting_reply(&self) -> bool {
        self.core.awaiting_reply
    }

    pub fn waiting_for_listing(&self) -> bool {
        self.core.sub == SubState::WaitForListing
    }

    /// Forget what the previous connection had set up.
    pub fn connection_reset(&mut self) {
        self.core.conn = ConnCache::default();
        self.core.awaiting_reply = false;
    }

    /// Begin processing `id`, already marked Processing for this worker.
    pub fn start(&mut self, id: ItemId, env: &MachineEnv<'_>) -> Step {
        self.core.out.clear();
        self.core.outcome = Outcome::Continue;
        self.core.stopping = false;
        match env.queue.get(id) {
            Some(item) => {
                log::debug!("{} starts {} ({:?} {})", self.core.worker, id, item.kind, item.name);
                let mut job = Job::new(item);
                let mut run = Run {
                    core: &mut self.core,
                    job: &mut job,
                    env,
                };
                run.begin();
                self.job = Some(job);
            }
            None => self.core.outcome = Outcome::ItemDone,
        }
        self.finish_step()
    }

    pub fn handle(&mut self, event: Event, env: &MachineEnv<'_>) -> Step {
        self.core.out.clear();
        self.core.outcome = Outcome::Continue;
        if let Event::ConnectionClosed { .. } = event {
            self.core.conn = ConnCache::default();
        }
        match self.job.as_mut() {
            Some(job) => {
                let mut run = Run {
                    core: &mut self.core,
                    job,
                    env,
                };
                run.dispatch(event);
            }
            None => match event {
                Event::ShouldStop => {
                    self.core.out.push(Effect::Quit);
                    self.core.outcome = Outcome::Stopped;
                }
                Event::ConnectionClosed { .. } => self.core.outcome = Outcome::Reconnect,
                other => log::trace!("{} idle, ignoring {:?}", self.core.worker, other),
            },
        }
        self.finish_step()
    }

    fn finish_step(&mut self) -> Step {
        let outcome = self.core.outcome;
        if outcome != Outcome::Continue {
            self.job = None;
            self.core.reset_item_flags();
            if outcome == Outcome::Reconnect {
                self.core.conn = ConnCache::default();
            }
        }
        Step {
            effects: std::mem::take(&mut self.core.out),
            outcome,
        }
    }
}

/// One transition in progress: the machine, the item scratch and the
/// shared environment, borrowed together.
struct Run<'r, 'e> {
    core: &'r mut Core,
    job: &'r mut Job,
    env: &'r MachineEnv<'e>,
}

impl Run<'_, '_> {
    fn begin(&mut self) {
        let kind = self.job.item.kind;
        if kind.is_upload() {
            self.start_upload();
        } else if kind.is_download() {
            self.start_download();
        } else if kind.is_explore() {
            self.explore();
        } else {
            self.start_simple();
        }
    }

    fn dispatch(&mut self, event: Event) {
        match event {
            Event::ShouldStop => self.stop(),
            Event::Pause => self.pause(),
            Event::Reply(reply) => {
                if !self.core.awaiting_reply {
                    log::warn!("{} unexpected reply {}", self.core.worker, reply.text());
                    return;
                }
                self.core.awaiting_reply = false;
                self.on_reply(reply);
            }
            Event::Info(reply) => log::trace!("{} {}", self.core.worker, reply.text()),
            Event::ConnectionClosed { reply_timeout } => self.on_connection_closed(reply_timeout),
            Event::ListingFinished => {
                if self.core.sub == SubState::WaitForListing {
                    self.resume_after_listing();
                }
            }
            Event::DelayedRetryTimer => {
                if self.core.sub == SubState::DelayedRetry {
                    self.requeue();
                }
            }
            Event::DataListening(addr) => self.on_listening(addr),
            Event::DataListenFailed(msg) => {
                self.core.data_open = false;
                self.fail(ProblemCode::ListenFailure, None, Some(msg));
            }
            Event::DataConnected => {
                self.job.data_connected = true;
                self.on_data_connected();
            }
            Event::DataWritten { bytes } => self.on_data_written(bytes),
            Event::DataReceived(bytes) => self.on_data_received(bytes),
            Event::DataClosed { error, no_data_timeout } => {
                self.core.data_open = false;
                self.core.data_closing = false;
                if error.is_some() && self.job.data_error.is_none() {
                    self.job.data_error = error;
                }
                self.job.no_data_timeout |= no_data_timeout;
                self.on_data_closed();
            }
            Event::DiskFinished(ev) => self.on_disk(ev),
        }
    }

    fn on_reply(&mut self, reply: Reply) {
        use SubState::*;
        match self.core.sub {
            ListCwd => self.on_list_cwd(reply),
            ListType => self.on_list_type(reply),
            ListTransfer => self.on_transfer_reply(reply),
            DataPasv => self.on_pasv(reply),
            DataPort => self.on_port(reply),
            UpResolveLink => self.on_resolve_link(reply),
            UpCwd => self.on_upload_cwd(reply),
            UpType => self.on_upload_type(reply),
            UpSize => self.on_size(reply),
            UpDeleteExisting => self.on_delete_existing(reply),
            UpStore | DnRetr => self.on_transfer_reply(reply),
            UpDeleteAsciiBinary => self.on_ascii_binary_deleted(reply),
            DnCwd => self.on_download_cwd(reply),
            DnType => self.on_download_type(reply),
            DnRest => self.on_rest(reply),
            DnDeleteSource => self.on_download_source_deleted(reply),
            SimpleCwd => self.on_simple_cwd(reply),
            SimpleCommand => self.on_simple_command(reply),
            other => log::warn!("{} reply {} in {:?}", self.core.worker, reply.code, other),
        }
    }

    fn on_disk(&mut self, ev: DiskEvent) {
        match self.core.sub {
            SubState::UpOpenSource => self.on_source_opened(ev),
            SubState::UpStore => self.on_upload_chunk(ev),
            SubState::UpDeleteSource => self.on_local_source_deleted(ev),
            SubState::DnCreateTarget => self.on_target_created(ev),
            SubState::DnRetr => self.on_chunk_written(ev),
            other => log::debug!("{} disk result {:?} in {:?}", self.core.worker, ev, other),
        }
    }

    fn on_data_connected(&mut self) {
        match self.core.sub {
            SubState::UpStore => self.read_next_chunk(),
            SubState::DnRetr | SubState::ListTransfer => self.effect(Effect::ReadData),
            _ => {}
        }
    }

    fn on_data_written(&mut self, bytes: usize) {
        if self.core.sub == SubState::UpStore {
            self.upload_chunk_sent(bytes);
        }
    }

    fn on_data_received(&mut self, bytes: Vec<u8>) {
        match self.core.sub {
            SubState::DnRetr => self.write_received(bytes),
            SubState::ListTransfer => {
                if let Some(listing) = self.job.listing.as_mut() {
                    listing.buf.extend_from_slice(&bytes);
                }
                self.effect(Effect::ReadData);
            }
            _ => {}
        }
    }

    fn on_data_closed(&mut self) {
        if self.job.reply.is_none() {
            return;
        }
        match self.core.sub {
            SubState::UpStore => self.evaluate_store(),
            SubState::DnRetr => self.evaluate_retrieve(),
            SubState::ListTransfer => self.evaluate_listing(),
            _ => {}
        }
    }

    /// Final reply of STOR/APPE/RETR/LIST: evaluate once the data
    /// connection is closed too.
    fn on_transfer_reply(&mut self, reply: Reply) {
        let failed = !reply.is_success();
        self.job.reply = Some(reply);
        if self.core.data_open {
            if failed {
                self.close_data();
            }
            return;
        }
        match self.core.sub {
            SubState::UpStore => self.evaluate_store(),
            SubState::DnRetr => self.evaluate_retrieve(),
            _ => self.evaluate_listing(),
        }
    }

    fn on_connection_closed(&mut self, reply_timeout: bool) {
        self.core.awaiting_reply = false;
        self.core.data_open = false;
        match self.core.sub {
            SubState::UpStore => self.store_connection_lost(reply_timeout),
            SubState::UpDeleteSource => {}
            _ => {
                self.log_info(if reply_timeout {
                    "Server did not reply in time, reconnecting"
                } else {
                    "Connection lost, reconnecting"
                });
                self.release(Outcome::Reconnect);
            }
        }
    }

    fn stop(&mut self) {
        self.core.stopping = true;
        match self.core.sub {
            // Local delete in flight: the item is finished by its result.
            SubState::UpDeleteSource => {}
            _ => self.release(Outcome::Stopped),
        }
    }

    fn pause(&mut self) {
        match self.core.sub {
            SubState::UpDeleteSource => {}
            _ if self.core.awaiting_reply || self.core.data_open => self.release(Outcome::Reconnect),
            _ => self.release(Outcome::ItemDone),
        }
    }

    // ── Helpers ──────────────────────────────────────────────────────

    fn enter(&mut self, sub: SubState) {
        if self.core.sub != sub {
            log::debug!("{} {} {:?} -> {:?}", self.core.worker, self.job.item.id, self.core.sub, sub);
        }
        self.core.sub = sub;
    }

    fn effect(&mut self, effect: Effect) {
        self.core.out.push(effect);
    }

    fn send(&mut self, cmd: Command, next: SubState) {
        self.core.awaiting_reply = true;
        self.effect(Effect::Send(cmd));
        self.enter(next);
    }

    fn status(&mut self, text: String) {
        self.effect(Effect::Status(text));
    }

    /// Abort the data connection; exactly one `DataClosed` follows.
    fn close_data(&mut self) {
        if self.core.data_open && !self.core.data_closing {
            self.core.data_closing = true;
            self.effect(Effect::CloseData);
        }
    }

    fn finish_data(&mut self) {
        if self.core.data_open && !self.core.data_closing {
            self.core.data_closing = true;
            self.effect(Effect::FinishData);
        }
    }

    fn log_info(&self, msg: impl Into<String>) {
        self.env
            .oplog
            .info(Some(self.core.worker), Some(self.job.item.id), msg);
    }

    /// Change item fields both in the scratch copy and in the queue.
    fn edit(&mut self, f: impl Fn(&mut QueueItem)) {
        f(&mut self.job.item);
        if let Err(e) = self.env.queue.edit_item(self.job.item.id, f) {
            log::warn!("{} edit failed: {}", self.core.worker, e);
        }
    }

    fn set_force(&mut self, force: ForceAction) {
        self.edit(move |i| i.force_action = force);
    }

    fn set_state(&mut self, state: ItemState, problem: ProblemCode, os_error: Option<i32>, detail: Option<String>) {
        if let Err(e) = self
            .env
            .queue
            .update_item_state(self.job.item.id, state, problem, os_error, detail)
        {
            log::warn!("{} state update failed: {}", self.core.worker, e);
        }
    }

    /// Give up a listing fetch this worker still owns.
    fn abandon_listing(&mut self) {
        if let Some(listing) = self.job.listing.as_mut() {
            if listing.fetching {
                listing.fetching = false;
                let dir = listing.dir.clone();
                self.env
                    .cache
                    .listing_failed(self.env.scope, &dir, self.core.worker, false);
            }
        }
    }

    fn end(&mut self, outcome: Outcome) {
        self.abandon_listing();
        if self.core.stopping {
            self.effect(Effect::Quit);
            self.core.outcome = Outcome::Stopped;
        } else {
            self.core.outcome = outcome;
        }
    }

    fn done(&mut self) {
        self.set_state(ItemState::Done, ProblemCode::Ok, None, None);
        log::info!("{} {} done", self.core.worker, self.job.item.id);
        self.end(Outcome::ItemDone);
    }

    fn fail(&mut self, problem: ProblemCode, os_error: Option<i32>, detail: Option<String>) {
        self.end_with_error(ItemState::Failed, problem, os_error, detail);
    }

    fn ask_user(&mut self, problem: ProblemCode) {
        self.end_with_error(ItemState::UserInputNeeded, problem, None, None);
    }

    fn skip(&mut self, problem: ProblemCode) {
        self.end_with_error(ItemState::Skipped, problem, None, None);
    }

    fn end_with_error(&mut self, state: ItemState, problem: ProblemCode, os_error: Option<i32>, detail: Option<String>) {
        let text = match &detail {
            Some(d) => format!("{}: {}", problem, d),
            None => problem.to_string(),
        };
        self.env
            .oplog
            .error(Some(self.core.worker), Some(self.job.item.id), text);
        self.set_state(state, problem, os_error, detail);
        self.end(Outcome::ItemDone);
    }

    /// Back to Waiting for another attempt.
    fn requeue(&mut self) {
        self.set_state(ItemState::Waiting, ProblemCode::Ok, None, None);
        self.end(Outcome::ItemDone);
    }

    fn release(&mut self, outcome: Outcome) {
        self.set_state(ItemState::Waiting, ProblemCode::Ok, None, None);
        self.end(outcome);
    }

    /// Transient failure: let late replies drain before the item is retried.
    fn delayed_retry(&mut self) {
        self.log_info("Transient failure, retrying shortly");
        self.effect(Effect::StartTimer(self.env.config.delayed_auto_retry()));
        self.enter(SubState::DelayedRetry);
    }
}

/// `dir/name` on the server.
pub fn server_join(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{}{}", dir, name)
    } else {
        format!("{}/{}", dir, name)
    }
}
