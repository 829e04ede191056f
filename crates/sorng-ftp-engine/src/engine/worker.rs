//! Worker driver: one tokio task per worker.
//!
//! The task owns the control connection, the transient data connection,
//! the local file of the current item and the timers. It feeds the
//! [`Machine`] one [`Event`] at a time and carries out the [`Effect`]s it
//! answers with. Between items it connects (with retries), looks for
//! waiting work and reacts to pool commands.

use crate::engine::caps::ServerCaps;
use crate::engine::config::{EngineConfig, LoginParams};
use crate::engine::connection::{Connector, ControlConnection, DataChannel, DataListener};
use crate::engine::disk::{DiskDone, DiskFailure, DiskFailureKind, DiskResult, DiskTicket, DiskWork, DiskWorkDispatcher};
use crate::engine::error::{FtpError, FtpErrorKind};
use crate::engine::listing_cache::ListingCache;
use crate::engine::machine::{DataTarget, DiskEvent, DiskRequest, Effect, Event, Machine, MachineEnv, Outcome, Step};
use crate::engine::opened_files::OpenedFiles;
use crate::engine::oplog::OperationLog;
use crate::engine::protocol::Command;
use crate::engine::queue::OperationQueue;
use crate::engine::speed::TransferSpeedMeter;
use crate::engine::types::*;
use std::collections::VecDeque;
use std::fs::File;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep, sleep_until, timeout, Instant};

const QUIT_TIMEOUT: Duration = Duration::from_secs(2);

/// Signal from the pool to one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerCommand {
    Pause,
    Resume,
    /// New login parameters; leaves `ConnectionError`.
    LoginChanged,
    /// New work may be waiting.
    WakeUp,
    Stop,
}

/// Everything the workers of one operation share.
pub struct OperationShared {
    pub queue: OperationQueue,
    pub cache: Arc<ListingCache>,
    pub opened: Arc<OpenedFiles>,
    pub config: EngineConfig,
    pub caps: ServerCaps,
    pub oplog: OperationLog,
    pub login: RwLock<LoginParams>,
    pub connector: Arc<dyn Connector>,
    pub disk: Arc<DiskWorkDispatcher>,
    /// Bytes moved by all workers.
    pub speed: Mutex<TransferSpeedMeter>,
}

impl OperationShared {
    pub fn new(
        config: EngineConfig,
        login: LoginParams,
        connector: Arc<dyn Connector>,
        cache: Arc<ListingCache>,
        opened: Arc<OpenedFiles>,
        disk: Arc<DiskWorkDispatcher>,
    ) -> Self {
        Self {
            queue: OperationQueue::new(),
            cache,
            opened,
            config,
            caps: ServerCaps::new(),
            oplog: OperationLog::new(),
            login: RwLock::new(login),
            connector,
            disk,
            speed: Mutex::new(TransferSpeedMeter::new()),
        }
    }

    pub fn login(&self) -> LoginParams {
        self.login.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn set_login(&self, login: LoginParams) {
        *self.login.write().unwrap_or_else(PoisonError::into_inner) = login;
    }

    pub fn speed(&self) -> MutexGuard<'_, TransferSpeedMeter> {
        self.speed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn machine_env<'a>(&'a self, scope: &'a ServerScope) -> MachineEnv<'a> {
        MachineEnv {
            queue: &self.queue,
            cache: &self.cache,
            opened: &self.opened,
            config: &self.config,
            caps: &self.caps,
            oplog: &self.oplog,
            scope,
        }
    }
}

type DataFuture = Pin<Box<dyn Future<Output = DataResult> + Send>>;

enum DataResult {
    Listening(Box<dyn DataListener>),
    Connected(Box<dyn DataChannel>),
    Written(Box<dyn DataChannel>, usize),
    Received(Box<dyn DataChannel>, Vec<u8>),
    Finished,
    Failed { error: FtpError, timed_out: bool },
}

/// Resources of the item in progress.
#[derive(Default)]
struct ItemIo {
    file: Option<File>,
    disk: Option<DiskTicket>,
    data_op: Option<DataFuture>,
    /// `data_op` is the listen of an active-mode connection.
    listening: bool,
    listener: Option<Box<dyn DataListener>>,
    channel: Option<Box<dyn DataChannel>>,
    timer: Option<Instant>,
}

impl ItemIo {
    fn drop_data(&mut self) {
        self.data_op = None;
        self.listening = false;
        self.listener = None;
        self.channel = None;
    }
}

async fn maybe<F: Future>(fut: Option<F>) -> F::Output {
    match fut {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

pub struct Worker {
    id: WorkerId,
    shared: Arc<OperationShared>,
    commands: mpsc::UnboundedReceiver<WorkerCommand>,
    status: Arc<Mutex<WorkerStatus>>,
    machine: Machine,
    conn: Option<Box<dyn ControlConnection>>,
    scope: ServerScope,
    queue_rx: watch::Receiver<u64>,
    listing_rx: watch::Receiver<u64>,
    paused: bool,
    stopping: bool,
    conn_error: Option<String>,
    io: ItemIo,
    pending_events: VecDeque<Event>,
    reply_deadline: Instant,
    meter: TransferSpeedMeter,
}

impl Worker {
    pub fn new(
        id: WorkerId,
        shared: Arc<OperationShared>,
        commands: mpsc::UnboundedReceiver<WorkerCommand>,
        status: Arc<Mutex<WorkerStatus>>,
    ) -> Self {
        let scope = shared.login().scope();
        let queue_rx = shared.queue.subscribe();
        let listing_rx = shared.cache.subscribe();
        Self {
            id,
            shared,
            commands,
            status,
            machine: Machine::new(id),
            conn: None,
            scope,
            queue_rx,
            listing_rx,
            paused: false,
            stopping: false,
            conn_error: None,
            io: ItemIo::default(),
            pending_events: VecDeque::new(),
            reply_deadline: Instant::now(),
            meter: TransferSpeedMeter::new(),
        }
    }

    pub async fn run(mut self) {
        log::info!("{} started", self.id);
        while !self.stopping {
            self.queue_rx.borrow_and_update();
            if self.paused {
                self.set_state(WorkerState::Sleeping);
                self.wait_idle(false).await;
                continue;
            }
            if let Some(msg) = self.conn_error.clone() {
                self.update_status(|s| {
                    s.state = WorkerState::ConnectionError;
                    s.error = Some(msg);
                });
                self.wait_idle(false).await;
                continue;
            }
            if self.conn.is_none() {
                if !self.shared.queue.has_waiting() {
                    self.set_state(WorkerState::Sleeping);
                    self.wait_idle(true).await;
                    continue;
                }
                self.connect().await;
                continue;
            }
            self.set_state(WorkerState::LookingForWork);
            match self.shared.queue.take_next_waiting(self.id) {
                Some(id) => self.process_item(id).await,
                None => {
                    self.set_state(WorkerState::Sleeping);
                    self.wait_idle(true).await;
                }
            }
        }
        self.shutdown().await;
    }

    // ── Status ───────────────────────────────────────────────────────

    fn update_status(&self, f: impl FnOnce(&mut WorkerStatus)) {
        let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut status);
        status.paused = self.paused;
    }

    fn set_state(&self, state: WorkerState) {
        self.update_status(|s| s.state = state);
    }

    // ── Between items ────────────────────────────────────────────────

    /// Wait for a pool command (and, with `watch_queue`, for a queue change).
    async fn wait_idle(&mut self, watch_queue: bool) {
        let queue_changed = if watch_queue {
            Some(self.queue_rx.changed())
        } else {
            None
        };
        tokio::select! {
            cmd = self.commands.recv() => self.on_idle_command(cmd),
            changed = maybe(queue_changed) => {
                if changed.is_err() {
                    self.stopping = true;
                }
            }
        }
    }

    fn on_idle_command(&mut self, cmd: Option<WorkerCommand>) {
        log::debug!("{} command {:?}", self.id, cmd);
        match cmd {
            Some(WorkerCommand::Pause) => self.paused = true,
            Some(WorkerCommand::Resume) => self.paused = false,
            Some(WorkerCommand::LoginChanged) => {
                if self.conn_error.take().is_some() {
                    self.update_status(|s| s.error = None);
                }
            }
            Some(WorkerCommand::WakeUp) => {}
            Some(WorkerCommand::Stop) | None => self.stopping = true,
        }
        self.update_status(|_| {});
    }

    /// Open a control connection, retrying as configured.
    async fn connect(&mut self) {
        let retries = self.shared.config.connect_retries;
        let mut last_error = String::new();
        for attempt in 0..=retries {
            if attempt > 0 {
                self.set_state(WorkerState::WaitingForReconnect);
                let delay = self.shared.config.reconnect_delay();
                tokio::select! {
                    _ = sleep(delay) => {}
                    cmd = self.commands.recv() => {
                        self.on_idle_command(cmd);
                        if self.stopping || self.paused {
                            return;
                        }
                    }
                }
                if !self.shared.queue.has_waiting() {
                    return;
                }
            }

            self.set_state(WorkerState::Connecting);
            let login = self.shared.login();
            self.update_status(|s| s.status_text = format!("Connecting to {}:{}", login.host, login.port));
            match self.shared.connector.connect(&login).await {
                Ok(conn) => {
                    self.scope = login.scope();
                    self.conn = Some(conn);
                    self.machine.connection_reset();
                    self.update_status(|s| {
                        s.error = None;
                        s.status_text.clear();
                    });
                    self.shared
                        .oplog
                        .info(Some(self.id), None, format!("Connected to {}:{}", login.host, login.port));
                    return;
                }
                Err(e) if e.kind == FtpErrorKind::AuthFailed => {
                    self.shared.oplog.error(Some(self.id), None, e.to_string());
                    self.conn_error = Some(e.message);
                    return;
                }
                Err(e) => {
                    log::warn!("{} connect attempt {} failed: {}", self.id, attempt + 1, e);
                    self.shared.oplog.error(Some(self.id), None, e.to_string());
                    last_error = e.message;
                }
            }
        }
        self.conn_error = Some(last_error);
    }

    async fn close_connection(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            conn.close().await;
        }
    }

    async fn shutdown(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            let _ = timeout(QUIT_TIMEOUT, conn.send_command(&Command::Quit)).await;
            conn.close().await;
        }
        self.shared.queue.release_items_of_worker(self.id);
        self.update_status(|s| {
            s.state = WorkerState::Stopped;
            s.current_item = None;
            s.item_done_bytes = 0;
            s.speed_bps = 0;
        });
        log::info!("{} stopped", self.id);
    }

    // ── One item ─────────────────────────────────────────────────────

    async fn process_item(&mut self, id: ItemId) {
        self.update_status(|s| {
            s.state = WorkerState::Working;
            s.current_item = Some(id);
            s.item_done_bytes = 0;
        });
        let step = {
            let shared = Arc::clone(&self.shared);
            let env = shared.machine_env(&self.scope);
            self.listing_rx.borrow_and_update();
            self.machine.start(id, &env)
        };
        let mut outcome = self.apply(step).await;
        while outcome == Outcome::Continue {
            let event = match self.pending_events.pop_front() {
                Some(event) => event,
                None => self.next_event().await,
            };
            let step = self.handle(event);
            outcome = self.apply(step).await;
        }
        self.end_item(outcome).await;
    }

    fn handle(&mut self, event: Event) -> Step {
        let shared = Arc::clone(&self.shared);
        let env = shared.machine_env(&self.scope);
        self.listing_rx.borrow_and_update();
        self.machine.handle(event, &env)
    }

    async fn end_item(&mut self, outcome: Outcome) {
        if let Some(ticket) = self.io.disk.take() {
            if self.shared.disk.cancel_work(ticket.id) {
                log::debug!("{} waiting for running disk work {}", self.id, ticket.id);
                let _ = ticket.done.await;
            }
        }
        self.io = ItemIo::default();
        self.pending_events.clear();
        self.meter = TransferSpeedMeter::new();
        self.update_status(|s| {
            s.current_item = None;
            s.item_done_bytes = 0;
            s.speed_bps = 0;
            s.status_text.clear();
        });
        match outcome {
            Outcome::Reconnect => self.close_connection().await,
            Outcome::Stopped => {
                self.stopping = true;
                self.close_connection().await;
            }
            Outcome::ItemDone | Outcome::Continue => {}
        }
    }

    async fn next_event(&mut self) -> Event {
        loop {
            let reply_deadline = self.machine.awaiting_reply().then_some(self.reply_deadline);
            let listing_changed = if self.machine.waiting_for_listing() {
                Some(self.listing_rx.changed())
            } else {
                None
            };
            tokio::select! {
                cmd = self.commands.recv() => {
                    if let Some(event) = self.on_item_command(cmd) {
                        return event;
                    }
                }
                reply = maybe(self.conn.as_mut().map(|c| c.next_reply())) => {
                    self.reply_deadline = Instant::now() + self.shared.config.reply_timeout();
                    return match reply {
                        Ok(reply) => {
                            log::trace!("{} <- {}", self.id, reply.text());
                            if reply.is_preliminary() {
                                Event::Info(reply)
                            } else {
                                Event::Reply(reply)
                            }
                        }
                        Err(e) => {
                            log::info!("{} control connection lost: {}", self.id, e);
                            self.close_connection().await;
                            Event::ConnectionClosed { reply_timeout: false }
                        }
                    };
                }
                _ = maybe(reply_deadline.map(sleep_until)) => {
                    log::warn!("{} no reply within {:?}", self.id, self.shared.config.reply_timeout());
                    self.close_connection().await;
                    return Event::ConnectionClosed { reply_timeout: true };
                }
                result = maybe(self.io.data_op.as_mut()) => {
                    self.io.data_op = None;
                    self.reply_deadline = Instant::now() + self.shared.config.reply_timeout();
                    return self.on_data_result(result);
                }
                done = maybe(self.io.disk.as_mut().map(|t| &mut t.done)) => {
                    self.io.disk = None;
                    self.reply_deadline = Instant::now() + self.shared.config.reply_timeout();
                    return self.on_disk_done(done);
                }
                _ = maybe(self.io.timer.map(sleep_until)) => {
                    self.io.timer = None;
                    return Event::DelayedRetryTimer;
                }
                _ = maybe(listing_changed) => {
                    return Event::ListingFinished;
                }
            }
        }
    }

    fn on_item_command(&mut self, cmd: Option<WorkerCommand>) -> Option<Event> {
        log::debug!("{} command {:?} while working", self.id, cmd);
        match cmd {
            Some(WorkerCommand::Pause) => {
                self.paused = true;
                self.update_status(|_| {});
                Some(Event::Pause)
            }
            Some(WorkerCommand::Resume) => {
                self.paused = false;
                self.update_status(|_| {});
                None
            }
            Some(WorkerCommand::LoginChanged) | Some(WorkerCommand::WakeUp) => None,
            Some(WorkerCommand::Stop) | None => {
                self.stopping = true;
                Some(Event::ShouldStop)
            }
        }
    }

    // ── Effects ──────────────────────────────────────────────────────

    async fn apply(&mut self, step: Step) -> Outcome {
        for effect in step.effects {
            match effect {
                Effect::Send(cmd) => self.send(cmd).await,
                Effect::Quit => {
                    if let Some(mut conn) = self.conn.take() {
                        let _ = timeout(QUIT_TIMEOUT, conn.send_command(&Command::Quit)).await;
                        conn.close().await;
                    }
                }
                Effect::Listen => self.listen(),
                Effect::ActivateData(target) => self.activate_data(target),
                Effect::WriteData(bytes) => self.write_data(bytes),
                Effect::ReadData => self.read_data(),
                Effect::FinishData => self.finish_data(),
                Effect::CloseData => {
                    self.io.drop_data();
                    self.pending_events.push_back(Event::DataClosed {
                        error: None,
                        no_data_timeout: false,
                    });
                }
                Effect::Disk(request) => self.submit_disk(request),
                Effect::CloseFile => self.io.file = None,
                Effect::StartTimer(delay) => self.io.timer = Some(Instant::now() + delay),
                Effect::Progress { done, delta } => {
                    self.meter.add(delta);
                    self.shared.speed().add(delta);
                    let speed = self.meter.speed();
                    self.update_status(|s| {
                        s.item_done_bytes = done;
                        s.speed_bps = speed;
                    });
                }
                Effect::Status(text) => self.update_status(|s| s.status_text = text),
            }
        }
        step.outcome
    }

    async fn send(&mut self, cmd: Command) {
        let Some(conn) = self.conn.as_mut() else {
            self.pending_events
                .push_back(Event::ConnectionClosed { reply_timeout: false });
            return;
        };
        log::trace!("{} -> {}", self.id, cmd.loggable());
        self.reply_deadline = Instant::now() + self.shared.config.reply_timeout();
        if let Err(e) = conn.send_command(&cmd).await {
            log::info!("{} sending {} failed: {}", self.id, cmd.verb(), e);
            self.close_connection().await;
            self.pending_events
                .push_back(Event::ConnectionClosed { reply_timeout: false });
        }
    }

    // ── Data connection ──────────────────────────────────────────────

    fn start_data_op<F>(&mut self, op: F)
    where
        F: Future<Output = Result<DataResult, FtpError>> + Send + 'static,
    {
        let limit = self.shared.config.data_timeout();
        self.io.data_op = Some(Box::pin(async move {
            match timeout(limit, op).await {
                Ok(Ok(result)) => result,
                Ok(Err(error)) => DataResult::Failed { error, timed_out: false },
                Err(_) => DataResult::Failed {
                    error: FtpError::timeout("No data transferred within the data timeout"),
                    timed_out: true,
                },
            }
        }));
    }

    fn data_closed_with(&mut self, error: &str) {
        self.io.drop_data();
        self.pending_events.push_back(Event::DataClosed {
            error: Some(error.to_string()),
            no_data_timeout: false,
        });
    }

    fn listen(&mut self) {
        let Some(conn) = self.conn.as_ref() else {
            self.pending_events
                .push_back(Event::DataListenFailed("not connected".into()));
            return;
        };
        let connector = conn.data_connector();
        self.io.listening = true;
        self.start_data_op(async move { Ok(DataResult::Listening(connector.listen().await?)) });
    }

    fn activate_data(&mut self, target: DataTarget) {
        match target {
            DataTarget::Passive(addr) => {
                let Some(conn) = self.conn.as_ref() else {
                    return self.data_closed_with("not connected");
                };
                let connector = conn.data_connector();
                self.start_data_op(async move { Ok(DataResult::Connected(connector.connect_passive(addr).await?)) });
            }
            DataTarget::Active => {
                let Some(listener) = self.io.listener.take() else {
                    return self.data_closed_with("no listening socket");
                };
                self.start_data_op(async move { Ok(DataResult::Connected(listener.accept().await?)) });
            }
        }
    }

    fn write_data(&mut self, bytes: Vec<u8>) {
        let Some(mut channel) = self.io.channel.take() else {
            return self.data_closed_with("data connection is not open");
        };
        self.start_data_op(async move {
            channel.write_all(&bytes).await?;
            Ok(DataResult::Written(channel, bytes.len()))
        });
    }

    fn read_data(&mut self) {
        let Some(mut channel) = self.io.channel.take() else {
            return self.data_closed_with("data connection is not open");
        };
        let max = self.shared.config.disk_chunk_size;
        self.start_data_op(async move {
            let data = channel.read_chunk(max).await?;
            Ok(DataResult::Received(channel, data))
        });
    }

    fn finish_data(&mut self) {
        match self.io.channel.take() {
            Some(mut channel) => self.start_data_op(async move {
                channel.shutdown().await?;
                Ok(DataResult::Finished)
            }),
            None => {
                self.io.drop_data();
                self.pending_events.push_back(Event::DataClosed {
                    error: None,
                    no_data_timeout: false,
                });
            }
        }
    }

    fn on_data_result(&mut self, result: DataResult) -> Event {
        let listening = std::mem::take(&mut self.io.listening);
        match result {
            DataResult::Listening(listener) => match listener.local_addr() {
                Ok(addr) => {
                    self.io.listener = Some(listener);
                    Event::DataListening(addr)
                }
                Err(e) => Event::DataListenFailed(e.message),
            },
            DataResult::Connected(channel) => {
                self.io.channel = Some(channel);
                Event::DataConnected
            }
            DataResult::Written(channel, bytes) => {
                self.io.channel = Some(channel);
                Event::DataWritten { bytes }
            }
            DataResult::Received(channel, data) => {
                if data.is_empty() {
                    Event::DataClosed {
                        error: None,
                        no_data_timeout: false,
                    }
                } else {
                    self.io.channel = Some(channel);
                    Event::DataReceived(data)
                }
            }
            DataResult::Finished => Event::DataClosed {
                error: None,
                no_data_timeout: false,
            },
            DataResult::Failed { error, timed_out } => {
                log::debug!("{} data connection: {}", self.id, error);
                self.io.drop_data();
                if listening {
                    Event::DataListenFailed(error.message)
                } else {
                    Event::DataClosed {
                        error: Some(error.message),
                        no_data_timeout: timed_out,
                    }
                }
            }
        }
    }

    // ── Disk ─────────────────────────────────────────────────────────

    fn submit_disk(&mut self, request: DiskRequest) {
        let work = match request {
            DiskRequest::Open { path } => DiskWork::OpenForReading { path },
            DiskRequest::Read { offset, len, ascii, prev_cr } => match self.io.file.take() {
                Some(file) => DiskWork::Read {
                    file,
                    offset,
                    len,
                    ascii,
                    prev_cr,
                },
                None => return self.no_open_file(),
            },
            DiskRequest::Create { dir, name, mode } => DiskWork::CreateFile { dir, name, mode },
            DiskRequest::Write { offset, data, verify_len } => match self.io.file.take() {
                Some(file) => DiskWork::Write {
                    file,
                    offset,
                    data,
                    verify_len,
                },
                None => return self.no_open_file(),
            },
            DiskRequest::Delete { path } => DiskWork::DeleteFile { path },
        };
        self.io.disk = Some(self.shared.disk.submit(work));
    }

    fn no_open_file(&mut self) {
        self.pending_events
            .push_back(Event::DiskFinished(DiskEvent::Failed(DiskFailure {
                kind: DiskFailureKind::Io,
                os_error: None,
                message: "no open file".into(),
            })));
    }

    fn on_disk_done(&mut self, done: Result<DiskResult, oneshot::error::RecvError>) -> Event {
        let event = match done {
            Ok(Ok(DiskDone::Opened { file, size })) => {
                self.io.file = Some(file);
                DiskEvent::Opened { size }
            }
            Ok(Ok(DiskDone::Read { file, chunk })) => {
                self.io.file = Some(file);
                DiskEvent::Read(chunk)
            }
            Ok(Ok(DiskDone::Created { file, name, existing_size })) => {
                self.io.file = Some(file);
                DiskEvent::Created { name, existing_size }
            }
            Ok(Ok(DiskDone::Written { file, mismatch })) => {
                self.io.file = Some(file);
                DiskEvent::Written { mismatch }
            }
            Ok(Ok(DiskDone::Deleted)) => DiskEvent::Deleted,
            Ok(Err(failure)) => DiskEvent::Failed(failure),
            Err(_) => DiskEvent::Failed(DiskFailure {
                kind: DiskFailureKind::Io,
                os_error: None,
                message: "disk work was dropped".into(),
            }),
        };
        Event::DiskFinished(event)
    }
}
