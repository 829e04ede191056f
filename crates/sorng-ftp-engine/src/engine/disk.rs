//! Disk work dispatcher.
//!
//! Workers never call blocking file APIs. They submit a [`DiskWork`] and
//! get the result back through a oneshot channel; one dedicated thread
//! executes the work in FIFO order. Files and buffers move into the work
//! item and come back with the result, so nothing can be freed while the
//! dispatcher still uses it.

use crate::engine::autorename::NameGenerator;
use crate::engine::types::{AutorenamePhase, IdAllocator};
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use tokio::sync::oneshot;

pub type DiskWorkId = u64;

const MAX_AUTORENAME_ATTEMPTS: usize = 10_000;

/// How [`DiskWork::CreateFile`] treats an existing file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    /// Fail with `AlreadyExists` when the file is there.
    CreateNew,
    /// Truncate.
    Overwrite,
    /// Keep the contents, report their size.
    Resume,
    /// Create under another free name when taken.
    Autorename,
}

/// One disk operation.
#[derive(Debug)]
pub enum DiskWork {
    OpenForReading {
        path: PathBuf,
    },
    /// Read up to `len` bytes at `offset`. In ASCII mode bare LFs become
    /// CRLF and the chunk is checked for binary content.
    Read {
        file: File,
        offset: u64,
        len: usize,
        ascii: bool,
        prev_cr: bool,
    },
    CreateFile {
        dir: PathBuf,
        name: String,
        mode: CreateMode,
    },
    /// Write `data` at `offset`; the first `verify_len` bytes must match
    /// what is already in the file instead of being written.
    Write {
        file: File,
        offset: u64,
        data: Vec<u8>,
        verify_len: usize,
    },
    DeleteFile {
        path: PathBuf,
    },
}

impl DiskWork {
    fn describe(&self) -> &'static str {
        match self {
            Self::OpenForReading { .. } => "open",
            Self::Read { .. } => "read",
            Self::CreateFile { .. } => "create",
            Self::Write { .. } => "write",
            Self::DeleteFile { .. } => "delete",
        }
    }
}

/// Bytes read for an upload.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReadChunk {
    /// Bytes to send (CRLF-converted in ASCII mode).
    pub data: Vec<u8>,
    /// Bytes consumed from the file.
    pub raw_len: usize,
    pub eof: bool,
    pub eols: u64,
    pub binary: bool,
    pub last_cr: bool,
}

#[derive(Debug)]
pub enum DiskDone {
    Opened { file: File, size: u64 },
    Read { file: File, chunk: ReadChunk },
    Created { file: File, name: String, existing_size: u64 },
    Written { file: File, mismatch: bool },
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskFailureKind {
    AlreadyExists { size: u64 },
    Io,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskFailure {
    pub kind: DiskFailureKind,
    pub os_error: Option<i32>,
    pub message: String,
}

impl From<io::Error> for DiskFailure {
    fn from(e: io::Error) -> Self {
        Self {
            kind: DiskFailureKind::Io,
            os_error: e.raw_os_error(),
            message: e.to_string(),
        }
    }
}

pub type DiskResult = Result<DiskDone, DiskFailure>;

/// Handle to submitted work.
#[derive(Debug)]
pub struct DiskTicket {
    pub id: DiskWorkId,
    pub done: oneshot::Receiver<DiskResult>,
}

struct Job {
    id: DiskWorkId,
    work: DiskWork,
    reply: oneshot::Sender<DiskResult>,
}

#[derive(Default)]
struct DispatchState {
    queue: VecDeque<Job>,
    running: Option<DiskWorkId>,
    shutdown: bool,
}

struct Shared {
    state: Mutex<DispatchState>,
    wake: Condvar,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, DispatchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct DiskWorkDispatcher {
    shared: Arc<Shared>,
    ids: IdAllocator,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for DiskWorkDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state();
        f.debug_struct("DiskWorkDispatcher")
            .field("queued", &state.queue.len())
            .field("running", &state.running)
            .finish()
    }
}

impl DiskWorkDispatcher {
    /// Start the dispatcher thread.
    pub fn new() -> io::Result<Self> {
        let dispatcher = Self::idle();
        let shared = Arc::clone(&dispatcher.shared);
        let handle = std::thread::Builder::new()
            .name("ftp-disk-work".into())
            .spawn(move || run(shared))?;
        *dispatcher.thread.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(dispatcher)
    }

    fn idle() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(DispatchState::default()),
                wake: Condvar::new(),
            }),
            ids: IdAllocator::new(),
            thread: Mutex::new(None),
        }
    }

    pub fn submit(&self, work: DiskWork) -> DiskTicket {
        let id = self.ids.allocate();
        let (reply, done) = oneshot::channel();
        log::trace!("Disk work {} queued ({})", id, work.describe());
        self.shared.state().queue.push_back(Job { id, work, reply });
        self.shared.wake.notify_one();
        DiskTicket { id, done }
    }

    /// Withdraw queued work. Returns `true` when the work is already being
    /// executed; its result still arrives on the ticket and the caller
    /// must wait for it.
    pub fn cancel_work(&self, id: DiskWorkId) -> bool {
        let mut state = self.shared.state();
        if state.running == Some(id) {
            return true;
        }
        state.queue.retain(|job| job.id != id);
        false
    }

    pub fn queued(&self) -> usize {
        self.shared.state().queue.len()
    }

    pub fn shutdown(&self) {
        self.shared.state().shutdown = true;
        self.shared.wake.notify_all();
        let handle = self.thread.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("Disk work thread panicked");
            }
        }
    }
}

impl Drop for DiskWorkDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(shared: Arc<Shared>) {
    loop {
        let job = {
            let mut state = shared.state();
            loop {
                if state.shutdown {
                    return;
                }
                if let Some(job) = state.queue.pop_front() {
                    state.running = Some(job.id);
                    break job;
                }
                state = shared.wake.wait(state).unwrap_or_else(PoisonError::into_inner);
            }
        };
        let Job { id, work, reply } = job;
        let result = execute(work);
        if let Err(e) = &result {
            log::debug!("Disk work {} failed: {}", id, e.message);
        }
        shared.state().running = None;
        // The worker may have gone away; its result is dropped then.
        let _ = reply.send(result);
    }
}

/// Run one piece of work on the calling thread.
pub fn execute(work: DiskWork) -> DiskResult {
    match work {
        DiskWork::OpenForReading { path } => {
            let file = File::open(&path)?;
            let size = file.metadata()?.len();
            Ok(DiskDone::Opened { file, size })
        }
        DiskWork::Read {
            mut file,
            offset,
            len,
            ascii,
            prev_cr,
        } => {
            file.seek(SeekFrom::Start(offset))?;
            let mut raw = vec![0u8; len];
            let n = read_up_to(&mut file, &mut raw)?;
            raw.truncate(n);
            let mut chunk = if ascii {
                to_crlf(&raw, prev_cr)
            } else {
                ReadChunk {
                    data: raw,
                    ..ReadChunk::default()
                }
            };
            chunk.raw_len = n;
            chunk.eof = n < len;
            Ok(DiskDone::Read { file, chunk })
        }
        DiskWork::CreateFile { dir, name, mode } => create_file(&dir, &name, mode),
        DiskWork::Write {
            mut file,
            offset,
            data,
            verify_len,
        } => {
            let verify_len = verify_len.min(data.len());
            file.seek(SeekFrom::Start(offset))?;
            if verify_len > 0 {
                let mut existing = vec![0u8; verify_len];
                let n = read_up_to(&mut file, &mut existing)?;
                if n < verify_len || existing != data[..verify_len] {
                    return Ok(DiskDone::Written { file, mismatch: true });
                }
            }
            file.write_all(&data[verify_len..])?;
            Ok(DiskDone::Written { file, mismatch: false })
        }
        DiskWork::DeleteFile { path } => {
            fs::remove_file(&path)?;
            Ok(DiskDone::Deleted)
        }
    }
}

fn read_up_to(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match file.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}

fn create_file(dir: &Path, name: &str, mode: CreateMode) -> DiskResult {
    fs::create_dir_all(dir)?;
    let path = dir.join(name);
    match mode {
        CreateMode::CreateNew => match open_new(&path) {
            Ok(file) => Ok(DiskDone::Created {
                file,
                name: name.to_string(),
                existing_size: 0,
            }),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                let size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
                Err(DiskFailure {
                    kind: DiskFailureKind::AlreadyExists { size },
                    os_error: e.raw_os_error(),
                    message: format!("{} already exists", path.display()),
                })
            }
            Err(e) => Err(e.into()),
        },
        CreateMode::Overwrite => {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)?;
            Ok(DiskDone::Created {
                file,
                name: name.to_string(),
                existing_size: 0,
            })
        }
        CreateMode::Resume => {
            let file = OpenOptions::new().read(true).write(true).create(true).open(&path)?;
            let existing_size = file.metadata()?.len();
            Ok(DiskDone::Created {
                file,
                name: name.to_string(),
                existing_size,
            })
        }
        CreateMode::Autorename => {
            let mut names = NameGenerator::new(name, AutorenamePhase::Suffix, false);
            let mut candidate = name.to_string();
            for _ in 0..MAX_AUTORENAME_ATTEMPTS {
                match open_new(&dir.join(&candidate)) {
                    Ok(file) => {
                        return Ok(DiskDone::Created {
                            file,
                            name: candidate,
                            existing_size: 0,
                        })
                    }
                    Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                    Err(e) => return Err(e.into()),
                }
                candidate = match names.next_name() {
                    Some(next) => next,
                    None => break,
                };
            }
            Err(DiskFailure {
                kind: DiskFailureKind::Io,
                os_error: None,
                message: format!("no free name for {} in {}", name, dir.display()),
            })
        }
    }
}

fn open_new(path: &Path) -> io::Result<File> {
    OpenOptions::new().read(true).write(true).create_new(true).open(path)
}

/// Whether a byte marks the data as binary for an ASCII transfer.
fn is_binary_byte(b: u8) -> bool {
    b == 0 || (b < 32 && !matches!(b, 9..=13 | 26 | 27))
}

/// Convert bare LFs to CRLF, count line ends and sniff binary content.
pub fn to_crlf(raw: &[u8], prev_cr: bool) -> ReadChunk {
    let mut data = Vec::with_capacity(raw.len() + raw.len() / 32);
    let mut eols = 0;
    let mut binary = false;
    let mut last_cr = prev_cr;
    for &b in raw {
        if b == b'\n' {
            if !last_cr {
                data.push(b'\r');
            }
            eols += 1;
        } else if is_binary_byte(b) {
            binary = true;
        }
        data.push(b);
        last_cr = b == b'\r';
    }
    ReadChunk {
        data,
        raw_len: raw.len(),
        eof: false,
        eols,
        binary,
        last_cr,
    }
}
