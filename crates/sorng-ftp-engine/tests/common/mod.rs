//! In-memory FTP server for driving the engine end to end.
//!
//! Implements the engine's connection traits directly: every control
//! connection shares one virtual filesystem, data connections are
//! `tokio::io::duplex` pipes handed out on `PASV`.

#![allow(dead_code)]

use async_trait::async_trait;
use sorng_ftp_engine::engine::config::{EngineConfig, LoginParams};
use sorng_ftp_engine::engine::connection::{Connector, ControlConnection, DataChannel, DataConnector, DataListener};
use sorng_ftp_engine::engine::error::{FtpError, FtpResult};
use sorng_ftp_engine::engine::protocol::Command;
use sorng_ftp_engine::engine::reply::Reply;
use sorng_ftp_engine::engine::types::{ItemId, ItemState, TransferType};
use sorng_ftp_engine::engine::OperationCoordinator;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;

pub const PASSWORD: &str = "secret";

/// Server state and behaviour knobs.
#[derive(Debug)]
pub struct ServerState {
    pub files: BTreeMap<String, Vec<u8>>,
    pub dirs: BTreeSet<String>,
    pub modes: HashMap<String, u32>,
    /// Files DELE refuses to remove.
    pub protected: BTreeSet<String>,
    pub appe_supported: bool,
    pub size_supported: bool,
    pub rest_supported: bool,
    /// Next STOR/APPE: keep this many bytes, then drop the control connection.
    pub drop_after_bytes: Option<usize>,
    /// Next STOR/APPE: receive everything but never send the final reply.
    pub swallow_store_reply: bool,
    /// ASCII uploads are stored with LF line endings.
    pub ascii_strip_cr: bool,
    /// Pause between 4 KiB pieces of a RETR.
    pub retr_delay: Option<Duration>,
    pub commands: Vec<String>,
    pub logins: usize,
}

#[derive(Clone)]
pub struct MockServer {
    state: Arc<Mutex<ServerState>>,
}

impl MockServer {
    pub fn new() -> Self {
        let mut dirs = BTreeSet::new();
        dirs.insert("/".to_string());
        Self {
            state: Arc::new(Mutex::new(ServerState {
                files: BTreeMap::new(),
                dirs,
                modes: HashMap::new(),
                protected: BTreeSet::new(),
                appe_supported: true,
                size_supported: true,
                rest_supported: true,
                drop_after_bytes: None,
                swallow_store_reply: false,
                ascii_strip_cr: false,
                retr_delay: None,
                commands: Vec::new(),
                logins: 0,
            })),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap()
    }

    pub fn mkdir(&self, path: &str) -> &Self {
        self.state().dirs.insert(path.to_string());
        self
    }

    pub fn put_file(&self, path: &str, data: &[u8]) -> &Self {
        self.state().files.insert(path.to_string(), data.to_vec());
        self
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.state().files.get(path).cloned()
    }

    /// How many commands starting with `prefix` were received.
    pub fn count(&self, prefix: &str) -> usize {
        self.state()
            .commands
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub fn commands(&self) -> Vec<String> {
        self.state().commands.clone()
    }

    pub fn login(&self) -> LoginParams {
        LoginParams::new("mock.example.com", 21, "tester", PASSWORD)
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(MockConnector {
            state: Arc::clone(&self.state),
        })
    }
}

/// Engine settings that keep tests fast.
pub fn fast_config() -> EngineConfig {
    EngineConfig {
        max_workers: 2,
        connect_retries: 0,
        delay_between_con_retries_sec: 0,
        server_replies_timeout_sec: 5,
        data_timeout_sec: 5,
        delayed_auto_retry_ms: 50,
        resume_min_file_size: 1024,
        disk_chunk_size: 4096,
        ..EngineConfig::default()
    }
}

pub fn coordinator(server: &MockServer, config: EngineConfig) -> OperationCoordinator {
    OperationCoordinator::new(config, server.login(), server.connector()).unwrap()
}

/// Run until nothing is left to do; panics after 20 seconds.
pub async fn run_to_end(coordinator: &OperationCoordinator) {
    coordinator.start();
    finish(coordinator).await;
}

/// Wait for an already started operation to end, then stop its workers.
pub async fn finish(coordinator: &OperationCoordinator) {
    tokio::time::timeout(Duration::from_secs(20), coordinator.wait_until_finished())
        .await
        .expect("operation did not finish");
    coordinator.stop_all().await;
}

/// Start the workers and wait until item `id` is in `state`; the workers
/// keep running.
pub async fn start_until(coordinator: &OperationCoordinator, id: ItemId, state: ItemState) {
    coordinator.start();
    let reached = async {
        loop {
            let mut changed = coordinator.queue().subscribe();
            if coordinator.item(id).map(|i| i.state) == Some(state) {
                return;
            }
            if changed.changed().await.is_err() {
                return;
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(20), reached)
        .await
        .expect("item never reached the expected state");
}

/// Deterministic binary content.
pub fn binary(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn join(dir: &str, name: &str) -> String {
    if name.starts_with('/') {
        name.to_string()
    } else if dir.ends_with('/') {
        format!("{}{}", dir, name)
    } else {
        format!("{}/{}", dir, name)
    }
}

fn parent_and_name(path: &str) -> (String, String) {
    match path.rsplit_once('/') {
        Some(("", name)) => ("/".to_string(), name.to_string()),
        Some((dir, name)) => (dir.to_string(), name.to_string()),
        None => ("/".to_string(), path.to_string()),
    }
}

// ─── Connection traits ───────────────────────────────────────────────

struct MockConnector {
    state: Arc<Mutex<ServerState>>,
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, login: &LoginParams) -> FtpResult<Box<dyn ControlConnection>> {
        if login.password != PASSWORD {
            return Err(FtpError::auth_failed("530 Login incorrect"));
        }
        self.state.lock().unwrap().logins += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Box::new(MockControl {
            state: Arc::clone(&self.state),
            cwd: "/".to_string(),
            ascii: false,
            rest: 0,
            replies_tx: tx,
            replies_rx: rx,
            data: Arc::new(MockData::default()),
            server_end: None,
            dead: Arc::new(AtomicBool::new(false)),
        }))
    }
}

struct MockControl {
    state: Arc<Mutex<ServerState>>,
    cwd: String,
    ascii: bool,
    rest: u64,
    replies_tx: mpsc::UnboundedSender<FtpResult<Reply>>,
    replies_rx: mpsc::UnboundedReceiver<FtpResult<Reply>>,
    data: Arc<MockData>,
    server_end: Option<DuplexStream>,
    dead: Arc<AtomicBool>,
}

impl MockControl {
    fn reply(&self, code: u16, text: &str) {
        let _ = self.replies_tx.send(Ok(Reply::new(code, text)));
    }

    fn store(&mut self, name: &str, append: bool) {
        let mut st = self.state.lock().unwrap();
        if append && !st.appe_supported {
            drop(st);
            self.server_end = None;
            return self.reply(500, "APPE not understood");
        }
        let Some(mut end) = self.server_end.take() else {
            drop(st);
            return self.reply(425, "Use PASV first");
        };
        let path = join(&self.cwd, name);
        if st.dirs.contains(&path) {
            drop(st);
            return self.reply(553, "Is a directory");
        }
        if !append {
            st.files.insert(path.clone(), Vec::new());
        }
        let drop_after = st.drop_after_bytes.take();
        let swallow = std::mem::take(&mut st.swallow_store_reply);
        let strip_cr = self.ascii && st.ascii_strip_cr;
        drop(st);

        self.reply(150, "Ok to send data");
        let state = Arc::clone(&self.state);
        let tx = self.replies_tx.clone();
        let dead = Arc::clone(&self.dead);
        tokio::spawn(async move {
            let mut received = Vec::new();
            let mut buf = [0u8; 8192];
            let mut dropped = false;
            loop {
                match end.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => received.extend_from_slice(&buf[..n]),
                }
                if let Some(limit) = drop_after {
                    if received.len() >= limit {
                        received.truncate(limit);
                        dropped = true;
                        break;
                    }
                }
            }
            drop(end);
            if strip_cr {
                received.retain(|b| *b != b'\r');
            }
            {
                let mut st = state.lock().unwrap();
                let file = st.files.entry(path).or_default();
                file.extend_from_slice(&received);
            }
            if dropped {
                dead.store(true, Ordering::SeqCst);
                let _ = tx.send(Err(FtpError::disconnected("Connection reset by peer")));
            } else if !swallow {
                let _ = tx.send(Ok(Reply::new(226, "Transfer complete")));
            }
        });
    }

    fn retrieve(&mut self, name: &str) {
        let path = join(&self.cwd, name);
        let st = self.state.lock().unwrap();
        let Some(content) = st.files.get(&path).cloned() else {
            drop(st);
            self.server_end = None;
            return self.reply(550, "No such file");
        };
        let delay = st.retr_delay;
        drop(st);
        let Some(mut end) = self.server_end.take() else {
            return self.reply(425, "Use PASV first");
        };
        let offset = (std::mem::take(&mut self.rest) as usize).min(content.len());
        self.reply(150, "Opening data connection");
        let tx = self.replies_tx.clone();
        tokio::spawn(async move {
            for piece in content[offset..].chunks(4096) {
                if end.write_all(piece).await.is_err() {
                    return;
                }
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
            }
            let _ = end.shutdown().await;
            drop(end);
            let _ = tx.send(Ok(Reply::new(226, "Transfer complete")));
        });
    }

    fn list(&mut self) {
        let Some(mut end) = self.server_end.take() else {
            return self.reply(425, "Use PASV first");
        };
        let mut body = String::new();
        {
            let st = self.state.lock().unwrap();
            for dir in &st.dirs {
                let (parent, name) = parent_and_name(dir);
                if dir != "/" && parent == self.cwd {
                    body.push_str(&format!("drwxr-xr-x   2 owner group     4096 Jan  1 12:00 {}\r\n", name));
                }
            }
            for (path, content) in &st.files {
                let (parent, name) = parent_and_name(path);
                if parent == self.cwd {
                    body.push_str(&format!(
                        "-rw-r--r--   1 owner group {:>8} Jan  1 12:00 {}\r\n",
                        content.len(),
                        name
                    ));
                }
            }
        }
        self.reply(150, "Here comes the directory listing");
        let tx = self.replies_tx.clone();
        tokio::spawn(async move {
            let _ = end.write_all(body.as_bytes()).await;
            let _ = end.shutdown().await;
            drop(end);
            let _ = tx.send(Ok(Reply::new(226, "Directory send OK")));
        });
    }

    fn execute(&mut self, cmd: &Command) {
        match cmd {
            Command::User(_) => self.reply(331, "Password required"),
            Command::Pass(_) => self.reply(230, "Logged in"),
            Command::Cwd(dir) => {
                let path = join(&self.cwd, dir);
                if self.state.lock().unwrap().dirs.contains(&path) {
                    self.cwd = path;
                    self.reply(250, "Directory changed");
                } else {
                    self.reply(550, "Failed to change directory");
                }
            }
            Command::Type(kind) => {
                self.ascii = *kind == TransferType::Ascii;
                self.reply(200, "Type set");
            }
            Command::Pasv => {
                let (client, server) = tokio::io::duplex(64 * 1024);
                *self.data.slot.lock().unwrap() = Some(client);
                self.server_end = Some(server);
                self.reply(227, "Entering Passive Mode (127,0,0,1,4,1)");
            }
            Command::Port(_) => self.reply(500, "PORT not supported"),
            Command::Size(name) => {
                let path = join(&self.cwd, name);
                let st = self.state.lock().unwrap();
                let answer = if !st.size_supported {
                    (500, "SIZE not understood".to_string())
                } else {
                    match st.files.get(&path) {
                        Some(content) => (213, content.len().to_string()),
                        None => (550, "Could not get file size".to_string()),
                    }
                };
                drop(st);
                self.reply(answer.0, &answer.1);
            }
            Command::Rest(offset) => {
                if self.state.lock().unwrap().rest_supported {
                    self.rest = *offset;
                    self.reply(350, "Restart position accepted");
                } else {
                    self.reply(502, "REST not implemented");
                }
            }
            Command::Stor(name) => self.store(name, false),
            Command::Appe(name) => self.store(name, true),
            Command::Retr(name) => self.retrieve(name),
            Command::List => self.list(),
            Command::Dele(name) => {
                let path = join(&self.cwd, name);
                let mut st = self.state.lock().unwrap();
                let removed = !st.protected.contains(&path) && st.files.remove(&path).is_some();
                drop(st);
                if removed {
                    self.reply(250, "Delete operation successful");
                } else {
                    self.reply(550, "Delete operation failed");
                }
            }
            Command::Rmd(name) => {
                let path = join(&self.cwd, name);
                let mut st = self.state.lock().unwrap();
                let prefix = format!("{}/", path);
                let empty = !st.files.keys().any(|f| f.starts_with(&prefix))
                    && !st.dirs.iter().any(|d| d.starts_with(&prefix));
                let removed = empty && st.dirs.remove(&path);
                drop(st);
                if removed {
                    self.reply(250, "Remove directory operation successful");
                } else {
                    self.reply(550, "Remove directory operation failed");
                }
            }
            Command::Chmod { mode, name } => {
                let path = join(&self.cwd, name);
                let mut st = self.state.lock().unwrap();
                if st.files.contains_key(&path) || st.dirs.contains(&path) {
                    st.modes.insert(path, *mode);
                    drop(st);
                    self.reply(200, "SITE CHMOD command ok");
                } else {
                    drop(st);
                    self.reply(550, "SITE CHMOD command failed");
                }
            }
            Command::Quit => {
                self.dead.store(true, Ordering::SeqCst);
                self.reply(221, "Goodbye");
            }
        }
    }
}

#[async_trait]
impl ControlConnection for MockControl {
    async fn send_command(&mut self, cmd: &Command) -> FtpResult<()> {
        if self.dead.load(Ordering::SeqCst) {
            return Err(FtpError::disconnected("Connection closed"));
        }
        self.state.lock().unwrap().commands.push(cmd.loggable());
        self.execute(cmd);
        Ok(())
    }

    async fn next_reply(&mut self) -> FtpResult<Reply> {
        match self.replies_rx.recv().await {
            Some(reply) => reply,
            None => Err(FtpError::disconnected("Connection closed")),
        }
    }

    fn data_connector(&self) -> Arc<dyn DataConnector> {
        Arc::clone(&self.data) as Arc<dyn DataConnector>
    }

    async fn close(&mut self) {
        self.dead.store(true, Ordering::SeqCst);
        self.server_end = None;
    }
}

#[derive(Default)]
struct MockData {
    slot: Mutex<Option<DuplexStream>>,
}

#[async_trait]
impl DataConnector for MockData {
    async fn connect_passive(&self, _addr: SocketAddr) -> FtpResult<Box<dyn DataChannel>> {
        match self.slot.lock().unwrap().take() {
            Some(stream) => Ok(Box::new(MockChannel(stream))),
            None => Err(FtpError::data_channel("Connection refused")),
        }
    }

    async fn listen(&self) -> FtpResult<Box<dyn DataListener>> {
        Err(FtpError::data_channel("Active mode is not available"))
    }
}

struct MockChannel(DuplexStream);

#[async_trait]
impl DataChannel for MockChannel {
    async fn write_all(&mut self, data: &[u8]) -> FtpResult<()> {
        self.0.write_all(data).await?;
        Ok(())
    }

    async fn read_chunk(&mut self, max: usize) -> FtpResult<Vec<u8>> {
        let mut buf = vec![0u8; max];
        let n = self.0.read(&mut buf).await?;
        buf.truncate(n);
        Ok(buf)
    }

    async fn shutdown(&mut self) -> FtpResult<()> {
        self.0.shutdown().await?;
        Ok(())
    }
}
