//! Narrow interfaces to the server plus their plain-TCP implementation.
//!
//! The engine only ever talks to a [`ControlConnection`] (send a command,
//! wait for the next reply) and a [`DataConnector`] (passive connect or
//! active listen). Tests plug in an in-memory server behind the same
//! traits.

use crate::engine::config::LoginParams;
use crate::engine::error::{FtpError, FtpResult};
use crate::engine::protocol::{read_reply, write_command, Command};
use crate::engine::reply::Reply;
use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Opens logged-in control connections.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, login: &LoginParams) -> FtpResult<Box<dyn ControlConnection>>;
}

#[async_trait]
pub trait ControlConnection: Send {
    async fn send_command(&mut self, cmd: &Command) -> FtpResult<()>;

    /// Next complete reply, preliminary (1xx) ones included. Dropping the
    /// future before it resolves loses nothing.
    async fn next_reply(&mut self) -> FtpResult<Reply>;

    fn data_connector(&self) -> Arc<dyn DataConnector>;

    async fn close(&mut self);
}

#[async_trait]
pub trait DataConnector: Send + Sync {
    async fn connect_passive(&self, addr: SocketAddr) -> FtpResult<Box<dyn DataChannel>>;
    async fn listen(&self) -> FtpResult<Box<dyn DataListener>>;
}

#[async_trait]
pub trait DataListener: Send {
    fn local_addr(&self) -> FtpResult<SocketAddr>;
    async fn accept(self: Box<Self>) -> FtpResult<Box<dyn DataChannel>>;
}

#[async_trait]
pub trait DataChannel: Send {
    async fn write_all(&mut self, data: &[u8]) -> FtpResult<()>;
    /// Up to `max` bytes; empty at end of stream.
    async fn read_chunk(&mut self, max: usize) -> FtpResult<Vec<u8>>;
    async fn shutdown(&mut self) -> FtpResult<()>;
}

// ─── TCP ─────────────────────────────────────────────────────────────

/// Plain TCP connector.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    pub connect_timeout: Duration,
    pub reply_timeout: Duration,
    pub data_timeout: Duration,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration, reply_timeout: Duration, data_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            reply_timeout,
            data_timeout,
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, login: &LoginParams) -> FtpResult<Box<dyn ControlConnection>> {
        if login.host.is_empty() {
            return Err(FtpError::invalid_config("Host must not be empty"));
        }
        let addr = format!("{}:{}", login.host, login.port);
        let tcp = timeout(self.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| FtpError::timeout(format!("TCP connect to {} timed out", addr)))?
            .map_err(|e| FtpError::connection_failed(format!("TCP connect to {}: {}", addr, e)))?;
        tcp.set_nodelay(true).ok();
        let local_ip = tcp.local_addr()?.ip();

        let mut conn = TcpControlConnection::new(tcp, local_ip, self.data_timeout);
        let result = login_sequence(&mut conn, login, self.reply_timeout).await;
        if let Err(e) = result {
            conn.close().await;
            return Err(e);
        }
        log::info!("Logged in to {} as {}", addr, login.user);
        Ok(Box::new(conn))
    }
}

async fn final_reply(conn: &mut dyn ControlConnection, limit: Duration) -> FtpResult<Reply> {
    loop {
        let reply = timeout(limit, conn.next_reply())
            .await
            .map_err(|_| FtpError::timeout("Server did not reply in time"))??;
        if !reply.is_preliminary() {
            return Ok(reply);
        }
    }
}

/// Banner, USER, PASS.
async fn login_sequence(conn: &mut dyn ControlConnection, login: &LoginParams, limit: Duration) -> FtpResult<()> {
    let banner = final_reply(conn, limit).await?;
    if !banner.is_success() {
        return Err(FtpError::connection_failed(format!("Server refused connection: {}", banner.text())).with_code(banner.code));
    }

    conn.send_command(&Command::User(login.user.clone())).await?;
    let reply = final_reply(conn, limit).await?;
    let reply = match reply.code {
        331 | 332 => {
            conn.send_command(&Command::Pass(login.password.clone())).await?;
            final_reply(conn, limit).await?
        }
        _ => reply,
    };
    match reply.code {
        200..=299 => Ok(()),
        530 => Err(FtpError::auth_failed(format!("Login failed: {}", reply.text())).with_code(530)),
        code => Err(FtpError::from_reply(code, &reply.text())),
    }
}

/// Control connection over TCP. A reader task parses replies into a
/// channel so that waiting for one can be abandoned at any point.
pub struct TcpControlConnection {
    writer: OwnedWriteHalf,
    replies: mpsc::Receiver<FtpResult<Reply>>,
    reader: JoinHandle<()>,
    data: Arc<TcpDataConnector>,
}

impl TcpControlConnection {
    pub fn new(stream: TcpStream, local_ip: IpAddr, data_timeout: Duration) -> Self {
        let (rd, writer) = stream.into_split();
        let (tx, replies) = mpsc::channel(16);
        let reader = tokio::spawn(async move {
            let mut rd = BufReader::new(rd);
            loop {
                let reply = read_reply(&mut rd).await;
                let failed = reply.is_err();
                if tx.send(reply).await.is_err() || failed {
                    break;
                }
            }
        });
        Self {
            writer,
            replies,
            reader,
            data: Arc::new(TcpDataConnector { local_ip, data_timeout }),
        }
    }
}

#[async_trait]
impl ControlConnection for TcpControlConnection {
    async fn send_command(&mut self, cmd: &Command) -> FtpResult<()> {
        write_command(&mut self.writer, cmd).await
    }

    async fn next_reply(&mut self) -> FtpResult<Reply> {
        match self.replies.recv().await {
            Some(reply) => reply,
            None => Err(FtpError::disconnected("Control connection closed")),
        }
    }

    fn data_connector(&self) -> Arc<dyn DataConnector> {
        self.data.clone()
    }

    async fn close(&mut self) {
        let _ = self.writer.shutdown().await;
        self.reader.abort();
    }
}

impl Drop for TcpControlConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[derive(Debug)]
pub struct TcpDataConnector {
    local_ip: IpAddr,
    data_timeout: Duration,
}

#[async_trait]
impl DataConnector for TcpDataConnector {
    async fn connect_passive(&self, addr: SocketAddr) -> FtpResult<Box<dyn DataChannel>> {
        let tcp = timeout(self.data_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| FtpError::data_channel("PASV data connect timed out"))?
            .map_err(|e| FtpError::data_channel(format!("PASV data connect: {}", e)))?;
        Ok(Box::new(TcpDataChannel { stream: tcp }))
    }

    async fn listen(&self) -> FtpResult<Box<dyn DataListener>> {
        let listener = TcpListener::bind((self.local_ip, 0))
            .await
            .map_err(|e| FtpError::data_channel(format!("PORT bind: {}", e)))?;
        Ok(Box::new(TcpDataListener {
            listener,
            data_timeout: self.data_timeout,
        }))
    }
}

pub struct TcpDataListener {
    listener: TcpListener,
    data_timeout: Duration,
}

#[async_trait]
impl DataListener for TcpDataListener {
    fn local_addr(&self) -> FtpResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    async fn accept(self: Box<Self>) -> FtpResult<Box<dyn DataChannel>> {
        let (tcp, peer) = timeout(self.data_timeout, self.listener.accept())
            .await
            .map_err(|_| FtpError::data_channel("Server did not open the data connection"))?
            .map_err(|e| FtpError::data_channel(format!("PORT accept: {}", e)))?;
        log::trace!("Data connection from {}", peer);
        Ok(Box::new(TcpDataChannel { stream: tcp }))
    }
}

pub struct TcpDataChannel {
    stream: TcpStream,
}

#[async_trait]
impl DataChannel for TcpDataChannel {
    async fn write_all(&mut self, data: &[u8]) -> FtpResult<()> {
        self.stream.write_all(data).await?;
        Ok(())
    }

    async fn read_chunk(&mut self, max: usize) -> FtpResult<Vec<u8>> {
        let mut buf = vec![0u8; max.max(1)];
        let n = self.stream.read(&mut buf).await?;
        buf.truncate(n);
        Ok(buf)
    }

    async fn shutdown(&mut self) -> FtpResult<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncBufReadExt;

    async fn fake_server(script: &'static [(&'static str, &'static str)]) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            let (rd, mut wr) = sock.into_split();
            let mut rd = BufReader::new(rd);
            wr.write_all(b"220-Welcome\r\n220 Ready\r\n").await.unwrap();
            for (expect, answer) in script {
                let mut line = String::new();
                rd.read_line(&mut line).await.unwrap();
                assert!(line.starts_with(expect), "got {}", line);
                wr.write_all(answer.as_bytes()).await.unwrap();
            }
            let mut rest = String::new();
            let _ = rd.read_line(&mut rest).await;
        });
        addr
    }

    fn connector() -> TcpConnector {
        let d = Duration::from_secs(5);
        TcpConnector::new(d, d, d)
    }

    #[tokio::test]
    async fn test_login_and_command() {
        let addr = fake_server(&[
            ("USER", "331 Password required\r\n"),
            ("PASS", "230 Logged in\r\n"),
            ("CWD /up", "250 OK\r\n"),
        ])
        .await;
        let login = LoginParams::new("127.0.0.1", addr.port(), "bob", "secret");
        let mut conn = connector().connect(&login).await.unwrap();
        conn.send_command(&Command::Cwd("/up".into())).await.unwrap();
        let reply = conn.next_reply().await.unwrap();
        assert_eq!(reply.code, 250);
    }

    #[tokio::test]
    async fn test_rejected_login() {
        let addr = fake_server(&[("USER", "331 Password\r\n"), ("PASS", "530 Nope\r\n")]).await;
        let login = LoginParams::new("127.0.0.1", addr.port(), "bob", "wrong");
        let err = connector().connect(&login).await.err().unwrap();
        assert_eq!(err.kind, crate::engine::error::FtpErrorKind::AuthFailed);
    }

    #[tokio::test]
    async fn test_active_data_channel() {
        let data = TcpDataConnector {
            local_ip: "127.0.0.1".parse().unwrap(),
            data_timeout: Duration::from_secs(5),
        };
        let listener = data.listen().await.unwrap();
        let addr = listener.local_addr().unwrap();
        let peer = tokio::spawn(async move {
            let mut s = TcpStream::connect(addr).await.unwrap();
            s.write_all(b"hello").await.unwrap();
        });
        let mut chan = listener.accept().await.unwrap();
        let mut got = Vec::new();
        loop {
            let chunk = chan.read_chunk(3).await.unwrap();
            if chunk.is_empty() {
                break;
            }
            got.extend(chunk);
        }
        peer.await.unwrap();
        assert_eq!(got, b"hello");
    }
}
