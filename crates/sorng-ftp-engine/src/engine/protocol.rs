//! Control-channel codec (RFC 959 §4).
//!
//! Handles:
//! - Formatting the commands the engine issues
//! - Writing command lines terminated with `\r\n`
//! - Reading single-line and multi-line replies

use crate::engine::error::{FtpError, FtpResult};
use crate::engine::reply::{parse_code, Reply};
use crate::engine::types::TransferType;
use std::fmt;
use std::net::SocketAddrV4;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// A command the engine sends on the control connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    User(String),
    Pass(String),
    Cwd(String),
    Type(TransferType),
    Pasv,
    Port(SocketAddrV4),
    Size(String),
    Stor(String),
    Appe(String),
    Rest(u64),
    Retr(String),
    List,
    Dele(String),
    Rmd(String),
    Chmod { mode: u32, name: String },
    Quit,
}

impl Command {
    /// The command verb, e.g. `"STOR"`.
    pub fn verb(&self) -> &'static str {
        match self {
            Self::User(_) => "USER",
            Self::Pass(_) => "PASS",
            Self::Cwd(_) => "CWD",
            Self::Type(_) => "TYPE",
            Self::Pasv => "PASV",
            Self::Port(_) => "PORT",
            Self::Size(_) => "SIZE",
            Self::Stor(_) => "STOR",
            Self::Appe(_) => "APPE",
            Self::Rest(_) => "REST",
            Self::Retr(_) => "RETR",
            Self::List => "LIST",
            Self::Dele(_) => "DELE",
            Self::Rmd(_) => "RMD",
            Self::Chmod { .. } => "SITE",
            Self::Quit => "QUIT",
        }
    }

    /// Line written to the log (passwords hidden).
    pub fn loggable(&self) -> String {
        match self {
            Self::Pass(_) => "PASS ********".into(),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(user) => write!(f, "USER {}", user),
            Self::Pass(pass) => write!(f, "PASS {}", pass),
            Self::Cwd(path) => write!(f, "CWD {}", path),
            Self::Type(TransferType::Ascii) => f.write_str("TYPE A"),
            Self::Type(TransferType::Binary) => f.write_str("TYPE I"),
            Self::Pasv => f.write_str("PASV"),
            Self::Port(addr) => {
                let o = addr.ip().octets();
                let port = addr.port();
                write!(
                    f,
                    "PORT {},{},{},{},{},{}",
                    o[0],
                    o[1],
                    o[2],
                    o[3],
                    port / 256,
                    port % 256
                )
            }
            Self::Size(name) => write!(f, "SIZE {}", name),
            Self::Stor(name) => write!(f, "STOR {}", name),
            Self::Appe(name) => write!(f, "APPE {}", name),
            Self::Rest(offset) => write!(f, "REST {}", offset),
            Self::Retr(name) => write!(f, "RETR {}", name),
            Self::List => f.write_str("LIST"),
            Self::Dele(name) => write!(f, "DELE {}", name),
            Self::Rmd(name) => write!(f, "RMD {}", name),
            Self::Chmod { mode, name } => write!(f, "SITE CHMOD {:03o} {}", mode, name),
            Self::Quit => f.write_str("QUIT"),
        }
    }
}

/// Write one command line.
pub async fn write_command<W>(writer: &mut W, cmd: &Command) -> FtpResult<()>
where
    W: AsyncWrite + Unpin,
{
    let line = format!("{}\r\n", cmd);
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    log::trace!(">>> {}", cmd.loggable());
    Ok(())
}

/// Read a single line (CRLF stripped).
async fn read_line_raw<R>(reader: &mut R) -> FtpResult<String>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = String::new();
    let n = reader.read_line(&mut buf).await?;
    if n == 0 {
        return Err(FtpError::disconnected("Server closed connection"));
    }
    Ok(buf.trim_end_matches(|c| c == '\r' || c == '\n').to_string())
}

/// Read a complete FTP reply (possibly multi-line).
///
/// Multi-line replies look like:
/// ```text
/// 220-Welcome to my FTP server
/// 220-This is line 2
/// 220 End of greeting
/// ```
pub async fn read_reply<R>(reader: &mut R) -> FtpResult<Reply>
where
    R: AsyncBufRead + Unpin,
{
    let first = read_line_raw(reader).await?;
    let code = parse_code(&first)?;
    let is_multi = first.as_bytes().get(3) == Some(&b'-');
    let mut lines = vec![first];

    if is_multi {
        let terminator = format!("{} ", code);
        loop {
            let next = read_line_raw(reader).await?;
            let done = next.starts_with(&terminator) || next == code.to_string();
            lines.push(next);
            if done {
                break;
            }
        }
    }

    let reply = Reply { code, lines };
    log::trace!("<<< {}", reply.lines.last().map(String::as_str).unwrap_or(""));
    Ok(reply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::io::BufReader;

    #[test]
    fn test_command_formatting() {
        assert_eq!(Command::Type(TransferType::Ascii).to_string(), "TYPE A");
        assert_eq!(Command::Type(TransferType::Binary).to_string(), "TYPE I");
        assert_eq!(Command::Appe("a.txt".into()).to_string(), "APPE a.txt");
        assert_eq!(
            Command::Chmod { mode: 0o644, name: "f".into() }.to_string(),
            "SITE CHMOD 644 f"
        );
        let port = Command::Port(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 5), 50000));
        assert_eq!(port.to_string(), "PORT 10,0,0,5,195,80");
        assert_eq!(Command::Pass("secret".into()).loggable(), "PASS ********");
    }

    #[tokio::test]
    async fn test_read_single_and_multi_line() {
        let raw: &[u8] = b"220-Welcome\r\n220-line two\r\n220 ready\r\n331 need password\r\n";
        let mut reader = BufReader::new(raw);
        let banner = read_reply(&mut reader).await.unwrap();
        assert_eq!(banner.code, 220);
        assert_eq!(banner.lines.len(), 3);
        let next = read_reply(&mut reader).await.unwrap();
        assert_eq!(next.code, 331);
        assert_eq!(next.message(), "need password");
    }

    #[tokio::test]
    async fn test_read_reply_eof_is_disconnect() {
        let raw: &[u8] = b"";
        let mut reader = BufReader::new(raw);
        let err = read_reply(&mut reader).await.unwrap_err();
        assert!(err.is_connection_loss());
    }

    #[tokio::test]
    async fn test_write_command() {
        let mut out: Vec<u8> = Vec::new();
        write_command(&mut out, &Command::Stor("x.bin".into())).await.unwrap();
        assert_eq!(out, b"STOR x.bin\r\n");
    }

    #[tokio::test]
    async fn test_command_reply_exchange() {
        let mut stream = tokio_test::io::Builder::new()
            .write(b"SIZE big.iso\r\n")
            .read(b"213 4096\r\n")
            .build();
        write_command(&mut stream, &Command::Size("big.iso".into())).await.unwrap();
        let mut reader = BufReader::new(&mut stream);
        let reply = read_reply(&mut reader).await.unwrap();
        assert_eq!(reply.code, 213);
        assert_eq!(reply.message(), "4096");
    }
}
