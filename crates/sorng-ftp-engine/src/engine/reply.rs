//! Server replies (RFC 959 §4.2) and their classification.
//!
//! The first digit says how the command went, the second one what the
//! reply is about. The state machine branches on both.

use crate::engine::error::{FtpError, FtpResult};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};

lazy_static! {
    static ref PASV_RE: Regex = Regex::new(r"\((\d+),(\d+),(\d+),(\d+),(\d+),(\d+)\)").unwrap();
    static ref PASV_BARE_RE: Regex = Regex::new(r"(\d+),(\d+),(\d+),(\d+),(\d+),(\d+)").unwrap();
}

/// A complete (possibly multi-line) reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub code: u16,
    pub lines: Vec<String>,
}

/// First digit of the reply code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyClass {
    /// 1xx
    Preliminary,
    /// 2xx
    Success,
    /// 3xx
    Intermediate,
    /// 4xx
    TransientError,
    /// 5xx
    PermanentError,
    Unknown,
}

/// Second digit of the reply code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyTopic {
    Syntax,
    Information,
    Connection,
    Authentication,
    Unspecified,
    FileSystem,
}

impl Reply {
    pub fn new(code: u16, text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            code,
            lines: vec![format!("{} {}", code, text)],
        }
    }

    /// All lines joined with `\n`.
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }

    /// The message of the last line, without the code.
    pub fn message(&self) -> &str {
        self.lines
            .last()
            .map(|l| l.get(4..).unwrap_or("").trim())
            .unwrap_or("")
    }

    pub fn class(&self) -> ReplyClass {
        match self.code / 100 {
            1 => ReplyClass::Preliminary,
            2 => ReplyClass::Success,
            3 => ReplyClass::Intermediate,
            4 => ReplyClass::TransientError,
            5 => ReplyClass::PermanentError,
            _ => ReplyClass::Unknown,
        }
    }

    pub fn topic(&self) -> ReplyTopic {
        match (self.code / 10) % 10 {
            0 => ReplyTopic::Syntax,
            1 => ReplyTopic::Information,
            2 => ReplyTopic::Connection,
            3 => ReplyTopic::Authentication,
            5 => ReplyTopic::FileSystem,
            _ => ReplyTopic::Unspecified,
        }
    }

    pub fn is_preliminary(&self) -> bool {
        self.class() == ReplyClass::Preliminary
    }

    pub fn is_success(&self) -> bool {
        self.class() == ReplyClass::Success
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ReplyClass::TransientError
    }

    pub fn is_permanent(&self) -> bool {
        self.class() == ReplyClass::PermanentError
    }

    /// `5x0`-style syntax error: the server does not know the command.
    pub fn is_unsupported_command(&self) -> bool {
        self.is_permanent() && self.topic() == ReplyTopic::Syntax
    }

    /// Transient failure worth a delayed automatic retry
    /// (`4xx` about the connection or the file system).
    pub fn is_retryable_transient(&self) -> bool {
        self.is_transient()
            && matches!(self.topic(), ReplyTopic::Connection | ReplyTopic::FileSystem)
    }

    pub fn to_error(&self) -> FtpError {
        FtpError::from_reply(self.code, &self.text())
    }
}

/// Parse the size out of a `213 <size>` reply to `SIZE`.
pub fn parse_size_reply(reply: &Reply) -> Option<u64> {
    if reply.code != 213 {
        return None;
    }
    reply
        .message()
        .split_whitespace()
        .next()
        .and_then(|s| s.parse::<u64>().ok())
}

/// Parse `h1,h2,h3,h4,p1,p2` from a `227` reply.
///
/// Some servers omit the parentheses, so a bare sequence is accepted too.
pub fn parse_pasv_reply(text: &str) -> FtpResult<SocketAddr> {
    let caps = PASV_RE
        .captures(text)
        .or_else(|| PASV_BARE_RE.captures(text))
        .ok_or_else(|| FtpError::protocol_error(format!("Cannot parse PASV: {}", text)))?;

    let nums: Vec<u8> = (1..=6)
        .map(|i| {
            caps[i]
                .parse::<u8>()
                .map_err(|_| FtpError::protocol_error("PASV number out of range"))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let ip = IpAddr::from([nums[0], nums[1], nums[2], nums[3]]);
    let port = (nums[4] as u16) * 256 + (nums[5] as u16);
    Ok(SocketAddr::new(ip, port))
}

/// Parse the 3-digit reply code from the start of a line.
pub fn parse_code(line: &str) -> FtpResult<u16> {
    if line.len() < 3 || !line.is_char_boundary(3) {
        return Err(FtpError::protocol_error("Response too short to contain code"));
    }
    line[..3]
        .parse::<u16>()
        .map_err(|_| FtpError::protocol_error(format!("Invalid reply code in: '{}'", line)))
}
