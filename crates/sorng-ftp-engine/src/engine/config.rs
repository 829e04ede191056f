//! Engine configuration and login parameters.

use crate::engine::error::{FtpError, FtpResult};
use crate::engine::types::{AsciiForBinaryPolicy, CannotCreatePolicy, FileExistsPolicy, ServerScope};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Credentials and address of the server (replaceable at run time).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginParams {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default = "default_password")]
    pub password: String,
}

fn default_port() -> u16 {
    21
}
fn default_user() -> String {
    "anonymous".into()
}
fn default_password() -> String {
    "anonymous@".into()
}

impl LoginParams {
    pub fn new(host: impl Into<String>, port: u16, user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            user: user.into(),
            password: password.into(),
        }
    }

    pub fn scope(&self) -> ServerScope {
        ServerScope::new(self.user.clone(), self.host.clone(), self.port)
    }
}

/// Tunables of one operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Concurrent workers (= control connections).
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,
    #[serde(default = "default_delay_between_retries")]
    pub delay_between_con_retries_sec: u64,
    #[serde(default = "default_reply_timeout")]
    pub server_replies_timeout_sec: u64,
    #[serde(default = "default_data_timeout")]
    pub data_timeout_sec: u64,
    #[serde(default = "default_delayed_retry")]
    pub delayed_auto_retry_ms: u64,
    /// Shorter targets are overwritten instead of resumed.
    #[serde(default = "default_resume_min")]
    pub resume_min_file_size: u64,
    /// Bytes re-downloaded and compared when resuming a download.
    #[serde(default)]
    pub resume_overlap: u64,
    #[serde(default = "default_true")]
    pub use_passive_mode: bool,
    #[serde(default = "default_chunk")]
    pub disk_chunk_size: usize,

    #[serde(default = "default_exists_prompt")]
    pub upload_file_already_exists: FileExistsPolicy,
    #[serde(default = "default_exists_res_ovrwr")]
    pub upload_retry_on_created_file: FileExistsPolicy,
    #[serde(default = "default_exists_resume")]
    pub upload_retry_on_resumed_file: FileExistsPolicy,
    #[serde(default = "default_cannot_create")]
    pub upload_cannot_create_file: CannotCreatePolicy,
    #[serde(default = "default_exists_prompt")]
    pub download_file_already_exists: FileExistsPolicy,
    #[serde(default = "default_exists_res_ovrwr")]
    pub download_retry_on_created_file: FileExistsPolicy,
    #[serde(default = "default_exists_resume")]
    pub download_retry_on_resumed_file: FileExistsPolicy,
    #[serde(default = "default_cannot_create")]
    pub download_cannot_create_file: CannotCreatePolicy,
    #[serde(default = "default_ascii_binary")]
    pub ascii_transfer_for_binary_file: AsciiForBinaryPolicy,
}

fn default_max_workers() -> usize {
    3
}
fn default_connect_retries() -> u32 {
    20
}
fn default_delay_between_retries() -> u64 {
    20
}
fn default_reply_timeout() -> u64 {
    30
}
fn default_data_timeout() -> u64 {
    30
}
fn default_delayed_retry() -> u64 {
    5000
}
fn default_resume_min() -> u64 {
    32_768
}
fn default_true() -> bool {
    true
}
fn default_chunk() -> usize {
    65_536
}
fn default_exists_prompt() -> FileExistsPolicy {
    FileExistsPolicy::UserPrompt
}
fn default_exists_res_ovrwr() -> FileExistsPolicy {
    FileExistsPolicy::ResumeOrOverwrite
}
fn default_exists_resume() -> FileExistsPolicy {
    FileExistsPolicy::Resume
}
fn default_cannot_create() -> CannotCreatePolicy {
    CannotCreatePolicy::UserPrompt
}
fn default_ascii_binary() -> AsciiForBinaryPolicy {
    AsciiForBinaryPolicy::UserPrompt
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            connect_retries: default_connect_retries(),
            delay_between_con_retries_sec: default_delay_between_retries(),
            server_replies_timeout_sec: default_reply_timeout(),
            data_timeout_sec: default_data_timeout(),
            delayed_auto_retry_ms: default_delayed_retry(),
            resume_min_file_size: default_resume_min(),
            resume_overlap: 0,
            use_passive_mode: true,
            disk_chunk_size: default_chunk(),
            upload_file_already_exists: default_exists_prompt(),
            upload_retry_on_created_file: default_exists_res_ovrwr(),
            upload_retry_on_resumed_file: default_exists_resume(),
            upload_cannot_create_file: default_cannot_create(),
            download_file_already_exists: default_exists_prompt(),
            download_retry_on_created_file: default_exists_res_ovrwr(),
            download_retry_on_resumed_file: default_exists_resume(),
            download_cannot_create_file: default_cannot_create(),
            ascii_transfer_for_binary_file: default_ascii_binary(),
        }
    }
}

impl EngineConfig {
    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json(json: &str) -> FtpResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| FtpError::invalid_config(format!("Engine config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> FtpResult<()> {
        if self.max_workers == 0 {
            return Err(FtpError::invalid_config("maxWorkers must be at least 1"));
        }
        if self.disk_chunk_size == 0 {
            return Err(FtpError::invalid_config("diskChunkSize must not be 0"));
        }
        Ok(())
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_secs(self.server_replies_timeout_sec.max(1))
    }

    pub fn data_timeout(&self) -> Duration {
        Duration::from_secs(self.data_timeout_sec.max(1))
    }

    pub fn delayed_auto_retry(&self) -> Duration {
        Duration::from_millis(self.delayed_auto_retry_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.delay_between_con_retries_sec)
    }
}
