//! Shared types for the FTP engine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

// ─── Identity ────────────────────────────────────────────────────────

/// Monotonic id source owned by the registry that creates the entities
/// (queue for items, pool for workers, dispatcher for disk work).
#[derive(Debug)]
pub struct IdAllocator {
    next: AtomicU64,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    pub fn allocate(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Stable id of a queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemId(pub u64);

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Stable id of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId(pub u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "W{}", self.0)
    }
}

/// (user, host, port) of the server an operation works against.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerScope {
    pub user: String,
    pub host: String,
    pub port: u16,
}

impl ServerScope {
    pub fn new(user: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            user: user.into(),
            host: host.into(),
            port,
        }
    }
}

// ─── Queue items ─────────────────────────────────────────────────────

/// Kind of work a queue item represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ItemType {
    UploadCopyFile,
    UploadMoveFile,
    DownloadCopyFile,
    DownloadMoveFile,
    DeleteFile,
    DeleteLink,
    DeleteDir,
    DeleteExploreDir,
    ChAttrsFile,
    ChAttrsDir,
    ChAttrsExploreDir,
}

impl ItemType {
    pub fn is_upload(self) -> bool {
        matches!(self, Self::UploadCopyFile | Self::UploadMoveFile)
    }

    pub fn is_download(self) -> bool {
        matches!(self, Self::DownloadCopyFile | Self::DownloadMoveFile)
    }

    pub fn is_move(self) -> bool {
        matches!(self, Self::UploadMoveFile | Self::DownloadMoveFile)
    }

    /// Explore items are handed out before anything else.
    pub fn is_explore(self) -> bool {
        matches!(self, Self::DeleteExploreDir | Self::ChAttrsExploreDir)
    }

    /// Whether the item moves file bytes (counted by the copy progress).
    pub fn transfers_data(self) -> bool {
        self.is_upload() || self.is_download()
    }
}

/// State of a queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ItemState {
    Waiting,
    /// Held by exactly one worker.
    Processing,
    /// Parent waiting for its child items.
    Delayed,
    UserInputNeeded,
    Skipped,
    Failed,
    /// Parent whose children failed or were skipped.
    ForcedToFail,
    Done,
}

impl ItemState {
    /// Still going to be worked on without user help.
    pub fn is_unresolved(self) -> bool {
        matches!(self, Self::Waiting | Self::Processing | Self::Delayed)
    }

    pub fn is_error(self) -> bool {
        matches!(
            self,
            Self::UserInputNeeded | Self::Skipped | Self::Failed | Self::ForcedToFail
        )
    }
}

/// Why an item ended up in an error state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProblemCode {
    Ok,
    // download target on disk
    CannotCreateTgtFile,
    TgtFileAlreadyExists,
    RetryOnCreatedFile,
    RetryOnResumedFile,
    TgtFileWriteError,
    TgtFileReadError,
    ResumeTestFailed,
    IncompleteDownload,
    UnableToDeleteSrcFile,
    // server side
    AsciiTransferForBinaryFile,
    UnableToCwd,
    UnableToCwdOnlyPath,
    ListenFailure,
    UnableToParseListing,
    UnableToResolveLink,
    UnableToDeleteFile,
    UnableToDeleteDir,
    UnableToChangeAttrs,
    UnableToResume,
    // upload
    UploadCannotCreateTgtFile,
    UploadCannotListTgtPath,
    UploadCannotOpenSrcFile,
    UploadTgtFileAlreadyExists,
    UploadAsciiResumeNotSupported,
    UploadUnableToResumeUnknownSize,
    UploadUnableToResumeBigTarget,
    UploadFileAutorenameFailed,
    UploadTestIfFinishedNotSupported,
    SrcFileInUse,
    TgtFileInUse,
    SrcFileReadError,
    IncompleteUpload,
    UnableToDeleteDiskFile,
    // generic
    SkippedByUser,
    ChildItemsFailed,
}

impl ProblemCode {
    pub fn describe(self) -> &'static str {
        match self {
            Self::Ok => "no problem",
            Self::CannotCreateTgtFile => "cannot create target file",
            Self::TgtFileAlreadyExists => "target file already exists",
            Self::RetryOnCreatedFile => "target file was created by an earlier attempt",
            Self::RetryOnResumedFile => "target file was resumed by an earlier attempt",
            Self::TgtFileWriteError => "error writing target file",
            Self::TgtFileReadError => "error reading target file",
            Self::ResumeTestFailed => "resumed part of the file does not match",
            Self::IncompleteDownload => "download did not complete",
            Self::UnableToDeleteSrcFile => "unable to delete source file",
            Self::AsciiTransferForBinaryFile => "ASCII transfer mode used for a binary file",
            Self::UnableToCwd => "unable to change working directory",
            Self::UnableToCwdOnlyPath => "unable to change to target path",
            Self::ListenFailure => "unable to open listen socket for data connection",
            Self::UnableToParseListing => "unable to parse directory listing",
            Self::UnableToResolveLink => "unable to resolve link",
            Self::UnableToDeleteFile => "unable to delete file",
            Self::UnableToDeleteDir => "unable to delete directory",
            Self::UnableToChangeAttrs => "unable to change attributes",
            Self::UnableToResume => "server does not support resume",
            Self::UploadCannotCreateTgtFile => "cannot create target file on server",
            Self::UploadCannotListTgtPath => "cannot list target path",
            Self::UploadCannotOpenSrcFile => "cannot open source file",
            Self::UploadTgtFileAlreadyExists => "target file already exists on server",
            Self::UploadAsciiResumeNotSupported => "resume is not possible in ASCII transfer mode",
            Self::UploadUnableToResumeUnknownSize => "unable to resume, target size is unknown",
            Self::UploadUnableToResumeBigTarget => "unable to resume, target is bigger than source",
            Self::UploadFileAutorenameFailed => "unable to create target file under another name",
            Self::UploadTestIfFinishedNotSupported => "unable to verify whether the upload finished",
            Self::SrcFileInUse => "source file is used by another operation",
            Self::TgtFileInUse => "target file is used by another operation",
            Self::SrcFileReadError => "error reading source file",
            Self::IncompleteUpload => "upload did not complete",
            Self::UnableToDeleteDiskFile => "unable to delete source file on disk",
            Self::SkippedByUser => "skipped",
            Self::ChildItemsFailed => "some contained items failed or were skipped",
        }
    }
}

impl fmt::Display for ProblemCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Directive that survives a retry of the item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ForceAction {
    None,
    UseAutorename,
    Resume,
    ResumeOrOverwrite,
    Overwrite,
    /// Engine-inferred: generate a new name without asking.
    UploadForceAutorename,
    /// Engine-inferred: continue autorename in `QueueItem::autorename_phase`.
    UploadContinueAutorename,
    /// Engine-inferred: all bytes were sent but the reply never came.
    UploadTestIfFinished,
}

impl Default for ForceAction {
    fn default() -> Self {
        Self::None
    }
}

/// How far an earlier attempt got with the target file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TgtFileState {
    Unknown,
    Created,
    Resumed,
    Transferred,
}

impl Default for TgtFileState {
    fn default() -> Self {
        Self::Unknown
    }
}

/// Transfer type (RFC 959 TYPE command).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum TransferType {
    Ascii,
    Binary,
}

impl Default for TransferType {
    fn default() -> Self {
        Self::Binary
    }
}

/// Error payload of an item in an error state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemError {
    pub problem: ProblemCode,
    pub os_error: Option<i32>,
    pub detail: Option<String>,
}

/// One unit of work in the operation queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub id: ItemId,
    pub kind: ItemType,
    pub parent: Option<ItemId>,
    /// Source path + name (disk for uploads, server otherwise).
    pub path: String,
    pub name: String,
    /// Target path + name (server for uploads, disk for downloads).
    pub tgt_path: String,
    pub tgt_name: String,
    /// Autorename candidate currently being tried.
    pub renamed_name: Option<String>,
    pub size: Option<u64>,
    pub transfer_type: TransferType,
    /// Set only for the ASCII `UploadTestIfFinished` verification.
    pub size_with_crlf_eols: u64,
    pub number_of_eols: u64,
    /// Unix mode for change-attribute items.
    pub attrs: Option<u32>,
    pub state: ItemState,
    pub worker: Option<WorkerId>,
    pub force_action: ForceAction,
    pub tgt_file_state: TgtFileState,
    pub autorename_phase: AutorenamePhase,
    pub error: Option<ItemError>,
    /// Parent bookkeeping: children not yet finished / ended in an error state.
    pub children_unresolved: u32,
    pub children_in_error: u32,
}

impl QueueItem {
    /// Name the data is written under on the server.
    pub fn effective_tgt_name(&self) -> &str {
        self.renamed_name.as_deref().unwrap_or(&self.tgt_name)
    }

    pub fn is_ascii(&self) -> bool {
        self.transfer_type == TransferType::Ascii
    }
}

/// Phase of the autorename generator (stored on the item between retries).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AutorenamePhase {
    /// Keep the name, append " (N)".
    Suffix,
    /// Also make the name valid for Windows servers.
    WindowsSafe,
    /// Nothing else to try.
    Exhausted,
}

impl Default for AutorenamePhase {
    fn default() -> Self {
        Self::Suffix
    }
}

// ─── Policies ────────────────────────────────────────────────────────

/// What to do when the target file already exists.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum FileExistsPolicy {
    UserPrompt,
    Autorename,
    Resume,
    ResumeOrOverwrite,
    Overwrite,
    Skip,
}

/// What to do when the target name cannot be created.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum CannotCreatePolicy {
    UserPrompt,
    Autorename,
    Skip,
}

/// What to do when a binary file is sent in ASCII mode.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum AsciiForBinaryPolicy {
    UserPrompt,
    TransferInBinary,
    Skip,
}

// ─── Directory listing ───────────────────────────────────────────────

/// Type of a remote filesystem entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum EntryKind {
    File,
    Directory,
    Link,
}

/// Size of a listed file as far as the engine knows it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ListedSize {
    Known(u64),
    Unknown,
    /// Stored by us in ASCII mode or appended; the listing must be re-read.
    NeedsUpdate,
}

/// One entry of a cached listing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ListingEntry {
    pub name: String,
    pub kind: EntryKind,
    pub size: ListedSize,
}

// ─── Workers ─────────────────────────────────────────────────────────

/// Lifecycle state of a worker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum WorkerState {
    LookingForWork,
    Sleeping,
    Connecting,
    WaitingForReconnect,
    ConnectionError,
    Working,
    Stopped,
}

/// Read-only worker snapshot for the UI.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatus {
    pub id: WorkerId,
    pub state: WorkerState,
    pub current_item: Option<ItemId>,
    pub paused: bool,
    pub status_text: String,
    pub error: Option<String>,
    /// Bytes of the current item moved so far.
    pub item_done_bytes: u64,
    pub speed_bps: u64,
}

impl WorkerStatus {
    pub fn new(id: WorkerId) -> Self {
        Self {
            id,
            state: WorkerState::LookingForWork,
            current_item: None,
            paused: false,
            status_text: String::new(),
            error: None,
            item_done_bytes: 0,
            speed_bps: 0,
        }
    }
}

// ─── Progress ────────────────────────────────────────────────────────

/// Byte-level progress of copy/move operations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CopyProgress {
    pub total_bytes: u64,
    pub done_bytes: u64,
    pub speed_bps: u64,
    pub eta_secs: Option<u64>,
    pub elapsed_secs: u64,
}

/// Item-count progress (delete / change attributes).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SimpleProgress {
    pub total_items: usize,
    pub done_items: usize,
    pub skipped: usize,
    pub failed: usize,
    pub needs_input: usize,
    pub unresolved: usize,
}
