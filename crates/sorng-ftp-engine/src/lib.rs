//! # SortOfRemote NG – FTP operation engine
//!
//! Background engine behind multi-file FTP operations:
//!   • Operation queue of upload / download / delete / change-attribute items
//!   • Worker pool, one control connection per worker
//!   • Explicit per-worker protocol state machine (CWD, TYPE, PASV/PORT, SIZE, STOR/APPE, RETR, DELE, QUIT)
//!   • Shared directory-listing cache for server-side name collision checks
//!   • Single-threaded disk work dispatcher for local file I/O
//!   • Collision policies, autorename, resume, delayed auto-retry
//!   • Read-only progress snapshots and an operation log for the UI layer

pub mod engine;
