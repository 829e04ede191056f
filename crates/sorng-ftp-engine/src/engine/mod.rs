//! # sorng-ftp-engine: FTP operation engine
//!
//! Architecture (leaves first):
//! - `types`: ids, item/worker states, problem codes, policies
//! - `config`: `EngineConfig` (serde, JSON loadable) and login parameters
//! - `error`: `FtpError` for transport/protocol, `QueueError` for the command API
//! - `reply`: reply codes, classification, SIZE/PASV reply parsing
//! - `protocol`: `Command` formatting and the line codec for the control channel
//! - `connection`: narrow traits (control connection, data connector) + TCP implementation
//! - `parser`: LIST / MLSD listing parser
//! - `listing_cache`: shared per-server-path listing cache (one fetcher per path)
//! - `opened_files`: table of server files currently targeted by some worker
//! - `disk`: single-consumer disk work dispatcher (open/read/create/write/delete)
//! - `autorename`: phase-based alternate name generator
//! - `caps`: per-operation server capability flags
//! - `queue`: `OperationQueue`, the item arena and its single update entry point
//! - `oplog`: per-operation log shown to the user
//! - `speed`: transfer speed meter
//! - `machine`: the worker protocol state machine (pure transitions + effects)
//! - `worker`: async driver executing machine effects on real connections
//! - `pool`: `WorkerPool`, spawning and signalling workers
//! - `coordinator`: `OperationCoordinator`, the single object the UI talks to

pub mod types;
pub mod config;
pub mod error;
pub mod reply;
pub mod protocol;
pub mod connection;
pub mod parser;
pub mod listing_cache;
pub mod opened_files;
pub mod disk;
pub mod autorename;
pub mod caps;
pub mod queue;
pub mod oplog;
pub mod speed;
pub mod machine;
pub mod worker;
pub mod pool;
pub mod coordinator;

// Re-exports for lib.rs consumers
pub use types::*;
pub use config::{EngineConfig, LoginParams};
pub use error::{FtpError, FtpErrorKind, FtpResult, QueueError};
pub use coordinator::OperationCoordinator;
pub use queue::OperationQueue;
