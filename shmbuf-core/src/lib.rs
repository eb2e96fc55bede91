//! Shmbuf Core Library
//!
//! Single-buffer shared memory transport: a named, keyed segment shared by a
//! master and any number of attaching processes, with selectable mutual
//! exclusion and an optional blocking notifier for readers.

pub mod config;
pub mod error;
pub mod ipc;
pub mod shm;
pub mod types;

// Re-export commonly used types
pub use config::{BufferConfig, ConfigLoader, ExclusionKind, Role};
pub use error::{classify_open_error, ConfigError, ShmError, ShmResult};
pub use ipc::{IpcBackend, LocalIpc, SysvIpc};
pub use shm::{AccessStatus, CloseReport, DataTransfer, FramedTransfer, ShmBuffer};
pub use types::{BufferName, IpcKey, Timeout};
