// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! OS primitive backends.
//!
//! The buffer only talks to shared memory and semaphores through the traits in
//! this module. `SysvIpc` maps them onto System V IPC; `LocalIpc` simulates them
//! inside one process so that threads can stand in for cooperating processes.
//!
//! Resources release themselves on drop: a segment detaches, a semaphore closes.
//! Whether that release also destroys the OS object is decided beforehand with
//! `set_destroy_on_detach` / `set_destroy_on_release`.

mod local;
mod sysv;

use std::time::Duration;

use nix::errno::Errno;

use crate::types::IpcKey;

pub use local::{IpcEvent, LocalIpc};
pub use sysv::SysvIpc;

/// Why a semaphore wait did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    /// The timeout elapsed before the semaphore could be taken.
    TimedOut,
    /// The primitive itself failed (removed, invalid, interrupted beyond repair).
    Primitive(Errno),
}

/// One mapping of a shared memory segment.
pub trait SharedSegment: Send {
    /// Base address of the mapping.
    fn as_ptr(&self) -> *mut u8;

    /// Mapped length in bytes.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when this mapping created the segment rather than finding it.
    fn created(&self) -> bool;

    /// Number of processes currently attached, if the OS will say.
    fn attach_count(&self) -> Option<usize>;

    /// Request destruction of the segment when this mapping is dropped.
    fn set_destroy_on_detach(&mut self, destroy: bool);
}

/// Counting semaphore shared between processes.
pub trait Semaphore: Send {
    /// Take the semaphore. `None` blocks without a deadline.
    fn wait(&mut self, timeout: Option<Duration>) -> Result<(), WaitError>;

    fn post(&mut self) -> Result<(), Errno>;

    /// Wake every process currently blocked in `wait` without leaving a
    /// residual count for later waiters.
    fn flush(&mut self) -> Result<(), Errno>;

    fn valid(&self) -> bool;

    /// Request destruction of the semaphore when this handle is dropped.
    fn set_destroy_on_release(&mut self, destroy: bool);
}

/// Factory for segments and semaphores addressed by key.
pub trait IpcBackend {
    /// Create the segment, or open it if it already exists (then `created()` is false).
    fn create_segment(
        &self,
        key: IpcKey,
        size: usize,
        mode: u32,
    ) -> Result<Box<dyn SharedSegment>, Errno>;

    /// Attach to an existing segment; `ENOENT` when nobody created it yet.
    fn attach_segment(&self, key: IpcKey, size: usize) -> Result<Box<dyn SharedSegment>, Errno>;

    /// Create a semaphore with `initial` count, or open it if it already exists.
    fn create_semaphore(
        &self,
        key: IpcKey,
        mode: u32,
        initial: u32,
    ) -> Result<Box<dyn Semaphore>, Errno>;

    /// Open an existing semaphore.
    fn attach_semaphore(&self, key: IpcKey) -> Result<Box<dyn Semaphore>, Errno>;
}
