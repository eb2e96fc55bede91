// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Public buffer handle.

use crate::config::BufferConfig;
use crate::error::{ShmError, ShmResult};
use crate::ipc::IpcBackend;
use crate::shm::coordinator::AccessCoordinator;
use crate::shm::layout::Layout;
use crate::shm::segment::{CloseReport, SegmentResources};
use crate::shm::transfer::{Access, AccessStatus, DataTransfer, FramedTransfer};
use crate::types::Timeout;

/// A shared memory buffer opened by one process.
///
/// Each handle serves one thread at a time; processes (or threads with their
/// own handles) coordinate through the configured exclusion strategy. The
/// outcome of the latest access stays available through [`ShmBuffer::status`].
pub struct ShmBuffer<T: DataTransfer = FramedTransfer> {
    config: BufferConfig,
    resources: Option<SegmentResources>,
    coordinator: AccessCoordinator,
    transfer: T,
    status: Option<ShmResult<AccessStatus>>,
}

impl ShmBuffer<FramedTransfer> {
    /// Open the buffer with the default single-message framing.
    pub fn open(config: BufferConfig, backend: &dyn IpcBackend) -> ShmResult<Self> {
        Self::open_with(config, backend, FramedTransfer::new())
    }
}

impl<T: DataTransfer> ShmBuffer<T> {
    /// Open the buffer with a custom transfer step.
    pub fn open_with(config: BufferConfig, backend: &dyn IpcBackend, transfer: T) -> ShmResult<Self> {
        let resources = SegmentResources::open(&config, backend).map_err(|err| {
            tracing::error!(
                buffer = %config.name,
                key = %config.key,
                error = %err,
                "Failed to open shared memory buffer"
            );
            err
        })?;

        Ok(Self {
            config,
            resources: Some(resources),
            coordinator: AccessCoordinator::new(),
            transfer,
            status: None,
        })
    }

    fn access(&mut self, mut access: Access<'_>, blocking: Timeout) -> ShmResult<AccessStatus> {
        let result = self.coordinator.run(
            self.resources.as_mut(),
            &self.config,
            &mut self.transfer,
            &mut access,
            blocking,
        );
        self.status = Some(result.clone());
        result
    }

    /// Read the newest message into `out` if it has not been read by this handle yet.
    pub fn read(&mut self, out: &mut Vec<u8>) -> ShmResult<AccessStatus> {
        self.access(Access::Read(out), Timeout::from_secs_f64(0.0))
    }

    /// Read, waiting on the blocking notifier while only old data is present.
    ///
    /// A negative timeout waits forever. The notifier requirement is enforced
    /// from the second consecutive call with a non-zero timeout.
    pub fn blocking_read(&mut self, out: &mut Vec<u8>, timeout_secs: f64) -> ShmResult<AccessStatus> {
        self.access(Access::Read(out), Timeout::from_secs_f64(timeout_secs))
    }

    /// Like `read` but leaves the was-read flag untouched.
    pub fn peek(&mut self, out: &mut Vec<u8>) -> ShmResult<AccessStatus> {
        self.access(Access::Peek(out), Timeout::from_secs_f64(0.0))
    }

    pub fn write(&mut self, message: &[u8]) -> ShmResult<AccessStatus> {
        self.access(Access::Write(message), Timeout::from_secs_f64(0.0))
    }

    /// Write only if the previous message was read; `WriteBlocked` otherwise.
    pub fn write_if_read(&mut self, message: &[u8]) -> ShmResult<AccessStatus> {
        self.access(Access::WriteIfRead(message), Timeout::from_secs_f64(0.0))
    }

    pub fn check_if_read(&mut self) -> ShmResult<bool> {
        match self.access(Access::CheckIfRead, Timeout::from_secs_f64(0.0))? {
            AccessStatus::WasRead(was_read) => Ok(was_read),
            other => Err(ShmError::misc(format!(
                "unexpected status {:?} for was-read check",
                other
            ))),
        }
    }

    /// Outcome of the most recent access, `None` before the first one.
    pub fn status(&self) -> Option<&ShmResult<AccessStatus>> {
        self.status.as_ref()
    }

    pub fn config(&self) -> &BufferConfig {
        &self.config
    }

    pub fn is_open(&self) -> bool {
        self.resources.is_some()
    }

    pub fn layout(&self) -> Option<&Layout> {
        self.resources.as_ref().map(SegmentResources::layout)
    }

    /// True when this handle created the segment.
    pub fn created(&self) -> bool {
        self.resources
            .as_ref()
            .is_some_and(SegmentResources::created)
    }

    /// Largest message a write accepts, 0 once closed.
    pub fn max_payload(&self) -> usize {
        self.layout()
            .map_or(0, |layout| self.transfer.capacity(layout.user_data_size()))
    }

    /// Detach and release. Returns `None` if already closed.
    pub fn close(&mut self) -> Option<CloseReport> {
        let resources = self.resources.take()?;
        let report = resources.close(self.config.delete_totally);
        tracing::debug!(
            buffer = %self.config.name,
            key = %self.config.key,
            destroyed = report.destroyed,
            "Shared memory buffer closed"
        );
        Some(report)
    }
}

impl<T: DataTransfer> Drop for ShmBuffer<T> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<T: DataTransfer> std::fmt::Debug for ShmBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmBuffer")
            .field("name", &self.config.name)
            .field("key", &self.config.key)
            .field("open", &self.is_open())
            .field("status", &self.status)
            .finish()
    }
}
