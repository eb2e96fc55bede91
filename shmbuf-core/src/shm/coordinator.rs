// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Access coordination: validate, acquire, transfer, release, and notify.

use crate::config::BufferConfig;
use crate::error::ShmError;
use crate::ipc::WaitError;
use crate::shm::exclusion::LockError;
use crate::shm::segment::SegmentResources;
use crate::shm::state::{AccessState, AccessStateMachine};
use crate::shm::transfer::{Access, AccessKind, AccessStatus, DataTransfer};
use crate::types::Timeout;

/// Notifier waits a blocking read may spend before giving up on stale data.
pub const MAX_BLOCKING_RETRIES: u32 = 10;

/// Timeouts closer to zero than this count as zero.
const TIMEOUT_EPSILON: f64 = 1e-6;

fn is_non_zero(secs: f64) -> bool {
    !(-TIMEOUT_EPSILON..=TIMEOUT_EPSILON).contains(&secs)
}

/// Treats a blocking timeout as set only once two consecutive accesses
/// carried a non-zero value.
#[derive(Debug, Default, Clone, Copy)]
pub struct TimeoutDebounce {
    previous: f64,
}

impl TimeoutDebounce {
    /// Record `secs` and report whether blocking is now in effect.
    pub fn observe(&mut self, secs: f64) -> bool {
        let previous = std::mem::replace(&mut self.previous, secs);
        is_non_zero(secs) && is_non_zero(previous)
    }
}

/// Runs access requests against one open buffer.
#[derive(Debug, Default)]
pub struct AccessCoordinator {
    machine: AccessStateMachine,
    debounce: TimeoutDebounce,
}

impl AccessCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> AccessState {
        self.machine.state()
    }

    /// Perform one access.
    ///
    /// A plain read with a non-zero `blocking` timeout that finds only old data
    /// waits on the notifier and tries again, at most `MAX_BLOCKING_RETRIES` times.
    pub fn run<T: DataTransfer>(
        &mut self,
        resources: Option<&mut SegmentResources>,
        config: &BufferConfig,
        transfer: &mut T,
        access: &mut Access<'_>,
        blocking: Timeout,
    ) -> Result<AccessStatus, ShmError> {
        let result = self.run_inner(resources, config, transfer, access, blocking);
        self.machine.reset();
        result
    }

    fn run_inner<T: DataTransfer>(
        &mut self,
        resources: Option<&mut SegmentResources>,
        config: &BufferConfig,
        transfer: &mut T,
        access: &mut Access<'_>,
        blocking: Timeout,
    ) -> Result<AccessStatus, ShmError> {
        let kind = access.kind();
        let blocking_secs = blocking.as_secs_f64();
        let mut retries = 0u32;

        self.machine.transition_to(AccessState::Validating)?;
        let resources = resources.ok_or_else(|| ShmError::misc("buffer is not open"))?;

        if self.debounce.observe(blocking_secs) && !resources.has_notifier() {
            tracing::error!(
                buffer = %config.name,
                timeout_secs = blocking_secs,
                "Blocking read requested but no blocking semaphore is configured"
            );
            return Err(ShmError::NoBlockingNotifierConfigured {
                timeout_secs: blocking_secs,
            });
        }

        loop {
            self.machine.transition_to(AccessState::Acquiring)?;
            if let Err(err) = resources.acquire(kind.intent(), config.timeout.as_duration()) {
                return Err(self.lock_failure(err, config));
            }

            self.machine.transition_to(AccessState::Transferring)?;
            let outcome = transfer.transfer(resources.data_region(), access);

            self.machine.transition_to(AccessState::Releasing)?;
            if let Err(err) = resources.release() {
                tracing::error!(
                    buffer = %config.name,
                    error = ?err,
                    "Failed to release exclusion"
                );
            }

            self.machine.transition_to(AccessState::PostProcessing)?;
            let status = outcome?;

            match status {
                AccessStatus::WriteOk => {
                    if let Some(notifier) = resources.notifier_mut() {
                        if let Err(errno) = notifier.flush() {
                            tracing::warn!(
                                buffer = %config.name,
                                errno = %errno,
                                "Failed to flush blocking semaphore"
                            );
                        }
                    }
                }
                AccessStatus::ReadOld if kind == AccessKind::Read && is_non_zero(blocking_secs) => {
                    if let Some(notifier) = resources.notifier_mut() {
                        if retries >= MAX_BLOCKING_RETRIES {
                            tracing::error!(
                                buffer = %config.name,
                                attempts = retries,
                                "Blocking semaphore keeps waking without new data"
                            );
                            return Err(ShmError::BlockingRetryExhausted { attempts: retries });
                        }
                        retries += 1;

                        match notifier.wait(blocking.as_duration()) {
                            Ok(()) => {}
                            Err(WaitError::TimedOut) => {
                                return Err(ShmError::TimedOut {
                                    waiting_for: "new data",
                                    timeout_secs: blocking_secs,
                                })
                            }
                            Err(WaitError::Primitive(errno)) => {
                                tracing::error!(
                                    buffer = %config.name,
                                    errno = %errno,
                                    "Blocking semaphore wait failed"
                                );
                                return Err(ShmError::misc(format!(
                                    "blocking semaphore wait failed: {}",
                                    errno
                                )));
                            }
                        }

                        self.machine.transition_to(AccessState::Validating)?;
                        continue;
                    }
                }
                _ => {}
            }

            self.machine.transition_to(AccessState::Idle)?;
            return Ok(status);
        }
    }

    fn lock_failure(&self, err: LockError, config: &BufferConfig) -> ShmError {
        match err {
            LockError::TimedOut => {
                if config.timeout.as_secs_f64() > 0.0 {
                    tracing::error!(
                        buffer = %config.name,
                        timeout = %config.timeout,
                        "Timed out waiting for exclusion"
                    );
                }
                ShmError::TimedOut {
                    waiting_for: "exclusion",
                    timeout_secs: config.timeout.as_secs_f64(),
                }
            }
            LockError::Primitive(errno) => {
                tracing::error!(
                    buffer = %config.name,
                    errno = %errno,
                    "Exclusion primitive failed"
                );
                ShmError::misc(format!("exclusion primitive failed: {}", errno))
            }
            LockError::Unsupported(strategy) => {
                tracing::error!(
                    buffer = %config.name,
                    strategy = %strategy,
                    "Exclusion strategy cannot be used from user space"
                );
                ShmError::UnsupportedExclusionStrategy { strategy }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debounce_needs_two_samples() {
        let mut debounce = TimeoutDebounce::default();
        assert!(!debounce.observe(1.0));
        assert!(debounce.observe(1.0));
        assert!(debounce.observe(-1.0));
        assert!(!debounce.observe(0.0));
        assert!(!debounce.observe(2.0));
        assert!(debounce.observe(2.0));
    }

    #[test]
    fn test_debounce_ignores_tiny_values() {
        let mut debounce = TimeoutDebounce::default();
        debounce.observe(1e-7);
        assert!(!debounce.observe(1e-7));
    }

    #[test]
    fn test_unopened_buffer_rejected() {
        let config = BufferConfig::new(
            crate::types::BufferName::new("closed").unwrap(),
            0x10,
            256,
        );
        let mut coordinator = AccessCoordinator::new();
        let mut transfer = crate::shm::transfer::FramedTransfer::new();
        let err = coordinator
            .run(
                None,
                &config,
                &mut transfer,
                &mut Access::CheckIfRead,
                Timeout::from_secs_f64(0.0),
            )
            .unwrap_err();
        assert!(matches!(err, ShmError::MiscError { .. }));
        assert_eq!(coordinator.state(), AccessState::Idle);
    }
}
