// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Custom error types for shmbuf.
//!
//! Every buffer operation reports exactly one `ShmError` variant on failure.
//! No `Box<dyn Error>`, no `anyhow::Result` - all errors are strongly typed.

use std::path::PathBuf;

use nix::errno::Errno;
use thiserror::Error;

use crate::config::{ExclusionKind, Role};
use crate::types::IpcKey;

/// Failure taxonomy shared by `open`, `close` and every access call.
///
/// Cloneable so the buffer can keep the last status around until the next call.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ShmError {
    #[error("Permission denied for shared memory key {key}")]
    PermissionDenied { key: IpcKey },

    #[error("Shared memory key {key} conflicts with an existing resource")]
    ResourceConflict { key: IpcKey },

    #[error("Failed to create shared resource: {reason}")]
    CreationFailed { reason: String },

    #[error("No master has created shared memory key {key} yet")]
    NoMasterPresent { key: IpcKey },

    #[error("Timed out after {timeout_secs} sec waiting for {waiting_for}")]
    TimedOut {
        waiting_for: &'static str,
        timeout_secs: f64,
    },

    #[error("No blocking semaphore configured, cannot block for {timeout_secs} sec")]
    NoBlockingNotifierConfigured { timeout_secs: f64 },

    #[error("Connection index {index} outside [0, {total})")]
    InvalidConnectionIndex { index: i64, total: usize },

    #[error("Exclusion strategy {strategy} is not supported in user space")]
    UnsupportedExclusionStrategy { strategy: ExclusionKind },

    #[error("Blocking semaphore woke {attempts} times but there is still no new data")]
    BlockingRetryExhausted { attempts: u32 },

    #[error("Shared memory error: {reason}")]
    MiscError { reason: String },
}

impl ShmError {
    /// Convenience constructor for the catch-all variant.
    pub fn misc(reason: impl Into<String>) -> Self {
        Self::MiscError {
            reason: reason.into(),
        }
    }

    /// Short stable name of the variant, used in logs and CLI output.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::PermissionDenied { .. } => "PermissionDenied",
            Self::ResourceConflict { .. } => "ResourceConflict",
            Self::CreationFailed { .. } => "CreationFailed",
            Self::NoMasterPresent { .. } => "NoMasterPresent",
            Self::TimedOut { .. } => "TimedOut",
            Self::NoBlockingNotifierConfigured { .. } => "NoBlockingNotifierConfigured",
            Self::InvalidConnectionIndex { .. } => "InvalidConnectionIndex",
            Self::UnsupportedExclusionStrategy { .. } => "UnsupportedExclusionStrategy",
            Self::BlockingRetryExhausted { .. } => "BlockingRetryExhausted",
            Self::MiscError { .. } => "MiscError",
        }
    }
}

/// Map the errno of a failed segment create/attach into the taxonomy.
///
/// `ENOENT` only means "no master yet" for attachers; a master seeing it
/// falls through to the catch-all like any other unexpected errno.
pub fn classify_open_error(errno: Errno, role: Role, key: IpcKey) -> ShmError {
    match errno {
        Errno::EACCES => ShmError::PermissionDenied { key },
        Errno::EEXIST => ShmError::ResourceConflict { key },
        Errno::ENOENT if role == Role::Attacher => ShmError::NoMasterPresent { key },
        Errno::ENOMEM | Errno::ENOSPC => ShmError::CreationFailed {
            reason: format!("key {}: {}", key, errno.desc()),
        },
        other => ShmError::MiscError {
            reason: format!("key {}: {}", key, other.desc()),
        },
    }
}

/// Configuration errors. Invalid configuration prevents the buffer from opening.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    NotFound { path: PathBuf },

    #[error("Configuration parse error: {message}")]
    Parse { message: String },

    #[error("Invalid field value: {field} = {value} - {reason}")]
    InvalidFieldValue {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("IO error: {context} - {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// Result type alias using ShmError.
pub type ShmResult<T> = Result<T, ShmError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> IpcKey {
        IpcKey::new(0x1234)
    }

    #[test]
    fn test_master_classification() {
        assert_eq!(
            classify_open_error(Errno::EACCES, Role::Master, key()),
            ShmError::PermissionDenied { key: key() }
        );
        assert_eq!(
            classify_open_error(Errno::EEXIST, Role::Master, key()),
            ShmError::ResourceConflict { key: key() }
        );
        assert!(matches!(
            classify_open_error(Errno::ENOSPC, Role::Master, key()),
            ShmError::CreationFailed { .. }
        ));
        assert!(matches!(
            classify_open_error(Errno::ENOENT, Role::Master, key()),
            ShmError::MiscError { .. }
        ));
    }

    #[test]
    fn test_attacher_classification() {
        assert_eq!(
            classify_open_error(Errno::ENOENT, Role::Attacher, key()),
            ShmError::NoMasterPresent { key: key() }
        );
        assert!(matches!(
            classify_open_error(Errno::ENOMEM, Role::Attacher, key()),
            ShmError::CreationFailed { .. }
        ));
        assert!(matches!(
            classify_open_error(Errno::EINVAL, Role::Attacher, key()),
            ShmError::MiscError { .. }
        ));
    }

    #[test]
    fn test_error_display() {
        let err = ShmError::BlockingRetryExhausted { attempts: 10 };
        assert!(err.to_string().contains("10 times"));
        assert_eq!(err.name(), "BlockingRetryExhausted");

        let err = ShmError::InvalidConnectionIndex { index: 5, total: 2 };
        assert!(err.to_string().contains("[0, 2)"));
    }
}
