// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Newtype wrappers for validated inputs.
//!
//! Following the "Newtype" pattern in Rust to ensure valid state by construction.
//! All types validate their invariants at creation time.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Usable bytes of the on-segment name tag (the 32nd byte is the terminator).
pub const MAX_BUFFER_NAME_LEN: usize = 31;

/// Validated buffer name.
/// Must be non-empty, at most 31 bytes, and free of NUL bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BufferName(String);

impl BufferName {
    /// Create a new BufferName with validation.
    pub fn new(name: impl Into<String>) -> Result<Self, ConfigError> {
        let name = name.into();

        if name.is_empty() {
            return Err(ConfigError::InvalidFieldValue {
                field: "name",
                value: name,
                reason: "Buffer name cannot be empty".to_string(),
            });
        }

        if name.len() > MAX_BUFFER_NAME_LEN {
            return Err(ConfigError::InvalidFieldValue {
                field: "name",
                value: name.clone(),
                reason: format!(
                    "Buffer name too long: {} bytes (max {})",
                    name.len(),
                    MAX_BUFFER_NAME_LEN
                ),
            });
        }

        if name.bytes().any(|b| b == 0) {
            return Err(ConfigError::InvalidFieldValue {
                field: "name",
                value: name.replace('\0', "\\0"),
                reason: "Buffer name cannot contain NUL bytes".to_string(),
            });
        }

        Ok(Self(name))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Raw bytes as written into the name tag.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for BufferName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for BufferName {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<BufferName> for String {
    fn from(name: BufferName) -> Self {
        name.0
    }
}

/// System V IPC key shared by every process using the same resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub struct IpcKey(i32);

impl IpcKey {
    pub const fn new(key: i32) -> Self {
        Self(key)
    }

    /// Get the raw `key_t` value.
    pub const fn value(&self) -> i32 {
        self.0
    }
}

impl fmt::Display for IpcKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(0x{:X})", self.0, self.0)
    }
}

impl From<i32> for IpcKey {
    fn from(value: i32) -> Self {
        Self(value)
    }
}

impl From<IpcKey> for i32 {
    fn from(key: IpcKey) -> Self {
        key.0
    }
}

/// Wait limit expressed in seconds.
///
/// Negative values wait forever, zero polls once, positive values bound the wait.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(from = "f64", into = "f64")]
pub struct Timeout(f64);

impl Timeout {
    pub const FOREVER: Timeout = Timeout(-1.0);

    pub const fn from_secs_f64(secs: f64) -> Self {
        Self(secs)
    }

    pub const fn as_secs_f64(&self) -> f64 {
        self.0
    }

    pub fn is_forever(&self) -> bool {
        self.0 < 0.0 || self.0.is_nan()
    }

    /// `None` means block without a deadline.
    pub fn as_duration(&self) -> Option<Duration> {
        if self.is_forever() {
            None
        } else {
            // Too large to represent is as good as forever.
            Duration::try_from_secs_f64(self.0).ok()
        }
    }
}

impl fmt::Display for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_forever() {
            write!(f, "forever")
        } else {
            write!(f, "{}s", self.0)
        }
    }
}

impl From<f64> for Timeout {
    fn from(value: f64) -> Self {
        Self(value)
    }
}

impl From<Timeout> for f64 {
    fn from(timeout: Timeout) -> Self {
        timeout.0
    }
}
