// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Data transfer step run while the exclusion is held.
//!
//! The coordinator hands the user data region to a `DataTransfer`, which moves
//! the caller's bytes in or out and reports whether a read saw new data.
//! `FramedTransfer` is the default: one message slot guarded by a CRC32.

use crate::error::ShmError;
use crate::shm::exclusion::Intent;

/// One logical access request together with the caller's buffer.
pub enum Access<'a> {
    Read(&'a mut Vec<u8>),
    Peek(&'a mut Vec<u8>),
    Write(&'a [u8]),
    WriteIfRead(&'a [u8]),
    CheckIfRead,
}

/// Direction of an access, without the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Peek,
    Write,
    WriteIfRead,
    CheckIfRead,
}

impl AccessKind {
    /// Reads, peeks and checks only need shared access to the region.
    pub const fn intent(&self) -> Intent {
        match self {
            Self::Read | Self::Peek | Self::CheckIfRead => Intent::ReadOnly,
            Self::Write | Self::WriteIfRead => Intent::ReadWrite,
        }
    }
}

impl Access<'_> {
    pub fn kind(&self) -> AccessKind {
        match self {
            Self::Read(_) => AccessKind::Read,
            Self::Peek(_) => AccessKind::Peek,
            Self::Write(_) => AccessKind::Write,
            Self::WriteIfRead(_) => AccessKind::WriteIfRead,
            Self::CheckIfRead => AccessKind::CheckIfRead,
        }
    }
}

/// Successful outcome of an access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessStatus {
    /// The caller received data it had not seen before.
    ReadNew,
    /// Nothing newer than the last read is in the buffer.
    ReadOld,
    WriteOk,
    /// `WriteIfRead` found an unread message and left it in place.
    WriteBlocked,
    /// Answer of `CheckIfRead`.
    WasRead(bool),
}

/// Moves bytes between the caller and the user data region.
pub trait DataTransfer {
    /// Largest payload that fits a region of `region_len` bytes.
    fn capacity(&self, region_len: usize) -> usize;

    fn transfer(
        &mut self,
        region: &mut [u8],
        access: &mut Access<'_>,
    ) -> Result<AccessStatus, ShmError>;
}

/// Size of the frame header at the start of the data region.
pub const FRAME_HEADER_SIZE: usize = 24;

const WRITE_ID: std::ops::Range<usize> = 0..8;
const WAS_READ: std::ops::Range<usize> = 8..12;
const LENGTH: std::ops::Range<usize> = 12..16;
const CHECKSUM: std::ops::Range<usize> = 16..20;

#[derive(Debug, Clone, Copy, Default)]
struct FrameHeader {
    /// Incremented by every write; 0 means nothing was ever written.
    write_id: u64,
    was_read: bool,
    length: u32,
    checksum: u32,
}

impl FrameHeader {
    fn decode(region: &[u8]) -> Self {
        let u32_at = |range: std::ops::Range<usize>| {
            u32::from_le_bytes(region[range].try_into().unwrap_or([0; 4]))
        };
        Self {
            write_id: u64::from_le_bytes(region[WRITE_ID].try_into().unwrap_or([0; 8])),
            was_read: u32_at(WAS_READ) != 0,
            length: u32_at(LENGTH),
            checksum: u32_at(CHECKSUM),
        }
    }

    fn encode(&self, region: &mut [u8]) {
        region[WRITE_ID].copy_from_slice(&self.write_id.to_le_bytes());
        region[WAS_READ].copy_from_slice(&u32::from(self.was_read).to_le_bytes());
        region[LENGTH].copy_from_slice(&self.length.to_le_bytes());
        region[CHECKSUM].copy_from_slice(&self.checksum.to_le_bytes());
    }

    fn is_empty(&self) -> bool {
        self.write_id == 0
    }
}

/// Single-slot message framing: the newest write replaces the previous one.
///
/// Each handle remembers the id of the last message it read, which is how a
/// read tells new data from old.
#[derive(Debug, Default)]
pub struct FramedTransfer {
    last_seen: u64,
}

impl FramedTransfer {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(
        &mut self,
        region: &mut [u8],
        out: &mut Vec<u8>,
        mark_read: bool,
    ) -> Result<AccessStatus, ShmError> {
        let mut header = FrameHeader::decode(region);
        if header.is_empty() || header.write_id == self.last_seen {
            return Ok(AccessStatus::ReadOld);
        }

        let length = header.length as usize;
        if length > self.capacity(region.len()) {
            return Err(ShmError::misc(format!(
                "corrupt frame: length {} exceeds capacity {}",
                length,
                self.capacity(region.len())
            )));
        }

        let payload = &region[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + length];
        let actual = crc32fast::hash(payload);
        if actual != header.checksum {
            return Err(ShmError::misc(format!(
                "payload checksum mismatch: expected {:#010x}, got {:#010x}",
                header.checksum, actual
            )));
        }

        out.clear();
        out.extend_from_slice(payload);
        self.last_seen = header.write_id;

        if mark_read && !header.was_read {
            header.was_read = true;
            header.encode(region);
        }
        Ok(AccessStatus::ReadNew)
    }

    fn write(&mut self, region: &mut [u8], message: &[u8]) -> Result<AccessStatus, ShmError> {
        let capacity = self.capacity(region.len());
        if message.len() > capacity {
            return Err(ShmError::misc(format!(
                "message of {} bytes exceeds capacity {}",
                message.len(),
                capacity
            )));
        }

        let previous = FrameHeader::decode(region);
        let write_id = match previous.write_id.wrapping_add(1) {
            0 => 1,
            id => id,
        };

        region[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + message.len()].copy_from_slice(message);
        FrameHeader {
            write_id,
            was_read: false,
            length: message.len() as u32,
            checksum: crc32fast::hash(message),
        }
        .encode(region);

        Ok(AccessStatus::WriteOk)
    }
}

impl DataTransfer for FramedTransfer {
    fn capacity(&self, region_len: usize) -> usize {
        region_len
            .saturating_sub(FRAME_HEADER_SIZE)
            .min(u32::MAX as usize)
    }

    fn transfer(
        &mut self,
        region: &mut [u8],
        access: &mut Access<'_>,
    ) -> Result<AccessStatus, ShmError> {
        if region.len() < FRAME_HEADER_SIZE {
            return Err(ShmError::misc(format!(
                "data region of {} bytes cannot hold a frame header",
                region.len()
            )));
        }

        match access {
            Access::Read(out) => self.read(region, out, true),
            Access::Peek(out) => self.read(region, out, false),
            Access::Write(message) => self.write(region, message),
            Access::WriteIfRead(message) => {
                let header = FrameHeader::decode(region);
                if !header.is_empty() && !header.was_read {
                    return Ok(AccessStatus::WriteBlocked);
                }
                self.write(region, message)
            }
            Access::CheckIfRead => Ok(AccessStatus::WasRead(FrameHeader::decode(region).was_read)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region() -> Vec<u8> {
        vec![0u8; 128]
    }

    #[test]
    fn test_read_before_write_is_old() {
        let mut region = region();
        let mut reader = FramedTransfer::new();
        let mut out = vec![9];
        let status = reader
            .transfer(&mut region, &mut Access::Read(&mut out))
            .unwrap();
        assert_eq!(status, AccessStatus::ReadOld);
        assert_eq!(out, vec![9]);
    }

    #[test]
    fn test_second_read_is_old() {
        let mut region = region();
        let mut writer = FramedTransfer::new();
        let mut reader = FramedTransfer::new();
        writer
            .transfer(&mut region, &mut Access::Write(b"pose"))
            .unwrap();

        let mut out = Vec::new();
        assert_eq!(
            reader.transfer(&mut region, &mut Access::Read(&mut out)).unwrap(),
            AccessStatus::ReadNew
        );
        assert_eq!(out, b"pose");
        assert_eq!(
            reader.transfer(&mut region, &mut Access::Read(&mut out)).unwrap(),
            AccessStatus::ReadOld
        );
    }

    #[test]
    fn test_peek_does_not_mark_read() {
        let mut region = region();
        let mut handle = FramedTransfer::new();
        handle.transfer(&mut region, &mut Access::Write(b"x")).unwrap();

        let mut out = Vec::new();
        handle.transfer(&mut region, &mut Access::Peek(&mut out)).unwrap();
        assert_eq!(
            handle.transfer(&mut region, &mut Access::CheckIfRead).unwrap(),
            AccessStatus::WasRead(false)
        );
    }

    #[test]
    fn test_write_if_read_blocks_unread_message() {
        let mut region = region();
        let mut writer = FramedTransfer::new();
        let mut reader = FramedTransfer::new();

        // Empty buffer accepts the first conditional write.
        assert_eq!(
            writer.transfer(&mut region, &mut Access::WriteIfRead(b"one")).unwrap(),
            AccessStatus::WriteOk
        );
        assert_eq!(
            writer.transfer(&mut region, &mut Access::WriteIfRead(b"two")).unwrap(),
            AccessStatus::WriteBlocked
        );

        let mut out = Vec::new();
        reader.transfer(&mut region, &mut Access::Read(&mut out)).unwrap();
        assert_eq!(out, b"one");
        assert_eq!(
            reader.transfer(&mut region, &mut Access::CheckIfRead).unwrap(),
            AccessStatus::WasRead(true)
        );
        assert_eq!(
            writer.transfer(&mut region, &mut Access::WriteIfRead(b"two")).unwrap(),
            AccessStatus::WriteOk
        );
    }

    #[test]
    fn test_oversized_write_rejected() {
        let mut region = region();
        let mut writer = FramedTransfer::new();
        let message = vec![1u8; 128 - FRAME_HEADER_SIZE + 1];
        assert!(matches!(
            writer.transfer(&mut region, &mut Access::Write(&message)),
            Err(ShmError::MiscError { .. })
        ));
    }

    #[test]
    fn test_corrupted_payload_detected() {
        let mut region = region();
        let mut writer = FramedTransfer::new();
        writer
            .transfer(&mut region, &mut Access::Write(b"intact"))
            .unwrap();
        region[FRAME_HEADER_SIZE] ^= 0xFF;

        let mut out = Vec::new();
        let err = FramedTransfer::new()
            .transfer(&mut region, &mut Access::Read(&mut out))
            .unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"));
    }

    #[test]
    fn test_region_smaller_than_header() {
        let mut region = vec![0u8; FRAME_HEADER_SIZE - 1];
        assert!(FramedTransfer::new()
            .transfer(&mut region, &mut Access::CheckIfRead)
            .is_err());
    }
}
