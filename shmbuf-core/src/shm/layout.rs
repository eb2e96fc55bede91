// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Segment layout and name tag handling.
//!
//! ```text
//! [0..32)                  name tag, NUL terminated (only with header validation)
//! [tag..tag+N)             per-connection table, one byte per connection
//! [..+autokey)             auto-key table
//! [user_data_offset..)     user data region
//! ```

use crate::error::ShmError;
use crate::types::{BufferName, MAX_BUFFER_NAME_LEN};

/// Bytes reserved for the name tag, terminator included.
pub const NAME_TAG_SIZE: usize = 32;

/// Bytes per entry of the per-connection table.
pub const CONNECTION_ENTRY_SIZE: usize = 1;

/// Message size limits derived from the user data region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeBudgets {
    pub max_message_size: usize,
    pub max_encoded_message_size: usize,
    pub guaranteed_message_space: usize,
    /// Usable size when the data region is split, rounded down to 4 bytes.
    pub subdivision_size: usize,
}

/// Offsets of every region inside one segment. Computed once at open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub raw_size: usize,
    /// 32 with header validation, 0 without.
    pub name_tag_size: usize,
    pub connection_table_offset: usize,
    pub total_connections: usize,
    pub autokey_table_offset: usize,
    pub autokey_table_size: usize,
    pub user_data_offset: usize,
    pub budgets: SizeBudgets,
}

impl Layout {
    /// Compute the layout of a `raw_size` byte segment.
    ///
    /// Fails when the header would not leave any room for user data.
    pub fn compute(
        raw_size: usize,
        total_connections: usize,
        autokey_table_size: usize,
        with_name_tag: bool,
    ) -> Result<Self, ShmError> {
        let name_tag_size = if with_name_tag { NAME_TAG_SIZE } else { 0 };
        let connection_table_offset = name_tag_size;
        let (autokey_table_offset, user_data_offset) = total_connections
            .checked_mul(CONNECTION_ENTRY_SIZE)
            .and_then(|table| connection_table_offset.checked_add(table))
            .and_then(|autokey| Some((autokey, autokey.checked_add(autokey_table_size)?)))
            .ok_or_else(|| ShmError::CreationFailed {
                reason: format!(
                    "header for {} connections and a {} byte auto-key table overflows",
                    total_connections, autokey_table_size
                ),
            })?;

        if user_data_offset >= raw_size {
            return Err(ShmError::CreationFailed {
                reason: format!(
                    "segment of {} bytes cannot hold a {} byte header",
                    raw_size, user_data_offset
                ),
            });
        }

        let user_data_size = raw_size - user_data_offset;
        let budgets = SizeBudgets {
            max_message_size: user_data_size,
            max_encoded_message_size: user_data_size,
            guaranteed_message_space: user_data_size,
            subdivision_size: user_data_size - user_data_size % 4,
        };

        Ok(Self {
            raw_size,
            name_tag_size,
            connection_table_offset,
            total_connections,
            autokey_table_offset,
            autokey_table_size,
            user_data_offset,
            budgets,
        })
    }

    /// Total bytes in front of the user data region.
    pub fn header_size(&self) -> usize {
        self.user_data_offset
    }

    pub fn user_data_size(&self) -> usize {
        self.raw_size - self.user_data_offset
    }
}

/// Outcome of reconciling the stored name tag with the configured name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameTagCheck {
    /// Tag left as is.
    Unchanged,
    /// Tag (re)written by the master.
    Written,
    /// Another name was stored; it has been replaced.
    Conflict { stored: String },
}

/// The stored name: bytes up to the first NUL, at most 31 of them.
pub fn stored_name(tag: &[u8; NAME_TAG_SIZE]) -> &[u8] {
    let limit = &tag[..MAX_BUFFER_NAME_LEN];
    let end = limit.iter().position(|&b| b == 0).unwrap_or(limit.len());
    &limit[..end]
}

/// Write `name` NUL padded over the whole tag.
pub fn write_name_tag(tag: &mut [u8; NAME_TAG_SIZE], name: &BufferName) {
    let bytes = name.as_bytes();
    tag.fill(0);
    tag[..bytes.len()].copy_from_slice(bytes);
}

/// Check the tag of a freshly mapped segment.
///
/// A handle that did not create the segment terminates the tag and compares it
/// with `name`, replacing it on mismatch. The master always writes its name.
pub fn reconcile_name_tag(
    tag: &mut [u8; NAME_TAG_SIZE],
    name: &BufferName,
    created: bool,
    master: bool,
) -> NameTagCheck {
    let mut check = NameTagCheck::Unchanged;

    if !created {
        tag[MAX_BUFFER_NAME_LEN] = 0;
        let stored = stored_name(tag);
        if stored != name.as_bytes() {
            check = NameTagCheck::Conflict {
                stored: String::from_utf8_lossy(stored).into_owned(),
            };
            write_name_tag(tag, name);
        }
    }

    if master {
        write_name_tag(tag, name);
        if check == NameTagCheck::Unchanged {
            check = NameTagCheck::Written;
        }
    }

    check
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> BufferName {
        BufferName::new(s).unwrap()
    }

    #[test]
    fn test_layout_with_header() {
        let layout = Layout::compute(4096, 4, 16, true).unwrap();
        assert_eq!(layout.connection_table_offset, 32);
        assert_eq!(layout.autokey_table_offset, 36);
        assert_eq!(layout.user_data_offset, 32 + 4 + 16);
        assert_eq!(layout.user_data_size(), 4096 - 52);
        assert_eq!(layout.budgets.max_message_size, 4044);
        assert_eq!(layout.budgets.subdivision_size, 4044);
    }

    #[test]
    fn test_layout_without_header() {
        let layout = Layout::compute(1003, 2, 0, false).unwrap();
        assert_eq!(layout.name_tag_size, 0);
        assert_eq!(layout.connection_table_offset, 0);
        assert_eq!(layout.user_data_offset, 2);
        assert_eq!(layout.user_data_size(), 1001);
        assert_eq!(layout.budgets.subdivision_size, 1000);
    }

    #[test]
    fn test_layout_too_small() {
        assert!(matches!(
            Layout::compute(40, 8, 0, true),
            Err(ShmError::CreationFailed { .. })
        ));
    }

    #[test]
    fn test_layout_overflow_rejected() {
        for (connections, autokey) in [(1, usize::MAX), (usize::MAX, 0), (usize::MAX - 31, 1)] {
            assert!(matches!(
                Layout::compute(4096, connections, autokey, true),
                Err(ShmError::CreationFailed { .. })
            ));
        }
    }

    #[test]
    fn test_master_writes_tag() {
        let mut tag = [0u8; NAME_TAG_SIZE];
        let check = reconcile_name_tag(&mut tag, &name("motion"), true, true);
        assert_eq!(check, NameTagCheck::Written);
        assert_eq!(stored_name(&tag), b"motion");
        assert!(tag[6..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_attacher_matching_tag_untouched() {
        let mut tag = [0u8; NAME_TAG_SIZE];
        write_name_tag(&mut tag, &name("motion"));
        let before = tag;
        let check = reconcile_name_tag(&mut tag, &name("motion"), false, false);
        assert_eq!(check, NameTagCheck::Unchanged);
        assert_eq!(tag, before);
    }

    #[test]
    fn test_attacher_conflict_overwrites() {
        let mut tag = [b'x'; NAME_TAG_SIZE];
        write_name_tag(&mut tag, &name("a-much-longer-previous-name"));
        let check = reconcile_name_tag(&mut tag, &name("io"), false, false);
        assert_eq!(
            check,
            NameTagCheck::Conflict {
                stored: "a-much-longer-previous-name".to_string()
            }
        );
        let mut expected = [0u8; NAME_TAG_SIZE];
        expected[..2].copy_from_slice(b"io");
        assert_eq!(tag, expected);
    }

    #[test]
    fn test_unterminated_tag_is_truncated() {
        let mut tag = [b'z'; NAME_TAG_SIZE];
        let check = reconcile_name_tag(&mut tag, &name(&"z".repeat(31)), false, false);
        assert_eq!(check, NameTagCheck::Unchanged);
        assert_eq!(tag[31], 0);
    }
}
