// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! The shared memory buffer and its building blocks.

mod buffer;
pub mod coordinator;
pub mod exclusion;
pub mod layout;
mod segment;
pub mod state;
pub mod transfer;

pub use buffer::ShmBuffer;
pub use coordinator::{AccessCoordinator, TimeoutDebounce, MAX_BLOCKING_RETRIES};
pub use exclusion::{Exclusion, Intent, LockError};
pub use layout::{Layout, SizeBudgets};
pub use segment::{CloseReport, SegmentResources};
pub use state::AccessState;
pub use transfer::{
    Access, AccessKind, AccessStatus, DataTransfer, FramedTransfer, FRAME_HEADER_SIZE,
};
