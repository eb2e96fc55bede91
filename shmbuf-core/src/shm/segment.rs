// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! OS resources behind one open buffer: the mapped segment, the exclusion
//! strategy and the optional blocking notifier.

use std::time::Duration;

use crate::config::{BufferConfig, ExclusionKind, Role};
use crate::error::{classify_open_error, ShmError};
use crate::ipc::{IpcBackend, Semaphore, SharedSegment};
use crate::shm::exclusion::{ConnectionTable, Exclusion, Intent, LockError, MaoLock};
use crate::shm::layout::{reconcile_name_tag, Layout, NameTagCheck, NAME_TAG_SIZE};
use crate::types::IpcKey;

/// What `close` found and did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseReport {
    /// Attach count sampled just before detaching.
    pub attach_count: Option<usize>,
    /// Whether the shared resources were destroyed.
    pub destroyed: bool,
}

/// Everything acquired by a successful open.
pub struct SegmentResources {
    segment: Box<dyn SharedSegment>,
    layout: Layout,
    exclusion: Exclusion,
    notifier: Option<Box<dyn Semaphore>>,
}

impl SegmentResources {
    /// Create or attach the segment and its semaphores.
    ///
    /// On failure every primitive this call created is marked for destruction
    /// before being dropped, so nothing of a failed master is left behind.
    pub fn open(config: &BufferConfig, backend: &dyn IpcBackend) -> Result<Self, ShmError> {
        config
            .validate()
            .map_err(|err| ShmError::misc(err.to_string()))?;

        let connection_index = check_connection_index(config)?;
        let master = config.role == Role::Master;

        let mut segment = match config.role {
            Role::Master => backend.create_segment(config.key, config.size, config.mode),
            Role::Attacher => backend.attach_segment(config.key, config.size),
        }
        .map_err(|errno| {
            tracing::error!(
                buffer = %config.name,
                key = %config.key,
                role = %config.role,
                errno = %errno,
                "Cannot open shared memory segment"
            );
            classify_open_error(errno, config.role, config.key)
        })?;
        let fresh = segment.created();

        let mut exclusion = match open_exclusion(config, backend, connection_index) {
            Ok(exclusion) => exclusion,
            Err(err) => {
                if fresh {
                    segment.set_destroy_on_detach(true);
                }
                return Err(err);
            }
        };

        let notifier = match config.notifier_key {
            Some(key) => match open_semaphore(config, backend, key, 0) {
                Ok(sem) => Some(sem),
                Err(err) => {
                    if fresh {
                        segment.set_destroy_on_detach(true);
                        if let Some(sem) = exclusion.semaphore_mut() {
                            sem.set_destroy_on_release(true);
                        }
                    }
                    return Err(err);
                }
            },
            None => None,
        };

        let resources = match prepare_header(&mut *segment, config, master) {
            Ok(layout) => Self {
                segment,
                layout,
                exclusion,
                notifier,
            },
            Err(err) => {
                if fresh {
                    segment.set_destroy_on_detach(true);
                    if let Some(sem) = exclusion.semaphore_mut() {
                        sem.set_destroy_on_release(true);
                    }
                    if let Some(mut sem) = notifier {
                        sem.set_destroy_on_release(true);
                    }
                }
                return Err(err);
            }
        };

        tracing::debug!(
            buffer = %config.name,
            key = %config.key,
            role = %config.role,
            created = fresh,
            exclusion = %resources.exclusion.kind(),
            user_data_offset = resources.layout.user_data_offset,
            "Shared memory buffer opened"
        );

        Ok(resources)
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn created(&self) -> bool {
        self.segment.created()
    }

    pub fn exclusion_kind(&self) -> ExclusionKind {
        self.exclusion.kind()
    }

    pub fn has_notifier(&self) -> bool {
        self.notifier.is_some()
    }

    pub fn notifier_mut(&mut self) -> Option<&mut dyn Semaphore> {
        match self.notifier.as_mut() {
            Some(sem) => Some(sem.as_mut()),
            None => None,
        }
    }

    fn connection_table<'a>(&self) -> ConnectionTable<'a> {
        // SAFETY: the table lies inside the mapping, which outlives every access,
        // and is only touched through atomics.
        unsafe {
            ConnectionTable::from_raw(
                self.segment.as_ptr().add(self.layout.connection_table_offset),
                self.layout.total_connections,
            )
        }
    }

    pub fn acquire(&mut self, intent: Intent, timeout: Option<Duration>) -> Result<(), LockError> {
        let table = self.connection_table();
        self.exclusion.acquire(table, intent, timeout)
    }

    pub fn release(&mut self) -> Result<(), LockError> {
        let table = self.connection_table();
        self.exclusion.release(table)
    }

    /// The user data region. Only touch it while the exclusion is held.
    pub fn data_region(&mut self) -> &mut [u8] {
        // SAFETY: offset and length come from the layout of this mapping.
        unsafe {
            std::slice::from_raw_parts_mut(
                self.segment.as_ptr().add(self.layout.user_data_offset),
                self.layout.user_data_size(),
            )
        }
    }

    /// Detach and release everything.
    ///
    /// Shared objects are destroyed when this is the last (or only) attached
    /// process, or unconditionally with `delete_totally`.
    pub fn close(self, delete_totally: bool) -> CloseReport {
        let Self {
            mut segment,
            mut exclusion,
            mut notifier,
            ..
        } = self;

        let attach_count = segment.attach_count();
        let destroyed = delete_totally || matches!(attach_count, Some(0..=1));

        tracing::debug!(
            attach_count = ?attach_count,
            delete_totally = delete_totally,
            destroyed = destroyed,
            "Closing shared memory buffer"
        );

        segment.set_destroy_on_detach(destroyed);
        drop(segment);

        if let Some(sem) = exclusion.semaphore_mut() {
            sem.set_destroy_on_release(destroyed);
        }
        drop(exclusion);

        if let Some(sem) = notifier.as_mut() {
            sem.set_destroy_on_release(destroyed);
        }
        drop(notifier);

        CloseReport {
            attach_count,
            destroyed,
        }
    }
}

/// Compute the layout and reconcile or clear the header region.
fn prepare_header(
    segment: &mut dyn SharedSegment,
    config: &BufferConfig,
    master: bool,
) -> Result<Layout, ShmError> {
    if segment.len() < config.size {
        return Err(ShmError::CreationFailed {
            reason: format!(
                "segment is {} bytes, {} requested",
                segment.len(),
                config.size
            ),
        });
    }

    let with_tag = config.header_validation_enabled();
    let layout = Layout::compute(
        segment.len(),
        config.total_connections,
        config.autokey_table_size,
        with_tag,
    )?;

    if with_tag {
        // SAFETY: the layout check guarantees the mapping is longer than the tag.
        let tag = unsafe { &mut *(segment.as_ptr() as *mut [u8; NAME_TAG_SIZE]) };
        if let NameTagCheck::Conflict { stored } =
            reconcile_name_tag(tag, &config.name, segment.created(), master)
        {
            tracing::warn!(
                buffer = %config.name,
                stored = %stored,
                key = %config.key,
                "Shared memory buffers may conflict; name tag overwritten"
            );
        }
    } else if master {
        // SAFETY: the mapping is valid for its full length.
        unsafe { std::ptr::write_bytes(segment.as_ptr(), 0, segment.len()) };
    }

    Ok(layout)
}

/// Validate the connection index for strategies that use the connection table.
fn check_connection_index(config: &BufferConfig) -> Result<usize, ShmError> {
    if !config.exclusion.uses_connection_slots() {
        return Ok(0);
    }
    usize::try_from(config.connection_index)
        .ok()
        .filter(|&index| index < config.total_connections)
        .ok_or(ShmError::InvalidConnectionIndex {
            index: config.connection_index,
            total: config.total_connections,
        })
}

fn open_exclusion(
    config: &BufferConfig,
    backend: &dyn IpcBackend,
    connection_index: usize,
) -> Result<Exclusion, ShmError> {
    let exclusion = match config.exclusion {
        ExclusionKind::None => Exclusion::None,
        ExclusionKind::OsSemaphore => {
            Exclusion::OsSemaphore(open_semaphore(config, backend, config.key, 1)?)
        }
        ExclusionKind::Mao => Exclusion::Mao(MaoLock::new(connection_index, config.sem_delay, None)),
        ExclusionKind::MaoWithOsSemaphore => {
            let fallback = open_semaphore(config, backend, config.key, 0)?;
            Exclusion::Mao(MaoLock::new(
                connection_index,
                config.sem_delay,
                Some(fallback),
            ))
        }
        ExclusionKind::NoInterrupts => Exclusion::NoInterrupts,
        ExclusionKind::NoSwitching => Exclusion::NoSwitching,
    };
    Ok(exclusion)
}

fn open_semaphore(
    config: &BufferConfig,
    backend: &dyn IpcBackend,
    key: IpcKey,
    initial: u32,
) -> Result<Box<dyn Semaphore>, ShmError> {
    let sem = match config.role {
        Role::Master => backend.create_semaphore(key, config.mode, initial),
        Role::Attacher => backend.attach_semaphore(key),
    }
    .map_err(|errno| {
        tracing::error!(
            buffer = %config.name,
            key = %key,
            errno = %errno,
            "Cannot open semaphore"
        );
        classify_open_error(errno, config.role, key)
    })?;

    if !sem.valid() {
        tracing::error!(buffer = %config.name, key = %key, "Semaphore is not valid");
        return Err(ShmError::misc(format!("semaphore {} is not valid", key)));
    }
    Ok(sem)
}
