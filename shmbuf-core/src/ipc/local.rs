// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! In-process IPC namespace.
//!
//! Behaves like the System V backend (keyed segments with attach counts,
//! counting semaphores, destroy-on-release) but lives in the heap of a single
//! process. Every create/attach/detach/destroy is recorded as an `IpcEvent` so
//! that tests can assert on the calls a buffer issued.

use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use nix::errno::Errno;

use super::{IpcBackend, Semaphore, SharedSegment, WaitError};
use crate::types::IpcKey;

/// Call recorded by `LocalIpc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcEvent {
    SegmentCreated(IpcKey),
    SegmentAttached(IpcKey),
    SegmentDetached(IpcKey),
    SegmentDestroyed(IpcKey),
    SemaphoreCreated(IpcKey),
    SemaphoreAttached(IpcKey),
    SemaphoreReleased(IpcKey),
    SemaphoreDestroyed(IpcKey),
}

/// Shared byte storage handed out to every mapping of one segment.
struct LocalMemory {
    bytes: Box<[UnsafeCell<u8>]>,
}

// SAFETY: access to the bytes is coordinated by the buffer's exclusion strategy,
// exactly like a real shared mapping.
unsafe impl Send for LocalMemory {}
unsafe impl Sync for LocalMemory {}

impl LocalMemory {
    fn zeroed(size: usize) -> Self {
        Self {
            bytes: (0..size).map(|_| UnsafeCell::new(0u8)).collect(),
        }
    }

    fn as_ptr(&self) -> *mut u8 {
        // UnsafeCell<u8> has the same layout as u8.
        self.bytes.as_ptr() as *mut u8
    }

    fn len(&self) -> usize {
        self.bytes.len()
    }
}

struct SegmentEntry {
    memory: Arc<LocalMemory>,
    attached: usize,
}

#[derive(Default)]
struct SemaphoreState {
    value: u32,
    waiters: u32,
    removed: bool,
}

#[derive(Default)]
struct SemaphoreCell {
    state: Mutex<SemaphoreState>,
    cond: Condvar,
    waits: AtomicUsize,
}

impl SemaphoreCell {
    fn lock(&self) -> MutexGuard<'_, SemaphoreState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Default)]
struct Registry {
    segments: HashMap<IpcKey, SegmentEntry>,
    semaphores: HashMap<IpcKey, Arc<SemaphoreCell>>,
    events: Vec<IpcEvent>,
    injected: HashMap<IpcKey, Errno>,
}

type SharedRegistry = Arc<Mutex<Registry>>;

fn lock(registry: &SharedRegistry) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// In-process IPC namespace. Clones share the same namespace.
#[derive(Clone, Default)]
pub struct LocalIpc {
    registry: SharedRegistry,
}

impl LocalIpc {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next segment or semaphore call on `key` fail with `errno`.
    pub fn inject_error(&self, key: IpcKey, errno: Errno) {
        lock(&self.registry).injected.insert(key, errno);
    }

    /// Every call recorded so far, oldest first.
    pub fn events(&self) -> Vec<IpcEvent> {
        lock(&self.registry).events.clone()
    }

    pub fn clear_events(&self) {
        lock(&self.registry).events.clear();
    }

    pub fn segment_exists(&self, key: IpcKey) -> bool {
        lock(&self.registry).segments.contains_key(&key)
    }

    /// Current attach count of a segment, `None` if it does not exist.
    pub fn attach_count(&self, key: IpcKey) -> Option<usize> {
        lock(&self.registry).segments.get(&key).map(|s| s.attached)
    }

    pub fn semaphore_exists(&self, key: IpcKey) -> bool {
        lock(&self.registry).semaphores.contains_key(&key)
    }

    /// Current count of a semaphore, `None` if it does not exist.
    pub fn semaphore_value(&self, key: IpcKey) -> Option<u32> {
        let cell = lock(&self.registry).semaphores.get(&key).cloned()?;
        let value = cell.lock().value;
        Some(value)
    }

    /// Number of `wait` calls issued on a semaphore across all handles.
    pub fn semaphore_waits(&self, key: IpcKey) -> usize {
        lock(&self.registry)
            .semaphores
            .get(&key)
            .map_or(0, |cell| cell.waits.load(Ordering::SeqCst))
    }

    /// Post a semaphore from outside any buffer, e.g. to fake a peer's signal.
    pub fn post_semaphore(&self, key: IpcKey, count: u32) -> Result<(), Errno> {
        let cell = lock(&self.registry)
            .semaphores
            .get(&key)
            .cloned()
            .ok_or(Errno::ENOENT)?;
        let mut state = cell.lock();
        state.value += count;
        cell.cond.notify_all();
        Ok(())
    }

    /// Mark a semaphore removed while its key stays registered, like a stale
    /// id whose object was deleted underneath an attacher.
    pub fn invalidate_semaphore(&self, key: IpcKey) -> Result<(), Errno> {
        let cell = lock(&self.registry)
            .semaphores
            .get(&key)
            .cloned()
            .ok_or(Errno::ENOENT)?;
        cell.lock().removed = true;
        cell.cond.notify_all();
        Ok(())
    }

    fn take_injected(registry: &mut Registry, key: IpcKey) -> Result<(), Errno> {
        match registry.injected.remove(&key) {
            Some(errno) => Err(errno),
            None => Ok(()),
        }
    }

    fn map(&self, key: IpcKey, memory: Arc<LocalMemory>, created: bool) -> Box<dyn SharedSegment> {
        Box::new(LocalSegment {
            key,
            memory,
            created,
            destroy: false,
            registry: Arc::clone(&self.registry),
        })
    }

    fn open_semaphore(&self, key: IpcKey, cell: Arc<SemaphoreCell>) -> Box<dyn Semaphore> {
        Box::new(LocalSemaphore {
            key,
            cell,
            destroy: false,
            registry: Arc::clone(&self.registry),
        })
    }
}

impl IpcBackend for LocalIpc {
    fn create_segment(
        &self,
        key: IpcKey,
        size: usize,
        _mode: u32,
    ) -> Result<Box<dyn SharedSegment>, Errno> {
        let mut registry = lock(&self.registry);
        Self::take_injected(&mut registry, key)?;

        let (memory, created) = match registry.segments.get_mut(&key) {
            Some(entry) if entry.memory.len() < size => return Err(Errno::EINVAL),
            Some(entry) => {
                entry.attached += 1;
                (Arc::clone(&entry.memory), false)
            }
            None => {
                let memory = Arc::new(LocalMemory::zeroed(size));
                registry.segments.insert(
                    key,
                    SegmentEntry {
                        memory: Arc::clone(&memory),
                        attached: 1,
                    },
                );
                (memory, true)
            }
        };
        registry.events.push(if created {
            IpcEvent::SegmentCreated(key)
        } else {
            IpcEvent::SegmentAttached(key)
        });
        drop(registry);

        Ok(self.map(key, memory, created))
    }

    fn attach_segment(&self, key: IpcKey, size: usize) -> Result<Box<dyn SharedSegment>, Errno> {
        let mut registry = lock(&self.registry);
        Self::take_injected(&mut registry, key)?;

        let entry = registry.segments.get_mut(&key).ok_or(Errno::ENOENT)?;
        if entry.memory.len() < size {
            return Err(Errno::EINVAL);
        }
        entry.attached += 1;
        let memory = Arc::clone(&entry.memory);
        registry.events.push(IpcEvent::SegmentAttached(key));
        drop(registry);

        Ok(self.map(key, memory, false))
    }

    fn create_semaphore(
        &self,
        key: IpcKey,
        _mode: u32,
        initial: u32,
    ) -> Result<Box<dyn Semaphore>, Errno> {
        let mut registry = lock(&self.registry);
        Self::take_injected(&mut registry, key)?;

        let cell = match registry.semaphores.get(&key) {
            Some(cell) => Arc::clone(cell),
            None => {
                let cell = Arc::new(SemaphoreCell::default());
                cell.lock().value = initial;
                registry.semaphores.insert(key, Arc::clone(&cell));
                cell
            }
        };
        registry.events.push(IpcEvent::SemaphoreCreated(key));
        drop(registry);

        Ok(self.open_semaphore(key, cell))
    }

    fn attach_semaphore(&self, key: IpcKey) -> Result<Box<dyn Semaphore>, Errno> {
        let mut registry = lock(&self.registry);
        Self::take_injected(&mut registry, key)?;

        let cell = registry
            .semaphores
            .get(&key)
            .cloned()
            .ok_or(Errno::ENOENT)?;
        registry.events.push(IpcEvent::SemaphoreAttached(key));
        drop(registry);

        Ok(self.open_semaphore(key, cell))
    }
}

struct LocalSegment {
    key: IpcKey,
    memory: Arc<LocalMemory>,
    created: bool,
    destroy: bool,
    registry: SharedRegistry,
}

impl SharedSegment for LocalSegment {
    fn as_ptr(&self) -> *mut u8 {
        self.memory.as_ptr()
    }

    fn len(&self) -> usize {
        self.memory.len()
    }

    fn created(&self) -> bool {
        self.created
    }

    fn attach_count(&self) -> Option<usize> {
        lock(&self.registry).segments.get(&self.key).map(|s| s.attached)
    }

    fn set_destroy_on_detach(&mut self, destroy: bool) {
        self.destroy = destroy;
    }
}

impl Drop for LocalSegment {
    fn drop(&mut self) {
        let mut registry = lock(&self.registry);
        // The entry may already be gone if another handle destroyed it.
        let still_ours = registry
            .segments
            .get(&self.key)
            .is_some_and(|entry| Arc::ptr_eq(&entry.memory, &self.memory));
        if still_ours {
            if let Some(entry) = registry.segments.get_mut(&self.key) {
                entry.attached = entry.attached.saturating_sub(1);
            }
        }
        registry.events.push(IpcEvent::SegmentDetached(self.key));

        if self.destroy && still_ours {
            registry.segments.remove(&self.key);
            registry.events.push(IpcEvent::SegmentDestroyed(self.key));
        }
    }
}

struct LocalSemaphore {
    key: IpcKey,
    cell: Arc<SemaphoreCell>,
    destroy: bool,
    registry: SharedRegistry,
}

impl Semaphore for LocalSemaphore {
    fn wait(&mut self, timeout: Option<Duration>) -> Result<(), WaitError> {
        self.cell.waits.fetch_add(1, Ordering::SeqCst);
        let deadline = timeout.map(|t| Instant::now() + t);

        let mut state = self.cell.lock();
        state.waiters += 1;
        let result = loop {
            if state.removed {
                break Err(WaitError::Primitive(Errno::EIDRM));
            }
            if state.value > 0 {
                state.value -= 1;
                break Ok(());
            }
            match deadline {
                None => {
                    state = self
                        .cell
                        .cond
                        .wait(state)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                }
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        break Err(WaitError::TimedOut);
                    }
                    state = self
                        .cell
                        .cond
                        .wait_timeout(state, remaining)
                        .map(|(guard, _)| guard)
                        .unwrap_or_else(|poisoned| poisoned.into_inner().0);
                }
            }
        };
        state.waiters -= 1;
        result
    }

    fn post(&mut self) -> Result<(), Errno> {
        let mut state = self.cell.lock();
        if state.removed {
            return Err(Errno::EIDRM);
        }
        state.value += 1;
        self.cell.cond.notify_one();
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Errno> {
        let mut state = self.cell.lock();
        if state.removed {
            return Err(Errno::EIDRM);
        }
        // Top up so that exactly the current waiters can proceed.
        let pending = state.waiters.saturating_sub(state.value);
        state.value += pending;
        self.cell.cond.notify_all();
        Ok(())
    }

    fn valid(&self) -> bool {
        !self.cell.lock().removed
    }

    fn set_destroy_on_release(&mut self, destroy: bool) {
        self.destroy = destroy;
    }
}

impl Drop for LocalSemaphore {
    fn drop(&mut self) {
        let mut registry = lock(&self.registry);
        registry.events.push(IpcEvent::SemaphoreReleased(self.key));

        if !self.destroy {
            return;
        }
        let still_ours = registry
            .semaphores
            .get(&self.key)
            .is_some_and(|cell| Arc::ptr_eq(cell, &self.cell));
        if still_ours {
            registry.semaphores.remove(&self.key);
            registry.events.push(IpcEvent::SemaphoreDestroyed(self.key));
        }
        drop(registry);

        let mut state = self.cell.lock();
        state.removed = true;
        self.cell.cond.notify_all();
    }
}
