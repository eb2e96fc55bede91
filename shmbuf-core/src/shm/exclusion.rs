// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Mutual exclusion strategies for the data region.
//!
//! One `Exclusion` is chosen at open and kept for the buffer's lifetime.
//! The MAO variants arbitrate through the per-connection table inside the
//! segment: each connection owns one byte and announces its intent there.
//! Only one connection holds the region at a time. Intent only orders the
//! waiters: a pending reader goes before a pending writer.

use std::sync::atomic::{AtomicU8, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;

use crate::config::ExclusionKind;
use crate::ipc::{Semaphore, WaitError};

const SLOT_IDLE: u8 = 0;
const SLOT_WANT_READ: u8 = 1;
const SLOT_WANT_WRITE: u8 = 2;
const SLOT_READING: u8 = 3;
const SLOT_WRITING: u8 = 4;

/// What the caller intends to do with the data region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    ReadOnly,
    ReadWrite,
}

/// Why the exclusion could not be taken or given back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockError {
    TimedOut,
    Primitive(Errno),
    Unsupported(ExclusionKind),
}

impl From<WaitError> for LockError {
    fn from(err: WaitError) -> Self {
        match err {
            WaitError::TimedOut => Self::TimedOut,
            WaitError::Primitive(errno) => Self::Primitive(errno),
        }
    }
}

/// View of the per-connection table inside a mapped segment.
#[derive(Clone, Copy)]
pub struct ConnectionTable<'a> {
    slots: &'a [AtomicU8],
}

impl<'a> ConnectionTable<'a> {
    pub fn new(slots: &'a [AtomicU8]) -> Self {
        Self { slots }
    }

    /// # Safety
    /// `ptr` must be valid for `len` bytes for `'a` and only be accessed atomically.
    pub unsafe fn from_raw(ptr: *mut u8, len: usize) -> Self {
        // AtomicU8 has the same in-memory representation as u8.
        Self {
            slots: std::slice::from_raw_parts(ptr as *const AtomicU8, len),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Scan {
    Clear,
    /// Only lower-priority requests are competing; keep the claim.
    Hold,
    /// The region is held, or a higher-priority request is pending.
    Yield,
}

/// Connection-slot lock ("MAO"), optionally falling back on an OS semaphore
/// while contended.
pub struct MaoLock {
    index: usize,
    sem_delay: Duration,
    fallback: Option<Box<dyn Semaphore>>,
}

impl MaoLock {
    pub fn new(index: usize, sem_delay: Duration, fallback: Option<Box<dyn Semaphore>>) -> Self {
        Self {
            index,
            sem_delay,
            fallback,
        }
    }

    fn scan(&self, table: ConnectionTable<'_>, intent: Intent) -> Scan {
        let mut result = Scan::Clear;
        for (i, slot) in table.slots.iter().enumerate() {
            if i == self.index {
                continue;
            }
            let outranked = match (slot.load(Ordering::SeqCst), intent) {
                (SLOT_IDLE, _) => continue,
                (SLOT_WANT_READ, Intent::ReadOnly) | (SLOT_WANT_WRITE, Intent::ReadWrite) => {
                    i > self.index
                }
                (SLOT_WANT_WRITE, Intent::ReadOnly) => true,
                // Pending readers and any holder.
                _ => false,
            };
            if !outranked {
                return Scan::Yield;
            }
            result = Scan::Hold;
        }
        result
    }

    fn pause(&mut self, remaining: Option<Duration>) -> Result<(), LockError> {
        let delay = match remaining {
            Some(remaining) => self.sem_delay.min(remaining),
            None => self.sem_delay,
        };

        if let Some(sem) = self.fallback.as_mut() {
            return match sem.wait(Some(delay)) {
                Ok(()) | Err(WaitError::TimedOut) => Ok(()),
                Err(WaitError::Primitive(errno)) => Err(LockError::Primitive(errno)),
            };
        }

        if delay.is_zero() {
            thread::yield_now();
        } else {
            thread::sleep(delay);
        }
        Ok(())
    }

    pub fn acquire(
        &mut self,
        table: ConnectionTable<'_>,
        intent: Intent,
        timeout: Option<Duration>,
    ) -> Result<(), LockError> {
        let mine = table
            .slots
            .get(self.index)
            .ok_or(LockError::Primitive(Errno::EINVAL))?;
        let deadline = timeout.map(|t| Instant::now() + t);
        let (wanted, held) = match intent {
            Intent::ReadOnly => (SLOT_WANT_READ, SLOT_READING),
            Intent::ReadWrite => (SLOT_WANT_WRITE, SLOT_WRITING),
        };

        loop {
            mine.store(wanted, Ordering::SeqCst);
            match self.scan(table, intent) {
                Scan::Clear => {
                    mine.store(held, Ordering::SeqCst);
                    return Ok(());
                }
                Scan::Yield => mine.store(SLOT_IDLE, Ordering::SeqCst),
                Scan::Hold => {}
            }

            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            if remaining.is_some_and(|r| r.is_zero()) {
                mine.store(SLOT_IDLE, Ordering::SeqCst);
                return Err(LockError::TimedOut);
            }
            if let Err(err) = self.pause(remaining) {
                mine.store(SLOT_IDLE, Ordering::SeqCst);
                return Err(err);
            }
        }
    }

    pub fn release(&mut self, table: ConnectionTable<'_>) -> Result<(), LockError> {
        let mine = table
            .slots
            .get(self.index)
            .ok_or(LockError::Primitive(Errno::EINVAL))?;
        mine.store(SLOT_IDLE, Ordering::SeqCst);

        if let Some(sem) = self.fallback.as_mut() {
            sem.flush().map_err(LockError::Primitive)?;
        }
        Ok(())
    }
}

/// The active exclusion strategy of one buffer.
pub enum Exclusion {
    None,
    OsSemaphore(Box<dyn Semaphore>),
    Mao(MaoLock),
    NoInterrupts,
    NoSwitching,
}

impl Exclusion {
    pub fn kind(&self) -> ExclusionKind {
        match self {
            Self::None => ExclusionKind::None,
            Self::OsSemaphore(_) => ExclusionKind::OsSemaphore,
            Self::Mao(lock) if lock.fallback.is_some() => ExclusionKind::MaoWithOsSemaphore,
            Self::Mao(_) => ExclusionKind::Mao,
            Self::NoInterrupts => ExclusionKind::NoInterrupts,
            Self::NoSwitching => ExclusionKind::NoSwitching,
        }
    }

    /// The OS semaphore owned by this strategy, if any.
    pub fn semaphore_mut(&mut self) -> Option<&mut dyn Semaphore> {
        match self {
            Self::OsSemaphore(sem) => Some(sem.as_mut()),
            Self::Mao(lock) => match lock.fallback.as_mut() {
                Some(sem) => Some(sem.as_mut()),
                None => None,
            },
            _ => None,
        }
    }

    pub fn acquire(
        &mut self,
        table: ConnectionTable<'_>,
        intent: Intent,
        timeout: Option<Duration>,
    ) -> Result<(), LockError> {
        match self {
            Self::None => Ok(()),
            Self::OsSemaphore(sem) => sem.wait(timeout).map_err(LockError::from),
            Self::Mao(lock) => lock.acquire(table, intent, timeout),
            Self::NoInterrupts => Err(LockError::Unsupported(ExclusionKind::NoInterrupts)),
            Self::NoSwitching => Err(LockError::Unsupported(ExclusionKind::NoSwitching)),
        }
    }

    pub fn release(&mut self, table: ConnectionTable<'_>) -> Result<(), LockError> {
        match self {
            Self::None => Ok(()),
            Self::OsSemaphore(sem) => sem.post().map_err(LockError::Primitive),
            Self::Mao(lock) => lock.release(table),
            Self::NoInterrupts => Err(LockError::Unsupported(ExclusionKind::NoInterrupts)),
            Self::NoSwitching => Err(LockError::Unsupported(ExclusionKind::NoSwitching)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    use super::*;

    fn slots(n: usize) -> Vec<AtomicU8> {
        (0..n).map(|_| AtomicU8::new(SLOT_IDLE)).collect()
    }

    fn lock(index: usize) -> MaoLock {
        MaoLock::new(index, Duration::from_micros(10), None)
    }

    #[test]
    fn test_mao_uncontended() {
        let table = slots(3);
        let mut mao = lock(1);
        mao.acquire(ConnectionTable::new(&table), Intent::ReadWrite, Some(Duration::ZERO))
            .unwrap();
        assert_eq!(table[1].load(Ordering::SeqCst), SLOT_WRITING);
        mao.release(ConnectionTable::new(&table)).unwrap();
        assert_eq!(table[1].load(Ordering::SeqCst), SLOT_IDLE);
    }

    #[test]
    fn test_mao_readers_exclude_each_other() {
        let table = slots(2);
        let (mut a, mut b) = (lock(0), lock(1));
        let view = ConnectionTable::new(&table);
        a.acquire(view, Intent::ReadOnly, Some(Duration::ZERO)).unwrap();
        assert_eq!(
            b.acquire(view, Intent::ReadOnly, Some(Duration::from_millis(5))),
            Err(LockError::TimedOut)
        );
        assert_eq!(table[0].load(Ordering::SeqCst), SLOT_READING);
        assert_eq!(table[1].load(Ordering::SeqCst), SLOT_IDLE);

        a.release(view).unwrap();
        b.acquire(view, Intent::ReadOnly, Some(Duration::ZERO)).unwrap();
        assert_eq!(table[1].load(Ordering::SeqCst), SLOT_READING);
    }

    #[test]
    fn test_mao_pending_reader_goes_first() {
        let table = slots(2);
        let view = ConnectionTable::new(&table);

        // A lower-numbered writer still yields to a pending reader.
        table[1].store(SLOT_WANT_READ, Ordering::SeqCst);
        assert_eq!(lock(0).scan(view, Intent::ReadWrite), Scan::Yield);

        table[1].store(SLOT_IDLE, Ordering::SeqCst);
        table[0].store(SLOT_WANT_WRITE, Ordering::SeqCst);
        assert_eq!(lock(1).scan(view, Intent::ReadOnly), Scan::Hold);

        // Between equal intents the lower index wins.
        table[0].store(SLOT_WANT_READ, Ordering::SeqCst);
        assert_eq!(lock(1).scan(view, Intent::ReadOnly), Scan::Yield);
        assert_eq!(lock(0).scan(view, Intent::ReadOnly), Scan::Clear);
    }

    #[test]
    fn test_mao_holder_excludes_every_intent() {
        let table = slots(2);
        let view = ConnectionTable::new(&table);
        for held in [SLOT_READING, SLOT_WRITING] {
            table[0].store(held, Ordering::SeqCst);
            for intent in [Intent::ReadOnly, Intent::ReadWrite] {
                assert_eq!(lock(1).scan(view, intent), Scan::Yield);
            }
        }
    }

    #[test]
    fn test_mao_writer_times_out_behind_reader() {
        let table = slots(2);
        let (mut reader, mut writer) = (lock(0), lock(1));
        let view = ConnectionTable::new(&table);
        reader.acquire(view, Intent::ReadOnly, None).unwrap();

        let err = writer
            .acquire(view, Intent::ReadWrite, Some(Duration::from_millis(5)))
            .unwrap_err();
        assert_eq!(err, LockError::TimedOut);
        assert_eq!(table[1].load(Ordering::SeqCst), SLOT_IDLE);
    }

    #[test]
    fn test_mao_bad_index() {
        let table = slots(1);
        let mut mao = lock(4);
        assert_eq!(
            mao.acquire(ConnectionTable::new(&table), Intent::ReadOnly, None),
            Err(LockError::Primitive(Errno::EINVAL))
        );
    }

    #[test]
    fn test_mao_mutual_exclusion_threads() {
        const THREADS: usize = 4;
        const ROUNDS: usize = 200;

        let table: Arc<Vec<AtomicU8>> = Arc::new(slots(THREADS));
        let inside = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..THREADS)
            .map(|index| {
                let table = Arc::clone(&table);
                let inside = Arc::clone(&inside);
                thread::spawn(move || {
                    let mut mao = lock(index);
                    let intent = if index % 2 == 0 {
                        Intent::ReadWrite
                    } else {
                        Intent::ReadOnly
                    };
                    for _ in 0..ROUNDS {
                        let view = ConnectionTable::new(&table);
                        mao.acquire(view, intent, Some(Duration::from_secs(10)))
                            .unwrap();
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        thread::yield_now();
                        inside.fetch_sub(1, Ordering::SeqCst);
                        mao.release(view).unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_unsupported_variants_fail_both_ways() {
        let table = slots(1);
        let view = ConnectionTable::new(&table);
        for (mut exclusion, kind) in [
            (Exclusion::NoInterrupts, ExclusionKind::NoInterrupts),
            (Exclusion::NoSwitching, ExclusionKind::NoSwitching),
        ] {
            assert_eq!(exclusion.kind(), kind);
            assert_eq!(
                exclusion.acquire(view, Intent::ReadOnly, None),
                Err(LockError::Unsupported(kind))
            );
            assert_eq!(exclusion.release(view), Err(LockError::Unsupported(kind)));
        }
    }

    #[test]
    fn test_none_never_fails() {
        let mut exclusion = Exclusion::None;
        let view = ConnectionTable::new(&[]);
        assert!(exclusion.acquire(view, Intent::ReadWrite, Some(Duration::ZERO)).is_ok());
        assert!(exclusion.release(view).is_ok());
        assert!(exclusion.semaphore_mut().is_none());
    }
}
