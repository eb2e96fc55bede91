// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! System V shared memory and semaphore backend.
//!
//! Wraps shmget/shmat/shmctl and semget/semop/semctl. All unsafe calls are
//! confined to this file.

use std::ptr::NonNull;
use std::time::{Duration, Instant};

use nix::errno::Errno;

use super::{IpcBackend, Semaphore, SharedSegment, WaitError};
use crate::types::IpcKey;

/// Backend using the kernel's System V IPC namespace.
#[derive(Debug, Default, Clone, Copy)]
pub struct SysvIpc;

impl IpcBackend for SysvIpc {
    fn create_segment(
        &self,
        key: IpcKey,
        size: usize,
        mode: u32,
    ) -> Result<Box<dyn SharedSegment>, Errno> {
        // SAFETY: shmget only reads its scalar arguments
        let existed = unsafe { libc::shmget(key.value(), 0, 0) } >= 0;
        // SAFETY: as above
        let id = unsafe {
            libc::shmget(
                key.value(),
                size,
                libc::IPC_CREAT | (mode & 0o777) as libc::c_int,
            )
        };
        if id < 0 {
            return Err(Errno::last());
        }

        let segment = SysvSegment::map(key, id, size, !existed)?;
        tracing::debug!(key = %key, size = size, created = !existed, "Created shared memory segment");
        Ok(Box::new(segment))
    }

    fn attach_segment(&self, key: IpcKey, size: usize) -> Result<Box<dyn SharedSegment>, Errno> {
        // SAFETY: shmget only reads its scalar arguments
        let id = unsafe { libc::shmget(key.value(), size, 0) };
        if id < 0 {
            return Err(Errno::last());
        }

        let segment = SysvSegment::map(key, id, size, false)?;
        tracing::debug!(key = %key, size = size, "Attached shared memory segment");
        Ok(Box::new(segment))
    }

    fn create_semaphore(
        &self,
        key: IpcKey,
        mode: u32,
        initial: u32,
    ) -> Result<Box<dyn Semaphore>, Errno> {
        let perms = (mode & 0o777) as libc::c_int;
        // SAFETY: semget only reads its scalar arguments
        let id = unsafe { libc::semget(key.value(), 1, libc::IPC_CREAT | libc::IPC_EXCL | perms) };

        let id = if id >= 0 {
            // SAFETY: id is a semaphore set we just created with one member
            let rc = unsafe { libc::semctl(id, 0, libc::SETVAL, initial as libc::c_int) };
            if rc < 0 {
                let errno = Errno::last();
                // SAFETY: id is valid, IPC_RMID takes no extra argument
                unsafe { libc::semctl(id, 0, libc::IPC_RMID) };
                return Err(errno);
            }
            id
        } else if Errno::last() == Errno::EEXIST {
            // SAFETY: semget only reads its scalar arguments
            let id = unsafe { libc::semget(key.value(), 1, perms) };
            if id < 0 {
                return Err(Errno::last());
            }
            id
        } else {
            return Err(Errno::last());
        };

        tracing::debug!(key = %key, initial = initial, "Created semaphore");
        Ok(Box::new(SysvSemaphore {
            key,
            id,
            destroy: false,
        }))
    }

    fn attach_semaphore(&self, key: IpcKey) -> Result<Box<dyn Semaphore>, Errno> {
        // SAFETY: semget only reads its scalar arguments
        let id = unsafe { libc::semget(key.value(), 1, 0) };
        if id < 0 {
            return Err(Errno::last());
        }

        tracing::debug!(key = %key, "Attached semaphore");
        Ok(Box::new(SysvSemaphore {
            key,
            id,
            destroy: false,
        }))
    }
}

/// A segment mapped with shmat.
struct SysvSegment {
    key: IpcKey,
    id: libc::c_int,
    ptr: NonNull<u8>,
    size: usize,
    created: bool,
    destroy: bool,
}

// SAFETY: the mapping is process-wide; the handle just carries its address.
unsafe impl Send for SysvSegment {}

impl SysvSegment {
    fn map(key: IpcKey, id: libc::c_int, size: usize, created: bool) -> Result<Self, Errno> {
        // SAFETY: id came from shmget, a null address lets the kernel choose
        let addr = unsafe { libc::shmat(id, std::ptr::null(), 0) };
        if addr as isize == -1 {
            let errno = Errno::last();
            if created {
                // SAFETY: id is valid and nobody else knows about it yet
                unsafe { libc::shmctl(id, libc::IPC_RMID, std::ptr::null_mut()) };
            }
            return Err(errno);
        }

        let ptr = NonNull::new(addr as *mut u8).ok_or(Errno::EFAULT)?;
        Ok(Self {
            key,
            id,
            ptr,
            size,
            created,
            destroy: false,
        })
    }
}

impl SharedSegment for SysvSegment {
    fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    fn len(&self) -> usize {
        self.size
    }

    fn created(&self) -> bool {
        self.created
    }

    fn attach_count(&self) -> Option<usize> {
        // SAFETY: shmid_ds is plain old data, zero is a valid bit pattern
        let mut ds: libc::shmid_ds = unsafe { std::mem::zeroed() };
        // SAFETY: id is valid and ds is a writable shmid_ds
        let rc = unsafe { libc::shmctl(self.id, libc::IPC_STAT, &mut ds) };
        if rc < 0 {
            tracing::warn!(key = %self.key, error = %Errno::last(), "IPC_STAT failed");
            return None;
        }
        Some(ds.shm_nattch as usize)
    }

    fn set_destroy_on_detach(&mut self, destroy: bool) {
        self.destroy = destroy;
    }
}

impl Drop for SysvSegment {
    fn drop(&mut self) {
        // SAFETY: ptr was returned by shmat and is detached exactly once
        let rc = unsafe { libc::shmdt(self.ptr.as_ptr() as *const libc::c_void) };
        if rc < 0 {
            tracing::error!(key = %self.key, error = %Errno::last(), "Failed to detach shared memory");
        }

        if self.destroy {
            // SAFETY: id is valid; IPC_RMID ignores the buffer argument
            let rc = unsafe { libc::shmctl(self.id, libc::IPC_RMID, std::ptr::null_mut()) };
            if rc < 0 {
                tracing::error!(key = %self.key, error = %Errno::last(), "Failed to remove shared memory");
            } else {
                tracing::debug!(key = %self.key, "Removed shared memory segment");
            }
        }
    }
}

/// One-member System V semaphore set.
struct SysvSemaphore {
    key: IpcKey,
    id: libc::c_int,
    destroy: bool,
}

impl SysvSemaphore {
    fn op(&self, delta: libc::c_short, flags: libc::c_short) -> libc::sembuf {
        libc::sembuf {
            sem_num: 0,
            sem_op: delta,
            sem_flg: flags,
        }
    }

    fn semop(&self, op: &mut libc::sembuf) -> Result<(), Errno> {
        // SAFETY: op points at exactly one sembuf
        let rc = unsafe { libc::semop(self.id, op, 1) };
        if rc < 0 {
            Err(Errno::last())
        } else {
            Ok(())
        }
    }

    #[cfg(target_os = "linux")]
    fn timed_semop(&self, op: &mut libc::sembuf, timeout: Duration) -> Result<(), Errno> {
        // SAFETY: timespec is plain old data
        let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
        ts.tv_sec = timeout.as_secs() as libc::time_t;
        ts.tv_nsec = timeout.subsec_nanos() as libc::c_long;
        // SAFETY: op points at one sembuf and ts outlives the call
        let rc = unsafe {
            libc::syscall(
                libc::SYS_semtimedop,
                self.id,
                op as *mut libc::sembuf,
                1 as libc::size_t,
                &ts as *const libc::timespec,
            )
        };
        if rc < 0 {
            Err(Errno::last())
        } else {
            Ok(())
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn timed_semop(&self, op: &mut libc::sembuf, timeout: Duration) -> Result<(), Errno> {
        let deadline = Instant::now() + timeout;
        op.sem_flg |= libc::IPC_NOWAIT as libc::c_short;
        loop {
            match self.semop(op) {
                Err(Errno::EAGAIN) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(1));
                }
                other => return other,
            }
        }
    }
}

impl Semaphore for SysvSemaphore {
    fn wait(&mut self, timeout: Option<Duration>) -> Result<(), WaitError> {
        let mut op = self.op(-1, 0);

        let Some(timeout) = timeout else {
            loop {
                match self.semop(&mut op) {
                    Ok(()) => return Ok(()),
                    Err(Errno::EINTR) => continue,
                    Err(errno) => return Err(WaitError::Primitive(errno)),
                }
            }
        };

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.timed_semop(&mut op, remaining) {
                Ok(()) => return Ok(()),
                Err(Errno::EAGAIN) => return Err(WaitError::TimedOut),
                Err(Errno::EINTR) if !remaining.is_zero() => continue,
                Err(Errno::EINTR) => return Err(WaitError::TimedOut),
                Err(errno) => return Err(WaitError::Primitive(errno)),
            }
        }
    }

    fn post(&mut self) -> Result<(), Errno> {
        let mut op = self.op(1, 0);
        self.semop(&mut op)
    }

    fn flush(&mut self) -> Result<(), Errno> {
        // SAFETY: id is valid, GETNCNT takes no extra argument
        let waiters = unsafe { libc::semctl(self.id, 0, libc::GETNCNT) };
        if waiters < 0 {
            return Err(Errno::last());
        }
        if waiters == 0 {
            return Ok(());
        }
        let delta = waiters.min(libc::c_short::MAX as libc::c_int) as libc::c_short;
        let mut op = self.op(delta, 0);
        self.semop(&mut op)
    }

    fn valid(&self) -> bool {
        // SAFETY: GETVAL takes no extra argument
        unsafe { libc::semctl(self.id, 0, libc::GETVAL) >= 0 }
    }

    fn set_destroy_on_release(&mut self, destroy: bool) {
        self.destroy = destroy;
    }
}

impl Drop for SysvSemaphore {
    fn drop(&mut self) {
        if !self.destroy {
            return;
        }
        // SAFETY: IPC_RMID takes no extra argument
        let rc = unsafe { libc::semctl(self.id, 0, libc::IPC_RMID) };
        if rc < 0 {
            tracing::error!(key = %self.key, error = %Errno::last(), "Failed to remove semaphore");
        } else {
            tracing::debug!(key = %self.key, "Removed semaphore");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_key(offset: i32) -> IpcKey {
        IpcKey::new(0x5300_0000 | ((std::process::id() as i32 & 0xFFFF) << 4) | offset)
    }

    #[test]
    #[ignore = "requires System V IPC"]
    fn test_segment_create_attach_destroy() {
        let key = unique_key(1);
        let mut master = SysvIpc.create_segment(key, 4096, 0o600).unwrap();
        assert!(master.created());

        let attached = SysvIpc.attach_segment(key, 4096).unwrap();
        assert!(!attached.created());
        assert_eq!(master.attach_count(), Some(2));

        // SAFETY: both mappings cover at least 4096 bytes
        unsafe {
            *master.as_ptr().add(10) = 0xAB;
            assert_eq!(*attached.as_ptr().add(10), 0xAB);
        }

        drop(attached);
        assert_eq!(master.attach_count(), Some(1));
        master.set_destroy_on_detach(true);
        drop(master);

        assert_eq!(
            SysvIpc.attach_segment(key, 4096).err(),
            Some(Errno::ENOENT)
        );
    }

    #[test]
    #[ignore = "requires System V IPC"]
    fn test_semaphore_wait_post() {
        let key = unique_key(2);
        let mut sem = SysvIpc.create_semaphore(key, 0o600, 1).unwrap();
        sem.set_destroy_on_release(true);
        assert!(sem.valid());

        assert!(sem.wait(Some(Duration::from_millis(10))).is_ok());
        assert_eq!(
            sem.wait(Some(Duration::from_millis(10))),
            Err(WaitError::TimedOut)
        );
        sem.post().unwrap();
        assert!(sem.wait(Some(Duration::ZERO)).is_ok());
        // Nobody waiting: flush leaves the count untouched.
        sem.flush().unwrap();
        assert_eq!(sem.wait(Some(Duration::ZERO)), Err(WaitError::TimedOut));
    }
}
