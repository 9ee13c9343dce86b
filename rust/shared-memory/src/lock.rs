//! Cross-process lock
//!
//! Guards the segment pair of one channel. The OS primitive excludes the
//! peer process; an in-process mutex excludes other threads of this
//! process, which an OS lock owned per process (or per thread, recursively)
//! would let through.
//!
//! Both halves report abandonment: the previous owner died while holding
//! the lock, so whatever it was writing may be half done.

use crate::Result;
use parking_lot::{Mutex, MutexGuard};
use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use tracing::{debug, warn};

/// Named lock shared with the peer, protecting a value of type `T`
pub struct CrossProcessLock<T> {
    name: String,
    os: OsLock,
    data: Mutex<T>,
}

/// Exclusive access to the protected value. Dropping it releases the OS
/// lock first, then the in-process mutex.
pub struct CrossProcessGuard<'a, T> {
    data: ManuallyDrop<MutexGuard<'a, T>>,
    os: &'a OsLock,
    abandoned: bool,
    #[cfg(test)]
    leave_abandoned: bool,
}

impl<T> CrossProcessLock<T> {
    pub fn open(name: impl Into<String>, data: T) -> Result<Self> {
        let name = name.into();
        let os = OsLock::open(&name)?;
        debug!("Opened cross-process lock {}", name);
        Ok(Self {
            name,
            os,
            data: Mutex::new(data),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Block until both this process's threads and the peer are excluded
    pub fn acquire(&self) -> Result<CrossProcessGuard<'_, T>> {
        let data = self.data.lock();
        let abandoned = self.os.acquire()?;
        if abandoned {
            warn!("Cross-process lock {} was abandoned by its previous owner", self.name);
        }

        Ok(CrossProcessGuard {
            data: ManuallyDrop::new(data),
            os: &self.os,
            abandoned,
            #[cfg(test)]
            leave_abandoned: false,
        })
    }
}

impl<'a, T> CrossProcessGuard<'a, T> {
    /// The previous owner terminated while holding the lock
    pub fn was_abandoned(&self) -> bool {
        self.abandoned
    }

    /// Give up the lock the way a dying owner would
    #[cfg(test)]
    pub(crate) fn abandon(mut self) {
        self.leave_abandoned = true;
    }
}

impl<'a, T> Deref for CrossProcessGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.data
    }
}

impl<'a, T> DerefMut for CrossProcessGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.data
    }
}

impl<'a, T> Drop for CrossProcessGuard<'a, T> {
    fn drop(&mut self) {
        #[cfg(test)]
        let result = if self.leave_abandoned {
            self.os.abandon()
        } else {
            self.os.release()
        };
        #[cfg(not(test))]
        let result = self.os.release();

        if let Err(err) = result {
            warn!("Failed to release cross-process lock: {}", err);
        }

        // SAFETY: dropped exactly once, here
        unsafe { ManuallyDrop::drop(&mut self.data) };
    }
}

// Platform-specific implementations

#[cfg(unix)]
mod unix_impl {
    use crate::platform::PlatformUtils;
    use crate::{Result, SharedMemoryError};
    use nix::errno::Errno;
    use nix::fcntl::{flock, FlockArg};
    use std::fs::{File, OpenOptions};
    use std::os::unix::fs::FileExt;
    use std::os::unix::io::AsRawFd;

    /// `flock` on a lock file holding the owner's pid while held.
    ///
    /// The kernel drops the `flock` when its owner dies but the pid stays
    /// behind, which is how the next owner learns about it.
    pub struct OsLock {
        file: File,
    }

    impl OsLock {
        pub fn open(name: &str) -> Result<Self> {
            let path = PlatformUtils::temp_path(&format!("{}.lock", name));
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)
                .map_err(|e| SharedMemoryError::Lock(format!("{}: {}", path.display(), e)))?;
            Ok(Self { file })
        }

        fn flock(&self, arg: FlockArg) -> Result<()> {
            loop {
                match flock(self.file.as_raw_fd(), arg) {
                    Ok(()) => return Ok(()),
                    Err(Errno::EINTR) => continue,
                    Err(e) => return Err(SharedMemoryError::Lock(format!("flock failed: {}", e))),
                }
            }
        }

        fn read_owner(&self) -> Result<u32> {
            let mut marker = [0u8; 4];
            let read = self.file.read_at(&mut marker, 0)?;
            if read < marker.len() {
                return Ok(0);
            }
            Ok(u32::from_le_bytes(marker))
        }

        fn write_owner(&self, pid: u32) -> Result<()> {
            self.file.write_all_at(&pid.to_le_bytes(), 0)?;
            Ok(())
        }

        /// Returns whether the previous owner abandoned the lock
        pub fn acquire(&self) -> Result<bool> {
            self.flock(FlockArg::LockExclusive)?;
            let abandoned = match self.read_owner().and_then(|previous| {
                self.write_owner(PlatformUtils::get_process_id())?;
                Ok(previous != 0)
            }) {
                Ok(abandoned) => abandoned,
                Err(err) => {
                    let _ = self.flock(FlockArg::Unlock);
                    return Err(err);
                }
            };
            Ok(abandoned)
        }

        pub fn release(&self) -> Result<()> {
            let cleared = self.write_owner(0);
            self.flock(FlockArg::Unlock)?;
            cleared
        }

        #[cfg(test)]
        pub fn abandon(&self) -> Result<()> {
            self.flock(FlockArg::Unlock)
        }
    }
}

#[cfg(windows)]
mod windows_impl {
    use crate::{Result, SharedMemoryError};
    use std::ffi::CString;
    use winapi::shared::ntdef::HANDLE;
    use winapi::um::errhandlingapi::GetLastError;
    use winapi::um::handleapi::CloseHandle;
    use winapi::um::synchapi::{CreateMutexA, ReleaseMutex, WaitForSingleObject};
    use winapi::um::winbase::{INFINITE, WAIT_ABANDONED, WAIT_OBJECT_0};

    /// Named kernel mutex; Windows reports abandonment itself
    pub struct OsLock {
        handle: HANDLE,
    }

    // SAFETY: the handle is a kernel object reference usable from any thread
    unsafe impl Send for OsLock {}
    unsafe impl Sync for OsLock {}

    impl OsLock {
        pub fn open(name: &str) -> Result<Self> {
            let c_name = CString::new(name)
                .map_err(|_| SharedMemoryError::InvalidName(name.to_string()))?;
            let handle = unsafe { CreateMutexA(std::ptr::null_mut(), 0, c_name.as_ptr()) };
            if handle.is_null() {
                let code = unsafe { GetLastError() };
                return Err(SharedMemoryError::Lock(format!("CreateMutex failed: {}", code)));
            }
            Ok(Self { handle })
        }

        pub fn acquire(&self) -> Result<bool> {
            match unsafe { WaitForSingleObject(self.handle, INFINITE) } {
                WAIT_OBJECT_0 => Ok(false),
                WAIT_ABANDONED => Ok(true),
                other => Err(SharedMemoryError::Lock(format!("WaitForSingleObject returned {}", other))),
            }
        }

        pub fn release(&self) -> Result<()> {
            if unsafe { ReleaseMutex(self.handle) } == 0 {
                let code = unsafe { GetLastError() };
                return Err(SharedMemoryError::Lock(format!("ReleaseMutex failed: {}", code)));
            }
            Ok(())
        }

        /// Ownership is dropped by the OS when the owning thread exits
        #[cfg(test)]
        pub fn abandon(&self) -> Result<()> {
            Ok(())
        }
    }

    impl Drop for OsLock {
        fn drop(&mut self) {
            unsafe { CloseHandle(self.handle) };
        }
    }
}

#[cfg(unix)]
use unix_impl::OsLock;
#[cfg(windows)]
use windows_impl::OsLock;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::PlatformUtils;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;
    use tracing_test::traced_test;

    #[test]
    fn test_guard_gives_access() {
        let lock = CrossProcessLock::open(PlatformUtils::generate_region_name("lock"), 5u32).unwrap();
        {
            let mut guard = lock.acquire().unwrap();
            assert!(!guard.was_abandoned());
            *guard += 1;
        }
        assert_eq!(*lock.acquire().unwrap(), 6);
    }

    #[test]
    fn test_separate_handles_exclude_each_other() {
        let name = PlatformUtils::generate_region_name("lock");
        let inside = Arc::new(AtomicUsize::new(0));
        let mut workers = Vec::new();

        for _ in 0..4 {
            let name = name.clone();
            let inside = Arc::clone(&inside);
            workers.push(thread::spawn(move || {
                // Own handle per thread, like two processes would have
                let lock = CrossProcessLock::open(name, ()).unwrap();
                for _ in 0..20 {
                    let _guard = lock.acquire().unwrap();
                    assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                    thread::sleep(Duration::from_micros(200));
                    inside.fetch_sub(1, Ordering::SeqCst);
                }
            }));
        }

        for worker in workers {
            worker.join().unwrap();
        }
    }

    #[test]
    fn test_abandoned_lock_reported_once() {
        let name = PlatformUtils::generate_region_name("lock");

        let dying = name.clone();
        thread::spawn(move || {
            let lock = CrossProcessLock::open(dying, ()).unwrap();
            lock.acquire().unwrap().abandon();
        })
        .join()
        .unwrap();

        let lock = CrossProcessLock::open(name, ()).unwrap();
        assert!(lock.acquire().unwrap().was_abandoned());
        assert!(!lock.acquire().unwrap().was_abandoned());
    }

    #[test]
    #[traced_test]
    fn test_abandonment_is_logged() {
        let name = PlatformUtils::generate_region_name("lock");

        let dying = name.clone();
        thread::spawn(move || {
            let lock = CrossProcessLock::open(dying, ()).unwrap();
            lock.acquire().unwrap().abandon();
        })
        .join()
        .unwrap();

        let lock = CrossProcessLock::open(name, ()).unwrap();
        drop(lock.acquire().unwrap());
        assert!(logs_contain("was abandoned by its previous owner"));
    }
}
