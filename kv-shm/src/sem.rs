use std::cell::UnsafeCell;
use std::io;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::ShmError;

/// An unnamed POSIX semaphore, meant to be placed inside a shared mapping.
///
/// There is no safe constructor. Values are obtained by casting a pointer into a mapping and
/// must be brought to life with [`Semaphore::init`] by exactly one party before anyone else
/// uses them.
#[repr(transparent)]
pub struct Semaphore {
    inner: UnsafeCell<libc::sem_t>,
}

// Safety: `sem_t` is designed for concurrent use from multiple threads and processes.
unsafe impl Send for Semaphore {}
unsafe impl Sync for Semaphore {}

/// Outcome of a non-blocking acquisition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TryWait {
    Acquired,
    WouldBlock,
}

/// Outcome of a bounded acquisition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimedWait {
    Acquired,
    TimedOut,
}

impl Semaphore {
    /// Initialize for use across processes with the given count.
    ///
    /// # Safety
    ///
    /// The semaphore must live in memory shared by every user and must not be in use.
    pub unsafe fn init(&self, value: u32) -> Result<(), ShmError> {
        if libc::sem_init(self.inner.get(), 1, value) < 0 {
            return Err(ShmError::last_semaphore("init"));
        }

        Ok(())
    }

    /// # Safety
    ///
    /// Nobody may be blocked on, or later use, the semaphore.
    pub unsafe fn destroy(&self) -> Result<(), ShmError> {
        if libc::sem_destroy(self.inner.get()) < 0 {
            return Err(ShmError::last_semaphore("destroy"));
        }

        Ok(())
    }

    pub fn post(&self) -> Result<(), ShmError> {
        if unsafe { libc::sem_post(self.inner.get()) } < 0 {
            return Err(ShmError::last_semaphore("post"));
        }

        Ok(())
    }

    /// Block until the count can be decremented. Interrupted waits are resumed.
    pub fn wait(&self) -> Result<(), ShmError> {
        loop {
            if unsafe { libc::sem_wait(self.inner.get()) } == 0 {
                return Ok(());
            }

            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(ShmError::Semaphore { op: "wait", source: err });
            }
        }
    }

    pub fn try_wait(&self) -> Result<TryWait, ShmError> {
        loop {
            if unsafe { libc::sem_trywait(self.inner.get()) } == 0 {
                return Ok(TryWait::Acquired);
            }

            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) => return Ok(TryWait::WouldBlock),
                Some(libc::EINTR) => continue,
                _ => {
                    return Err(ShmError::Semaphore {
                        op: "trywait",
                        source: err,
                    })
                }
            }
        }
    }

    /// Wait for at most `timeout`.
    ///
    /// The deadline is taken against the realtime clock, as `sem_timedwait` demands.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<TimedWait, ShmError> {
        let deadline = SystemTime::now()
            .checked_add(timeout)
            .and_then(|at| at.duration_since(UNIX_EPOCH).ok())
            .ok_or_else(|| ShmError::Semaphore {
                op: "timedwait",
                source: io::Error::new(io::ErrorKind::InvalidInput, "deadline out of range"),
            })?;

        let abstime = libc::timespec {
            tv_sec: deadline.as_secs() as libc::time_t,
            tv_nsec: deadline.subsec_nanos() as libc::c_long,
        };

        loop {
            if unsafe { libc::sem_timedwait(self.inner.get(), &abstime) } == 0 {
                return Ok(TimedWait::Acquired);
            }

            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::ETIMEDOUT) => return Ok(TimedWait::TimedOut),
                Some(libc::EINTR) => continue,
                _ => {
                    return Err(ShmError::Semaphore {
                        op: "timedwait",
                        source: err,
                    })
                }
            }
        }
    }

    /// The current count. Only a snapshot; other parties may change it immediately.
    pub fn value(&self) -> Result<i32, ShmError> {
        let mut value: libc::c_int = 0;

        if unsafe { libc::sem_getvalue(self.inner.get(), &mut value) } < 0 {
            return Err(ShmError::last_semaphore("getvalue"));
        }

        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    /// A semaphore in private memory. `pshared` semaphores work there just as well.
    fn private(value: u32) -> Arc<Semaphore> {
        let sem: Arc<Semaphore> = Arc::new(unsafe { core::mem::zeroed() });
        unsafe { sem.init(value) }.unwrap();
        sem
    }

    #[test]
    fn try_wait_is_tri_state() {
        let sem = private(1);
        assert_eq!(sem.try_wait().unwrap(), TryWait::Acquired);
        assert_eq!(sem.try_wait().unwrap(), TryWait::WouldBlock);
        sem.post().unwrap();
        assert_eq!(sem.value().unwrap(), 1);
        unsafe { sem.destroy() }.unwrap();
    }

    #[test]
    fn timed_wait_expires() {
        let sem = private(0);
        let start = Instant::now();
        let outcome = sem.wait_timeout(Duration::from_millis(30)).unwrap();
        assert_eq!(outcome, TimedWait::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn post_wakes_waiter() {
        let sem = private(0);
        let waiter = {
            let sem = sem.clone();
            std::thread::spawn(move || sem.wait_timeout(Duration::from_secs(10)).unwrap())
        };

        std::thread::sleep(Duration::from_millis(10));
        sem.post().unwrap();
        assert_eq!(waiter.join().unwrap(), TimedWait::Acquired);

        sem.post().unwrap();
        sem.wait().unwrap();
        assert_eq!(sem.value().unwrap(), 0);
    }
}
