//! Advisory file locking for cross-process access arbitration.
//!
//! A writer takes an exclusive lock on the data file, readers take a
//! shared lock. Acquisition retries until the configured timeout and
//! then fails with `SableError::Timeout`.

use std::fs::File;
use std::time::{Duration, Instant};

use crate::error::{Result, SableError};

const RETRY_INTERVAL: Duration = Duration::from_millis(50);

pub fn lock(file: &File, exclusive: bool, timeout: Option<Duration>) -> Result<()> {
    let start = Instant::now();
    loop {
        match sys::try_lock(file, exclusive) {
            Ok(true) => return Ok(()),
            Ok(false) => {}
            Err(err) => return Err(SableError::Io(err)),
        }
        if let Some(timeout) = timeout {
            if start.elapsed() + RETRY_INTERVAL > timeout {
                return Err(SableError::Timeout);
            }
        }
        std::thread::sleep(RETRY_INTERVAL);
    }
}

pub fn unlock(file: &File) -> Result<()> {
    sys::unlock(file).map_err(SableError::Io)
}

#[cfg(unix)]
mod sys {
    use std::fs::File;
    use std::io;
    use std::os::unix::io::AsRawFd;

    pub fn try_lock(file: &File, exclusive: bool) -> io::Result<bool> {
        let mut flag = libc::LOCK_NB;
        if exclusive {
            flag |= libc::LOCK_EX;
        } else {
            flag |= libc::LOCK_SH;
        }
        let res = unsafe { libc::flock(file.as_raw_fd(), flag) };
        if res == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EWOULDBLOCK) => Ok(false),
            Some(libc::EINTR) => Ok(false),
            _ => Err(err),
        }
    }

    pub fn unlock(file: &File) -> io::Result<()> {
        let res = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
        if res == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

#[cfg(not(unix))]
mod sys {
    use std::fs::File;
    use std::io;

    // Advisory locking is not wired up on this platform; in-process
    // exclusion still holds through the writer mutex.
    pub fn try_lock(_file: &File, _exclusive: bool) -> io::Result<bool> {
        Ok(true)
    }

    pub fn unlock(_file: &File) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    #[test]
    fn exclusive_lock_times_out_against_holder() {
        let tmp = NamedTempFile::new().expect("temp file");
        let a = tmp.reopen().expect("reopen");
        let b = tmp.reopen().expect("reopen");
        lock(&a, true, None).expect("first lock");
        let err = lock(&b, true, Some(Duration::from_millis(60))).unwrap_err();
        assert!(matches!(err, SableError::Timeout));
        unlock(&a).expect("unlock");
        lock(&b, true, Some(Duration::from_millis(500))).expect("lock after release");
        unlock(&b).expect("unlock");
    }

    #[test]
    fn shared_locks_stack() {
        let tmp = NamedTempFile::new().expect("temp file");
        let a = tmp.reopen().expect("reopen");
        let b = tmp.reopen().expect("reopen");
        lock(&a, false, None).expect("shared a");
        lock(&b, false, None).expect("shared b");
        unlock(&a).unwrap();
        unlock(&b).unwrap();
    }
}
