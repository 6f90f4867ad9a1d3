//! Advisory whole-file locks shared with other processes

use std::fs::File;
use std::io;

/// Held `flock` on an arena file; released on drop
pub struct FileLock<'a> {
    #[cfg_attr(not(unix), allow(dead_code))]
    file: &'a File,
}

impl<'a> FileLock<'a> {
    pub fn shared(file: &'a File) -> io::Result<Self> {
        Self::acquire(file, false)
    }

    pub fn exclusive(file: &'a File) -> io::Result<Self> {
        Self::acquire(file, true)
    }

    #[cfg(unix)]
    fn acquire(file: &'a File, exclusive: bool) -> io::Result<Self> {
        use std::os::unix::io::AsRawFd;
        let op = if exclusive {
            libc::LOCK_EX
        } else {
            libc::LOCK_SH
        };
        loop {
            // SAFETY: flock only reads the descriptor, which `file` keeps open.
            let result = unsafe { libc::flock(file.as_raw_fd(), op) };
            if result == 0 {
                return Ok(FileLock { file });
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    #[cfg(not(unix))]
    fn acquire(file: &'a File, _exclusive: bool) -> io::Result<Self> {
        Ok(FileLock { file })
    }
}

impl Drop for FileLock<'_> {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            // SAFETY: same descriptor as in `acquire`, still open.
            unsafe {
                libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
            }
        }
    }
}
