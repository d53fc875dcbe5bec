use std::fs::{File, OpenOptions};
use std::path::Path;
use crate::core::error::{Error, ErrorKind, Result};

/// Single engine per database directory
pub struct FileLock {
    pub file: File,
    pub exclusive: bool,
}

impl FileLock {
    pub fn acquire(lock_path: &Path, exclusive: bool) -> Result<Self> {
        let file = if exclusive {
            OpenOptions::new()
                .create(true)
                .write(true)
                .open(lock_path)?
        } else {
            OpenOptions::new().read(true).open(lock_path)?
        };

        // Platform-specific locking
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            use libc::{flock, LOCK_EX, LOCK_SH, LOCK_NB};

            let fd = file.as_raw_fd();
            let operation = if exclusive { LOCK_EX } else { LOCK_SH } | LOCK_NB;

            unsafe {
                if flock(fd, operation) != 0 {
                    return Err(Error {
                        kind: ErrorKind::Io,
                        context: format!(
                            "another engine holds {}",
                            lock_path.display()
                        ),
                    });
                }
            }
        }

        Ok(FileLock { file, exclusive })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            use libc::{flock, LOCK_UN};

            let fd = self.file.as_raw_fd();
            unsafe {
                flock(fd, LOCK_UN);
            }
        }
    }
}
