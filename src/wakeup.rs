//! Cross-thread wakeup primitive for a blocked event loop.
//!
//! An `eventfd` counter: any thread may signal it, and the owning loop wraps
//! the readable side in a channel whose read handler drains the counter.
//! Multiple signals before the loop wakes coalesce into a single readable
//! event.

use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use log::error;

pub struct Wakeup {
    fd: OwnedFd,
}

impl Wakeup {
    pub fn new() -> io::Result<Wakeup> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Wakeup {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Signals the owning loop. Safe to call from any thread.
    pub fn signal(&self) {
        let one: u64 = 1;
        let n = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                &one as *const u64 as *const libc::c_void,
                8,
            )
        };
        if n != 8 {
            let err = io::Error::last_os_error();
            // A full counter already has a wake pending.
            if err.kind() != io::ErrorKind::WouldBlock {
                error!("Wakeup::signal wrote {} bytes instead of 8: {}", n, err);
            }
        }
    }

    /// Clears the pending signal count. Runs on the owning loop's thread.
    pub fn drain(&self) {
        let mut count: u64 = 0;
        let n = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                &mut count as *mut u64 as *mut libc::c_void,
                8,
            )
        };
        if n != 8 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                error!("Wakeup::drain read {} bytes instead of 8: {}", n, err);
            }
        }
    }
}

impl AsRawFd for Wakeup {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(w: &Wakeup) -> u64 {
        let mut count: u64 = 0;
        let n = unsafe {
            libc::read(
                w.fd.as_raw_fd(),
                &mut count as *mut u64 as *mut libc::c_void,
                8,
            )
        };
        if n == 8 {
            count
        } else {
            0
        }
    }

    #[test]
    fn signals_coalesce_into_one_drain() {
        let w = Wakeup::new().unwrap();
        w.signal();
        w.signal();
        w.signal();
        assert_eq!(pending(&w), 3);
        // Counter is empty again after a single read.
        assert_eq!(pending(&w), 0);
    }

    #[test]
    fn drain_on_empty_counter_is_harmless() {
        let w = Wakeup::new().unwrap();
        w.drain();
        w.signal();
        w.drain();
        assert_eq!(pending(&w), 0);
    }
}
