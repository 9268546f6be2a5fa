//! Cancellation signal backed by `eventfd`.
//!
//! The supervisor owns one `Waker` per worker slot. Stopping a worker writes
//! to the eventfd; the worker observes read-readiness through its selector
//! and exits its loop. After joining the thread the supervisor drains the
//! counter back to zero so the signal is rearmed for the next worker.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};

/// Single-shot wakeup signal.
///
/// `eventfd` is effectively a 64 bit counter. All writes must be of 8 bytes
/// (64 bits) and are added to the count; reads reset the count to zero.
#[derive(Debug)]
pub struct Waker {
    fd: File,
}

impl Waker {
    pub fn new() -> io::Result<Waker> {
        let fd = syscall!(eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK))?;
        // SAFETY: `eventfd(2)` ensures the fd is valid.
        let file = unsafe { File::from_raw_fd(fd) };
        Ok(Waker { fd: file })
    }

    /// Makes the fd read-ready, waking any selector it is registered with.
    #[allow(clippy::unused_io_amount)] // Writes of 8 bytes never split.
    pub fn wake(&self) -> io::Result<()> {
        let buf: [u8; 8] = 1u64.to_ne_bytes();
        match (&self.fd).write(&buf) {
            Ok(_) => Ok(()),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                // Writing only blocks if the counter is going to overflow.
                // Reset the counter to 0 and wake again.
                self.drain()?;
                self.wake()
            }
            Err(err) => Err(err),
        }
    }

    /// Reads the counter back to zero. A `WouldBlock` means the signal was
    /// never raised (or already drained), which is fine.
    #[allow(clippy::unused_io_amount)] // Reads of 8 bytes never split.
    pub fn drain(&self) -> io::Result<()> {
        let mut buf: [u8; 8] = 0u64.to_ne_bytes();
        match (&self.fd).read(&mut buf) {
            Ok(_) => Ok(()),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(err) => Err(err),
        }
    }
}

impl AsRawFd for Waker {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wake_then_drain_rearms() {
        let waker = Waker::new().unwrap();
        // Drain of an unraised signal is a no-op.
        waker.drain().unwrap();
        waker.wake().unwrap();
        waker.wake().unwrap();
        waker.drain().unwrap();
        waker.drain().unwrap();
    }
}
