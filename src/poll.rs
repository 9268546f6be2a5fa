//! Readiness dispatch shared by the supervisor and the streaming workers.
//!
//! Every loop in the bridge follows the same shape: register a handful of
//! file descriptors with a [`Selector`], block in [`Selector::select`] for up
//! to a timeout, then dispatch by matching the [`Token`] of each ready event.
//! Dispatch is single-threaded and cooperative; handlers never mutate the
//! registration set while a batch is being processed.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::time::Duration;

/// Identifies a registered event source when it becomes ready.
///
/// The value round-trips through the kernel untouched, so each loop declares
/// a few `const` tokens and matches on them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Token(pub usize);

/// Readiness selector backed by an epoll instance.
#[derive(Debug)]
pub struct Selector {
    ep: OwnedFd,
}

impl Selector {
    pub fn new() -> io::Result<Selector> {
        // SAFETY: `epoll_create1(2)` ensures the fd is valid.
        let ep = unsafe { OwnedFd::from_raw_fd(syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?) };
        Ok(Selector { ep })
    }

    /// Registers `fd` for read-readiness, level-triggered.
    pub fn register(&self, fd: RawFd, token: Token) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: token.0 as u64,
        };
        syscall!(epoll_ctl(
            self.ep.as_raw_fd(),
            libc::EPOLL_CTL_ADD,
            fd,
            &mut event
        ))
        .map(|_| ())
    }

    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        syscall!(epoll_ctl(
            self.ep.as_raw_fd(),
            libc::EPOLL_CTL_DEL,
            fd,
            ptr::null_mut()
        ))
        .map(|_| ())
    }

    /// Blocks until at least one registered source is ready or `timeout`
    /// elapses, filling `events` with the ready tokens.
    ///
    /// A timeout and an interruption by signal delivery both surface as an
    /// empty event set; any other failure of the wait primitive is an error.
    pub fn select(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        let timeout = timeout
            .map(|to| {
                // `Duration::as_millis` truncates, so round up. This avoids
                // turning sub-millisecond timeouts into a busy loop.
                to.checked_add(Duration::from_nanos(999_999))
                    .unwrap_or(to)
                    .as_millis() as libc::c_int
            })
            .unwrap_or(-1);

        events.inner.clear();
        let n_events = match syscall!(epoll_wait(
            self.ep.as_raw_fd(),
            events.inner.as_mut_ptr(),
            events.inner.capacity() as i32,
            timeout,
        )) {
            Ok(n) => n as usize,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => 0,
            Err(err) => return Err(err),
        };
        // SAFETY: `epoll_wait` initialised `n_events` entries.
        unsafe { events.inner.set_len(n_events) };
        Ok(())
    }
}

/// A bounded batch of ready events, dispatched once per wakeup.
pub struct Events {
    inner: Vec<libc::epoll_event>,
}

impl Events {
    /// The batch size used by all loops in the bridge.
    pub const BATCH: usize = 10;

    pub fn with_capacity(capacity: usize) -> Events {
        Events {
            inner: Vec::with_capacity(capacity),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Token> + '_ {
        self.inner.iter().map(|event| Token(event.u64 as usize))
    }
}

impl std::fmt::Debug for Events {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.inner.iter().map(|event| Token(event.u64 as usize)))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::waker::Waker;

    const WAKE: Token = Token(7);

    #[test]
    fn timeout_yields_empty_batch() {
        let selector = Selector::new().unwrap();
        let mut events = Events::with_capacity(Events::BATCH);
        selector
            .select(&mut events, Some(Duration::from_millis(10)))
            .unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn ready_source_is_reported_with_its_token() {
        let selector = Selector::new().unwrap();
        let waker = Waker::new().unwrap();
        selector.register(waker.as_raw_fd(), WAKE).unwrap();

        let mut events = Events::with_capacity(Events::BATCH);
        waker.wake().unwrap();
        selector
            .select(&mut events, Some(Duration::from_secs(1)))
            .unwrap();
        assert_eq!(events.iter().collect::<Vec<_>>(), vec![WAKE]);

        // Level-triggered: still ready until drained.
        selector
            .select(&mut events, Some(Duration::from_millis(10)))
            .unwrap();
        assert!(!events.is_empty());
        waker.drain().unwrap();
        selector
            .select(&mut events, Some(Duration::from_millis(10)))
            .unwrap();
        assert!(events.is_empty());

        // A deregistered source no longer wakes the selector.
        selector.deregister(waker.as_raw_fd()).unwrap();
        waker.wake().unwrap();
        selector
            .select(&mut events, Some(Duration::from_millis(10)))
            .unwrap();
        assert!(events.is_empty());
    }
}
