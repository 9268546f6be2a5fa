//! Real-time scheduling helpers for the streaming workers.
//!
//! Workers bump themselves to the maximum round-robin priority and pin to a
//! dedicated CPU. Both are best-effort: on a development host without the
//! required privileges the caller logs the failure and streams anyway.

use std::io;
use std::mem;

use log::warn;

/// Raises the calling thread to the maximum priority of `SCHED_RR`.
pub fn set_realtime_priority() -> io::Result<()> {
    let max_priority = syscall!(sched_get_priority_max(libc::SCHED_RR))?;
    let param = libc::sched_param {
        sched_priority: max_priority,
    };
    let rc = unsafe { libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_RR, &param) };
    if rc != 0 {
        return Err(io::Error::from_raw_os_error(rc));
    }
    Ok(())
}

/// Pins the calling thread to `cpu`.
pub fn pin_to_cpu(cpu: usize) -> io::Result<()> {
    // SAFETY: `cpu_set_t` is a plain bitmask; the libc macros only touch it.
    unsafe {
        let mut set: libc::cpu_set_t = mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        let rc = libc::pthread_setaffinity_np(
            libc::pthread_self(),
            mem::size_of::<libc::cpu_set_t>(),
            &set,
        );
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }
    }
    Ok(())
}

/// Blocks every signal on the calling thread until dropped.
///
/// The supervisor holds one of these across worker spawns so the workers
/// inherit a fully masked signal set and SIGINT/SIGTERM stay with the
/// supervisor thread.
#[derive(Debug)]
pub struct SignalMask {
    old: libc::sigset_t,
}

impl SignalMask {
    pub fn block_all() -> io::Result<SignalMask> {
        // SAFETY: both sets are plain masks initialised by the libc calls.
        unsafe {
            let mut all: libc::sigset_t = mem::zeroed();
            libc::sigfillset(&mut all);
            let mut old: libc::sigset_t = mem::zeroed();
            let rc = libc::pthread_sigmask(libc::SIG_SETMASK, &all, &mut old);
            if rc != 0 {
                return Err(io::Error::from_raw_os_error(rc));
            }
            Ok(SignalMask { old })
        }
    }
}

impl Drop for SignalMask {
    fn drop(&mut self) {
        let rc = unsafe { libc::pthread_sigmask(libc::SIG_SETMASK, &self.old, std::ptr::null_mut()) };
        if rc != 0 {
            warn!(
                "failed to restore signal mask: {}",
                io::Error::from_raw_os_error(rc)
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_mask_restores_on_drop() {
        let mask = SignalMask::block_all().unwrap();
        drop(mask);
        // Masking twice in a row must also work.
        let outer = SignalMask::block_all().unwrap();
        let inner = SignalMask::block_all().unwrap();
        drop(inner);
        drop(outer);
    }
}
