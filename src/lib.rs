//! Network-side bridge between an IIO SDR front-end and a remote UDP peer.
//!
//! The bridge is a single process built from three cooperating event loops:
//!
//! * the [supervisor], which owns the control and data sockets and starts,
//!   reconfigures and stops the streaming workers on request;
//! * the [RX pipeline][rx], which fragments filled DMA buffers into trains
//!   of block-framed datagrams and sends them to the latest client address;
//! * the [TX pipeline][tx], which reassembles block-framed datagrams back
//!   into DMA buffers and pushes them to the radio.
//!
//! Each loop multiplexes its inputs with a small readiness primitive built
//! directly on `epoll` (see [`poll`]); the supervisor signals workers to stop
//! through an eventfd-backed [`waker::Waker`]. The control protocol and the
//! datagram framing live in [`wire`], and the radio itself is abstracted as a
//! DMA-buffer provider in [`radio`] so the streaming code can be exercised
//! end-to-end without hardware.

/// Helper macro to execute a system call that returns an `io::Result`.
macro_rules! syscall {
    ($fn: ident ( $($arg: expr),* $(,)* ) ) => {{
        let res = unsafe { libc::$fn($($arg, )*) };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

pub mod poll;
pub mod radio;
pub mod rt;
pub mod rx;
pub mod stats;
pub mod supervisor;
pub mod tx;
pub mod waker;
pub mod wire;
