//! The radio as seen by the streaming pipelines.
//!
//! The pipelines only need a DMA-buffer provider: something that hands out a
//! fixed-size sample region together with a readiness handle, a blocking
//! refill (RX) and a blocking push (TX). The [`sim`] backend implements that
//! contract in software and is what the default build and the test suite
//! run on; the [`iio`] backend (cargo feature `iio`) binds the same contract
//! to the system libiio.

use std::io;
use std::os::fd::RawFd;

pub mod sim;

#[cfg(feature = "iio")]
pub mod iio;

/// Capture device identifier on the AD9361 fabric.
pub const RX_DEVICE: &str = "cf-ad9361-lpc";
/// Playback device identifier on the AD9361 fabric.
pub const TX_DEVICE: &str = "cf-ad9361-dds-core-lpc";

/// Number of logical channels addressable by the channel mask.
pub const MAX_CHANNELS: u32 = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Radio to host: the capture device fills buffers.
    Rx,
    /// Host to radio: the playback device consumes buffers.
    Tx,
}

impl Direction {
    pub fn device(self) -> &'static str {
        match self {
            Direction::Rx => RX_DEVICE,
            Direction::Tx => TX_DEVICE,
        }
    }
}

/// A fixed-size DMA-backed sample buffer.
///
/// Created at worker start, dropped at worker exit, never shared between
/// workers. The byte length is `samples * step` where `step` is fixed by
/// the channel mask for the lifetime of the stream.
pub trait DmaBuffer: Send {
    /// Readiness handle: read-ready when the next blocking operation will
    /// complete promptly.
    fn poll_fd(&self) -> RawFd;

    /// Bytes between two successive samples of the same channel, as reported
    /// by the driver after channel selection.
    fn step(&self) -> usize;

    /// The backing sample region.
    fn bytes(&mut self) -> &mut [u8];

    /// Fills the buffer from the radio, returning the transferred byte
    /// count. Blocking; capture direction only.
    fn refill(&mut self) -> io::Result<usize>;

    /// Hands the buffer to the radio, returning the transferred byte count.
    /// Blocking; playback direction only.
    fn push(&mut self) -> io::Result<usize>;
}

/// A DMA-buffer provider.
///
/// Opening a stream disables every channel on the device, enables the ones
/// selected by `channels` and allocates a non-cyclic buffer of `samples`
/// samples. An empty mask is rejected: the stride, and with it the buffer
/// geometry, would be undefined.
pub trait Radio: Send + Sync {
    fn open(
        &self,
        direction: Direction,
        channels: u32,
        samples: usize,
    ) -> io::Result<Box<dyn DmaBuffer>>;
}
