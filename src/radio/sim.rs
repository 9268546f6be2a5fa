//! Software-backed radio.
//!
//! Stands in for the AD9361 fabric when the bridge is built without libiio:
//! capture buffers become ready on a periodic timer and are filled with a
//! deterministic pattern, playback buffers are always writable and can be
//! captured for inspection. The loopback tests drive both pipelines through
//! this backend with real sockets in between.

use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::debug;

use crate::radio::{Direction, DmaBuffer, Radio};
use crate::stats::PeriodicTimer;
use crate::waker::Waker;

/// Bytes per sample of one enabled channel (16-bit I or Q words).
const CHANNEL_WIDTH: usize = 2;

/// Buffers recorded by a capturing [`SimRadio`].
#[derive(Debug, Default)]
pub struct Capture {
    /// Every buffer produced by `refill`, in order.
    pub filled: Vec<Vec<u8>>,
    /// Every buffer consumed by `push`, in order.
    pub pushed: Vec<Vec<u8>>,
}

/// Software radio configuration shared by all buffers it opens.
#[derive(Clone, Debug)]
pub struct SimRadio {
    pace: Duration,
    capture: Option<Arc<Mutex<Capture>>>,
}

impl SimRadio {
    pub fn new() -> SimRadio {
        SimRadio {
            pace: Duration::from_millis(5),
            capture: None,
        }
    }

    /// Sets the interval at which capture buffers become ready.
    pub fn with_pace(mut self, pace: Duration) -> SimRadio {
        self.pace = pace;
        self
    }

    /// Records every filled and pushed buffer for later inspection.
    pub fn with_capture(mut self) -> SimRadio {
        self.capture = Some(Arc::new(Mutex::new(Capture::default())));
        self
    }

    /// Handle to the recorded buffers, when capture is enabled.
    pub fn capture(&self) -> Option<Arc<Mutex<Capture>>> {
        self.capture.clone()
    }

    fn stride(channels: u32) -> io::Result<usize> {
        if channels == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "channel mask selects no channels",
            ));
        }
        Ok(CHANNEL_WIDTH * channels.count_ones() as usize)
    }
}

impl Default for SimRadio {
    fn default() -> SimRadio {
        SimRadio::new()
    }
}

impl Radio for SimRadio {
    fn open(
        &self,
        direction: Direction,
        channels: u32,
        samples: usize,
    ) -> io::Result<Box<dyn DmaBuffer>> {
        let step = SimRadio::stride(channels)?;
        if samples == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "zero-sample buffer requested",
            ));
        }
        debug!(
            "open {} with stride {step}, {samples} samples",
            direction.device()
        );
        match direction {
            Direction::Rx => Ok(Box::new(SimRxBuffer {
                timer: PeriodicTimer::new(self.pace)?,
                data: vec![0; samples * step],
                step,
                samples: samples as u64,
                counter: 0,
                capture: self.capture.clone(),
            })),
            Direction::Tx => {
                // Playback is consumed instantly, so the readiness handle
                // stays permanently readable.
                let ready = Waker::new()?;
                ready.wake()?;
                Ok(Box::new(SimTxBuffer {
                    ready,
                    data: vec![0; samples * step],
                    step,
                    capture: self.capture.clone(),
                }))
            }
        }
    }
}

struct SimRxBuffer {
    timer: PeriodicTimer,
    data: Vec<u8>,
    step: usize,
    samples: u64,
    counter: u64,
    capture: Option<Arc<Mutex<Capture>>>,
}

impl DmaBuffer for SimRxBuffer {
    fn poll_fd(&self) -> RawFd {
        self.timer.as_raw_fd()
    }

    fn step(&self) -> usize {
        self.step
    }

    fn bytes(&mut self) -> &mut [u8] {
        &mut self.data
    }

    fn refill(&mut self) -> io::Result<usize> {
        self.timer.ack()?;
        // First 8 bytes carry the running sample count, the rest a pattern
        // derived from it so every buffer is distinguishable.
        if self.data.len() >= 8 {
            self.data[..8].copy_from_slice(&self.counter.to_le_bytes());
            for (i, byte) in self.data[8..].iter_mut().enumerate() {
                *byte = (self.counter as usize).wrapping_add(i) as u8;
            }
        } else {
            for (i, byte) in self.data.iter_mut().enumerate() {
                *byte = (self.counter as usize).wrapping_add(i) as u8;
            }
        }
        self.counter = self.counter.wrapping_add(self.samples);
        if let Some(capture) = &self.capture {
            capture.lock().unwrap().filled.push(self.data.clone());
        }
        Ok(self.data.len())
    }

    fn push(&mut self) -> io::Result<usize> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "capture buffers cannot be pushed",
        ))
    }
}

struct SimTxBuffer {
    ready: Waker,
    data: Vec<u8>,
    step: usize,
    capture: Option<Arc<Mutex<Capture>>>,
}

impl DmaBuffer for SimTxBuffer {
    fn poll_fd(&self) -> RawFd {
        self.ready.as_raw_fd()
    }

    fn step(&self) -> usize {
        self.step
    }

    fn bytes(&mut self) -> &mut [u8] {
        &mut self.data
    }

    fn refill(&mut self) -> io::Result<usize> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "playback buffers cannot be refilled",
        ))
    }

    fn push(&mut self) -> io::Result<usize> {
        if let Some(capture) = &self.capture {
            capture.lock().unwrap().pushed.push(self.data.clone());
        }
        Ok(self.data.len())
    }
}
