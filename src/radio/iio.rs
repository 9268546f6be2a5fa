//! libiio-backed radio, enabled by the `iio` cargo feature.
//!
//! A thin binding over the system libiio: open the local context, find the
//! streaming device, disable every channel, enable the masked ones, create a
//! non-cyclic buffer and expose its poll fd, stride and backing region. One
//! context is opened per stream and torn down with it.

use std::ffi::CString;
use std::io;
use std::os::fd::RawFd;
use std::slice;

use log::debug;

use crate::radio::{Direction, DmaBuffer, Radio, MAX_CHANNELS};

mod ffi {
    #![allow(non_camel_case_types)]

    use std::os::raw::{c_char, c_int, c_uint};

    #[repr(C)]
    pub struct iio_context {
        _opaque: [u8; 0],
    }
    #[repr(C)]
    pub struct iio_device {
        _opaque: [u8; 0],
    }
    #[repr(C)]
    pub struct iio_channel {
        _opaque: [u8; 0],
    }
    #[repr(C)]
    pub struct iio_buffer {
        _opaque: [u8; 0],
    }

    #[link(name = "iio")]
    extern "C" {
        pub fn iio_create_local_context() -> *mut iio_context;
        pub fn iio_context_destroy(ctx: *mut iio_context);
        pub fn iio_context_find_device(
            ctx: *const iio_context,
            name: *const c_char,
        ) -> *mut iio_device;
        pub fn iio_device_get_channels_count(dev: *const iio_device) -> c_uint;
        pub fn iio_device_get_channel(dev: *const iio_device, index: c_uint) -> *mut iio_channel;
        pub fn iio_channel_enable(chn: *mut iio_channel);
        pub fn iio_channel_disable(chn: *mut iio_channel);
        pub fn iio_device_create_buffer(
            dev: *const iio_device,
            samples_count: usize,
            cyclic: bool,
        ) -> *mut iio_buffer;
        pub fn iio_buffer_destroy(buf: *mut iio_buffer);
        pub fn iio_buffer_get_poll_fd(buf: *mut iio_buffer) -> c_int;
        pub fn iio_buffer_step(buf: *const iio_buffer) -> isize;
        pub fn iio_buffer_start(buf: *const iio_buffer) -> *mut std::os::raw::c_void;
        pub fn iio_buffer_refill(buf: *mut iio_buffer) -> isize;
        pub fn iio_buffer_push(buf: *mut iio_buffer) -> isize;
    }
}

/// DMA-buffer provider bound to the local IIO context.
#[derive(Clone, Copy, Debug, Default)]
pub struct IioRadio;

impl IioRadio {
    pub fn new() -> IioRadio {
        IioRadio
    }
}

impl Radio for IioRadio {
    fn open(
        &self,
        direction: Direction,
        channels: u32,
        samples: usize,
    ) -> io::Result<Box<dyn DmaBuffer>> {
        if channels == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "channel mask selects no channels",
            ));
        }

        let ctx = unsafe { ffi::iio_create_local_context() };
        if ctx.is_null() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "failed to open local iio context",
            ));
        }
        // From here on the context must be destroyed on every error path.
        let stream = unsafe { open_stream(ctx, direction, channels, samples) };
        match stream {
            Ok(stream) => Ok(Box::new(stream)),
            Err(err) => {
                unsafe { ffi::iio_context_destroy(ctx) };
                Err(err)
            }
        }
    }
}

/// SAFETY: callers own `ctx`; on error the caller destroys it.
unsafe fn open_stream(
    ctx: *mut ffi::iio_context,
    direction: Direction,
    channels: u32,
    samples: usize,
) -> io::Result<IioStream> {
    let name = CString::new(direction.device()).expect("device names have no NUL");
    let device = ffi::iio_context_find_device(ctx, name.as_ptr());
    if device.is_null() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("iio device {} not found", direction.device()),
        ));
    }

    let present = ffi::iio_device_get_channels_count(device);
    for index in 0..present {
        let channel = ffi::iio_device_get_channel(device, index);
        if !channel.is_null() {
            ffi::iio_channel_disable(channel);
        }
    }
    for index in 0..MAX_CHANNELS {
        if channels & (1 << index) == 0 {
            continue;
        }
        let channel = ffi::iio_device_get_channel(device, index);
        if channel.is_null() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("iio channel {index} not found on {}", direction.device()),
            ));
        }
        ffi::iio_channel_enable(channel);
    }

    let buffer = ffi::iio_device_create_buffer(device, samples, false);
    if buffer.is_null() {
        return Err(io::Error::new(
            io::ErrorKind::OutOfMemory,
            format!("failed to create iio buffer for {samples} samples"),
        ));
    }

    let poll_fd = ffi::iio_buffer_get_poll_fd(buffer);
    if poll_fd < 0 {
        ffi::iio_buffer_destroy(buffer);
        return Err(io::Error::from_raw_os_error(-poll_fd));
    }
    let step = ffi::iio_buffer_step(buffer);
    if step <= 0 {
        ffi::iio_buffer_destroy(buffer);
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "iio reported a non-positive sample stride",
        ));
    }
    let step = step as usize;

    debug!(
        "opened {} with stride {step}, {samples} samples",
        direction.device()
    );
    Ok(IioStream {
        ctx,
        buffer,
        poll_fd,
        step,
        len: samples * step,
    })
}

struct IioStream {
    ctx: *mut ffi::iio_context,
    buffer: *mut ffi::iio_buffer,
    poll_fd: RawFd,
    step: usize,
    len: usize,
}

// SAFETY: the stream is used from exactly one worker thread at a time; the
// supervisor never touches it after the hand-off.
unsafe impl Send for IioStream {}

impl IioStream {
    fn transfer(&mut self, nbytes: isize) -> io::Result<usize> {
        if nbytes < 0 {
            return Err(io::Error::from_raw_os_error((-nbytes) as i32));
        }
        Ok(nbytes as usize)
    }
}

impl DmaBuffer for IioStream {
    fn poll_fd(&self) -> RawFd {
        self.poll_fd
    }

    fn step(&self) -> usize {
        self.step
    }

    fn bytes(&mut self) -> &mut [u8] {
        // SAFETY: libiio guarantees `start` points at `len` bytes for the
        // lifetime of the buffer.
        unsafe { slice::from_raw_parts_mut(ffi::iio_buffer_start(self.buffer) as *mut u8, self.len) }
    }

    fn refill(&mut self) -> io::Result<usize> {
        let nbytes = unsafe { ffi::iio_buffer_refill(self.buffer) };
        self.transfer(nbytes)
    }

    fn push(&mut self) -> io::Result<usize> {
        let nbytes = unsafe { ffi::iio_buffer_push(self.buffer) };
        self.transfer(nbytes)
    }
}

impl Drop for IioStream {
    fn drop(&mut self) {
        unsafe {
            ffi::iio_buffer_destroy(self.buffer);
            ffi::iio_context_destroy(self.ctx);
        }
    }
}
