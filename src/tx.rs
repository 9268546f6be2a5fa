//! TX pipeline: host to radio.
//!
//! One worker thread per stream. The loop waits for the data socket, then
//! drains it aggressively, receiving each datagram scatter/gather style:
//! the header lands in a scratch record, the payload lands directly in the
//! DMA buffer at the reassembly offset, so accepted data is never copied in
//! userspace. When a buffer completes it is pushed (blocking) and the loop
//! yields back to the selector so cancellation can preempt a saturated
//! stream.

use std::io;
use std::mem;
use std::net::UdpSocket;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, trace, warn};

use crate::poll::{Events, Selector, Token};
use crate::radio::{Direction, DmaBuffer, Radio};
use crate::rt;
use crate::stats::{PeriodicTimer, TimeStats};
use crate::waker::Waker;
use crate::wire::{DataHeader, DATA_HEADER_LEN};

const CANCEL: Token = Token(0);
const SOCKET: Token = Token(1);
const STATS: Token = Token(2);

/// How long one loop iteration may block before re-checking `keep_running`.
const POLL_TIMEOUT: Duration = Duration::from_secs(30);

/// Stream parameters, fixed for the lifetime of one worker.
#[derive(Clone, Copy, Debug)]
pub struct TxParams {
    /// Bitmask of enabled channels.
    pub channels: u32,
    /// First 8 bytes of every buffer carry the sequence number end-to-end.
    pub timestamping: bool,
    /// DMA buffer size in samples, timestamp slot included.
    pub buffer_samples: usize,
}

/// Everything a worker thread owns.
pub struct TxArgs {
    /// Clone of the supervisor's data socket.
    pub socket: UdpSocket,
    pub radio: Arc<dyn Radio>,
    pub cancel: Arc<Waker>,
    pub params: TxParams,
    /// CPU this worker pins itself to.
    pub cpu: usize,
    /// Interval between statistics reports.
    pub stats_period: Duration,
}

/// Thread entry point. Failures are logged; the supervisor learns the worker
/// stopped when it joins the thread.
pub fn run(args: TxArgs) {
    debug!("worker enter");
    if let Err(err) = stream(args) {
        error!("worker failed: {err}");
    }
    debug!("worker exit");
}

fn stream(args: TxArgs) -> io::Result<()> {
    if let Err(err) = rt::set_realtime_priority() {
        warn!("failed to set realtime priority: {err}");
    }
    if let Err(err) = rt::pin_to_cpu(args.cpu) {
        warn!("failed to pin to cpu {}: {err}", args.cpu);
    }

    let selector = Selector::new()?;
    selector.register(args.cancel.as_raw_fd(), CANCEL)?;

    let params = args.params;
    let mut dma = args
        .radio
        .open(Direction::Tx, params.channels, params.buffer_samples)?;

    let step = dma.step();
    let buffer_bytes = params.buffer_samples * step;
    if params.timestamping && buffer_bytes <= 8 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "buffer too small to carry a timestamp",
        ));
    }
    // Samples actually consumed per pushed buffer; the timestamp slot does
    // not reach the DAC.
    let samples_per_buffer = if params.timestamping {
        params.buffer_samples as u64 - (8 / step) as u64
    } else {
        params.buffer_samples as u64
    };
    debug!(
        "reassembling {} samples of stride {step} per buffer",
        params.buffer_samples
    );

    selector.register(args.socket.as_raw_fd(), SOCKET)?;

    let timer = PeriodicTimer::new(args.stats_period)?;
    selector.register(timer.as_raw_fd(), STATS)?;
    let mut stats = TxStats::new();

    let mut reassembly = Reassembly {
        timestamping: params.timestamping,
        buffer_bytes,
        samples_per_buffer,
        used: 0,
        block_index: 0,
        block_count: 0,
        seqno: 0,
    };

    let mut events = Events::with_capacity(Events::BATCH);
    let mut keep_running = true;
    while keep_running {
        selector.select(&mut events, Some(POLL_TIMEOUT))?;
        for token in events.iter() {
            match token {
                CANCEL => {
                    debug!("stop request received");
                    keep_running = false;
                }
                SOCKET => drain_socket(
                    args.socket.as_raw_fd(),
                    dma.as_mut(),
                    &mut reassembly,
                    &mut stats,
                )?,
                STATS => {
                    timer.ack()?;
                    stats.report();
                }
                Token(token) => debug!("spurious event for token {token}"),
            }
        }
    }
    Ok(())
}

/// Reassembly state for the buffer currently being filled.
///
/// While `used > 0` a reassembly is in progress and `block_count` and
/// `seqno` are latched; any mismatch discards the partial buffer and the
/// stream resynchronizes on the next block 0.
struct Reassembly {
    timestamping: bool,
    buffer_bytes: usize,
    samples_per_buffer: u64,
    /// Bytes committed into the current DMA buffer.
    used: usize,
    /// Next expected block.
    block_index: u8,
    /// Latched from block 0 of the current buffer.
    block_count: u8,
    /// Expected sequence number of the current buffer.
    seqno: u64,
}

/// Receives until the socket is exhausted or one whole buffer was pushed.
///
/// Breaking out after a push amortizes the wakeup cost over a full buffer
/// while still letting the cancellation signal in between buffers.
fn drain_socket(
    socket: RawFd,
    dma: &mut dyn DmaBuffer,
    reassembly: &mut Reassembly,
    stats: &mut TxStats,
) -> io::Result<()> {
    let mut scratch = [0u8; DATA_HEADER_LEN];
    loop {
        // Payload goes straight to where it would be committed; a datagram
        // that fails validation below is simply overwritten by the next one.
        let mut offset = reassembly.used;
        if reassembly.used == 0 && reassembly.timestamping {
            // Reserve the timestamp slot at the head of the buffer.
            offset += 8;
        }

        let buffer = dma.bytes();
        let nbytes = match receive(socket, &mut scratch, &mut buffer[offset..]) {
            Ok(nbytes) => nbytes,
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            // A receive failure other than running dry poisons the socket
            // for good; treat it as fatal rather than spinning on it.
            Err(err) => return Err(err),
        };

        let header = match DataHeader::parse(&scratch) {
            Some(header) if nbytes >= DATA_HEADER_LEN => header,
            // Wrong header size or bad magic, possibly a naughty network
            // application or an honest mistake.
            _ => continue,
        };
        let payload_len = nbytes - DATA_HEADER_LEN;

        // Discard anything older than the buffer in flight. Fragile against
        // time warps when the peer restamps from zero.
        if header.seqno < reassembly.seqno {
            trace!("drop stale seqno {} < {}", header.seqno, reassembly.seqno);
            stats.dropped += 1;
            continue;
        }

        if reassembly.used == 0 {
            // Only a sequence start may open a buffer.
            if header.block_index != 0 {
                trace!("drop mid-train block {} while idle", header.block_index);
                stats.dropped += 1;
                continue;
            }
            reassembly.block_index = 0;
            reassembly.block_count = header.block_count;
            if reassembly.timestamping {
                reassembly.seqno = header.seqno;
                buffer[..8].copy_from_slice(&header.seqno.to_le_bytes());
            }
        } else if header.block_index != reassembly.block_index
            || header.block_count != reassembly.block_count
            || header.seqno != reassembly.seqno
        {
            // Out of order or duplicate: the partial buffer is unusable.
            trace!(
                "reassembly mismatch: got block {}/{} seqno {}, expected {}/{} seqno {}",
                header.block_index,
                header.block_count,
                header.seqno,
                reassembly.block_index,
                reassembly.block_count,
                reassembly.seqno
            );
            stats.outoforder += 1;
            reassembly.used = 0;
            continue;
        }

        if reassembly.used == 0 && reassembly.timestamping {
            reassembly.used += 8;
        }
        reassembly.used += payload_len;
        reassembly.block_index = reassembly.block_index.wrapping_add(1);

        if reassembly.used == reassembly.buffer_bytes {
            stats.period.update();
            stats.duration.start();
            let pushed = dma.push()?;
            if pushed != reassembly.buffer_bytes {
                trace!("short push: {pushed} of {} bytes", reassembly.buffer_bytes);
                stats.overflows += 1;
            }
            stats.duration.update();
            stats.period.start();

            reassembly.used = 0;
            reassembly.seqno = reassembly.seqno.wrapping_add(reassembly.samples_per_buffer);
            return Ok(());
        }
    }
}

/// Scatter/gather receive: header into `scratch`, payload into `payload`.
fn receive(socket: RawFd, scratch: &mut [u8; DATA_HEADER_LEN], payload: &mut [u8]) -> io::Result<usize> {
    let mut iovecs = [
        libc::iovec {
            iov_base: scratch.as_mut_ptr() as *mut libc::c_void,
            iov_len: scratch.len(),
        },
        libc::iovec {
            iov_base: payload.as_mut_ptr() as *mut libc::c_void,
            iov_len: payload.len(),
        },
    ];
    // SAFETY: plain C record, fully initialised below.
    let mut message: libc::msghdr = unsafe { mem::zeroed() };
    message.msg_iov = iovecs.as_mut_ptr();
    message.msg_iovlen = 2;
    let nbytes = syscall!(recvmsg(socket, &mut message, 0))?;
    Ok(nbytes as usize)
}

struct TxStats {
    /// Time between successive buffer completions.
    period: TimeStats,
    /// Time spent inside the blocking push.
    duration: TimeStats,
    overflows: u32,
    dropped: u32,
    outoforder: u32,
}

impl TxStats {
    fn new() -> TxStats {
        TxStats {
            period: TimeStats::new(),
            duration: TimeStats::new(),
            overflows: 0,
            dropped: 0,
            outoforder: 0,
        }
    }

    fn report(&mut self) {
        if self.period.count() > 0 {
            info!(
                "write period min {} max {} avg {} us",
                self.period.min(),
                self.period.max(),
                self.period.average()
            );
        }
        if self.duration.count() > 0 {
            info!(
                "write duration min {} max {} avg {} us",
                self.duration.min(),
                self.duration.max(),
                self.duration.average()
            );
        }
        if self.overflows > 0 {
            info!("{} overflows in the last period", self.overflows);
        }
        if self.dropped > 0 {
            info!("{} dropped in the last period", self.dropped);
        }
        if self.outoforder > 0 {
            info!("{} out of order in the last period", self.outoforder);
        }
        self.period.reset();
        self.duration.reset();
        self.overflows = 0;
        self.dropped = 0;
        self.outoforder = 0;
    }
}
