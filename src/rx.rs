//! RX pipeline: radio to host.
//!
//! One worker thread per stream. The loop waits for the DMA buffer to become
//! ready, refills it, then sends the whole buffer as a train of block-framed
//! datagrams with a single `sendmmsg`. The scatter/gather plan (one message
//! per block, two iovecs per message) is built once at start; only the
//! sequence number and the payload base are patched per transmission, which
//! is what keeps the pipeline at line rate with one syscall per buffer.

use std::io;
use std::mem;
use std::net::{SocketAddr, UdpSocket};
use std::os::fd::{AsRawFd, RawFd};
use std::ptr;
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
const DMA: Token = Token(1);
const STATS: Token = Token(2);

/// How long one loop iteration may block before re-checking `keep_running`.
const POLL_TIMEOUT: Duration = Duration::from_secs(30);

/// Stream parameters, fixed for the lifetime of one worker.
#[derive(Clone, Copy, Debug)]
pub struct RxParams {
    /// Bitmask of enabled channels.
    pub channels: u32,
    /// Recover the sequence number from the first 8 bytes of each buffer.
    pub timestamping: bool,
    /// DMA buffer size in samples, timestamp slot included.
    pub buffer_samples: usize,
    /// Datagram size, header included.
    pub packet_size: usize,
    /// Destination for the datagram train.
    pub peer: SocketAddr,
}

/// Everything a worker thread owns.
pub struct RxArgs {
    /// Clone of the supervisor's data socket.
    pub socket: UdpSocket,
    pub radio: Arc<dyn Radio>,
    pub cancel: Arc<Waker>,
    pub params: RxParams,
    /// CPU this worker pins itself to.
    pub cpu: usize,
    /// Interval between statistics reports.
    pub stats_period: Duration,
}

/// Thread entry point. Failures are logged; the supervisor learns the worker
/// stopped when it joins the thread.
pub fn run(args: RxArgs) {
    debug!("worker enter");
    if let Err(err) = stream(args) {
        error!("worker failed: {err}");
    }
    debug!("worker exit");
}

fn stream(args: RxArgs) -> io::Result<()> {
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
        .open(Direction::Rx, params.channels, params.buffer_samples)?;
    selector.register(dma.poll_fd(), DMA)?;

    let step = dma.step();
    let buffer_bytes = params.buffer_samples * step;
    debug!(
        "streaming {} samples of stride {step} to {} in {} byte packets",
        params.buffer_samples, params.peer, params.packet_size
    );

    let useful_bytes = if params.timestamping {
        buffer_bytes.checked_sub(8).filter(|&n| n > 0).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "buffer too small to carry a timestamp",
            )
        })?
    } else {
        buffer_bytes
    };
    let mut plan = SendPlan::new(params.peer, params.packet_size, useful_bytes)?;

    let timer = PeriodicTimer::new(args.stats_period)?;
    selector.register(timer.as_raw_fd(), STATS)?;
    let mut stats = RxStats::new();

    let mut events = Events::with_capacity(Events::BATCH);
    let mut seqno: u64 = 0;
    let mut keep_running = true;
    while keep_running {
        selector.select(&mut events, Some(POLL_TIMEOUT))?;
        for token in events.iter() {
            match token {
                CANCEL => {
                    debug!("stop request received");
                    keep_running = false;
                }
                DMA => forward_buffer(
                    dma.as_mut(),
                    &mut plan,
                    args.socket.as_raw_fd(),
                    buffer_bytes,
                    params,
                    &mut seqno,
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

/// One DMA buffer: refill, recover or assign the sequence number, patch the
/// plan and send every block in one batch.
fn forward_buffer(
    dma: &mut dyn DmaBuffer,
    plan: &mut SendPlan,
    socket: RawFd,
    buffer_bytes: usize,
    params: RxParams,
    seqno: &mut u64,
    stats: &mut RxStats,
) -> io::Result<()> {
    stats.period.update();
    stats.duration.start();
    let nbytes = dma.refill()?;
    if nbytes != buffer_bytes {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("buffer read returned {nbytes} bytes, expected {buffer_bytes}"),
        ));
    }
    stats.duration.update();
    stats.period.start();

    let buffer = dma.bytes();
    let payload = if params.timestamping {
        // The radio fabric wrote the absolute sample count into the
        // timestamp slot; it overrides the locally generated sequence.
        let mut stamp = [0; 8];
        stamp.copy_from_slice(&buffer[..8]);
        *seqno = u64::from_le_bytes(stamp);
        &buffer[8..]
    } else {
        &buffer[..]
    };

    match plan.transmit(socket, payload, *seqno) {
        Ok(sent) if sent == plan.block_count() => {}
        Ok(sent) => {
            trace!("short send: {sent} of {} blocks", plan.block_count());
            stats.overflows += 1;
        }
        Err(err) => {
            trace!("send failed: {err}");
            stats.overflows += 1;
        }
    }

    // The timestamp slot counts as samples too, so the next buffer starts
    // one whole buffer later.
    *seqno = seqno.wrapping_add(params.buffer_samples as u64);
    Ok(())
}

/// Block geometry of one buffer transmission.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct BlockLayout {
    count: usize,
    /// Payload bytes in every block but the last.
    full: usize,
    /// Payload bytes in the final block.
    last: usize,
}

impl BlockLayout {
    fn new(packet_size: usize, useful_bytes: usize) -> io::Result<BlockLayout> {
        let full = packet_size
            .checked_sub(DATA_HEADER_LEN)
            .filter(|&p| p > 0)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("packet size {packet_size} leaves no room for payload"),
                )
            })?;
        if useful_bytes == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "buffer carries no payload",
            ));
        }
        let count = useful_bytes.div_ceil(full);
        if count > u8::MAX as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("buffer would fragment into {count} blocks, the header field holds 255"),
            ));
        }
        // An exact multiple means the final block is full, never empty.
        let last = match useful_bytes % full {
            0 => full,
            rem => rem,
        };
        Ok(BlockLayout { count, full, last })
    }

    fn payload_len(&self, index: usize) -> usize {
        if index + 1 == self.count {
            self.last
        } else {
            self.full
        }
    }
}

/// Pre-built scatter/gather send of one buffer: `count` messages, each a
/// header iovec plus a payload iovec, all flushed with a single `sendmmsg`.
struct SendPlan {
    layout: BlockLayout,
    headers: Vec<[u8; DATA_HEADER_LEN]>,
    iovecs: Vec<[libc::iovec; 2]>,
    messages: Vec<libc::mmsghdr>,
    addr: libc::sockaddr_storage,
    addr_len: libc::socklen_t,
}

// SAFETY: the raw pointers inside `messages` are re-derived from the owned
// vectors on every `transmit`; nothing dangles across calls.
unsafe impl Send for SendPlan {}

impl SendPlan {
    fn new(peer: SocketAddr, packet_size: usize, useful_bytes: usize) -> io::Result<SendPlan> {
        let layout = BlockLayout::new(packet_size, useful_bytes)?;
        let headers = (0..layout.count)
            .map(|index| {
                DataHeader {
                    block_index: index as u8,
                    block_count: layout.count as u8,
                    seqno: 0,
                }
                .encode()
            })
            .collect();
        let (addr, addr_len) = socket_addr(&peer);
        Ok(SendPlan {
            layout,
            headers,
            // SAFETY: both are plain C records, fully re-initialised before
            // each send.
            iovecs: vec![unsafe { mem::zeroed() }; layout.count],
            messages: vec![unsafe { mem::zeroed() }; layout.count],
            addr,
            addr_len,
        })
    }

    fn block_count(&self) -> usize {
        self.layout.count
    }

    /// Patches the per-transmission fields and flushes the whole train.
    /// Returns the number of messages the kernel accepted.
    fn transmit(&mut self, socket: RawFd, payload: &[u8], seqno: u64) -> io::Result<usize> {
        debug_assert_eq!(payload.len(), (self.layout.count - 1) * self.layout.full + self.layout.last);

        let mut offset = 0;
        for index in 0..self.layout.count {
            let len = self.layout.payload_len(index);
            DataHeader::patch_seqno(&mut self.headers[index], seqno);
            self.iovecs[index][0] = libc::iovec {
                iov_base: self.headers[index].as_mut_ptr() as *mut libc::c_void,
                iov_len: DATA_HEADER_LEN,
            };
            // `sendmmsg` never writes through the payload iovec; the cast
            // only satisfies the C signature.
            self.iovecs[index][1] = libc::iovec {
                iov_base: payload[offset..].as_ptr() as *mut libc::c_void,
                iov_len: len,
            };
            let message = &mut self.messages[index];
            message.msg_hdr.msg_name = &mut self.addr as *mut _ as *mut libc::c_void;
            message.msg_hdr.msg_namelen = self.addr_len;
            message.msg_hdr.msg_iov = self.iovecs[index].as_mut_ptr();
            message.msg_hdr.msg_iovlen = 2;
            message.msg_hdr.msg_control = ptr::null_mut();
            message.msg_hdr.msg_controllen = 0;
            message.msg_hdr.msg_flags = 0;
            message.msg_len = 0;
            offset += len;
        }

        let sent = syscall!(sendmmsg(
            socket,
            self.messages.as_mut_ptr(),
            self.layout.count as libc::c_uint,
            0
        ))?;
        Ok(sent as usize)
    }
}

fn socket_addr(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    // SAFETY: `sockaddr_storage` is large enough for both variants and is
    // only read through the matching sockaddr type.
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    match addr {
        SocketAddr::V4(addr) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: addr.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(addr.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe { ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin) };
            (storage, mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(addr) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: addr.port().to_be(),
                sin6_flowinfo: addr.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: addr.ip().octets(),
                },
                sin6_scope_id: addr.scope_id(),
            };
            unsafe { ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6) };
            (storage, mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}

struct RxStats {
    /// Time between successive DMA readiness events.
    period: TimeStats,
    /// Time spent inside the blocking refill.
    duration: TimeStats,
    overflows: u32,
}

impl RxStats {
    fn new() -> RxStats {
        RxStats {
            period: TimeStats::new(),
            duration: TimeStats::new(),
            overflows: 0,
        }
    }

    fn report(&mut self) {
        if self.period.count() > 0 {
            info!(
                "read period min {} max {} avg {} us",
                self.period.min(),
                self.period.max(),
                self.period.average()
            );
        }
        if self.duration.count() > 0 {
            info!(
                "read duration min {} max {} avg {} us",
                self.duration.min(),
                self.duration.max(),
                self.duration.average()
            );
        }
        if self.overflows > 0 {
            info!("{} overflows in the last period", self.overflows);
        }
        self.period.reset();
        self.duration.reset();
        self.overflows = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_splits_an_uneven_buffer() {
        // Two 16-bit channels, 1024 samples, 1472 byte packets.
        let layout = BlockLayout::new(1472, 4096).unwrap();
        assert_eq!(
            layout,
            BlockLayout {
                count: 3,
                full: 1456,
                last: 184,
            }
        );
        assert_eq!(layout.payload_len(0), 1456);
        assert_eq!(layout.payload_len(2), 184);
    }

    #[test]
    fn exact_multiple_keeps_the_final_block_full() {
        let layout = BlockLayout::new(144, 512).unwrap();
        assert_eq!(
            layout,
            BlockLayout {
                count: 4,
                full: 128,
                last: 128,
            }
        );
    }

    #[test]
    fn one_byte_payloads_still_work() {
        let layout = BlockLayout::new(DATA_HEADER_LEN + 1, 5).unwrap();
        assert_eq!(layout.count, 5);
        assert_eq!(layout.full, 1);
        assert_eq!(layout.last, 1);
    }

    #[test]
    fn degenerate_geometry_is_rejected() {
        assert!(BlockLayout::new(DATA_HEADER_LEN, 512).is_err());
        assert!(BlockLayout::new(1472, 0).is_err());
        // 256 one-byte blocks exceed the u8 block count.
        assert!(BlockLayout::new(DATA_HEADER_LEN + 1, 256).is_err());
    }

    #[test]
    fn transmit_emits_one_datagram_per_block() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_secs(1)))
            .unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();

        let payload: Vec<u8> = (0..100u8).collect();
        let mut plan = SendPlan::new(receiver.local_addr().unwrap(), 16 + 40, payload.len()).unwrap();
        assert_eq!(plan.block_count(), 3);
        let sent = plan.transmit(sender.as_raw_fd(), &payload, 7).unwrap();
        assert_eq!(sent, 3);

        let mut reassembled = Vec::new();
        let mut buf = [0u8; 64];
        for index in 0..3 {
            let n = receiver.recv(&mut buf).unwrap();
            let header = DataHeader::parse(&buf[..n]).unwrap();
            assert_eq!(header.block_index, index as u8);
            assert_eq!(header.block_count, 3);
            assert_eq!(header.seqno, 7);
            reassembled.extend_from_slice(&buf[DATA_HEADER_LEN..n]);
        }
        assert_eq!(reassembled, payload);
    }
}
