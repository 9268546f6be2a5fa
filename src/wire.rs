//! Wire format shared by the control and data channels.
//!
//! Both channels carry packed little-endian records guarded by the same
//! magic word. Control requests are validated by exact size per command;
//! data datagrams carry a fixed 16 byte header followed by a slice of one
//! DMA buffer.

use std::io;

/// Most basic protection against stray packets, `"PLTO"` when viewed as
/// little-endian bytes.
pub const MAGIC: u32 = 0x4F54_4C50;

/// Default UDP port for the control channel (IIOD + 1).
pub const CONTROL_PORT: u16 = 30432;
/// Default UDP port for the data channel (IIOD + 2).
pub const DATA_PORT: u16 = 30433;

/// Size of the header carried by every data datagram.
pub const DATA_HEADER_LEN: usize = 16;

const CMD_START_TX: u32 = 0;
const CMD_START_RX: u32 = 1;
const CMD_STOP_TX: u32 = 2;
const CMD_STOP_RX: u32 = 3;

const CONTROL_HEADER_LEN: usize = 8;
const START_TX_LEN: usize = CONTROL_HEADER_LEN + 4 + 1 + 4;
const START_RX_LEN: usize = CONTROL_HEADER_LEN + 2 + 4 + 1 + 4 + 2;

/// Parameters of a TX stream (host to radio).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StartTx {
    /// Bitmask of enabled channels.
    pub channels: u32,
    /// First 8 bytes of every reassembled buffer hold the sequence number.
    pub timestamping: bool,
    /// Buffer size in samples, including the timestamp slot.
    pub buffer_samples: u32,
}

/// Parameters of an RX stream (radio to host).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StartRx {
    /// Port the client listens on; its IP is taken from the datagram source
    /// so the client can sit behind a NAT.
    pub data_port: u16,
    /// Bitmask of enabled channels.
    pub channels: u32,
    /// First 8 bytes of every captured buffer hold the sequence number.
    pub timestamping: bool,
    /// Buffer size in samples, including the timestamp slot.
    pub buffer_samples: u32,
    /// UDP datagram size, header included. Typically 1472, up to 8972 with
    /// jumbo frames.
    pub packet_size: u16,
}

/// A single control-channel request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlRequest {
    StartTx(StartTx),
    StartRx(StartRx),
    StopTx,
    StopRx,
}

impl ControlRequest {
    /// Parses one control datagram.
    ///
    /// Short datagrams, a bad magic word, an unknown command and a payload
    /// whose size does not exactly match the command are all rejected; the
    /// caller logs and discards without any state change.
    pub fn parse(buf: &[u8]) -> io::Result<ControlRequest> {
        if buf.len() < CONTROL_HEADER_LEN {
            return Err(invalid(format!("short control datagram ({} bytes)", buf.len())));
        }
        let magic = read_u32(buf, 0);
        if magic != MAGIC {
            return Err(invalid(format!("bad control magic {magic:#010x}")));
        }
        let cmd = read_u32(buf, 4);
        match cmd {
            CMD_START_TX => {
                if buf.len() != START_TX_LEN {
                    return Err(invalid(format!(
                        "start tx request has {} bytes, expected {START_TX_LEN}",
                        buf.len()
                    )));
                }
                Ok(ControlRequest::StartTx(StartTx {
                    channels: read_u32(buf, 8),
                    timestamping: buf[12] != 0,
                    buffer_samples: read_u32(buf, 13),
                }))
            }
            CMD_START_RX => {
                if buf.len() != START_RX_LEN {
                    return Err(invalid(format!(
                        "start rx request has {} bytes, expected {START_RX_LEN}",
                        buf.len()
                    )));
                }
                Ok(ControlRequest::StartRx(StartRx {
                    data_port: read_u16(buf, 8),
                    channels: read_u32(buf, 10),
                    timestamping: buf[14] != 0,
                    buffer_samples: read_u32(buf, 15),
                    packet_size: read_u16(buf, 19),
                }))
            }
            CMD_STOP_TX => {
                if buf.len() != CONTROL_HEADER_LEN {
                    return Err(invalid("stop tx request carries a payload"));
                }
                Ok(ControlRequest::StopTx)
            }
            CMD_STOP_RX => {
                if buf.len() != CONTROL_HEADER_LEN {
                    return Err(invalid("stop rx request carries a payload"));
                }
                Ok(ControlRequest::StopRx)
            }
            cmd => Err(invalid(format!("unknown control command {cmd}"))),
        }
    }

    /// Encodes the request as a control datagram. Used by client tooling and
    /// the test suite; the bridge itself only parses.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(START_RX_LEN);
        buf.extend_from_slice(&MAGIC.to_le_bytes());
        match self {
            ControlRequest::StartTx(req) => {
                buf.extend_from_slice(&CMD_START_TX.to_le_bytes());
                buf.extend_from_slice(&req.channels.to_le_bytes());
                buf.push(req.timestamping as u8);
                buf.extend_from_slice(&req.buffer_samples.to_le_bytes());
            }
            ControlRequest::StartRx(req) => {
                buf.extend_from_slice(&CMD_START_RX.to_le_bytes());
                buf.extend_from_slice(&req.data_port.to_le_bytes());
                buf.extend_from_slice(&req.channels.to_le_bytes());
                buf.push(req.timestamping as u8);
                buf.extend_from_slice(&req.buffer_samples.to_le_bytes());
                buf.extend_from_slice(&req.packet_size.to_le_bytes());
            }
            ControlRequest::StopTx => buf.extend_from_slice(&CMD_STOP_TX.to_le_bytes()),
            ControlRequest::StopRx => buf.extend_from_slice(&CMD_STOP_RX.to_le_bytes()),
        }
        buf
    }
}

/// Header carried by every data datagram.
///
/// All blocks of one buffer share `block_count` and `seqno`; `block_index`
/// runs `0..block_count` in emission order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DataHeader {
    /// Position of this block within its buffer, 0-based.
    pub block_index: u8,
    /// Total number of blocks for this buffer.
    pub block_count: u8,
    /// Sequence number of the buffer: an absolute sample count when
    /// timestamping, a locally generated counter otherwise.
    pub seqno: u64,
}

impl DataHeader {
    /// Parses the leading header of a data datagram. `None` means a short
    /// datagram or a bad magic word; such traffic is dropped silently.
    pub fn parse(buf: &[u8]) -> Option<DataHeader> {
        if buf.len() < DATA_HEADER_LEN || read_u32(buf, 0) != MAGIC {
            return None;
        }
        Some(DataHeader {
            block_index: buf[4],
            block_count: buf[5],
            seqno: read_u64(buf, 8),
        })
    }

    pub fn encode(&self) -> [u8; DATA_HEADER_LEN] {
        let mut buf = [0; DATA_HEADER_LEN];
        buf[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        buf[4] = self.block_index;
        buf[5] = self.block_count;
        // buf[6..8] reserved, zero.
        Self::patch_seqno(&mut buf, self.seqno);
        buf
    }

    /// Rewrites only the sequence-number field of an encoded header. The RX
    /// send plan patches its pre-built headers with this per transmission.
    pub fn patch_seqno(buf: &mut [u8; DATA_HEADER_LEN], seqno: u64) {
        buf[8..16].copy_from_slice(&seqno.to_le_bytes());
    }
}

fn invalid(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}

fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(bytes)
}
