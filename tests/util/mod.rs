//! Plumbing shared by the integration tests.

#![allow(dead_code)]

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use sdr_ip_bridge::radio::sim::SimRadio;
use sdr_ip_bridge::supervisor::{Config, Supervisor};
use sdr_ip_bridge::wire::{ControlRequest, DataHeader, DATA_HEADER_LEN};

pub fn init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

/// A bridge running on loopback with ephemeral ports and a software radio.
pub struct Bridge {
    pub control: SocketAddr,
    pub data: SocketAddr,
    keep_running: Arc<AtomicBool>,
    handle: Option<JoinHandle<io::Result<()>>>,
}

impl Bridge {
    pub fn start(radio: SimRadio) -> Bridge {
        init();
        let config = Config {
            bind_ip: "127.0.0.1".parse().unwrap(),
            control_port: 0,
            data_port: 0,
            poll_timeout: Duration::from_millis(20),
            stats_period: Duration::from_secs(1),
            ..Config::default()
        };
        let mut supervisor = Supervisor::new(config, Arc::new(radio)).unwrap();
        let control = supervisor.control_addr().unwrap();
        let data = supervisor.data_addr().unwrap();
        let keep_running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&keep_running);
        let handle = thread::spawn(move || supervisor.run(&flag));
        Bridge {
            control,
            data,
            keep_running,
            handle: Some(handle),
        }
    }

    /// Sends a control request from `socket`, whose source address is what
    /// an RX start binds the stream to.
    pub fn control_from(&self, socket: &UdpSocket, request: &ControlRequest) {
        socket.send_to(&request.encode(), self.control).unwrap();
    }

    /// Sends a control request from a throwaway socket.
    pub fn control(&self, request: &ControlRequest) {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        self.control_from(&socket, request);
    }

    /// Sends raw bytes to the control port.
    pub fn control_raw(&self, datagram: &[u8]) {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.send_to(datagram, self.control).unwrap();
    }

    pub fn stop(&mut self) -> io::Result<()> {
        self.keep_running.store(false, Ordering::Relaxed);
        self.handle.take().unwrap().join().unwrap()
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        if self.handle.is_some() {
            let _ = self.stop();
        }
    }
}

/// Binds a datagram receiver with a short read timeout.
pub fn receiver() -> UdpSocket {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    socket
}

/// One received data datagram, split into header and payload.
#[derive(Debug)]
pub struct Block {
    pub header: DataHeader,
    pub payload: Vec<u8>,
}

/// Receives a single data datagram.
pub fn recv_block(socket: &UdpSocket) -> Block {
    let mut buf = [0u8; 16 * 1024];
    let nbytes = socket.recv(&mut buf).expect("no datagram within timeout");
    let header = DataHeader::parse(&buf[..nbytes]).expect("stray datagram");
    Block {
        header,
        payload: buf[DATA_HEADER_LEN..nbytes].to_vec(),
    }
}

/// Receives one complete buffer train: skips until a block 0 arrives, then
/// collects the advertised number of blocks.
pub fn recv_train(socket: &UdpSocket) -> Vec<Block> {
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut train: Vec<Block> = Vec::new();
    while Instant::now() < deadline {
        let block = recv_block(socket);
        if block.header.block_index == 0 {
            train.clear();
            train.push(block);
        } else if !train.is_empty()
            && block.header.block_index as usize == train.len()
            && block.header.seqno == train[0].header.seqno
        {
            train.push(block);
        } else {
            train.clear();
        }
        if !train.is_empty() && train.len() == train[0].header.block_count as usize {
            return train;
        }
    }
    panic!("no complete train within deadline");
}

/// Drains everything queued on `socket`, returning the number of datagrams
/// discarded.
pub fn drain(socket: &UdpSocket) -> usize {
    socket
        .set_read_timeout(Some(Duration::from_millis(50)))
        .unwrap();
    let mut buf = [0u8; 16 * 1024];
    let mut count = 0;
    while socket.recv(&mut buf).is_ok() {
        count += 1;
    }
    socket
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    count
}

/// Builds one data datagram.
pub fn data_datagram(index: u8, count: u8, seqno: u64, payload: &[u8]) -> Vec<u8> {
    let mut datagram = DataHeader {
        block_index: index,
        block_count: count,
        seqno,
    }
    .encode()
    .to_vec();
    datagram.extend_from_slice(payload);
    datagram
}

/// Polls `condition` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}
