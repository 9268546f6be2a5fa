//! Control plane: owns the sockets, starts and stops the workers.
//!
//! The supervisor runs its own event loop over the control socket. Each
//! control datagram either spawns or tears down a streaming worker; workers
//! run on their own threads and share nothing with the supervisor except
//! the start/stop handshake (an eventfd to cancel, a join to confirm).

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, warn};

use crate::poll::{Events, Selector, Token};
use crate::radio::Radio;
use crate::rt::SignalMask;
use crate::rx::{self, RxArgs, RxParams};
use crate::tx::{self, TxArgs, TxParams};
use crate::waker::Waker;
use crate::wire::{self, ControlRequest, StartRx, StartTx};

const CONTROL: Token = Token(0);

/// Largest control request plus slack; anything longer is rejected by the
/// exact-size validation anyway.
const CONTROL_BUF_LEN: usize = 64;

/// Supervisor configuration. The defaults match the wire protocol; tests
/// override the ports (0 picks an ephemeral port) and shorten the timeouts.
#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// Address both sockets bind to.
    pub bind_ip: IpAddr,
    pub control_port: u16,
    pub data_port: u16,
    /// Upper bound on one main-loop wait; the terminate flag is re-checked
    /// at least this often.
    pub poll_timeout: Duration,
    /// Interval between worker statistics reports.
    pub stats_period: Duration,
    /// CPU the RX worker pins itself to.
    pub rx_cpu: usize,
    /// CPU the TX worker pins itself to.
    pub tx_cpu: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            control_port: wire::CONTROL_PORT,
            data_port: wire::DATA_PORT,
            poll_timeout: Duration::from_secs(30),
            stats_period: Duration::from_secs(5),
            rx_cpu: 0,
            tx_cpu: 1,
        }
    }
}

/// One worker slot: the long-lived cancellation signal plus the handle of
/// the currently running thread, if any.
struct WorkerSlot {
    name: &'static str,
    cancel: Arc<Waker>,
    handle: Option<JoinHandle<()>>,
}

impl WorkerSlot {
    fn new(name: &'static str) -> io::Result<WorkerSlot> {
        Ok(WorkerSlot {
            name,
            cancel: Arc::new(Waker::new()?),
            handle: None,
        })
    }

    /// Signals the worker and joins it. Idempotent: a slot with no running
    /// worker is left untouched.
    fn stop(&mut self) -> io::Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        debug!("stopping {} worker", self.name);
        self.cancel.wake()?;
        handle
            .join()
            .map_err(|_| io::Error::other(format!("{} worker panicked", self.name)))?;
        // Rearm the signal for the next worker. A failure here is recovered
        // by the drain-on-wake fallback, so it is only worth a warning.
        if let Err(err) = self.cancel.drain() {
            warn!("failed to drain {} cancel signal: {err}", self.name);
        }
        debug!("stopped {} worker", self.name);
        Ok(())
    }
}

/// Owns the control and data sockets and the two worker slots.
pub struct Supervisor {
    config: Config,
    control: UdpSocket,
    data: UdpSocket,
    selector: Selector,
    radio: Arc<dyn Radio>,
    rx: WorkerSlot,
    tx: WorkerSlot,
}

impl Supervisor {
    pub fn new(config: Config, radio: Arc<dyn Radio>) -> io::Result<Supervisor> {
        let control = UdpSocket::bind((config.bind_ip, config.control_port))?;
        control.set_nonblocking(true)?;
        let data = UdpSocket::bind((config.bind_ip, config.data_port))?;
        data.set_nonblocking(true)?;

        let selector = Selector::new()?;
        selector.register(control.as_raw_fd(), CONTROL)?;

        Ok(Supervisor {
            config,
            control,
            data,
            selector,
            radio,
            rx: WorkerSlot::new("rx")?,
            tx: WorkerSlot::new("tx")?,
        })
    }

    /// Address of the control socket, after ephemeral port resolution.
    pub fn control_addr(&self) -> io::Result<SocketAddr> {
        self.control.local_addr()
    }

    /// Address of the data socket, after ephemeral port resolution.
    pub fn data_addr(&self) -> io::Result<SocketAddr> {
        self.data.local_addr()
    }

    /// Runs the control loop until `keep_running` clears, then stops both
    /// workers.
    pub fn run(&mut self, keep_running: &AtomicBool) -> io::Result<()> {
        debug!("enter main loop");
        let mut events = Events::with_capacity(Events::BATCH);
        while keep_running.load(Ordering::Relaxed) {
            self.selector
                .select(&mut events, Some(self.config.poll_timeout))?;
            for token in events.iter() {
                match token {
                    CONTROL => self.handle_control()?,
                    Token(token) => debug!("spurious event for token {token}"),
                }
            }
        }
        debug!("exit main loop");
        self.shutdown()
    }

    /// Stops both workers. Called on loop exit and by tests that drive the
    /// supervisor directly.
    pub fn shutdown(&mut self) -> io::Result<()> {
        self.rx.stop()?;
        self.tx.stop()
    }

    fn handle_control(&mut self) -> io::Result<()> {
        let mut buf = [0u8; CONTROL_BUF_LEN];
        let (nbytes, peer) = match self.control.recv_from(&mut buf) {
            Ok(received) => received,
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(err) => return Err(err),
        };
        let request = match ControlRequest::parse(&buf[..nbytes]) {
            Ok(request) => request,
            Err(err) => {
                warn!("discarding control datagram from {peer}: {err}");
                return Ok(());
            }
        };

        info!("control request from {peer}: {request:?}");
        match request {
            ControlRequest::StartTx(request) => self.start_tx(request),
            ControlRequest::StartRx(request) => self.start_rx(request, peer.ip()),
            ControlRequest::StopTx => self.tx.stop(),
            ControlRequest::StopRx => self.rx.stop(),
        }
    }

    fn start_rx(&mut self, request: StartRx, source: IpAddr) -> io::Result<()> {
        self.rx.stop()?;

        // The client's IP always comes from the datagram source, so a client
        // behind a NAT never needs to know its own address. Only the port is
        // taken from the payload.
        let peer = SocketAddr::new(source, request.data_port);
        let args = RxArgs {
            socket: self.data.try_clone()?,
            radio: Arc::clone(&self.radio),
            cancel: Arc::clone(&self.rx.cancel),
            params: RxParams {
                channels: request.channels,
                timestamping: request.timestamping,
                buffer_samples: request.buffer_samples as usize,
                packet_size: request.packet_size as usize,
                peer,
            },
            cpu: self.config.rx_cpu,
            stats_period: self.config.stats_period,
        };

        // Workers inherit the mask, so every signal keeps being delivered to
        // this thread only.
        let mask = SignalMask::block_all()?;
        let handle = thread::Builder::new()
            .name("sdr-rx".to_owned())
            .spawn(move || rx::run(args))?;
        drop(mask);

        self.rx.handle = Some(handle);
        Ok(())
    }

    fn start_tx(&mut self, request: StartTx) -> io::Result<()> {
        self.tx.stop()?;

        let args = TxArgs {
            socket: self.data.try_clone()?,
            radio: Arc::clone(&self.radio),
            cancel: Arc::clone(&self.tx.cancel),
            params: TxParams {
                channels: request.channels,
                timestamping: request.timestamping,
                buffer_samples: request.buffer_samples as usize,
            },
            cpu: self.config.tx_cpu,
            stats_period: self.config.stats_period,
        };

        let mask = SignalMask::block_all()?;
        let handle = thread::Builder::new()
            .name("sdr-tx".to_owned())
            .spawn(move || tx::run(args))?;
        drop(mask);

        self.tx.handle = Some(handle);
        Ok(())
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        // Leave no worker thread behind even when `run` never completed.
        if let Err(err) = self.shutdown() {
            warn!("shutdown on drop failed: {err}");
        }
    }
}
