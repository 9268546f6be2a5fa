use std::io;
use std::mem;
use std::process::ExitCode;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use log::{error, info};

use sdr_ip_bridge::radio::Radio;
use sdr_ip_bridge::supervisor::{Config, Supervisor};

/// Bridges IQ sample buffers between an IIO SDR front-end and a UDP peer.
#[derive(Debug, Parser)]
#[command(name = "sdr-ip-bridge", version, about)]
struct Options {
    /// Enable verbose per-component logging.
    #[arg(short = 'd', long)]
    debug: bool,
}

/// Flipped by the signal handler; polled by the supervisor between waits.
static KEEP_RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn handle_signal(_signum: libc::c_int) {
    KEEP_RUNNING.store(false, Ordering::Relaxed);
}

/// Routes SIGINT and SIGTERM to `handle_signal` on this thread. Workers are
/// spawned with all signals masked, so delivery stays here.
fn install_signal_handlers() -> io::Result<()> {
    // SAFETY: the handler only touches an atomic, which is async-signal-safe.
    unsafe {
        let mut action: libc::sigaction = mem::zeroed();
        action.sa_sigaction = handle_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
        libc::sigemptyset(&mut action.sa_mask);
        for signal in [libc::SIGINT, libc::SIGTERM] {
            if libc::sigaction(signal, &action, ptr::null_mut()) != 0 {
                return Err(io::Error::last_os_error());
            }
        }
    }
    Ok(())
}

#[cfg(feature = "iio")]
fn radio() -> Arc<dyn Radio> {
    Arc::new(sdr_ip_bridge::radio::iio::IioRadio::new())
}

#[cfg(not(feature = "iio"))]
fn radio() -> Arc<dyn Radio> {
    Arc::new(sdr_ip_bridge::radio::sim::SimRadio::new())
}

fn main() -> ExitCode {
    let options = match Options::try_parse() {
        Ok(options) => options,
        // Help and version go to stdout and exit 0; a bad argument prints
        // the error plus usage to stderr and exits 1.
        Err(err) => {
            let failure = err.use_stderr();
            let _ = err.print();
            return if failure {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    let default_filter = if options.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    if let Err(err) = install_signal_handlers() {
        error!("failed to install signal handlers: {err}");
        return ExitCode::FAILURE;
    }

    let config = Config::default();
    let mut supervisor = match Supervisor::new(config, radio()) {
        Ok(supervisor) => supervisor,
        Err(err) => {
            error!("failed to start: {err}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        "ready: control port {}, data port {}",
        config.control_port, config.data_port
    );
    match supervisor.run(&KEEP_RUNNING) {
        Ok(()) => {
            info!("bye");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("supervisor failed: {err}");
            ExitCode::FAILURE
        }
    }
}
