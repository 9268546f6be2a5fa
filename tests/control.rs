//! Control protocol and worker lifecycle, driven over real sockets.

use std::time::Duration;

use sdr_ip_bridge::radio::sim::SimRadio;
use sdr_ip_bridge::wire::{ControlRequest, StartRx, StartTx, MAGIC};

mod util;
use util::{drain, receiver, recv_train, wait_until, Bridge};

fn start_rx(data_port: u16) -> ControlRequest {
    ControlRequest::StartRx(StartRx {
        data_port,
        channels: 0x3,
        timestamping: false,
        buffer_samples: 256,
        packet_size: 128,
    })
}

#[test]
fn stop_without_a_running_worker_is_a_noop() {
    let mut bridge = Bridge::start(SimRadio::new().with_pace(Duration::from_millis(2)));

    bridge.control(&ControlRequest::StopRx);
    bridge.control(&ControlRequest::StopTx);
    bridge.control(&ControlRequest::StopRx);

    // The supervisor is still alive and serving requests.
    let client = receiver();
    let port = client.local_addr().unwrap().port();
    bridge.control_from(&client, &start_rx(port));
    recv_train(&client);

    bridge.stop().unwrap();
}

#[test]
fn stray_control_traffic_changes_nothing() {
    let mut bridge = Bridge::start(SimRadio::new().with_pace(Duration::from_millis(2)));

    // Short datagram, bad magic, unknown command, wrong exact size.
    bridge.control_raw(&[0x50, 0x4C]);
    bridge.control_raw(&[0xDE, 0xAD, 0xBE, 0xEF, 1, 0, 0, 0]);
    let mut unknown = ControlRequest::StopTx.encode();
    unknown[4] = 42;
    bridge.control_raw(&unknown);
    let mut oversized = start_rx(9).encode();
    oversized.push(0);
    bridge.control_raw(&oversized);

    let client = receiver();
    let port = client.local_addr().unwrap().port();
    bridge.control_from(&client, &start_rx(port));
    recv_train(&client);

    bridge.stop().unwrap();
}

#[test]
fn start_rx_streams_to_the_requesting_client() {
    let mut bridge = Bridge::start(SimRadio::new().with_pace(Duration::from_millis(2)));

    let client = receiver();
    let port = client.local_addr().unwrap().port();
    bridge.control_from(&client, &start_rx(port));

    // Two 16-bit channels: 256 samples * 4 bytes = 1024 useful bytes in
    // 112 byte payloads makes ten blocks, the last one carrying 16 bytes.
    let train = recv_train(&client);
    assert_eq!(train.len(), 10);
    let seqno = train[0].header.seqno;
    for (index, block) in train.iter().enumerate() {
        assert_eq!(block.header.block_index as usize, index);
        assert_eq!(block.header.block_count, 10);
        assert_eq!(block.header.seqno, seqno);
        let expected = if index == 9 { 16 } else { 112 };
        assert_eq!(block.payload.len(), expected);
    }

    bridge.stop().unwrap();
}

#[test]
fn sequence_numbers_advance_by_one_buffer() {
    let mut bridge = Bridge::start(SimRadio::new().with_pace(Duration::from_millis(2)));

    let client = receiver();
    let port = client.local_addr().unwrap().port();
    bridge.control_from(&client, &start_rx(port));

    let first = recv_train(&client)[0].header.seqno;
    let second = recv_train(&client)[0].header.seqno;
    assert!(second > first);
    assert_eq!((second - first) % 256, 0);

    bridge.stop().unwrap();
}

#[test]
fn start_rx_replaces_the_running_stream() {
    let mut bridge = Bridge::start(SimRadio::new().with_pace(Duration::from_millis(2)));

    let first = receiver();
    let first_port = first.local_addr().unwrap().port();
    bridge.control_from(&first, &start_rx(first_port));
    recv_train(&first);

    let second = receiver();
    let second_port = second.local_addr().unwrap().port();
    bridge.control_from(&second, &start_rx(second_port));
    recv_train(&second);

    // The first stream is gone: once the queue empties it stays empty.
    drain(&first);
    assert_eq!(drain(&first), 0);

    bridge.stop().unwrap();
}

#[test]
fn stop_rx_stops_the_stream() {
    let mut bridge = Bridge::start(SimRadio::new().with_pace(Duration::from_millis(2)));

    let client = receiver();
    let port = client.local_addr().unwrap().port();
    bridge.control_from(&client, &start_rx(port));
    recv_train(&client);

    bridge.control(&ControlRequest::StopRx);
    // Give the stop a moment to land, then check the stream went quiet.
    assert!(wait_until(Duration::from_secs(2), || {
        drain(&client);
        drain(&client) == 0
    }));

    bridge.stop().unwrap();
}

#[test]
fn restart_with_identical_parameters_resumes_cleanly() {
    let mut bridge = Bridge::start(SimRadio::new().with_pace(Duration::from_millis(2)));

    let client = receiver();
    let port = client.local_addr().unwrap().port();
    bridge.control_from(&client, &start_rx(port));
    let before = recv_train(&client);

    bridge.control(&ControlRequest::StopRx);
    bridge.control_from(&client, &start_rx(port));
    let after = recv_train(&client);

    // Identical geometry and framing either side of the restart.
    assert_eq!(before.len(), after.len());
    for (a, b) in before.iter().zip(after.iter()) {
        assert_eq!(a.header.block_index, b.header.block_index);
        assert_eq!(a.header.block_count, b.header.block_count);
        assert_eq!(a.payload.len(), b.payload.len());
    }

    bridge.stop().unwrap();
}

#[test]
fn shutdown_joins_all_workers() {
    let mut bridge = Bridge::start(SimRadio::new().with_pace(Duration::from_millis(2)));

    let client = receiver();
    let port = client.local_addr().unwrap().port();
    bridge.control_from(&client, &start_rx(port));
    recv_train(&client);
    bridge.control(&ControlRequest::StartTx(StartTx {
        channels: 0x1,
        timestamping: false,
        buffer_samples: 64,
    }));

    // Both workers running; a clean stop joins them.
    bridge.stop().unwrap();
}

#[test]
fn magic_spells_plto() {
    assert_eq!(&MAGIC.to_le_bytes(), b"PLTO");
}
