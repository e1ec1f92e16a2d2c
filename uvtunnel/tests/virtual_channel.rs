//! Virtual channel integration tests over loopback TCP.
//!
//! ```bash
//! RUST_LOG=uvtunnel=debug cargo test --test virtual_channel -- --nocapture
//! ```

use std::io::Write;
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::{Arc, Once, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use uvtunnel::buffer::BufferPool;
use uvtunnel::channel::{
    ChannelConfig, ChannelHandlers, ConnectionLoss, LossReason, VirtualChannel,
};
use uvtunnel::codec::FrameError;
use uvtunnel::net::ConnectionOptions;

static INIT: Once = Once::new();

fn init_test_tracing() {
    INIT.call_once(uvtunnel::init_tracing);
}

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

fn loopback_pairs(n: usize) -> (Vec<TcpStream>, Vec<TcpStream>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind listener");
    let addr = listener.local_addr().expect("local addr");
    let mut near = Vec::with_capacity(n);
    let mut far = Vec::with_capacity(n);
    for _ in 0..n {
        near.push(TcpStream::connect(addr).expect("connect"));
        far.push(listener.accept().expect("accept").0);
    }
    (near, far)
}

struct Side {
    channel: Arc<VirtualChannel>,
    received: mpsc::Receiver<(u64, Vec<u8>)>,
    lost: mpsc::Receiver<ConnectionLoss>,
}

fn open(label: &str, streams: Vec<TcpStream>) -> Side {
    open_with(label, streams, &ChannelConfig::default())
}

fn open_with(label: &str, streams: Vec<TcpStream>, config: &ChannelConfig) -> Side {
    let (rx_tx, received) = mpsc::channel();
    let (loss_tx, lost) = mpsc::channel();
    let handlers = ChannelHandlers {
        on_receive: Box::new(move |id, payload| {
            let _ = rx_tx.send((id.as_u64(), payload.to_vec()));
        }),
        on_disconnect: Arc::new(move |loss| {
            let _ = loss_tx.send(loss);
        }),
    };
    let channel = Arc::new(VirtualChannel::open(
        label,
        streams,
        config,
        BufferPool::default(),
        handlers,
    )
    .expect("open channel"));
    Side {
        channel,
        received,
        lost,
    }
}

fn message(seq: usize) -> Vec<u8> {
    let len = 1 + (seq * 37) % 1400;
    (0..len).map(|i| (seq + i) as u8).collect()
}

#[test]
fn messages_arrive_in_order_across_connection_counts() {
    init_test_tracing();
    for n in 2..=4 {
        let (near, far) = loopback_pairs(n);
        let sender = open("near", near);
        let receiver = open("far", far);

        for seq in 0..1_000 {
            assert_eq!(sender.channel.send(&message(seq)).expect("send"), 1);
        }
        for seq in 0..1_000 {
            let (id, payload) = receiver.received.recv_timeout(RECV_TIMEOUT).expect("delivery");
            assert_eq!(id, seq as u64, "{n} connections");
            assert_eq!(payload, message(seq), "{n} connections, message {seq}");
        }
        assert!(receiver.received.try_recv().is_err());

        let stats = receiver.channel.stats();
        assert_eq!(stats.delivered, 1_000);
        assert_eq!(stats.reorder_depth, 0);
        assert_eq!(stats.connections_up, n);
    }
}

#[test]
fn large_payloads_reassemble_as_a_byte_stream() {
    init_test_tracing();
    let (near, far) = loopback_pairs(3);
    let sender = open("near", near);
    let receiver = open("far", far);

    let mut expected = Vec::new();
    for seq in 0..50 {
        let payload: Vec<u8> = (0..(seq * 211 + 1)).map(|i| (i % 251) as u8).collect();
        sender.channel.send(&payload).expect("send");
        expected.extend_from_slice(&payload);
    }

    let mut got = Vec::with_capacity(expected.len());
    let mut next_id = 0;
    while got.len() < expected.len() {
        let (id, chunk) = receiver.received.recv_timeout(RECV_TIMEOUT).expect("delivery");
        assert_eq!(id, next_id);
        assert!(chunk.len() <= uvtunnel::codec::MAX_FRAME_PAYLOAD);
        next_id += 1;
        got.extend_from_slice(&chunk);
    }
    assert_eq!(got, expected);
}

#[test]
fn traffic_flows_both_ways_at_once() {
    init_test_tracing();
    let (near, far) = loopback_pairs(2);
    let a = open("a", near);
    let b = open("b", far);

    let senders: Vec<_> = [Arc::clone(&a.channel), Arc::clone(&b.channel)]
        .into_iter()
        .map(|channel| {
            thread::spawn(move || {
                for seq in 0..500 {
                    channel.send(&message(seq)).expect("send");
                }
            })
        })
        .collect();
    for handle in senders {
        handle.join().expect("sender");
    }

    for side in [&a, &b] {
        for seq in 0..500 {
            let (id, payload) = side.received.recv_timeout(RECV_TIMEOUT).expect("delivery");
            assert_eq!(id, seq as u64);
            assert_eq!(payload, message(seq));
        }
    }
}

#[test]
fn surviving_connections_keep_carrying_traffic() {
    init_test_tracing();
    let (near, far) = loopback_pairs(3);
    let killer = far[1].try_clone().expect("clone stream");
    let sender = open("near", near);
    let receiver = open("far", far);

    sender.channel.send(b"before").expect("send");
    assert_eq!(
        receiver.received.recv_timeout(RECV_TIMEOUT).expect("delivery").1,
        b"before"
    );

    killer.shutdown(Shutdown::Both).expect("shutdown");
    let loss = sender.lost.recv_timeout(RECV_TIMEOUT).expect("loss reported");
    assert_eq!(loss.index, 1);
    assert_eq!(sender.channel.stats().connections_up, 2);
    assert!(sender.lost.recv_timeout(Duration::from_millis(200)).is_err(), "reported once");

    for seq in 0..200 {
        sender.channel.send(&message(seq)).expect("send");
    }
    for seq in 0..200 {
        let (id, payload) = receiver.received.recv_timeout(RECV_TIMEOUT).expect("delivery");
        assert_eq!(id, seq as u64 + 1);
        assert_eq!(payload, message(seq));
    }
}

#[test]
fn closing_one_side_reports_every_connection_to_the_other() {
    init_test_tracing();
    let (near, far) = loopback_pairs(2);
    let closer = open("near", near);
    let observer = open("far", far);

    closer.channel.close();
    assert!(closer.lost.try_recv().is_err(), "own close is not a loss");

    let mut indices: Vec<usize> = (0..2)
        .map(|_| observer.lost.recv_timeout(RECV_TIMEOUT).expect("loss").index)
        .collect();
    indices.sort_unstable();
    assert_eq!(indices, vec![0, 1]);
    assert_eq!(observer.channel.stats().connections_up, 0);
}

#[test]
fn corrupt_bytes_drop_only_their_connection() {
    init_test_tracing();
    let oversized_header = [0x00, 0, 0, 0, 0, 0, 0, 0, 0, 0x13, 0x88];
    let cases: [(&[u8], FrameError); 2] = [
        (&[0x7F; 16], FrameError::UnknownType(0x7F)),
        (&oversized_header, FrameError::PayloadTooLarge(5000)),
    ];
    for (garbage, expected) in cases {
        let (mut near, far) = loopback_pairs(2);
        let mut raw = near.pop().expect("raw stream");
        let sender = open("near", near);
        let receiver = open("far", far);

        raw.write_all(garbage).expect("write garbage");
        let loss = receiver.lost.recv_timeout(RECV_TIMEOUT).expect("loss reported");
        assert_eq!(loss.index, 1);
        assert_eq!(loss.reason, LossReason::Corrupt(expected));
        assert_eq!(receiver.channel.stats().connections_up, 1);

        for seq in 0..100 {
            sender.channel.send(&message(seq)).expect("send");
        }
        for seq in 0..100 {
            let (id, payload) = receiver.received.recv_timeout(RECV_TIMEOUT).expect("delivery");
            assert_eq!(id, seq as u64);
            assert_eq!(payload, message(seq));
        }
    }
}

#[test]
fn stalled_connection_frames_are_resent_and_delivered_once() {
    init_test_tracing();
    const COUNT: usize = 600;

    let (near, mut far) = loopback_pairs(2);
    // Connection 1 reaches the receiver through a relay that stays shut
    // until a retransmit has been seen, so its sender stalls.
    let stalled = far.pop().expect("stalled stream");
    rustix::net::sockopt::set_socket_recv_buffer_size(&stalled, 4096).expect("shrink rcvbuf");
    let (mut relay_in, mut relay_out) = loopback_pairs(1);
    let relay_in = relay_in.pop().expect("relay in");
    far.push(relay_out.pop().expect("relay out"));

    let (open_gate, gate) = mpsc::channel::<()>();
    let relay = thread::spawn(move || {
        let (mut stalled, mut relay_in) = (stalled, relay_in);
        if gate.recv().is_ok() {
            let _ = std::io::copy(&mut stalled, &mut relay_in);
        }
        let _ = relay_in.shutdown(Shutdown::Write);
    });

    let config = ChannelConfig {
        connection: ConnectionOptions {
            send_timeout: Duration::from_millis(100),
            send_buffer_size: Some(4096),
            ..ConnectionOptions::default()
        },
        ..ChannelConfig::default()
    };
    let sender = open_with("near", near, &config);
    let receiver = open("far", far);

    for seq in 0..COUNT {
        sender.channel.send(&message(seq)).expect("send");
    }
    let deadline = Instant::now() + Duration::from_secs(10);
    while sender.channel.stats().retransmits == 0 {
        assert!(Instant::now() < deadline, "no send ever timed out");
        thread::sleep(Duration::from_millis(10));
    }
    open_gate.send(()).expect("open relay");

    for seq in 0..COUNT {
        let (id, payload) = receiver.received.recv_timeout(RECV_TIMEOUT).expect("delivery");
        assert_eq!(id, seq as u64);
        assert_eq!(payload, message(seq), "message {seq}");
    }
    assert!(
        receiver.received.recv_timeout(Duration::from_millis(300)).is_err(),
        "every message delivered exactly once"
    );
    assert_eq!(receiver.channel.stats().delivered, COUNT as u64);

    drop(sender);
    drop(receiver);
    relay.join().expect("relay");
}
