use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use gr_comm::{CommError, CommFramework, ErrorKind};
use mock::{establish, Deployment, EchoPeer, GUEST_VM, SERVER_VM};
use rand::Rng;
use transport::{IvcConfig, PeerId, RingChannel};

const PAYLOAD: usize = 64;
const HANDSHAKE: Duration = Duration::from_secs(2);

fn single_queue(nframes: u32) -> Result<Deployment> {
    Deployment::new()
        .with_timeouts(Duration::from_secs(2), Duration::from_millis(500))
        .queue(0, IvcConfig::new(nframes, PAYLOAD))
}

fn write_blocking(channel: &dyn RingChannel, frame: &[u8]) {
    let deadline = Instant::now() + HANDSHAKE;
    while !channel.can_write() {
        assert!(Instant::now() < deadline, "server ring stayed full");
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(channel.write(frame).expect("server write"), frame.len());
}

#[test]
fn loopback_round_trip() -> Result<()> {
    let deployment = single_queue(4)?;
    let fw = deployment.framework()?;
    fw.init(0, 0..1, 4, &[PAYLOAD])?;

    fw.send(0, PeerId::SELF, 0, b"hello")?;
    let message = fw.recv(0, 0)?;
    assert_eq!(message.sender(), PeerId::SELF);
    assert_eq!(&message[..5], b"hello");
    assert_eq!(message.len(), PAYLOAD);
    fw.release(message);
    Ok(())
}

#[test]
fn peer_frames_arrive_in_order() -> Result<()> {
    let deployment = single_queue(4)?;
    let fw = deployment.framework()?;
    fw.init(0, 0..1, 2, &[PAYLOAD])?;
    let server = deployment.server_channel(0)?;
    establish(server.as_ref(), HANDSHAKE)?;

    let mut rng = rand::thread_rng();
    let frames: Vec<Vec<u8>> = (0..32)
        .map(|_| (0..PAYLOAD).map(|_| rng.gen()).collect())
        .collect();
    let writer = {
        let frames = frames.clone();
        thread::spawn(move || {
            for frame in &frames {
                write_blocking(server.as_ref(), frame);
            }
        })
    };

    for expected in &frames {
        let message = fw.recv(0, 0)?;
        assert_eq!(message.sender(), SERVER_VM);
        assert_eq!(message.data(), expected.as_slice());
    }
    writer.join().expect("writer");
    Ok(())
}

#[test]
fn loopback_and_peer_messages_share_one_fifo() -> Result<()> {
    let deployment = single_queue(4)?;
    let fw = deployment.framework()?;
    fw.init(0, 0..1, 4, &[PAYLOAD])?;
    let server = deployment.server_channel(0)?;
    establish(server.as_ref(), HANDSHAKE)?;

    fw.send(0, PeerId::SELF, 0, &[1])?;
    write_blocking(server.as_ref(), &[2; PAYLOAD]);
    let first = fw.recv(0, 0)?;
    let second = fw.recv(0, 0)?;
    assert_eq!((first.sender(), first[0]), (PeerId::SELF, 1));
    assert_eq!((second.sender(), second[0]), (SERVER_VM, 2));
    Ok(())
}

#[test]
fn concurrent_sendrecv_never_cross_delivers() -> Result<()> {
    let deployment = single_queue(2)?;
    let fw = deployment.framework()?;
    fw.init(0, 0..1, 2, &[PAYLOAD])?;
    let echo = EchoPeer::spawn(deployment.server_channel(0)?)?;

    thread::scope(|scope| {
        for caller in 0..2u8 {
            let fw = &fw;
            scope.spawn(move || {
                for round in 0..50u8 {
                    let mut request = [caller; PAYLOAD];
                    request[1] = round;
                    let response = fw
                        .sendrecv(0, SERVER_VM, 0, &request)
                        .expect("sendrecv");
                    assert_eq!(response.sender(), SERVER_VM);
                    assert_eq!(response.data(), &request[..]);
                }
            });
        }
    });
    assert_eq!(echo.stop(), 100);
    Ok(())
}

#[test]
fn sendrecv_into_copies_the_response() -> Result<()> {
    let deployment = single_queue(2)?;
    let fw = deployment.framework()?;
    fw.init(0, 0..1, 1, &[PAYLOAD])?;
    let _echo = EchoPeer::spawn_with(deployment.server_channel(0)?, |frame| {
        for byte in frame.iter_mut() {
            *byte = byte.wrapping_add(1);
        }
    })?;

    let mut out = [0u8; 8];
    let request: [u8; 8] = [10, 20, 30, 40, 50, 60, 70, 80];
    let responder = fw.sendrecv_into(0, SERVER_VM, 0, &request, &mut out)?;
    assert_eq!(responder, SERVER_VM);
    assert_eq!(out, [11, 21, 31, 41, 51, 61, 71, 81]);
    assert_eq!(fw.queue_stats(0, 0)?.checked_out, 0);
    Ok(())
}

#[test]
fn send_times_out_when_the_server_stops_reading() -> Result<()> {
    let deployment = Deployment::new()
        .with_timeouts(Duration::from_secs(2), Duration::from_millis(100))
        .queue(0, IvcConfig::new(2, PAYLOAD))?;
    let fw = deployment.framework()?;
    fw.init(0, 0..1, 1, &[PAYLOAD])?;
    let server = deployment.server_channel(0)?;
    establish(server.as_ref(), HANDSHAKE)?;

    fw.send(0, SERVER_VM, 0, &[1; PAYLOAD])?;
    fw.send(0, SERVER_VM, 0, &[2; PAYLOAD])?;
    let start = Instant::now();
    let err = fw
        .send(0, SERVER_VM, 0, &[3; PAYLOAD])
        .expect_err("ring is full");
    assert!(matches!(err, CommError::Timeout(_)));
    assert!(err.is_retryable());
    assert!(start.elapsed() >= Duration::from_millis(100));

    // Draining one frame lets the next send through.
    let mut frame = [0u8; PAYLOAD];
    server.read(&mut frame)?;
    assert_eq!(frame[0], 1);
    fw.send(0, SERVER_VM, 0, &[3; PAYLOAD])?;
    Ok(())
}

#[test]
fn send_to_another_partition_is_rejected() -> Result<()> {
    let deployment = single_queue(2)?;
    let fw = deployment.framework()?;
    fw.init(0, 0..1, 1, &[PAYLOAD])?;
    let err = fw.send(0, GUEST_VM, 0, b"x").expect_err("wrong peer");
    assert!(matches!(err, CommError::PeerMismatch { .. }));
    assert_eq!(err.kind(), ErrorKind::Configuration);
    Ok(())
}

#[test]
fn peer_id_comes_from_the_ring_channels() -> Result<()> {
    let deployment = Deployment::new()
        .queue(0, IvcConfig::new(2, PAYLOAD))?
        .queue(1, IvcConfig::new(2, 2 * PAYLOAD))?;
    let fw = deployment.framework()?;
    assert_eq!(fw.get_peer_id(), None);
    fw.init(0, 0..2, 1, &[PAYLOAD, 2 * PAYLOAD])?;
    assert_eq!(fw.get_peer_id(), Some(SERVER_VM));
    Ok(())
}

#[test]
fn payload_larger_than_the_frame_fails_init() -> Result<()> {
    let deployment = single_queue(2)?;
    let fw = deployment.framework()?;
    let err = fw
        .init(0, 0..1, 1, &[2 * PAYLOAD])
        .expect_err("frame too small");
    assert!(matches!(err, CommError::FrameTooSmall { .. }));
    assert!(!deployment.guest_rings().is_reserved(0));
    Ok(())
}

#[test]
fn deinit_reclaims_and_allows_reinit() -> Result<()> {
    let deployment = single_queue(2)?;
    let fw = deployment.framework()?;
    fw.init(0, 0..1, 2, &[PAYLOAD])?;
    for byte in 0..3u8 {
        fw.send(0, PeerId::SELF, 0, &[byte])?;
    }
    let held = fw.recv(0, 0)?;
    assert_eq!(fw.queue_stats(0, 0)?.allocated, 3);

    fw.deinit(0, 0..1)?;
    assert!(!deployment.guest_rings().is_reserved(0));
    assert!(matches!(
        fw.recv(0, 0),
        Err(CommError::NotInitialized { queue: 0 })
    ));
    drop(held);

    fw.init(0, 0..1, 2, &[PAYLOAD])?;
    let stats = fw.queue_stats(0, 0)?;
    assert_eq!((stats.allocated, stats.free, stats.pending), (2, 2, 0));
    Ok(())
}

#[test]
fn recv_blocked_across_deinit_fails_cleanly() -> Result<()> {
    let deployment = single_queue(2)?;
    let fw = deployment.framework()?;
    fw.init(0, 0..1, 1, &[PAYLOAD])?;

    thread::scope(|scope| {
        let waiter = scope.spawn(|| fw.recv(0, 0));
        thread::sleep(Duration::from_millis(50));
        fw.deinit(0, 0..1).expect("deinit");
        let result = waiter.join().expect("waiter");
        assert!(matches!(result, Err(CommError::NotInitialized { .. })));
    });
    Ok(())
}

#[test]
fn steady_state_echo_does_not_grow_the_pool() -> Result<()> {
    let deployment = single_queue(4)?;
    let fw = deployment.framework()?;
    fw.init(0, 0..1, 4, &[PAYLOAD])?;
    let _echo = EchoPeer::spawn(deployment.server_channel(0)?)?;

    for round in 0..200u32 {
        let response = fw.sendrecv(0, SERVER_VM, 0, &round.to_le_bytes())?;
        assert_eq!(&response[..4], &round.to_le_bytes());
        fw.release(response);
    }
    let stats = fw.queue_stats(0, 0)?;
    assert_eq!(stats.allocated, 4);
    assert_eq!(stats.free, 4);
    Ok(())
}

#[test]
fn recv_times_out_no_earlier_than_its_bound() -> Result<()> {
    let deployment = Deployment::new()
        .with_timeouts(Duration::from_millis(100), Duration::from_millis(500))
        .queue(0, IvcConfig::new(2, PAYLOAD))?;
    let fw = deployment.framework()?;
    fw.init(0, 0..1, 1, &[PAYLOAD])?;

    let start = Instant::now();
    let err = fw.recv(0, 0).expect_err("nothing sent");
    let elapsed = start.elapsed();
    assert!(matches!(err, CommError::Timeout(_)));
    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < Duration::from_secs(2));
    assert_eq!(fw.queue_stats(0, 0)?.free, 1);
    Ok(())
}

#[test]
#[ignore]
fn slow_recv_default_bound_is_ten_seconds() -> Result<()> {
    let deployment = Deployment::new().queue(0, IvcConfig::new(2, PAYLOAD))?;
    let fw: CommFramework = deployment.framework()?;
    fw.init(0, 0..1, 1, &[PAYLOAD])?;

    let start = Instant::now();
    assert!(matches!(fw.recv(0, 0), Err(CommError::Timeout(_))));
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(10));
    assert!(elapsed < Duration::from_secs(12));
    Ok(())
}
