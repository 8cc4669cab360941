//! Integration tests for the complete receive pipeline.
//!
//! ```text
//! Datagrams → Frame Assembly → Decode/Scale → Hand-off Queue → Consumer
//! ```
//!
//! The scripted tests run without any network; the loopback test drives a
//! real session against a simulated camera on 127.0.0.1.

use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

use wifi_scope_lib::config::SessionConfig;
use wifi_scope_lib::decoder::{ChannelOrder, DecodedImage};
use wifi_scope_lib::net::Received;
use wifi_scope_lib::protocol::{Command, COMMAND_LEN};
use wifi_scope_lib::session::{SessionState, StreamSession};
use wifi_scope_lib::test_utils::{
    encode_test_jpeg, FragmentGenerator, RecordingSink, Rgb, ScriptedSource,
};

fn test_config() -> SessionConfig {
    SessionConfig {
        output_width: 60,
        output_height: 40,
        idle_backoff: Duration::ZERO,
        ..Default::default()
    }
}

/// Run a scripted session to completion and collect every queued image
fn run_scripted(
    datagrams: Vec<Vec<u8>>,
    config: SessionConfig,
) -> (Vec<DecodedImage>, StreamSession) {
    let mut session = StreamSession::spawn(
        ScriptedSource::from_datagrams(datagrams),
        RecordingSink::default(),
        config,
        None,
    );
    session.join().expect("scripted session should stop cleanly");

    let mut images = Vec::new();
    while let Some(image) = session.poll_latest() {
        images.push(image);
    }
    (images, session)
}

fn center_pixel(image: &DecodedImage) -> Vec<u8> {
    image
        .pixel(image.width() / 2, image.height() / 2)
        .expect("center pixel")
        .to_vec()
}

// ============================================================================
// Happy Path
// ============================================================================

#[test]
fn test_three_slices_then_next_start_yields_one_image() {
    let jpeg = encode_test_jpeg(64, 48, Rgb::RED);
    let mut gen = FragmentGenerator::default();

    let mut datagrams = gen.fragment_frame_into(&jpeg, 3);
    datagrams.extend(gen.fragment_frame(&[]));

    let (images, session) = run_scripted(datagrams, test_config());

    assert_eq!(images.len(), 1, "exactly one image should be queued");
    assert_eq!((images[0].width(), images[0].height()), (60, 40));
    let px = center_pixel(&images[0]);
    assert!(px[0] > 200 && px[1] < 60 && px[2] < 60, "expected red, got {:?}", px);

    let stats = session.stats();
    assert_eq!(stats.datagrams, 4);
    assert_eq!(stats.frames_queued, 1);
    assert_eq!(session.state(), SessionState::Stopped);
}

#[test]
fn test_sequence_of_frames_in_order() {
    let colors = [Rgb::RED, Rgb::GREEN, Rgb::BLUE, Rgb::WHITE];
    let mut gen = FragmentGenerator::new(200);

    let mut datagrams = Vec::new();
    for color in colors {
        datagrams.extend(gen.fragment_frame(&encode_test_jpeg(64, 48, color)));
    }
    datagrams.extend(gen.fragment_frame(&[]));

    let (images, _) = run_scripted(datagrams, test_config());
    assert_eq!(images.len(), 4);

    let dominant: Vec<usize> = images
        .iter()
        .take(3)
        .map(|image| {
            let px = center_pixel(image);
            (0..3).max_by_key(|&i| px[i]).unwrap_or(0)
        })
        .collect();
    assert_eq!(dominant, vec![0, 1, 2]);

    let white = center_pixel(&images[3]);
    assert!(white.iter().all(|&c| c > 200));
}

#[test]
fn test_bgr_output_reaches_consumer() {
    let mut gen = FragmentGenerator::default();
    let mut datagrams = gen.fragment_frame(&encode_test_jpeg(32, 32, Rgb::BLUE));
    datagrams.extend(gen.fragment_frame(&[]));

    let config = SessionConfig {
        channel_order: ChannelOrder::Bgr,
        ..test_config()
    };
    let (images, _) = run_scripted(datagrams, config);

    assert_eq!(images[0].channel_order(), ChannelOrder::Bgr);
    let px = center_pixel(&images[0]);
    assert!(px[0] > 200, "blue should come first in BGR, got {:?}", px);
}

// ============================================================================
// Error Handling
// ============================================================================

#[test]
fn test_short_datagrams_do_not_disturb_assembly() {
    let jpeg = encode_test_jpeg(64, 64, Rgb::GREEN);
    let mut gen = FragmentGenerator::new(300);

    let mut datagrams = Vec::new();
    for (i, fragment) in gen.fragment_frame(&jpeg).into_iter().enumerate() {
        datagrams.push(fragment);
        if i % 2 == 0 {
            datagrams.push(vec![0x01, 0x00, 0x00]);
        }
    }
    datagrams.extend(gen.fragment_frame(&[]));

    let (images, session) = run_scripted(datagrams, test_config());

    assert_eq!(images.len(), 1);
    assert!(session.stats().malformed > 0);
}

#[test]
fn test_corrupt_frame_skipped_next_frame_shown() {
    let mut gen = FragmentGenerator::new(200);
    let mut datagrams = gen.fragment_frame(&[0x5Au8; 900]);
    datagrams.extend(gen.fragment_frame(&encode_test_jpeg(16, 16, Rgb::GRAY)));
    datagrams.extend(gen.fragment_frame(&[]));

    let (images, session) = run_scripted(datagrams, test_config());

    assert_eq!(images.len(), 1);
    assert_eq!(session.stats().decode_failures, 1);
}

#[test]
fn test_idle_source_never_decodes_or_sends() {
    let mut source = ScriptedSource::default();
    for _ in 0..1000 {
        source.push(Ok(Received::WouldBlock));
    }
    let sink = RecordingSink::default();
    let log = sink.handle();
    let mut session = StreamSession::spawn(source, sink, test_config(), None);
    let stats = session.join().unwrap();

    assert_eq!(stats.datagrams, 0);
    assert_eq!(stats.frames_queued, 0);
    let commands = log.lock().unwrap().clone();
    // Startup sequence, then the stop on exit: nothing in between
    assert_eq!(commands.len(), Command::STARTUP.len() + 1);
    assert_eq!(&commands[..4], &Command::STARTUP[..]);
    assert_eq!(commands[4], Command::StopStream);
}

// ============================================================================
// Loopback
// ============================================================================

/// A free UDP port on loopback
fn free_port() -> u16 {
    let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    socket.local_addr().unwrap().port()
}

#[test]
fn test_loopback_session_against_simulated_camera() {
    let camera = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    camera
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    let stream_port = free_port();

    let config = SessionConfig {
        peer: camera.local_addr().unwrap(),
        stream_port,
        ..test_config()
    };
    let mut session = StreamSession::start(config, None).expect("sockets should open");

    // Startup sequence arrives in order
    let mut buf = [0u8; 64];
    for expected in Command::STARTUP {
        let (len, _) = camera.recv_from(&mut buf).expect("startup command");
        assert_eq!(len, COMMAND_LEN);
        assert_eq!(&buf[..len], &expected.to_bytes()[..]);
    }

    let target = SocketAddr::from((Ipv4Addr::LOCALHOST, stream_port));
    let mut gen = FragmentGenerator::default().with_start_frame_id(24);
    let jpeg = encode_test_jpeg(128, 96, Rgb::BLUE);

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut image = None;
    while image.is_none() && Instant::now() < deadline {
        for datagram in gen.fragment_frame(&jpeg) {
            camera.send_to(&datagram, target).unwrap();
        }
        std::thread::sleep(Duration::from_millis(20));
        image = session.poll_latest();
    }
    let image = image.expect("an image should arrive over loopback");
    assert_eq!((image.width(), image.height()), (60, 40));
    assert_eq!(session.state(), SessionState::Running);

    session.request_shutdown();
    let stats = session.join().unwrap();
    assert!(stats.frames_queued >= 1);
    // Frame 25 started, so at least one heartbeat went out
    assert!(stats.heartbeats >= 1);

    // Heartbeat(s) then the stop command
    let mut received = Vec::new();
    while let Ok((len, _)) = camera.recv_from(&mut buf) {
        received.push(buf[..len].to_vec());
        if buf[..len] == Command::StopStream.to_bytes() {
            break;
        }
    }
    assert!(received.contains(&Command::Heartbeat.to_bytes().to_vec()));
    assert_eq!(received.last(), Some(&Command::StopStream.to_bytes().to_vec()));
}

#[test]
fn test_start_fails_when_port_taken() {
    let holder = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).unwrap();
    let port = holder.local_addr().unwrap().port();

    let config = SessionConfig {
        peer: SocketAddr::from((Ipv4Addr::LOCALHOST, 9)),
        stream_port: port,
        ..test_config()
    };

    let err = StreamSession::start(config, None)
        .err()
        .expect("bind should fail");
    assert!(err.to_string().contains(&port.to_string()));
}
