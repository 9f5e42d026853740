//! End-to-end broker behaviour over a real socket and PTY.

mod common;

use std::collections::HashMap;
use std::time::Duration;

use common::*;
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use tether_client::{BrokerClient, ConnectConfig, SessionEvent};
use tether_core::{Capability, SignalKind, SpawnPayload};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::time::{sleep, timeout, timeout_at, Instant};

#[tokio::test]
async fn output_reaches_every_client() {
    let broker = start("exec cat").await;
    let (mut v1, _w1) = BrokerClient::connect(&broker.socket, as_viewer()).await.unwrap().split();
    let (mut v2, _w2) = BrokerClient::connect(&broker.socket, as_viewer()).await.unwrap().split();
    let controller = BrokerClient::connect(&broker.socket, as_controller()).await.unwrap();
    assert_eq!(controller.welcome.session_id, "s1");
    assert_eq!(controller.welcome.scope_key, "k1");
    let (mut c_reader, mut c_writer) = controller.split();

    c_writer.send_input(b"broadcast-me\n").await.unwrap();
    read_until(&mut v1, "broadcast-me").await;
    read_until(&mut v2, "broadcast-me").await;
    read_until(&mut c_reader, "broadcast-me").await;

    broker.stop().await;
}

#[tokio::test]
async fn viewer_cannot_signal_or_spawn() {
    let broker = start("exec cat").await;
    let (mut v_reader, mut v_writer) = BrokerClient::connect(&broker.socket, as_viewer()).await.unwrap().split();
    let (_c_reader, mut c_writer) = BrokerClient::connect(&broker.socket, as_controller()).await.unwrap().split();

    v_writer.signal(SignalKind::Kill).await.unwrap();
    v_writer
        .spawn(SpawnPayload {
            command: "/bin/sh".into(),
            args: vec!["-c".into(), "echo hijacked".into()],
            env: HashMap::new(),
            cwd: None,
        })
        .await
        .unwrap();
    sleep(Duration::from_millis(300)).await;

    // The process survived and the viewer is still attached.
    c_writer.send_input(b"still-here\n").await.unwrap();
    let seen = read_until(&mut v_reader, "still-here").await;
    assert!(!seen.contains("hijacked"));

    broker.stop().await;
}

#[tokio::test]
async fn viewer_input_reaches_the_process() {
    let broker = start("exec cat").await;
    let (_v_reader, mut v_writer) = BrokerClient::connect(&broker.socket, as_viewer()).await.unwrap().split();
    let (mut c_reader, _c_writer) = BrokerClient::connect(&broker.socket, as_controller()).await.unwrap().split();

    v_writer.send_input(b"from-viewer\n").await.unwrap();
    read_until(&mut c_reader, "from-viewer").await;

    broker.stop().await;
}

#[tokio::test]
async fn new_controller_displaces_old() {
    let broker = start("exec cat").await;
    let (mut old_reader, _old_writer) = BrokerClient::connect(&broker.socket, as_controller()).await.unwrap().split();
    let (mut viewer, _vw) = BrokerClient::connect(&broker.socket, as_viewer()).await.unwrap().split();
    let (_new_reader, mut new_writer) = BrokerClient::connect(&broker.socket, as_controller()).await.unwrap().split();

    assert_eq!(next_control_event(&mut old_reader).await, SessionEvent::Closed);

    new_writer.send_input(b"new-boss\n").await.unwrap();
    read_until(&mut viewer, "new-boss").await;

    broker.stop().await;
}

#[tokio::test]
async fn late_joiner_gets_replay_then_live() {
    let broker = start("printf 'early-output\\n'; exec cat").await;

    // Reconnect until the early output has landed in the ring.
    let deadline = Instant::now() + WAIT;
    let late = loop {
        let attachment = BrokerClient::connect(&broker.socket, as_viewer()).await.unwrap();
        if String::from_utf8_lossy(&attachment.replay).contains("early-output") {
            break attachment;
        }
        assert!(Instant::now() < deadline, "early output never replayed");
        sleep(Duration::from_millis(50)).await;
    };
    let (mut late_reader, _lw) = late.split();

    let again = BrokerClient::connect(&broker.socket, as_viewer()).await.unwrap();
    assert!(String::from_utf8_lossy(&again.replay).contains("early-output"));

    let (_c, mut c_writer) = BrokerClient::connect(&broker.socket, as_controller()).await.unwrap().split();
    c_writer.send_input(b"live-line\n").await.unwrap();
    let live = read_until(&mut late_reader, "live-line").await;
    assert!(!live.contains("early-output"));

    broker.stop().await;
}

#[tokio::test]
async fn malformed_hello_only_drops_that_connection() {
    let broker = start("exec cat").await;
    let (mut viewer, _vw) = BrokerClient::connect(&broker.socket, as_viewer()).await.unwrap().split();

    // HELLO tag with a payload that is not valid CBOR.
    let mut bad = UnixStream::connect(&broker.socket).await.unwrap();
    bad.write_all(&[0x01, 0, 0, 0, 1, 0xff]).await.unwrap();
    let mut buf = [0u8; 64];
    let n = timeout(WAIT, bad.read(&mut buf)).await.unwrap().unwrap_or(0);
    assert_eq!(n, 0, "broker should close without replying");

    // Unknown frame type.
    let mut junk = UnixStream::connect(&broker.socket).await.unwrap();
    junk.write_all(&[0xee, 0, 0, 0, 0]).await.unwrap();
    let n = timeout(WAIT, junk.read(&mut buf)).await.unwrap().unwrap_or(0);
    assert_eq!(n, 0);

    let (_c, mut c_writer) = BrokerClient::connect(&broker.socket, as_controller()).await.unwrap().split();
    c_writer.send_input(b"unaffected\n").await.unwrap();
    read_until(&mut viewer, "unaffected").await;

    broker.stop().await;
}

#[tokio::test]
async fn silent_client_is_dropped_after_handshake_timeout() {
    let broker = start("exec cat").await;
    let mut idle = UnixStream::connect(&broker.socket).await.unwrap();
    let mut buf = [0u8; 16];
    let n = timeout(WAIT, idle.read(&mut buf)).await.unwrap().unwrap_or(0);
    assert_eq!(n, 0);
    broker.stop().await;
}

#[tokio::test]
async fn exit_code_reaches_clients_and_socket_is_removed() {
    let broker = start("read line; exit 3").await;
    let socket = broker.socket.clone();
    let (mut viewer, _vw) = BrokerClient::connect(&socket, as_viewer()).await.unwrap().split();
    let (_c, mut c_writer) = BrokerClient::connect(&socket, as_controller()).await.unwrap().split();

    c_writer.send_input(b"go\n").await.unwrap();
    assert_eq!(next_control_event(&mut viewer).await, SessionEvent::Exit(Some(3)));

    let code = timeout(WAIT, broker.handle).await.unwrap().unwrap().unwrap();
    assert_eq!(code, Some(3));
    assert!(!socket.exists());
}

#[tokio::test]
async fn shutdown_terminates_process_and_notifies() {
    let broker = start("exec cat").await;
    let socket = broker.socket.clone();
    let (mut viewer, _vw) = BrokerClient::connect(&socket, as_viewer()).await.unwrap().split();

    let stopping = tokio::spawn(broker.stop());
    assert!(matches!(next_control_event(&mut viewer).await, SessionEvent::Exit(_)));
    stopping.await.unwrap();
    assert!(!socket.exists());
}

#[tokio::test]
async fn resize_applies_to_the_pty() {
    let broker = start("read line; stty size; exec cat").await;
    let (mut viewer, mut v_writer) = BrokerClient::connect(&broker.socket, as_viewer()).await.unwrap().split();
    let (_c, mut c_writer) = BrokerClient::connect(&broker.socket, as_controller()).await.unwrap().split();

    v_writer.resize(40, 100).await.unwrap();
    sleep(Duration::from_millis(200)).await;
    c_writer.send_input(b"\n").await.unwrap();
    read_until(&mut viewer, "40 100").await;

    broker.stop().await;
}

#[tokio::test]
async fn controller_spawn_replaces_process() {
    let broker = start("exec cat").await;
    let (mut viewer, _vw) = BrokerClient::connect(&broker.socket, as_viewer()).await.unwrap().split();
    let (_c, mut c_writer) = BrokerClient::connect(&broker.socket, as_controller()).await.unwrap().split();

    c_writer
        .spawn(SpawnPayload {
            command: "/bin/sh".into(),
            args: vec!["-c".into(), "echo replaced-$((40+2)); exec cat".into()],
            env: HashMap::new(),
            cwd: None,
        })
        .await
        .unwrap();
    // No EXIT for the replaced child; output of the new one follows.
    read_until(&mut viewer, "replaced-42").await;

    broker.stop().await;
}

#[tokio::test]
async fn controller_signal_interrupts_process() {
    let broker = start("exec cat").await;
    let (mut viewer, _vw) = BrokerClient::connect(&broker.socket, as_viewer()).await.unwrap().split();
    let config = ConnectConfig {
        capability: Capability::Controller,
        ..ConnectConfig::viewer()
    };
    let (_c, mut c_writer) = BrokerClient::connect(&broker.socket, config).await.unwrap().split();

    c_writer.signal(SignalKind::Terminate).await.unwrap();
    assert!(matches!(next_control_event(&mut viewer).await, SessionEvent::Exit(_)));
}

/// Every line of `bytes` that ended in a newline, parsed as a number.
fn complete_numbers(bytes: &[u8]) -> Vec<u64> {
    let text = String::from_utf8_lossy(bytes);
    let complete = text.rfind('\n').map_or("", |end| &text[..end]);
    complete
        .split_whitespace()
        .map(|n| n.parse().unwrap_or_else(|_| panic!("not a number: {n:?}")))
        .collect()
}

#[tokio::test]
async fn staggered_viewers_see_gapless_output() {
    let broker = start("i=0; while :; do echo $i; i=$((i+1)); sleep 0.01; done").await;

    let mut viewers = Vec::new();
    for delay in [0u64, 500, 1000] {
        let socket = broker.socket.clone();
        viewers.push(tokio::spawn(async move {
            sleep(Duration::from_millis(delay)).await;
            let attachment = BrokerClient::connect(&socket, as_viewer()).await.unwrap();
            let mut seen = attachment.replay.clone();
            let (mut reader, _writer) = attachment.split();
            let until = Instant::now() + Duration::from_millis(1500);
            while let Ok(event) = timeout_at(until, reader.next_event()).await {
                match event.unwrap() {
                    SessionEvent::Data(bytes) => seen.extend_from_slice(&bytes),
                    other => panic!("unexpected {other:?}"),
                }
            }
            seen
        }));
    }

    for viewer in viewers {
        let numbers = complete_numbers(&viewer.await.unwrap());
        assert!(numbers.len() > 20, "too little output: {numbers:?}");
        // Nothing has been evicted from the ring yet, so replay starts at 0.
        assert_eq!(numbers[0], 0);
        for pair in numbers.windows(2) {
            assert_eq!(pair[1], pair[0] + 1, "gap or duplicate in {numbers:?}");
        }
    }

    broker.stop().await;
}

#[tokio::test]
async fn spawn_kills_the_replaced_process() {
    let dir = tempfile::tempdir().unwrap();
    let pidfile = dir.path().join("first.pid");
    let broker = start(&format!("echo $$ > '{}'; exec cat", pidfile.display())).await;

    let deadline = Instant::now() + WAIT;
    let first: i32 = loop {
        if let Some(pid) = std::fs::read_to_string(&pidfile)
            .ok()
            .and_then(|s| s.trim().parse().ok())
        {
            break pid;
        }
        assert!(Instant::now() < deadline, "first process never started");
        sleep(Duration::from_millis(20)).await;
    };

    let (mut viewer, _vw) = BrokerClient::connect(&broker.socket, as_viewer()).await.unwrap().split();
    let (_c, mut c_writer) = BrokerClient::connect(&broker.socket, as_controller()).await.unwrap().split();
    c_writer
        .spawn(SpawnPayload {
            command: "/bin/sh".into(),
            args: vec!["-c".into(), "echo second-up; exec cat".into()],
            env: HashMap::new(),
            cwd: None,
        })
        .await
        .unwrap();
    read_until(&mut viewer, "second-up").await;

    let deadline = Instant::now() + WAIT;
    while kill(Pid::from_raw(first), None) != Err(Errno::ESRCH) {
        assert!(Instant::now() < deadline, "replaced process {first} still running");
        sleep(Duration::from_millis(25)).await;
    }

    broker.stop().await;
}
