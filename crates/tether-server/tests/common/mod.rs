//! In-process broker fixtures shared by the integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use tether_client::{AttachmentReader, ConnectConfig, SessionEvent};
use tether_core::TetherResult;
use tether_server::{BrokerConfig, ProcessSpec, SessionServer};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};

pub const WAIT: Duration = Duration::from_secs(5);

pub struct Running {
    pub socket: PathBuf,
    stop: Option<oneshot::Sender<()>>,
    pub handle: JoinHandle<TetherResult<Option<i32>>>,
    _dir: tempfile::TempDir,
}

impl Running {
    pub async fn stop(mut self) -> Option<i32> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        timeout(WAIT, self.handle).await.unwrap().unwrap().unwrap()
    }
}

pub fn sh(script: &str) -> ProcessSpec {
    ProcessSpec {
        program: "/bin/sh".into(),
        args: vec!["-c".into(), script.into()],
        env: HashMap::new(),
        cwd: None,
    }
}

pub async fn start(script: &str) -> Running {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("tether-s1.k1.1.sock");
    let mut config = BrokerConfig::new("s1", "k1", socket.clone(), sh(script));
    config.handshake_timeout = Duration::from_secs(1);

    let (stop_tx, stop_rx) = oneshot::channel();
    let handle = tokio::spawn(SessionServer::new(config).run(async {
        let _ = stop_rx.await;
    }));

    let deadline = Instant::now() + WAIT;
    while !socket.exists() {
        assert!(Instant::now() < deadline, "broker never bound its socket");
        sleep(Duration::from_millis(20)).await;
    }
    Running {
        socket,
        stop: Some(stop_tx),
        handle,
        _dir: dir,
    }
}

pub fn as_viewer() -> ConnectConfig {
    ConnectConfig::viewer()
}

pub fn as_controller() -> ConnectConfig {
    ConnectConfig::default()
}

/// Read live output until `needle` shows up.
pub async fn read_until(reader: &mut AttachmentReader, needle: &str) -> String {
    let mut seen = Vec::new();
    let result = timeout(WAIT, async {
        loop {
            match reader.next_event().await.unwrap() {
                SessionEvent::Data(bytes) => {
                    seen.extend_from_slice(&bytes);
                    if String::from_utf8_lossy(&seen).contains(needle) {
                        return;
                    }
                }
                other => panic!("unexpected {other:?} while waiting for {needle:?}"),
            }
        }
    })
    .await;
    let text = String::from_utf8_lossy(&seen).into_owned();
    assert!(result.is_ok(), "timed out waiting for {needle:?}, saw {text:?}");
    text
}

/// Next non-data event.
pub async fn next_control_event(reader: &mut AttachmentReader) -> SessionEvent {
    timeout(WAIT, async {
        loop {
            match reader.next_event().await.unwrap() {
                SessionEvent::Data(_) => continue,
                other => return other,
            }
        }
    })
    .await
    .expect("no event before timeout")
}
