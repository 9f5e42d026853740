//! Connection set, controller slot and replay buffer of one session.
//!
//! Output ingestion, replay snapshots and controller swaps all happen inside
//! a single short critical section that performs no I/O. Each connection is
//! fed through a bounded queue drained by its own task; a connection whose
//! queue is full or gone is evicted instead of slowing everyone else down.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tether_core::codec::{encode_raw, frame_encode};
use tether_core::frame::{ExitPayload, WelcomePayload};
use tether_core::{Capability, Frame, FrameType, SignalKind, SpawnPayload, TetherResult, MAX_PAYLOAD};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::session::ring_buffer::ReplayBuffer;

pub type ConnId = u64;

/// Pre-encoded frame bytes shared by every queue they are pushed to.
pub type Outbound = Arc<[u8]>;

/// Requests from connection tasks to the session loop that owns the process.
#[derive(Debug)]
pub enum Command {
    Input(Vec<u8>),
    Resize { rows: u16, cols: u16 },
    Signal(SignalKind),
    Spawn(SpawnPayload),
}

struct ConnSlot {
    capability: Capability,
    tx: mpsc::Sender<Outbound>,
}

struct BrokerState {
    conns: HashMap<ConnId, ConnSlot>,
    controller: Option<ConnId>,
    replay: ReplayBuffer,
    rows: u16,
    cols: u16,
    closed: bool,
}

/// Shared broker state for one session.
pub struct Broker {
    session_id: String,
    scope_key: String,
    queue_depth: usize,
    next_conn_id: AtomicU64,
    state: Mutex<BrokerState>,
    commands: mpsc::Sender<Command>,
}

impl Broker {
    pub fn new(
        session_id: &str,
        scope_key: &str,
        replay_capacity: usize,
        queue_depth: usize,
        (rows, cols): (u16, u16),
        commands: mpsc::Sender<Command>,
    ) -> Arc<Self> {
        Arc::new(Self {
            session_id: session_id.to_string(),
            scope_key: scope_key.to_string(),
            // WELCOME and REPLAY must both fit in a fresh queue.
            queue_depth: queue_depth.max(2),
            next_conn_id: AtomicU64::new(1),
            state: Mutex::new(BrokerState {
                conns: HashMap::new(),
                controller: None,
                replay: ReplayBuffer::new(replay_capacity.min(MAX_PAYLOAD)),
                rows,
                cols,
                closed: false,
            }),
            commands,
        })
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        // A panic while holding the lock leaves plain data behind; keep serving.
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Register an established connection.
    ///
    /// WELCOME and the replay snapshot are queued and the connection joins the
    /// broadcast set in one step, so the first live `DATA` it sees directly
    /// follows the replayed bytes. A controller displaces the previous one.
    pub fn admit(&self, capability: Capability) -> TetherResult<Option<(ConnId, mpsc::Receiver<Outbound>)>> {
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.queue_depth);

        let mut state = self.lock();
        if state.closed {
            return Ok(None);
        }

        let welcome = frame_encode(&Frame::Welcome(WelcomePayload {
            session_id: self.session_id.clone(),
            scope_key: self.scope_key.clone(),
            connection_id: id,
            rows: state.rows,
            cols: state.cols,
        }))?;
        let replay = encode_raw(FrameType::Replay, &state.replay.snapshot())?;
        // Fresh channel with capacity >= 2: neither send can fail.
        let _ = tx.try_send(welcome.into());
        let _ = tx.try_send(replay.into());

        state.conns.insert(id, ConnSlot { capability, tx });
        if capability == Capability::Controller {
            if let Some(previous) = state.controller.replace(id) {
                state.conns.remove(&previous);
                info!(conn_id = id, displaced = previous, "controller replaced");
            }
        }
        let total = state.conns.len();
        drop(state);

        info!(conn_id = id, %capability, connections = total, "connection established");
        Ok(Some((id, rx)))
    }

    /// Append process output to the replay buffer and fan it out.
    pub fn ingest_output(&self, data: &[u8]) {
        let frames: Vec<Outbound> = data
            .chunks(MAX_PAYLOAD)
            .filter_map(|chunk| encode_raw(FrameType::Data, chunk).ok())
            .map(Outbound::from)
            .collect();

        let mut state = self.lock();
        state.replay.write(data);
        for frame in frames {
            Self::broadcast_locked(&mut state, frame);
        }
    }

    fn broadcast_locked(state: &mut BrokerState, frame: Outbound) {
        let mut evicted = Vec::new();
        for (id, slot) in &state.conns {
            if let Err(e) = slot.tx.try_send(frame.clone()) {
                match e {
                    mpsc::error::TrySendError::Full(_) => {
                        warn!(conn_id = id, "outbound queue full, evicting connection")
                    }
                    mpsc::error::TrySendError::Closed(_) => {
                        debug!(conn_id = id, "connection gone, removing")
                    }
                }
                evicted.push(*id);
            }
        }
        for id in evicted {
            state.conns.remove(&id);
            if state.controller == Some(id) {
                state.controller = None;
            }
        }
    }

    /// Broadcast EXIT and drop every connection. Later admissions are refused.
    pub fn close_all(&self, code: Option<i32>) {
        let exit = match frame_encode(&Frame::Exit(ExitPayload { code })) {
            Ok(bytes) => Outbound::from(bytes),
            Err(e) => {
                warn!(error = %e, "failed to encode EXIT");
                Outbound::from(Vec::new())
            }
        };
        let mut state = self.lock();
        state.closed = true;
        if !exit.is_empty() {
            Self::broadcast_locked(&mut state, exit);
        }
        let count = state.conns.len();
        state.conns.clear();
        state.controller = None;
        drop(state);
        info!(?code, connections = count, "session closed");
    }

    /// Forget a connection whose task has finished.
    pub fn remove(&self, id: ConnId) {
        let mut state = self.lock();
        if state.conns.remove(&id).is_some() {
            if state.controller == Some(id) {
                state.controller = None;
            }
            debug!(conn_id = id, remaining = state.conns.len(), "connection removed");
        }
    }

    /// Whether `id` is still part of the broadcast set.
    pub fn is_attached(&self, id: ConnId) -> bool {
        self.lock().conns.contains_key(&id)
    }

    pub fn controller(&self) -> Option<ConnId> {
        self.lock().controller
    }

    pub fn connection_count(&self) -> usize {
        self.lock().conns.len()
    }

    pub fn capability_of(&self, id: ConnId) -> Option<Capability> {
        self.lock().conns.get(&id).map(|slot| slot.capability)
    }

    pub fn set_size(&self, rows: u16, cols: u16) {
        let mut state = self.lock();
        state.rows = rows;
        state.cols = cols;
    }

    /// Hand a request to the session loop. Fails once the loop has stopped.
    pub async fn submit(&self, command: Command) -> bool {
        self.commands.send(command).await.is_ok()
    }
}
