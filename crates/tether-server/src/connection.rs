//! Per-connection task: handshake, then pump the outbound queue to the
//! socket while dispatching inbound frames to the session loop.

use std::sync::Arc;
use std::time::Duration;

use tether_core::{Capability, Frame, FrameReader, RawFrame};
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tracing::{debug, warn};

use crate::broker::{Broker, Command, ConnId};
use crate::handshake::await_hello;

pub async fn serve_connection(broker: Arc<Broker>, stream: UnixStream, handshake_timeout: Duration) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = FrameReader::new(read_half);

    let hello = match await_hello(&mut reader, handshake_timeout).await {
        Ok(hello) => hello,
        Err(e) => {
            warn!(error = %e, "handshake rejected");
            return;
        }
    };

    let (id, mut outbound) = match broker.admit(hello.capability) {
        Ok(Some(admitted)) => admitted,
        Ok(None) => {
            debug!("session is shutting down, refusing connection");
            return;
        }
        Err(e) => {
            warn!(error = %e, "failed to admit connection");
            return;
        }
    };

    loop {
        tokio::select! {
            next = outbound.recv() => match next {
                Some(bytes) => {
                    if let Err(e) = write_half.write_all(&bytes).await {
                        debug!(conn_id = id, error = %e, "write failed");
                        break;
                    }
                }
                // Displaced, evicted, or the session closed.
                None => break,
            },
            incoming = reader.read_raw() => match incoming {
                Ok(Some(raw)) => {
                    if !dispatch(&broker, id, raw).await {
                        break;
                    }
                }
                Ok(None) => {
                    debug!(conn_id = id, "peer closed connection");
                    break;
                }
                Err(e) => {
                    warn!(conn_id = id, error = %e, "protocol error, closing connection");
                    break;
                }
            },
        }
    }

    broker.remove(id);
    let _ = write_half.shutdown().await;
}

/// Act on one inbound frame. Returns `false` when the connection should close.
async fn dispatch(broker: &Broker, id: ConnId, raw: RawFrame) -> bool {
    if raw.kind.is_privileged() && broker.capability_of(id) != Some(Capability::Controller) {
        debug!(conn_id = id, kind = ?raw.kind, "ignoring privileged frame from non-controller");
        return true;
    }

    let command = match Frame::decode(raw) {
        Ok(Frame::Data(bytes)) => Command::Input(bytes),
        Ok(Frame::Resize(size)) => Command::Resize {
            rows: size.rows,
            cols: size.cols,
        },
        Ok(Frame::Signal(signal)) => Command::Signal(signal.kind),
        Ok(Frame::Spawn(spawn)) => Command::Spawn(spawn),
        Ok(other) => {
            debug!(conn_id = id, kind = ?other.kind(), "ignoring unexpected frame");
            return true;
        }
        Err(e) => {
            warn!(conn_id = id, error = %e, "malformed frame, closing connection");
            return false;
        }
    };
    broker.submit(command).await
}
