// Per-session event loop and the type-keyed handler registry.
// One cooperative task per online worker reads frames, echoes heartbeats
// and fans other letters out to every handler registered for their type.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use forge_common::codec::LetterCodec;
use forge_common::letter::{HeartbeatLetter, Letter};
use futures::stream::SplitStream;
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::worker::WorkerRef;
use crate::worker_room::WorkerRoom;

/// Receive poll interval; the loop wakes at least this often to drive
/// heartbeat maintenance.
const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// A heartbeat gap beyond this marks the session dead.
const HEARTBEAT_LIMIT: Duration = Duration::from_secs(10);

/// Ident the master answers heartbeats with.
const MASTER_IDENT: &str = "Master";

/// A handler for one letter type. Handlers may block on I/O; failures are
/// logged and never tear down the session loop.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, worker: &WorkerRef, letter: Letter) -> anyhow::Result<()>;
}

#[derive(Default)]
pub struct EventRouter {
    handlers: RwLock<HashMap<String, Vec<Arc<dyn EventHandler>>>>,
}

impl EventRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a handler for a wire type. Handlers run in registration
    /// order.
    pub fn register(&self, type_name: &str, handler: Arc<dyn EventHandler>) {
        self.handlers
            .write()
            .unwrap()
            .entry(type_name.to_string())
            .or_default()
            .push(handler);
    }

    fn handlers_for(&self, type_name: &str) -> Vec<Arc<dyn EventHandler>> {
        self.handlers
            .read()
            .unwrap()
            .get(type_name)
            .cloned()
            .unwrap_or_default()
    }

    /// Drive one worker session until it dies or is superseded.
    pub async fn run_session<S>(
        self: Arc<Self>,
        room: Arc<WorkerRoom>,
        worker: WorkerRef,
        mut reader: SplitStream<Framed<S, LetterCodec>>,
        session: CancellationToken,
    ) where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let generation = worker.session_generation();
        let ident = worker.ident().to_string();

        loop {
            let frame = tokio::select! {
                _ = session.cancelled() => break,
                frame = tokio::time::timeout(RECV_TIMEOUT, reader.next()) => frame,
            };

            match frame {
                // Receive timeout: nothing arrived, fall through to the
                // heartbeat check below.
                Err(_) => {}

                Ok(None) => {
                    tracing::debug!("session {ident}: stream closed");
                    break;
                }

                Ok(Some(Err(e))) => {
                    tracing::debug!("session {ident}: transport error: {e}");
                    break;
                }

                Ok(Some(Ok(Letter::Heartbeat(hb)))) => {
                    // Mismatched sequences are dropped, not fatal.
                    if worker.heartbeat(hb.header.seq) {
                        let echo = Letter::Heartbeat(HeartbeatLetter::new(
                            MASTER_IDENT,
                            hb.header.seq,
                        ));
                        if worker.send(echo).await.is_err() {
                            break;
                        }
                    }
                }

                Ok(Some(Ok(letter))) => {
                    let type_name = letter.type_name();
                    for handler in self.handlers_for(type_name) {
                        if let Err(e) = handler.handle(&worker, letter.clone()).await {
                            tracing::error!(
                                "handler for '{type_name}' failed on session {ident}: {e:#}"
                            );
                        }
                    }
                }
            }

            if worker.heartbeat_elapsed() > HEARTBEAT_LIMIT {
                tracing::info!("session {ident}: heartbeat lost");
                break;
            }
        }

        // Stop exactly once; an adopted session (newer generation) must not
        // push the record back into WAITING.
        session.cancel();
        if worker.session_generation() == generation {
            room.mark_disconnected(&ident).await;
        }
    }
}
