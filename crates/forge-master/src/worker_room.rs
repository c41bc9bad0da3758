// Registry of connected workers and their session lifecycle:
// accept -> Property handshake -> ONLINE; disconnect -> WAITING (tasks
// held); grace expiry -> OFFLINE (record removed, tasks redispatched).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use forge_common::codec::LetterCodec;
use forge_common::letter::{CommandKind, CommandLetter, Letter, WorkerRole};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::event_router::EventRouter;
use crate::worker::{Worker, WorkerRef, WorkerState};

/// Seconds a connecting worker gets to declare its Property letter.
const PROPERTY_TIMEOUT: Duration = Duration::from_secs(3);

/// Capacity of the per-session outbound letter queue.
const SEND_QUEUE_CAP: usize = 256;

/// Membership events published to subscribers (the dispatcher drives
/// redispatch off `Disconn`).
#[derive(Debug, Clone)]
pub enum RoomEvent {
    Conn(WorkerRef),
    InWait(WorkerRef),
    Disconn(WorkerRef),
}

pub struct WorkerRoom {
    online: Mutex<HashMap<String, WorkerRef>>,
    waiting: tokio::sync::Mutex<HashMap<String, WorkerRef>>,
    events: broadcast::Sender<RoomEvent>,
    waiting_interval: Duration,
    stable_thres: Duration,
    last_change: Mutex<Instant>,
    router: Arc<EventRouter>,
}

impl WorkerRoom {
    pub fn new(waiting_interval: Duration, router: Arc<EventRouter>) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            online: Mutex::new(HashMap::new()),
            waiting: tokio::sync::Mutex::new(HashMap::new()),
            events,
            waiting_interval,
            stable_thres: waiting_interval + Duration::from_secs(1),
            last_change: Mutex::new(Instant::now()),
            router,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoomEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: RoomEvent) {
        let _ = self.events.send(event);
    }

    fn change_point(&self) {
        *self.last_change.lock().unwrap() = Instant::now();
    }

    /// Membership has not changed for longer than the grace window.
    pub fn is_stable(&self) -> bool {
        self.last_change.lock().unwrap().elapsed() >= self.stable_thres
    }

    pub fn get_worker(&self, ident: &str) -> Option<WorkerRef> {
        self.online.lock().unwrap().get(ident).cloned()
    }

    pub fn get_workers(&self) -> Vec<WorkerRef> {
        self.online.lock().unwrap().values().cloned().collect()
    }

    pub fn num_of_workers(&self) -> usize {
        self.online.lock().unwrap().len()
    }

    pub async fn num_of_workers_in_wait(&self) -> usize {
        self.waiting.lock().await.len()
    }

    pub fn is_exists(&self, ident: &str) -> bool {
        self.online.lock().unwrap().contains_key(ident)
    }

    /// Apply a worker-state-change report (WSC notify).
    pub fn set_worker_state(&self, ident: &str, state: WorkerState) {
        if let Some(worker) = self.get_worker(ident) {
            worker.set_state(state);
        }
    }

    pub async fn broadcast_command(&self, letter: CommandLetter) {
        for worker in self.get_workers() {
            let _ = worker.send(Letter::Command(letter.clone())).await;
        }
    }

    #[cfg(test)]
    pub(crate) fn install_for_test(&self, worker: WorkerRef) {
        self.online
            .lock()
            .unwrap()
            .insert(worker.ident().to_string(), worker);
        self.change_point();
    }

    /// Accept loop on the control-plane endpoint.
    pub async fn run_listener(
        self: Arc<Self>,
        listener: TcpListener,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            tracing::debug!("worker connection from {peer}");
                            let room = self.clone();
                            tokio::spawn(async move {
                                room.accept_session(stream).await;
                            });
                        }
                        Err(e) => {
                            tracing::warn!("accept failed: {e}");
                        }
                    }
                }
            }
        }
    }

    /// Handshake one incoming connection into an ONLINE worker session.
    pub async fn accept_session<S>(self: &Arc<Self>, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut framed = Framed::new(stream, LetterCodec::new());

        // The first frame must declare the worker's properties within 3 s.
        let property = match tokio::time::timeout(PROPERTY_TIMEOUT, framed.next()).await {
            Ok(Some(Ok(Letter::Property(p)))) => p,
            Ok(Some(Ok(other))) => {
                tracing::warn!("expected Property, got {}; closing", other.type_name());
                return;
            }
            Ok(Some(Err(e))) => {
                tracing::warn!("bad first frame: {e}");
                return;
            }
            Ok(None) => return,
            Err(_) => {
                tracing::warn!("worker did not declare properties in time; closing");
                return;
            }
        };

        let ident = property.header.ident.clone();

        if self.is_exists(&ident) {
            tracing::warn!("worker {ident} is already online; refusing duplicate");
            return;
        }

        let (mut sink, reader) = framed.split();
        let (tx, mut rx) = mpsc::channel::<Letter>(SEND_QUEUE_CAP);
        let session = CancellationToken::new();

        // Serialized send path: one writer task drains the session queue.
        let writer_session = session.clone();
        let writer_ident = ident.clone();
        tokio::spawn(async move {
            while let Some(letter) = rx.recv().await {
                if let Err(e) = sink.send(letter).await {
                    tracing::debug!("send to {writer_ident} failed: {e}");
                    writer_session.cancel();
                    break;
                }
            }
        });

        // A WAITING worker with the same ident is adopted: its in-flight
        // tasks survive the reconnect.
        let adopted = {
            let mut waiting = self.waiting.lock().await;
            waiting.remove(&ident)
        };

        let worker = match adopted {
            Some(worker) => {
                worker.adopt_session(tx, session.clone());
                worker.set_state(WorkerState::Online);
                self.online.lock().unwrap().insert(ident.clone(), worker.clone());
                self.change_point();
                self.publish(RoomEvent::Conn(worker.clone()));

                let _ = worker
                    .send(Letter::Command(CommandLetter::new(CommandKind::Accept, "")))
                    .await;
                tracing::info!("worker {ident} reconnected");
                worker
            }
            None => {
                let role: WorkerRole = property.content.role;
                let worker = Worker::new(
                    ident.clone(),
                    role,
                    property.content.max,
                    tx,
                    session.clone(),
                );
                self.online.lock().unwrap().insert(ident.clone(), worker.clone());
                self.change_point();
                self.publish(RoomEvent::Conn(worker.clone()));

                // Fresh record: the worker must reset before taking work.
                let _ = worker
                    .send(Letter::Command(CommandLetter::new(CommandKind::AcceptRst, "")))
                    .await;
                tracing::info!(
                    "worker {ident} connected (role {}, max {})",
                    role,
                    property.content.max
                );
                worker
            }
        };

        let router = self.router.clone();
        let room = self.clone();
        tokio::spawn(async move {
            router.run_session(room, worker, reader, session).await;
        });
    }

    /// Move a live worker into the WAITING set after its session died.
    pub async fn mark_disconnected(&self, ident: &str) {
        let worker = {
            let mut online = self.online.lock().unwrap();
            online.remove(ident)
        };

        let Some(worker) = worker else { return };
        self.change_point();

        worker.drop_sender();
        worker.set_state(WorkerState::Waiting);
        self.waiting.lock().await.insert(ident.to_string(), worker.clone());
        tracing::info!("worker {ident} is in waiting state");
        self.publish(RoomEvent::InWait(worker));
    }

    /// Grace-expiry sweep; workers stuck in WAITING past the interval go
    /// OFFLINE and are removed.
    pub async fn run_maintain(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            }

            let expired: Vec<WorkerRef> = {
                let mut waiting = self.waiting.lock().await;
                let idents: Vec<String> = waiting
                    .values()
                    .filter(|w| w.state_duration() > self.waiting_interval)
                    .map(|w| w.ident().to_string())
                    .collect();
                idents
                    .iter()
                    .filter_map(|ident| waiting.remove(ident))
                    .collect()
            };

            for worker in expired {
                worker.set_state(WorkerState::Offline);
                tracing::info!("worker {} is disconnected", worker.ident());
                self.publish(RoomEvent::Disconn(worker));
            }
        }
    }
}
