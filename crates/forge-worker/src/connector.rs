// Maintains the worker's links: the persistent control connection to the
// master (Property handshake, heartbeats, automatic reconnect), per-file
// data connections for artifact streaming, the UDP task-log channel and,
// on the merger, the passive listener fragments arrive on.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio_util::codec::{Encoder, Framed, FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use forge_common::codec::LetterCodec;
use forge_common::config::WorkerConfig;
use forge_common::letter::{
    BinaryLetter, HeartbeatLetter, Letter, PropertyLetter, TaskLogLetter,
};

use crate::output::{Output, TARGET_MASTER, TARGET_MERGER};

/// Delay before a reconnect attempt.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Pace of outgoing heartbeats once the previous one was echoed.
const HEARTBEAT_PACE: Duration = Duration::from_secs(2);

/// An echo gap beyond this tears the link down for a reconnect.
const HEARTBEAT_LIMIT: Duration = Duration::from_secs(10);

/// Chunk size for artifact streaming.
const FILE_CHUNK: usize = 64 * 1024;

pub struct Connector {
    config: Arc<WorkerConfig>,
    ident: String,
    out_tx: mpsc::Sender<Letter>,
    out_rx: Mutex<Option<mpsc::Receiver<Letter>>>,
    req_tx: mpsc::Sender<Letter>,
    udp: UdpSocket,
}

impl Connector {
    pub async fn new(
        config: Arc<WorkerConfig>,
        ident: impl Into<String>,
        req_tx: mpsc::Sender<Letter>,
    ) -> anyhow::Result<Arc<Self>> {
        let (out_tx, out_rx) = mpsc::channel(256);
        let udp = UdpSocket::bind("0.0.0.0:0").await?;
        Ok(Arc::new(Self {
            config,
            ident: ident.into(),
            out_tx,
            out_rx: Mutex::new(Some(out_rx)),
            req_tx,
            udp,
        }))
    }

    pub fn ident(&self) -> &str {
        &self.ident
    }

    /// Keep the control link to the master alive forever: connect,
    /// handshake, pump letters, and on any failure retry after a pause.
    pub async fn run_control_link(self: Arc<Self>, cancel: CancellationToken) {
        let mut out_rx = self
            .out_rx
            .lock()
            .unwrap()
            .take()
            .expect("control link already running");

        let master = &self.config.master_address;
        loop {
            if cancel.is_cancelled() {
                return;
            }

            match TcpStream::connect((master.host.as_str(), master.port)).await {
                Ok(stream) => {
                    tracing::info!("connected to master {}:{}", master.host, master.port);
                    if let Err(e) = self.drive_link(stream, &mut out_rx, &cancel).await {
                        tracing::warn!("control link lost: {e:#}");
                    }
                }
                Err(e) => {
                    tracing::debug!("master not reachable: {e}");
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
            }
        }
    }

    /// One connected session: declare properties, drive heartbeats and
    /// shuttle letters until the link dies.
    async fn drive_link(
        &self,
        stream: TcpStream,
        out_rx: &mut mpsc::Receiver<Letter>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        let mut framed = Framed::new(stream, LetterCodec::new());

        // The master resets our in-flight count on accept, so PROC is 0.
        framed
            .send(Letter::Property(PropertyLetter::new(
                &self.ident,
                self.config.max_task_can_proc,
                0,
                self.config.role,
            )))
            .await?;

        framed
            .send(Letter::Heartbeat(HeartbeatLetter::new(&self.ident, 0)))
            .await?;
        let mut next_seq: u64 = 1;
        let mut awaiting_echo = true;
        let mut last_echo = Instant::now();

        let mut pace = tokio::time::interval(HEARTBEAT_PACE);
        pace.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),

                outgoing = out_rx.recv() => {
                    let Some(letter) = outgoing else { return Ok(()) };
                    framed.send(letter).await?;
                }

                _ = pace.tick() => {
                    if last_echo.elapsed() > HEARTBEAT_LIMIT {
                        anyhow::bail!("heartbeat echo lost");
                    }
                    if !awaiting_echo {
                        framed
                            .send(Letter::Heartbeat(HeartbeatLetter::new(&self.ident, next_seq)))
                            .await?;
                        awaiting_echo = true;
                    }
                }

                inbound = framed.next() => {
                    match inbound {
                        Some(Ok(Letter::Heartbeat(hb))) => {
                            last_echo = Instant::now();
                            awaiting_echo = false;
                            next_seq = hb.header.seq + 1;
                        }
                        Some(Ok(letter)) => {
                            if self.req_tx.send(letter).await.is_err() {
                                return Ok(());
                            }
                        }
                        Some(Err(e)) => anyhow::bail!(e),
                        None => anyhow::bail!("master closed the connection"),
                    }
                }
            }
        }
    }

    /// The merger's passive side: accept fragment streams from sibling
    /// workers and feed the frames to the processor.
    pub async fn run_data_listener(
        self: Arc<Self>,
        listener: TcpListener,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                accepted = listener.accept() => {
                    let Ok((stream, peer)) = accepted else { continue };
                    tracing::debug!("fragment stream from {peer}");

                    let req_tx = self.req_tx.clone();
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        let mut frames = FramedRead::new(stream, LetterCodec::new());
                        loop {
                            tokio::select! {
                                _ = cancel.cancelled() => return,
                                frame = frames.next() => {
                                    match frame {
                                        Some(Ok(letter @ Letter::Binary(_))) => {
                                            if req_tx.send(letter).await.is_err() {
                                                return;
                                            }
                                        }
                                        Some(Ok(_)) => {}
                                        Some(Err(e)) => {
                                            tracing::debug!("fragment stream error: {e}");
                                            return;
                                        }
                                        None => return,
                                    }
                                }
                            }
                        }
                    });
                }
            }
        }
    }

    fn data_endpoint(&self, target: &str) -> anyhow::Result<(String, u16)> {
        match target {
            TARGET_MASTER => Ok((
                self.config.master_address.host.clone(),
                self.config.master_address.data_port,
            )),
            TARGET_MERGER => {
                let merger = self
                    .config
                    .merger_address
                    .as_ref()
                    .ok_or_else(|| anyhow::anyhow!("no merger address configured"))?;
                Ok((merger.host.clone(), merger.data_port))
            }
            other => anyhow::bail!("unknown stream target '{other}'"),
        }
    }
}

#[async_trait]
impl Output for Connector {
    async fn send(&self, letter: Letter) -> anyhow::Result<()> {
        self.out_tx
            .send(letter)
            .await
            .map_err(|_| anyhow::anyhow!("control link is gone"))
    }

    async fn send_file(
        &self,
        target: &str,
        path: &Path,
        tid: &str,
        version: &str,
        file_name: &str,
        menu: &str,
    ) -> anyhow::Result<()> {
        let (host, port) = self.data_endpoint(target)?;
        let stream = TcpStream::connect((host.as_str(), port)).await?;
        let mut frames = FramedWrite::new(stream, LetterCodec::new());

        let mut file = tokio::fs::File::open(path).await?;
        let mut buf = vec![0u8; FILE_CHUNK];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            frames
                .send(Letter::Binary(BinaryLetter::new(
                    tid,
                    Bytes::copy_from_slice(&buf[..n]),
                    file_name,
                    version,
                    menu,
                )))
                .await?;
        }

        frames
            .send(Letter::Binary(BinaryLetter::new(
                tid,
                Bytes::new(),
                file_name,
                version,
                menu,
            )))
            .await?;
        frames.flush().await?;
        Ok(())
    }

    async fn task_log(&self, tid: &str, message: &str) {
        let log_port = self.config.master_address.log_port;
        if log_port == 0 {
            return;
        }

        let mut frame = BytesMut::new();
        if LetterCodec::new()
            .encode(Letter::TaskLog(TaskLogLetter::new(tid, message)), &mut frame)
            .is_err()
        {
            return;
        }

        let _ = self
            .udp
            .send_to(&frame, (self.config.master_address.host.as_str(), log_port))
            .await;
    }
}
