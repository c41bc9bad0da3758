// Bulk ingest paths kept away from the control plane: a TCP listener for
// artifact streams and a UDP intake for task-output log datagrams. Both
// run as their own tasks so heavy transfers never stall event handling.

use bytes::BytesMut;
use std::sync::Arc;
use tokio::net::{TcpListener, UdpSocket};
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;

use forge_common::codec::LetterCodec;
use forge_common::letter::Letter;
use futures::StreamExt;
use tokio_util::codec::FramedRead;

use crate::handlers::BinaryIngest;
use crate::pdb::{PersistentStore, POS_TAIL};

/// Accept artifact streams on the data endpoint and feed them to the
/// binary ingest. Non-binary frames on this port are ignored.
pub async fn run_binary_listener(
    listener: TcpListener,
    ingest: Arc<BinaryIngest>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => {
                let Ok((stream, peer)) = accepted else { continue };
                tracing::debug!("data link from {peer}");

                let ingest = ingest.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    let mut frames = FramedRead::new(stream, LetterCodec::new());
                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            frame = frames.next() => {
                                match frame {
                                    Some(Ok(Letter::Binary(bin))) => {
                                        if let Err(e) = ingest.ingest(bin).await {
                                            tracing::error!("binary ingest failed: {e:#}");
                                        }
                                    }
                                    Some(Ok(other)) => {
                                        tracing::debug!(
                                            "ignoring {} frame on data link",
                                            other.type_name()
                                        );
                                    }
                                    Some(Err(e)) => {
                                        tracing::debug!("data link error: {e}");
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

/// Receive TaskLog datagrams and append them to the task's persistent
/// output log. Datagrams for unknown tasks are dropped.
pub async fn run_task_log_intake(
    socket: UdpSocket,
    pdb: Arc<PersistentStore>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => return,
            received = socket.recv_from(&mut buf) => received,
        };

        let Ok((n, _peer)) = received else { continue };

        let mut bytes = BytesMut::from(&buf[..n]);
        let letter = match LetterCodec::new().decode(&mut bytes) {
            Ok(Some(letter)) => letter,
            Ok(None) => continue,
            Err(e) => {
                tracing::debug!("undecodable task-log datagram: {e}");
                continue;
            }
        };

        if let Letter::TaskLog(log) = letter {
            let tid = &log.header.ident;
            if !pdb.is_exists(tid) {
                continue;
            }
            if let Err(e) = pdb
                .write(tid, log.content.message.as_bytes(), POS_TAIL)
                .await
            {
                tracing::error!("task log append for {tid} failed: {e:#}");
            }
        }
    }
}
