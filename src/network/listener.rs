// src/network/listener.rs - Accept loop and per-connection readers
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::{JoinHandle, JoinSet};

use super::{codec, NetworkError, Result};
use crate::message::MachineId;
use crate::queue::QueueProducer;

/// Reported once per inbound connection that completed its hello.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub listener: MachineId,
    pub peer: MachineId,
}

/// A machine's bound listening socket.
#[derive(Debug)]
pub struct Listener {
    id: MachineId,
    inner: TcpListener,
    addr: SocketAddr,
}

impl Listener {
    pub async fn bind(id: MachineId, addr: SocketAddr) -> Result<Self> {
        let inner = TcpListener::bind(addr)
            .await
            .map_err(|source| NetworkError::Bind { addr, source })?;
        let addr = inner.local_addr()?;
        tracing::info!("Machine {} listening on {}", id, addr);
        Ok(Self { id, inner, addr })
    }

    pub fn id(&self) -> MachineId {
        self.id
    }

    /// Actual bound address (differs from the requested one for port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Run the accept loop until `shutdown` fires.
    ///
    /// Every accepted connection gets its own reader task feeding `producer`.
    /// On shutdown the listener is closed and all readers are cancelled.
    pub fn spawn(
        self,
        producer: QueueProducer,
        handshakes: mpsc::UnboundedSender<Handshake>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut readers = JoinSet::new();
            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        tracing::debug!("Listener for machine {} shutting down", self.id);
                        break;
                    }
                    accepted = self.inner.accept() => {
                        match accepted {
                            Ok((stream, remote)) => {
                                tracing::debug!("Machine {} accepted connection from {}", self.id, remote);
                                readers.spawn(read_connection(
                                    self.id,
                                    stream,
                                    producer.clone(),
                                    handshakes.clone(),
                                ));
                            }
                            Err(e) => {
                                tracing::warn!("Machine {} accept error: {}", self.id, e);
                            }
                        }
                    }
                    Some(finished) = readers.join_next(), if !readers.is_empty() => {
                        if let Err(e) = finished {
                            if e.is_panic() {
                                tracing::error!("Reader task for machine {} panicked: {}", self.id, e);
                            }
                        }
                    }
                }
            }
            drop(self.inner);
            readers.shutdown().await;
            tracing::debug!("Listener for machine {} closed", self.id);
        })
    }
}

async fn read_connection(
    local: MachineId,
    mut stream: TcpStream,
    producer: QueueProducer,
    handshakes: mpsc::UnboundedSender<Handshake>,
) {
    match serve_connection(local, &mut stream, &producer, &handshakes).await {
        Ok(Some(peer)) => {
            tracing::debug!("Machine {}: connection from machine {} closed", local, peer);
        }
        Ok(None) => {}
        Err(e) => {
            tracing::warn!("Machine {}: inbound connection dropped: {}", local, e);
        }
    }
}

/// Returns the peer id once the connection ends cleanly, `None` if the
/// queue's consumer went away first.
async fn serve_connection(
    local: MachineId,
    stream: &mut TcpStream,
    producer: &QueueProducer,
    handshakes: &mpsc::UnboundedSender<Handshake>,
) -> Result<Option<MachineId>> {
    let peer = codec::read_hello(stream).await?;
    tracing::info!("Machine {}: inbound link from machine {} established", local, peer);
    let _ = handshakes.send(Handshake { listener: local, peer });

    while let Some(message) = codec::read_frame(stream).await? {
        if message.sender != peer {
            return Err(NetworkError::InvalidFrame(format!(
                "frame claims sender {} on link from machine {}",
                message.sender, peer
            )));
        }
        tracing::trace!("Machine {} <- machine {}: clock {}", local, peer, message.clock);
        if producer.enqueue(message).is_err() {
            return Ok(None);
        }
    }
    Ok(Some(peer))
}
