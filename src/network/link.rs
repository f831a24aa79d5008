// src/network/link.rs - Outbound connections to peers
use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::{codec, NetworkError, Result};
use crate::config::NetworkConfig;
use crate::machine::Outbox;
use crate::message::{MachineId, Message};

/// Connection retry behaviour during mesh setup.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            backoff_multiplier: 2.0,
        }
    }
}

impl From<&NetworkConfig> for RetryPolicy {
    fn from(config: &NetworkConfig) -> Self {
        Self {
            max_attempts: config.connect_attempts,
            initial_delay: Duration::from_millis(config.connect_backoff_ms),
            max_delay: Duration::from_millis(config.max_backoff_ms),
            ..Self::default()
        }
    }
}

/// One long-lived outbound connection.
///
/// A failed write marks the link dead; later sends fail fast with
/// [`NetworkError::Disconnected`]. There is no reconnect.
#[derive(Debug)]
pub struct PeerLink {
    peer: MachineId,
    addr: SocketAddr,
    stream: Option<TcpStream>,
    write_timeout: Duration,
}

impl PeerLink {
    /// Connect to `peer` and introduce ourselves as `local`.
    pub async fn connect(
        local: MachineId,
        peer: MachineId,
        addr: SocketAddr,
        retry: &RetryPolicy,
        write_timeout: Duration,
    ) -> Result<Self> {
        let mut attempts = 0;
        let mut delay = retry.initial_delay;
        loop {
            attempts += 1;
            match Self::open(local, addr).await {
                Ok(stream) => {
                    tracing::info!("Machine {}: outbound link to machine {} at {} established", local, peer, addr);
                    return Ok(Self {
                        peer,
                        addr,
                        stream: Some(stream),
                        write_timeout,
                    });
                }
                Err(e) if attempts >= retry.max_attempts => {
                    return Err(NetworkError::ConnectFailed {
                        peer,
                        addr,
                        attempts,
                        reason: e.to_string(),
                    });
                }
                Err(e) => {
                    tracing::warn!(
                        "Machine {}: connect to machine {} failed (attempt {}), retrying in {}ms: {}",
                        local,
                        peer,
                        attempts,
                        delay.as_millis(),
                        e
                    );
                    tokio::time::sleep(delay).await;
                    delay = std::cmp::min(
                        Duration::from_secs_f64(delay.as_secs_f64() * retry.backoff_multiplier),
                        retry.max_delay,
                    );
                }
            }
        }
    }

    async fn open(local: MachineId, addr: SocketAddr) -> std::io::Result<TcpStream> {
        let mut stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        stream.write_all(&codec::encode_hello(local)).await?;
        stream.flush().await?;
        Ok(stream)
    }

    pub fn peer(&self) -> MachineId {
        self.peer
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub async fn send(&mut self, message: &Message) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(NetworkError::Disconnected(self.peer))?;
        let frame = codec::encode_frame(message);
        let outcome = match timeout(self.write_timeout, stream.write_all(&frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(NetworkError::Io(e)),
            Err(_) => Err(NetworkError::WriteTimeout(self.peer)),
        };
        if outcome.is_err() {
            self.stream = None;
        }
        outcome
    }

    /// Half-close and drop the connection. The peer's reader sees EOF.
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                tracing::debug!("Closing link to machine {}: {}", self.peer, e);
            }
        }
    }
}

/// All of one machine's outbound links, ordered by peer id.
#[derive(Debug)]
pub struct PeerLinks {
    peers: Vec<MachineId>,
    links: Vec<PeerLink>,
}

impl PeerLinks {
    pub fn new(mut links: Vec<PeerLink>) -> Self {
        links.sort_by_key(|l| l.peer);
        let peers = links.iter().map(|l| l.peer).collect();
        Self { peers, links }
    }

    pub fn get_mut(&mut self, peer: MachineId) -> Option<&mut PeerLink> {
        self.links.iter_mut().find(|l| l.peer == peer)
    }
}

#[async_trait]
impl Outbox for PeerLinks {
    fn peers(&self) -> &[MachineId] {
        &self.peers
    }

    async fn send(&mut self, to: MachineId, message: Message) -> Result<()> {
        let link = self.get_mut(to).ok_or(NetworkError::UnknownPeer(to))?;
        link.send(&message).await
    }

    async fn close(&mut self) {
        for link in &mut self.links {
            link.close().await;
        }
    }
}
