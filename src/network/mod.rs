// src/network/mod.rs - TCP plumbing between machines
pub mod codec;
pub mod link;
pub mod listener;

use std::io;
use std::net::SocketAddr;
use thiserror::Error;

use crate::message::MachineId;

pub use link::{PeerLink, PeerLinks, RetryPolicy};
pub use listener::{Handshake, Listener};

/// Errors from binding, connecting, framing and writing.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to bind {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },

    #[error("Connection to machine {peer} at {addr} failed after {attempts} attempts: {reason}")]
    ConnectFailed {
        peer: MachineId,
        addr: SocketAddr,
        attempts: u32,
        reason: String,
    },

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Link to machine {0} is closed")]
    Disconnected(MachineId),

    #[error("Write to machine {0} timed out")]
    WriteTimeout(MachineId),

    #[error("No link to machine {0}")]
    UnknownPeer(MachineId),
}

pub type Result<T> = std::result::Result<T, NetworkError>;
