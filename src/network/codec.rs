//! Wire format.
//!
//! A connection opens with an 8-byte hello (`u32` magic, `u32` sender id) and
//! then carries fixed 12-byte frames (`u32` sender id, `u64` clock). All
//! integers are big-endian.

use tokio::io::{AsyncRead, AsyncReadExt};

use super::{NetworkError, Result};
use crate::message::{MachineId, Message};

pub const MAGIC: u32 = 0x4C43_4C4B; // "LCLK"
pub const HELLO_LEN: usize = 8;
pub const FRAME_LEN: usize = 12;

pub fn encode_hello(sender: MachineId) -> [u8; HELLO_LEN] {
    let mut buf = [0u8; HELLO_LEN];
    buf[..4].copy_from_slice(&MAGIC.to_be_bytes());
    buf[4..].copy_from_slice(&sender.0.to_be_bytes());
    buf
}

pub fn decode_hello(buf: &[u8; HELLO_LEN]) -> Result<MachineId> {
    let magic = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if magic != MAGIC {
        return Err(NetworkError::InvalidFrame(format!("bad magic {:#010x}", magic)));
    }
    Ok(MachineId(u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]])))
}

pub fn encode_frame(message: &Message) -> [u8; FRAME_LEN] {
    let mut buf = [0u8; FRAME_LEN];
    buf[..4].copy_from_slice(&message.sender.0.to_be_bytes());
    buf[4..].copy_from_slice(&message.clock.to_be_bytes());
    buf
}

pub fn decode_frame(buf: &[u8; FRAME_LEN]) -> Message {
    let sender = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let mut clock = [0u8; 8];
    clock.copy_from_slice(&buf[4..]);
    Message::new(MachineId(sender), u64::from_be_bytes(clock))
}

pub async fn read_hello<R: AsyncRead + Unpin>(reader: &mut R) -> Result<MachineId> {
    let mut buf = [0u8; HELLO_LEN];
    reader.read_exact(&mut buf).await?;
    decode_hello(&buf)
}

/// Next frame, or `None` on a clean close between frames.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Message>> {
    let mut buf = [0u8; FRAME_LEN];
    let mut filled = 0;
    while filled < FRAME_LEN {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(NetworkError::InvalidFrame(format!(
                "connection closed mid-frame after {} of {} bytes",
                filled, FRAME_LEN
            )));
        }
        filled += n;
    }
    Ok(Some(decode_frame(&buf)))
}
