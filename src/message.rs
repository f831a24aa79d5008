// src/message.rs - Machine identity and the timestamped message
use serde::{Deserialize, Serialize};
use std::fmt;

/// Index of a machine in `[0, N)`, fixed for the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MachineId(pub u32);

impl MachineId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A sender's logical clock value at the moment of sending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Message {
    pub sender: MachineId,
    pub clock: u64,
}

impl Message {
    pub fn new(sender: MachineId, clock: u64) -> Self {
        Self { sender, clock }
    }
}
