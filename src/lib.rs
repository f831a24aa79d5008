//! # clocksim
//!
//! In-process simulation of a small distributed system: virtual machines
//! ticking at independent rates, exchanging Lamport-timestamped messages over
//! loopback TCP and logging every event for offline analysis.

pub mod analysis;
pub mod clock;
pub mod config;
pub mod event_log;
pub mod machine;
pub mod message;
pub mod network;
pub mod queue;
pub mod random;
pub mod simulation;

pub use clock::LogicalClock;
pub use config::{load_config, Config};
pub use event_log::{EventKind, EventRecord};
pub use message::{MachineId, Message};
pub use simulation::{SimulationController, SimulationError, SimulationReport};
