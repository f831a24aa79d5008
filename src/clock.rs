//! Lamport logical clock.
//!
//! Owned by exactly one machine's event loop, so it is a plain counter with
//! no interior synchronisation.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClockError {
    #[error("logical clock overflow at {0}")]
    Overflow(u64),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogicalClock {
    value: u64,
}

impl LogicalClock {
    pub fn new() -> Self {
        Self { value: 0 }
    }

    pub fn with_value(value: u64) -> Self {
        Self { value }
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    /// Local event (internal or send). Returns the new value.
    pub fn tick(&mut self) -> Result<u64, ClockError> {
        self.value = self.value.checked_add(1).ok_or(ClockError::Overflow(self.value))?;
        Ok(self.value)
    }

    /// Receive event: `max(local, received) + 1`. Returns the new value.
    pub fn witness(&mut self, received: u64) -> Result<u64, ClockError> {
        let base = self.value.max(received);
        self.value = base.checked_add(1).ok_or(ClockError::Overflow(base))?;
        Ok(self.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_increments_by_one() {
        let mut clock = LogicalClock::new();
        assert_eq!(clock.tick(), Ok(1));
        assert_eq!(clock.tick(), Ok(2));
        assert_eq!(clock.value(), 2);
    }

    #[test]
    fn test_witness_takes_max_plus_one() {
        let mut clock = LogicalClock::with_value(3);
        // Remote ahead
        assert_eq!(clock.witness(10), Ok(11));
        // Remote behind
        assert_eq!(clock.witness(4), Ok(12));
        // Equal
        assert_eq!(clock.witness(12), Ok(13));
    }

    #[test]
    fn test_overflow_is_reported() {
        let mut clock = LogicalClock::with_value(u64::MAX);
        assert_eq!(clock.tick(), Err(ClockError::Overflow(u64::MAX)));
        let mut clock = LogicalClock::new();
        assert_eq!(clock.witness(u64::MAX), Err(ClockError::Overflow(u64::MAX)));
    }
}
