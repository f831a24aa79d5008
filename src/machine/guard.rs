// src/machine/guard.rs - Clock invariants checked on every event
use crate::event_log::{EventKind, EventRecord};

/// Check one clock transition.
///
/// `previous` is the clock before the event. `transmitted` is the sender's
/// clock for a receive when it is known; offline checks pass `None`.
pub fn check_transition(
    previous: u64,
    kind: EventKind,
    clock: u64,
    transmitted: Option<u64>,
) -> Result<(), String> {
    match kind {
        EventKind::Internal | EventKind::Send => {
            if previous.checked_add(1) != Some(clock) {
                return Err(format!("{} event moved clock {} -> {}, expected +1", kind, previous, clock));
            }
        }
        EventKind::Receive => {
            if clock <= previous {
                return Err(format!("receive event moved clock {} -> {}, expected an increase", previous, clock));
            }
            if let Some(m) = transmitted {
                let expected = previous.max(m).checked_add(1);
                if expected != Some(clock) {
                    return Err(format!(
                        "receive of {} moved clock {} -> {}, expected max({}, {}) + 1",
                        m, previous, clock, previous, m
                    ));
                }
            }
        }
    }
    Ok(())
}

/// Tracks the last recorded clock of one machine.
#[derive(Debug, Clone, Default)]
pub struct InvariantGuard {
    last_clock: u64,
    records: u64,
}

impl InvariantGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(&mut self, record: &EventRecord, transmitted: Option<u64>) -> Result<(), String> {
        check_transition(self.last_clock, record.kind, record.clock, transmitted)
            .map_err(|e| format!("record #{}: {}", self.records + 1, e))?;
        self.last_clock = record.clock;
        self.records += 1;
        Ok(())
    }

    pub fn records(&self) -> u64 {
        self.records
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_events_must_add_one() {
        assert!(check_transition(4, EventKind::Internal, 5, None).is_ok());
        assert!(check_transition(4, EventKind::Send, 5, None).is_ok());
        assert!(check_transition(4, EventKind::Internal, 6, None).is_err());
        assert!(check_transition(4, EventKind::Send, 4, None).is_err());
    }

    #[test]
    fn test_receive_rule() {
        assert!(check_transition(2, EventKind::Receive, 8, Some(7)).is_ok());
        assert!(check_transition(9, EventKind::Receive, 10, Some(7)).is_ok());
        assert!(check_transition(9, EventKind::Receive, 11, Some(7)).is_err());
        // Offline: only the increase is checkable
        assert!(check_transition(9, EventKind::Receive, 40, None).is_ok());
        assert!(check_transition(9, EventKind::Receive, 9, None).is_err());
    }

    #[test]
    fn test_guard_tracks_last_clock() {
        let mut guard = InvariantGuard::new();
        guard.check(&EventRecord::now(EventKind::Internal, 0, 1), None).unwrap();
        guard.check(&EventRecord::now(EventKind::Receive, 0, 6), Some(5)).unwrap();
        let err = guard.check(&EventRecord::now(EventKind::Send, 0, 6), None).unwrap_err();
        assert!(err.starts_with("record #3"));
        assert_eq!(guard.records(), 2);
    }
}
