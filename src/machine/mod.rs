//! # Virtual machine event engine
//!
//! One [`VirtualMachine`] per simulated process. It owns its logical clock,
//! its inbound [`MessageQueue`], its outbound links and its event sink, and
//! runs one event per tick at its fixed rate:
//!
//! - queue non-empty: take one message, `clock = max(clock, m) + 1`, record
//!   `receive`;
//! - otherwise draw from the [`EventSelector`]: a send action bumps the clock
//!   by one, transmits the new value to one or all peers and records a single
//!   `send`; anything else bumps the clock and records `internal`.
//!
//! A failed write to one peer is counted and logged; it never changes the
//! clock arithmetic and never stops the loop.

pub mod guard;

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::time::{sleep_until, Instant};

use crate::clock::{ClockError, LogicalClock};
use crate::event_log::{EventKind, EventRecord, EventSink, LogError};
use crate::message::{MachineId, Message};
use crate::network::NetworkError;
use crate::queue::MessageQueue;
use crate::random::{Action, EventSelector, RandomSource};

pub use guard::InvariantGuard;

#[derive(Debug, Error)]
pub enum MachineError {
    #[error("Event log error on machine {machine}: {source}")]
    Log { machine: MachineId, source: LogError },
    #[error("Clock error on machine {machine}: {source}")]
    Clock { machine: MachineId, source: ClockError },
    #[error("Invariant violated on machine {machine}: {detail}")]
    InvariantViolation { machine: MachineId, detail: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineState {
    Running,
    ShuttingDown,
    Stopped,
}

/// Where a machine's outbound messages go.
#[async_trait]
pub trait Outbox: Send {
    /// Peers in a fixed order; selector outcomes index into this.
    fn peers(&self) -> &[MachineId];
    async fn send(&mut self, to: MachineId, message: Message) -> Result<(), NetworkError>;
    async fn close(&mut self);
}

/// Per-machine counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MachineStats {
    pub internal_events: u64,
    pub send_events: u64,
    pub receive_events: u64,
    pub messages_sent: u64,
    pub transport_errors: u64,
}

/// What a machine reports once it has stopped.
#[derive(Debug, Clone, Serialize)]
pub struct MachineSummary {
    pub id: MachineId,
    pub rate: u32,
    pub final_clock: u64,
    pub pending_messages: usize,
    pub stats: MachineStats,
}

/// Shared tick schedule: slot `k` fires at `start + k / rate` and slots
/// after `deadline` never fire.
#[derive(Debug, Clone, Copy)]
pub struct RunWindow {
    pub start: Instant,
    pub deadline: Instant,
}

impl RunWindow {
    pub fn new(start: Instant, duration: Duration) -> Self {
        Self { start, deadline: start + duration }
    }
}

pub struct VirtualMachine {
    id: MachineId,
    rate: u32,
    clock: LogicalClock,
    queue: MessageQueue,
    outbox: Box<dyn Outbox>,
    sink: Box<dyn EventSink>,
    random: Box<dyn RandomSource>,
    selector: EventSelector,
    guard: InvariantGuard,
    stats: MachineStats,
    state: watch::Sender<MachineState>,
}

impl VirtualMachine {
    pub fn new(
        id: MachineId,
        rate: u32,
        queue: MessageQueue,
        outbox: Box<dyn Outbox>,
        sink: Box<dyn EventSink>,
        random: Box<dyn RandomSource>,
    ) -> Self {
        let (state, _) = watch::channel(MachineState::Running);
        Self {
            id,
            rate: rate.max(1),
            clock: LogicalClock::new(),
            queue,
            outbox,
            sink,
            random,
            selector: EventSelector,
            guard: InvariantGuard::new(),
            stats: MachineStats::default(),
            state,
        }
    }

    pub fn id(&self) -> MachineId {
        self.id
    }

    pub fn rate(&self) -> u32 {
        self.rate
    }

    pub fn clock(&self) -> u64 {
        self.clock.value()
    }

    pub fn queue(&self) -> &MessageQueue {
        &self.queue
    }

    pub fn stats(&self) -> &MachineStats {
        &self.stats
    }

    pub fn state(&self) -> MachineState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<MachineState> {
        self.state.subscribe()
    }

    /// Length of one tick slot.
    pub fn period(&self) -> Duration {
        Duration::from_secs(1) / self.rate
    }

    /// When slot `slot` of `window` fires: exactly `slot / rate` seconds in.
    pub fn slot_time(&self, window: &RunWindow, slot: u32) -> Instant {
        window.start + Duration::from_secs(u64::from(slot)) / self.rate
    }

    /// Process exactly one event and record it.
    pub async fn step(&mut self) -> Result<EventRecord, MachineError> {
        let (record, transmitted) = match self.queue.dequeue_if_any() {
            Some(queued) => {
                let clock = self.clock.witness(queued.message.clock).map_err(|source| self.clock_error(source))?;
                self.stats.receive_events += 1;
                tracing::debug!(
                    "Machine {} received clock {} from machine {} -> {}",
                    self.id,
                    queued.message.clock,
                    queued.message.sender,
                    clock
                );
                (EventRecord::now(EventKind::Receive, self.queue.len(), clock), Some(queued.message.clock))
            }
            None => {
                let peer_count = self.outbox.peers().len();
                match self.selector.choose(self.random.as_mut(), peer_count) {
                    Action::SendToOne(index) => {
                        let target = self.outbox.peers()[index];
                        (self.send_to(&[target]).await?, None)
                    }
                    Action::SendToAll => {
                        let targets = self.outbox.peers().to_vec();
                        (self.send_to(&targets).await?, None)
                    }
                    Action::Internal => {
                        let clock = self.clock.tick().map_err(|source| self.clock_error(source))?;
                        self.stats.internal_events += 1;
                        (EventRecord::now(EventKind::Internal, self.queue.len(), clock), None)
                    }
                }
            }
        };

        self.guard
            .check(&record, transmitted)
            .map_err(|detail| MachineError::InvariantViolation { machine: self.id, detail })?;
        self.sink
            .record(&record)
            .map_err(|source| MachineError::Log { machine: self.id, source })?;
        Ok(record)
    }

    /// One send event: +1 on the clock, the new value to every target.
    async fn send_to(&mut self, targets: &[MachineId]) -> Result<EventRecord, MachineError> {
        let clock = self.clock.tick().map_err(|source| self.clock_error(source))?;
        let message = Message::new(self.id, clock);
        for &target in targets {
            match self.outbox.send(target, message).await {
                Ok(()) => {
                    self.stats.messages_sent += 1;
                    tracing::debug!("Machine {} sent clock {} to machine {}", self.id, clock, target);
                }
                Err(e) => {
                    self.stats.transport_errors += 1;
                    tracing::warn!("Machine {} failed to send to machine {}: {}", self.id, target, e);
                }
            }
        }
        self.stats.send_events += 1;
        Ok(EventRecord::now(EventKind::Send, self.queue.len(), clock))
    }

    fn clock_error(&self, source: ClockError) -> MachineError {
        MachineError::Clock { machine: self.id, source }
    }

    /// Tick through `window` until it ends or `shutdown` fires, then stop.
    pub async fn run(
        mut self,
        window: RunWindow,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<MachineSummary, MachineError> {
        tracing::info!("Machine {} running at {} ticks/s", self.id, self.rate);
        let mut slot: u32 = 0;
        let outcome = loop {
            slot += 1;
            let at = self.slot_time(&window, slot);
            if at > window.deadline {
                // Out of slots; hold the links open until everyone is done.
                let _ = shutdown.recv().await;
                break Ok(());
            }
            tokio::select! {
                biased;
                _ = sleep_until(at) => {
                    if let Err(e) = self.step().await {
                        tracing::error!("{}", e);
                        break Err(e);
                    }
                }
                _ = shutdown.recv() => {
                    tracing::debug!("Machine {} got shutdown signal", self.id);
                    break Ok(());
                }
            }
        };

        let flushed = self.stop().await;
        outcome?;
        flushed?;
        Ok(self.summary())
    }

    /// Running -> ShuttingDown -> Stopped: close links, flush the sink.
    pub async fn stop(&mut self) -> Result<(), MachineError> {
        self.state.send_replace(MachineState::ShuttingDown);
        self.outbox.close().await;
        let flushed = self
            .sink
            .flush()
            .map_err(|source| MachineError::Log { machine: self.id, source });
        self.state.send_replace(MachineState::Stopped);
        tracing::info!(
            "Machine {} stopped at clock {} ({} internal, {} send, {} receive, {} transport errors)",
            self.id,
            self.clock.value(),
            self.stats.internal_events,
            self.stats.send_events,
            self.stats.receive_events,
            self.stats.transport_errors
        );
        flushed
    }

    pub fn summary(&self) -> MachineSummary {
        MachineSummary {
            id: self.id,
            rate: self.rate,
            final_clock: self.clock.value(),
            pending_messages: self.queue.len(),
            stats: self.stats.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_log::MemoryEventLog;
    use crate::random::ScriptedRandom;
    use std::sync::{Arc, Mutex};

    /// Records what would have gone on the wire; peers in `broken` fail.
    #[derive(Clone, Default)]
    struct RecordingOutbox {
        peers: Vec<MachineId>,
        sent: Arc<Mutex<Vec<(MachineId, Message)>>>,
        broken: Vec<MachineId>,
    }

    #[async_trait]
    impl Outbox for RecordingOutbox {
        fn peers(&self) -> &[MachineId] {
            &self.peers
        }

        async fn send(&mut self, to: MachineId, message: Message) -> Result<(), NetworkError> {
            if self.broken.contains(&to) {
                return Err(NetworkError::Disconnected(to));
            }
            self.sent.lock().unwrap().push((to, message));
            Ok(())
        }

        async fn close(&mut self) {}
    }

    fn machine(draws: Vec<u32>, outbox: RecordingOutbox, log: &MemoryEventLog) -> VirtualMachine {
        VirtualMachine::new(
            MachineId(0),
            1,
            MessageQueue::new(),
            Box::new(outbox),
            Box::new(log.clone()),
            Box::new(ScriptedRandom::new(draws, 10)),
        )
    }

    fn two_peers() -> RecordingOutbox {
        RecordingOutbox {
            peers: vec![MachineId(1), MachineId(2)],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_internal_event_adds_one() {
        let log = MemoryEventLog::new();
        let mut vm = machine(vec![4, 9], two_peers(), &log);
        let first = vm.step().await.unwrap();
        let second = vm.step().await.unwrap();
        assert_eq!((first.kind, first.clock, first.queue_length), (EventKind::Internal, 1, 0));
        assert_eq!((second.kind, second.clock), (EventKind::Internal, 2));
        assert_eq!(log.records().len(), 2);
    }

    #[tokio::test]
    async fn test_receive_uses_max_plus_one() {
        let log = MemoryEventLog::new();
        let mut vm = machine(vec![], two_peers(), &log);
        vm.queue().enqueue(Message::new(MachineId(1), 5));
        vm.queue().enqueue(Message::new(MachineId(2), 2));

        let first = vm.step().await.unwrap();
        assert_eq!((first.kind, first.clock, first.queue_length), (EventKind::Receive, 6, 1));
        let second = vm.step().await.unwrap();
        // Own clock already ahead of the sender
        assert_eq!((second.kind, second.clock, second.queue_length), (EventKind::Receive, 7, 0));
        assert_eq!(vm.stats().receive_events, 2);
    }

    #[tokio::test]
    async fn test_queue_takes_priority_over_selector() {
        let log = MemoryEventLog::new();
        let outbox = two_peers();
        let sent = outbox.sent.clone();
        let mut vm = machine(vec![1], outbox, &log);
        vm.queue().enqueue(Message::new(MachineId(2), 0));
        let record = vm.step().await.unwrap();
        assert_eq!(record.kind, EventKind::Receive);
        assert!(sent.lock().unwrap().is_empty());
        // The scripted send is still the next draw
        assert_eq!(vm.step().await.unwrap().kind, EventKind::Send);
    }

    #[tokio::test]
    async fn test_send_to_one_peer_transmits_new_clock() {
        let log = MemoryEventLog::new();
        let outbox = two_peers();
        let sent = outbox.sent.clone();
        let mut vm = machine(vec![5, 2], outbox, &log);
        vm.step().await.unwrap();
        let record = vm.step().await.unwrap();
        assert_eq!((record.kind, record.clock), (EventKind::Send, 2));
        assert_eq!(*sent.lock().unwrap(), vec![(MachineId(2), Message::new(MachineId(0), 2))]);
    }

    #[tokio::test]
    async fn test_send_to_all_is_one_event() {
        let log = MemoryEventLog::new();
        let outbox = two_peers();
        let sent = outbox.sent.clone();
        let mut vm = machine(vec![3], outbox, &log);
        let record = vm.step().await.unwrap();
        assert_eq!((record.kind, record.clock), (EventKind::Send, 1));
        let sent = sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|(_, m)| m.clock == 1));
        assert_eq!(log.records().len(), 1);
        assert_eq!(vm.stats().messages_sent, 2);
        assert_eq!(vm.stats().send_events, 1);
    }

    #[tokio::test]
    async fn test_failed_send_still_advances_clock() {
        let log = MemoryEventLog::new();
        let mut outbox = two_peers();
        outbox.broken = vec![MachineId(1)];
        let mut vm = machine(vec![1, 6, 1], outbox, &log);

        let failed = vm.step().await.unwrap();
        assert_eq!((failed.kind, failed.clock), (EventKind::Send, 1));
        assert_eq!(vm.step().await.unwrap().clock, 2);
        assert_eq!(vm.step().await.unwrap().clock, 3);
        assert_eq!(vm.stats().transport_errors, 2);
        assert_eq!(vm.stats().messages_sent, 0);
        assert_eq!(vm.state(), MachineState::Running);
    }

    #[tokio::test]
    async fn test_stop_walks_states() {
        let log = MemoryEventLog::new();
        let mut vm = machine(vec![], two_peers(), &log);
        let states = vm.watch_state();
        assert_eq!(*states.borrow(), MachineState::Running);
        vm.stop().await.unwrap();
        assert_eq!(vm.state(), MachineState::Stopped);
        assert_eq!(*states.borrow(), MachineState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_ticks_once_per_slot_within_window() {
        let log = MemoryEventLog::new();
        let vm = VirtualMachine::new(
            MachineId(0),
            2,
            MessageQueue::new(),
            Box::new(two_peers()),
            Box::new(log.clone()),
            Box::new(ScriptedRandom::constant(10)),
        );
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let window = RunWindow::new(Instant::now(), Duration::from_secs(3));
        let handle = tokio::spawn(vm.run(window, shutdown_rx));
        tokio::time::sleep_until(window.deadline).await;
        shutdown_tx.send(()).unwrap();
        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary.final_clock, 6);
        assert_eq!(summary.stats.internal_events, 6);
        assert_eq!(log.records().len(), 6);
    }

    /// Sink whose writes always fail.
    struct FailingSink;

    impl EventSink for FailingSink {
        fn record(&mut self, _record: &EventRecord) -> Result<(), LogError> {
            Err(LogError::Io(std::io::Error::other("disk full")))
        }

        fn flush(&mut self) -> Result<(), LogError> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_rate_fills_its_window() {
        for rate in 1..=6u32 {
            let log = MemoryEventLog::new();
            let vm = VirtualMachine::new(
                MachineId(0),
                rate,
                MessageQueue::new(),
                Box::new(two_peers()),
                Box::new(log.clone()),
                Box::new(ScriptedRandom::constant(10)),
            );
            let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
            let window = RunWindow::new(Instant::now(), Duration::from_secs(5));
            let handle = tokio::spawn(vm.run(window, shutdown_rx));
            tokio::time::sleep_until(window.deadline).await;
            shutdown_tx.send(()).unwrap();
            let summary = handle.await.unwrap().unwrap();
            assert_eq!(summary.final_clock, u64::from(rate) * 5, "rate {}", rate);
            assert_eq!(log.records().len() as u64, u64::from(rate) * 5, "rate {}", rate);
        }
    }

    #[tokio::test]
    async fn test_last_slot_lands_on_deadline() {
        let log = MemoryEventLog::new();
        let start = Instant::now();
        let window = RunWindow::new(start, Duration::from_secs(5));
        for rate in [3, 6, 7, 11] {
            let vm = VirtualMachine::new(
                MachineId(0),
                rate,
                MessageQueue::new(),
                Box::new(two_peers()),
                Box::new(log.clone()),
                Box::new(ScriptedRandom::constant(10)),
            );
            assert_eq!(vm.slot_time(&window, rate * 5), window.deadline, "rate {}", rate);
            assert!(vm.slot_time(&window, rate * 5 + 1) > window.deadline);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sink_failure_ends_run_with_error() {
        let vm = VirtualMachine::new(
            MachineId(3),
            1,
            MessageQueue::new(),
            Box::new(two_peers()),
            Box::new(FailingSink),
            Box::new(ScriptedRandom::constant(10)),
        );
        let states = vm.watch_state();
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let window = RunWindow::new(Instant::now(), Duration::from_secs(60));
        let err = vm.run(window, shutdown_rx).await.unwrap_err();
        assert!(matches!(err, MachineError::Log { machine: MachineId(3), .. }));
        assert_eq!(*states.borrow(), MachineState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_run() {
        let log = MemoryEventLog::new();
        let vm = machine(vec![], two_peers(), &log);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let window = RunWindow::new(Instant::now(), Duration::from_secs(60));
        let handle = tokio::spawn(vm.run(window, shutdown_rx));
        tokio::time::sleep(Duration::from_millis(2500)).await;
        shutdown_tx.send(()).unwrap();
        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary.final_clock, 2);
    }
}
