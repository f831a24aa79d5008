// src/random.rs - Injectable randomness for rate and event draws
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;

use crate::config::ClockRateConfig;

/// Source of uniformly distributed integers.
///
/// Every draw the simulation makes goes through this trait so tests can
/// script exact outcomes.
pub trait RandomSource: Send {
    /// Uniform draw from `low..=high`.
    fn draw(&mut self, low: u32, high: u32) -> u32;
}

/// `StdRng`-backed source, seeded or from OS entropy.
#[derive(Debug, Clone)]
pub struct SeededRandom {
    rng: StdRng,
}

impl SeededRandom {
    pub fn from_seed(seed: u64) -> Self {
        Self { rng: StdRng::seed_from_u64(seed) }
    }

    pub fn from_entropy() -> Self {
        Self { rng: StdRng::from_os_rng() }
    }

    /// Seeded when `seed` is set, OS entropy otherwise.
    pub fn from_optional_seed(seed: Option<u64>) -> Self {
        match seed {
            Some(seed) => Self::from_seed(seed),
            None => Self::from_entropy(),
        }
    }
}

impl RandomSource for SeededRandom {
    fn draw(&mut self, low: u32, high: u32) -> u32 {
        self.rng.random_range(low..=high)
    }
}

/// Replays a fixed sequence, then repeats `fallback` forever.
///
/// Values outside the requested range are clamped into it.
#[derive(Debug, Clone)]
pub struct ScriptedRandom {
    values: VecDeque<u32>,
    fallback: u32,
}

impl ScriptedRandom {
    pub fn new(values: impl IntoIterator<Item = u32>, fallback: u32) -> Self {
        Self {
            values: values.into_iter().collect(),
            fallback,
        }
    }

    /// Always returns `value`.
    pub fn constant(value: u32) -> Self {
        Self::new([], value)
    }
}

impl RandomSource for ScriptedRandom {
    fn draw(&mut self, low: u32, high: u32) -> u32 {
        let value = self.values.pop_front().unwrap_or(self.fallback);
        value.clamp(low, high)
    }
}

/// Draws each machine's fixed tick rate.
#[derive(Debug, Clone, Copy)]
pub struct ClockRateGenerator {
    bounds: ClockRateConfig,
}

impl ClockRateGenerator {
    pub fn new(bounds: ClockRateConfig) -> Self {
        Self { bounds }
    }

    pub fn next_rate(&self, source: &mut dyn RandomSource) -> u32 {
        source.draw(self.bounds.min, self.bounds.max)
    }
}

/// What a machine does on a tick with an empty queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Send to the peer at this position in the machine's peer list.
    SendToOne(usize),
    SendToAll,
    Internal,
}

/// Maps a draw from `1..=10` onto an [`Action`].
///
/// `1` sends to the first peer, `2` to the second (or the only one), `3` to
/// every peer, anything else is an internal event.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventSelector;

impl EventSelector {
    pub const LOW: u32 = 1;
    pub const HIGH: u32 = 10;

    pub fn choose(&self, source: &mut dyn RandomSource, peer_count: usize) -> Action {
        Self::map(source.draw(Self::LOW, Self::HIGH), peer_count)
    }

    pub fn map(value: u32, peer_count: usize) -> Action {
        if peer_count == 0 {
            return Action::Internal;
        }
        match value {
            1 => Action::SendToOne(0),
            2 => Action::SendToOne(1.min(peer_count - 1)),
            3 => Action::SendToAll,
            _ => Action::Internal,
        }
    }
}
