//! Deterministic fake-timer subsystem.
//!
//! Time never advances on its own: a virtual clock moves only when timer
//! batches are drained, so timer-dependent tests replay identically.  The
//! runtime drains callback batches from here and invokes them itself; this
//! module owns only the queues and the clock.

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::value::Value;

// ---------------------------------------------------------------------------
// VirtualClock
// ---------------------------------------------------------------------------

/// Deterministic virtual clock. Advances only when explicitly stepped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct VirtualClock {
    now_ticks: u64,
}

impl VirtualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current virtual time.
    pub fn now(&self) -> u64 {
        self.now_ticks
    }

    /// Advance to a specific tick; ignored when in the past.
    pub fn advance_to(&mut self, tick: u64) {
        if tick > self.now_ticks {
            self.now_ticks = tick;
        }
    }
}

// ---------------------------------------------------------------------------
// FakeTimers
// ---------------------------------------------------------------------------

/// Which timer implementation the environment currently exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TimerMode {
    #[default]
    Fake,
    Real,
}

/// Handle to one scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimerHandle(pub u64);

/// Tick, immediate, and timer queues over a virtual clock. Callbacks are
/// function values on the sandbox heap; the runtime invokes drained
/// batches.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FakeTimers {
    mode: TimerMode,
    clock: VirtualClock,
    ticks: VecDeque<Value>,
    immediates: VecDeque<Value>,
    timers: BTreeMap<(u64, u64), Value>,
    next_seq: u64,
}

impl FakeTimers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(&self) -> TimerMode {
        self.mode
    }

    pub fn use_fake_timers(&mut self) {
        self.mode = TimerMode::Fake;
    }

    pub fn use_real_timers(&mut self) {
        self.mode = TimerMode::Real;
    }

    pub fn clock(&self) -> VirtualClock {
        self.clock
    }

    /// Enqueue a microtask.
    pub fn schedule_tick(&mut self, callback: Value) {
        self.ticks.push_back(callback);
    }

    /// Enqueue an immediate.
    pub fn schedule_immediate(&mut self, callback: Value) {
        self.immediates.push_back(callback);
    }

    /// Schedule a timer `delay` ticks from now. Insertion order breaks ties
    /// between equal deadlines.
    pub fn schedule_timer(&mut self, delay: u64, callback: Value) -> TimerHandle {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.timers
            .insert((self.clock.now() + delay, seq), callback);
        TimerHandle(seq)
    }

    pub fn pending_timer_count(&self) -> usize {
        self.timers.len()
    }

    pub fn pending_tick_count(&self) -> usize {
        self.ticks.len()
    }

    pub fn pending_immediate_count(&self) -> usize {
        self.immediates.len()
    }

    /// Drop every queued tick, immediate, and timer.
    pub fn clear_all_timers(&mut self) {
        self.ticks.clear();
        self.immediates.clear();
        self.timers.clear();
    }

    /// Drain the microtask queue in FIFO order.
    pub fn take_ticks(&mut self) -> Vec<Value> {
        self.ticks.drain(..).collect()
    }

    /// Drain the immediates queue in FIFO order.
    pub fn take_immediates(&mut self) -> Vec<Value> {
        self.immediates.drain(..).collect()
    }

    /// Drain every timer currently scheduled, in deadline order, advancing
    /// the clock to each deadline. Timers scheduled by the drained
    /// callbacks are not included; callers loop if they want exhaustion.
    pub fn take_scheduled_timers(&mut self) -> Vec<Value> {
        let drained = std::mem::take(&mut self.timers);
        let mut callbacks = Vec::with_capacity(drained.len());
        for ((due, _seq), callback) in drained {
            self.clock.advance_to(due);
            callbacks.push(callback);
        }
        callbacks
    }
}
