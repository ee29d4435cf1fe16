//! Clock and one-shot timer service.
//!
//! The engine runs against an injected clock so backtests are deterministic:
//! the virtual variant only moves when the driver advances it, and timers
//! fire in (deadline, schedule order) when the clock passes them. The wall
//! variant reads system time; the live runner sleeps until the next deadline
//! and asks the engine to fire whatever has come due.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use uuid::Uuid;

use crate::types::Sym;

/// Milliseconds since the unix epoch.
pub type EpochMs = u64;

/// Source of "now" for the engine.
#[derive(Debug)]
pub enum EngineClock {
    /// System time.
    Wall,
    /// Backtest time; advances only via `set_ms`.
    Virtual { now_ms: EpochMs },
}

impl EngineClock {
    pub fn wall() -> Self {
        EngineClock::Wall
    }

    pub fn virtual_at(start_ms: EpochMs) -> Self {
        EngineClock::Virtual { now_ms: start_ms }
    }

    pub fn now_ms(&self) -> EpochMs {
        match self {
            EngineClock::Wall => chrono::Utc::now().timestamp_millis().max(0) as u64,
            EngineClock::Virtual { now_ms } => *now_ms,
        }
    }

    /// Move a virtual clock forward. Never moves backwards.
    pub fn set_ms(&mut self, ms: EpochMs) {
        if let EngineClock::Virtual { now_ms } = self {
            if ms > *now_ms {
                *now_ms = ms;
            }
        }
    }

    pub fn is_virtual(&self) -> bool {
        matches!(self, EngineClock::Virtual { .. })
    }
}

/// Typed payload delivered when a timer fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerPayload {
    /// A 60-second window reached its deadline.
    WindowExpired { sym: Sym, window_id: u64 },
    /// A parked signal (wait-then-seed policy) ran out of patience.
    SignalTimeout { sym: Sym, seq: u64 },
    /// A still-pending entry order outlived its TTL.
    EntryTtl {
        sym: Sym,
        order_id: Uuid,
        window_id: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

#[derive(Debug, PartialEq, Eq)]
struct TimerEntry {
    at_ms: EpochMs,
    seq: u64,
    id: TimerId,
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.at_ms, self.seq).cmp(&(other.at_ms, other.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// One-shot timers with idempotent cancellation.
///
/// Cancellation removes the payload; the heap entry is discarded lazily when
/// it surfaces. A cancelled timer never fires, a timer never fires early,
/// and equal deadlines fire in schedule order.
#[derive(Debug, Default)]
pub struct TimerService {
    heap: BinaryHeap<Reverse<TimerEntry>>,
    payloads: HashMap<TimerId, TimerPayload>,
    next_id: u64,
    next_seq: u64,
}

impl TimerService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, at_ms: EpochMs, payload: TimerPayload) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        let seq = self.next_seq;
        self.next_seq += 1;
        self.payloads.insert(id, payload);
        self.heap.push(Reverse(TimerEntry { at_ms, seq, id }));
        id
    }

    /// Idempotent; cancelling an already-fired or unknown timer is a no-op.
    pub fn cancel(&mut self, id: TimerId) {
        self.payloads.remove(&id);
    }

    /// Earliest live deadline, if any.
    pub fn next_deadline(&mut self) -> Option<EpochMs> {
        while let Some(Reverse(entry)) = self.heap.peek() {
            if self.payloads.contains_key(&entry.id) {
                return Some(entry.at_ms);
            }
            self.heap.pop();
        }
        None
    }

    /// Pop the next timer with `at_ms <= now_ms`, if any.
    pub fn pop_due(&mut self, now_ms: EpochMs) -> Option<(TimerId, TimerPayload)> {
        while let Some(Reverse(entry)) = self.heap.peek() {
            if entry.at_ms > now_ms {
                return None;
            }
            let entry = self.heap.pop().expect("peeked").0;
            if let Some(payload) = self.payloads.remove(&entry.id) {
                return Some((entry.id, payload));
            }
            // cancelled; keep draining
        }
        None
    }
}
