//! Pending-signal queue
//!
//! Detected patterns wait here until trend and pullback gates allow entry,
//! or until their validity window lapses. The queue deduplicates by pattern
//! fingerprint and is capacity-capped: at the cap, the oldest unpromoted
//! entry is evicted (and logged) rather than letting the queue grow without
//! bound. Expiry runs once per candle-close cycle, never on its own timer.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::signal::pattern::{Fingerprint, PatternMatch};
use crate::types::Direction;

/// A detected-but-unconfirmed entry candidate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingSignal {
    pub fingerprint: Fingerprint,
    pub direction: Direction,
    /// Breakout close at detection time
    pub reference_price: f64,
    pub detected_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl PendingSignal {
    pub fn from_match(m: &PatternMatch, validity_hours: f64) -> Self {
        let validity = Duration::seconds((validity_hours * 3600.0) as i64);
        Self {
            fingerprint: m.fingerprint.clone(),
            direction: m.direction,
            reference_price: m.breakout_close,
            detected_at: m.confirmed_at,
            expires_at: m.confirmed_at + validity,
        }
    }
}

/// Outcome of an enqueue attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Enqueued {
    Added,
    /// Fingerprint already queued
    Duplicate,
    /// Added after evicting the oldest entry to respect the cap
    AddedEvicting(Fingerprint),
}

/// FIFO queue of pending signals, unique by fingerprint, bounded by `cap`.
#[derive(Debug, Clone)]
pub struct SignalQueue {
    cap: usize,
    entries: VecDeque<PendingSignal>,
}

impl SignalQueue {
    pub fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            entries: VecDeque::new(),
        }
    }

    /// Rebuild from a persisted snapshot
    pub fn restore(cap: usize, entries: Vec<PendingSignal>) -> Self {
        let mut queue = Self::new(cap);
        for signal in entries {
            queue.enqueue(signal);
        }
        queue
    }

    pub fn enqueue(&mut self, signal: PendingSignal) -> Enqueued {
        if self
            .entries
            .iter()
            .any(|s| s.fingerprint == signal.fingerprint)
        {
            debug!(fingerprint = %signal.fingerprint, "signal already queued");
            return Enqueued::Duplicate;
        }

        let evicted = if self.entries.len() >= self.cap {
            // Oldest-first eviction keeps the freshest candidates alive
            let old = self.entries.pop_front().expect("non-empty at cap");
            warn!(
                fingerprint = %old.fingerprint,
                cap = self.cap,
                "signal queue full, evicting oldest entry"
            );
            Some(old.fingerprint)
        } else {
            None
        };

        self.entries.push_back(signal);
        match evicted {
            Some(fp) => Enqueued::AddedEvicting(fp),
            None => Enqueued::Added,
        }
    }

    /// Drop entries whose validity window has lapsed. Called once per
    /// candle-close cycle.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|s| {
            let keep = s.expires_at > now;
            if !keep {
                debug!(fingerprint = %s.fingerprint, "signal expired");
            }
            keep
        });
        before - self.entries.len()
    }

    /// Remove and return the oldest entry satisfying `eligible`.
    pub fn promote<F>(&mut self, eligible: F) -> Option<PendingSignal>
    where
        F: Fn(&PendingSignal) -> bool,
    {
        let idx = self.entries.iter().position(eligible)?;
        self.entries.remove(idx)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in queue order, for snapshot persistence
    pub fn entries(&self) -> Vec<PendingSignal> {
        self.entries.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::pattern::PatternKind;
    use chrono::TimeZone;

    fn signal(i: i64, direction: Direction) -> PendingSignal {
        let t = Utc.timestamp_opt(i * 3600, 0).unwrap();
        PendingSignal {
            fingerprint: Fingerprint::new(PatternKind::W, t, direction),
            direction,
            reference_price: 100.0,
            detected_at: t,
            expires_at: t + Duration::hours(12),
        }
    }

    #[test]
    fn duplicate_fingerprints_rejected() {
        let mut q = SignalQueue::new(10);
        assert_eq!(q.enqueue(signal(1, Direction::Long)), Enqueued::Added);
        assert_eq!(q.enqueue(signal(1, Direction::Long)), Enqueued::Duplicate);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn cap_evicts_oldest_fifo() {
        let mut q = SignalQueue::new(100);
        for i in 0..150 {
            q.enqueue(signal(i, Direction::Long));
        }
        assert_eq!(q.len(), 100);
        // The survivors are exactly signals 50..149 in order
        let entries = q.entries();
        assert_eq!(
            entries[0].detected_at,
            Utc.timestamp_opt(50 * 3600, 0).unwrap()
        );
        assert_eq!(
            entries[99].detected_at,
            Utc.timestamp_opt(149 * 3600, 0).unwrap()
        );
    }

    #[test]
    fn sweep_drops_expired() {
        let mut q = SignalQueue::new(10);
        q.enqueue(signal(0, Direction::Long)); // expires at hour 12
        q.enqueue(signal(10, Direction::Short)); // expires at hour 22
        let removed = q.sweep(Utc.timestamp_opt(15 * 3600, 0).unwrap());
        assert_eq!(removed, 1);
        assert_eq!(q.len(), 1);
        assert_eq!(q.entries()[0].direction, Direction::Short);
    }

    #[test]
    fn promote_takes_oldest_eligible() {
        let mut q = SignalQueue::new(10);
        q.enqueue(signal(0, Direction::Short));
        q.enqueue(signal(1, Direction::Long));
        q.enqueue(signal(2, Direction::Long));

        let promoted = q.promote(|s| s.direction == Direction::Long).unwrap();
        assert_eq!(promoted.detected_at, Utc.timestamp_opt(3600, 0).unwrap());
        assert_eq!(q.len(), 2);
    }
}
