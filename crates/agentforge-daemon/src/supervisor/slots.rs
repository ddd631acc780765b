//! Concurrency slots for agent subprocesses.
//!
//! [`AgentSlots`] enforces three ceilings at reservation time: coding agents
//! up to the configured limit (never above [`MAX_CODING_AGENTS`]), testing
//! agents up to the number of coding agents currently running, and the
//! combined total up to [`MAX_TOTAL_AGENTS`]. A reservation is a
//! [`SlotPermit`] that gives its slot back on drop.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use agentforge_core::config::{MAX_CODING_AGENTS, MAX_TOTAL_AGENTS};
use agentforge_core::model::AgentKind;

#[derive(Debug, Default)]
struct Counts {
    coding: usize,
    testing: usize,
}

impl Counts {
    const fn total(&self) -> usize {
        self.coding + self.testing
    }
}

/// A ceiling was hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotsExhausted {
    pub kind: AgentKind,
    pub running: usize,
    pub limit: usize,
}

/// Reserved slot; released on drop.
#[derive(Debug)]
pub struct SlotPermit {
    kind: AgentKind,
    counts: Arc<Mutex<Counts>>,
}

impl SlotPermit {
    pub const fn kind(&self) -> AgentKind {
        self.kind
    }
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        let mut counts = lock(&self.counts);
        match self.kind {
            AgentKind::Coding => counts.coding = counts.coding.saturating_sub(1),
            AgentKind::Testing => counts.testing = counts.testing.saturating_sub(1),
        }
    }
}

fn lock(counts: &Mutex<Counts>) -> MutexGuard<'_, Counts> {
    counts.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
pub struct AgentSlots {
    configured_limit: usize,
    run_limit: Arc<AtomicUsize>,
    testing_per_coding: usize,
    counts: Arc<Mutex<Counts>>,
}

impl AgentSlots {
    /// `coding_limit` is clamped to `1..=MAX_CODING_AGENTS`.
    pub fn new(coding_limit: usize, testing_per_coding: usize) -> Self {
        let limit = coding_limit.clamp(1, MAX_CODING_AGENTS);
        Self {
            configured_limit: limit,
            run_limit: Arc::new(AtomicUsize::new(limit)),
            testing_per_coding,
            counts: Arc::new(Mutex::new(Counts::default())),
        }
    }

    /// Current coding ceiling.
    pub fn coding_limit(&self) -> usize {
        self.run_limit.load(Ordering::Relaxed)
    }

    /// Narrow the coding ceiling for one run; `None` restores the
    /// configured limit. Never raises it above the configured limit.
    pub fn set_run_limit(&self, limit: Option<usize>) {
        let limit = limit.map_or(self.configured_limit, |l| l.clamp(1, self.configured_limit));
        self.run_limit.store(limit, Ordering::Relaxed);
    }

    fn limit_for(&self, kind: AgentKind, counts: &Counts) -> usize {
        match kind {
            AgentKind::Coding => self.coding_limit(),
            AgentKind::Testing => counts
                .coding
                .saturating_mul(self.testing_per_coding)
                .min(counts.coding),
        }
    }

    /// Reserve a slot without waiting.
    pub fn try_reserve(&self, kind: AgentKind) -> Result<SlotPermit, SlotsExhausted> {
        let mut counts = lock(&self.counts);
        let running = match kind {
            AgentKind::Coding => counts.coding,
            AgentKind::Testing => counts.testing,
        };
        let limit = self.limit_for(kind, &counts);

        if counts.total() >= MAX_TOTAL_AGENTS {
            return Err(SlotsExhausted {
                kind,
                running: counts.total(),
                limit: MAX_TOTAL_AGENTS,
            });
        }
        if running >= limit {
            return Err(SlotsExhausted {
                kind,
                running,
                limit,
            });
        }

        match kind {
            AgentKind::Coding => counts.coding += 1,
            AgentKind::Testing => counts.testing += 1,
        }
        debug!(kind = kind.as_str(), coding = counts.coding, testing = counts.testing, "Slot reserved");
        drop(counts);

        Ok(SlotPermit {
            kind,
            counts: Arc::clone(&self.counts),
        })
    }

    /// Whether a reservation of `kind` would currently succeed.
    pub fn can_reserve(&self, kind: AgentKind) -> bool {
        let counts = lock(&self.counts);
        let running = match kind {
            AgentKind::Coding => counts.coding,
            AgentKind::Testing => counts.testing,
        };
        counts.total() < MAX_TOTAL_AGENTS && running < self.limit_for(kind, &counts)
    }

    pub fn running(&self, kind: AgentKind) -> usize {
        let counts = lock(&self.counts);
        match kind {
            AgentKind::Coding => counts.coding,
            AgentKind::Testing => counts.testing,
        }
    }

    pub fn total(&self) -> usize {
        lock(&self.counts).total()
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn coding_limit_is_clamped() {
        assert_eq!(AgentSlots::new(0, 1).coding_limit(), 1);
        assert_eq!(AgentSlots::new(12, 1).coding_limit(), MAX_CODING_AGENTS);
        let slots = AgentSlots::new(3, 1);
        slots.set_run_limit(Some(8));
        assert_eq!(slots.coding_limit(), 3);
        slots.set_run_limit(Some(2));
        assert_eq!(slots.coding_limit(), 2);
        slots.set_run_limit(None);
        assert_eq!(slots.coding_limit(), 3);
    }

    #[test]
    fn coding_ceiling() {
        let slots = AgentSlots::new(2, 1);
        let _a = slots.try_reserve(AgentKind::Coding).unwrap();
        let _b = slots.try_reserve(AgentKind::Coding).unwrap();
        let err = slots.try_reserve(AgentKind::Coding).unwrap_err();
        assert_eq!(
            err,
            SlotsExhausted {
                kind: AgentKind::Coding,
                running: 2,
                limit: 2
            }
        );
        assert!(!slots.can_reserve(AgentKind::Coding));
    }

    #[test]
    fn testing_follows_coding_count() {
        let slots = AgentSlots::new(5, 1);
        assert!(slots.try_reserve(AgentKind::Testing).is_err());

        let coding = slots.try_reserve(AgentKind::Coding).unwrap();
        let testing = slots.try_reserve(AgentKind::Testing).unwrap();
        assert!(slots.try_reserve(AgentKind::Testing).is_err());

        drop(testing);
        drop(coding);
        assert_eq!(slots.total(), 0);
    }

    #[test]
    fn zero_ratio_disables_testing() {
        let slots = AgentSlots::new(5, 0);
        let _coding = slots.try_reserve(AgentKind::Coding).unwrap();
        assert!(!slots.can_reserve(AgentKind::Testing));
    }

    #[test]
    fn total_never_exceeds_ten() {
        let slots = AgentSlots::new(5, 4);
        let mut permits = Vec::new();
        for _ in 0..5 {
            permits.push(slots.try_reserve(AgentKind::Coding).unwrap());
        }
        for _ in 0..5 {
            permits.push(slots.try_reserve(AgentKind::Testing).unwrap());
        }
        assert_eq!(slots.total(), MAX_TOTAL_AGENTS);
        let err = slots.try_reserve(AgentKind::Testing).unwrap_err();
        assert_eq!(err.limit, MAX_TOTAL_AGENTS);
        permits.pop();
        assert!(slots.can_reserve(AgentKind::Testing));
    }

    #[test]
    fn run_limit_is_shared_by_clones() {
        let slots = AgentSlots::new(5, 1);
        let handle = slots.clone();
        handle.set_run_limit(Some(1));
        let _a = slots.try_reserve(AgentKind::Coding).unwrap();
        assert!(handle.try_reserve(AgentKind::Coding).is_err());
        assert_eq!(handle.running(AgentKind::Coding), 1);
    }
}
