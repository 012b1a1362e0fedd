//! Time and randomness sources injected into the visit counter

use rand::RngExt;
use std::sync::atomic::{AtomicI64, Ordering};

/// Source of the current Unix time in seconds
pub trait Clock: Send + Sync {
    fn now(&self) -> i64;
}

/// Wall clock backed by chrono
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start: i64) -> Self {
        Self {
            now: AtomicI64::new(start),
        }
    }

    pub fn advance(&self, secs: i64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }

    pub fn set(&self, now: i64) {
        self.now.store(now, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Decides whether a counted visit should also trigger a visit log purge
pub trait PurgeChance: Send + Sync {
    fn should_purge(&self) -> bool;
}

/// Purges with probability `1 / one_in`; `0` never purges, `1` always does
#[derive(Debug, Clone, Copy)]
pub struct RandomPurgeChance {
    one_in: u32,
}

impl RandomPurgeChance {
    pub fn new(one_in: u32) -> Self {
        Self { one_in }
    }
}

impl PurgeChance for RandomPurgeChance {
    fn should_purge(&self) -> bool {
        match self.one_in {
            0 => false,
            1 => true,
            n => rand::rng().random_range(0..n) == 0,
        }
    }
}

/// Deterministic answer, for tests and for disabling purges outright
#[derive(Debug, Clone, Copy)]
pub struct FixedPurgeChance(pub bool);

impl PurgeChance for FixedPurgeChance {
    fn should_purge(&self) -> bool {
        self.0
    }
}
