//! Per-receiver counters.
//!
//! Counters are reset every time they are reported so the collector sees the
//! delta since its previous pass. `active` is a gauge and is reported as is.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stat {
    SamplesReceived,
    MessagesReceived,
    MetricsReceived,
    Errors,
    Active,
    IncompleteReceived,
    FutureDropped,
    PastDropped,
    TooLongDropped,
}

impl Stat {
    pub fn name(self) -> &'static str {
        match self {
            Self::SamplesReceived => "samplesReceived",
            Self::MessagesReceived => "messagesReceived",
            Self::MetricsReceived => "metricsReceived",
            Self::Errors => "errors",
            Self::Active => "active",
            Self::IncompleteReceived => "incompleteReceived",
            Self::FutureDropped => "futureDropped",
            Self::PastDropped => "pastDropped",
            Self::TooLongDropped => "tooLongDropped",
        }
    }

    fn slot(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Default)]
pub struct Stats {
    counters: [AtomicU64; 9],
    active: AtomicI64,
}

impl Stats {
    pub fn add(&self, stat: Stat, n: u64) {
        if n > 0 {
            self.counters[stat.slot()].fetch_add(n, Ordering::Relaxed);
        }
    }

    pub fn incr(&self, stat: Stat) {
        self.add(stat, 1);
    }

    /// Current value without resetting it.
    pub fn get(&self, stat: Stat) -> u64 {
        match stat {
            Stat::Active => self.active.load(Ordering::Relaxed).max(0) as u64,
            _ => self.counters[stat.slot()].load(Ordering::Relaxed),
        }
    }

    /// Count an open connection until the guard is dropped.
    pub fn active_guard(&self) -> ActiveGuard<'_> {
        self.active.fetch_add(1, Ordering::Relaxed);
        ActiveGuard { stats: self }
    }

    pub fn report(&self, stats: &[Stat], send: &mut dyn FnMut(&str, f64)) {
        for &stat in stats {
            let value = match stat {
                Stat::Active => self.active.load(Ordering::Relaxed) as f64,
                _ => self.counters[stat.slot()].swap(0, Ordering::Relaxed) as f64,
            };
            send(stat.name(), value);
        }
    }
}

#[derive(Debug)]
pub struct ActiveGuard<'a> {
    stats: &'a Stats,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.stats.active.fetch_sub(1, Ordering::Relaxed);
    }
}
