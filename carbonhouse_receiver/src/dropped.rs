//! Time-window and name-length filtering shared by every receiver.

use std::time::Duration;

use parking_lot::Mutex;

use crate::stat::Stat;

/// How many recent drops are kept for the debug endpoint.
pub const DROPPED_LIST_SIZE: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Future,
    Past,
    TooLong,
}

impl DropReason {
    pub fn stat(self) -> Stat {
        match self {
            Self::Future => Stat::FutureDropped,
            Self::Past => Stat::PastDropped,
            Self::TooLong => Stat::TooLongDropped,
        }
    }
}

/// Zero disables the corresponding check.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DropFilter {
    future_secs: u32,
    past_secs: u32,
    longer_than: usize,
}

impl DropFilter {
    pub fn new(future: Duration, past: Duration, longer_than: usize) -> Self {
        let secs = |d: Duration| u32::try_from(d.as_secs()).unwrap_or(u32::MAX);
        Self {
            future_secs: secs(future),
            past_secs: secs(past),
            longer_than,
        }
    }

    pub fn check(&self, name_len: usize, now: u32, timestamp: u32) -> Option<DropReason> {
        if self.future_secs != 0 && u64::from(timestamp) > u64::from(now) + u64::from(self.future_secs)
        {
            return Some(DropReason::Future);
        }
        if self.past_secs != 0 && u64::from(now) > u64::from(timestamp) + u64::from(self.past_secs)
        {
            return Some(DropReason::Past);
        }
        if self.longer_than != 0 && name_len > self.longer_than {
            return Some(DropReason::TooLong);
        }
        None
    }
}

/// Ring of the most recent dropped samples.
#[derive(Debug)]
pub struct DroppedList {
    inner: Mutex<Ring>,
}

#[derive(Debug)]
struct Ring {
    entries: Vec<String>,
    next: usize,
}

impl Default for DroppedList {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Ring {
                entries: Vec::with_capacity(DROPPED_LIST_SIZE),
                next: 0,
            }),
        }
    }
}

impl DroppedList {
    pub fn push(&self, name: &[u8], now: u32, timestamp: u32, value: f64) {
        let entry = format!(
            "rcv:{now}\tname:{}\ttimestamp:{timestamp}\tvalue:{value:?}",
            String::from_utf8_lossy(name)
        );
        let mut ring = self.inner.lock();
        let slot = ring.next % DROPPED_LIST_SIZE;
        if slot < ring.entries.len() {
            ring.entries[slot] = entry;
        } else {
            ring.entries.push(entry);
        }
        ring.next += 1;
    }

    /// Snapshot of the ring, sorted.
    pub fn sorted(&self) -> Vec<String> {
        let mut entries = self.inner.lock().entries.clone();
        entries.sort();
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window() {
        let filter = DropFilter::new(Duration::from_secs(60), Duration::from_secs(3600), 10);
        let now = 1_000_000;
        assert_eq!(filter.check(3, now, now), None);
        assert_eq!(filter.check(3, now, now + 60), None);
        assert_eq!(filter.check(3, now, now + 120), Some(DropReason::Future));
        assert_eq!(filter.check(3, now, now - 3600), None);
        assert_eq!(filter.check(3, now, now - 3601), Some(DropReason::Past));
        assert_eq!(filter.check(11, now, now), Some(DropReason::TooLong));
    }

    #[test]
    fn disabled_by_default() {
        let filter = DropFilter::default();
        assert_eq!(filter.check(usize::MAX, 10, u32::MAX), None);
        assert_eq!(filter.check(1, u32::MAX, 0), None);
    }

    #[test]
    fn ring_keeps_latest() {
        let list = DroppedList::default();
        for i in 0..(DROPPED_LIST_SIZE as u32 + 5) {
            list.push(b"m", 100 + i, i, 1.5);
        }
        let entries = list.sorted();
        assert_eq!(entries.len(), DROPPED_LIST_SIZE);
        assert!(!entries.iter().any(|e| e.starts_with("rcv:100\t")));
        assert!(entries.contains(&"rcv:1104\tname:m\ttimestamp:1004\tvalue:1.5".to_string()));
    }
}
