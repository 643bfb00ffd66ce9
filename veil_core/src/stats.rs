//! Statistics of incoming/outgoing packets.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Packet counters shared between the codecs and the link manager.
#[derive(Clone, Default)]
pub struct Stats {
    counters: Arc<Counters>,
}

#[derive(Default)]
struct Counters {
    incoming: AtomicU64,
    outgoing: AtomicU64,
    dropped: AtomicU64,
}

impl Stats {
    /// Create new `Stats`.
    pub fn new() -> Stats {
        Stats::default()
    }

    pub fn counter_incoming(&self) {
        self.counters.incoming.fetch_add(1, Ordering::Relaxed);
    }

    pub fn counter_outgoing(&self) {
        self.counters.outgoing.fetch_add(1, Ordering::Relaxed);
    }

    pub fn counter_dropped(&self) {
        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incoming(&self) -> u64 {
        self.counters.incoming.load(Ordering::Relaxed)
    }

    pub fn outgoing(&self) -> u64 {
        self.counters.outgoing.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.counters.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_add_up() {
        let stats = Stats::new();
        let clone = stats.clone();

        stats.counter_incoming();
        clone.counter_incoming();
        stats.counter_outgoing();
        stats.counter_dropped();

        assert_eq!(stats.incoming(), 2);
        assert_eq!(stats.outgoing(), 1);
        assert_eq!(stats.dropped(), 1);
    }
}
