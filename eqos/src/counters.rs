//! Event counters for the data path, kept with relaxed atomics so the hot
//! paths never take a lock just to count.

use core::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct EqosCounters {
    rx_frames: AtomicU64,
    rx_errored: AtomicU64,
    rx_empty: AtomicU64,
    rx_stalls: AtomicU64,
    tx_sent: AtomicU64,
    tx_errored: AtomicU64,
    tx_deferred: AtomicU64,
    tx_rejected: AtomicU64,
    fatal_faults: AtomicU64,
}

/// A point-in-time copy of every counter.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct CounterSnapshot {
    /// Frames delivered to the consumer.
    pub rx_frames: u64,
    /// Frames the device flagged as errored and the engine dropped.
    pub rx_errored: u64,
    /// Zero-length write-backs dropped.
    pub rx_empty: u64,
    /// Drain passes that ended with unarmed slots for lack of buffers.
    pub rx_stalls: u64,
    /// Frames the device sent successfully.
    pub tx_sent: u64,
    /// Frames lost to a transmit-path error.
    pub tx_errored: u64,
    /// Enqueue attempts turned away for lack of ring space or mappings.
    pub tx_deferred: u64,
    /// Frames refused outright.
    pub tx_rejected: u64,
    /// Fatal bus/descriptor faults observed.
    pub fatal_faults: u64,
}

impl EqosCounters {
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            rx_frames: self.rx_frames.load(Ordering::Relaxed),
            rx_errored: self.rx_errored.load(Ordering::Relaxed),
            rx_empty: self.rx_empty.load(Ordering::Relaxed),
            rx_stalls: self.rx_stalls.load(Ordering::Relaxed),
            tx_sent: self.tx_sent.load(Ordering::Relaxed),
            tx_errored: self.tx_errored.load(Ordering::Relaxed),
            tx_deferred: self.tx_deferred.load(Ordering::Relaxed),
            tx_rejected: self.tx_rejected.load(Ordering::Relaxed),
            fatal_faults: self.fatal_faults.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn add_rx_frames(&self, n: u64) {
        self.rx_frames.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_rx_errored(&self, n: u64) {
        self.rx_errored.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_rx_empty(&self, n: u64) {
        self.rx_empty.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn count_rx_stall(&self) {
        self.rx_stalls.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_tx_sent(&self) {
        self.tx_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_tx_errored(&self) {
        self.tx_errored.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_tx_deferred(&self) {
        self.tx_deferred.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_tx_rejected(&self) {
        self.tx_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_fatal_fault(&self) {
        self.fatal_faults.fetch_add(1, Ordering::Relaxed);
    }
}
