use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Message and byte counters at one point in time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    /// Accepted inbound envelopes.
    pub msg_in: u64,

    /// Published outbound envelopes.
    pub msg_out: u64,

    /// Inbound payload bytes.
    pub bytes_in: u64,

    /// Outbound payload bytes.
    pub bytes_out: u64,
}

#[derive(Debug, Default)]
pub struct Counters {
    msg_in: AtomicU64,
    msg_out: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

impl Counters {
    pub fn record_in(&self, bytes: usize) {
        self.msg_in.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_out(&self, bytes: usize) {
        self.msg_out.fetch_add(1, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            msg_in: self.msg_in.load(Ordering::Relaxed),
            msg_out: self.msg_out.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
        }
    }

    /// Reads and resets every counter.
    pub fn take(&self) -> CounterSnapshot {
        CounterSnapshot {
            msg_in: self.msg_in.swap(0, Ordering::Relaxed),
            msg_out: self.msg_out.swap(0, Ordering::Relaxed),
            bytes_in: self.bytes_in.swap(0, Ordering::Relaxed),
            bytes_out: self.bytes_out.swap(0, Ordering::Relaxed),
        }
    }
}
