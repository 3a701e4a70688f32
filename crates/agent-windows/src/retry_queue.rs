// Bounded outbound queue.
//
// Every admitted event passes through here; a drain sends the whole
// queue as one batch. The queue survives send failures but not process
// death — the Security log is the durable upstream, and the startup
// back-scan rediscovers anything lost from memory.

use secmon_core::FailedLoginEvent;
use std::collections::VecDeque;

/// Maximum queued events. Beyond this the oldest are dropped.
pub const MAX_QUEUED: usize = 5_000;

pub struct RetryQueue {
    events: VecDeque<FailedLoginEvent>,
    capacity: usize,
    dropped_total: u64,
}

impl RetryQueue {
    pub fn new() -> Self {
        Self::with_capacity(MAX_QUEUED)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: VecDeque::new(),
            capacity,
            dropped_total: 0,
        }
    }

    pub fn push(&mut self, event: FailedLoginEvent) {
        self.events.push_back(event);
        while self.events.len() > self.capacity {
            self.events.pop_front();
            self.dropped_total += 1;
            tracing::warn!(
                dropped_total = self.dropped_total,
                "retry queue full; dropped oldest event"
            );
        }
    }

    /// All pending events in FIFO order, left in place until `clear`.
    pub fn snapshot(&self) -> Vec<FailedLoginEvent> {
        self.events.iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped_total
    }
}

impl Default for RetryQueue {
    fn default() -> Self {
        Self::new()
    }
}
