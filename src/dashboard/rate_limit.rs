//! Global send-rate window and the overflow queue behind it.

use std::collections::VecDeque;
use std::time::Instant;

use serde::Serialize;

use crate::protocol::{Channel, Message};
use crate::transport::BroadcastOptions;

/// Counts broadcasts in the current one-second window.
///
/// Process-wide: backpressure is measured on the server's total send rate.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimiter {
    ceiling: u32,
    count: u32,
}

impl RateLimiter {
    pub fn new(ceiling: u32) -> Self {
        Self { ceiling, count: 0 }
    }

    pub fn has_capacity(&self) -> bool {
        self.count < self.ceiling
    }

    pub fn record(&mut self) {
        self.count = self.count.saturating_add(1);
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn ceiling(&self) -> u32 {
        self.ceiling
    }

    /// Starts a new window.
    pub fn reset(&mut self) {
        self.count = 0;
    }

    /// Runs `f` with the counter zeroed and puts the previous value back
    /// afterwards, so whatever `f` sends does not count against the window.
    pub fn bypass<T>(&mut self, f: impl FnOnce(&mut Self) -> T) -> T {
        let saved = self.count;
        self.count = 0;
        let out = f(&mut *self);
        self.count = saved;
        out
    }
}

#[derive(Debug, Clone)]
pub struct QueuedBroadcast {
    pub message: Message,
    pub channel: Option<Channel>,
    pub options: BroadcastOptions,
    pub queued_at: Instant,
    size: usize,
}

/// FIFO of broadcasts deferred by the rate limiter.
#[derive(Debug, Default)]
pub struct BroadcastQueue {
    entries: VecDeque<QueuedBroadcast>,
    bytes: usize,
    peak_len: usize,
    peak_bytes: usize,
    total_queued: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub length: usize,
    pub bytes: usize,
    pub peak_length: usize,
    pub peak_bytes: usize,
    pub total_queued: u64,
}

impl BroadcastQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry of `size` encoded bytes and returns the new queue
    /// length.
    pub fn push(
        &mut self,
        message: Message,
        channel: Option<Channel>,
        options: BroadcastOptions,
        size: usize,
    ) -> usize {
        self.entries.push_back(QueuedBroadcast {
            message,
            channel,
            options,
            queued_at: Instant::now(),
            size,
        });
        self.bytes += size;
        self.total_queued += 1;
        self.peak_len = self.peak_len.max(self.entries.len());
        self.peak_bytes = self.peak_bytes.max(self.bytes);
        self.entries.len()
    }

    pub fn pop_front(&mut self) -> Option<QueuedBroadcast> {
        let entry = self.entries.pop_front()?;
        self.bytes -= entry.size;
        Some(entry)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Empties the queue, returning how many entries were discarded.
    pub fn clear(&mut self) -> usize {
        let dropped = self.entries.len();
        self.entries.clear();
        self.bytes = 0;
        dropped
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            length: self.entries.len(),
            bytes: self.bytes,
            peak_length: self.peak_len,
            peak_bytes: self.peak_bytes,
            total_queued: self.total_queued,
        }
    }
}
