//! Deduplicated queue of entities waiting for a metadata lookup and the
//! interval scheduler that drains it in batches.

use std::collections::{HashSet, VecDeque};

use tracing::debug;

/// FIFO of entity ids with set semantics: an id already waiting is not
/// queued twice.
#[derive(Debug, Default)]
pub struct RefreshQueue {
    order: VecDeque<String>,
    members: HashSet<String>,
}

impl RefreshQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `id`. Returns false when it was already waiting.
    pub fn push(&mut self, id: &str) -> bool {
        if !self.members.insert(id.to_string()) {
            return false;
        }
        self.order.push_back(id.to_string());
        true
    }

    pub fn remove(&mut self, id: &str) -> bool {
        if !self.members.remove(id) {
            return false;
        }
        self.order.retain(|queued| queued != id);
        true
    }

    /// Dequeue up to `n` ids in insertion order.
    pub fn take(&mut self, n: usize) -> Vec<String> {
        let count = n.min(self.order.len());
        let batch: Vec<String> = self.order.drain(..count).collect();
        for id in &batch {
            self.members.remove(id);
        }
        batch
    }

    pub fn contains(&self, id: &str) -> bool {
        self.members.contains(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Fires at most once per interval and hands back one batch of queued ids.
#[derive(Debug, Clone)]
pub struct RefreshScheduler {
    interval_ms: u64,
    batch_size: usize,
    last_run: u64,
}

impl RefreshScheduler {
    /// `start` is the reference time for the first interval.
    pub fn new(interval_ms: u64, batch_size: usize, start: u64) -> Self {
        Self {
            interval_ms,
            batch_size: batch_size.max(1),
            last_run: start,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Restart the interval from `now`.
    pub fn reset(&mut self, now: u64) {
        self.last_run = now;
    }

    /// Next batch when the interval has elapsed and work is waiting.
    pub fn poll(&mut self, now: u64, queue: &mut RefreshQueue) -> Option<Vec<String>> {
        if now.saturating_sub(self.last_run) <= self.interval_ms {
            return None;
        }
        self.last_run = now;
        if queue.is_empty() {
            return None;
        }
        let batch = queue.take(self.batch_size);
        debug!(
            batch = batch.len(),
            remaining = queue.len(),
            "metadata refresh batch"
        );
        Some(batch)
    }
}
