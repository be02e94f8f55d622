//! RetryQueue - bounded per-destination FIFO buffers
//!
//! Documents that could not be delivered are parked here until the drain loop
//! picks them up. Each destination gets its own queue, created on first use and
//! capped at a fixed size. Offers never block: a full queue rejects.

use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

/// Per-destination bounded queues
pub struct RetryQueue<T> {
    max_size_per_destination: usize,
    queues: DashMap<String, Arc<Mutex<VecDeque<T>>>>,
}

impl<T> RetryQueue<T> {
    pub fn new(max_size_per_destination: usize) -> Self {
        Self {
            max_size_per_destination,
            queues: DashMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.max_size_per_destination
    }

    /// Offer one item. Returns false, leaving the queue untouched, when full.
    pub fn offer(&self, destination: &str, item: T) -> bool {
        let queue = self.queue_for(destination);
        let mut queue = queue.lock();
        if queue.len() >= self.max_size_per_destination {
            return false;
        }
        queue.push_back(item);
        true
    }

    /// Offer items in order, stopping at the first one that does not fit.
    ///
    /// Returns how many were accepted; those are always a prefix of `items`.
    pub fn offer_all<I>(&self, destination: &str, items: I) -> usize
    where
        I: IntoIterator<Item = T>,
    {
        let mut items = items.into_iter().peekable();
        if items.peek().is_none() {
            return 0;
        }

        let queue = self.queue_for(destination);
        let mut queue = queue.lock();
        let mut added = 0;
        for item in items {
            if queue.len() >= self.max_size_per_destination {
                break;
            }
            queue.push_back(item);
            added += 1;
        }
        added
    }

    /// Remove up to `max` items from the head of the destination's queue.
    pub fn poll_batch(&self, destination: &str, max: usize) -> Vec<T> {
        let Some(queue) = self.existing(destination) else {
            return Vec::new();
        };
        let mut queue = queue.lock();
        let take = max.min(queue.len());
        let batch: Vec<T> = queue.drain(..take).collect();
        batch
    }

    pub fn size(&self, destination: &str) -> usize {
        self.existing(destination)
            .map(|q| q.lock().len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, destination: &str) -> bool {
        self.size(destination) == 0
    }

    /// True when every known destination queue is empty
    pub fn all_empty(&self) -> bool {
        self.queues.iter().all(|entry| entry.value().lock().is_empty())
    }

    /// Total queued across destinations
    pub fn total_size(&self) -> usize {
        self.queues.iter().map(|entry| entry.value().lock().len()).sum()
    }

    fn existing(&self, destination: &str) -> Option<Arc<Mutex<VecDeque<T>>>> {
        self.queues.get(destination).map(|entry| entry.value().clone())
    }

    fn queue_for(&self, destination: &str) -> Arc<Mutex<VecDeque<T>>> {
        if let Some(queue) = self.existing(destination) {
            return queue;
        }
        self.queues
            .entry(destination.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(VecDeque::new())))
            .value()
            .clone()
    }
}
