//! Pending publication buffer
//!
//! Holds publications accepted while the broker is unreachable. Only current
//! state matters, so a newer publication for a topic replaces the queued one
//! in place instead of taking a second slot.

use std::collections::VecDeque;

use super::{BusError, Publication};

/// Bounded FIFO of publications, at most one per topic
#[derive(Debug)]
pub struct PendingQueue {
    entries: VecDeque<Publication>,
    capacity: usize,
}

impl PendingQueue {
    /// Create a queue holding at most `capacity` topics (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Queue a publication.
    ///
    /// Replaces a queued publication for the same topic. When the queue is
    /// full of other topics, the oldest entry is evicted to make room and
    /// `Backpressure` names it; the new publication is queued either way.
    pub fn push(&mut self, publication: Publication) -> Result<(), BusError> {
        if let Some(queued) = self
            .entries
            .iter_mut()
            .find(|p| p.topic == publication.topic)
        {
            *queued = publication;
            return Ok(());
        }

        let evicted = if self.entries.len() >= self.capacity {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(publication);

        match evicted {
            Some(dropped) => Err(BusError::Backpressure {
                dropped_topic: dropped.topic,
            }),
            None => Ok(()),
        }
    }

    /// Put publications back at the front, ahead of anything queued since.
    ///
    /// Topics that already have a newer queued publication are skipped.
    pub fn requeue_front(&mut self, publications: Vec<Publication>) {
        for publication in publications.into_iter().rev() {
            if self.entries.iter().any(|p| p.topic == publication.topic) {
                continue;
            }
            if self.entries.len() >= self.capacity {
                // Newer entries win over the backlog being put back
                continue;
            }
            self.entries.push_front(publication);
        }
    }

    /// Remove and return everything, oldest first
    pub fn drain(&mut self) -> Vec<Publication> {
        self.entries.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
