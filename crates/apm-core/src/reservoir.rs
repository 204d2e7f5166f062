// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fixed-capacity sample stores.
//!
//! Until a reservoir is full every insertion is kept. Afterwards:
//! - [`SamplingStrategy::Priority`] keeps the highest priorities. The ordering
//!   key is `(priority, insertion sequence)`, so among equal priorities the
//!   earliest-inserted entry is the first to go. No randomness is involved.
//! - [`SamplingStrategy::Uniform`] runs Algorithm R on a seeded `ChaCha8Rng`:
//!   after `n` attempts each one is retained with probability `capacity / n`.
//!
//! `seen` counts every attempt, accepted or not.

use crate::config::SamplingStrategy;
use crate::events::SampledEvent;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

pub trait Prioritized {
    fn priority(&self) -> f64;
}

impl Prioritized for SampledEvent {
    fn priority(&self) -> f64 {
        self.priority
    }
}

struct Entry<T> {
    seq: u64,
    item: T,
}

impl<T: Prioritized> Entry<T> {
    fn key_cmp(&self, other: &Self) -> Ordering {
        self.item
            .priority()
            .total_cmp(&other.item.priority())
            .then(self.seq.cmp(&other.seq))
    }
}

impl<T: Prioritized> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.key_cmp(other) == Ordering::Equal
    }
}

impl<T: Prioritized> Eq for Entry<T> {}

impl<T: Prioritized> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.key_cmp(other))
    }
}

impl<T: Prioritized> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key_cmp(other)
    }
}

enum Slots<T> {
    /// Min-heap on the ordering key; the root is the next eviction candidate.
    Priority(BinaryHeap<Reverse<Entry<T>>>),
    Uniform { items: Vec<T>, rng: ChaCha8Rng },
}

pub struct Reservoir<T> {
    capacity: usize,
    seen: u64,
    next_seq: u64,
    slots: Slots<T>,
}

/// Drained contents of a reservoir.
#[derive(Clone, Debug, PartialEq)]
pub struct ReservoirSnapshot<T> {
    pub capacity: usize,
    pub seen: u64,
    pub items: Vec<T>,
}

impl<T> ReservoirSnapshot<T> {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty() && self.seen == 0
    }
}

impl<T: Prioritized> Reservoir<T> {
    #[must_use]
    pub fn new(capacity: usize, strategy: SamplingStrategy, seed: u64) -> Self {
        let slots = match strategy {
            SamplingStrategy::Priority => Slots::Priority(BinaryHeap::with_capacity(capacity)),
            SamplingStrategy::Uniform => Slots::Uniform {
                items: Vec::with_capacity(capacity),
                rng: ChaCha8Rng::seed_from_u64(seed),
            },
        };
        Self {
            capacity,
            seen: 0,
            next_seq: 0,
            slots,
        }
    }

    /// Offers `item`; returns whether it was stored.
    pub fn insert(&mut self, item: T) -> bool {
        self.seen = self.seen.saturating_add(1);
        self.admit(item)
    }

    fn admit(&mut self, item: T) -> bool {
        if self.capacity == 0 {
            return false;
        }
        let seq = self.next_seq;
        self.next_seq += 1;

        match &mut self.slots {
            Slots::Priority(heap) => {
                let entry = Entry { seq, item };
                if heap.len() < self.capacity {
                    heap.push(Reverse(entry));
                    return true;
                }
                // The newcomer has the largest sequence number, so it wins
                // every tie against the current minimum.
                let evicts = heap.peek().is_some_and(|Reverse(min)| entry > *min);
                if evicts {
                    heap.pop();
                    heap.push(Reverse(entry));
                }
                evicts
            }
            Slots::Uniform { items, rng } => {
                if items.len() < self.capacity {
                    items.push(item);
                    return true;
                }
                let draw = rng.gen_range(0..self.seen.max(1));
                match usize::try_from(draw) {
                    Ok(index) if index < self.capacity => {
                        items[index] = item;
                        true
                    }
                    _ => false,
                }
            }
        }
    }

    /// Folds a previously drained snapshot back in, e.g. after a failed
    /// export. Its `seen` count carries over so sampling rates stay correct.
    pub fn merge_snapshot(&mut self, snapshot: ReservoirSnapshot<T>) {
        self.seen = self.seen.saturating_add(snapshot.seen);
        for item in snapshot.items {
            self.admit(item);
        }
    }

    #[must_use]
    pub fn seen(&self) -> u64 {
        self.seen
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match &self.slots {
            Slots::Priority(heap) => heap.len(),
            Slots::Uniform { items, .. } => items.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Items ordered highest priority first for the priority strategy, in
    /// slot order for the uniform strategy.
    #[must_use]
    pub fn into_snapshot(self) -> ReservoirSnapshot<T> {
        let items = match self.slots {
            Slots::Priority(heap) => heap
                .into_sorted_vec()
                .into_iter()
                .map(|Reverse(entry)| entry.item)
                .collect(),
            Slots::Uniform { items, .. } => items,
        };
        ReservoirSnapshot {
            capacity: self.capacity,
            seen: self.seen,
            items,
        }
    }
}
