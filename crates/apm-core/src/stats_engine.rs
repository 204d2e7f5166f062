// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process-wide accumulation of metrics, events and traces for the current
//! harvest interval.
//!
//! Producers take the interval lock in shared mode and then lock only the
//! metric shard or reservoir they touch. A harvest takes the interval lock
//! exclusively and swaps in a fresh interval, so every merge lands entirely
//! in either the drained snapshot or the next interval.

use crate::clock::Clock;
use crate::config::{CoreConfig, EventCapacities, SamplingStrategy};
use crate::events::{EventType, SampledEvent};
use crate::metric::{MetricData, MetricKey, StatsTable};
use crate::reservoir::{Reservoir, ReservoirSnapshot};
use crate::trace_node::TransactionTrace;
use hashbrown::DefaultHashBuilder;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::hash::BuildHasher;
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
};
use tracing::debug;

pub type EventSnapshots = [ReservoirSnapshot<SampledEvent>; 5];

/// Everything drained from one harvest interval.
#[derive(Clone, Debug)]
pub struct HarvestSnapshot {
    pub started_at_ms: u64,
    pub ended_at_ms: u64,
    pub metrics: StatsTable,
    pub events: EventSnapshots,
    /// Slowest first.
    pub traces: Vec<TransactionTrace>,
}

impl HarvestSnapshot {
    #[must_use]
    pub fn events(&self, event_type: EventType) -> &ReservoirSnapshot<SampledEvent> {
        &self.events[event_type.index()]
    }

    #[must_use]
    pub fn event_count(&self) -> usize {
        self.events.iter().map(|r| r.items.len()).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
            && self.traces.is_empty()
            && self.events.iter().all(ReservoirSnapshot::is_empty)
    }
}

/// What a finished transaction contributes to the engine.
#[derive(Debug, Default)]
pub struct TransactionData {
    pub metrics: StatsTable,
    pub events: Vec<SampledEvent>,
    pub trace: Option<TransactionTrace>,
}

#[derive(Debug)]
struct SlowTraces {
    limit: usize,
    traces: Vec<TransactionTrace>,
}

impl SlowTraces {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            traces: Vec::with_capacity(limit),
        }
    }

    fn offer(&mut self, trace: TransactionTrace) -> bool {
        if self.limit == 0 {
            return false;
        }
        if self.traces.len() < self.limit {
            self.traces.push(trace);
            return true;
        }
        let fastest = self
            .traces
            .iter()
            .enumerate()
            .min_by_key(|(_, t)| t.duration)
            .map(|(i, t)| (i, t.duration));
        match fastest {
            Some((index, duration)) if trace.duration > duration => {
                self.traces[index] = trace;
                true
            }
            _ => false,
        }
    }

    fn into_sorted(self) -> Vec<TransactionTrace> {
        let mut traces = self.traces;
        traces.sort_by(|a, b| b.duration.cmp(&a.duration));
        traces
    }
}

type Reservoirs = [Mutex<Reservoir<SampledEvent>>; 5];

struct Interval {
    started_at_ms: u64,
    events_started_at_ms: u64,
    shards: Box<[Mutex<StatsTable>]>,
    reservoirs: Reservoirs,
    traces: Mutex<SlowTraces>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn into_inner<T>(mutex: Mutex<T>) -> T {
    mutex.into_inner().unwrap_or_else(PoisonError::into_inner)
}

pub struct StatsEngine {
    interval: RwLock<Interval>,
    hasher: DefaultHashBuilder,
    seeder: Mutex<ChaCha8Rng>,
    capacities: EventCapacities,
    strategy: SamplingStrategy,
    shard_count: usize,
    max_traces: usize,
    clock: Arc<dyn Clock>,
}

impl StatsEngine {
    #[must_use]
    pub fn new(config: &CoreConfig, clock: Arc<dyn Clock>) -> Self {
        let mut seeder = config
            .sampling_seed
            .map_or_else(ChaCha8Rng::from_entropy, ChaCha8Rng::seed_from_u64);
        let shard_count = config.metric_shards.max(1);
        let now_ms = clock.unix_millis();
        let interval = Interval {
            started_at_ms: now_ms,
            events_started_at_ms: now_ms,
            shards: (0..shard_count).map(|_| Mutex::new(StatsTable::new())).collect(),
            reservoirs: fresh_reservoirs(
                &config.event_capacities,
                config.sampling_strategy,
                &mut seeder,
            ),
            traces: Mutex::new(SlowTraces::new(config.max_transaction_traces)),
        };
        Self {
            interval: RwLock::new(interval),
            hasher: DefaultHashBuilder::default(),
            seeder: Mutex::new(seeder),
            capacities: config.event_capacities.clone(),
            strategy: config.sampling_strategy,
            shard_count,
            max_traces: config.max_transaction_traces,
            clock,
        }
    }

    /// A seed from the engine's generator, for per-transaction randomness.
    pub fn next_seed(&self) -> u64 {
        lock(&self.seeder).next_u64()
    }

    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn read(&self) -> RwLockReadGuard<'_, Interval> {
        self.interval.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Interval> {
        self.interval.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn shard_of(&self, key: &MetricKey) -> usize {
        (self.hasher.hash_one(key) % self.shard_count as u64) as usize
    }

    fn new_reservoirs(&self) -> Reservoirs {
        let mut seeder = lock(&self.seeder);
        fresh_reservoirs(&self.capacities, self.strategy, &mut seeder)
    }

    fn new_interval(&self, now_ms: u64) -> Interval {
        Interval {
            started_at_ms: now_ms,
            events_started_at_ms: now_ms,
            shards: (0..self.shard_count)
                .map(|_| Mutex::new(StatsTable::new()))
                .collect(),
            reservoirs: self.new_reservoirs(),
            traces: Mutex::new(SlowTraces::new(self.max_traces)),
        }
    }

    /// Shard locks are taken one at a time, each for the entries that hash
    /// to it.
    fn merge_into(&self, interval: &Interval, table: StatsTable) {
        if table.is_empty() {
            return;
        }
        let mut grouped: Vec<Vec<(MetricKey, MetricData)>> =
            (0..self.shard_count).map(|_| Vec::new()).collect();
        for (key, data) in table {
            grouped[self.shard_of(&key)].push((key, data));
        }
        for (shard, entries) in interval.shards.iter().zip(grouped) {
            if entries.is_empty() {
                continue;
            }
            let mut shard = lock(shard);
            for (key, data) in entries {
                shard.merge_data(key, data);
            }
        }
    }

    fn record_into(interval: &Interval, event: SampledEvent) -> bool {
        lock(&interval.reservoirs[event.event_type.index()]).insert(event)
    }

    pub fn merge_metrics(&self, table: StatsTable) {
        let interval = self.read();
        self.merge_into(&interval, table);
    }

    /// Routes `event` to the reservoir of its type. Returns whether it was
    /// kept.
    pub fn record_event(&self, event: SampledEvent) -> bool {
        let interval = self.read();
        Self::record_into(&interval, event)
    }

    pub fn record_supportability(&self, name: &str, count: u64) {
        let mut table = StatsTable::new();
        table.record_count(MetricKey::unscoped(name), count);
        self.merge_metrics(table);
    }

    /// Offers a trace to the slowest-N collector of the interval.
    pub fn offer_trace(&self, trace: TransactionTrace) -> bool {
        let interval = self.read();
        let kept = lock(&interval.traces).offer(trace);
        kept
    }

    /// Merges everything a transaction produced into a single interval.
    pub fn merge_transaction(&self, data: TransactionData) {
        let interval = self.read();
        self.merge_into(&interval, data.metrics);
        for event in data.events {
            Self::record_into(&interval, event);
        }
        if let Some(trace) = data.trace {
            lock(&interval.traces).offer(trace);
        }
    }

    /// Takes the whole interval and installs an empty one.
    pub fn harvest_snapshot(&self) -> HarvestSnapshot {
        let now_ms = self.clock.unix_millis();
        let fresh = self.new_interval(now_ms);
        let drained = std::mem::replace(&mut *self.write(), fresh);

        let Interval {
            started_at_ms,
            events_started_at_ms,
            shards,
            reservoirs,
            traces,
        } = drained;
        let mut metrics = StatsTable::new();
        for shard in shards.into_vec() {
            metrics.merge(into_inner(shard));
        }
        let snapshot = HarvestSnapshot {
            started_at_ms: started_at_ms.min(events_started_at_ms),
            ended_at_ms: now_ms,
            metrics,
            events: reservoirs.map(|r| into_inner(r).into_snapshot()),
            traces: into_inner(traces).into_sorted(),
        };
        debug!(
            "Harvested {} metrics, {} events and {} traces",
            snapshot.metrics.len(),
            snapshot.event_count(),
            snapshot.traces.len()
        );
        snapshot
    }

    /// Takes only the event reservoirs; metrics and traces keep accumulating.
    pub fn harvest_events(&self) -> HarvestSnapshot {
        let now_ms = self.clock.unix_millis();
        let fresh = self.new_reservoirs();
        let (events_started_at_ms, drained) = {
            let mut interval = self.write();
            let started = std::mem::replace(&mut interval.events_started_at_ms, now_ms);
            (started, std::mem::replace(&mut interval.reservoirs, fresh))
        };
        HarvestSnapshot {
            started_at_ms: events_started_at_ms,
            ended_at_ms: now_ms,
            metrics: StatsTable::new(),
            events: drained.map(|r| into_inner(r).into_snapshot()),
            traces: Vec::new(),
        }
    }

    /// Folds undelivered snapshots into one payload, bounded like a live
    /// interval: reservoirs keep their capacity and `seen` counts add up,
    /// and only the slowest traces survive.
    pub fn combine<'a>(
        &self,
        snapshots: impl IntoIterator<Item = &'a HarvestSnapshot>,
    ) -> HarvestSnapshot {
        let mut started_at_ms = u64::MAX;
        let mut ended_at_ms = 0;
        let mut metrics = StatsTable::new();
        let mut reservoirs = self.new_reservoirs().map(into_inner);
        let mut slow = SlowTraces::new(self.max_traces);
        for snapshot in snapshots {
            started_at_ms = started_at_ms.min(snapshot.started_at_ms);
            ended_at_ms = ended_at_ms.max(snapshot.ended_at_ms);
            metrics.merge(snapshot.metrics.clone());
            for (reservoir, drained) in reservoirs.iter_mut().zip(&snapshot.events) {
                reservoir.merge_snapshot(drained.clone());
            }
            for trace in &snapshot.traces {
                slow.offer(trace.clone());
            }
        }
        HarvestSnapshot {
            started_at_ms: started_at_ms.min(ended_at_ms),
            ended_at_ms,
            metrics,
            events: reservoirs.map(Reservoir::into_snapshot),
            traces: slow.into_sorted(),
        }
    }

    /// Current value of one metric in the live interval.
    #[must_use]
    pub fn peek_metric(&self, key: MetricKey) -> Option<MetricData> {
        let interval = self.read();
        let shard = lock(&interval.shards[self.shard_of(&key)]);
        let found = shard.get_key(&key).copied();
        found
    }

    /// Insertion attempts seen by one reservoir in the live interval.
    #[must_use]
    pub fn events_seen(&self, event_type: EventType) -> u64 {
        let interval = self.read();
        let seen = lock(&interval.reservoirs[event_type.index()]).seen();
        seen
    }
}

fn fresh_reservoirs(
    capacities: &EventCapacities,
    strategy: SamplingStrategy,
    seeder: &mut ChaCha8Rng,
) -> Reservoirs {
    EventType::ALL.map(|event_type| {
        Mutex::new(Reservoir::new(
            capacities.get(event_type),
            strategy,
            seeder.next_u64(),
        ))
    })
}
