// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use hashbrown::HashMap;
use std::time::Duration;
use ustr::Ustr;

/// Identity of a time series: a hierarchical name such as
/// `"Database/app/select"`, optionally scoped to the transaction that
/// produced it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MetricKey {
    pub name: Ustr,
    pub scope: Option<Ustr>,
}

impl MetricKey {
    #[must_use]
    pub fn unscoped(name: &str) -> Self {
        Self {
            name: Ustr::from(name),
            scope: None,
        }
    }

    #[must_use]
    pub fn scoped(name: &str, scope: &str) -> Self {
        Self {
            name: Ustr::from(name),
            scope: Some(Ustr::from(scope)),
        }
    }
}

/// Accumulated timings of one metric.
///
/// Merging is commutative and associative over every field. Times are kept
/// as [`Duration`] so that sums are exact integer arithmetic;
/// `sum_of_squares` is in seconds squared.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MetricData {
    pub call_count: u64,
    pub total_time: Duration,
    pub exclusive_time: Duration,
    pub min_time: Duration,
    pub max_time: Duration,
    pub sum_of_squares: f64,
}

impl MetricData {
    #[must_use]
    pub fn new(total: Duration, exclusive: Duration) -> Self {
        let secs = total.as_secs_f64();
        Self {
            call_count: 1,
            total_time: total,
            exclusive_time: exclusive,
            min_time: total,
            max_time: total,
            sum_of_squares: secs * secs,
        }
    }

    /// A count-only sample with zero time, as used by supportability and
    /// error-count metrics. Returns `None` for a zero count.
    #[must_use]
    pub fn count(count: u64) -> Option<Self> {
        (count > 0).then(|| Self {
            call_count: count,
            total_time: Duration::ZERO,
            exclusive_time: Duration::ZERO,
            min_time: Duration::ZERO,
            max_time: Duration::ZERO,
            sum_of_squares: 0.0,
        })
    }

    pub fn merge(&mut self, other: &MetricData) {
        self.call_count = self.call_count.saturating_add(other.call_count);
        self.total_time = self.total_time.saturating_add(other.total_time);
        self.exclusive_time = self.exclusive_time.saturating_add(other.exclusive_time);
        self.min_time = self.min_time.min(other.min_time);
        self.max_time = self.max_time.max(other.max_time);
        self.sum_of_squares += other.sum_of_squares;
    }

    #[must_use]
    pub fn merged(mut self, other: &MetricData) -> Self {
        self.merge(other);
        self
    }
}

/// Metric table keyed by [`MetricKey`]. Used both per transaction and for
/// each partition of the process-wide engine.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StatsTable {
    entries: HashMap<MetricKey, MetricData>,
}

impl StatsTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert one timed call.
    pub fn record(&mut self, key: MetricKey, total: Duration, exclusive: Duration) {
        self.merge_data(key, MetricData::new(total, exclusive));
    }

    pub fn record_count(&mut self, key: MetricKey, count: u64) {
        if let Some(data) = MetricData::count(count) {
            self.merge_data(key, data);
        }
    }

    pub fn merge_data(&mut self, key: MetricKey, data: MetricData) {
        self.entries
            .entry(key)
            .and_modify(|existing| existing.merge(&data))
            .or_insert(data);
    }

    pub fn merge(&mut self, other: StatsTable) {
        if self.entries.is_empty() {
            self.entries = other.entries;
            return;
        }
        for (key, data) in other.entries {
            self.merge_data(key, data);
        }
    }

    /// Re-keys every unscoped entry under `scope`.
    #[must_use]
    pub fn with_scope(self, scope: &str) -> StatsTable {
        let scope = Ustr::from(scope);
        let mut scoped = StatsTable::new();
        for (key, data) in self.entries {
            scoped.merge_data(
                MetricKey {
                    name: key.name,
                    scope: key.scope.or(Some(scope)),
                },
                data,
            );
        }
        scoped
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&MetricData> {
        self.entries.get(&MetricKey::unscoped(name))
    }

    #[must_use]
    pub fn get_key(&self, key: &MetricKey) -> Option<&MetricData> {
        self.entries.get(key)
    }

    #[must_use]
    pub fn get_scoped(&self, name: &str, scope: &str) -> Option<&MetricData> {
        self.entries.get(&MetricKey::scoped(name, scope))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&MetricKey, &MetricData)> {
        self.entries.iter()
    }

    /// Entries sorted by key, for stable export and assertions.
    #[must_use]
    pub fn sorted(&self) -> Vec<(MetricKey, MetricData)> {
        let mut entries: Vec<_> = self.entries.iter().map(|(k, v)| (*k, *v)).collect();
        entries.sort_by(|a, b| {
            (a.0.name.as_str(), a.0.scope.as_ref().map(Ustr::as_str))
                .cmp(&(b.0.name.as_str(), b.0.scope.as_ref().map(Ustr::as_str)))
        });
        entries
    }
}

impl IntoIterator for StatsTable {
    type Item = (MetricKey, MetricData);
    type IntoIter = hashbrown::hash_map::IntoIter<MetricKey, MetricData>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl FromIterator<(MetricKey, MetricData)> for StatsTable {
    fn from_iter<I: IntoIterator<Item = (MetricKey, MetricData)>>(iter: I) -> Self {
        let mut table = StatsTable::new();
        for (key, data) in iter {
            table.merge_data(key, data);
        }
        table
    }
}
