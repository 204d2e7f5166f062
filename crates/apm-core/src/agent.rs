// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Entry point for instrumentation producers.

use crate::attributes::Attributes;
use crate::clock::{Clock, SystemClock};
use crate::config::CoreConfig;
use crate::constants::supportability;
use crate::context;
use crate::events::{draw_priority, parse_event_type, SampledEvent};
use crate::harvest::{Exporter, HarvestHandle, HarvestScheduler};
use crate::metric::{MetricKey, StatsTable};
use crate::stats_engine::StatsEngine;
use crate::transaction::{Transaction, TransactionHandle, TransactionKind};
use crate::util::parse_custom_metric_name;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Clone)]
pub struct Agent {
    config: Arc<CoreConfig>,
    engine: Arc<StatsEngine>,
}

impl Agent {
    #[must_use]
    pub fn new(config: CoreConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock::default()))
    }

    #[must_use]
    pub fn with_clock(config: CoreConfig, clock: Arc<dyn Clock>) -> Self {
        let engine = Arc::new(StatsEngine::new(&config, clock));
        Self {
            config: Arc::new(config),
            engine,
        }
    }

    #[must_use]
    pub fn config(&self) -> &Arc<CoreConfig> {
        &self.config
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<StatsEngine> {
        &self.engine
    }

    /// Starts a transaction and makes it current for the calling task when
    /// it runs under [`context::scope`] or [`context::isolate`], else for
    /// the calling thread. The context does not keep it alive: dropping the
    /// returned handle ends it.
    pub fn begin_transaction(&self, kind: TransactionKind, name: &str) -> TransactionHandle {
        let handle = self.begin_detached(kind, name);
        context::push(&handle);
        handle
    }

    /// Starts a transaction without installing it anywhere, for use with
    /// [`context::scope`] or [`context::enter`].
    pub fn begin_detached(&self, kind: TransactionKind, name: &str) -> TransactionHandle {
        let transaction = Transaction::new(
            kind,
            name,
            Arc::clone(&self.engine),
            Arc::clone(&self.config),
        );
        debug!("Began {:?} transaction {}", kind, transaction.guid());
        TransactionHandle::new(transaction)
    }

    #[must_use]
    pub fn current_transaction(&self) -> Option<TransactionHandle> {
        context::current()
    }

    /// Records a custom metric outside of any transaction.
    pub fn record_custom_metric(&self, name: &str, value: f64) -> bool {
        match (
            parse_custom_metric_name(name),
            Duration::try_from_secs_f64(value),
        ) {
            (Some(name), Ok(value)) => {
                let mut table = StatsTable::new();
                table.record(MetricKey::unscoped(&name), value, value);
                self.engine.merge_metrics(table);
                true
            }
            _ => {
                self.engine
                    .record_supportability(supportability::CUSTOM_METRICS_REJECTED, 1);
                false
            }
        }
    }

    /// Records a custom event outside of any transaction. Returns whether the
    /// reservoir kept it.
    pub fn record_custom_event(&self, event_type: &str, attributes: Attributes) -> bool {
        self.record_event(event_type, attributes, SampledEvent::custom)
    }

    pub fn record_ml_event(&self, event_type: &str, attributes: Attributes) -> bool {
        self.record_event(event_type, attributes, SampledEvent::ml)
    }

    fn record_event(
        &self,
        event_type: &str,
        attributes: Attributes,
        build: fn(&str, u64, f64, Attributes) -> SampledEvent,
    ) -> bool {
        let Some(event_type) = parse_event_type(event_type) else {
            self.engine
                .record_supportability(supportability::EVENTS_REJECTED, 1);
            return false;
        };
        let mut rng = ChaCha8Rng::seed_from_u64(self.engine.next_seed());
        let priority = draw_priority(&mut rng, false);
        let timestamp = self.engine.clock().unix_millis();
        self.engine
            .record_event(build(&event_type, timestamp, priority, attributes))
    }

    /// Builds the harvest scheduler for this agent. The caller spawns
    /// [`HarvestScheduler::run`].
    pub fn harvest_scheduler<E: Exporter>(
        &self,
        exporter: E,
        cancel: CancellationToken,
    ) -> (HarvestScheduler<E>, HarvestHandle) {
        HarvestScheduler::new(Arc::clone(&self.engine), &self.config, exporter, cancel)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::events::EventType;

    fn agent() -> Agent {
        Agent::with_clock(
            CoreConfig {
                sampling_seed: Some(11),
                ..CoreConfig::default()
            },
            Arc::new(ManualClock::new(5_000)),
        )
    }

    #[test]
    fn test_custom_metric_outside_transaction() {
        let agent = agent();
        assert!(agent.record_custom_metric("Queue/depth", 2.5));
        assert!(!agent.record_custom_metric("Queue/depth", f64::NAN));
        assert!(!agent.record_custom_metric("", 1.0));

        let snapshot = agent.engine().harvest_snapshot();
        let data = snapshot.metrics.get("Custom/Queue/depth").unwrap();
        assert_eq!(data.call_count, 1);
        assert_eq!(data.total_time, Duration::from_millis(2500));
        assert_eq!(
            snapshot
                .metrics
                .get(supportability::CUSTOM_METRICS_REJECTED)
                .unwrap()
                .call_count,
            2
        );
    }

    #[test]
    fn test_custom_and_ml_events_outside_transaction() {
        let agent = agent();
        let mut attributes = Attributes::new();
        attributes.insert("sku", "A-1").unwrap();
        assert!(agent.record_custom_event("Purchase", attributes));
        assert!(agent.record_ml_event("InferenceData", Attributes::new()));
        assert!(!agent.record_custom_event("bad/type", Attributes::new()));

        let snapshot = agent.engine().harvest_snapshot();
        let custom = &snapshot.events(EventType::Custom).items;
        assert_eq!(custom.len(), 1);
        assert_eq!(custom[0].timestamp, 5_000);
        assert_eq!(
            custom[0].payload.get("type"),
            Some(&crate::attributes::AttributeValue::String("Purchase".to_string()))
        );
        assert!(custom[0].priority < 1.0);
        assert_eq!(snapshot.events(EventType::Ml).items.len(), 1);
        assert!(snapshot
            .metrics
            .get(supportability::EVENTS_REJECTED)
            .is_some());
    }
}
