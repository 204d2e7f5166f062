// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Periodic drain of the [`StatsEngine`] into an [`Exporter`].
//!
//! The scheduler runs as a task driven by two timers: a full harvest every
//! `harvest_interval` and an events-only harvest every
//! `event_harvest_interval`. A snapshot whose export fails with a retriable
//! error is carried and sent again together with the next interval. Each
//! carried snapshot counts its own failures and is dropped once it has
//! failed more than `max_harvest_retries` times.

use crate::config::CoreConfig;
use crate::constants::supportability;
use crate::errors::ExportError;
use crate::stats_engine::{HarvestSnapshot, StatsEngine};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Delivers harvested data to the collector.
#[async_trait]
pub trait Exporter: Send + Sync {
    async fn export(&self, snapshot: &HarvestSnapshot) -> Result<(), ExportError>;
}

#[async_trait]
impl<E: Exporter + ?Sized> Exporter for Arc<E> {
    async fn export(&self, snapshot: &HarvestSnapshot) -> Result<(), ExportError> {
        (**self).export(snapshot).await
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HarvestKind {
    /// Metrics, traces and events.
    Full,
    Events,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HarvestOutcome {
    /// Nothing was recorded during the interval.
    Empty,
    Exported,
    /// Export failed; the undelivered data is carried into the next
    /// harvest. `attempt` is the highest failure count among carried
    /// snapshots, `dropped` how many ran out of retries on this failure.
    Retrying { attempt: u32, dropped: usize },
    /// Export failed and every snapshot ran out of retries.
    Dropped,
    /// The collector refused the payload; it was discarded.
    Rejected,
}

#[derive(Debug)]
pub enum HarvestCommand {
    Harvest(HarvestKind, oneshot::Sender<HarvestOutcome>),
    Shutdown,
}

#[derive(Clone, Debug)]
pub struct HarvestHandle {
    tx: mpsc::UnboundedSender<HarvestCommand>,
    cancel: CancellationToken,
}

impl HarvestHandle {
    /// Runs a full harvest now and waits for its outcome.
    pub async fn flush(&self) -> Result<HarvestOutcome, String> {
        self.harvest(HarvestKind::Full).await
    }

    pub async fn flush_events(&self) -> Result<HarvestOutcome, String> {
        self.harvest(HarvestKind::Events).await
    }

    async fn harvest(&self, kind: HarvestKind) -> Result<HarvestOutcome, String> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(HarvestCommand::Harvest(kind, response_tx))
            .map_err(|e| format!("Failed to send harvest command: {}", e))?;

        response_rx
            .await
            .map_err(|e| format!("Failed to receive harvest outcome: {}", e))
    }

    /// Stops the scheduler after a final full harvest.
    pub fn shutdown(&self) -> Result<(), mpsc::error::SendError<HarvestCommand>> {
        self.tx.send(HarvestCommand::Shutdown)
    }

    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// A snapshot that failed to export, with the number of times it failed.
#[derive(Debug)]
struct Carried {
    snapshot: HarvestSnapshot,
    failures: u32,
}

pub struct HarvestScheduler<E> {
    engine: Arc<StatsEngine>,
    exporter: E,
    rx: mpsc::UnboundedReceiver<HarvestCommand>,
    cancel: CancellationToken,
    harvest_interval: Duration,
    event_harvest_interval: Duration,
    export_timeout: Duration,
    max_retries: u32,
    carried_full: VecDeque<Carried>,
    carried_events: VecDeque<Carried>,
}

impl<E: Exporter> HarvestScheduler<E> {
    pub fn new(
        engine: Arc<StatsEngine>,
        config: &CoreConfig,
        exporter: E,
        cancel: CancellationToken,
    ) -> (Self, HarvestHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let scheduler = Self {
            engine,
            exporter,
            rx,
            cancel: cancel.clone(),
            harvest_interval: config.harvest_interval,
            event_harvest_interval: config.event_harvest_interval,
            export_timeout: config.export_timeout,
            max_retries: config.max_harvest_retries,
            carried_full: VecDeque::new(),
            carried_events: VecDeque::new(),
        };
        let handle = HarvestHandle { tx, cancel };
        (scheduler, handle)
    }

    /// Drains the engine and exports the snapshot together with anything
    /// still carried from earlier failures. A full harvest also takes the
    /// carried events-only snapshots.
    pub async fn harvest_once(&mut self, kind: HarvestKind) -> HarvestOutcome {
        let fresh = match kind {
            HarvestKind::Full => self.engine.harvest_snapshot(),
            HarvestKind::Events => self.engine.harvest_events(),
        };
        let mut batch: Vec<Carried> = match kind {
            HarvestKind::Full => self
                .carried_full
                .drain(..)
                .chain(self.carried_events.drain(..))
                .collect(),
            HarvestKind::Events => self.carried_events.drain(..).collect(),
        };
        if !fresh.is_empty() {
            batch.push(Carried {
                snapshot: fresh,
                failures: 0,
            });
        }
        if batch.is_empty() {
            return HarvestOutcome::Empty;
        }

        let combined;
        let payload = match batch.as_slice() {
            [only] => &only.snapshot,
            many => {
                combined = self.engine.combine(many.iter().map(|c| &c.snapshot));
                &combined
            }
        };

        let result = match tokio::time::timeout(self.export_timeout, self.exporter.export(payload))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(ExportError::Retriable(format!(
                "export timed out after {:?}",
                self.export_timeout
            ))),
        };

        match result {
            Ok(()) => {
                debug!(
                    "Exported {:?} harvest: {} metrics, {} events, {} traces",
                    kind,
                    payload.metrics.len(),
                    payload.event_count(),
                    payload.traces.len()
                );
                HarvestOutcome::Exported
            }
            Err(e) if e.is_retriable() => self.carry(kind, batch, &e),
            Err(e) => {
                error!(
                    "{:?} harvest rejected by the collector ({}), dropping {} snapshot(s)",
                    kind,
                    e,
                    batch.len()
                );
                self.engine
                    .record_supportability(supportability::HARVEST_REJECTED, batch.len() as u64);
                HarvestOutcome::Rejected
            }
        }
    }

    fn carry(
        &mut self,
        kind: HarvestKind,
        batch: Vec<Carried>,
        e: &ExportError,
    ) -> HarvestOutcome {
        let queue = match kind {
            HarvestKind::Full => &mut self.carried_full,
            HarvestKind::Events => &mut self.carried_events,
        };
        let mut attempt = 0;
        let mut dropped = 0;
        for mut carried in batch {
            carried.failures += 1;
            if carried.failures > self.max_retries {
                dropped += 1;
            } else {
                attempt = attempt.max(carried.failures);
                queue.push_back(carried);
            }
        }

        if dropped > 0 {
            error!(
                "{:?} harvest failed ({}), dropping {} snapshot(s) after {} retries",
                kind, e, dropped, self.max_retries
            );
            self.engine
                .record_supportability(supportability::HARVEST_DROPPED, dropped as u64);
        }
        if attempt == 0 {
            return HarvestOutcome::Dropped;
        }
        warn!(
            "{:?} harvest failed ({}), retrying with the next interval (attempt {} of {})",
            kind, e, attempt, self.max_retries
        );
        HarvestOutcome::Retrying { attempt, dropped }
    }

    pub async fn run(mut self) {
        debug!("Harvest scheduler started");

        let start = Instant::now();
        let mut full_timer = interval_at(start + self.harvest_interval, self.harvest_interval);
        let mut event_timer = interval_at(
            start + self.event_harvest_interval,
            self.event_harvest_interval,
        );
        full_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        event_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                command = self.rx.recv() => match command {
                    Some(HarvestCommand::Harvest(kind, response_tx)) => {
                        let outcome = self.harvest_once(kind).await;
                        if response_tx.send(outcome).is_err() {
                            error!("Failed to send harvest outcome - receiver dropped");
                        }
                    }
                    Some(HarvestCommand::Shutdown) | None => break,
                },
                _ = full_timer.tick() => {
                    self.harvest_once(HarvestKind::Full).await;
                    event_timer.reset();
                }
                _ = event_timer.tick() => {
                    self.harvest_once(HarvestKind::Events).await;
                }
            }
        }

        debug!("Harvest scheduler shutting down, running final harvest");
        let outcome = self.harvest_once(HarvestKind::Full).await;
        debug!("Final harvest outcome: {:?}", outcome);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::attributes::Attributes;
    use crate::clock::ManualClock;
    use crate::events::{EventType, SampledEvent};
    use crate::metric::{MetricKey, StatsTable};
    use std::sync::Mutex;

    #[derive(Default)]
    struct ScriptedExporter {
        exported: Mutex<Vec<HarvestSnapshot>>,
        failures: Mutex<VecDeque<ExportError>>,
        delay: Mutex<Option<Duration>>,
    }

    impl ScriptedExporter {
        fn failing(failures: Vec<ExportError>) -> Self {
            Self {
                failures: Mutex::new(failures.into()),
                ..Self::default()
            }
        }

        fn exported_count(&self, name: &str) -> u64 {
            self.exported
                .lock()
                .unwrap()
                .iter()
                .filter_map(|s| s.metrics.get(name))
                .map(|d| d.call_count)
                .sum()
        }
    }

    #[async_trait]
    impl Exporter for ScriptedExporter {
        async fn export(&self, snapshot: &HarvestSnapshot) -> Result<(), ExportError> {
            let delay = *self.delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let failure = self.failures.lock().unwrap().pop_front();
            match failure {
                Some(e) => Err(e),
                None => {
                    self.exported.lock().unwrap().push(snapshot.clone());
                    Ok(())
                }
            }
        }
    }

    fn config() -> CoreConfig {
        CoreConfig {
            max_harvest_retries: 2,
            sampling_seed: Some(3),
            ..CoreConfig::default()
        }
    }

    fn scheduler(
        exporter: Arc<ScriptedExporter>,
    ) -> (Arc<StatsEngine>, HarvestScheduler<Arc<ScriptedExporter>>, HarvestHandle) {
        let config = config();
        let engine = Arc::new(StatsEngine::new(&config, Arc::new(ManualClock::new(0))));
        let (scheduler, handle) = HarvestScheduler::new(
            Arc::clone(&engine),
            &config,
            exporter,
            CancellationToken::new(),
        );
        (engine, scheduler, handle)
    }

    fn hit(engine: &StatsEngine, count: u64) {
        let mut table = StatsTable::new();
        table.record_count(MetricKey::unscoped("Custom/hits"), count);
        engine.merge_metrics(table);
    }

    #[tokio::test]
    async fn test_empty_interval_is_not_exported() {
        let exporter = Arc::new(ScriptedExporter::default());
        let (_engine, mut scheduler, _handle) = scheduler(Arc::clone(&exporter));
        assert_eq!(
            scheduler.harvest_once(HarvestKind::Full).await,
            HarvestOutcome::Empty
        );
        assert!(exporter.exported.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retriable_failure_lands_in_next_interval() {
        let exporter = Arc::new(ScriptedExporter::failing(vec![ExportError::Retriable(
            "503".to_string(),
        )]));
        let (engine, mut scheduler, _handle) = scheduler(Arc::clone(&exporter));

        hit(&engine, 3);
        assert_eq!(
            scheduler.harvest_once(HarvestKind::Full).await,
            HarvestOutcome::Retrying {
                attempt: 1,
                dropped: 0
            }
        );
        hit(&engine, 2);
        assert_eq!(
            scheduler.harvest_once(HarvestKind::Full).await,
            HarvestOutcome::Exported
        );
        assert_eq!(exporter.exported_count("Custom/hits"), 5);
    }

    #[tokio::test]
    async fn test_dropped_after_max_retries() {
        let exporter = Arc::new(ScriptedExporter::failing(
            (0..3)
                .map(|_| ExportError::Retriable("connection reset".to_string()))
                .collect(),
        ));
        let (engine, mut scheduler, _handle) = scheduler(Arc::clone(&exporter));

        hit(&engine, 1);
        assert_eq!(
            scheduler.harvest_once(HarvestKind::Full).await,
            HarvestOutcome::Retrying {
                attempt: 1,
                dropped: 0
            }
        );
        assert_eq!(
            scheduler.harvest_once(HarvestKind::Full).await,
            HarvestOutcome::Retrying {
                attempt: 2,
                dropped: 0
            }
        );
        assert_eq!(
            scheduler.harvest_once(HarvestKind::Full).await,
            HarvestOutcome::Dropped
        );

        assert_eq!(
            scheduler.harvest_once(HarvestKind::Full).await,
            HarvestOutcome::Exported
        );
        assert_eq!(exporter.exported_count("Custom/hits"), 0);
        assert_eq!(exporter.exported_count(supportability::HARVEST_DROPPED), 1);
    }

    #[tokio::test]
    async fn test_non_retriable_failure_is_rejected() {
        let exporter = Arc::new(ScriptedExporter::failing(vec![ExportError::NonRetriable(
            "413".to_string(),
        )]));
        let (engine, mut scheduler, _handle) = scheduler(Arc::clone(&exporter));

        hit(&engine, 4);
        assert_eq!(
            scheduler.harvest_once(HarvestKind::Full).await,
            HarvestOutcome::Rejected
        );
        let data = engine
            .peek_metric(MetricKey::unscoped(supportability::HARVEST_REJECTED))
            .unwrap();
        assert_eq!(data.call_count, 1);
        assert!(engine.peek_metric(MetricKey::unscoped("Custom/hits")).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_export_timeout_is_retriable() {
        let exporter = Arc::new(ScriptedExporter {
            delay: Mutex::new(Some(Duration::from_secs(30))),
            ..ScriptedExporter::default()
        });
        let (engine, mut scheduler, _handle) = scheduler(Arc::clone(&exporter));

        hit(&engine, 1);
        assert_eq!(
            scheduler.harvest_once(HarvestKind::Full).await,
            HarvestOutcome::Retrying {
                attempt: 1,
                dropped: 0
            }
        );
        assert!(exporter.exported.lock().unwrap().is_empty());

        *exporter.delay.lock().unwrap() = None;
        assert_eq!(
            scheduler.harvest_once(HarvestKind::Full).await,
            HarvestOutcome::Exported
        );
        assert_eq!(exporter.exported_count("Custom/hits"), 1);
    }

    #[tokio::test]
    async fn test_fresh_interval_survives_expired_retry_budget() {
        let exporter = Arc::new(ScriptedExporter::failing(
            (0..2)
                .map(|_| ExportError::Retriable("503".to_string()))
                .collect(),
        ));
        let config = CoreConfig {
            max_harvest_retries: 1,
            ..config()
        };
        let engine = Arc::new(StatsEngine::new(&config, Arc::new(ManualClock::new(0))));
        let (mut scheduler, _handle) = HarvestScheduler::new(
            Arc::clone(&engine),
            &config,
            Arc::clone(&exporter),
            CancellationToken::new(),
        );

        hit(&engine, 4);
        assert_eq!(
            scheduler.harvest_once(HarvestKind::Full).await,
            HarvestOutcome::Retrying {
                attempt: 1,
                dropped: 0
            }
        );

        let mut table = StatsTable::new();
        table.record_count(MetricKey::unscoped("Custom/later"), 1);
        engine.merge_metrics(table);
        assert_eq!(
            scheduler.harvest_once(HarvestKind::Full).await,
            HarvestOutcome::Retrying {
                attempt: 1,
                dropped: 1
            }
        );

        assert_eq!(
            scheduler.harvest_once(HarvestKind::Full).await,
            HarvestOutcome::Exported
        );
        assert_eq!(exporter.exported_count("Custom/later"), 1);
        assert_eq!(exporter.exported_count("Custom/hits"), 0);
        assert_eq!(exporter.exported_count(supportability::HARVEST_DROPPED), 1);
    }

    #[tokio::test]
    async fn test_events_carried_into_full_harvest() {
        let exporter = Arc::new(ScriptedExporter::failing(vec![ExportError::Retriable(
            "503".to_string(),
        )]));
        let (engine, mut scheduler, _handle) = scheduler(Arc::clone(&exporter));

        engine.record_event(SampledEvent::new(
            EventType::Custom,
            0,
            0.5,
            Attributes::new(),
        ));
        assert_eq!(
            scheduler.harvest_once(HarvestKind::Events).await,
            HarvestOutcome::Retrying {
                attempt: 1,
                dropped: 0
            }
        );

        hit(&engine, 1);
        assert_eq!(
            scheduler.harvest_once(HarvestKind::Full).await,
            HarvestOutcome::Exported
        );
        let exported = exporter.exported.lock().unwrap();
        assert_eq!(exported.len(), 1);
        assert_eq!(exported[0].events(EventType::Custom).items.len(), 1);
        assert_eq!(exported[0].metrics.get("Custom/hits").unwrap().call_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_harvests_on_interval_and_on_shutdown() {
        let exporter = Arc::new(ScriptedExporter::default());
        let (engine, scheduler, handle) = scheduler(Arc::clone(&exporter));
        let task = tokio::spawn(scheduler.run());

        hit(&engine, 1);
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(exporter.exported.lock().unwrap().len(), 1);

        hit(&engine, 2);
        handle.shutdown().unwrap();
        task.await.unwrap();
        assert_eq!(exporter.exported.lock().unwrap().len(), 2);
        assert_eq!(exporter.exported_count("Custom/hits"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_through_handle_and_cancel() {
        let exporter = Arc::new(ScriptedExporter::default());
        let (engine, scheduler, handle) = scheduler(Arc::clone(&exporter));
        let task = tokio::spawn(scheduler.run());

        assert_eq!(handle.flush().await.unwrap(), HarvestOutcome::Empty);
        hit(&engine, 1);
        assert_eq!(handle.flush().await.unwrap(), HarvestOutcome::Exported);

        handle.cancellation_token().cancel();
        task.await.unwrap();
        assert!(handle.flush().await.is_err());
    }
}
