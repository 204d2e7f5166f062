// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Mock exporters for driving the harvest scheduler

use apm_core::errors::ExportError;
use apm_core::harvest::Exporter;
use apm_core::stats_engine::HarvestSnapshot;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Records every delivered snapshot. Failures queued with `fail_next` are
/// returned, in order, before anything is recorded.
#[derive(Default)]
pub struct MockExporter {
    delivered: Mutex<Vec<HarvestSnapshot>>,
    failures: Mutex<VecDeque<ExportError>>,
    attempts: Mutex<usize>,
}

#[allow(dead_code)]
impl MockExporter {
    pub fn fail_next(&self, error: ExportError) {
        self.failures.lock().unwrap().push_back(error);
    }

    pub fn delivered(&self) -> Vec<HarvestSnapshot> {
        self.delivered.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> usize {
        *self.attempts.lock().unwrap()
    }

    /// Sum of `call_count` over every delivered snapshot.
    pub fn delivered_count(&self, metric: &str) -> u64 {
        self.delivered
            .lock()
            .unwrap()
            .iter()
            .filter_map(|snapshot| snapshot.metrics.get(metric))
            .map(|data| data.call_count)
            .sum()
    }
}

#[async_trait::async_trait]
impl Exporter for MockExporter {
    async fn export(&self, snapshot: &HarvestSnapshot) -> Result<(), ExportError> {
        *self.attempts.lock().unwrap() += 1;
        let failure = self.failures.lock().unwrap().pop_front();
        if let Some(error) = failure {
            return Err(error);
        }
        self.delivered.lock().unwrap().push(snapshot.clone());
        Ok(())
    }
}
