// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Time sources for trace nodes and events.
//!
//! Durations come from a monotonic reading so that wall-clock adjustments
//! never produce a node that ends before it starts. Event timestamps use the
//! wall clock.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

pub trait Clock: Send + Sync + Debug {
    /// Monotonic reading, relative to an arbitrary fixed origin.
    fn now(&self) -> Duration;

    /// Wall-clock time in milliseconds since the Unix epoch.
    fn unix_millis(&self) -> u64;
}

#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn unix_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or_default()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicU64,
    base_millis: u64,
}

impl ManualClock {
    #[must_use]
    pub fn new(base_millis: u64) -> Self {
        Self {
            nanos: AtomicU64::new(0),
            base_millis,
        }
    }

    pub fn set(&self, at: Duration) {
        self.nanos
            .store(u64::try_from(at.as_nanos()).unwrap_or(u64::MAX), Ordering::Release);
    }

    pub fn advance(&self, by: Duration) {
        self.nanos.fetch_add(
            u64::try_from(by.as_nanos()).unwrap_or(u64::MAX),
            Ordering::AcqRel,
        );
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::Acquire))
    }

    fn unix_millis(&self) -> u64 {
        self.base_millis
            .saturating_add(u64::try_from(self.now().as_millis()).unwrap_or(u64::MAX))
    }
}
