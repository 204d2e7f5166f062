// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Configuration consumed by the core.
//!
//! The core does not own config loading; `from_env` is a convenience for the
//! bootstrap binary and tests. Every field has a working default.

use crate::constants::*;
use crate::errors::ConfigError;
use crate::events::EventType;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::error;

/// Eviction policy used by the event reservoirs once they are full.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SamplingStrategy {
    /// Keep the highest-priority events. Among equal priorities the
    /// earliest-inserted event is evicted first.
    #[default]
    Priority,
    /// Classic reservoir sampling: every event seen is retained with
    /// probability `capacity / seen`.
    Uniform,
}

impl FromStr for SamplingStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "priority" => Ok(SamplingStrategy::Priority),
            "uniform" | "random" => Ok(SamplingStrategy::Uniform),
            _ => Err(format!(
                "Invalid sampling strategy: '{s}'. Valid strategies are: priority, uniform"
            )),
        }
    }
}

/// Decides at transaction end whether full trace capture is kept.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum TraceSampling {
    Always,
    Never,
    /// Keep a transaction with the given probability in `[0, 1]`.
    Ratio(f64),
}

impl TraceSampling {
    #[must_use]
    pub fn from_ratio(ratio: f64) -> Self {
        if ratio >= 1.0 {
            TraceSampling::Always
        } else if ratio <= 0.0 || ratio.is_nan() {
            TraceSampling::Never
        } else {
            TraceSampling::Ratio(ratio)
        }
    }

    pub fn decide<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> bool {
        match *self {
            TraceSampling::Always => true,
            TraceSampling::Never => false,
            TraceSampling::Ratio(ratio) => rng.gen::<f64>() < ratio,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventCapacities {
    pub transaction: usize,
    pub error: usize,
    pub span: usize,
    pub custom: usize,
    pub ml: usize,
}

impl Default for EventCapacities {
    fn default() -> Self {
        Self {
            transaction: DEFAULT_TRANSACTION_EVENTS_CAPACITY,
            error: DEFAULT_ERROR_EVENTS_CAPACITY,
            span: DEFAULT_SPAN_EVENTS_CAPACITY,
            custom: DEFAULT_CUSTOM_EVENTS_CAPACITY,
            ml: DEFAULT_ML_EVENTS_CAPACITY,
        }
    }
}

impl EventCapacities {
    #[must_use]
    pub fn get(&self, event_type: EventType) -> usize {
        match event_type {
            EventType::Transaction => self.transaction,
            EventType::Error => self.error,
            EventType::Span => self.span,
            EventType::Custom => self.custom,
            EventType::Ml => self.ml,
        }
    }

    pub fn set(&mut self, event_type: EventType, capacity: usize) {
        match event_type {
            EventType::Transaction => self.transaction = capacity,
            EventType::Error => self.error = capacity,
            EventType::Span => self.span = capacity,
            EventType::Custom => self.custom = capacity,
            EventType::Ml => self.ml = capacity,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Period of the full harvest (metrics, traces and events).
    pub harvest_interval: Duration,
    /// Period of the events-only harvest.
    pub event_harvest_interval: Duration,
    pub export_timeout: Duration,
    /// Consecutive retriable export failures tolerated before a snapshot is dropped.
    pub max_harvest_retries: u32,
    pub max_errors_per_transaction: usize,
    pub max_trace_nodes: usize,
    pub max_trace_depth: usize,
    /// Slowest sampled transaction traces kept per harvest interval.
    pub max_transaction_traces: usize,
    pub event_capacities: EventCapacities,
    pub sampling_strategy: SamplingStrategy,
    pub trace_sampling: TraceSampling,
    /// Fixes the reservoir random draws, for reproducible sampling.
    pub sampling_seed: Option<u64>,
    pub ignored_error_classes: Vec<String>,
    pub metric_shards: usize,
    pub log_level: String,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            harvest_interval: DEFAULT_HARVEST_INTERVAL,
            event_harvest_interval: DEFAULT_EVENT_HARVEST_INTERVAL,
            export_timeout: DEFAULT_EXPORT_TIMEOUT,
            max_harvest_retries: DEFAULT_MAX_HARVEST_RETRIES,
            max_errors_per_transaction: DEFAULT_MAX_ERRORS_PER_TRANSACTION,
            max_trace_nodes: DEFAULT_MAX_TRACE_NODES,
            max_trace_depth: DEFAULT_MAX_TRACE_DEPTH,
            max_transaction_traces: DEFAULT_MAX_TRANSACTION_TRACES,
            event_capacities: EventCapacities::default(),
            sampling_strategy: SamplingStrategy::default(),
            trace_sampling: TraceSampling::Always,
            sampling_seed: None,
            ignored_error_classes: Vec::new(),
            metric_shards: DEFAULT_METRIC_SHARDS,
            log_level: "info".to_string(),
        }
    }
}

impl CoreConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup. Unparseable values
    /// fall back to the default for that field.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let parse_u64 = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());
        let parse_usize = |key: &str| lookup(key).and_then(|v| v.trim().parse::<usize>().ok());

        let mut event_capacities = defaults.event_capacities.clone();
        for (key, event_type) in [
            ("APM_TRANSACTION_EVENTS_CAPACITY", EventType::Transaction),
            ("APM_ERROR_EVENTS_CAPACITY", EventType::Error),
            ("APM_SPAN_EVENTS_CAPACITY", EventType::Span),
            ("APM_CUSTOM_EVENTS_CAPACITY", EventType::Custom),
            ("APM_ML_EVENTS_CAPACITY", EventType::Ml),
        ] {
            if let Some(capacity) = parse_usize(key) {
                event_capacities.set(event_type, capacity);
            }
        }

        let sampling_strategy = match lookup("APM_SAMPLING_STRATEGY") {
            Some(value) => SamplingStrategy::from_str(&value).unwrap_or_else(|e| {
                error!("{}", e);
                SamplingStrategy::default()
            }),
            None => defaults.sampling_strategy,
        };

        let trace_sampling = lookup("APM_TRACE_SAMPLE_RATIO")
            .and_then(|v| v.trim().parse::<f64>().ok())
            .map_or(defaults.trace_sampling, TraceSampling::from_ratio);

        let ignored_error_classes = lookup("APM_IGNORED_ERROR_CLASSES")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        let config = Self {
            harvest_interval: parse_u64("APM_HARVEST_INTERVAL_SECS")
                .map_or(defaults.harvest_interval, Duration::from_secs),
            event_harvest_interval: parse_u64("APM_EVENT_HARVEST_INTERVAL_SECS")
                .map_or(defaults.event_harvest_interval, Duration::from_secs),
            export_timeout: parse_u64("APM_EXPORT_TIMEOUT_SECS")
                .map_or(defaults.export_timeout, Duration::from_secs),
            max_harvest_retries: lookup("APM_MAX_HARVEST_RETRIES")
                .and_then(|v| v.trim().parse::<u32>().ok())
                .unwrap_or(defaults.max_harvest_retries),
            max_errors_per_transaction: parse_usize("APM_MAX_ERRORS_PER_TRANSACTION")
                .unwrap_or(defaults.max_errors_per_transaction),
            max_trace_nodes: parse_usize("APM_MAX_TRACE_NODES").unwrap_or(defaults.max_trace_nodes),
            max_trace_depth: parse_usize("APM_MAX_TRACE_DEPTH").unwrap_or(defaults.max_trace_depth),
            max_transaction_traces: parse_usize("APM_MAX_TRANSACTION_TRACES")
                .unwrap_or(defaults.max_transaction_traces),
            event_capacities,
            sampling_strategy,
            trace_sampling,
            sampling_seed: parse_u64("APM_SAMPLING_SEED"),
            ignored_error_classes,
            metric_shards: defaults.metric_shards,
            log_level: lookup("APM_LOG_LEVEL")
                .map(|v| v.to_lowercase())
                .unwrap_or(defaults.log_level),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.harvest_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "harvest interval must be greater than 0".to_string(),
            ));
        }

        if self.event_harvest_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "event harvest interval must be greater than 0".to_string(),
            ));
        }

        if self.metric_shards == 0 {
            return Err(ConfigError::Invalid(
                "metric shard count must be greater than 0".to_string(),
            ));
        }

        if self.max_trace_depth == 0 {
            return Err(ConfigError::Invalid(
                "trace depth limit must be greater than 0".to_string(),
            ));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.log_level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        Ok(())
    }

    #[must_use]
    pub fn is_ignored_error(&self, class: &str) -> bool {
        self.ignored_error_classes.iter().any(|c| c == class)
    }
}
