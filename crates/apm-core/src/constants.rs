// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

pub const DEFAULT_HARVEST_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_EVENT_HARVEST_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_EXPORT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_HARVEST_RETRIES: u32 = 2;

pub const DEFAULT_MAX_ERRORS_PER_TRANSACTION: usize = 20;
pub const DEFAULT_MAX_TRACE_NODES: usize = 2000;
pub const DEFAULT_MAX_TRACE_DEPTH: usize = 256;
pub const DEFAULT_MAX_TRANSACTION_TRACES: usize = 5;

pub const DEFAULT_TRANSACTION_EVENTS_CAPACITY: usize = 10_000;
pub const DEFAULT_ERROR_EVENTS_CAPACITY: usize = 100;
pub const DEFAULT_SPAN_EVENTS_CAPACITY: usize = 2000;
pub const DEFAULT_CUSTOM_EVENTS_CAPACITY: usize = 1200;
pub const DEFAULT_ML_EVENTS_CAPACITY: usize = 1000;

/// Number of independently locked partitions of the live metric table.
pub const DEFAULT_METRIC_SHARDS: usize = 16;

pub const MAX_ATTRIBUTE_KEY_BYTES: usize = 255;
pub const MAX_ATTRIBUTE_VALUE_BYTES: usize = 255;
pub const MAX_CUSTOM_ATTRIBUTES: usize = 64;
pub const MAX_NAME_BYTES: usize = 255;

pub const CUSTOM_METRIC_PREFIX: &str = "Custom/";

pub mod supportability {
    pub const TRACE_NODES_TRUNCATED: &str = "Supportability/TraceNodes/Truncated";
    pub const TRACE_OUT_OF_ORDER: &str = "Supportability/Trace/OutOfOrder";
    pub const ERRORS_DROPPED: &str = "Supportability/Errors/Dropped";
    pub const ATTRIBUTES_DROPPED: &str = "Supportability/Attributes/Dropped";
    pub const HARVEST_DROPPED: &str = "Supportability/Harvest/Dropped";
    pub const HARVEST_REJECTED: &str = "Supportability/Harvest/Rejected";
    pub const CUSTOM_METRICS_REJECTED: &str = "Supportability/CustomMetrics/Rejected";
    pub const EVENTS_REJECTED: &str = "Supportability/Events/Rejected";
}
