// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! JSON body of a harvest request.
//!
//! Times are reported in seconds for metrics and milliseconds for trace
//! segments.

use apm_core::attributes::Attributes;
use apm_core::events::{EventType, SampledEvent};
use apm_core::metric::{MetricData, MetricKey};
use apm_core::stats_engine::HarvestSnapshot;
use apm_core::trace_node::{Segment, TransactionTrace};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Serialize)]
struct Payload<'a> {
    start_ms: u64,
    end_ms: u64,
    metrics: Vec<MetricPayload>,
    events: BTreeMap<String, EventsPayload<'a>>,
    traces: Vec<TracePayload<'a>>,
}

#[derive(Serialize)]
struct MetricPayload {
    name: String,
    scope: Option<String>,
    call_count: u64,
    total_time: f64,
    exclusive_time: f64,
    min_time: f64,
    max_time: f64,
    sum_of_squares: f64,
}

impl MetricPayload {
    fn new(key: MetricKey, data: MetricData) -> Self {
        Self {
            name: key.name.to_string(),
            scope: key.scope.map(|s| s.to_string()),
            call_count: data.call_count,
            total_time: data.total_time.as_secs_f64(),
            exclusive_time: data.exclusive_time.as_secs_f64(),
            min_time: data.min_time.as_secs_f64(),
            max_time: data.max_time.as_secs_f64(),
            sum_of_squares: data.sum_of_squares,
        }
    }
}

#[derive(Serialize)]
struct EventsPayload<'a> {
    reservoir_size: usize,
    events_seen: u64,
    events: Vec<&'a Attributes>,
}

#[derive(Serialize)]
struct TracePayload<'a> {
    name: &'a str,
    guid: &'a str,
    trace_id: &'a str,
    start_ms: u64,
    duration_ms: f64,
    attributes: &'a Attributes,
    root: SegmentPayload<'a>,
}

#[derive(Serialize)]
struct SegmentPayload<'a> {
    name: &'a str,
    start_ms: f64,
    duration_ms: f64,
    exclusive_ms: f64,
    children: Vec<SegmentPayload<'a>>,
}

fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

impl<'a> From<&'a Segment> for SegmentPayload<'a> {
    fn from(segment: &'a Segment) -> Self {
        Self {
            name: &segment.name,
            start_ms: millis(segment.start),
            duration_ms: millis(segment.duration),
            exclusive_ms: millis(segment.exclusive),
            children: segment.children.iter().map(SegmentPayload::from).collect(),
        }
    }
}

impl<'a> From<&'a TransactionTrace> for TracePayload<'a> {
    fn from(trace: &'a TransactionTrace) -> Self {
        Self {
            name: &trace.transaction_name,
            guid: &trace.guid,
            trace_id: &trace.trace_id,
            start_ms: trace.start_ms,
            duration_ms: millis(trace.duration),
            attributes: &trace.attributes,
            root: SegmentPayload::from(&trace.root),
        }
    }
}

/// Serializes `snapshot`. Event types without any insertion attempt are
/// left out.
pub fn encode(snapshot: &HarvestSnapshot) -> Result<Vec<u8>, serde_json::Error> {
    let events = EventType::ALL
        .iter()
        .map(|event_type| (event_type, snapshot.events(*event_type)))
        .filter(|(_, reservoir)| !reservoir.is_empty())
        .map(|(event_type, reservoir)| {
            (
                event_type.to_string(),
                EventsPayload {
                    reservoir_size: reservoir.capacity,
                    events_seen: reservoir.seen,
                    events: reservoir
                        .items
                        .iter()
                        .map(|event: &SampledEvent| &event.payload)
                        .collect(),
                },
            )
        })
        .collect();

    let payload = Payload {
        start_ms: snapshot.started_at_ms,
        end_ms: snapshot.ended_at_ms,
        metrics: snapshot
            .metrics
            .sorted()
            .into_iter()
            .map(|(key, data)| MetricPayload::new(key, data))
            .collect(),
        events,
        traces: snapshot.traces.iter().map(TracePayload::from).collect(),
    };
    serde_json::to_vec(&payload)
}
