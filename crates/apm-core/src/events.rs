// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::attributes::{AttributeValue, Attributes};
use crate::constants::MAX_NAME_BYTES;
use rand::Rng;
use serde::Serialize;
use std::fmt;
use tracing::debug;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum EventType {
    Transaction,
    Error,
    Span,
    Custom,
    Ml,
}

impl EventType {
    pub const ALL: [EventType; 5] = [
        EventType::Transaction,
        EventType::Error,
        EventType::Span,
        EventType::Custom,
        EventType::Ml,
    ];

    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            EventType::Transaction => 0,
            EventType::Error => 1,
            EventType::Span => 2,
            EventType::Custom => 3,
            EventType::Ml => 4,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventType::Transaction => "Transaction",
            EventType::Error => "TransactionError",
            EventType::Span => "Span",
            EventType::Custom => "Custom",
            EventType::Ml => "InferenceData",
        };
        f.write_str(s)
    }
}

/// Draws a sampling priority: uniform in `[0, 1)`, lifted by one when the
/// owning trace was sampled so sampled data always outranks unsampled data.
pub fn draw_priority<R: Rng + ?Sized>(rng: &mut R, sampled: bool) -> f64 {
    let base: f64 = rng.gen();
    if sampled {
        base + 1.0
    } else {
        base
    }
}

/// An event kept by a reservoir. The priority is fixed at creation.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SampledEvent {
    pub event_type: EventType,
    pub timestamp: u64,
    pub priority: f64,
    pub payload: Attributes,
}

impl SampledEvent {
    #[must_use]
    pub fn new(event_type: EventType, timestamp: u64, priority: f64, payload: Attributes) -> Self {
        let mut payload = payload;
        payload.insert_unchecked("type", event_type.to_string());
        payload.insert_unchecked("timestamp", AttributeValue::Timestamp(timestamp));
        payload.insert_unchecked("priority", priority);
        Self {
            event_type,
            timestamp,
            priority,
            payload,
        }
    }

    /// A user-defined event. `type_name` replaces the generic `type` field.
    #[must_use]
    pub fn custom(type_name: &str, timestamp: u64, priority: f64, attributes: Attributes) -> Self {
        let mut event = Self::new(EventType::Custom, timestamp, priority, attributes);
        event.payload.insert_unchecked("type", type_name);
        event
    }

    /// A machine-learning inference event.
    #[must_use]
    pub fn ml(type_name: &str, timestamp: u64, priority: f64, attributes: Attributes) -> Self {
        let mut event = Self::new(EventType::Ml, timestamp, priority, attributes);
        event.payload.insert_unchecked("type", type_name);
        event
    }
}

/// Validates a user-supplied event type name: ASCII alphanumerics, `:`, `_`
/// and spaces, at most 255 bytes.
///
/// ```
/// use apm_core::events::parse_event_type;
///
/// assert_eq!(parse_event_type("Checkout"), Some("Checkout".to_string()));
/// assert_eq!(parse_event_type(" ml:Inference_v2 "), Some("ml:Inference_v2".to_string()));
/// assert_eq!(parse_event_type("bad-type"), None);
/// assert_eq!(parse_event_type(""), None);
/// ```
pub fn parse_event_type(name: &str) -> Option<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() || trimmed.len() > MAX_NAME_BYTES {
        debug!("Rejected custom event type of {} bytes", trimmed.len());
        return None;
    }
    if let Some(invalid) = trimmed
        .chars()
        .find(|&ch| !ch.is_ascii_alphanumeric() && ch != ':' && ch != '_' && ch != ' ')
    {
        debug!(
            "Custom event type '{}' contains invalid character '{}'",
            trimmed, invalid
        );
        return None;
    }
    Some(trimmed.to_string())
}
