// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error kinds raised inside the core.
//!
//! None of these reach the instrumented application: the producer API logs
//! them, bumps a supportability metric and carries on with less data.

use std::fmt;

/// Misuse of the start/end pairing of trace nodes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TraceError {
    /// A node was closed while younger nodes were still open above it. The
    /// younger nodes were force-closed.
    #[error("trace node {closed} closed out of order, force-closed {force_closed} nested node(s)")]
    OutOfOrder { closed: u64, force_closed: usize },

    /// The node is not on the open stack (already closed, or from another
    /// transaction).
    #[error("trace node {0} is not open")]
    NotOpen(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityKind {
    TraceNodes,
    TraceDepth,
    Errors,
    Attributes,
}

impl fmt::Display for CapacityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CapacityKind::TraceNodes => "trace node",
            CapacityKind::TraceDepth => "trace depth",
            CapacityKind::Errors => "error",
            CapacityKind::Attributes => "attribute",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("{kind} limit of {limit} reached")]
pub struct CapacityExceeded {
    pub kind: CapacityKind,
    pub limit: usize,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AttributeError {
    #[error("attribute key is empty")]
    EmptyKey,

    #[error("attribute key is {0} bytes, longer than the 255 byte limit")]
    KeyTooLong(usize),

    #[error("attribute {0} has a non-finite float value")]
    NonFiniteFloat(String),

    #[error(transparent)]
    TooMany(#[from] CapacityExceeded),
}

/// Failure reported by the export collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExportError {
    /// Temporary failure; the snapshot is merged into the next interval.
    #[error("retriable export failure: {0}")]
    Retriable(String),

    /// Permanent failure; the snapshot is dropped.
    #[error("non-retriable export failure: {0}")]
    NonRetriable(String),
}

impl ExportError {
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        matches!(self, ExportError::Retriable(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = TraceError::OutOfOrder {
            closed: 3,
            force_closed: 2,
        };
        assert_eq!(
            error.to_string(),
            "trace node 3 closed out of order, force-closed 2 nested node(s)"
        );

        let error = CapacityExceeded {
            kind: CapacityKind::Errors,
            limit: 20,
        };
        assert_eq!(error.to_string(), "error limit of 20 reached");

        let error = ConfigError::Invalid("harvest interval must be positive".to_string());
        assert_eq!(
            error.to_string(),
            "Invalid configuration: harvest interval must be positive"
        );
    }

    #[test]
    fn test_export_error_classification() {
        assert!(ExportError::Retriable("503".into()).is_retriable());
        assert!(!ExportError::NonRetriable("400".into()).is_retriable());
    }

    #[test]
    fn test_capacity_converts_into_attribute_error() {
        let error: AttributeError = CapacityExceeded {
            kind: CapacityKind::Attributes,
            limit: 64,
        }
        .into();
        assert_eq!(error.to_string(), "attribute limit of 64 reached");
    }
}
