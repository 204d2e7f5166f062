// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Attribute payloads attached to transactions and events.
//!
//! Values are a closed set of scalar kinds, validated when inserted. Keys are
//! kept ordered so payloads serialize deterministically.

use crate::constants::{MAX_ATTRIBUTE_KEY_BYTES, MAX_ATTRIBUTE_VALUE_BYTES};
use crate::errors::{AttributeError, CapacityExceeded, CapacityKind};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AttributeValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    /// Milliseconds since the Unix epoch.
    Timestamp(u64),
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::String(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::String(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        AttributeValue::Int(value)
    }
}

impl From<u16> for AttributeValue {
    fn from(value: u16) -> Self {
        AttributeValue::Int(i64::from(value))
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        AttributeValue::Float(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        AttributeValue::Bool(value)
    }
}

/// Truncates `value` to at most `max_bytes`, backing off to a char boundary.
#[must_use]
pub fn truncate_to_boundary(value: &str, max_bytes: usize) -> &str {
    if value.len() <= max_bytes {
        return value;
    }
    let mut end = max_bytes;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Attributes {
    entries: BTreeMap<String, AttributeValue>,
    #[serde(skip)]
    limit: Option<usize>,
}

impl Attributes {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A map refusing new keys once `limit` distinct keys are held.
    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            limit: Some(limit),
        }
    }

    /// Validates and inserts. Overwriting an existing key never counts against
    /// the limit. String values longer than 255 bytes are truncated.
    pub fn insert(
        &mut self,
        key: impl Into<String>,
        value: impl Into<AttributeValue>,
    ) -> Result<(), AttributeError> {
        let key = key.into();
        if key.is_empty() {
            return Err(AttributeError::EmptyKey);
        }
        if key.len() > MAX_ATTRIBUTE_KEY_BYTES {
            return Err(AttributeError::KeyTooLong(key.len()));
        }

        let value = match value.into() {
            AttributeValue::Float(f) if !f.is_finite() => {
                return Err(AttributeError::NonFiniteFloat(key));
            }
            AttributeValue::String(s) if s.len() > MAX_ATTRIBUTE_VALUE_BYTES => {
                let truncated = truncate_to_boundary(&s, MAX_ATTRIBUTE_VALUE_BYTES);
                AttributeValue::String(truncated.to_string())
            }
            other => other,
        };

        if let Some(limit) = self.limit {
            if self.entries.len() >= limit && !self.entries.contains_key(&key) {
                return Err(CapacityExceeded {
                    kind: CapacityKind::Attributes,
                    limit,
                }
                .into());
            }
        }

        self.entries.insert(key, value);
        Ok(())
    }

    /// Inserts agent-controlled values that are already known to be valid.
    pub(crate) fn insert_unchecked(&mut self, key: &str, value: impl Into<AttributeValue>) {
        self.entries.insert(key.to_string(), value.into());
    }

    /// Copies every entry of `other` that is not already present.
    pub(crate) fn extend_missing(&mut self, other: &Attributes) {
        for (key, value) in &other.entries {
            self.entries
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&AttributeValue> {
        self.entries.get(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &AttributeValue)> {
        self.entries.iter()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_overwrite() {
        let mut attrs = Attributes::with_limit(2);
        attrs.insert("user", "alice").unwrap();
        attrs.insert("retries", 3i64).unwrap();
        attrs.insert("user", "bob").unwrap();
        assert_eq!(attrs.len(), 2);
        assert_eq!(attrs.get("user"), Some(&AttributeValue::from("bob")));
    }

    #[test]
    fn test_limit() {
        let mut attrs = Attributes::with_limit(1);
        attrs.insert("a", true).unwrap();
        let err = attrs.insert("b", false).unwrap_err();
        assert!(matches!(err, AttributeError::TooMany(_)));
    }

    #[test]
    fn test_rejects_invalid() {
        let mut attrs = Attributes::new();
        assert_eq!(attrs.insert("", 1i64), Err(AttributeError::EmptyKey));
        assert_eq!(
            attrs.insert("k".repeat(300), 1i64),
            Err(AttributeError::KeyTooLong(300))
        );
        assert_eq!(
            attrs.insert("ratio", f64::NAN),
            Err(AttributeError::NonFiniteFloat("ratio".to_string()))
        );
        assert!(attrs.is_empty());
    }

    #[test]
    fn test_truncates_long_strings_on_char_boundary() {
        let mut attrs = Attributes::new();
        // 'é' is two bytes; 200 of them straddle the 255 byte limit.
        attrs.insert("name", "é".repeat(200)).unwrap();
        match attrs.get("name").unwrap() {
            AttributeValue::String(s) => {
                assert_eq!(s.len(), 254);
                assert!(s.chars().all(|c| c == 'é'));
            }
            other => panic!("unexpected value {other:?}"),
        }
    }

    #[test]
    fn test_serializes_as_flat_object() {
        let mut attrs = Attributes::new();
        attrs.insert("b", 2i64).unwrap();
        attrs.insert("a", "x").unwrap();
        attrs.insert_unchecked("ts", AttributeValue::Timestamp(5));
        assert_eq!(
            serde_json::to_string(&attrs).unwrap(),
            r#"{"a":"x","b":2,"ts":5}"#
        );
    }
}
