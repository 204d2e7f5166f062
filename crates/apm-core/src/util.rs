// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Name validation and identifier helpers.

use crate::constants::{CUSTOM_METRIC_PREFIX, MAX_NAME_BYTES};
use rand::RngCore;

/// Parses and validates a user-supplied custom metric name.
///
/// A valid name must:
/// - Not be empty or contain only whitespace
/// - Contain no control characters and no empty path segment
/// - Be at most 255 bytes once prefixed
///
/// Whitespace is trimmed and the `Custom/` prefix is added when missing.
///
/// # Examples
///
/// ```
/// use apm_core::util::parse_custom_metric_name;
///
/// assert_eq!(parse_custom_metric_name("Cache/hits"), Some("Custom/Cache/hits".to_string()));
/// assert_eq!(
///     parse_custom_metric_name("Custom/queue depth"),
///     Some("Custom/queue depth".to_string())
/// );
/// assert_eq!(parse_custom_metric_name("a//b"), None);
/// assert_eq!(parse_custom_metric_name("  "), None);
/// ```
pub fn parse_custom_metric_name(name: &str) -> Option<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return None;
    }

    let full = if trimmed.starts_with(CUSTOM_METRIC_PREFIX) {
        trimmed.to_string()
    } else {
        format!("{CUSTOM_METRIC_PREFIX}{trimmed}")
    };

    if full.len() > MAX_NAME_BYTES {
        tracing::debug!(
            "Custom metric name of {} bytes exceeds {} bytes. Ignoring metric.",
            full.len(),
            MAX_NAME_BYTES
        );
        return None;
    }

    if let Some(invalid_char) = full.chars().find(|ch| ch.is_control()) {
        tracing::debug!(
            "Custom metric name contains control character {:?} in '{}'. Ignoring metric.",
            invalid_char,
            full.escape_debug()
        );
        return None;
    }

    if full.split('/').any(str::is_empty) {
        tracing::debug!(
            "Custom metric name '{}' has an empty segment. Ignoring metric.",
            full
        );
        return None;
    }

    Some(full)
}

/// Random lowercase hex identifier of `words * 16` digits.
pub(crate) fn hex_id<R: RngCore + ?Sized>(rng: &mut R, words: usize) -> String {
    (0..words).map(|_| format!("{:016x}", rng.next_u64())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_parse_custom_metric_name_valid() {
        assert_eq!(
            parse_custom_metric_name("Custom/app/queue"),
            Some("Custom/app/queue".to_string())
        );
        assert_eq!(
            parse_custom_metric_name("orders"),
            Some("Custom/orders".to_string())
        );
        assert_eq!(
            parse_custom_metric_name("  \tpayments/latency\n"),
            Some("Custom/payments/latency".to_string())
        );
    }

    #[test]
    fn test_parse_custom_metric_name_empty() {
        assert_eq!(parse_custom_metric_name(""), None);
        assert_eq!(parse_custom_metric_name("\t\n"), None);
        assert_eq!(parse_custom_metric_name("Custom/"), None);
    }

    #[test]
    fn test_parse_custom_metric_name_invalid() {
        assert_eq!(parse_custom_metric_name("a\u{7}b"), None);
        assert_eq!(parse_custom_metric_name("trailing/"), None);
        assert_eq!(parse_custom_metric_name(&"x".repeat(300)), None);
    }

    #[test]
    fn test_parse_custom_metric_name_at_limit() {
        let name = "y".repeat(MAX_NAME_BYTES - CUSTOM_METRIC_PREFIX.len());
        assert_eq!(
            parse_custom_metric_name(&name).map(|n| n.len()),
            Some(MAX_NAME_BYTES)
        );
    }

    #[test]
    fn test_hex_id() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let id = hex_id(&mut rng, 2);
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_ne!(id, hex_id(&mut rng, 2));
    }
}
