// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Exporters shipping harvest snapshots out of the process.
//!
//! [`HttpExporter`] posts a zstd-compressed JSON body to the collector.
//! [`LogExporter`] only logs a summary and is used when no collector URL is
//! configured.

use crate::payload;
use apm_core::errors::ExportError;
use apm_core::harvest::Exporter;
use apm_core::stats_engine::HarvestSnapshot;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::StatusCode;
use std::io::Write;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use zstd::stream::write::Encoder;

const LICENSE_KEY_HEADER: &str = "X-License-Key";

pub struct HttpExporter {
    client: reqwest::Client,
    url: String,
    headers: HeaderMap,
    compression_level: i32,
}

impl HttpExporter {
    pub fn new(
        url: String,
        license_key: &str,
        timeout: Duration,
        compression_level: i32,
    ) -> Result<Self, ExportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .use_rustls_tls()
            .build()
            .map_err(|e| ExportError::NonRetriable(format!("failed to build client: {e}")))?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("zstd"));
        let key = HeaderValue::from_str(license_key)
            .map_err(|e| ExportError::NonRetriable(format!("invalid license key: {e}")))?;
        headers.insert(LICENSE_KEY_HEADER, key);

        Ok(Self {
            client,
            url,
            headers,
            compression_level,
        })
    }

    fn compress(&self, data: &[u8]) -> std::io::Result<Vec<u8>> {
        let mut encoder = Encoder::new(Vec::new(), self.compression_level)?;
        encoder.write_all(data)?;
        encoder.finish()
    }
}

/// Maps a collector response status onto the retry policy of the harvest
/// scheduler. Throttling and request timeouts are worth another attempt,
/// other client errors are not.
pub fn classify(status: StatusCode) -> Result<(), ExportError> {
    if status.is_success() {
        return Ok(());
    }
    match status {
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            Err(ExportError::Retriable(format!("collector returned {status}")))
        }
        s if s.is_client_error() => Err(ExportError::NonRetriable(format!(
            "collector rejected payload: {status}"
        ))),
        _ => Err(ExportError::Retriable(format!("collector returned {status}"))),
    }
}

#[async_trait]
impl Exporter for HttpExporter {
    async fn export(&self, snapshot: &HarvestSnapshot) -> Result<(), ExportError> {
        let body = payload::encode(snapshot)
            .map_err(|e| ExportError::NonRetriable(format!("failed to serialize payload: {e}")))?;
        let body = self
            .compress(&body)
            .map_err(|e| ExportError::NonRetriable(format!("failed to compress payload: {e}")))?;

        let start = std::time::Instant::now();
        let resp = self
            .client
            .post(&self.url)
            .headers(self.headers.clone())
            .body(body)
            .send()
            .await;
        let elapsed = start.elapsed();

        match resp {
            Ok(resp) => {
                let status = resp.status();
                debug!(
                    "EXPORT | Collector answered {} in {} ms",
                    status,
                    elapsed.as_millis()
                );
                let result = classify(status);
                if let Err(e) = &result {
                    if e.is_retriable() {
                        warn!("EXPORT | {}", e);
                    } else {
                        error!("EXPORT | {}", e);
                    }
                }
                result
            }
            Err(e) => {
                warn!(
                    "EXPORT | Failed to send request after {} ms: {}",
                    elapsed.as_millis(),
                    e
                );
                Err(ExportError::Retriable(e.to_string()))
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct LogExporter;

#[async_trait]
impl Exporter for LogExporter {
    async fn export(&self, snapshot: &HarvestSnapshot) -> Result<(), ExportError> {
        info!(
            "EXPORT | Harvest {}..{}: {} metrics, {} events, {} traces",
            snapshot.started_at_ms,
            snapshot.ended_at_ms,
            snapshot.metrics.len(),
            snapshot.event_count(),
            snapshot.traces.len()
        );
        Ok(())
    }
}
