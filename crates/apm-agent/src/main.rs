// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

mod exporter;
mod logger;
mod payload;

use std::{env, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use apm_core::{agent::Agent, config::CoreConfig, harvest::Exporter};
use exporter::{HttpExporter, LogExporter};

const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

#[tokio::main]
pub async fn main() {
    let log_level = env::var("APM_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    let env_filter = format!("h2=off,hyper=off,reqwest=off,rustls=off,{log_level}");

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .event_format(logger::Formatter)
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let config = match CoreConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Error loading config: {e}");
            return;
        }
    };

    let collector_url = env::var("APM_COLLECTOR_URL").ok();
    let license_key = env::var("APM_LICENSE_KEY").unwrap_or_default();
    let compression_level = env::var("APM_COMPRESSION_LEVEL")
        .ok()
        .and_then(|level| level.parse::<i32>().ok())
        .unwrap_or(DEFAULT_COMPRESSION_LEVEL);

    let exporter: Arc<dyn Exporter> = match collector_url {
        Some(url) => {
            match HttpExporter::new(url, &license_key, config.export_timeout, compression_level) {
                Ok(exporter) => Arc::new(exporter),
                Err(e) => {
                    error!("Unable to build collector client: {e}");
                    return;
                }
            }
        }
        None => {
            info!("APM_COLLECTOR_URL not set, harvests will only be logged");
            Arc::new(LogExporter)
        }
    };

    let agent = Agent::new(config);
    let cancel = CancellationToken::new();
    let (scheduler, handle) = agent.harvest_scheduler(exporter, cancel.clone());
    let scheduler_task = tokio::spawn(scheduler.run());

    info!(
        "APM agent started, harvesting every {}s",
        agent.config().harvest_interval.as_secs()
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Unable to listen for shutdown signal: {e}");
    }

    info!("Shutting down, running final harvest");
    if handle.shutdown().is_err() {
        cancel.cancel();
    }
    if let Err(e) = scheduler_task.await {
        error!("Harvest scheduler task failed: {e}");
    }
}
