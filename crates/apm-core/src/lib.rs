// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-process transaction tracing and stats aggregation for an APM agent.
//!
//! Instrumentation begins a transaction through [`agent::Agent`], opens and
//! closes trace nodes on its [`transaction::TransactionHandle`], and ends it.
//! Ending merges the transaction's metrics, events and trace into the shared
//! [`stats_engine::StatsEngine`], which the [`harvest::HarvestScheduler`]
//! periodically drains into an [`harvest::Exporter`].

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod agent;
pub mod attributes;
pub mod clock;
pub mod config;
pub mod constants;
pub mod context;
pub mod errors;
pub mod events;
pub mod harvest;
pub mod metric;
pub mod reservoir;
pub mod stats_engine;
pub mod trace_node;
pub mod transaction;
pub mod util;
