// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! One logical request or background task.
//!
//! A [`Transaction`] owns its call tree and a local [`StatsTable`]; nothing
//! touches the shared [`StatsEngine`] until [`Transaction::end`], which turns
//! the tree into metrics, events and an optional trace and merges them in one
//! step. Producers normally hold a [`TransactionHandle`].

use crate::attributes::{truncate_to_boundary, AttributeValue, Attributes};
use crate::clock::Clock;
use crate::config::CoreConfig;
use crate::constants::{
    supportability, MAX_ATTRIBUTE_VALUE_BYTES, MAX_CUSTOM_ATTRIBUTES, MAX_NAME_BYTES,
};
use crate::context;
use crate::errors::{CapacityExceeded, CapacityKind, TraceError};
use crate::events::{draw_priority, parse_event_type, EventType, SampledEvent};
use crate::metric::{MetricKey, StatsTable};
use crate::stats_engine::{StatsEngine, TransactionData};
use crate::trace_node::{CallTree, NodeKind, NodeToken, TransactionTrace};
use crate::util::{hex_id, parse_custom_metric_name};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError, Weak};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionKind {
    /// A request handled by a web entry point.
    Web,
    Background,
}

impl TransactionKind {
    #[must_use]
    pub fn is_background(self) -> bool {
        matches!(self, TransactionKind::Background)
    }

    fn all_suffix(self) -> &'static str {
        match self {
            TransactionKind::Web => "allWeb",
            TransactionKind::Background => "allOther",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ErrorInfo {
    pub class: String,
    pub message: String,
    pub attributes: Attributes,
}

impl ErrorInfo {
    pub fn new(class: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            message: message.into(),
            attributes: Attributes::new(),
        }
    }

    #[must_use]
    pub fn with_attribute(mut self, key: &str, value: impl Into<AttributeValue>) -> Self {
        if let Err(e) = self.attributes.insert(key, value) {
            debug!("Dropping attribute of error {}: {}", self.class, e);
        }
        self
    }
}

#[derive(Debug)]
struct NoticedError {
    info: ErrorInfo,
    timestamp_ms: u64,
}

#[derive(Debug)]
struct PendingEvent {
    event_type: EventType,
    type_name: String,
    timestamp_ms: u64,
    attributes: Attributes,
}

fn sanitize_name(name: &str) -> Option<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(truncate_to_boundary(trimmed, MAX_NAME_BYTES).to_string())
}

pub struct Transaction {
    kind: TransactionKind,
    name: String,
    guid: String,
    trace_id: String,
    start_ms: u64,
    tree: CallTree,
    metrics: StatsTable,
    custom_attributes: Attributes,
    agent_attributes: Attributes,
    errors: Vec<NoticedError>,
    errors_seen: u64,
    pending_events: Vec<PendingEvent>,
    ignored: bool,
    ended: bool,
    rng: ChaCha8Rng,
    clock: Arc<dyn Clock>,
    engine: Arc<StatsEngine>,
    config: Arc<CoreConfig>,
}

impl Transaction {
    pub(crate) fn new(
        kind: TransactionKind,
        name: &str,
        engine: Arc<StatsEngine>,
        config: Arc<CoreConfig>,
    ) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(engine.next_seed());
        let clock = Arc::clone(engine.clock());
        let tree = CallTree::new(clock.now(), config.max_trace_nodes, config.max_trace_depth);
        Self {
            kind,
            name: sanitize_name(name).unwrap_or_else(|| "Unknown".to_string()),
            guid: hex_id(&mut rng, 1),
            trace_id: hex_id(&mut rng, 2),
            start_ms: clock.unix_millis(),
            tree,
            metrics: StatsTable::new(),
            custom_attributes: Attributes::with_limit(MAX_CUSTOM_ATTRIBUTES),
            agent_attributes: Attributes::new(),
            errors: Vec::new(),
            errors_seen: 0,
            pending_events: Vec::new(),
            ignored: false,
            ended: false,
            rng,
            clock,
            engine,
            config,
        }
    }

    #[must_use]
    pub fn kind(&self) -> TransactionKind {
        self.kind
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `WebTransaction/{name}` or `OtherTransaction/{name}`; also the scope of
    /// every node metric.
    #[must_use]
    pub fn metric_name(&self) -> String {
        match self.kind {
            TransactionKind::Web => format!("WebTransaction/{}", self.name),
            TransactionKind::Background => format!("OtherTransaction/{}", self.name),
        }
    }

    #[must_use]
    pub fn guid(&self) -> &str {
        &self.guid
    }

    #[must_use]
    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    #[must_use]
    pub fn is_ended(&self) -> bool {
        self.ended
    }

    #[must_use]
    pub fn is_ignored(&self) -> bool {
        self.ignored
    }

    /// Errors noticed, including those beyond the per-transaction cap.
    #[must_use]
    pub fn error_count(&self) -> u64 {
        self.errors_seen
    }

    #[must_use]
    pub fn tree(&self) -> &CallTree {
        &self.tree
    }

    fn count(&mut self, name: &str) {
        self.metrics.record_count(MetricKey::unscoped(name), 1);
    }

    pub fn start_node(&mut self, kind: NodeKind) -> NodeToken {
        let (token, exceeded) = self.tree.start_node(kind, self.clock.now());
        if let Some(exceeded) = exceeded {
            if !self.ended {
                debug!(
                    "Transaction {}: {}, operation time kept in its parent",
                    self.guid, exceeded
                );
                self.count(supportability::TRACE_NODES_TRUNCATED);
            }
        }
        token
    }

    /// Closes the operation. Misuse is logged and counted, never returned.
    pub fn end_node(&mut self, token: NodeToken) {
        match self.tree.end_node(token, self.clock.now()) {
            Ok(()) => {}
            Err(e @ TraceError::OutOfOrder { .. }) => {
                warn!("Transaction {}: {}", self.guid, e);
                self.count(supportability::TRACE_OUT_OF_ORDER);
            }
            Err(e) => debug!("Transaction {}: {}", self.guid, e),
        }
    }

    /// Upserts into the transaction-local table only.
    pub fn record_metric(&mut self, name: &str, duration: Duration, exclusive: Duration) {
        if self.ended {
            return;
        }
        self.metrics
            .record(MetricKey::unscoped(name), duration, exclusive.min(duration));
    }

    /// Records `value` seconds under `Custom/{name}`.
    pub fn record_custom_metric(&mut self, name: &str, value: f64) -> bool {
        if self.ended {
            return false;
        }
        match (
            parse_custom_metric_name(name),
            Duration::try_from_secs_f64(value),
        ) {
            (Some(name), Ok(value)) => {
                self.metrics.record(MetricKey::unscoped(&name), value, value);
                true
            }
            (_, value) => {
                debug!(
                    "Rejected custom metric '{}' (value valid: {})",
                    name.escape_debug(),
                    value.is_ok()
                );
                self.count(supportability::CUSTOM_METRICS_REJECTED);
                false
            }
        }
    }

    /// Returns whether the error was stored. Errors past the cap still count
    /// towards the error metrics.
    pub fn notice_error(&mut self, error: ErrorInfo) -> bool {
        if self.ended {
            return false;
        }
        if self.config.is_ignored_error(&error.class) {
            debug!("Ignoring error of class {}", error.class);
            return false;
        }
        self.errors_seen += 1;
        let limit = self.config.max_errors_per_transaction;
        if self.errors.len() >= limit {
            let exceeded = CapacityExceeded {
                kind: CapacityKind::Errors,
                limit,
            };
            debug!("Transaction {}: {}, not storing {}", self.guid, exceeded, error.class);
            self.count(supportability::ERRORS_DROPPED);
            return false;
        }
        self.errors.push(NoticedError {
            info: error,
            timestamp_ms: self.clock.unix_millis(),
        });
        true
    }

    pub fn add_custom_attribute(&mut self, key: &str, value: impl Into<AttributeValue>) -> bool {
        if self.ended {
            return false;
        }
        match self.custom_attributes.insert(key, value) {
            Ok(()) => true,
            Err(e) => {
                debug!("Dropping custom attribute: {}", e);
                self.count(supportability::ATTRIBUTES_DROPPED);
                false
            }
        }
    }

    #[must_use]
    pub fn custom_attributes(&self) -> &Attributes {
        &self.custom_attributes
    }

    pub fn set_request(&mut self, method: &str, uri: &str) {
        self.agent_attributes.insert_unchecked(
            "request.method",
            truncate_to_boundary(method, MAX_ATTRIBUTE_VALUE_BYTES),
        );
        self.agent_attributes
            .insert_unchecked("request.uri", truncate_to_boundary(uri, MAX_ATTRIBUTE_VALUE_BYTES));
    }

    pub fn set_response_status(&mut self, status: u16) {
        self.agent_attributes.insert_unchecked("response.status", status);
    }

    /// Renames the transaction; the last name set before `end` wins.
    pub fn set_name(&mut self, name: &str) -> bool {
        if self.ended {
            return false;
        }
        match sanitize_name(name) {
            Some(name) => {
                self.name = name;
                true
            }
            None => false,
        }
    }

    /// Discards the transaction: `end` will merge nothing.
    pub fn ignore(&mut self) {
        self.ignored = true;
    }

    pub fn record_custom_event(&mut self, event_type: &str, attributes: Attributes) -> bool {
        self.pend_event(EventType::Custom, event_type, attributes)
    }

    pub fn record_ml_event(&mut self, event_type: &str, attributes: Attributes) -> bool {
        self.pend_event(EventType::Ml, event_type, attributes)
    }

    fn pend_event(
        &mut self,
        event_type: EventType,
        type_name: &str,
        attributes: Attributes,
    ) -> bool {
        if self.ended {
            return false;
        }
        let Some(type_name) = parse_event_type(type_name) else {
            self.count(supportability::EVENTS_REJECTED);
            return false;
        };
        self.pending_events.push(PendingEvent {
            event_type,
            type_name,
            timestamp_ms: self.clock.unix_millis(),
            attributes,
        });
        true
    }

    /// Finishes the transaction and merges it into the engine. Only the first
    /// call has an effect; it returns `true`.
    pub fn end(&mut self) -> bool {
        if self.ended {
            return false;
        }
        self.ended = true;

        let still_open = self.tree.finish(self.clock.now());
        if still_open > 0 {
            debug!(
                "Transaction {} ended with {} open operations, closing them",
                self.guid, still_open
            );
        }
        if self.ignored {
            debug!("Transaction {} ignored, nothing recorded", self.guid);
            return true;
        }

        let sampled = self.config.trace_sampling.decide(&mut self.rng);
        let priority = draw_priority(&mut self.rng, sampled);
        let data = self.finalize(sampled, priority);
        self.engine.merge_transaction(data);
        true
    }

    fn finalize(&mut self, sampled: bool, priority: f64) -> TransactionData {
        let metric_name = self.metric_name();
        let background = self.kind.is_background();
        let duration = self.tree.root().duration();
        let total_time = self.tree.total_exclusive();

        let mut metrics = std::mem::take(&mut self.metrics);
        let (rollup, total_prefix) = match self.kind {
            TransactionKind::Web => ("WebTransaction", "WebTransactionTotalTime"),
            TransactionKind::Background => ("OtherTransaction/all", "OtherTransactionTotalTime"),
        };
        metrics.record(MetricKey::unscoped(rollup), duration, duration);
        metrics.record(MetricKey::unscoped(&metric_name), duration, duration);
        if !background {
            metrics.record(MetricKey::unscoped("HttpDispatcher"), duration, duration);
        }
        metrics.record(MetricKey::unscoped(total_prefix), total_time, total_time);
        metrics.record(
            MetricKey::unscoped(&format!("{total_prefix}/{}", self.name)),
            total_time,
            total_time,
        );

        let mut scoped = StatsTable::new();
        for (_, node, _) in self.tree.walk() {
            let kind = node.kind();
            if let Some(name) = kind.metric_name() {
                scoped.record(MetricKey::unscoped(&name), node.duration(), node.exclusive());
            }
            for name in kind.rollup_names(background) {
                metrics.record(MetricKey::unscoped(&name), node.duration(), node.exclusive());
            }
        }
        metrics.merge(scoped.with_scope(&metric_name));

        if self.errors_seen > 0 {
            let all_kind = format!("Errors/{}", self.kind.all_suffix());
            let by_name = format!("Errors/{metric_name}");
            for name in ["Errors/all", all_kind.as_str(), by_name.as_str()] {
                metrics.record_count(MetricKey::unscoped(name), self.errors_seen);
            }
        }

        let mut attributes = self.agent_attributes.clone();
        attributes.extend_missing(&self.custom_attributes);

        let mut events = Vec::with_capacity(1 + self.errors.len() + self.pending_events.len());
        events.push(self.transaction_event(&metric_name, sampled, priority, &attributes));
        for error in std::mem::take(&mut self.errors) {
            events.push(self.error_event(error, &metric_name, sampled, priority, &attributes));
        }
        if sampled {
            self.span_events(&metric_name, priority, &mut events);
        }
        for pending in std::mem::take(&mut self.pending_events) {
            let event = match pending.event_type {
                EventType::Ml => SampledEvent::ml(
                    &pending.type_name,
                    pending.timestamp_ms,
                    priority,
                    pending.attributes,
                ),
                _ => SampledEvent::custom(
                    &pending.type_name,
                    pending.timestamp_ms,
                    priority,
                    pending.attributes,
                ),
            };
            events.push(event);
        }

        let trace = sampled.then(|| TransactionTrace {
            transaction_name: metric_name.clone(),
            guid: self.guid.clone(),
            trace_id: self.trace_id.clone(),
            start_ms: self.start_ms,
            duration,
            root: self.tree.to_segment(&metric_name),
            attributes,
        });

        TransactionData {
            metrics,
            events,
            trace,
        }
    }

    fn transaction_event(
        &self,
        metric_name: &str,
        sampled: bool,
        priority: f64,
        attributes: &Attributes,
    ) -> SampledEvent {
        let mut payload = Attributes::new();
        payload.insert_unchecked("name", metric_name);
        payload.insert_unchecked("duration", self.tree.root().duration().as_secs_f64());
        payload.insert_unchecked("totalTime", self.tree.total_exclusive().as_secs_f64());
        payload.insert_unchecked("guid", self.guid.as_str());
        payload.insert_unchecked("traceId", self.trace_id.as_str());
        payload.insert_unchecked("sampled", sampled);
        payload.insert_unchecked("error", self.errors_seen > 0);
        payload.extend_missing(attributes);
        SampledEvent::new(EventType::Transaction, self.start_ms, priority, payload)
    }

    fn error_event(
        &self,
        error: NoticedError,
        metric_name: &str,
        sampled: bool,
        priority: f64,
        attributes: &Attributes,
    ) -> SampledEvent {
        let mut payload = Attributes::new();
        payload.insert_unchecked("error.class", error.info.class.as_str());
        payload.insert_unchecked(
            "error.message",
            truncate_to_boundary(&error.info.message, MAX_ATTRIBUTE_VALUE_BYTES),
        );
        payload.insert_unchecked("transactionName", metric_name);
        payload.insert_unchecked("guid", self.guid.as_str());
        payload.insert_unchecked("traceId", self.trace_id.as_str());
        payload.insert_unchecked("sampled", sampled);
        payload.extend_missing(&error.info.attributes);
        payload.extend_missing(attributes);
        SampledEvent::new(EventType::Error, error.timestamp_ms, priority, payload)
    }

    fn span_events(&mut self, metric_name: &str, priority: f64, events: &mut Vec<SampledEvent>) {
        let guids: Vec<String> = (0..self.tree.len())
            .map(|_| hex_id(&mut self.rng, 1))
            .collect();
        let origin = self.tree.root().start();

        for (id, node, parent) in self.tree.walk() {
            let mut payload = Attributes::new();
            payload.insert_unchecked("guid", guids[id.index()].as_str());
            payload.insert_unchecked("traceId", self.trace_id.as_str());
            payload.insert_unchecked("transactionId", self.guid.as_str());
            payload.insert_unchecked("category", node.kind().category());
            payload.insert_unchecked("duration", node.duration().as_secs_f64());
            payload.insert_unchecked("sampled", true);
            match parent {
                Some(parent) => {
                    payload.insert_unchecked("name", node.name());
                    payload.insert_unchecked("parentId", guids[parent.index()].as_str());
                }
                None => {
                    payload.insert_unchecked("name", metric_name);
                    payload.insert_unchecked("nr.entryPoint", true);
                }
            }
            match node.kind() {
                NodeKind::Datastore { operation, target } => {
                    payload.insert_unchecked("db.operation", operation.as_str());
                    if let Some(target) = target {
                        payload.insert_unchecked("db.collection", target.as_str());
                    }
                }
                NodeKind::External {
                    host,
                    library,
                    method,
                } => {
                    payload.insert_unchecked("server.address", host.as_str());
                    payload.insert_unchecked("component", library.as_str());
                    payload.insert_unchecked("http.method", method.as_str());
                }
                _ => {}
            }

            let offset_ms =
                u64::try_from(node.start().saturating_sub(origin).as_millis()).unwrap_or(u64::MAX);
            events.push(SampledEvent::new(
                EventType::Span,
                self.start_ms.saturating_add(offset_ms),
                priority,
                payload,
            ));
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.ended {
            debug!("Transaction {} dropped without end, finishing it", self.guid);
            self.end();
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("guid", &self.guid)
            .field("ended", &self.ended)
            .finish_non_exhaustive()
    }
}

/// Shared handle to a transaction. The transaction ends when its last
/// handle is dropped, if it was not ended before. The current-transaction
/// context holds no handle of its own.
#[derive(Clone)]
pub struct TransactionHandle {
    inner: Arc<Mutex<Transaction>>,
}

impl TransactionHandle {
    pub(crate) fn new(transaction: Transaction) -> Self {
        Self {
            inner: Arc::new(Mutex::new(transaction)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Transaction> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `f` with exclusive access. Must not end a [`NodeRef`] of the
    /// same transaction inside `f`.
    pub fn with<R>(&self, f: impl FnOnce(&mut Transaction) -> R) -> R {
        f(&mut self.lock())
    }

    pub fn start_node(&self, kind: NodeKind) -> NodeRef {
        let token = self.lock().start_node(kind);
        NodeRef {
            transaction: Arc::downgrade(&self.inner),
            token,
            open: true,
        }
    }

    /// Times `f` as a child of the innermost open operation.
    pub fn trace<R>(&self, kind: NodeKind, f: impl FnOnce() -> R) -> R {
        let node = self.start_node(kind);
        let result = f();
        node.end();
        result
    }

    pub fn record_metric(&self, name: &str, duration: Duration, exclusive: Duration) {
        self.lock().record_metric(name, duration, exclusive);
    }

    pub fn record_custom_metric(&self, name: &str, value: f64) -> bool {
        self.lock().record_custom_metric(name, value)
    }

    pub fn notice_error(&self, error: ErrorInfo) -> bool {
        self.lock().notice_error(error)
    }

    pub fn add_custom_attribute(&self, key: &str, value: impl Into<AttributeValue>) -> bool {
        self.lock().add_custom_attribute(key, value)
    }

    pub fn set_name(&self, name: &str) -> bool {
        self.lock().set_name(name)
    }

    pub fn ignore(&self) {
        self.lock().ignore();
    }

    pub fn record_custom_event(&self, event_type: &str, attributes: Attributes) -> bool {
        self.lock().record_custom_event(event_type, attributes)
    }

    pub fn record_ml_event(&self, event_type: &str, attributes: Attributes) -> bool {
        self.lock().record_ml_event(event_type, attributes)
    }

    /// Ends the transaction and uninstalls it from the calling thread.
    pub fn end(&self) -> bool {
        context::remove(self);
        self.lock().end()
    }

    #[must_use]
    pub fn is_ended(&self) -> bool {
        self.lock().is_ended()
    }

    #[must_use]
    pub fn guid(&self) -> String {
        self.lock().guid().to_string()
    }

    #[must_use]
    pub fn ptr_eq(&self, other: &TransactionHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn downgrade(&self) -> WeakTransactionHandle {
        WeakTransactionHandle {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

/// Non-owning reference kept by the current-transaction context.
#[derive(Clone, Debug)]
pub(crate) struct WeakTransactionHandle {
    inner: Weak<Mutex<Transaction>>,
}

impl WeakTransactionHandle {
    pub(crate) fn upgrade(&self) -> Option<TransactionHandle> {
        self.inner.upgrade().map(|inner| TransactionHandle { inner })
    }

    pub(crate) fn points_to(&self, handle: &TransactionHandle) -> bool {
        std::ptr::eq(self.inner.as_ptr(), Arc::as_ptr(&handle.inner))
    }

    /// Whether the transaction still exists and has not ended. A transaction
    /// locked by another caller counts as live.
    pub(crate) fn is_live(&self) -> bool {
        let Some(inner) = self.inner.upgrade() else {
            return false;
        };
        let live = match inner.try_lock() {
            Ok(transaction) => !transaction.is_ended(),
            Err(TryLockError::Poisoned(poisoned)) => !poisoned.into_inner().is_ended(),
            Err(TryLockError::WouldBlock) => true,
        };
        live
    }
}

impl fmt::Debug for TransactionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TransactionHandle")
            .field(&Arc::as_ptr(&self.inner))
            .finish()
    }
}

/// An open operation. Closed by [`NodeRef::end`] or on drop.
#[must_use = "the operation is closed as soon as the NodeRef is dropped"]
#[derive(Debug)]
pub struct NodeRef {
    transaction: Weak<Mutex<Transaction>>,
    token: NodeToken,
    open: bool,
}

impl NodeRef {
    #[must_use]
    pub fn token(&self) -> NodeToken {
        self.token
    }

    pub fn end(mut self) {
        self.close();
    }

    fn close(&mut self) {
        if !std::mem::replace(&mut self.open, false) {
            return;
        }
        if let Some(transaction) = self.transaction.upgrade() {
            let mut transaction = transaction.lock().unwrap_or_else(PoisonError::into_inner);
            transaction.end_node(self.token);
        }
    }
}

impl Drop for NodeRef {
    fn drop(&mut self) {
        self.close();
    }
}
