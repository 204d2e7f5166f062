// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Call tree of one transaction.
//!
//! Nodes live in an arena indexed by [`NodeId`]; parents own a list of child
//! ids and there are no back-references. The currently open nodes are kept
//! on an explicit stack whose bottom is the transaction root.
//!
//! Once the configured node count or depth is reached, further operations are
//! still tracked on the stack (so start/end pairing keeps working) but get no
//! node: their time stays in the parent's exclusive time.

use crate::attributes::Attributes;
use crate::errors::{CapacityExceeded, CapacityKind, TraceError};
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

impl NodeId {
    pub const ROOT: NodeId = NodeId(0);

    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

/// Identifies an open operation, tracked or not.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeToken(u64);

impl NodeToken {
    #[must_use]
    pub fn id(self) -> u64 {
        self.0
    }
}

/// What a node measured. Determines the metrics it produces.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeKind {
    Root,
    Function {
        name: String,
    },
    Datastore {
        operation: String,
        target: Option<String>,
    },
    External {
        host: String,
        library: String,
        method: String,
    },
    /// A caller-named metric, used verbatim.
    Custom {
        name: String,
    },
}

impl NodeKind {
    pub fn function(name: impl Into<String>) -> Self {
        NodeKind::Function { name: name.into() }
    }

    pub fn datastore(operation: impl Into<String>, target: Option<&str>) -> Self {
        NodeKind::Datastore {
            operation: operation.into(),
            target: target.map(String::from),
        }
    }

    pub fn external(
        host: impl Into<String>,
        library: impl Into<String>,
        method: impl Into<String>,
    ) -> Self {
        NodeKind::External {
            host: host.into(),
            library: library.into(),
            method: method.into(),
        }
    }

    pub fn custom(name: impl Into<String>) -> Self {
        NodeKind::Custom { name: name.into() }
    }

    /// Name of the scoped metric, which is also the node's display name.
    #[must_use]
    pub fn metric_name(&self) -> Option<String> {
        match self {
            NodeKind::Root => None,
            NodeKind::Function { name } => Some(format!("Function/{name}")),
            NodeKind::Datastore {
                operation,
                target: Some(target),
            } => Some(format!("Database/{target}/{operation}")),
            NodeKind::Datastore {
                operation,
                target: None,
            } => Some(format!("Database/{operation}")),
            NodeKind::External {
                host,
                library,
                method,
            } => Some(format!("External/{host}/{library}/{method}")),
            NodeKind::Custom { name } => Some(name.clone()),
        }
    }

    /// Unscoped metric names recorded for this node, including the unscoped
    /// copy of the scoped metric.
    #[must_use]
    pub fn rollup_names(&self, background: bool) -> Vec<String> {
        let all_kind = if background { "allOther" } else { "allWeb" };
        let Some(metric_name) = self.metric_name() else {
            return Vec::new();
        };
        match self {
            NodeKind::Datastore { operation, target } => {
                let mut names = vec![
                    "Database/all".to_string(),
                    format!("Database/{all_kind}"),
                ];
                if target.is_some() {
                    names.push(format!("Database/{operation}"));
                }
                names.push(metric_name);
                names
            }
            NodeKind::External { host, .. } => vec![
                "External/all".to_string(),
                format!("External/{all_kind}"),
                format!("External/{host}/all"),
                metric_name,
            ],
            _ => vec![metric_name],
        }
    }

    #[must_use]
    pub fn category(&self) -> &'static str {
        match self {
            NodeKind::Datastore { .. } => "datastore",
            NodeKind::External { .. } => "http",
            _ => "generic",
        }
    }
}

#[derive(Clone, Debug)]
pub struct TraceNode {
    kind: NodeKind,
    start: Duration,
    end: Option<Duration>,
    exclusive: Duration,
    children: Vec<NodeId>,
}

impl TraceNode {
    fn open(kind: NodeKind, start: Duration) -> Self {
        Self {
            kind,
            start,
            end: None,
            exclusive: Duration::ZERO,
            children: Vec::new(),
        }
    }

    #[must_use]
    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    #[must_use]
    pub fn name(&self) -> String {
        self.kind.metric_name().unwrap_or_else(|| "ROOT".to_string())
    }

    #[must_use]
    pub fn start(&self) -> Duration {
        self.start
    }

    #[must_use]
    pub fn end(&self) -> Option<Duration> {
        self.end
    }

    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.end.is_some()
    }

    /// Zero while the node is still open.
    #[must_use]
    pub fn duration(&self) -> Duration {
        self.end
            .map_or(Duration::ZERO, |end| end.saturating_sub(self.start))
    }

    #[must_use]
    pub fn exclusive(&self) -> Duration {
        self.exclusive
    }

    #[must_use]
    pub fn children(&self) -> &[NodeId] {
        &self.children
    }
}

#[derive(Debug, Clone, Copy)]
struct Frame {
    token: NodeToken,
    node: Option<NodeId>,
    /// Why an untracked frame got no node; inherited by its descendants.
    truncated_by: Option<CapacityKind>,
}

/// Owned copy of a (sub)tree with times relative to the root start.
#[derive(Clone, Debug, PartialEq)]
pub struct Segment {
    pub name: String,
    pub start: Duration,
    pub duration: Duration,
    pub exclusive: Duration,
    pub children: Vec<Segment>,
}

#[derive(Debug, Clone)]
pub struct CallTree {
    nodes: Vec<TraceNode>,
    stack: Vec<Frame>,
    next_token: u64,
    max_nodes: usize,
    max_depth: usize,
    truncated: u64,
}

impl CallTree {
    /// Opens the root at `start`. `max_nodes` counts the root.
    #[must_use]
    pub fn new(start: Duration, max_nodes: usize, max_depth: usize) -> Self {
        Self {
            nodes: vec![TraceNode::open(NodeKind::Root, start)],
            stack: vec![Frame {
                token: NodeToken(0),
                node: Some(NodeId::ROOT),
                truncated_by: None,
            }],
            next_token: 1,
            max_nodes: max_nodes.max(1),
            max_depth: max_depth.max(1),
            truncated: 0,
        }
    }

    /// Pushes a new operation under the innermost open one. When a cap is
    /// hit the operation is tracked without a node and the cap is reported.
    pub fn start_node(
        &mut self,
        kind: NodeKind,
        now: Duration,
    ) -> (NodeToken, Option<CapacityExceeded>) {
        let token = NodeToken(self.next_token);
        self.next_token += 1;

        // The stack always holds at least the root until `finish`.
        let parent = self.stack.last().copied();
        let parent_node = parent.and_then(|frame| frame.node);

        let truncated_by = match parent {
            None => Some(CapacityKind::TraceNodes),
            Some(Frame {
                truncated_by: Some(kind),
                ..
            }) => Some(kind),
            Some(_) if self.stack.len() >= self.max_depth => Some(CapacityKind::TraceDepth),
            Some(_) if self.nodes.len() >= self.max_nodes => Some(CapacityKind::TraceNodes),
            Some(_) => None,
        };

        let (node, exceeded) = match (truncated_by, parent_node) {
            (None, Some(parent_id)) => {
                let id = NodeId(self.nodes.len());
                self.nodes.push(TraceNode::open(kind, now));
                self.nodes[parent_id.0].children.push(id);
                (Some(id), None)
            }
            (reason, _) => {
                let kind = reason.unwrap_or(CapacityKind::TraceNodes);
                self.truncated += 1;
                let limit = match kind {
                    CapacityKind::TraceDepth => self.max_depth,
                    _ => self.max_nodes,
                };
                (None, Some(CapacityExceeded { kind, limit }))
            }
        };

        if !self.stack.is_empty() {
            self.stack.push(Frame {
                token,
                node,
                truncated_by: exceeded.map(|e| e.kind),
            });
        }
        (token, exceeded)
    }

    /// Pops `token`. Closing anything but the innermost open operation
    /// force-closes every operation opened after it and reports
    /// [`TraceError::OutOfOrder`]; the tree stays consistent either way.
    pub fn end_node(&mut self, token: NodeToken, now: Duration) -> Result<(), TraceError> {
        let position = self
            .stack
            .iter()
            .skip(1)
            .rposition(|frame| frame.token == token)
            .map(|p| p + 1)
            .ok_or(TraceError::NotOpen(token.0))?;

        let force_closed = self.stack.len() - 1 - position;
        while self.stack.len() > position {
            if let Some(frame) = self.stack.pop() {
                if let Some(id) = frame.node {
                    self.seal(id, now);
                }
            }
        }

        if force_closed > 0 {
            Err(TraceError::OutOfOrder {
                closed: token.0,
                force_closed,
            })
        } else {
            Ok(())
        }
    }

    /// Seals every open node, root last. Returns how many non-root
    /// operations were still open.
    pub fn finish(&mut self, now: Duration) -> usize {
        let open = self.stack.len().saturating_sub(1);
        while let Some(frame) = self.stack.pop() {
            if let Some(id) = frame.node {
                self.seal(id, now);
            }
        }
        open
    }

    fn seal(&mut self, id: NodeId, now: Duration) {
        let start = self.nodes[id.0].start;
        let end = now.max(start);

        let mut intervals: Vec<(Duration, Duration)> = self.nodes[id.0]
            .children
            .iter()
            .filter_map(|child| {
                let child = &self.nodes[child.0];
                let child_end = child.end.unwrap_or(end);
                let s = child.start.clamp(start, end);
                let e = child_end.clamp(start, end);
                (e > s).then_some((s, e))
            })
            .collect();
        intervals.sort_unstable();

        let mut covered = Duration::ZERO;
        let mut current: Option<(Duration, Duration)> = None;
        for (s, e) in intervals {
            match current {
                Some((cs, ce)) if s <= ce => current = Some((cs, ce.max(e))),
                Some((cs, ce)) => {
                    covered += ce - cs;
                    current = Some((s, e));
                }
                None => current = Some((s, e)),
            }
        }
        if let Some((cs, ce)) = current {
            covered += ce - cs;
        }

        let node = &mut self.nodes[id.0];
        node.end = Some(end);
        node.exclusive = (end - start).saturating_sub(covered);
    }

    #[must_use]
    pub fn root(&self) -> &TraceNode {
        &self.nodes[0]
    }

    #[must_use]
    pub fn node(&self, id: NodeId) -> Option<&TraceNode> {
        self.nodes.get(id.0)
    }

    /// Tracked nodes, root included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Operations that got no node because of a cap.
    #[must_use]
    pub fn truncated(&self) -> u64 {
        self.truncated
    }

    /// Open operations, root included.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.stack.is_empty()
    }

    /// Depth-first walk yielding `(id, node, parent)`, children in start order.
    pub fn walk(&self) -> impl Iterator<Item = (NodeId, &TraceNode, Option<NodeId>)> + '_ {
        let mut pending = vec![(NodeId::ROOT, None)];
        std::iter::from_fn(move || {
            let (id, parent) = pending.pop()?;
            let node = &self.nodes[id.0];
            pending.extend(node.children.iter().rev().map(|child| (*child, Some(id))));
            Some((id, node, parent))
        })
    }

    /// Sum of the exclusive times of every tracked node.
    #[must_use]
    pub fn total_exclusive(&self) -> Duration {
        self.nodes.iter().map(|n| n.exclusive).sum()
    }

    #[must_use]
    pub fn to_segment(&self, root_name: &str) -> Segment {
        let origin = self.nodes[0].start;
        self.segment_of(NodeId::ROOT, origin, Some(root_name))
    }

    fn segment_of(&self, id: NodeId, origin: Duration, name: Option<&str>) -> Segment {
        let node = &self.nodes[id.0];
        Segment {
            name: name.map_or_else(|| node.name(), String::from),
            start: node.start.saturating_sub(origin),
            duration: node.duration(),
            exclusive: node.exclusive,
            children: node
                .children
                .iter()
                .map(|child| self.segment_of(*child, origin, None))
                .collect(),
        }
    }
}

/// The call tree of a sampled transaction, kept for the slowest-N collector.
#[derive(Clone, Debug, PartialEq)]
pub struct TransactionTrace {
    pub transaction_name: String,
    pub guid: String,
    pub trace_id: String,
    pub start_ms: u64,
    pub duration: Duration,
    pub root: Segment,
    pub attributes: Attributes,
}
