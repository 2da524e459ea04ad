// Copyright (c) The Diem Core Contributors
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

use anyhow::Result;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use crate::flow_graph::{FlowNode, GraphId, NodeRef, OuterEdge, OuterEdgeKind, Program};

/// Lazy interprocedural edge lookups across the whole-program graph
/// collection. Implementations may load graphs on demand; the engine
/// awaits these calls at its only suspension point.
#[async_trait(?Send)]
pub trait FlowGraphProvider {
    /// MethodCall edges leading into `enter` from its call sites
    async fn call_edges_to(&self, enter: NodeRef) -> Result<Vec<OuterEdge>>;

    /// Return edges leading into `call` from its callee's Return nodes
    async fn return_edges_to(&self, call: NodeRef) -> Result<Vec<OuterEdge>>;
}

/// Marks the locations whose reachability is the object of the search
pub trait EntryPointRecognizer {
    fn is_final_node(&self, node: NodeRef) -> bool;
}

/// Recognizer over an explicit node set
pub struct NodeSetRecognizer {
    nodes: HashSet<NodeRef>,
}

impl NodeSetRecognizer {
    pub fn new(nodes: impl IntoIterator<Item = NodeRef>) -> Self {
        Self {
            nodes: nodes.into_iter().collect(),
        }
    }
}

impl EntryPointRecognizer for NodeSetRecognizer {
    fn is_final_node(&self, node: NodeRef) -> bool {
        self.nodes.contains(&node)
    }
}

/// Reference provider over a frozen program: call sites are indexed
/// once per callee graph, return edges are computed from the callee's
/// Return nodes on demand.
pub struct ProgramFlowProvider {
    program: Rc<Program>,
    /// callee graph -> the Call nodes targeting it
    call_sites: HashMap<GraphId, Vec<NodeRef>>,
}

impl ProgramFlowProvider {
    pub fn new(program: Rc<Program>) -> Self {
        let mut call_sites: HashMap<GraphId, Vec<NodeRef>> = HashMap::new();
        for graph in program.graphs() {
            for node in graph.node_refs() {
                if let FlowNode::Call(site) = program.node(node) {
                    if let Some(callee) = site.callee {
                        call_sites.entry(callee).or_insert_with(Vec::new).push(node);
                    }
                }
            }
        }
        Self {
            program,
            call_sites,
        }
    }
}

#[async_trait(?Send)]
impl FlowGraphProvider for ProgramFlowProvider {
    async fn call_edges_to(&self, enter: NodeRef) -> Result<Vec<OuterEdge>> {
        let callers = self
            .call_sites
            .get(&enter.graph)
            .map(|nodes| nodes.as_slice())
            .unwrap_or(&[]);
        Ok(callers
            .iter()
            .map(|call| OuterEdge {
                kind: OuterEdgeKind::MethodCall,
                from: *call,
                to: enter,
            })
            .collect())
    }

    async fn return_edges_to(&self, call: NodeRef) -> Result<Vec<OuterEdge>> {
        let site = match self.program.node(call) {
            FlowNode::Call(site) => site,
            _ => panic!("Return edges are only defined for Call nodes"),
        };
        let callee = match site.callee {
            Some(callee) => callee,
            // an unmodelled callee contributes no return edges
            None => return Ok(vec![]),
        };
        let graph = self.program.graph(callee);
        Ok(graph
            .node_refs()
            .filter(|node| matches!(self.program.node(*node), FlowNode::Return { .. }))
            .map(|ret| OuterEdge {
                kind: OuterEdgeKind::Return,
                from: ret,
                to: call,
            })
            .collect())
    }
}
