// Copyright (c) The Diem Core Contributors
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

use crate::flow_graph::{FlowEdge, NodeRef};

/// A position in the exploration tree, addressed by index into the
/// arena. Many exploration states may share the same node as an
/// ancestor; nodes are never mutated after creation except for the
/// sanctioned predecessor append performed by a merge.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct PathId(u32);

impl PathId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// One node of the path tree. `preceding` and `leading_edges` are
/// parallel: entry i says the node was reached from `preceding[i]` over
/// `leading_edges[i]`. Both are singletons unless branches were merged
/// here.
#[derive(Clone, Debug)]
pub struct PathNode {
    depth: u32,
    node: NodeRef,
    preceding: Vec<PathId>,
    leading_edges: Vec<FlowEdge>,
}

impl PathNode {
    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn node(&self) -> NodeRef {
        self.node
    }

    pub fn preceding(&self) -> &[PathId] {
        &self.preceding
    }

    pub fn leading_edges(&self) -> &[FlowEdge] {
        &self.leading_edges
    }

    pub fn is_root(&self) -> bool {
        self.preceding.is_empty()
    }
}

/// Arena of path nodes. Reclamation is arena-at-once: abandoned
/// branches stay allocated until the whole exploration is dropped,
/// which keeps `PathId` plain and the sharing explicit.
pub struct PathArena {
    nodes: Vec<PathNode>,
}

impl PathArena {
    pub fn new() -> Self {
        Self { nodes: vec![] }
    }

    /// Create a root node at depth 0
    pub fn root(&mut self, node: NodeRef) -> PathId {
        self.push(PathNode {
            depth: 0,
            node,
            preceding: vec![],
            leading_edges: vec![],
        })
    }

    /// Create a child of `from` at depth + 1, positioned at `to` and
    /// led into by `edge`
    pub fn extend(&mut self, from: PathId, edge: FlowEdge, to: NodeRef) -> PathId {
        let depth = self.node(from).depth + 1;
        self.push(PathNode {
            depth,
            node: to,
            preceding: vec![from],
            leading_edges: vec![edge],
        })
    }

    /// Record a merge: `target` gains `extra_pred` as an additional
    /// predecessor, led in over `extra_edge`. The target keeps its
    /// depth and flow-graph position.
    pub fn merge_into(&mut self, target: PathId, extra_pred: PathId, extra_edge: FlowEdge) {
        assert!(
            !self.node(target).is_root(),
            "Cannot merge into the root path"
        );
        let node = &mut self.nodes[target.index()];
        node.preceding.push(extra_pred);
        node.leading_edges.push(extra_edge);
    }

    pub fn node(&self, id: PathId) -> &PathNode {
        self.nodes.get(id.index()).expect("Unknown path node")
    }

    pub fn depth(&self, id: PathId) -> u32 {
        self.node(id).depth
    }

    pub fn flow_node(&self, id: PathId) -> NodeRef {
        self.node(id).node
    }

    pub fn is_root(&self, id: PathId) -> bool {
        self.node(id).is_root()
    }

    /// The predecessor navigation walks along; merged alternatives are
    /// retained for reporting only
    pub fn primary_preceding(&self, id: PathId) -> PathId {
        *self
            .node(id)
            .preceding
            .first()
            .expect("Cannot retract past the root path")
    }

    pub fn primary_edge(&self, id: PathId) -> FlowEdge {
        *self
            .node(id)
            .leading_edges
            .first()
            .expect("The root path has no leading edge")
    }

    /// Walk the primary predecessor chain up to the root
    pub fn root_of(&self, id: PathId) -> PathId {
        let mut current = id;
        while !self.is_root(current) {
            current = self.primary_preceding(current);
        }
        current
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PathNode> {
        self.nodes.iter()
    }

    fn push(&mut self, node: PathNode) -> PathId {
        let id = PathId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }
}

impl Default for PathArena {
    fn default() -> Self {
        Self::new()
    }
}
