// Copyright (c) The Diem Core Contributors
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

use crate::expr::{Expression, VariableId};
use crate::flow_graph::NodeRef;
use crate::smt::Value;

/// Classification of one solved exploration state
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Verdict {
    Reachable,
    Unreachable,
    Unknown,
}

/// A concrete interpretation of one versioned variable in a witnessing
/// model; `None` marks a value the model leaves unconstrained (e.g. the
/// result of an unmodelled call)
#[derive(Clone, Debug)]
pub struct VariableValuation {
    pub variable: VariableId,
    pub version: u32,
    pub value: Option<Value>,
}

/// A concrete counter-trace witnessing reachability: the node sequence
/// from the program entry to the verified location, and per node the
/// interpretations of the variables assigned there
#[derive(Clone, Debug, Default)]
pub struct ExecutionModel {
    pub nodes: Vec<NodeRef>,
    pub valuations: Vec<Vec<VariableValuation>>,
}

/// The minimal conflicting constraint set witnessing unreachability,
/// in version-resolved form. `heap_conflict` marks verdicts decided by
/// the symbolic heap's local check without consulting the solver.
#[derive(Clone, Debug, Default)]
pub struct PathCounterExample {
    pub conflicting: Vec<Expression>,
    pub heap_conflict: bool,
}

/// Payload reported once per terminated exploration state
#[derive(Clone, Debug)]
pub enum ExplorationResult {
    Reachable(ExecutionModel),
    Unreachable(PathCounterExample),
    Unknown,
}

impl ExplorationResult {
    pub fn verdict(&self) -> Verdict {
        match self {
            ExplorationResult::Reachable(_) => Verdict::Reachable,
            ExplorationResult::Unreachable(_) => Verdict::Unreachable,
            ExplorationResult::Unknown => Verdict::Unknown,
        }
    }
}
