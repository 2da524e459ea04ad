// Copyright (c) The Diem Core Contributors
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

use std::collections::HashMap;

use crate::expr::{self, Expression, FieldId, VersionedVariable};
use crate::smt::SymbolId;

/// Capabilities a symbolic-heap implementation grants to the rest of
/// the engine. Reference/array/collection heap models, or a model with
/// no heap support at all, are equally valid as long as every mutation
/// appends exactly one undoable entry and `retract(n)` undoes the last
/// n entries in exact reverse order.
pub trait SymbolicHeap {
    /// Bind a fresh object identity to `result`, distinct from null and
    /// from every other allocation
    fn allocate(&mut self, result: VersionedVariable);

    /// Assert (in)equality between two versioned references
    fn assert_equality(&mut self, equal: bool, left: VersionedVariable, right: VersionedVariable);

    /// An expression equivalent to the queried (in)equality under the
    /// current heap constraints: a constant when the heap already
    /// decides it, a residual reference comparison otherwise
    fn equality_expr(
        &self,
        equal: bool,
        left: VersionedVariable,
        right: VersionedVariable,
    ) -> Expression;

    fn read_field(
        &mut self,
        result: VersionedVariable,
        reference: VersionedVariable,
        field: FieldId,
    );

    fn write_field(&mut self, reference: VersionedVariable, field: FieldId, value: Expression);

    /// Undo the last `count` operations
    fn retract(&mut self, count: usize);

    fn operation_count(&self) -> usize;

    /// Cheap local satisfiability check used to prune before invoking
    /// the full solver; `true` must be answered whenever in doubt
    fn can_be_satisfiable(&self) -> bool;

    fn clone_heap(&self, ctx: &mut dyn SymbolicHeapContext) -> Box<dyn SymbolicHeap>;
}

/// Hands a heap implementation the session-level services it may need
/// (today: minting solver symbols for auxiliary encodings), and lets
/// two heap clones stay comparable by sharing one context.
pub trait SymbolicHeapContext {
    fn fresh_symbol(&mut self, hint: &str) -> SymbolId;
}

pub trait SymbolicHeapFactory {
    fn create(&self, ctx: &mut dyn SymbolicHeapContext) -> Box<dyn SymbolicHeap>;
}

//
// no-heap reference implementation
//

/// The "no heap support" model: operations are counted so retraction
/// stays balanced, every query is answered as unconstrained.
#[derive(Clone, Debug, Default)]
pub struct NullHeap {
    operations: usize,
}

impl SymbolicHeap for NullHeap {
    fn allocate(&mut self, _result: VersionedVariable) {
        self.operations += 1;
    }

    fn assert_equality(&mut self, _equal: bool, _left: VersionedVariable, _right: VersionedVariable) {
        self.operations += 1;
    }

    fn equality_expr(
        &self,
        equal: bool,
        left: VersionedVariable,
        right: VersionedVariable,
    ) -> Expression {
        if left == right {
            expr::bool_const(equal)
        } else {
            Expression::RefEqVersioned { equal, left, right }
        }
    }

    fn read_field(
        &mut self,
        _result: VersionedVariable,
        _reference: VersionedVariable,
        _field: FieldId,
    ) {
        self.operations += 1;
    }

    fn write_field(&mut self, _reference: VersionedVariable, _field: FieldId, _value: Expression) {
        self.operations += 1;
    }

    fn retract(&mut self, count: usize) {
        assert!(
            count <= self.operations,
            "Heap retraction must not exceed the operations performed"
        );
        self.operations -= count;
    }

    fn operation_count(&self) -> usize {
        self.operations
    }

    fn can_be_satisfiable(&self) -> bool {
        true
    }

    fn clone_heap(&self, _ctx: &mut dyn SymbolicHeapContext) -> Box<dyn SymbolicHeap> {
        Box::new(self.clone())
    }
}

pub struct NullHeapFactory;

impl SymbolicHeapFactory for NullHeapFactory {
    fn create(&self, _ctx: &mut dyn SymbolicHeapContext) -> Box<dyn SymbolicHeap> {
        Box::new(NullHeap::default())
    }
}

//
// equality-tracking reference implementation
//

#[derive(Clone, Debug)]
enum HeapOp {
    Allocate(VersionedVariable),
    Equality {
        equal: bool,
        left: VersionedVariable,
        right: VersionedVariable,
    },
    ReadField {
        result: VersionedVariable,
        reference: VersionedVariable,
        field: FieldId,
    },
    WriteField {
        reference: VersionedVariable,
        field: FieldId,
        value: Expression,
    },
}

/// Models object identity: allocations are pairwise distinct and
/// non-null, reference (in)equalities are decided by a union-find over
/// the operation log. Field operations are logged for retraction
/// symmetry but left uninterpreted — a valid precision choice under the
/// heap contract.
#[derive(Clone, Debug, Default)]
pub struct EqualityHeap {
    ops: Vec<HeapOp>,
}

/// Union-find key: a versioned reference or an allocation token
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
enum RefKey {
    Var(VersionedVariable),
    Object(usize),
}

struct Partition {
    index: HashMap<RefKey, usize>,
    parent: Vec<usize>,
}

impl Partition {
    fn new() -> Self {
        Self {
            index: HashMap::new(),
            parent: vec![],
        }
    }

    fn slot(&mut self, key: RefKey) -> usize {
        let next = self.parent.len();
        match self.index.get(&key) {
            Some(slot) => *slot,
            None => {
                self.index.insert(key, next);
                self.parent.push(next);
                next
            }
        }
    }

    fn find(&mut self, slot: usize) -> usize {
        let mut root = slot;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        // path compression
        let mut cursor = slot;
        while self.parent[cursor] != root {
            let next = self.parent[cursor];
            self.parent[cursor] = root;
            cursor = next;
        }
        root
    }

    fn union(&mut self, left: RefKey, right: RefKey) {
        let l = self.slot(left);
        let r = self.slot(right);
        let l_root = self.find(l);
        let r_root = self.find(r);
        if l_root != r_root {
            self.parent[l_root] = r_root;
        }
    }

    fn same(&mut self, left: RefKey, right: RefKey) -> bool {
        let l = self.slot(left);
        let r = self.slot(right);
        self.find(l) == self.find(r)
    }
}

impl EqualityHeap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the equality partition from the operation log, returning
    /// the partition, the asserted inequalities, and the allocation
    /// keys
    fn partition(&self) -> (Partition, Vec<(RefKey, RefKey)>, Vec<RefKey>) {
        let mut partition = Partition::new();
        let mut inequalities = vec![];
        let mut allocations = vec![];
        for (index, op) in self.ops.iter().enumerate() {
            match op {
                HeapOp::Allocate(result) => {
                    let token = RefKey::Object(index);
                    partition.union(RefKey::Var(*result), token);
                    allocations.push(token);
                }
                HeapOp::Equality { equal, left, right } => {
                    if *equal {
                        partition.union(RefKey::Var(*left), RefKey::Var(*right));
                    } else {
                        inequalities.push((RefKey::Var(*left), RefKey::Var(*right)));
                    }
                }
                HeapOp::ReadField { .. } | HeapOp::WriteField { .. } => (),
            }
        }
        (partition, inequalities, allocations)
    }
}

impl SymbolicHeap for EqualityHeap {
    fn allocate(&mut self, result: VersionedVariable) {
        self.ops.push(HeapOp::Allocate(result));
    }

    fn assert_equality(&mut self, equal: bool, left: VersionedVariable, right: VersionedVariable) {
        self.ops.push(HeapOp::Equality { equal, left, right });
    }

    fn equality_expr(
        &self,
        equal: bool,
        left: VersionedVariable,
        right: VersionedVariable,
    ) -> Expression {
        let (mut partition, inequalities, allocations) = self.partition();
        let l = RefKey::Var(left);
        let r = RefKey::Var(right);
        if partition.same(l, r) {
            return expr::bool_const(equal);
        }
        // distinct classes; see whether the log forces them apart
        let mut decided_apart = inequalities
            .iter()
            .any(|(a, b)| {
                (partition.same(*a, l) && partition.same(*b, r))
                    || (partition.same(*a, r) && partition.same(*b, l))
            });
        if !decided_apart {
            let l_alloc = allocations.iter().any(|token| partition.same(*token, l));
            let r_alloc = allocations.iter().any(|token| partition.same(*token, r));
            let l_null = partition.same(l, RefKey::Var(VersionedVariable::NULL));
            let r_null = partition.same(r, RefKey::Var(VersionedVariable::NULL));
            decided_apart = (l_alloc && r_alloc) || (l_alloc && r_null) || (r_alloc && l_null);
        }
        if decided_apart {
            expr::bool_const(!equal)
        } else {
            Expression::RefEqVersioned { equal, left, right }
        }
    }

    fn read_field(
        &mut self,
        result: VersionedVariable,
        reference: VersionedVariable,
        field: FieldId,
    ) {
        self.ops.push(HeapOp::ReadField {
            result,
            reference,
            field,
        });
    }

    fn write_field(&mut self, reference: VersionedVariable, field: FieldId, value: Expression) {
        self.ops.push(HeapOp::WriteField {
            reference,
            field,
            value,
        });
    }

    fn retract(&mut self, count: usize) {
        assert!(
            count <= self.ops.len(),
            "Heap retraction must not exceed the operations performed"
        );
        self.ops.truncate(self.ops.len() - count);
    }

    fn operation_count(&self) -> usize {
        self.ops.len()
    }

    fn can_be_satisfiable(&self) -> bool {
        let (mut partition, inequalities, allocations) = self.partition();
        for (left, right) in &inequalities {
            if partition.same(*left, *right) {
                return false;
            }
        }
        for (i, left) in allocations.iter().enumerate() {
            if partition.same(*left, RefKey::Var(VersionedVariable::NULL)) {
                return false;
            }
            for right in allocations.iter().skip(i + 1) {
                if partition.same(*left, *right) {
                    return false;
                }
            }
        }
        true
    }

    fn clone_heap(&self, _ctx: &mut dyn SymbolicHeapContext) -> Box<dyn SymbolicHeap> {
        Box::new(self.clone())
    }
}

pub struct EqualityHeapFactory;

impl SymbolicHeapFactory for EqualityHeapFactory {
    fn create(&self, _ctx: &mut dyn SymbolicHeapContext) -> Box<dyn SymbolicHeap> {
        Box::new(EqualityHeap::new())
    }
}
