// Copyright (c) The Diem Core Contributors
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

use log::debug;
use std::collections::{HashMap, HashSet};

use crate::expr::{Expression, Sort, VariableId, VersionedVariable};

/// A solver-level symbol, minted once per (variable, version) pair and
/// numbered monotonically across the whole exploration run
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct SymbolId(u32);

impl SymbolId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Maps (variable, version) pairs to solver symbols, minting on first
/// use. Shared by every solver session of one exploration so a given
/// versioned variable denotes the same symbol in all of them.
pub struct SymbolTable {
    names: Vec<String>,
    by_version: HashMap<(VariableId, u32), SymbolId>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self {
            names: vec![],
            by_version: HashMap::new(),
        }
    }

    /// Symbol for a versioned variable, minted on first use
    pub fn symbol_for(&mut self, name_hint: &str, var: VariableId, version: u32) -> SymbolId {
        if let Some(sym) = self.by_version.get(&(var, version)) {
            return *sym;
        }
        let sym = self.mint(format!("{}!{}", name_hint, version));
        self.by_version.insert((var, version), sym);
        sym
    }

    /// Fresh auxiliary symbol with no versioned-variable identity
    pub fn mint_named(&mut self, hint: &str) -> SymbolId {
        self.mint(hint.to_string())
    }

    pub fn name(&self, sym: SymbolId) -> &str {
        &self.names[sym.index()]
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    fn mint(&mut self, hint: String) -> SymbolId {
        let sym = SymbolId(self.names.len() as u32);
        self.names.push(format!("{}!{}", hint, sym.0));
        sym
    }
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of one satisfiability check
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SolveOutcome {
    Sat,
    Unsat,
    Unknown,
}

/// A concrete interpretation of a symbol in a satisfying model
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Ref(u64),
}

pub trait SolverModel {
    /// `None` means the symbol is unconstrained in the model
    fn interpret(&self, sym: SymbolId) -> Option<Value>;
}

/// Resolves versioned variables to solver symbols at assertion time
pub trait SymbolResolver {
    fn resolve(&mut self, versioned: VersionedVariable) -> (SymbolId, Sort);
}

/// The incremental-solver capability the engine requires. Assertions
/// are version-resolved expressions; `Versioned` and `RefEqVersioned`
/// are the only variable atoms a solver ever sees.
pub trait IncrementalSolver {
    fn push(&mut self);

    /// Close `count` scopes in one operation
    fn pop(&mut self, count: usize);

    fn assert(&mut self, resolver: &mut dyn SymbolResolver, expr: &Expression);

    fn check(&mut self) -> SolveOutcome;

    /// Satisfying model of the last `check`, when it returned Sat
    fn model(&self) -> Option<Box<dyn SolverModel>>;

    /// Indices into the live assertion sequence (assertion order)
    /// forming an unsatisfiable core, when the last `check` returned
    /// Unsat
    fn unsat_core(&self) -> Option<Vec<usize>>;
}

pub trait SolverFactory {
    fn create_solver(&self) -> Box<dyn IncrementalSolver>;
}

//
// bounded-search reference solver
//

/// Tuning knobs of `BoundedSearchSolver`
#[derive(Clone, Copy, Debug)]
pub struct SearchConfig {
    /// How far around each integer literal the candidate domain reaches
    pub radius: i64,
    /// Assignment-count cap; exceeding it yields Unknown
    pub max_assignments: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            radius: 2,
            max_assignments: 500_000,
        }
    }
}

#[derive(Clone, Debug)]
struct SolvedAssertion {
    expr: Expression,
    atoms: HashMap<VersionedVariable, (SymbolId, Sort)>,
}

enum SearchOutcome {
    Model(HashMap<SymbolId, Value>),
    Exhausted,
    Capped,
}

/// Reference implementation of `IncrementalSolver`: decides
/// satisfiability by exhaustive assignment over a literal-derived
/// candidate domain. Meant for tests and small models — an Unsat
/// answer is relative to the searched domain, and real deployments
/// plug an external SMT binding behind the same trait.
pub struct BoundedSearchSolver {
    config: SearchConfig,
    assertions: Vec<SolvedAssertion>,
    scopes: Vec<usize>,
    last_model: Option<HashMap<SymbolId, Value>>,
    last_core: Option<Vec<usize>>,
}

impl BoundedSearchSolver {
    pub fn new(config: SearchConfig) -> Self {
        Self {
            config,
            assertions: vec![],
            scopes: vec![],
            last_model: None,
            last_core: None,
        }
    }

    fn search(assertions: &[&SolvedAssertion], config: &SearchConfig) -> SearchOutcome {
        // collect the free symbols, ordered for determinism
        let mut symbols: Vec<(SymbolId, Sort)> = vec![];
        let mut seen: HashSet<SymbolId> = HashSet::new();
        for assertion in assertions {
            for (vv, (sym, sort)) in assertion.atoms.iter() {
                if !vv.is_null() && seen.insert(*sym) {
                    symbols.push((*sym, *sort));
                }
            }
        }
        symbols.sort_by_key(|(sym, _)| *sym);

        // candidate domains
        let mut int_candidates: Vec<i64> = vec![-1, 0, 1];
        for assertion in assertions {
            collect_int_literals(&assertion.expr, &mut int_candidates);
        }
        let literals = int_candidates.clone();
        for lit in literals {
            for delta in 1..=config.radius {
                int_candidates.push(lit.saturating_add(delta));
                int_candidates.push(lit.saturating_sub(delta));
            }
        }
        int_candidates.sort_unstable();
        int_candidates.dedup();

        let ref_count = symbols
            .iter()
            .filter(|(_, sort)| *sort == Sort::Reference)
            .count() as u64;

        // depth-first enumeration over the assignment space
        let mut env: HashMap<SymbolId, Value> = HashMap::new();
        let mut visited: u64 = 0;
        let capped = Self::enumerate(
            &symbols,
            0,
            &int_candidates,
            ref_count,
            assertions,
            &mut env,
            &mut visited,
            config.max_assignments,
        );
        match capped {
            Some(model) => SearchOutcome::Model(model),
            None if visited >= config.max_assignments => SearchOutcome::Capped,
            None => SearchOutcome::Exhausted,
        }
    }

    fn enumerate(
        symbols: &[(SymbolId, Sort)],
        index: usize,
        int_candidates: &[i64],
        ref_count: u64,
        assertions: &[&SolvedAssertion],
        env: &mut HashMap<SymbolId, Value>,
        visited: &mut u64,
        cap: u64,
    ) -> Option<HashMap<SymbolId, Value>> {
        if *visited >= cap {
            return None;
        }
        if index == symbols.len() {
            *visited += 1;
            let satisfied = assertions.iter().all(|assertion| {
                matches!(
                    eval(&assertion.expr, &assertion.atoms, env),
                    Some(Value::Bool(true))
                )
            });
            return if satisfied { Some(env.clone()) } else { None };
        }
        let (sym, sort) = symbols[index];
        let candidates: Vec<Value> = match sort {
            Sort::Bool => vec![Value::Bool(false), Value::Bool(true)],
            Sort::Int => int_candidates.iter().map(|v| Value::Int(*v)).collect(),
            // 0 is the null object; one id per reference symbol allows
            // both the all-distinct and the all-aliased assignments
            Sort::Reference => (0..=ref_count).map(Value::Ref).collect(),
        };
        for value in candidates {
            env.insert(sym, value);
            if let Some(model) = Self::enumerate(
                symbols,
                index + 1,
                int_candidates,
                ref_count,
                assertions,
                env,
                visited,
                cap,
            ) {
                return Some(model);
            }
            if *visited >= cap {
                break;
            }
        }
        env.remove(&sym);
        None
    }

    /// Greedy deletion-minimization of the unsatisfiable assertion set
    fn minimize_core(&self) -> Vec<usize> {
        let mut active: Vec<usize> = (0..self.assertions.len()).collect();
        for candidate in 0..self.assertions.len() {
            let trial: Vec<&SolvedAssertion> = active
                .iter()
                .filter(|index| **index != candidate)
                .map(|index| &self.assertions[*index])
                .collect();
            if let SearchOutcome::Exhausted = Self::search(&trial, &self.config) {
                active.retain(|index| *index != candidate);
            }
        }
        active
    }
}

impl IncrementalSolver for BoundedSearchSolver {
    fn push(&mut self) {
        self.scopes.push(self.assertions.len());
    }

    fn pop(&mut self, count: usize) {
        assert!(
            count <= self.scopes.len(),
            "Solver scope pops must not exceed the pushes"
        );
        let mut mark = self.assertions.len();
        for _ in 0..count {
            mark = self.scopes.pop().unwrap();
        }
        self.assertions.truncate(mark);
    }

    fn assert(&mut self, resolver: &mut dyn SymbolResolver, expr: &Expression) {
        let mut atoms = HashMap::new();
        collect_versioned_atoms(expr, &mut |vv| {
            let entry = resolver.resolve(vv);
            atoms.insert(vv, entry);
        });
        self.assertions.push(SolvedAssertion {
            expr: expr.clone(),
            atoms,
        });
    }

    fn check(&mut self) -> SolveOutcome {
        let live: Vec<&SolvedAssertion> = self.assertions.iter().collect();
        let outcome = match Self::search(&live, &self.config) {
            SearchOutcome::Model(model) => {
                self.last_model = Some(model);
                self.last_core = None;
                SolveOutcome::Sat
            }
            SearchOutcome::Exhausted => {
                self.last_model = None;
                self.last_core = Some(self.minimize_core());
                SolveOutcome::Unsat
            }
            SearchOutcome::Capped => {
                self.last_model = None;
                self.last_core = None;
                SolveOutcome::Unknown
            }
        };
        debug!(
            "Bounded search over {} assertion(s): {:?}",
            self.assertions.len(),
            outcome
        );
        outcome
    }

    fn model(&self) -> Option<Box<dyn SolverModel>> {
        self.last_model.as_ref().map(|model| {
            Box::new(MapModel {
                env: model.clone(),
            }) as Box<dyn SolverModel>
        })
    }

    fn unsat_core(&self) -> Option<Vec<usize>> {
        self.last_core.clone()
    }
}

struct MapModel {
    env: HashMap<SymbolId, Value>,
}

impl SolverModel for MapModel {
    fn interpret(&self, sym: SymbolId) -> Option<Value> {
        self.env.get(&sym).copied()
    }
}

/// Factory producing `BoundedSearchSolver` sessions with one shared
/// configuration
pub struct BoundedSearchFactory {
    config: SearchConfig,
}

impl BoundedSearchFactory {
    pub fn new(config: SearchConfig) -> Self {
        Self { config }
    }
}

impl Default for BoundedSearchFactory {
    fn default() -> Self {
        Self::new(SearchConfig::default())
    }
}

impl SolverFactory for BoundedSearchFactory {
    fn create_solver(&self) -> Box<dyn IncrementalSolver> {
        Box::new(BoundedSearchSolver::new(self.config))
    }
}

//
// evaluation over version-resolved expressions
//

fn collect_versioned_atoms(expr: &Expression, visit: &mut dyn FnMut(VersionedVariable)) {
    match expr {
        Expression::Bool(_) | Expression::Int(_) => (),
        Expression::Var(_) | Expression::RefEq { .. } => {
            panic!("An unversioned variable reached the solver")
        }
        Expression::Versioned(vv) => visit(*vv),
        Expression::RefEqVersioned { left, right, .. } => {
            visit(*left);
            visit(*right);
        }
        Expression::Not(e) | Expression::Neg(e) => collect_versioned_atoms(e, visit),
        Expression::And(es) | Expression::Or(es) | Expression::Add(es) | Expression::Mul(es) => {
            for e in es {
                collect_versioned_atoms(e, visit);
            }
        }
        Expression::Implies(l, r)
        | Expression::Sub(l, r)
        | Expression::Eq(l, r)
        | Expression::Lt(l, r)
        | Expression::Le(l, r)
        | Expression::Gt(l, r)
        | Expression::Ge(l, r) => {
            collect_versioned_atoms(l, visit);
            collect_versioned_atoms(r, visit);
        }
    }
}

fn collect_int_literals(expr: &Expression, out: &mut Vec<i64>) {
    match expr {
        Expression::Int(v) => out.push(*v),
        Expression::Bool(_)
        | Expression::Var(_)
        | Expression::Versioned(_)
        | Expression::RefEq { .. }
        | Expression::RefEqVersioned { .. } => (),
        Expression::Not(e) | Expression::Neg(e) => collect_int_literals(e, out),
        Expression::And(es) | Expression::Or(es) | Expression::Add(es) | Expression::Mul(es) => {
            for e in es {
                collect_int_literals(e, out);
            }
        }
        Expression::Implies(l, r)
        | Expression::Sub(l, r)
        | Expression::Eq(l, r)
        | Expression::Lt(l, r)
        | Expression::Le(l, r)
        | Expression::Gt(l, r)
        | Expression::Ge(l, r) => {
            collect_int_literals(l, out);
            collect_int_literals(r, out);
        }
    }
}

fn ref_value(
    vv: VersionedVariable,
    atoms: &HashMap<VersionedVariable, (SymbolId, Sort)>,
    env: &HashMap<SymbolId, Value>,
) -> Option<u64> {
    if vv.is_null() {
        return Some(0);
    }
    let (sym, _) = atoms.get(&vv)?;
    match env.get(sym)? {
        Value::Ref(id) => Some(*id),
        _ => None,
    }
}

fn eval(
    expr: &Expression,
    atoms: &HashMap<VersionedVariable, (SymbolId, Sort)>,
    env: &HashMap<SymbolId, Value>,
) -> Option<Value> {
    match expr {
        Expression::Bool(v) => Some(Value::Bool(*v)),
        Expression::Int(v) => Some(Value::Int(*v)),
        Expression::Var(_) | Expression::RefEq { .. } => {
            panic!("An unversioned variable reached the solver")
        }
        Expression::Versioned(vv) => {
            if vv.is_null() {
                return Some(Value::Ref(0));
            }
            let (sym, _) = atoms.get(vv)?;
            env.get(sym).copied()
        }
        Expression::Not(e) => match eval(e, atoms, env)? {
            Value::Bool(v) => Some(Value::Bool(!v)),
            _ => None,
        },
        Expression::And(es) => {
            let mut result = true;
            for e in es {
                match eval(e, atoms, env)? {
                    Value::Bool(v) => result = result && v,
                    _ => return None,
                }
            }
            Some(Value::Bool(result))
        }
        Expression::Or(es) => {
            let mut result = false;
            for e in es {
                match eval(e, atoms, env)? {
                    Value::Bool(v) => result = result || v,
                    _ => return None,
                }
            }
            Some(Value::Bool(result))
        }
        Expression::Implies(l, r) => match (eval(l, atoms, env)?, eval(r, atoms, env)?) {
            (Value::Bool(a), Value::Bool(b)) => Some(Value::Bool(!a || b)),
            _ => None,
        },
        Expression::Add(es) => {
            let mut sum: i64 = 0;
            for e in es {
                match eval(e, atoms, env)? {
                    Value::Int(v) => sum = sum.checked_add(v)?,
                    _ => return None,
                }
            }
            Some(Value::Int(sum))
        }
        Expression::Sub(l, r) => match (eval(l, atoms, env)?, eval(r, atoms, env)?) {
            (Value::Int(a), Value::Int(b)) => Some(Value::Int(a.checked_sub(b)?)),
            _ => None,
        },
        Expression::Mul(es) => {
            let mut product: i64 = 1;
            for e in es {
                match eval(e, atoms, env)? {
                    Value::Int(v) => product = product.checked_mul(v)?,
                    _ => return None,
                }
            }
            Some(Value::Int(product))
        }
        Expression::Neg(e) => match eval(e, atoms, env)? {
            Value::Int(v) => Some(Value::Int(v.checked_neg()?)),
            _ => None,
        },
        Expression::Eq(l, r) => {
            let left = eval(l, atoms, env)?;
            let right = eval(r, atoms, env)?;
            match (left, right) {
                (Value::Bool(a), Value::Bool(b)) => Some(Value::Bool(a == b)),
                (Value::Int(a), Value::Int(b)) => Some(Value::Bool(a == b)),
                (Value::Ref(a), Value::Ref(b)) => Some(Value::Bool(a == b)),
                _ => None,
            }
        }
        Expression::Lt(l, r) => compare_ints(l, r, atoms, env, |a, b| a < b),
        Expression::Le(l, r) => compare_ints(l, r, atoms, env, |a, b| a <= b),
        Expression::Gt(l, r) => compare_ints(l, r, atoms, env, |a, b| a > b),
        Expression::Ge(l, r) => compare_ints(l, r, atoms, env, |a, b| a >= b),
        Expression::RefEqVersioned { equal, left, right } => {
            let l = ref_value(*left, atoms, env)?;
            let r = ref_value(*right, atoms, env)?;
            Some(Value::Bool((l == r) == *equal))
        }
    }
}

fn compare_ints(
    left: &Expression,
    right: &Expression,
    atoms: &HashMap<VersionedVariable, (SymbolId, Sort)>,
    env: &HashMap<SymbolId, Value>,
    cmp: fn(i64, i64) -> bool,
) -> Option<Value> {
    match (eval(left, atoms, env)?, eval(right, atoms, env)?) {
        (Value::Int(a), Value::Int(b)) => Some(Value::Bool(cmp(a, b))),
        _ => None,
    }
}
