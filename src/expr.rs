// Copyright (c) The Diem Core Contributors
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

use anyhow::{bail, Result};
use std::fmt;

/// Value sort of a flow variable or expression
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Sort {
    Bool,
    Int,
    Reference,
}

/// An identity-stable handle of a flow variable. The variable metadata
/// (name, sort, owning graph) lives in the program registry.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct VariableId(pub(crate) u32);

impl VariableId {
    /// The distinguished null reference, pre-registered by every program
    /// builder at index 0. Its version is pinned to 0 along every path.
    pub const NULL: VariableId = VariableId(0);

    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn is_null(self) -> bool {
        self == VariableId::NULL
    }
}

/// An identity-stable handle of a heap field definition
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct FieldId(pub(crate) u32);

impl FieldId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// One immutable symbolic value of a variable at a point in a path
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct VersionedVariable {
    pub variable: VariableId,
    pub version: u32,
}

impl VersionedVariable {
    pub const NULL: VersionedVariable = VersionedVariable {
        variable: VariableId::NULL,
        version: 0,
    };

    pub fn new(variable: VariableId, version: u32) -> Self {
        Self { variable, version }
    }

    pub fn is_null(self) -> bool {
        self.variable.is_null()
    }
}

impl fmt::Display for VersionedVariable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}#{}", self.variable.0, self.version)
    }
}

/// Read access to variable metadata, implemented by the program registry
pub trait VariableLookup {
    fn variable_sort(&self, var: VariableId) -> Sort;

    fn variable_name(&self, var: VariableId) -> &str;

    fn is_reference(&self, var: VariableId) -> bool {
        self.variable_sort(var) == Sort::Reference
    }
}

/// Read access to the current variable versions along a path
pub trait VersionLookup {
    fn version_of(&self, var: VariableId) -> u32;
}

/// The expression tree of the flow-graph IR. Guards, assignment values,
/// call arguments, and return values are all drawn from this language.
///
/// `Versioned` and `RefEqVersioned` atoms never appear in a frozen
/// program; they are produced by version resolution on the way to the
/// solver.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum Expression {
    Bool(bool),
    Int(i64),
    Var(VariableId),
    Versioned(VersionedVariable),
    Not(Box<Expression>),
    And(Vec<Expression>),
    Or(Vec<Expression>),
    Implies(Box<Expression>, Box<Expression>),
    Add(Vec<Expression>),
    Sub(Box<Expression>, Box<Expression>),
    Mul(Vec<Expression>),
    Neg(Box<Expression>),
    Eq(Box<Expression>, Box<Expression>),
    Lt(Box<Expression>, Box<Expression>),
    Le(Box<Expression>, Box<Expression>),
    Gt(Box<Expression>, Box<Expression>),
    Ge(Box<Expression>, Box<Expression>),
    /// Reference (in)equality between two reference variables. Routed to
    /// the symbolic heap, never asserted to the plain solver directly.
    RefEq {
        equal: bool,
        left: VariableId,
        right: VariableId,
    },
    /// Version-resolved form of `RefEq`
    RefEqVersioned {
        equal: bool,
        left: VersionedVariable,
        right: VersionedVariable,
    },
}

// expression constructors, mirroring the usual SMT-LIB operator set

pub fn bool_const(val: bool) -> Expression {
    Expression::Bool(val)
}

pub fn int_const(val: i64) -> Expression {
    Expression::Int(val)
}

pub fn var(id: VariableId) -> Expression {
    Expression::Var(id)
}

pub fn not(operand: Expression) -> Expression {
    Expression::Not(Box::new(operand))
}

pub fn and(operands: Vec<Expression>) -> Expression {
    Expression::And(operands)
}

pub fn or(operands: Vec<Expression>) -> Expression {
    Expression::Or(operands)
}

pub fn implies(left: Expression, right: Expression) -> Expression {
    Expression::Implies(Box::new(left), Box::new(right))
}

pub fn add(operands: Vec<Expression>) -> Expression {
    Expression::Add(operands)
}

pub fn sub(left: Expression, right: Expression) -> Expression {
    Expression::Sub(Box::new(left), Box::new(right))
}

pub fn mul(operands: Vec<Expression>) -> Expression {
    Expression::Mul(operands)
}

pub fn neg(operand: Expression) -> Expression {
    Expression::Neg(Box::new(operand))
}

pub fn eq(left: Expression, right: Expression) -> Expression {
    Expression::Eq(Box::new(left), Box::new(right))
}

pub fn lt(left: Expression, right: Expression) -> Expression {
    Expression::Lt(Box::new(left), Box::new(right))
}

pub fn le(left: Expression, right: Expression) -> Expression {
    Expression::Le(Box::new(left), Box::new(right))
}

pub fn gt(left: Expression, right: Expression) -> Expression {
    Expression::Gt(Box::new(left), Box::new(right))
}

pub fn ge(left: Expression, right: Expression) -> Expression {
    Expression::Ge(Box::new(left), Box::new(right))
}

pub fn ref_eq(left: VariableId, right: VariableId) -> Expression {
    Expression::RefEq {
        equal: true,
        left,
        right,
    }
}

pub fn ref_ne(left: VariableId, right: VariableId) -> Expression {
    Expression::RefEq {
        equal: false,
        left,
        right,
    }
}

impl Expression {
    pub fn is_trivially_true(&self) -> bool {
        matches!(self, Expression::Bool(true))
    }

    /// Rewrite every unversioned variable atom to its current version
    pub fn with_versions(&self, versions: &dyn VersionLookup) -> Expression {
        match self {
            Expression::Bool(_) | Expression::Int(_) => self.clone(),
            Expression::Var(v) => {
                Expression::Versioned(VersionedVariable::new(*v, versions.version_of(*v)))
            }
            Expression::Versioned(_) | Expression::RefEqVersioned { .. } => self.clone(),
            Expression::Not(e) => not(e.with_versions(versions)),
            Expression::And(es) => and(es.iter().map(|e| e.with_versions(versions)).collect()),
            Expression::Or(es) => or(es.iter().map(|e| e.with_versions(versions)).collect()),
            Expression::Implies(l, r) => {
                implies(l.with_versions(versions), r.with_versions(versions))
            }
            Expression::Add(es) => add(es.iter().map(|e| e.with_versions(versions)).collect()),
            Expression::Sub(l, r) => sub(l.with_versions(versions), r.with_versions(versions)),
            Expression::Mul(es) => mul(es.iter().map(|e| e.with_versions(versions)).collect()),
            Expression::Neg(e) => neg(e.with_versions(versions)),
            Expression::Eq(l, r) => eq(l.with_versions(versions), r.with_versions(versions)),
            Expression::Lt(l, r) => lt(l.with_versions(versions), r.with_versions(versions)),
            Expression::Le(l, r) => le(l.with_versions(versions), r.with_versions(versions)),
            Expression::Gt(l, r) => gt(l.with_versions(versions), r.with_versions(versions)),
            Expression::Ge(l, r) => ge(l.with_versions(versions), r.with_versions(versions)),
            Expression::RefEq { equal, left, right } => Expression::RefEqVersioned {
                equal: *equal,
                left: VersionedVariable::new(*left, versions.version_of(*left)),
                right: VersionedVariable::new(*right, versions.version_of(*right)),
            },
        }
    }

    /// Invoke `visit` on every variable atom, versioned or not
    pub fn visit_variables(&self, visit: &mut dyn FnMut(VariableId)) {
        match self {
            Expression::Bool(_) | Expression::Int(_) => (),
            Expression::Var(v) => visit(*v),
            Expression::Versioned(vv) => visit(vv.variable),
            Expression::Not(e) | Expression::Neg(e) => e.visit_variables(visit),
            Expression::And(es) | Expression::Or(es) | Expression::Add(es) | Expression::Mul(es) => {
                for e in es {
                    e.visit_variables(visit);
                }
            }
            Expression::Implies(l, r)
            | Expression::Sub(l, r)
            | Expression::Eq(l, r)
            | Expression::Lt(l, r)
            | Expression::Le(l, r)
            | Expression::Gt(l, r)
            | Expression::Ge(l, r) => {
                l.visit_variables(visit);
                r.visit_variables(visit);
            }
            Expression::RefEq { left, right, .. } => {
                visit(*left);
                visit(*right);
            }
            Expression::RefEqVersioned { left, right, .. } => {
                visit(left.variable);
                visit(right.variable);
            }
        }
    }

    /// Sort-check the expression against the variable registry. Returns
    /// the sort of the whole expression on success.
    pub fn validate(&self, lookup: &dyn VariableLookup) -> Result<Sort> {
        match self {
            Expression::Bool(_) => Ok(Sort::Bool),
            Expression::Int(_) => Ok(Sort::Int),
            Expression::Var(v) => Ok(lookup.variable_sort(*v)),
            Expression::Versioned(vv) => Ok(lookup.variable_sort(vv.variable)),
            Expression::Not(e) => {
                require_sort(e.validate(lookup)?, Sort::Bool)?;
                Ok(Sort::Bool)
            }
            Expression::And(es) | Expression::Or(es) => {
                for e in es {
                    require_sort(e.validate(lookup)?, Sort::Bool)?;
                }
                Ok(Sort::Bool)
            }
            Expression::Implies(l, r) => {
                require_sort(l.validate(lookup)?, Sort::Bool)?;
                require_sort(r.validate(lookup)?, Sort::Bool)?;
                Ok(Sort::Bool)
            }
            Expression::Add(es) | Expression::Mul(es) => {
                for e in es {
                    require_sort(e.validate(lookup)?, Sort::Int)?;
                }
                Ok(Sort::Int)
            }
            Expression::Sub(l, r) => {
                require_sort(l.validate(lookup)?, Sort::Int)?;
                require_sort(r.validate(lookup)?, Sort::Int)?;
                Ok(Sort::Int)
            }
            Expression::Neg(e) => {
                require_sort(e.validate(lookup)?, Sort::Int)?;
                Ok(Sort::Int)
            }
            Expression::Eq(l, r) => {
                let left = l.validate(lookup)?;
                let right = r.validate(lookup)?;
                if left != right {
                    bail!("Mismatched operand sorts in equality");
                }
                Ok(Sort::Bool)
            }
            Expression::Lt(l, r)
            | Expression::Le(l, r)
            | Expression::Gt(l, r)
            | Expression::Ge(l, r) => {
                require_sort(l.validate(lookup)?, Sort::Int)?;
                require_sort(r.validate(lookup)?, Sort::Int)?;
                Ok(Sort::Bool)
            }
            Expression::RefEq { left, right, .. } => {
                if !lookup.is_reference(*left) || !lookup.is_reference(*right) {
                    bail!("Reference comparison over non-reference variables");
                }
                Ok(Sort::Bool)
            }
            Expression::RefEqVersioned { left, right, .. } => {
                if !lookup.is_reference(left.variable) || !lookup.is_reference(right.variable) {
                    bail!("Reference comparison over non-reference variables");
                }
                Ok(Sort::Bool)
            }
        }
    }
}

fn require_sort(found: Sort, expected: Sort) -> Result<()> {
    if found != expected {
        bail!("Expected sort {:?}, found {:?}", expected, found);
    }
    Ok(())
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn join(f: &mut fmt::Formatter<'_>, op: &str, es: &[Expression]) -> fmt::Result {
            write!(f, "({}", op)?;
            for e in es {
                write!(f, " {}", e)?;
            }
            write!(f, ")")
        }
        match self {
            Expression::Bool(v) => write!(f, "{}", v),
            Expression::Int(v) => write!(f, "{}", v),
            Expression::Var(v) => write!(f, "%{}", v.0),
            Expression::Versioned(vv) => write!(f, "{}", vv),
            Expression::Not(e) => write!(f, "(not {})", e),
            Expression::And(es) => join(f, "and", es),
            Expression::Or(es) => join(f, "or", es),
            Expression::Implies(l, r) => write!(f, "(=> {} {})", l, r),
            Expression::Add(es) => join(f, "+", es),
            Expression::Sub(l, r) => write!(f, "(- {} {})", l, r),
            Expression::Mul(es) => join(f, "*", es),
            Expression::Neg(e) => write!(f, "(- {})", e),
            Expression::Eq(l, r) => write!(f, "(= {} {})", l, r),
            Expression::Lt(l, r) => write!(f, "(< {} {})", l, r),
            Expression::Le(l, r) => write!(f, "(<= {} {})", l, r),
            Expression::Gt(l, r) => write!(f, "(> {} {})", l, r),
            Expression::Ge(l, r) => write!(f, "(>= {} {})", l, r),
            Expression::RefEq { equal, left, right } => {
                let op = if *equal { "=" } else { "distinct" };
                write!(f, "({} %{} %{})", op, left.0, right.0)
            }
            Expression::RefEqVersioned { equal, left, right } => {
                let op = if *equal { "=" } else { "distinct" };
                write!(f, "({} {} {})", op, left, right)
            }
        }
    }
}
