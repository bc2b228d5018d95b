//! The small boolean expression language shared by client filters and
//! row-level security policies.
//!
//! Sources are parsed with `sqlparser` and then lowered into [`Expr`], a
//! closed tree that only knows about comparisons, `like`, null checks and
//! `and`/`or`. Lowering validates every field reference against the table's
//! columns and coerces literals to the column type, so a lowered expression
//! can be rendered to SQL (always through bound parameters) or evaluated in
//! memory against a [`Record`] with the same outcome.

mod eval;
mod parser;
mod render;

use std::cmp::Ordering;

use regex::Regex;

use crate::auth::Principal;
use crate::data_types::{ColumnType, Record, Value};
use crate::schema::Column;

pub use render::{FragmentPart, ParamSlot, PredicateFragment, SqlParam};

pub const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExprError {
    #[error("Syntax error: {0}")]
    Syntax(String),

    #[error("Unknown field {0:?}")]
    UnknownField(String),

    #[error("Unsupported expression: {0}")]
    Unsupported(String),

    #[error("Cannot compare {field:?} ({expected}) with {literal}")]
    TypeMismatch {
        field: String,
        expected: &'static str,
        literal: String,
    },

    #[error("Expression is nested too deeply (max {} levels)", MAX_DEPTH)]
    TooDeep,
}

/// Which operands an expression may reference. Client filters only see the
/// table's columns; policies may also reference the calling principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExprMode {
    Filter,
    Policy,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PrincipalAttr {
    Id,
    Role,
    Claim(String),
}

impl std::fmt::Display for PrincipalAttr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PrincipalAttr::Id => write!(f, "principal.id"),
            PrincipalAttr::Role => write!(f, "principal.role"),
            PrincipalAttr::Claim(claim) => write!(f, "principal.claims.{claim}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

impl CompareOp {
    /// The operator to use when the operands are swapped.
    pub fn flip(self) -> Self {
        match self {
            CompareOp::Lt => CompareOp::Gt,
            CompareOp::LtEq => CompareOp::GtEq,
            CompareOp::Gt => CompareOp::Lt,
            CompareOp::GtEq => CompareOp::LtEq,
            other => other,
        }
    }

    pub fn is_ordering(self) -> bool {
        !matches!(self, CompareOp::Eq | CompareOp::NotEq)
    }

    pub fn sql(self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::NotEq => "<>",
            CompareOp::Lt => "<",
            CompareOp::LtEq => "<=",
            CompareOp::Gt => ">",
            CompareOp::GtEq => ">=",
        }
    }

    pub fn holds(self, ordering: Ordering) -> bool {
        match self {
            CompareOp::Eq => ordering == Ordering::Equal,
            CompareOp::NotEq => ordering != Ordering::Equal,
            CompareOp::Lt => ordering == Ordering::Less,
            CompareOp::LtEq => ordering != Ordering::Greater,
            CompareOp::Gt => ordering == Ordering::Greater,
            CompareOp::GtEq => ordering != Ordering::Less,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Column(String),
    Literal(Value),
    Principal(PrincipalAttr),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Comparison {
    pub left: Operand,
    pub op: CompareOp,
    pub right: Operand,
    /// Type both sides are compared as (the column's type when one side is
    /// a column).
    pub value_type: ColumnType,
}

/// A `like` pattern: `%` and `_` are wildcards and `\` makes the next
/// character literal. Only ASCII letters match regardless of case, which is
/// all that `LOWER()` folds on SQLite.
#[derive(Debug, Clone)]
pub struct LikePattern {
    pattern: String,
    regex: Regex,
}

impl LikePattern {
    pub fn new(pattern: &str) -> Result<Self, ExprError> {
        let mut source = String::from("(?s)^");
        let mut chars = pattern.chars();
        while let Some(c) = chars.next() {
            let literal = match c {
                '%' => {
                    source.push_str(".*");
                    continue;
                }
                '_' => {
                    source.push('.');
                    continue;
                }
                '\\' => chars.next().ok_or_else(|| {
                    ExprError::Unsupported("like pattern ending with an escape".to_string())
                })?,
                c => c,
            };
            let literal = literal.to_ascii_lowercase();
            source.push_str(&regex::escape(literal.encode_utf8(&mut [0; 4])));
        }
        source.push('$');

        let regex = Regex::new(&source)
            .map_err(|e| ExprError::Unsupported(format!("like pattern: {e}")))?;
        Ok(Self {
            pattern: pattern.to_string(),
            regex,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn matches(&self, s: &str) -> bool {
        self.regex.is_match(&s.to_ascii_lowercase())
    }
}

impl PartialEq for LikePattern {
    fn eq(&self, other: &Self) -> bool {
        self.pattern == other.pattern
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Constant(bool),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(Comparison),
    IsNull {
        operand: Operand,
        negated: bool,
        value_type: ColumnType,
    },
    Like {
        column: String,
        pattern: LikePattern,
    },
}

impl Expr {
    pub fn references_principal(&self) -> bool {
        match self {
            Expr::Constant(_) | Expr::Like { .. } => false,
            Expr::And(a, b) | Expr::Or(a, b) => {
                a.references_principal() || b.references_principal()
            }
            Expr::Compare(c) => {
                matches!(c.left, Operand::Principal(_))
                    || matches!(c.right, Operand::Principal(_))
            }
            Expr::IsNull { operand, .. } => matches!(operand, Operand::Principal(_)),
        }
    }
}

/// A parsed and validated expression together with its SQL rendering.
/// The fragment text is fixed at parse time; only the values bound to its
/// principal slots change between requests.
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    source: String,
    expr: Expr,
    fragment: PredicateFragment,
}

impl Predicate {
    fn build(source: &str, columns: &[Column], mode: ExprMode) -> Result<Self, ExprError> {
        let expr = parser::parse(source, columns, mode)?;
        let fragment = PredicateFragment::render(&expr);
        Ok(Self {
            source: source.to_string(),
            expr,
            fragment,
        })
    }

    pub fn parse_filter(source: &str, columns: &[Column]) -> Result<Self, ExprError> {
        Self::build(source, columns, ExprMode::Filter)
    }

    pub fn parse_policy(source: &str, columns: &[Column]) -> Result<Self, ExprError> {
        Self::build(source, columns, ExprMode::Policy)
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    pub fn fragment(&self) -> &PredicateFragment {
        &self.fragment
    }

    pub fn matches(&self, record: &Record, principal: &Principal) -> bool {
        self.expr.evaluate(record, principal)
    }
}
