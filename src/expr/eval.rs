use crate::auth::Principal;
use crate::data_types::{ColumnType, Record, Value};

use super::{Expr, Operand};

impl Operand {
    fn resolve(&self, record: &Record, principal: &Principal, value_type: ColumnType) -> Value {
        match self {
            Operand::Column(name) => record.get(name).cloned().unwrap_or(Value::Null),
            Operand::Literal(value) => value.clone(),
            Operand::Principal(attr) => principal.attribute(attr, value_type),
        }
    }
}

impl Expr {
    /// Evaluate against a record with SQL semantics: a comparison involving
    /// NULL is not satisfied, so neither `a = b` nor `a != b` match it.
    pub fn evaluate(&self, record: &Record, principal: &Principal) -> bool {
        match self {
            Expr::Constant(b) => *b,
            Expr::And(a, b) => a.evaluate(record, principal) && b.evaluate(record, principal),
            Expr::Or(a, b) => a.evaluate(record, principal) || b.evaluate(record, principal),
            Expr::Compare(c) => {
                let left = c.left.resolve(record, principal, c.value_type);
                let right = c.right.resolve(record, principal, c.value_type);
                left.compare(&right)
                    .map(|ordering| c.op.holds(ordering))
                    .unwrap_or(false)
            }
            Expr::IsNull {
                operand,
                negated,
                value_type,
            } => operand.resolve(record, principal, *value_type).is_null() != *negated,
            Expr::Like { column, pattern } => match record.get(column) {
                Some(Value::Text(s)) => pattern.matches(s),
                _ => false,
            },
        }
    }
}
