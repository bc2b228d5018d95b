use crate::data_types::{ColumnType, Value};
use crate::schema::quote_identifier;

use super::{Expr, Operand, PrincipalAttr};

/// A value to be bound to a statement parameter. The type travels with the
/// value so that NULLs can still be bound with the right database type.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlParam {
    pub value: Value,
    pub value_type: ColumnType,
}

impl SqlParam {
    pub fn new(value: Value, value_type: ColumnType) -> Self {
        Self { value, value_type }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParamSlot {
    Value(SqlParam),
    /// Filled in with the calling principal's attribute for each request.
    Principal {
        attr: PrincipalAttr,
        value_type: ColumnType,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum FragmentPart {
    Sql(String),
    Param(ParamSlot),
    /// One side of a timestamp comparison. Backends that keep timestamps
    /// as text wrap it so that instants are compared, not strings.
    Instant(Box<FragmentPart>),
    /// A `like` operand, lowercased in ASCII only on every backend.
    Folded(Box<FragmentPart>),
}

impl FragmentPart {
    fn template(&self) -> String {
        match self {
            FragmentPart::Sql(sql) => sql.clone(),
            FragmentPart::Param(_) => "?".to_string(),
            FragmentPart::Instant(inner) => format!("instant({})", inner.template()),
            FragmentPart::Folded(inner) => format!("LOWER({})", inner.template()),
        }
    }
}

/// SQL text of a predicate with holes for its parameters. Parameter
/// numbering is left to the statement the fragment is spliced into.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PredicateFragment {
    parts: Vec<FragmentPart>,
}

impl PredicateFragment {
    pub fn render(expr: &Expr) -> Self {
        let mut fragment = Self::default();
        fragment.push_expr(expr);
        fragment
    }

    pub fn parts(&self) -> &[FragmentPart] {
        &self.parts
    }

    /// The fragment with `?` in place of parameters, for logging.
    pub fn template(&self) -> String {
        self.parts.iter().map(FragmentPart::template).collect()
    }

    fn push_sql(&mut self, sql: &str) {
        if let Some(FragmentPart::Sql(last)) = self.parts.last_mut() {
            last.push_str(sql);
        } else {
            self.parts.push(FragmentPart::Sql(sql.to_string()));
        }
    }

    fn push_param(&mut self, slot: ParamSlot) {
        self.parts.push(FragmentPart::Param(slot));
    }

    fn operand_part(operand: &Operand, value_type: ColumnType) -> FragmentPart {
        match operand {
            Operand::Column(name) => FragmentPart::Sql(quote_identifier(name)),
            Operand::Literal(value) => {
                FragmentPart::Param(ParamSlot::Value(SqlParam::new(value.clone(), value_type)))
            }
            Operand::Principal(attr) => FragmentPart::Param(ParamSlot::Principal {
                attr: attr.clone(),
                value_type,
            }),
        }
    }

    fn push_operand(&mut self, operand: &Operand, value_type: ColumnType) {
        match Self::operand_part(operand, value_type) {
            FragmentPart::Sql(sql) => self.push_sql(&sql),
            part => self.parts.push(part),
        }
    }

    fn push_compared(&mut self, operand: &Operand, value_type: ColumnType) {
        if value_type == ColumnType::Timestamp {
            let part = Self::operand_part(operand, value_type);
            self.parts.push(FragmentPart::Instant(Box::new(part)));
        } else {
            self.push_operand(operand, value_type);
        }
    }

    fn push_expr(&mut self, expr: &Expr) {
        match expr {
            Expr::Constant(true) => self.push_sql("1 = 1"),
            Expr::Constant(false) => self.push_sql("1 = 0"),
            Expr::And(a, b) => self.push_binary(a, "AND", b),
            Expr::Or(a, b) => self.push_binary(a, "OR", b),
            Expr::Compare(c) => {
                self.push_compared(&c.left, c.value_type);
                self.push_sql(&format!(" {} ", c.op.sql()));
                self.push_compared(&c.right, c.value_type);
            }
            Expr::IsNull {
                operand,
                negated,
                value_type,
            } => {
                self.push_operand(operand, *value_type);
                self.push_sql(if *negated { " IS NOT NULL" } else { " IS NULL" });
            }
            Expr::Like { column, pattern } => {
                let column = FragmentPart::Sql(quote_identifier(column));
                let pattern = FragmentPart::Param(ParamSlot::Value(SqlParam::new(
                    Value::Text(pattern.pattern().to_string()),
                    ColumnType::Text,
                )));
                self.parts.push(FragmentPart::Folded(Box::new(column)));
                self.push_sql(" LIKE ");
                self.parts.push(FragmentPart::Folded(Box::new(pattern)));
                self.push_sql(" ESCAPE '\\'");
            }
        }
    }

    fn push_binary(&mut self, left: &Expr, op: &str, right: &Expr) {
        self.push_sql("(");
        self.push_expr(left);
        self.push_sql(&format!(" {op} "));
        self.push_expr(right);
        self.push_sql(")");
    }
}
