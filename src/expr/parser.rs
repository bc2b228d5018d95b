use sqlparser::ast::{BinaryOperator, Expr as SqlExpr, UnaryOperator, Value as SqlValue};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::{Parser, ParserError};
use sqlparser::tokenizer::Token;

use crate::data_types::{ColumnType, Literal, Value};
use crate::schema::{find_column, Column};

use super::{
    CompareOp, Comparison, Expr, ExprError, ExprMode, LikePattern, Operand,
    PrincipalAttr, MAX_DEPTH,
};

pub(super) fn parse(
    source: &str,
    columns: &[Column],
    mode: ExprMode,
) -> Result<Expr, ExprError> {
    let sql_expr = parse_sql_expr(source)?;
    Lowering { columns, mode }.lower(&sql_expr, 0)
}

fn parse_sql_expr(source: &str) -> Result<SqlExpr, ExprError> {
    let dialect = PostgreSqlDialect {};
    let mut parser = Parser::new(&dialect)
        .try_with_sql(source)
        .map_err(syntax_error)?;

    let expr = parser.parse_expr().map_err(syntax_error)?;

    let next = parser.peek_token();
    if next.token != Token::EOF {
        return Err(ExprError::Syntax(format!(
            "unexpected {} after the end of the expression",
            next.token
        )));
    }

    Ok(expr)
}

fn syntax_error(e: ParserError) -> ExprError {
    match e {
        ParserError::RecursionLimitExceeded => ExprError::TooDeep,
        e => ExprError::Syntax(e.to_string()),
    }
}

/// One side of a comparison, before the comparison type is known.
enum Term<'a> {
    Column(&'a Column),
    Principal(PrincipalAttr),
    Literal(Literal),
}

struct Lowering<'a> {
    columns: &'a [Column],
    mode: ExprMode,
}

impl<'a> Lowering<'a> {
    fn lower(&self, expr: &SqlExpr, depth: usize) -> Result<Expr, ExprError> {
        if depth > MAX_DEPTH {
            return Err(ExprError::TooDeep);
        }

        match expr {
            SqlExpr::Nested(inner) => self.lower(inner, depth + 1),
            SqlExpr::BinaryOp { left, op, right } => match op {
                BinaryOperator::And => Ok(Expr::And(
                    Box::new(self.lower(left, depth + 1)?),
                    Box::new(self.lower(right, depth + 1)?),
                )),
                BinaryOperator::Or => Ok(Expr::Or(
                    Box::new(self.lower(left, depth + 1)?),
                    Box::new(self.lower(right, depth + 1)?),
                )),
                BinaryOperator::Eq => self.comparison(left, CompareOp::Eq, right),
                BinaryOperator::NotEq => self.comparison(left, CompareOp::NotEq, right),
                BinaryOperator::Lt => self.comparison(left, CompareOp::Lt, right),
                BinaryOperator::LtEq => self.comparison(left, CompareOp::LtEq, right),
                BinaryOperator::Gt => self.comparison(left, CompareOp::Gt, right),
                BinaryOperator::GtEq => self.comparison(left, CompareOp::GtEq, right),
                other => Err(ExprError::Unsupported(format!("operator {other}"))),
            },
            SqlExpr::Like {
                negated,
                expr,
                pattern,
                escape_char,
            } => {
                if *negated {
                    return Err(ExprError::Unsupported("not like".to_string()));
                }
                if escape_char.is_some() {
                    return Err(ExprError::Unsupported("like with a custom escape".to_string()));
                }
                self.like(expr, pattern)
            }
            SqlExpr::IsNull(inner) => self.null_check(inner, false),
            SqlExpr::IsNotNull(inner) => self.null_check(inner, true),
            SqlExpr::Value(SqlValue::Boolean(b)) => Ok(Expr::Constant(*b)),
            other => Err(ExprError::Unsupported(other.to_string())),
        }
    }

    fn column(&self, name: &str) -> Result<Term<'a>, ExprError> {
        find_column(self.columns, name)
            .map(Term::Column)
            .ok_or_else(|| ExprError::UnknownField(name.to_string()))
    }

    fn term(&self, expr: &SqlExpr) -> Result<Term<'a>, ExprError> {
        match expr {
            SqlExpr::Nested(inner) => self.term(inner),
            SqlExpr::Identifier(ident) => self.column(&ident.value),
            SqlExpr::CompoundIdentifier(parts) => {
                let names: Vec<&str> = parts.iter().map(|p| p.value.as_str()).collect();
                match (self.mode, names.as_slice()) {
                    (ExprMode::Policy, ["row", column]) => self.column(column),
                    (ExprMode::Policy, ["principal", "id"]) => {
                        Ok(Term::Principal(PrincipalAttr::Id))
                    }
                    (ExprMode::Policy, ["principal", "role"]) => {
                        Ok(Term::Principal(PrincipalAttr::Role))
                    }
                    (ExprMode::Policy, ["principal", "claims", claim]) => {
                        Ok(Term::Principal(PrincipalAttr::Claim(claim.to_string())))
                    }
                    (ExprMode::Policy, ["principal", ..]) => Err(ExprError::Unsupported(
                        format!("principal attribute {}", names.join(".")),
                    )),
                    _ => Err(ExprError::UnknownField(names.join("."))),
                }
            }
            SqlExpr::Value(value) => literal(value).map(Term::Literal),
            SqlExpr::UnaryOp {
                op: UnaryOperator::Minus,
                expr,
            } => match expr.as_ref() {
                SqlExpr::Value(SqlValue::Number(n, _)) => {
                    Ok(Term::Literal(Literal::Number(format!("-{n}"))))
                }
                other => Err(ExprError::Unsupported(format!("-{other}"))),
            },
            other => Err(ExprError::Unsupported(other.to_string())),
        }
    }

    fn comparison(
        &self,
        left: &SqlExpr,
        op: CompareOp,
        right: &SqlExpr,
    ) -> Result<Expr, ExprError> {
        match (self.term(left)?, self.term(right)?) {
            (Term::Column(c), Term::Literal(l)) => column_literal(c, op, l),
            (Term::Literal(l), Term::Column(c)) => column_literal(c, op.flip(), l),
            (Term::Column(c), Term::Principal(p)) => column_principal(c, op, p),
            (Term::Principal(p), Term::Column(c)) => column_principal(c, op.flip(), p),
            (Term::Principal(p), Term::Literal(l)) => principal_literal(p, op, l),
            (Term::Literal(l), Term::Principal(p)) => principal_literal(p, op.flip(), l),
            (Term::Principal(a), Term::Principal(b)) => Ok(Expr::Compare(Comparison {
                left: Operand::Principal(a),
                op,
                right: Operand::Principal(b),
                value_type: ColumnType::Text,
            })),
            (Term::Column(a), Term::Column(b)) => Err(ExprError::Unsupported(format!(
                "comparing two fields ({} and {})",
                a.name, b.name
            ))),
            (Term::Literal(a), Term::Literal(b)) => Err(ExprError::Unsupported(format!(
                "comparing two literals ({a} and {b})"
            ))),
        }
    }

    fn like(&self, expr: &SqlExpr, pattern: &SqlExpr) -> Result<Expr, ExprError> {
        let column = match self.term(expr)? {
            Term::Column(c) if c.column_type == ColumnType::Text => c,
            Term::Column(c) => {
                return Err(ExprError::Unsupported(format!(
                    "like on {} field {:?}",
                    c.column_type.semantic_name(),
                    c.name
                )))
            }
            _ => return Err(ExprError::Unsupported(format!("like on {expr}"))),
        };

        match self.term(pattern)? {
            Term::Literal(Literal::Text(p)) => Ok(Expr::Like {
                column: column.name.clone(),
                pattern: LikePattern::new(&p)?,
            }),
            _ => Err(ExprError::Unsupported(format!(
                "like pattern {pattern} (must be a string literal)"
            ))),
        }
    }

    fn null_check(&self, inner: &SqlExpr, negated: bool) -> Result<Expr, ExprError> {
        let (operand, value_type) = match self.term(inner)? {
            Term::Column(c) => (Operand::Column(c.name.clone()), c.column_type),
            Term::Principal(p) => (Operand::Principal(p), ColumnType::Text),
            Term::Literal(l) => {
                return Err(ExprError::Unsupported(format!("null check on literal {l}")))
            }
        };
        Ok(Expr::IsNull {
            operand,
            negated,
            value_type,
        })
    }
}

fn literal(value: &SqlValue) -> Result<Literal, ExprError> {
    match value {
        SqlValue::SingleQuotedString(s) => Ok(Literal::Text(s.clone())),
        SqlValue::Number(n, _) => Ok(Literal::Number(n.to_string())),
        SqlValue::Boolean(b) => Ok(Literal::Boolean(*b)),
        SqlValue::Null => Ok(Literal::Null),
        other => Err(ExprError::Unsupported(format!("literal {other}"))),
    }
}

fn null_comparison(
    operand: Operand,
    op: CompareOp,
    value_type: ColumnType,
    name: String,
) -> Result<Expr, ExprError> {
    match op {
        CompareOp::Eq | CompareOp::NotEq => Ok(Expr::IsNull {
            operand,
            negated: op == CompareOp::NotEq,
            value_type,
        }),
        _ => Err(ExprError::TypeMismatch {
            field: name,
            expected: value_type.semantic_name(),
            literal: "null".to_string(),
        }),
    }
}

fn check_comparable(column: &Column, op: CompareOp) -> Result<(), ExprError> {
    if column.column_type == ColumnType::Json {
        return Err(ExprError::Unsupported(format!(
            "comparing json field {:?} (only null checks are supported)",
            column.name
        )));
    }
    if op.is_ordering() && !column.column_type.is_orderable() {
        return Err(ExprError::Unsupported(format!(
            "operator {} on {} field {:?}",
            op.sql(),
            column.column_type.semantic_name(),
            column.name
        )));
    }
    Ok(())
}

fn column_literal(column: &Column, op: CompareOp, literal: Literal) -> Result<Expr, ExprError> {
    if literal == Literal::Null {
        return null_comparison(
            Operand::Column(column.name.clone()),
            op,
            column.column_type,
            column.name.clone(),
        );
    }
    check_comparable(column, op)?;

    let value = Value::from_literal(column.column_type, &literal).ok_or_else(|| {
        ExprError::TypeMismatch {
            field: column.name.clone(),
            expected: column.column_type.semantic_name(),
            literal: literal.to_string(),
        }
    })?;

    Ok(Expr::Compare(Comparison {
        left: Operand::Column(column.name.clone()),
        op,
        right: Operand::Literal(value),
        value_type: column.column_type,
    }))
}

fn column_principal(
    column: &Column,
    op: CompareOp,
    attr: PrincipalAttr,
) -> Result<Expr, ExprError> {
    check_comparable(column, op)?;
    Ok(Expr::Compare(Comparison {
        left: Operand::Column(column.name.clone()),
        op,
        right: Operand::Principal(attr),
        value_type: column.column_type,
    }))
}

fn principal_literal(
    attr: PrincipalAttr,
    op: CompareOp,
    literal: Literal,
) -> Result<Expr, ExprError> {
    let value_type = match &literal {
        Literal::Null => {
            let name = attr.to_string();
            return null_comparison(Operand::Principal(attr), op, ColumnType::Text, name);
        }
        Literal::Text(_) => ColumnType::Text,
        Literal::Number(n) if n.parse::<i64>().is_ok() => ColumnType::Integer,
        Literal::Number(_) => ColumnType::Real,
        Literal::Boolean(_) => ColumnType::Boolean,
    };

    if op.is_ordering() && !value_type.is_orderable() {
        return Err(ExprError::Unsupported(format!(
            "operator {} on {}",
            op.sql(),
            literal
        )));
    }

    let value = Value::from_literal(value_type, &literal).ok_or_else(|| {
        ExprError::TypeMismatch {
            field: attr.to_string(),
            expected: value_type.semantic_name(),
            literal: literal.to_string(),
        }
    })?;

    Ok(Expr::Compare(Comparison {
        left: Operand::Principal(attr),
        op,
        right: Operand::Literal(value),
        value_type,
    }))
}
