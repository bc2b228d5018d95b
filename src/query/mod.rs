//! Turns record requests into parameterized SQL.
//!
//! Client input only ever reaches a statement as a bound parameter: column
//! names come from the catalog and are quoted, filters go through
//! [`crate::expr`] and render into `$n` placeholders.

mod builder;
mod validation;

use serde::Deserialize;

use crate::auth::Principal;
use crate::data_types::{ColumnType, Value};
use crate::expr::{ExprError, FragmentPart, ParamSlot, Predicate, PredicateFragment};
use crate::schema::{SqlDialect, TableDefinition};

pub use crate::expr::SqlParam;
pub use builder::{
    build_create, build_delete, build_get, build_list, build_next_sequence,
    build_policy_check, build_update, SEQUENCES_TABLE,
};
pub use validation::{validate_create, validate_update, ValidationError};

/// A finished statement and the values for its `$1..$n` placeholders.
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltQuery {
    pub sql: String,
    pub params: Vec<SqlParam>,
}

/// Incrementally builds a statement, numbering placeholders as values are
/// bound. Works like `sqlx::QueryBuilder`, but stays independent of the
/// database driver so that the same statement can be run on either backend.
#[derive(Debug, Default)]
pub struct QueryWriter {
    sql: String,
    params: Vec<SqlParam>,
    dialect: SqlDialect,
}

impl QueryWriter {
    pub fn new(sql: &str) -> Self {
        Self {
            sql: sql.to_string(),
            ..Self::default()
        }
    }

    /// A writer for statements against `table`'s database.
    pub fn for_table(table: &TableDefinition, sql: &str) -> Self {
        Self {
            dialect: table.dialect,
            ..Self::new(sql)
        }
    }

    pub fn push(&mut self, sql: &str) -> &mut Self {
        self.sql.push_str(sql);
        self
    }

    pub fn push_bind(&mut self, param: SqlParam) -> &mut Self {
        self.params.push(param);
        self.sql.push('$');
        self.sql.push_str(&self.params.len().to_string());
        self
    }

    /// Splice a predicate fragment in, resolving principal slots against the
    /// calling principal.
    pub fn push_fragment(
        &mut self,
        fragment: &PredicateFragment,
        principal: &Principal,
    ) -> &mut Self {
        for part in fragment.parts() {
            self.push_part(part, principal);
        }
        self
    }

    fn push_part(&mut self, part: &FragmentPart, principal: &Principal) {
        match part {
            FragmentPart::Sql(sql) => {
                self.push(sql);
            }
            FragmentPart::Param(ParamSlot::Value(param)) => {
                self.push_bind(param.clone());
            }
            FragmentPart::Param(ParamSlot::Principal { attr, value_type }) => {
                let value = principal.attribute(attr, *value_type);
                self.push_bind(SqlParam::new(value, *value_type));
            }
            FragmentPart::Instant(inner) => {
                self.push_instant(|w| w.push_part(inner, principal));
            }
            FragmentPart::Folded(inner) => {
                self.push_folded(|w| w.push_part(inner, principal));
            }
        }
    }

    /// Lowercase ASCII letters and nothing else. That's all SQLite's
    /// `LOWER()` does; on Postgres the "C" collation gets the same result.
    pub fn push_folded(&mut self, operand: impl FnOnce(&mut Self)) -> &mut Self {
        self.push("LOWER(");
        operand(self);
        if self.dialect == SqlDialect::Postgres {
            self.push(" COLLATE \"C\"");
        }
        self.push(")")
    }

    /// Push a timestamp operand so that it compares as an instant. SQLite
    /// keeps timestamps as text in whatever format they were written in
    /// (`CURRENT_TIMESTAMP` defaults have no fraction, for one), so both
    /// sides go through `julianday`.
    pub fn push_instant(&mut self, operand: impl FnOnce(&mut Self)) -> &mut Self {
        match self.dialect {
            SqlDialect::Postgres => operand(self),
            SqlDialect::Sqlite => {
                self.push("julianday(");
                operand(self);
                self.push(")");
            }
        }
        self
    }

    /// A column or bound value of the given type, compared as an instant
    /// when it is a timestamp.
    pub fn push_comparable(
        &mut self,
        column_type: ColumnType,
        operand: impl FnOnce(&mut Self),
    ) -> &mut Self {
        if column_type == ColumnType::Timestamp {
            self.push_instant(operand)
        } else {
            operand(self);
            self
        }
    }

    pub fn build(self) -> BuiltQuery {
        BuiltQuery {
            sql: self.sql,
            params: self.params,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FilterError {
    #[error("Invalid filter: {0}")]
    Expr(#[from] ExprError),

    #[error("Unknown sort field {0:?}")]
    UnknownSortField(String),

    #[error("Cannot sort by json field {0:?}")]
    UnsortableField(String),

    #[error("Invalid {name} {value:?}: expected a positive integer")]
    InvalidNumber { name: &'static str, value: String },

    #[error("perPage exceeds maximum of {max}")]
    PageSizeTooLarge { max: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageLimits {
    pub default_per_page: u64,
    pub max_per_page: u64,
}

impl Default for PageLimits {
    fn default() -> Self {
        Self {
            default_per_page: 30,
            max_per_page: 500,
        }
    }
}

/// Raw list parameters, as they arrive in the query string.
#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ListRequest {
    pub filter: Option<String>,
    pub sort: Option<String>,
    pub page: Option<String>,
    pub per_page: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub column: String,
    pub descending: bool,
}

/// Validated list parameters for one table.
#[derive(Debug, Clone, PartialEq)]
pub struct ListQuery {
    pub filter: Option<Predicate>,
    pub sort: Vec<SortKey>,
    pub page: u64,
    pub per_page: u64,
}

impl ListQuery {
    pub fn parse(
        table: &TableDefinition,
        request: &ListRequest,
        limits: PageLimits,
    ) -> Result<Self, FilterError> {
        let filter = match request.filter.as_deref().map(str::trim) {
            Some(source) if !source.is_empty() => {
                Some(Predicate::parse_filter(source, &table.columns)?)
            }
            _ => None,
        };

        let sort = match request.sort.as_deref() {
            Some(sort) => parse_sort(table, sort)?,
            None => vec![],
        };

        let page = parse_positive("page", request.page.as_deref())?.unwrap_or(1);
        let per_page = parse_positive("perPage", request.per_page.as_deref())?
            .unwrap_or(limits.default_per_page);
        if per_page > limits.max_per_page {
            return Err(FilterError::PageSizeTooLarge {
                max: limits.max_per_page,
            });
        }

        Ok(Self {
            filter,
            sort,
            page,
            per_page,
        })
    }

    pub fn offset(&self) -> u64 {
        (self.page - 1).saturating_mul(self.per_page)
    }
}

fn parse_positive(name: &'static str, value: Option<&str>) -> Result<Option<u64>, FilterError> {
    match value.map(str::trim) {
        None | Some("") => Ok(None),
        Some(value) => match value.parse::<u64>() {
            Ok(n) if n >= 1 && n <= i64::MAX as u64 => Ok(Some(n)),
            _ => Err(FilterError::InvalidNumber {
                name,
                value: value.to_string(),
            }),
        },
    }
}

fn parse_sort(table: &TableDefinition, sort: &str) -> Result<Vec<SortKey>, FilterError> {
    sort.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|key| {
            let (column, descending) = match key.strip_prefix('-') {
                Some(column) => (column, true),
                None => (key.strip_prefix('+').unwrap_or(key), false),
            };
            let column = table
                .column(column)
                .ok_or_else(|| FilterError::UnknownSortField(column.to_string()))?;
            if column.column_type == ColumnType::Json {
                return Err(FilterError::UnsortableField(column.name.clone()));
            }
            Ok(SortKey {
                column: column.name.clone(),
                descending,
            })
        })
        .collect()
}

/// Parse a record id from a URL path segment. `None` if it can't be a
/// value of the primary key's type, which callers treat as "no such row".
pub fn parse_record_id(table: &TableDefinition, id: &str) -> Option<SqlParam> {
    let pk = table.primary_key_column();
    Value::from_path_segment(pk.column_type, id).map(|v| SqlParam::new(v, pk.column_type))
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::testutils::notes_table;

    fn request(sort: Option<&str>, page: Option<&str>, per_page: Option<&str>) -> ListRequest {
        ListRequest {
            filter: None,
            sort: sort.map(String::from),
            page: page.map(String::from),
            per_page: per_page.map(String::from),
        }
    }

    #[test]
    fn test_writer_numbers_placeholders() {
        let mut writer = QueryWriter::new("SELECT 1 WHERE a = ");
        writer
            .push_bind(SqlParam::new(Value::Integer(1), ColumnType::Integer))
            .push(" AND b = ")
            .push_bind(SqlParam::new(Value::Null, ColumnType::Text));
        let query = writer.build();

        assert_eq!(query.sql, "SELECT 1 WHERE a = $1 AND b = $2");
        assert_eq!(query.params.len(), 2);
        assert_eq!(query.params[1].value_type, ColumnType::Text);
    }

    #[test]
    fn test_list_query_defaults() {
        let query =
            ListQuery::parse(&notes_table(), &ListRequest::default(), PageLimits::default())
                .unwrap();
        assert_eq!(query.filter, None);
        assert_eq!(query.sort, vec![]);
        assert_eq!(query.page, 1);
        assert_eq!(query.per_page, 30);
        assert_eq!(query.offset(), 0);
    }

    #[test]
    fn test_list_query_sort() {
        let query = ListQuery::parse(
            &notes_table(),
            &request(Some("-score, +body,id"), Some("3"), Some("10")),
            PageLimits::default(),
        )
        .unwrap();
        assert_eq!(
            query.sort,
            vec![
                SortKey {
                    column: "score".to_string(),
                    descending: true
                },
                SortKey {
                    column: "body".to_string(),
                    descending: false
                },
                SortKey {
                    column: "id".to_string(),
                    descending: false
                },
            ]
        );
        assert_eq!(query.offset(), 20);
    }

    #[rstest]
    #[case(request(Some("nope"), None, None), FilterError::UnknownSortField("nope".to_string()))]
    #[case(request(Some("meta"), None, None), FilterError::UnsortableField("meta".to_string()))]
    #[case(request(None, Some("0"), None), FilterError::InvalidNumber { name: "page", value: "0".to_string() })]
    #[case(request(None, Some("x"), None), FilterError::InvalidNumber { name: "page", value: "x".to_string() })]
    #[case(request(None, None, Some("-1")), FilterError::InvalidNumber { name: "perPage", value: "-1".to_string() })]
    #[case(request(None, None, Some("501")), FilterError::PageSizeTooLarge { max: 500 })]
    fn test_list_query_errors(#[case] request: ListRequest, #[case] expected: FilterError) {
        assert_eq!(
            ListQuery::parse(&notes_table(), &request, PageLimits::default()),
            Err(expected)
        );
    }

    #[test]
    fn test_page_size_error_message() {
        let err = ListQuery::parse(
            &notes_table(),
            &request(None, None, Some("1000")),
            PageLimits::default(),
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "perPage exceeds maximum of 500");
    }

    #[test]
    fn test_parse_record_id() {
        let table = notes_table();
        assert_eq!(
            parse_record_id(&table, "12"),
            Some(SqlParam::new(Value::Integer(12), ColumnType::Integer))
        );
        assert_eq!(parse_record_id(&table, "abc"), None);
    }
}
