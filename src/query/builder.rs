use itertools::Itertools;

use crate::data_types::{ColumnType, Record, Value};
use crate::policy::BoundPolicy;
use crate::schema::{quote_identifier, SqlDialect, TableDefinition};

use super::{BuiltQuery, ListQuery, QueryWriter, SqlParam};

/// Per-table counter backing change event sequence numbers.
pub const SEQUENCES_TABLE: &str = "_petrel_sequences";

fn column_list(table: &TableDefinition) -> String {
    table.column_names().map(quote_identifier).join(", ")
}

/// `WHERE (<filter>) AND (<policy>)`. A missing filter renders as a
/// tautology so that the shape of the clause never depends on the request.
fn push_where(
    writer: &mut QueryWriter,
    filter: impl FnOnce(&mut QueryWriter),
    policy: &BoundPolicy,
) {
    writer.push(" WHERE (");
    filter(writer);
    writer.push(") AND (");
    match policy.fragment() {
        Some(fragment) => {
            writer.push_fragment(fragment, policy.principal());
        }
        None if policy.is_denied() => {
            writer.push("1 = 0");
        }
        None => {
            writer.push("1 = 1");
        }
    }
    writer.push(")");
}

fn push_pk_filter(writer: &mut QueryWriter, table: &TableDefinition, id: &SqlParam) {
    let pk_type = table.primary_key_column().column_type;
    writer
        .push_comparable(pk_type, |w| {
            w.push(&quote_identifier(&table.primary_key));
        })
        .push(" = ")
        .push_comparable(pk_type, |w| {
            w.push_bind(id.clone());
        });
}

/// Timestamps sort as instants on SQLite, where they are text.
fn sort_expression(table: &TableDefinition, column: &str) -> String {
    let quoted = quote_identifier(column);
    let is_timestamp = table
        .column(column)
        .map_or(false, |c| c.column_type == ColumnType::Timestamp);
    match table.dialect {
        SqlDialect::Sqlite if is_timestamp => format!("julianday({quoted})"),
        _ => quoted,
    }
}

/// Returns the page query and the matching count query. Both share the
/// same WHERE clause.
pub fn build_list(
    table: &TableDefinition,
    query: &ListQuery,
    policy: &BoundPolicy,
) -> (BuiltQuery, BuiltQuery) {
    let push_filter = |writer: &mut QueryWriter| match &query.filter {
        Some(filter) => {
            writer.push_fragment(filter.fragment(), policy.principal());
        }
        None => {
            writer.push("1 = 1");
        }
    };

    let mut page = QueryWriter::for_table(table, &format!(
        "SELECT {} FROM {}",
        column_list(table),
        quote_identifier(&table.name)
    ));
    push_where(&mut page, push_filter, policy);

    let mut order = query
        .sort
        .iter()
        .map(|key| {
            format!(
                "{} {}",
                sort_expression(table, &key.column),
                if key.descending { "DESC" } else { "ASC" }
            )
        })
        .collect::<Vec<_>>();
    if !query.sort.iter().any(|key| key.column == table.primary_key) {
        order.push(format!("{} ASC", quote_identifier(&table.primary_key)));
    }
    page.push(" ORDER BY ").push(&order.join(", "));

    page.push(" LIMIT ")
        .push_bind(SqlParam::new(
            Value::Integer(query.per_page as i64),
            ColumnType::Integer,
        ))
        .push(" OFFSET ")
        .push_bind(SqlParam::new(
            Value::Integer(query.offset().min(i64::MAX as u64) as i64),
            ColumnType::Integer,
        ));

    let mut count = QueryWriter::for_table(table, &format!(
        "SELECT COUNT(*) FROM {}",
        quote_identifier(&table.name)
    ));
    push_where(&mut count, push_filter, policy);

    (page.build(), count.build())
}

pub fn build_get(table: &TableDefinition, id: &SqlParam, policy: &BoundPolicy) -> BuiltQuery {
    let mut writer = QueryWriter::for_table(table, &format!(
        "SELECT {} FROM {}",
        column_list(table),
        quote_identifier(&table.name)
    ));
    push_where(&mut writer, |w| push_pk_filter(w, table, id), policy);
    writer.build()
}

/// Returns a row (with a single `1` column) iff the row with this id passes
/// the policy.
pub fn build_policy_check(
    table: &TableDefinition,
    id: &SqlParam,
    policy: &BoundPolicy,
) -> BuiltQuery {
    let mut writer = QueryWriter::for_table(table, &format!(
        "SELECT CAST(1 AS BIGINT) FROM {}",
        quote_identifier(&table.name)
    ));
    push_where(&mut writer, |w| push_pk_filter(w, table, id), policy);
    writer.build()
}

/// `record` must already be validated against the table.
pub fn build_create(table: &TableDefinition, record: &Record) -> BuiltQuery {
    let mut writer = QueryWriter::for_table(
        table,
        &format!("INSERT INTO {}", quote_identifier(&table.name)),
    );

    if record.is_empty() {
        writer.push(" DEFAULT VALUES");
    } else {
        writer.push(" (").push(
            &record
                .iter()
                .map(|(name, _)| quote_identifier(name))
                .join(", "),
        );
        writer.push(") VALUES (");
        for (i, (name, value)) in record.iter().enumerate() {
            if i > 0 {
                writer.push(", ");
            }
            writer.push_bind(bind_for(table, name, value));
        }
        writer.push(")");
    }

    writer.push(" RETURNING ").push(&column_list(table));
    writer.build()
}

/// `changes` must be non-empty and already validated against the table.
pub fn build_update(
    table: &TableDefinition,
    id: &SqlParam,
    changes: &Record,
    policy: &BoundPolicy,
) -> BuiltQuery {
    let mut writer = QueryWriter::for_table(
        table,
        &format!("UPDATE {} SET ", quote_identifier(&table.name)),
    );
    for (i, (name, value)) in changes.iter().enumerate() {
        if i > 0 {
            writer.push(", ");
        }
        writer
            .push(&quote_identifier(name))
            .push(" = ")
            .push_bind(bind_for(table, name, value));
    }
    push_where(&mut writer, |w| push_pk_filter(w, table, id), policy);
    writer.push(" RETURNING ").push(&column_list(table));
    writer.build()
}

pub fn build_delete(table: &TableDefinition, id: &SqlParam, policy: &BoundPolicy) -> BuiltQuery {
    let mut writer = QueryWriter::for_table(
        table,
        &format!("DELETE FROM {}", quote_identifier(&table.name)),
    );
    push_where(&mut writer, |w| push_pk_filter(w, table, id), policy);
    writer.push(" RETURNING ").push(&column_list(table));
    writer.build()
}

/// Increment and return the table's sequence counter. Runs inside the
/// write transaction, so a rollback discards the increment.
pub fn build_next_sequence(table: &TableDefinition) -> BuiltQuery {
    let mut writer = QueryWriter::for_table(table, &format!(
        "INSERT INTO {SEQUENCES_TABLE} (table_name, value) VALUES ("
    ));
    writer
        .push_bind(SqlParam::new(
            Value::Text(table.name.clone()),
            ColumnType::Text,
        ))
        .push(&format!(
            ", 1) ON CONFLICT (table_name) DO UPDATE SET value = {SEQUENCES_TABLE}.value + 1 \
             RETURNING value"
        ));
    writer.build()
}

fn bind_for(table: &TableDefinition, name: &str, value: &Value) -> SqlParam {
    let value_type = table
        .column(name)
        .map(|c| c.column_type)
        .unwrap_or(ColumnType::Text);
    SqlParam::new(value.clone(), value_type)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::auth::Principal;
    use crate::data_types::Operation;
    use crate::expr::Predicate;
    use crate::policy::CompiledPolicy;
    use crate::query::{ListQuery, SortKey};
    use crate::testutils::{notes_table, polls_table};

    const COLUMNS: &str = r#""id", "owner_id", "body", "score", "is_public", "meta""#;

    fn owner_policy(principal: &str) -> BoundPolicy {
        let table = notes_table();
        let predicate = Predicate::parse_policy("owner_id = principal.id", &table.columns).unwrap();
        CompiledPolicy::Predicate(Arc::new(predicate))
            .bind(Arc::new(Principal::new(principal, "user")))
    }

    fn id(i: i64) -> SqlParam {
        SqlParam::new(Value::Integer(i), ColumnType::Integer)
    }

    #[test]
    fn test_build_list() {
        let table = notes_table();
        let query = ListQuery {
            filter: Some(Predicate::parse_filter("score > 2", &table.columns).unwrap()),
            sort: vec![SortKey {
                column: "score".to_string(),
                descending: true,
            }],
            page: 2,
            per_page: 10,
        };

        let (page, count) = build_list(&table, &query, &owner_policy("alice"));
        assert_eq!(
            page.sql,
            format!(
                r#"SELECT {COLUMNS} FROM "notes" WHERE ("score" > $1) AND ("owner_id" = $2) ORDER BY "score" DESC, "id" ASC LIMIT $3 OFFSET $4"#
            )
        );
        assert_eq!(
            page.params,
            vec![
                SqlParam::new(Value::Integer(2), ColumnType::Integer),
                SqlParam::new(Value::Text("alice".to_string()), ColumnType::Text),
                SqlParam::new(Value::Integer(10), ColumnType::Integer),
                SqlParam::new(Value::Integer(10), ColumnType::Integer),
            ]
        );

        assert_eq!(
            count.sql,
            r#"SELECT COUNT(*) FROM "notes" WHERE ("score" > $1) AND ("owner_id" = $2)"#
        );
        assert_eq!(count.params, page.params[..2]);
    }

    #[test]
    fn test_build_list_compares_timestamps_as_instants() {
        let mut table = polls_table();
        let query = ListQuery {
            filter: Some(
                Predicate::parse_filter("created > '2024-03-01T12:00:00Z'", &table.columns)
                    .unwrap(),
            ),
            sort: vec![SortKey {
                column: "created".to_string(),
                descending: false,
            }],
            page: 1,
            per_page: 10,
        };
        let policy = table
            .policy(Operation::Read)
            .bind(Arc::new(Principal::anonymous()));

        let (page, _) = build_list(&table, &query, &policy);
        assert!(page.sql.contains(
            r#"WHERE (julianday("created") > julianday($1)) AND (1 = 1) ORDER BY julianday("created") ASC, "id" ASC"#
        ));
        assert_eq!(page.params[0].value_type, ColumnType::Timestamp);

        table.dialect = SqlDialect::Postgres;
        let (page, _) = build_list(&table, &query, &policy);
        assert!(page.sql.contains(
            r#"WHERE ("created" > $1) AND (1 = 1) ORDER BY "created" ASC, "id" ASC"#
        ));
    }

    #[test]
    fn test_build_list_folds_like_in_ascii() {
        let mut table = notes_table();
        let query = ListQuery {
            filter: Some(Predicate::parse_filter(r"body like '50\%%'", &table.columns).unwrap()),
            sort: vec![],
            page: 1,
            per_page: 10,
        };
        let policy = table
            .policy(Operation::Read)
            .bind(Arc::new(Principal::anonymous()));

        let (page, _) = build_list(&table, &query, &policy);
        assert!(page
            .sql
            .contains(r#"WHERE (LOWER("body") LIKE LOWER($1) ESCAPE '\') AND"#));
        assert_eq!(page.params[0].value, Value::Text(r"50\%%".to_string()));

        table.dialect = SqlDialect::Postgres;
        let (page, _) = build_list(&table, &query, &policy);
        assert!(page.sql.contains(
            r#"WHERE (LOWER("body" COLLATE "C") LIKE LOWER($1 COLLATE "C") ESCAPE '\') AND"#
        ));
    }

    #[test]
    fn test_build_list_no_filter_and_pk_sort() {
        let table = notes_table();
        let query = ListQuery {
            filter: None,
            sort: vec![SortKey {
                column: "id".to_string(),
                descending: true,
            }],
            page: 1,
            per_page: 5,
        };
        let policy = table
            .policy(Operation::Read)
            .bind(Arc::new(Principal::anonymous()));

        let (page, _) = build_list(&table, &query, &policy);
        assert!(page
            .sql
            .ends_with(r#"WHERE (1 = 1) AND (1 = 1) ORDER BY "id" DESC LIMIT $1 OFFSET $2"#));
    }

    #[test]
    fn test_build_get_anonymous_binds_null() {
        let query = build_get(&notes_table(), &id(7), &owner_policy("alice"));
        assert_eq!(
            query.sql,
            format!(r#"SELECT {COLUMNS} FROM "notes" WHERE ("id" = $1) AND ("owner_id" = $2)"#)
        );

        let anonymous = CompiledPolicy::Predicate(Arc::new(
            Predicate::parse_policy("owner_id = principal.id", &notes_table().columns).unwrap(),
        ))
        .bind(Arc::new(Principal::anonymous()));
        let query = build_get(&notes_table(), &id(7), &anonymous);
        assert_eq!(query.params[1], SqlParam::new(Value::Null, ColumnType::Text));
    }

    #[test]
    fn test_build_create() {
        let table = notes_table();
        let mut record = Record::new();
        record.insert("body", Value::Text("hi".to_string()));
        record.insert("score", Value::Integer(3));

        let query = build_create(&table, &record);
        assert_eq!(
            query.sql,
            format!(r#"INSERT INTO "notes" ("body", "score") VALUES ($1, $2) RETURNING {COLUMNS}"#)
        );
        assert_eq!(query.params[1].value_type, ColumnType::Integer);

        let query = build_create(&table, &Record::new());
        assert_eq!(
            query.sql,
            format!(r#"INSERT INTO "notes" DEFAULT VALUES RETURNING {COLUMNS}"#)
        );
    }

    #[test]
    fn test_build_update_and_delete() {
        let table = notes_table();
        let mut changes = Record::new();
        changes.insert("is_public", Value::Boolean(true));

        let update = build_update(&table, &id(1), &changes, &owner_policy("bob"));
        assert_eq!(
            update.sql,
            format!(
                r#"UPDATE "notes" SET "is_public" = $1 WHERE ("id" = $2) AND ("owner_id" = $3) RETURNING {COLUMNS}"#
            )
        );

        let delete = build_delete(&table, &id(1), &owner_policy("bob"));
        assert_eq!(
            delete.sql,
            format!(
                r#"DELETE FROM "notes" WHERE ("id" = $1) AND ("owner_id" = $2) RETURNING {COLUMNS}"#
            )
        );

        let check = build_policy_check(&table, &id(1), &owner_policy("bob"));
        assert_eq!(
            check.sql,
            r#"SELECT CAST(1 AS BIGINT) FROM "notes" WHERE ("id" = $1) AND ("owner_id" = $2)"#
        );
    }

    #[test]
    fn test_build_next_sequence() {
        let query = build_next_sequence(&notes_table());
        assert_eq!(
            query.sql,
            "INSERT INTO _petrel_sequences (table_name, value) VALUES ($1, 1) \
             ON CONFLICT (table_name) DO UPDATE SET value = _petrel_sequences.value + 1 \
             RETURNING value"
        );
        assert_eq!(
            query.params,
            vec![SqlParam::new(Value::Text("notes".to_string()), ColumnType::Text)]
        );
    }
}
