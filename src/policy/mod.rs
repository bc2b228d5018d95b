//! Row-level security policies.
//!
//! Every table gets one [`CompiledPolicy`] per operation, compiled when the
//! catalog is loaded. Requests bind the compiled policy to their principal
//! ([`BoundPolicy`]); the SQL text of a policy never changes per request,
//! only the values bound to its `principal.*` parameters.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;

use crate::auth::Principal;
use crate::data_types::{Operation, Record};
use crate::expr::{Expr, ExprError, Predicate, PredicateFragment};
use crate::schema::{Column, DefaultAccess};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("Invalid {operation} policy for table {table:?}: {reason}")]
pub struct PolicyError {
    pub table: String,
    pub operation: Operation,
    pub reason: ExprError,
}

/// Policy configuration for one table, as written in the config file (or
/// any other [`PolicySource`]).
#[derive(Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct TablePolicyConfig {
    #[serde(default)]
    pub default: DefaultAccess,
    pub create: Option<String>,
    pub read: Option<String>,
    pub update: Option<String>,
    pub delete: Option<String>,
}

impl TablePolicyConfig {
    pub fn open() -> Self {
        Self {
            default: DefaultAccess::Open,
            ..Default::default()
        }
    }

    pub fn expression(&self, operation: Operation) -> Option<&str> {
        match operation {
            Operation::Create => self.create.as_deref(),
            Operation::Read => self.read.as_deref(),
            Operation::Update => self.update.as_deref(),
            Operation::Delete => self.delete.as_deref(),
        }
    }
}

/// Where policy definitions come from. The catalog only stores the
/// compiled result.
pub trait PolicySource: Send + Sync + Debug {
    fn table_policy(&self, table: &str) -> Option<TablePolicyConfig>;
}

impl PolicySource for HashMap<String, TablePolicyConfig> {
    fn table_policy(&self, table: &str) -> Option<TablePolicyConfig> {
        self.get(table).cloned()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CompiledPolicy {
    Allow,
    Deny,
    Predicate(Arc<Predicate>),
}

impl CompiledPolicy {
    pub fn compile(
        table: &str,
        operation: Operation,
        expression: Option<&str>,
        default: DefaultAccess,
        columns: &[Column],
    ) -> Result<Self, PolicyError> {
        let expression = match expression.map(str::trim) {
            Some(e) if !e.is_empty() => e,
            _ => {
                return Ok(match default {
                    DefaultAccess::Open => CompiledPolicy::Allow,
                    DefaultAccess::Closed => CompiledPolicy::Deny,
                })
            }
        };

        let predicate =
            Predicate::parse_policy(expression, columns).map_err(|reason| PolicyError {
                table: table.to_string(),
                operation,
                reason,
            })?;

        // Constant policies skip the database round trip entirely
        Ok(match predicate.expr() {
            Expr::Constant(true) => CompiledPolicy::Allow,
            Expr::Constant(false) => CompiledPolicy::Deny,
            _ => CompiledPolicy::Predicate(Arc::new(predicate)),
        })
    }

    pub fn bind(&self, principal: Arc<Principal>) -> BoundPolicy {
        BoundPolicy {
            policy: self.clone(),
            principal,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TablePolicies {
    pub create: CompiledPolicy,
    pub read: CompiledPolicy,
    pub update: CompiledPolicy,
    pub delete: CompiledPolicy,
}

impl TablePolicies {
    pub fn uniform(policy: CompiledPolicy) -> Self {
        Self {
            create: policy.clone(),
            read: policy.clone(),
            update: policy.clone(),
            delete: policy,
        }
    }

    pub fn compile(
        table: &str,
        columns: &[Column],
        config: &TablePolicyConfig,
    ) -> Result<Self, PolicyError> {
        let compile = |operation| {
            CompiledPolicy::compile(
                table,
                operation,
                config.expression(operation),
                config.default,
                columns,
            )
        };

        let policies = Self {
            create: compile(Operation::Create)?,
            read: compile(Operation::Read)?,
            update: compile(Operation::Update)?,
            delete: compile(Operation::Delete)?,
        };
        debug!(table, "Compiled table policies");
        Ok(policies)
    }

    pub fn get(&self, operation: Operation) -> &CompiledPolicy {
        match operation {
            Operation::Create => &self.create,
            Operation::Read => &self.read,
            Operation::Update => &self.update,
            Operation::Delete => &self.delete,
        }
    }
}

/// A compiled policy together with the principal it is evaluated for.
#[derive(Debug, Clone)]
pub struct BoundPolicy {
    policy: CompiledPolicy,
    principal: Arc<Principal>,
}

impl BoundPolicy {
    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    /// True if no row can ever pass, so the database need not be asked.
    pub fn is_denied(&self) -> bool {
        matches!(self.policy, CompiledPolicy::Deny)
    }

    /// SQL fragment of the policy, or `None` for a constant policy.
    pub fn fragment(&self) -> Option<&PredicateFragment> {
        match &self.policy {
            CompiledPolicy::Predicate(p) => Some(p.fragment()),
            _ => None,
        }
    }

    pub fn matches(&self, record: &Record) -> bool {
        match &self.policy {
            CompiledPolicy::Allow => true,
            CompiledPolicy::Deny => false,
            CompiledPolicy::Predicate(p) => p.matches(record, &self.principal),
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::data_types::Value;
    use crate::testutils::notes_columns;

    fn compile(expression: Option<&str>, default: DefaultAccess) -> CompiledPolicy {
        CompiledPolicy::compile(
            "notes",
            Operation::Read,
            expression,
            default,
            &notes_columns(),
        )
        .unwrap()
    }

    #[rstest]
    #[case(None, DefaultAccess::Open, CompiledPolicy::Allow)]
    #[case(None, DefaultAccess::Closed, CompiledPolicy::Deny)]
    #[case(Some("  "), DefaultAccess::Closed, CompiledPolicy::Deny)]
    #[case(Some("true"), DefaultAccess::Closed, CompiledPolicy::Allow)]
    #[case(Some("false"), DefaultAccess::Open, CompiledPolicy::Deny)]
    fn test_constant_policies(
        #[case] expression: Option<&str>,
        #[case] default: DefaultAccess,
        #[case] expected: CompiledPolicy,
    ) {
        assert_eq!(compile(expression, default), expected);
    }

    #[test]
    fn test_newly_introspected_table_is_closed() {
        let policies =
            TablePolicies::compile("notes", &notes_columns(), &TablePolicyConfig::default())
                .unwrap();
        for operation in Operation::ALL {
            assert_eq!(policies.get(operation), &CompiledPolicy::Deny);
        }
    }

    #[test]
    fn test_malformed_policy_is_an_error() {
        let config = TablePolicyConfig {
            update: Some("owner_id = principal.nickname".to_string()),
            ..TablePolicyConfig::open()
        };
        let err = TablePolicies::compile("notes", &notes_columns(), &config).unwrap_err();
        assert_eq!(err.table, "notes");
        assert_eq!(err.operation, Operation::Update);
        assert!(matches!(err.reason, ExprError::Unsupported(_)));
    }

    #[test]
    fn test_bound_policy_matches() {
        let policy = compile(Some("owner_id = principal.id"), DefaultAccess::Closed);

        let mut record = Record::new();
        record.insert("owner_id", Value::Text("alice".to_string()));

        let alice = policy.bind(Arc::new(Principal::new("alice", "user")));
        let bob = policy.bind(Arc::new(Principal::new("bob", "user")));
        assert!(alice.matches(&record));
        assert!(!bob.matches(&record));
        assert!(!alice.is_denied());
        assert!(alice.fragment().is_some());

        let denied = CompiledPolicy::Deny.bind(Arc::new(Principal::anonymous()));
        assert!(denied.is_denied());
        assert!(!denied.matches(&record));
        assert!(denied.fragment().is_none());
    }

    #[test]
    fn test_policy_source_from_config_map() {
        let source: HashMap<String, TablePolicyConfig> =
            HashMap::from([("notes".to_string(), TablePolicyConfig::open())]);
        assert_eq!(source.table_policy("notes"), Some(TablePolicyConfig::open()));
        assert_eq!(source.table_policy("other"), None);
    }
}
