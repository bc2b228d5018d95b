//! The records engine: the façade the HTTP layer calls for every records
//! operation.
//!
//! Reads run directly on the pool. Writes run on a spawned task that owns
//! the transaction, so that a caller going away can't leave a transaction
//! half-finished: the task notices the cancellation, rolls back and exits.
//! A [`ChangeEvent`] is only published by that task after the commit went
//! through.

mod error;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use serde_json::{json, Value as JsonValue};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::auth::Principal;
use crate::catalog::CatalogHolder;
use crate::data_types::{Operation, Record, SequenceNumber, Value};
use crate::expr::Predicate;
use crate::lifecycle::DbLifecycle;
use crate::policy::BoundPolicy;
use crate::query::{
    build_create, build_delete, build_get, build_list, build_next_sequence,
    build_policy_check, build_update, parse_record_id, validate_create, validate_update,
    FilterError, ListQuery, ListRequest, PageLimits, SqlParam,
};
use crate::realtime::{ChangeEvent, RealtimeBus, SubscriptionHandle};
use crate::repository::interface::{Repository, RepositoryTransaction};
use crate::schema::TableDefinition;

pub use error::RecordsError;

pub type RecordsResult<T, E = RecordsError> = Result<T, E>;

/// Per-request state: who is asking, and when to give up.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub principal: Arc<Principal>,
    pub cancel: CancellationToken,
    pub deadline: Option<Instant>,
}

impl RequestContext {
    pub fn new(principal: Principal) -> Self {
        Self {
            principal: Arc::new(principal),
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Resolves once the request is cancelled or past its deadline.
async fn interrupted(cancel: CancellationToken, deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }
        None => cancel.cancelled().await,
    }
}

async fn guarded<T>(
    context: &RequestContext,
    work: impl Future<Output = RecordsResult<T>>,
) -> RecordsResult<T> {
    tokio::select! {
        biased;
        _ = interrupted(context.cancel.clone(), context.deadline) => Err(RecordsError::Cancelled),
        result = work => result,
    }
}

/// One page of a list request.
#[derive(Debug, Clone, PartialEq)]
pub struct ListResponse {
    pub page: u64,
    pub per_page: u64,
    pub total_items: u64,
    pub total_pages: u64,
    pub items: Vec<Record>,
}

impl ListResponse {
    fn new(query: &ListQuery, total_items: u64, items: Vec<Record>) -> Self {
        Self {
            page: query.page,
            per_page: query.per_page,
            total_items,
            total_pages: total_items.div_ceil(query.per_page),
            items,
        }
    }

    pub fn to_json(&self) -> JsonValue {
        json!({
            "page": self.page,
            "perPage": self.per_page,
            "totalItems": self.total_items,
            "totalPages": self.total_pages,
            "items": self.items.iter().map(Record::to_json).collect::<Vec<_>>(),
        })
    }
}

/// What a write transaction produced, before it is committed.
struct WriteOutcome {
    record: Record,
    id: Value,
}

#[derive(Debug, Clone)]
pub struct RecordsEngine {
    catalog: Arc<CatalogHolder>,
    repository: Arc<dyn Repository>,
    lifecycle: Arc<dyn DbLifecycle>,
    bus: Arc<RealtimeBus>,
    limits: PageLimits,
}

impl RecordsEngine {
    pub fn new(
        catalog: Arc<CatalogHolder>,
        repository: Arc<dyn Repository>,
        lifecycle: Arc<dyn DbLifecycle>,
        bus: Arc<RealtimeBus>,
        limits: PageLimits,
    ) -> Self {
        Self {
            catalog,
            repository,
            lifecycle,
            bus,
            limits,
        }
    }

    pub fn catalog(&self) -> &Arc<CatalogHolder> {
        &self.catalog
    }

    pub fn bus(&self) -> &Arc<RealtimeBus> {
        &self.bus
    }

    pub fn lifecycle(&self) -> &Arc<dyn DbLifecycle> {
        &self.lifecycle
    }

    fn observe<T>(
        table: &str,
        operation: Operation,
        result: RecordsResult<T>,
    ) -> RecordsResult<T> {
        match &result {
            Ok(_) => crate::metrics::record_operation(table, operation, "ok"),
            Err(e) => {
                match e {
                    RecordsError::Internal(cause) => {
                        error!(table, %operation, %cause, "Records operation failed")
                    }
                    RecordsError::Unusable(reason) => {
                        error!(table, %operation, "Table is unusable: {reason}")
                    }
                    other => debug!(table, %operation, "Records operation rejected: {other}"),
                }
                crate::metrics::record_operation(table, operation, e.code());
            }
        }
        result
    }

    pub async fn list(
        &self,
        table_name: &str,
        request: &ListRequest,
        context: &RequestContext,
    ) -> RecordsResult<ListResponse> {
        let result = self.list_inner(table_name, request, context).await;
        Self::observe(table_name, Operation::Read, result)
    }

    async fn list_inner(
        &self,
        table_name: &str,
        request: &ListRequest,
        context: &RequestContext,
    ) -> RecordsResult<ListResponse> {
        let table = self.catalog.lookup(table_name)?;
        let query = ListQuery::parse(&table, request, self.limits)?;
        let policy = table
            .policy(Operation::Read)
            .bind(context.principal.clone());

        if policy.is_denied() {
            return Ok(ListResponse::new(&query, 0, vec![]));
        }

        let (page, count) = build_list(&table, &query, &policy);
        guarded(context, async {
            let (items, total) = futures::try_join!(
                self.repository.fetch_records(&page, &table.columns),
                self.repository.fetch_count(&count),
            )?;
            Ok(ListResponse::new(&query, total.max(0) as u64, items))
        })
        .await
    }

    /// Unknown ids, ids of the wrong type and rows hidden by the read policy
    /// all come back as [`RecordsError::NotFound`].
    pub async fn get(
        &self,
        table_name: &str,
        id: &str,
        context: &RequestContext,
    ) -> RecordsResult<Record> {
        let result = self.get_inner(table_name, id, context).await;
        Self::observe(table_name, Operation::Read, result)
    }

    async fn get_inner(
        &self,
        table_name: &str,
        id: &str,
        context: &RequestContext,
    ) -> RecordsResult<Record> {
        let table = self.catalog.lookup(table_name)?;
        let id = parse_record_id(&table, id).ok_or(RecordsError::NotFound)?;
        let policy = table
            .policy(Operation::Read)
            .bind(context.principal.clone());
        if policy.is_denied() {
            return Err(RecordsError::NotFound);
        }

        let query = build_get(&table, &id, &policy);
        let records = guarded(context, async {
            Ok(self.repository.fetch_records(&query, &table.columns).await?)
        })
        .await?;
        records.into_iter().next().ok_or(RecordsError::NotFound)
    }

    pub async fn create(
        &self,
        table_name: &str,
        payload: &JsonValue,
        context: &RequestContext,
    ) -> RecordsResult<Record> {
        let result = self.create_inner(table_name, payload, context).await;
        Self::observe(table_name, Operation::Create, result)
    }

    async fn create_inner(
        &self,
        table_name: &str,
        payload: &JsonValue,
        context: &RequestContext,
    ) -> RecordsResult<Record> {
        let table = self.catalog.lookup(table_name)?;
        let record = validate_create(&table, payload)?;
        let policy = table
            .policy(Operation::Create)
            .bind(context.principal.clone());
        if policy.is_denied() {
            return Err(RecordsError::Forbidden);
        }

        let work_table = table.clone();
        self.run_write(
            table,
            Operation::Create,
            context,
            move |tx| {
                Box::pin(async move {
                    let table = work_table;
                    let inserted = tx
                        .fetch_optional_record(&build_create(&table, &record), &table.columns)
                        .await?
                        .ok_or_else(|| {
                            RecordsError::Internal("insert returned no row".to_string())
                        })?;
                    let id = primary_key_of(&table, &inserted);

                    // The policy is checked against the row as the database
                    // stored it, defaults included.
                    if policy.fragment().is_some() {
                        let check = build_policy_check(&table, &id, &policy);
                        if tx.fetch_optional_scalar(&check).await?.is_none() {
                            return Err(RecordsError::Forbidden);
                        }
                    }

                    Ok(WriteOutcome {
                        record: inserted,
                        id: id.value,
                    })
                })
            },
        )
        .await
    }

    pub async fn update(
        &self,
        table_name: &str,
        id: &str,
        payload: &JsonValue,
        context: &RequestContext,
    ) -> RecordsResult<Record> {
        let result = self.update_inner(table_name, id, payload, context).await;
        Self::observe(table_name, Operation::Update, result)
    }

    async fn update_inner(
        &self,
        table_name: &str,
        id: &str,
        payload: &JsonValue,
        context: &RequestContext,
    ) -> RecordsResult<Record> {
        let table = self.catalog.lookup(table_name)?;
        let id = parse_record_id(&table, id).ok_or(RecordsError::NotFound)?;
        let changes = validate_update(&table, payload, &id.value)?;
        let (policy, read_policy) = self.write_policies(&table, Operation::Update, context)?;

        let work_table = table.clone();
        self.run_write(
            table,
            Operation::Update,
            context,
            move |tx| {
                Box::pin(async move {
                    let table = work_table;
                    let query = build_update(&table, &id, &changes, &policy);
                    let updated = tx.fetch_optional_record(&query, &table.columns).await?;
                    match updated {
                        Some(record) => Ok(WriteOutcome {
                            record,
                            id: id.value,
                        }),
                        None => Err(missing_row_error(tx, &table, &id, &read_policy).await?),
                    }
                })
            },
        )
        .await
    }

    pub async fn delete(
        &self,
        table_name: &str,
        id: &str,
        context: &RequestContext,
    ) -> RecordsResult<Record> {
        let result = self.delete_inner(table_name, id, context).await;
        Self::observe(table_name, Operation::Delete, result)
    }

    async fn delete_inner(
        &self,
        table_name: &str,
        id: &str,
        context: &RequestContext,
    ) -> RecordsResult<Record> {
        let table = self.catalog.lookup(table_name)?;
        let id = parse_record_id(&table, id).ok_or(RecordsError::NotFound)?;
        let (policy, read_policy) = self.write_policies(&table, Operation::Delete, context)?;

        let work_table = table.clone();
        self.run_write(
            table,
            Operation::Delete,
            context,
            move |tx| {
                Box::pin(async move {
                    let table = work_table;
                    let query = build_delete(&table, &id, &policy);
                    let deleted = tx.fetch_optional_record(&query, &table.columns).await?;
                    match deleted {
                        Some(record) => Ok(WriteOutcome {
                            record,
                            id: id.value,
                        }),
                        None => Err(missing_row_error(tx, &table, &id, &read_policy).await?),
                    }
                })
            },
        )
        .await
    }

    /// The write policy for `operation` plus the read policy used to tell
    /// "forbidden" from "not found" when nothing was written.
    fn write_policies(
        &self,
        table: &TableDefinition,
        operation: Operation,
        context: &RequestContext,
    ) -> RecordsResult<(BoundPolicy, BoundPolicy)> {
        let policy = table.policy(operation).bind(context.principal.clone());
        if policy.is_denied() {
            return Err(RecordsError::Forbidden);
        }
        let read_policy = table
            .policy(Operation::Read)
            .bind(context.principal.clone());
        Ok((policy, read_policy))
    }

    /// Run `work` in a transaction on a separate task. The table's next
    /// sequence number is taken first and reserved on the bus until the
    /// transaction settles. Commits and publishes the change event on
    /// success; rolls back on error, cancellation or deadline.
    async fn run_write<F>(
        &self,
        table: Arc<TableDefinition>,
        operation: Operation,
        context: &RequestContext,
        work: F,
    ) -> RecordsResult<Record>
    where
        F: for<'a> FnOnce(
                &'a mut Box<dyn RepositoryTransaction>,
            ) -> BoxFuture<'a, RecordsResult<WriteOutcome>>
            + Send
            + 'static,
    {
        let repository = self.repository.clone();
        let bus = self.bus.clone();
        let cancel = context.cancel.clone();
        let deadline = context.deadline;

        let task = tokio::spawn(async move {
            let mut tx = tokio::select! {
                biased;
                _ = interrupted(cancel.clone(), deadline) => return Err(RecordsError::Cancelled),
                tx = repository.begin() => tx?,
            };

            let result = tokio::select! {
                biased;
                _ = interrupted(cancel, deadline) => Err(RecordsError::Cancelled),
                result = async {
                    let sequence = next_sequence(&mut tx, &table).await?;
                    // Reserved while the transaction still holds the
                    // sequence row, so no later number can be published
                    // ahead of this one.
                    let reservation = bus.reserve(&table.name, sequence);
                    let outcome = work(&mut tx).await?;
                    Ok::<_, RecordsError>((reservation, outcome))
                } => result,
            };

            let (reservation, outcome) = match result {
                Ok(result) => result,
                Err(e) => {
                    if let Err(rollback) = tx.rollback().await {
                        error!(table = table.name.as_str(), "Rollback failed: {rollback}");
                    }
                    return Err(e);
                }
            };

            // Past this point the write may be durable, so cancellation is
            // no longer honored. A failed commit drops the reservation.
            tx.commit().await?;

            let event = ChangeEvent {
                table: table.name.clone(),
                action: operation,
                record: outcome.record.clone(),
                id: outcome.id,
                sequence: reservation.sequence(),
                timestamp: Utc::now(),
            };
            reservation.publish(event);
            Ok(outcome.record)
        });

        task.await?
    }

    /// Open a realtime subscription. The filter is validated like a list
    /// filter.
    pub fn subscribe(
        &self,
        table_name: &str,
        filter: Option<&str>,
        principal: Arc<Principal>,
    ) -> RecordsResult<SubscriptionHandle> {
        let table = self.catalog.lookup(table_name)?;
        let filter = match filter.map(str::trim) {
            Some(source) if !source.is_empty() => Some(
                Predicate::parse_filter(source, &table.columns).map_err(FilterError::from)?,
            ),
            _ => None,
        };
        Ok(self.bus.subscribe(&table, filter, principal))
    }

    /// Re-read the database schema. Only admins may trigger this.
    pub async fn refresh_catalog(&self, principal: &Principal) -> RecordsResult<Vec<String>> {
        if !principal.is_admin() {
            return Err(RecordsError::Forbidden);
        }
        let catalog = self.catalog.refresh().await?;
        info!(version = catalog.version(), "Catalog refreshed on request");
        Ok(catalog.table_names())
    }

    pub async fn health_check(&self) -> bool {
        self.lifecycle.health_check().await
    }
}

async fn next_sequence(
    tx: &mut Box<dyn RepositoryTransaction>,
    table: &TableDefinition,
) -> RecordsResult<SequenceNumber> {
    tx.fetch_optional_scalar(&build_next_sequence(table))
        .await?
        .ok_or_else(|| RecordsError::Internal("sequence upsert returned no row".to_string()))
}

fn primary_key_of(table: &TableDefinition, record: &Record) -> SqlParam {
    let pk = table.primary_key_column();
    SqlParam::new(
        record.get(&pk.name).cloned().unwrap_or(Value::Null),
        pk.column_type,
    )
}

/// Nothing was updated or deleted: forbidden if the caller can see the
/// row, not found otherwise, so that hidden rows stay hidden.
async fn missing_row_error(
    tx: &mut Box<dyn RepositoryTransaction>,
    table: &TableDefinition,
    id: &SqlParam,
    read_policy: &BoundPolicy,
) -> RecordsResult<RecordsError> {
    if read_policy.is_denied() {
        return Ok(RecordsError::NotFound);
    }
    let check = build_policy_check(table, id, read_policy);
    Ok(match tx.fetch_optional_scalar(&check).await? {
        Some(_) => RecordsError::Forbidden,
        None => RecordsError::NotFound,
    })
}
