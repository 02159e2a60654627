//! Units of work bound to one pooled connection.
//!
//! A [`Session`] owns its [`PooledConnection`] exclusively from `open` to
//! `close`. Entity operations run sequentially on that connection and never
//! start or end a transaction themselves; transaction control is explicit
//! through [`Session::begin`], [`Session::commit`] and [`Session::rollback`],
//! or implicit through [`TransactionRunner`](super::TransactionRunner).
//!
//! # Transaction state
//!
//! ```text
//! NotStarted --begin--> Active --commit--> Committed
//!                         |
//!                         +----rollback--> RolledBack
//! ```
//!
//! Each session has exactly one transaction. A session dropped while its
//! transaction is active marks its connection broken; the pool discards it and
//! the store rolls the transaction back when the link closes.

use crate::db::params::{mysql_query, postgres_query, sqlite_query};
use crate::db::{DatabaseType, DbConnection, PooledConnection, RowToInstance};
use crate::entity::{
    EntityDefinition, EntityInstance, EntityRegistry, RelationKind, ResolvedRelationship, Value,
};
use crate::error::{OrmError, OrmResult};
use crate::session::cursor::{CursorTracker, QueryCursor, non_unique};
use crate::session::query::{
    Predicate, PreparedQuery, delete_sql, insert_sql, raw_sql, select_by_id_sql, update_sql,
};
use futures_util::future::{BoxFuture, FutureExt};
use futures_util::stream::{BoxStream, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Lifecycle of a session's transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    NotStarted,
    Active,
    Committed,
    RolledBack,
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not started"),
            Self::Active => write!(f, "active"),
            Self::Committed => write!(f, "committed"),
            Self::RolledBack => write!(f, "rolled back"),
        }
    }
}

/// Outcome of a statement that returns no rows.
struct Executed {
    rows_affected: u64,
    last_insert_id: Option<i64>,
}

fn decode_optional<R: RowToInstance>(
    result: Result<Option<R>, sqlx::Error>,
    definition: &EntityDefinition,
) -> OrmResult<Option<EntityInstance>> {
    match result {
        Ok(Some(row)) => row.to_instance(definition).map(Some),
        Ok(None) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// A unit of work bound to one checked-out connection.
pub struct Session {
    conn: Option<PooledConnection>,
    connection_id: u64,
    db_type: DatabaseType,
    registry: Arc<EntityRegistry>,
    state: TransactionState,
    cursors: CursorTracker,
    show_sql: bool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("connection_id", &self.connection_id)
            .field("db_type", &self.db_type)
            .field("state", &self.state)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Session {
    pub(crate) fn new(conn: PooledConnection, registry: Arc<EntityRegistry>) -> Self {
        Self {
            connection_id: conn.id(),
            db_type: conn.db_type(),
            show_sql: conn.show_sql(),
            conn: Some(conn),
            registry,
            state: TransactionState::NotStarted,
            cursors: CursorTracker::default(),
        }
    }

    /// Id of the bound pooled connection.
    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn db_type(&self) -> DatabaseType {
        self.db_type
    }

    pub fn transaction_state(&self) -> TransactionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.conn.is_none()
    }

    /// Number of cursors opened by this session that have not been released.
    pub fn open_cursors(&self) -> usize {
        self.cursors.open_count()
    }

    pub fn registry(&self) -> &Arc<EntityRegistry> {
        &self.registry
    }

    // =========================================================================
    // Transaction control
    // =========================================================================

    /// Start the session's transaction.
    pub async fn begin(&mut self) -> OrmResult<()> {
        if self.state != TransactionState::NotStarted {
            return Err(OrmError::transaction_state(format!(
                "cannot begin: transaction is {}",
                self.state
            )));
        }
        self.control("BEGIN").await?;
        self.state = TransactionState::Active;
        debug!(connection_id = self.connection_id, "Transaction started");
        Ok(())
    }

    /// Commit the active transaction.
    ///
    /// On failure the transaction stays active so that it can be rolled back.
    pub async fn commit(&mut self) -> OrmResult<()> {
        self.require_active("commit")?;
        self.control("COMMIT").await?;
        self.state = TransactionState::Committed;
        debug!(connection_id = self.connection_id, "Transaction committed");
        Ok(())
    }

    /// Roll back the active transaction.
    ///
    /// If the rollback itself fails, the connection is marked broken so the
    /// pool never hands out a link with an unknown transaction state.
    pub async fn rollback(&mut self) -> OrmResult<()> {
        self.require_active("roll back")?;
        let result = self.control("ROLLBACK").await;
        self.state = TransactionState::RolledBack;
        if let Err(e) = result {
            if let Some(conn) = self.conn.as_mut() {
                conn.mark_broken();
            }
            return Err(e);
        }
        debug!(connection_id = self.connection_id, "Transaction rolled back");
        Ok(())
    }

    fn require_active(&self, action: &str) -> OrmResult<()> {
        if self.state != TransactionState::Active {
            return Err(OrmError::transaction_state(format!(
                "cannot {}: transaction is {}",
                action, self.state
            )));
        }
        Ok(())
    }

    async fn control(&mut self, statement: &str) -> OrmResult<()> {
        self.log_sql(statement);
        let result = self.connection()?.execute_unprepared(statement).await;
        self.observe(result)
    }

    /// Release the connection back to the pool.
    ///
    /// An active transaction is rolled back first. Closing an already closed
    /// session is a no-op.
    pub async fn close(&mut self) -> OrmResult<()> {
        if self.conn.is_none() {
            debug!(connection_id = self.connection_id, "Session already closed");
            return Ok(());
        }

        let mut rollback_error = None;
        if self.state == TransactionState::Active {
            warn!(
                connection_id = self.connection_id,
                "Closing session with an active transaction, rolling back"
            );
            rollback_error = self.rollback().await.err();
        }

        let Some(mut conn) = self.conn.take() else {
            return Ok(());
        };
        if self.cursors.link_failed() {
            conn.mark_broken();
        }
        conn.release()?;
        debug!(connection_id = self.connection_id, "Session closed");

        match rollback_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // =========================================================================
    // Entity operations
    // =========================================================================

    /// Persist a new instance and return it with its identity.
    ///
    /// Fails with `InvalidInput` if the instance is already persisted, names a
    /// column the entity does not have, or leaves a non-nullable column unset.
    pub async fn insert(&mut self, instance: EntityInstance) -> OrmResult<EntityInstance> {
        let definition = self.registry.resolve(instance.entity())?;
        let mut instance = instance;

        if let Some(id) = instance.id() {
            return Err(OrmError::invalid_input(format!(
                "{} with id {} is already persisted",
                definition.name(),
                id
            )));
        }
        for column in instance.values().keys() {
            if !definition.has_column(column) {
                return Err(OrmError::invalid_input(format!(
                    "'{}' is not a column of '{}'",
                    column,
                    definition.name()
                )));
            }
        }

        let pk = definition.primary_key();
        let generated = definition.generated_identity();
        let explicit_id = instance.get(pk).filter(|v| !v.is_null()).cloned();
        match (generated, &explicit_id) {
            (true, Some(_)) => {
                return Err(OrmError::invalid_input(format!(
                    "Identity of '{}' is generated by the store and must not be set",
                    definition.name()
                )));
            }
            (false, None) => {
                return Err(OrmError::invalid_input(format!(
                    "Identity column '{}' of '{}' must be set",
                    pk,
                    definition.name()
                )));
            }
            _ => {}
        }

        let mut columns = Vec::new();
        let mut params = Vec::new();
        for column in definition.columns() {
            if generated && column.name == pk {
                continue;
            }
            match instance.get(&column.name) {
                Some(value) if !value.is_null() => {
                    columns.push(column.name.as_str());
                    params.push(value.clone());
                }
                _ if !column.nullable => {
                    return Err(OrmError::invalid_input(format!(
                        "Column '{}' of '{}' is not nullable",
                        column.name,
                        definition.name()
                    )));
                }
                _ => {}
            }
        }

        let sql = insert_sql(self.db_type, &definition, &columns);
        let started = Instant::now();
        let id = match explicit_id {
            Some(id) => {
                self.execute_statement(&sql, &params).await?;
                id
            }
            None if self.db_type == DatabaseType::PostgreSQL => {
                let column_type = definition
                    .primary_key_column()
                    .map(|c| c.column_type)
                    .ok_or_else(|| OrmError::internal("primary key column missing"))?;
                self.fetch_returning(&sql, &params, column_type).await?
            }
            None => {
                let executed = self.execute_statement(&sql, &params).await?;
                executed.last_insert_id.map(Value::Int).ok_or_else(|| {
                    OrmError::internal(format!(
                        "{} did not report a generated key",
                        self.db_type
                    ))
                })?
            }
        };

        instance.assign_identity(pk, id)?;
        debug!(
            entity = %definition.name(),
            id = ?instance.id(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Inserted instance"
        );
        Ok(instance)
    }

    /// Load the instance with the given identity, or fail with `NotFound`.
    pub async fn find_by_id(&mut self, entity: &str, id: impl Into<Value>) -> OrmResult<EntityInstance> {
        let definition = self.registry.resolve(entity)?;
        let id = id.into();
        self.find_optional(&definition, &id)
            .await?
            .ok_or_else(|| OrmError::not_found(definition.name(), &id))
    }

    async fn find_optional(
        &mut self,
        definition: &EntityDefinition,
        id: &Value,
    ) -> OrmResult<Option<EntityInstance>> {
        let sql = select_by_id_sql(self.db_type, definition);
        self.fetch_optional(definition, &sql, std::slice::from_ref(id))
            .await
    }

    /// Render a query over `entity` without running it.
    pub fn prepare(
        &self,
        entity: &str,
        predicate: Predicate,
        params: Vec<Value>,
    ) -> OrmResult<PreparedQuery> {
        let definition = self.registry.resolve(entity)?;
        PreparedQuery::new(self.db_type, definition, &predicate, params)
    }

    /// Run a prepared query, returning a lazy cursor over the matching instances.
    pub fn query<'a>(&'a mut self, prepared: &'a PreparedQuery) -> OrmResult<QueryCursor<'a>> {
        self.log_sql(prepared.sql());
        let tracker = self.cursors.clone();
        let definition = Arc::clone(prepared.entity());
        let conn = self.connection()?;

        let stream: BoxStream<'a, OrmResult<EntityInstance>> = crate::impl_conn_dispatch!(conn, {
            MySql(c) => {
                let definition = Arc::clone(&definition);
                mysql_query(prepared.sql(), prepared.params())
                    .fetch(c)
                    .map(move |row| row.map_err(OrmError::from).and_then(|row| row.to_instance(&definition)))
                    .boxed()
            },
            Postgres(c) => {
                let definition = Arc::clone(&definition);
                postgres_query(prepared.sql(), prepared.params())
                    .fetch(c)
                    .map(move |row| row.map_err(OrmError::from).and_then(|row| row.to_instance(&definition)))
                    .boxed()
            },
            SQLite(c) => {
                let definition = Arc::clone(&definition);
                sqlite_query(prepared.sql(), prepared.params())
                    .fetch(c)
                    .map(move |row| row.map_err(OrmError::from).and_then(|row| row.to_instance(&definition)))
                    .boxed()
            },
        });

        Ok(QueryCursor::new(definition.name(), stream, &tracker))
    }

    /// Run a query and collect every matching instance.
    pub async fn query_all(
        &mut self,
        entity: &str,
        predicate: Predicate,
        params: Vec<Value>,
    ) -> OrmResult<Vec<EntityInstance>> {
        let prepared = self.prepare(entity, predicate, params)?;
        self.collect(&prepared).await
    }

    /// Run a query expected to match at most one instance.
    ///
    /// Fails with `NonUniqueResult` if more than one row matches.
    pub async fn query_unique(
        &mut self,
        entity: &str,
        predicate: Predicate,
        params: Vec<Value>,
    ) -> OrmResult<Option<EntityInstance>> {
        let prepared = self.prepare(entity, predicate, params)?;
        let result = Self::read_unique(self.query(&prepared)?, entity).await;
        self.observe_cursor();
        result
    }

    async fn read_unique(mut cursor: QueryCursor<'_>, entity: &str) -> OrmResult<Option<EntityInstance>> {
        let first = cursor.next_instance().await?;
        if first.is_some() && cursor.next_instance().await?.is_some() {
            // Count the rest for the error message
            let mut count = 2;
            while cursor.next_instance().await?.is_some() {
                count += 1;
            }
            return Err(non_unique(entity, count));
        }
        Ok(first)
    }

    async fn collect(&mut self, prepared: &PreparedQuery) -> OrmResult<Vec<EntityInstance>> {
        let cursor = self.query(prepared)?;
        let result = cursor.collect_remaining().await;
        self.observe_cursor();
        result
    }

    /// Render the query for the instances related to `entity` `id` through `relationship`.
    ///
    /// The relationship target is resolved here; while it is not registered this
    /// fails with `UnresolvedRelationship`.
    pub async fn prepare_related(
        &mut self,
        entity: &str,
        relationship: &str,
        id: impl Into<Value>,
    ) -> OrmResult<PreparedQuery> {
        let resolved = self.registry.resolve_relationship(entity, relationship)?;
        let id = id.into();
        let filter = self.related_filter_value(&resolved, id).await?;
        PreparedQuery::new(
            self.db_type,
            Arc::clone(&resolved.target),
            &Predicate::eq(resolved.target_filter_column()),
            vec![filter],
        )
    }

    /// Load the instances related to `entity` `id` through `relationship`.
    pub async fn query_related(
        &mut self,
        entity: &str,
        relationship: &str,
        id: impl Into<Value>,
    ) -> OrmResult<Vec<EntityInstance>> {
        let prepared = self.prepare_related(entity, relationship, id).await?;
        self.collect(&prepared).await
    }

    /// Value to match on the target side of a relationship.
    async fn related_filter_value(&mut self, resolved: &ResolvedRelationship, id: Value) -> OrmResult<Value> {
        match resolved.relationship.kind {
            RelationKind::OneToMany => Ok(id),
            RelationKind::ManyToOne => {
                let source = self
                    .find_optional(&resolved.source, &id)
                    .await?
                    .ok_or_else(|| OrmError::not_found(resolved.source.name(), &id))?;
                Ok(source
                    .get(&resolved.relationship.foreign_key)
                    .cloned()
                    .unwrap_or(Value::Null))
            }
        }
    }

    /// Update columns of the instance with the given identity and return the
    /// reloaded instance.
    ///
    /// The identity itself cannot be changed.
    pub async fn update<I, K, V>(&mut self, entity: &str, id: impl Into<Value>, changes: I) -> OrmResult<EntityInstance>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        let definition = self.registry.resolve(entity)?;
        let id = id.into();
        let changes: Vec<(String, Value)> = changes
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();

        if changes.is_empty() {
            return Err(OrmError::invalid_input("No columns to update"));
        }
        for (column, value) in &changes {
            let Some(def) = definition.column(column) else {
                return Err(OrmError::invalid_input(format!(
                    "'{}' is not a column of '{}'",
                    column,
                    definition.name()
                )));
            };
            if column == definition.primary_key() {
                return Err(OrmError::invalid_input(format!(
                    "Identity of '{}' cannot be changed",
                    definition.name()
                )));
            }
            if value.is_null() && !def.nullable {
                return Err(OrmError::invalid_input(format!(
                    "Column '{}' of '{}' is not nullable",
                    column,
                    definition.name()
                )));
            }
        }

        let columns: Vec<&str> = changes.iter().map(|(c, _)| c.as_str()).collect();
        let sql = update_sql(self.db_type, &definition, &columns);
        let mut params: Vec<Value> = changes.iter().map(|(_, v)| v.clone()).collect();
        params.push(id.clone());

        let executed = self.execute_statement(&sql, &params).await?;
        if executed.rows_affected == 0 {
            return Err(OrmError::not_found(definition.name(), &id));
        }
        debug!(entity = %definition.name(), id = %id, columns = columns.len(), "Updated instance");
        self.find_by_id(entity, id).await
    }

    /// Delete the instance with the given identity, or fail with `NotFound`.
    ///
    /// One-to-many relationships declared with cascade delete have their
    /// related rows deleted first, recursively, in the current transaction.
    pub async fn delete(&mut self, entity: &str, id: impl Into<Value>) -> OrmResult<()> {
        let definition = self.registry.resolve(entity)?;
        let id = id.into();
        if self.find_optional(&definition, &id).await?.is_none() {
            return Err(OrmError::not_found(definition.name(), &id));
        }
        self.delete_cascading(definition, id).await
    }

    fn delete_cascading(&mut self, definition: Arc<EntityDefinition>, id: Value) -> BoxFuture<'_, OrmResult<()>> {
        async move {
            for relationship in definition.relationships() {
                if relationship.kind != RelationKind::OneToMany || !relationship.cascade_delete {
                    continue;
                }
                let resolved = self
                    .registry
                    .resolve_relationship(definition.name(), &relationship.name)?;
                let children = PreparedQuery::new(
                    self.db_type,
                    Arc::clone(&resolved.target),
                    &Predicate::eq(resolved.target_filter_column()),
                    vec![id.clone()],
                )?;
                for child in self.collect(&children).await? {
                    if let Some(child_id) = child.id().cloned() {
                        self.delete_cascading(Arc::clone(&resolved.target), child_id)
                            .await?;
                    }
                }
            }

            let sql = delete_sql(self.db_type, &definition, definition.primary_key());
            let executed = self.execute_statement(&sql, std::slice::from_ref(&id)).await?;
            if executed.rows_affected == 0 {
                return Err(OrmError::not_found(definition.name(), &id));
            }
            debug!(entity = %definition.name(), id = %id, "Deleted instance");
            Ok(())
        }
        .boxed()
    }

    /// Run a raw statement with `?` placeholders and return the affected row count.
    pub async fn execute(&mut self, sql: &str, params: &[Value]) -> OrmResult<u64> {
        let sql = raw_sql(self.db_type, sql, params)?;
        Ok(self.execute_statement(&sql, params).await?.rows_affected)
    }

    // =========================================================================
    // Statement plumbing
    // =========================================================================

    fn connection(&mut self) -> OrmResult<&mut DbConnection> {
        match self.conn.as_mut() {
            Some(conn) => conn.connection(),
            None => Err(OrmError::invalid_input(format!(
                "Session on connection {} is closed",
                self.connection_id
            ))),
        }
    }

    fn log_sql(&self, sql: &str) {
        if self.show_sql {
            info!(connection_id = self.connection_id, sql = %sql, "Executing statement");
        } else {
            debug!(connection_id = self.connection_id, sql = %sql, "Executing statement");
        }
    }

    /// Mark the connection broken when `result` is a link failure.
    fn observe<T>(&mut self, result: OrmResult<T>) -> OrmResult<T> {
        if let Err(e) = &result {
            if e.is_connection_broken() {
                if let Some(conn) = self.conn.as_mut() {
                    conn.mark_broken();
                }
            }
        }
        result
    }

    fn observe_cursor(&mut self) {
        if self.cursors.link_failed() {
            if let Some(conn) = self.conn.as_mut() {
                conn.mark_broken();
            }
        }
    }

    async fn execute_statement(&mut self, sql: &str, params: &[Value]) -> OrmResult<Executed> {
        self.log_sql(sql);
        let conn = self.connection()?;
        let result = crate::impl_conn_dispatch!(conn, {
            MySql(c) => mysql_query(sql, params).execute(c).await.map(|r| Executed {
                rows_affected: r.rows_affected(),
                last_insert_id: i64::try_from(r.last_insert_id()).ok(),
            }),
            Postgres(c) => postgres_query(sql, params).execute(c).await.map(|r| Executed {
                rows_affected: r.rows_affected(),
                last_insert_id: None,
            }),
            SQLite(c) => sqlite_query(sql, params).execute(c).await.map(|r| Executed {
                rows_affected: r.rows_affected(),
                last_insert_id: Some(r.last_insert_rowid()),
            }),
        })
        .map_err(OrmError::from);
        self.observe(result)
    }

    async fn fetch_optional(
        &mut self,
        definition: &EntityDefinition,
        sql: &str,
        params: &[Value],
    ) -> OrmResult<Option<EntityInstance>> {
        self.log_sql(sql);
        let conn = self.connection()?;
        let result = crate::impl_conn_dispatch!(conn, {
            MySql(c) => decode_optional(mysql_query(sql, params).fetch_optional(c).await, definition),
            Postgres(c) => decode_optional(postgres_query(sql, params).fetch_optional(c).await, definition),
            SQLite(c) => decode_optional(sqlite_query(sql, params).fetch_optional(c).await, definition),
        });
        self.observe(result)
    }

    /// Run an `INSERT ... RETURNING` and decode the returned key.
    async fn fetch_returning(
        &mut self,
        sql: &str,
        params: &[Value],
        column_type: crate::entity::ColumnType,
    ) -> OrmResult<Value> {
        self.log_sql(sql);
        let conn = self.connection()?;
        let result = match conn {
            DbConnection::Postgres(c) => match postgres_query(sql, params).fetch_one(c).await {
                Ok(row) => row.decode_value(0, column_type),
                Err(e) => Err(e.into()),
            },
            other => Err(OrmError::internal(format!(
                "RETURNING is not used on {}",
                other.db_type()
            ))),
        };
        self.observe(result)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let Some(conn) = self.conn.as_mut() else {
            return;
        };
        if self.state == TransactionState::Active {
            warn!(
                connection_id = self.connection_id,
                "Session dropped with an active transaction, discarding connection"
            );
            conn.mark_broken();
        } else if self.cursors.link_failed() {
            conn.mark_broken();
        }
        // The pooled connection returns itself when dropped
    }
}
