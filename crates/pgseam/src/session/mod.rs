//! The session engine.
//!
//! A [`Session`] is a database handle plus accumulated conditions. Builder
//! methods return a new session and never touch the receiver; terminal
//! methods run SQL and return a session carrying the outcome:
//!
//! ```ignore
//! let mut user = User::default();
//! let found = session.where_(clause!("name = ?", "jinzhu")).first(&mut user, &[]).await;
//! if found.record_not_found() { /* ... */ }
//! if let Some(err) = found.error() { /* ... */ }
//! ```
//!
//! Errors accumulate down a chain: a session derived from one that failed
//! still reports the failure, and its terminal methods do not run (except
//! `commit` and `rollback`).

mod exec;
mod query;
mod schema;
mod tx;
mod write;

#[cfg(test)]
mod tests;

use crate::association::JoinTableHandler;
use crate::callbacks::Callbacks;
use crate::client::Connection;
use crate::clause::Clause;
use crate::config::{Config, LogMode};
use crate::context::Context;
use crate::dialect::{Dialect, Postgres};
use crate::error::{OrmError, OrmResult};
use crate::model::{Model, TableSchema, model_record, schema_of};
use crate::monitor::{LoggingMonitor, QueryMonitor};
use crate::scope::Scope;
use crate::search::{Preload, Search};
use crate::sql::Sql;
use crate::value::{Record, is_blank, to_record};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// State shared by every session derived from one `open`.
pub(crate) struct Root {
    pub connection: Connection,
    pub dialect: Arc<dyn Dialect>,
    pub callbacks: Arc<Callbacks>,
    logger: RwLock<Arc<dyn QueryMonitor>>,
    singular_table: AtomicBool,
    join_tables: RwLock<HashMap<(String, String), Arc<dyn JoinTableHandler>>>,
    pub config: Config,
}

impl Root {
    pub(crate) fn logger(&self) -> Arc<dyn QueryMonitor> {
        self.logger
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn singular(&self) -> bool {
        self.singular_table.load(Ordering::Relaxed)
    }
}

/// Error list and row count of the last terminal operation.
#[derive(Debug, Clone, Default)]
pub(crate) struct Outcome {
    pub errors: Vec<OrmError>,
    pub rows_affected: u64,
}

/// A database handle plus accumulated query conditions.
#[derive(Clone)]
pub struct Session {
    pub(crate) root: Arc<Root>,
    pub(crate) conn: Connection,
    pub(crate) search: Search,
    pub(crate) outcome: Outcome,
    pub(crate) settings: BTreeMap<String, Value>,
    pub(crate) value: Option<Record>,
    pub(crate) meta: Option<TableSchema>,
    pub(crate) log_mode: LogMode,
    pub(crate) block_global_update: bool,
    pub(crate) context: Context,
    /// Set for `update_column(s)`: no callbacks, no `updated_at`.
    pub(crate) skip_callbacks: bool,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("conn", &self.conn)
            .field("search", &self.search)
            .field("errors", &self.outcome.errors)
            .field("rows_affected", &self.outcome.rows_affected)
            .field("settings", &self.settings)
            .field("log_mode", &self.log_mode)
            .finish()
    }
}

impl Session {
    pub(crate) fn new(connection: Connection, config: Config) -> Self {
        let root = Arc::new(Root {
            connection: connection.clone(),
            dialect: Arc::new(Postgres),
            callbacks: Arc::new(Callbacks::new()),
            logger: RwLock::new(Arc::new(LoggingMonitor::new())),
            singular_table: AtomicBool::new(config.singular_table),
            join_tables: RwLock::new(HashMap::new()),
            config,
        });
        Self {
            conn: connection,
            search: Search::default(),
            outcome: Outcome::default(),
            settings: BTreeMap::new(),
            value: None,
            meta: None,
            log_mode: root.config.log_mode,
            block_global_update: root.config.block_global_update,
            context: Context::default(),
            skip_callbacks: false,
            root,
        }
    }

    /// A copy for the next chain step: errors are kept, the row count is not.
    pub(crate) fn derive(&self) -> Self {
        let mut s = self.clone();
        s.outcome.rows_affected = 0;
        s.skip_callbacks = false;
        s
    }

    fn with(&self, f: impl FnOnce(&mut Self)) -> Self {
        let mut s = self.derive();
        f(&mut s);
        s
    }

    pub(crate) fn push_error(&mut self, err: OrmError) {
        match err {
            OrmError::Multiple(errors) => self.outcome.errors.extend(errors),
            err => self.outcome.errors.push(err),
        }
    }

    pub(crate) fn has_errors(&self) -> bool {
        !self.outcome.errors.is_empty()
    }

    fn checked(&self, clause: Clause, f: impl FnOnce(&mut Search, Clause)) -> Self {
        let mut s = self.derive();
        if let Some(e) = clause.error() {
            s.push_error(e.clone());
        }
        f(&mut s.search, clause);
        s
    }

    // -- outcome --

    pub fn with_context(&self, context: Context) -> Self {
        self.with(|s| s.context = context)
    }

    /// The model value, or the last record written or read.
    pub fn value(&self) -> Option<Record> {
        self.value.clone()
    }

    /// All errors combined (`OrmError::Multiple` when there are several).
    pub fn error(&self) -> Option<OrmError> {
        OrmError::combine(&self.outcome.errors)
    }

    pub fn rows_affected(&self) -> u64 {
        self.outcome.rows_affected
    }

    pub fn get_errors(&self) -> Vec<OrmError> {
        self.outcome.errors.clone()
    }

    /// Record an error on this session and hand it back.
    pub fn add_error(&mut self, err: OrmError) -> OrmError {
        if !err.is_not_found() {
            tracing::debug!(target: "pgseam", error = %err, "session error");
        }
        self.push_error(err.clone());
        err
    }

    pub fn record_not_found(&self) -> bool {
        self.outcome.errors.iter().any(OrmError::is_not_found)
    }

    pub fn new_record<T: Model>(&self, value: &T) -> bool {
        model_record(value)
            .map(|r| r.get(T::PRIMARY_KEY).is_none_or(is_blank))
            .unwrap_or(true)
    }

    // -- handle --

    /// A session on the same connection with no conditions, settings, value or errors.
    pub fn new_session(&self) -> Self {
        let mut s = self.clone();
        s.search = Search::default();
        s.outcome = Outcome::default();
        s.settings.clear();
        s.value = None;
        s.meta = None;
        s.skip_callbacks = false;
        s
    }

    pub fn close(&self) -> OrmResult<()> {
        self.conn.close()
    }

    pub fn db(&self) -> Option<deadpool_postgres::Pool> {
        self.conn.pool().cloned()
    }

    pub fn common_db(&self) -> Connection {
        self.conn.clone()
    }

    pub fn dialect(&self) -> Arc<dyn Dialect> {
        self.root.dialect.clone()
    }

    pub fn callback(&self) -> Arc<Callbacks> {
        self.root.callbacks.clone()
    }

    /// Replace the statement logger for every session of this root.
    pub fn set_logger(&self, logger: Arc<dyn QueryMonitor>) {
        *self.root.logger.write().unwrap_or_else(PoisonError::into_inner) = logger;
    }

    /// `true` logs every statement, `false` none.
    pub fn log_mode(&self, enable: bool) -> Self {
        self.with(|s| s.log_mode = LogMode::from_flag(enable))
    }

    pub fn debug(&self) -> Self {
        self.log_mode(true)
    }

    /// Refuse `update`/`delete` without conditions.
    pub fn block_global_update(&self, enable: bool) -> Self {
        self.with(|s| s.block_global_update = enable)
    }

    pub fn has_block_global_update(&self) -> bool {
        self.block_global_update
    }

    /// Use singular table names for every session of this root.
    pub fn singular_table(&self, enable: bool) {
        self.root.singular_table.store(enable, Ordering::Relaxed);
    }

    // -- conditions --

    pub fn where_(&self, query: impl Into<Clause>) -> Self {
        self.checked(query.into(), |search, c| search.wheres.push(c))
    }

    pub fn or(&self, query: impl Into<Clause>) -> Self {
        self.checked(query.into(), |search, c| search.ors.push(c))
    }

    pub fn not(&self, query: impl Into<Clause>) -> Self {
        self.checked(query.into(), |search, c| search.nots.push(c))
    }

    /// A negative limit removes it.
    pub fn limit(&self, limit: i64) -> Self {
        self.with(|s| s.search.set_limit(limit))
    }

    /// A negative offset removes it.
    pub fn offset(&self, offset: i64) -> Self {
        self.with(|s| s.search.set_offset(offset))
    }

    /// Append an ORDER BY term; `reorder` discards earlier ones.
    pub fn order(&self, value: impl Into<Clause>, reorder: bool) -> Self {
        self.checked(value.into(), |search, c| {
            if reorder {
                search.orders.clear();
            }
            search.orders.push(c);
        })
    }

    pub fn select(&self, query: impl Into<Clause>) -> Self {
        self.checked(query.into(), |search, c| search.select = Some(c))
    }

    /// Columns left out of INSERT and UPDATE statements.
    pub fn omit(&self, columns: &[&str]) -> Self {
        self.with(|s| s.search.omits.extend(columns.iter().map(|c| c.to_string())))
    }

    pub fn group(&self, query: &str) -> Self {
        self.with(|s| s.search.group = Some(query.to_string()))
    }

    pub fn having(&self, query: impl Into<Clause>) -> Self {
        self.checked(query.into(), |search, c| search.havings.push(c))
    }

    pub fn joins(&self, query: impl Into<Clause>) -> Self {
        self.checked(query.into(), |search, c| search.joins.push(c))
    }

    /// Apply reusable query functions in order.
    pub fn scopes<I, F>(&self, funcs: I) -> Self
    where
        I: IntoIterator<Item = F>,
        F: FnOnce(Self) -> Self,
    {
        funcs.into_iter().fold(self.derive(), |s, f| f(s))
    }

    /// Include soft-deleted rows and hard-delete.
    pub fn unscoped(&self) -> Self {
        self.with(|s| s.search.unscoped = true)
    }

    /// Attributes assigned by `first_or_init`/`first_or_create` whether or not a row is found.
    pub fn assign<T: Serialize + ?Sized>(&self, attrs: &T) -> Self {
        let mut s = self.derive();
        match to_record(attrs) {
            Ok(record) => s.search.assign_attrs.push(record),
            Err(e) => s.push_error(e),
        }
        s
    }

    /// Attributes used by `first_or_init`/`first_or_create` only when no row is found.
    pub fn attrs<T: Serialize + ?Sized>(&self, attrs: &T) -> Self {
        let mut s = self.derive();
        match to_record(attrs) {
            Ok(record) => s.search.init_attrs.push(record),
            Err(e) => s.push_error(e),
        }
        s
    }

    /// Run raw SQL for the next reader (`scan`, `rows`, `row`, `count`...).
    pub fn raw(&self, sql: impl Into<Clause>) -> Self {
        self.checked(sql.into(), |search, c| search.raw = Some(c))
    }

    /// Target a model: its table, and its primary key as a condition.
    ///
    /// A bare [`Record`] keeps the current table metadata.
    pub fn model<T: Model>(&self, value: &T) -> Self {
        let mut s = self.derive();
        match model_record(value) {
            Ok(record) => s.value = Some(record),
            Err(e) => s.push_error(e),
        }
        if let Some(schema) = schema_of::<T>() {
            s.meta = Some(schema);
        }
        s
    }

    /// Target a table by name; clears the model value.
    pub fn table(&self, name: &str) -> Self {
        self.with(|s| {
            s.search.table = Some(name.to_string());
            s.value = None;
            s.meta = None;
        })
    }

    /// Load `column` of every result with a second query.
    pub fn preload(&self, column: &str, conditions: &[Clause]) -> Self {
        let mut s = self.derive();
        for c in conditions {
            if let Some(e) = c.error() {
                s.push_error(e.clone());
            }
        }
        s.search.preloads.push(Preload {
            column: column.to_string(),
            conditions: conditions.to_vec(),
        });
        s
    }

    // -- settings --

    /// A new session with `name` set.
    pub fn set(&self, name: &str, value: Value) -> Self {
        self.with(|s| {
            s.settings.insert(name.to_string(), value);
        })
    }

    /// Set `name` on this session in place. Unlike every other builder this
    /// mutates the receiver; sessions already derived from it keep their copy.
    pub fn instant_set(&mut self, name: &str, value: Value) -> &mut Self {
        self.settings.insert(name.to_string(), value);
        self
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.settings.get(name).cloned()
    }

    pub(crate) fn setting_str(&self, name: &str) -> Option<&str> {
        self.settings.get(name).and_then(Value::as_str)
    }

    // -- associations --

    pub fn set_join_table_handler<T: Model>(&self, column: &str, handler: Arc<dyn JoinTableHandler>) {
        self.root
            .join_tables
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((T::NAME.to_string(), column.to_string()), handler);
    }

    /// Handler registered for `column` of the model named `owner`.
    pub fn join_table_handler(&self, owner: &str, column: &str) -> Option<Arc<dyn JoinTableHandler>> {
        self.root
            .join_tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(owner.to_string(), column.to_string()))
            .cloned()
    }

    pub fn model_meta(&self) -> Option<TableSchema> {
        self.meta.clone()
    }

    // -- rendering --

    /// Table the next statement targets.
    pub fn table_name(&self) -> OrmResult<String> {
        Scope::table_name(self)
    }

    /// The SELECT the next reader would run, for sub-queries and inspection.
    pub fn query_expr(&self) -> OrmResult<Sql> {
        let table = self.table_name()?;
        self.search
            .select_sql(&self.target(&table), self.setting_str("orm:query_option"))
    }
}

impl Scope for Session {
    fn search(&self) -> &Search {
        &self.search
    }

    fn search_mut(&mut self) -> &mut Search {
        &mut self.search
    }

    fn table_schema(&self) -> Option<&TableSchema> {
        self.meta.as_ref()
    }

    fn set_table_schema(&mut self, meta: TableSchema) {
        self.meta = Some(meta);
    }

    fn current_value(&self) -> Option<&Record> {
        self.value.as_ref()
    }

    fn set_current_value(&mut self, value: Record) {
        self.value = Some(value);
    }

    fn singular(&self) -> bool {
        self.root.singular()
    }

    fn blocks_global_update(&self) -> bool {
        self.block_global_update
    }

    fn push_error(&mut self, err: OrmError) {
        Session::push_error(self, err);
    }
}
