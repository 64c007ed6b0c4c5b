//! `FakeDb`: an in-memory [`Orm`] for unit tests of code written against the
//! contract trait.
//!
//! Tables are `Vec<Record>`s shared by every handle derived from one
//! `FakeDb::new()`. Conditions are evaluated in memory; SQL the double cannot
//! interpret (joins, functions, raw reads without a scripted result) records
//! [`OrmError::Unsupported`] instead of guessing.
//!
//! ```ignore
//! let db = FakeDb::new();
//! db.seed("users", [json!({ "id": 1, "name": "jinzhu" })])?;
//!
//! let mut user = User::default();
//! let found = db.where_(Clause::eq("name", "jinzhu")).first(&mut user, &[]).await;
//! assert!(found.error().is_none());
//! assert_eq!(db.calls_to("first").len(), 1);
//!
//! db.fail_next(OrmError::Timeout(Duration::from_secs(1)));
//! assert!(db.create(&mut user).await.error().is_some());
//! ```

mod eval;


use crate::association::{ChildQuery, JoinTableHandler, Relation, preload_records};
use crate::callbacks::{Callbacks, Operation};
use crate::clause::Clause;
use crate::client::Connection;
use crate::config::LogMode;
use crate::context::Context;
use crate::cursor::{ColumnType, Row, Rows};
use crate::dialect::{Dialect, Postgres};
use crate::error::{OrmError, OrmResult};
use crate::interface::Orm;
use crate::model::{
    CREATED_AT, DELETED_AT, Destination, Model, TableRef, TableSchema, UPDATED_AT, merge_into,
    model_record, schema_of,
};
use crate::monitor::{LoggingMonitor, QueryContext, QueryMonitor, QueryResult};
use crate::scope::Scope;
use crate::search::{Preload, Search, Target};
use crate::value::{Record, from_record, is_blank, now_value, to_record};
use async_trait::async_trait;
use deadpool_postgres::Pool;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

/// One journaled call: the method name and its arguments as JSON.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Call {
    pub method: &'static str,
    pub args: Value,
}

#[derive(Debug, Clone, Default)]
struct Store {
    tables: BTreeMap<String, Vec<Record>>,
}

#[derive(Default)]
struct Script {
    failures: VecDeque<OrmError>,
    raw_results: VecDeque<Vec<Record>>,
    exec_results: VecDeque<u64>,
}

/// State shared by every handle of one `FakeDb::new()`.
struct Shared {
    store: Mutex<Store>,
    calls: Mutex<Vec<Call>>,
    script: Mutex<Script>,
    callbacks: Arc<Callbacks>,
    logger: RwLock<Arc<dyn QueryMonitor>>,
    singular_table: AtomicBool,
    join_tables: RwLock<HashMap<(String, String), Arc<dyn JoinTableHandler>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A transaction: the store as it was at `begin`.
struct FakeTx {
    snapshot: Store,
    finished: AtomicBool,
}

/// What a statement reports to callbacks and the logger.
trait Tally {
    fn tally(&self) -> QueryResult;
}

impl Tally for Vec<Record> {
    fn tally(&self) -> QueryResult {
        QueryResult::Rows(self.len())
    }
}

impl Tally for u64 {
    fn tally(&self) -> QueryResult {
        QueryResult::Affected(*self)
    }
}

impl Tally for Record {
    fn tally(&self) -> QueryResult {
        QueryResult::Rows(1)
    }
}

/// In-memory test double for [`Orm`].
#[derive(Clone)]
pub struct FakeDb {
    shared: Arc<Shared>,
    search: Search,
    errors: Vec<OrmError>,
    rows_affected: u64,
    settings: BTreeMap<String, Value>,
    value: Option<Record>,
    meta: Option<TableSchema>,
    log_mode: LogMode,
    block_global_update: bool,
    context: Context,
    skip_callbacks: bool,
    tx: Option<Arc<FakeTx>>,
}

impl fmt::Debug for FakeDb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FakeDb")
            .field("search", &self.search)
            .field("errors", &self.errors)
            .field("rows_affected", &self.rows_affected)
            .field("in_transaction", &self.tx.is_some())
            .finish()
    }
}

impl Default for FakeDb {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeDb {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                store: Mutex::new(Store::default()),
                calls: Mutex::new(Vec::new()),
                script: Mutex::new(Script::default()),
                callbacks: Arc::new(Callbacks::new()),
                logger: RwLock::new(Arc::new(LoggingMonitor::new())),
                singular_table: AtomicBool::new(false),
                join_tables: RwLock::new(HashMap::new()),
            }),
            search: Search::default(),
            errors: Vec::new(),
            rows_affected: 0,
            settings: BTreeMap::new(),
            value: None,
            meta: None,
            log_mode: LogMode::Default,
            block_global_update: false,
            context: Context::default(),
            skip_callbacks: false,
            tx: None,
        }
    }

    // -- test setup and inspection --

    /// Append rows to `table`, creating it when missing.
    pub fn seed<T: Serialize>(&self, table: &str, rows: impl IntoIterator<Item = T>) -> OrmResult<()> {
        let records = rows
            .into_iter()
            .map(|row| to_record(&row))
            .collect::<OrmResult<Vec<_>>>()?;
        lock(&self.shared.store)
            .tables
            .entry(table.to_string())
            .or_default()
            .extend(records);
        Ok(())
    }

    /// Append models to their table.
    pub fn seed_models<T: Model>(&self, rows: &[T]) -> OrmResult<()> {
        let table = TableSchema::of::<T>().table_name(self.singular());
        let records = rows.iter().map(model_record).collect::<OrmResult<Vec<_>>>()?;
        self.seed(&table, records)
    }

    /// Current contents of `table` (empty when it does not exist).
    pub fn table_rows(&self, table: &str) -> Vec<Record> {
        lock(&self.shared.store)
            .tables
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    /// Every journaled call, oldest first.
    pub fn calls(&self) -> Vec<Call> {
        lock(&self.shared.calls).clone()
    }

    pub fn calls_to(&self, method: &str) -> Vec<Call> {
        lock(&self.shared.calls)
            .iter()
            .filter(|c| c.method == method)
            .cloned()
            .collect()
    }

    pub fn clear_calls(&self) {
        lock(&self.shared.calls).clear();
    }

    /// Make the next terminal operation record `err` without running.
    pub fn fail_next(&self, err: OrmError) {
        lock(&self.shared.script).failures.push_back(err);
    }

    /// Rows returned by the next raw read (`raw(...)` followed by `scan`,
    /// `find`, `row`, `rows`, `pluck` or `count`).
    pub fn push_raw_result<T: Serialize>(&self, rows: impl IntoIterator<Item = T>) -> OrmResult<()> {
        let records = rows
            .into_iter()
            .map(|row| to_record(&row))
            .collect::<OrmResult<Vec<_>>>()?;
        lock(&self.shared.script).raw_results.push_back(records);
        Ok(())
    }

    /// Rows affected reported by the next `exec`; unscripted calls report 0.
    pub fn push_exec_result(&self, rows_affected: u64) {
        lock(&self.shared.script).exec_results.push_back(rows_affected);
    }

    // -- chain plumbing --

    fn journal(&self, method: &'static str, args: Value) {
        lock(&self.shared.calls).push(Call { method, args });
    }

    fn derive(&self) -> Self {
        let mut s = self.clone();
        s.rows_affected = 0;
        s.skip_callbacks = false;
        s
    }

    fn with(&self, method: &'static str, args: Value, f: impl FnOnce(&mut Self)) -> Self {
        self.journal(method, args);
        let mut s = self.derive();
        f(&mut s);
        s
    }

    fn checked(&self, method: &'static str, clause: Clause, f: impl FnOnce(&mut Search, Clause)) -> Self {
        self.journal(method, clause.describe());
        let mut s = self.derive();
        if let Some(e) = clause.error() {
            s.push_error(e.clone());
        }
        f(&mut s.search, clause);
        s
    }

    fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Whether a terminal operation may run: earlier errors and scripted
    /// failures stop it (the scripted failure is recorded).
    fn gate(&mut self) -> bool {
        if self.has_errors() {
            return false;
        }
        let scripted = lock(&self.shared.script).failures.pop_front();
        match scripted {
            Some(err) => {
                self.push_error(err);
                false
            }
            None => true,
        }
    }

    fn logger(&self) -> Arc<dyn QueryMonitor> {
        self.shared
            .logger
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Run one in-memory statement with callbacks and logging around it.
    fn run<R: Tally>(&self, operation: Operation, table: &str, f: impl FnOnce() -> OrmResult<R>) -> OrmResult<R> {
        let mut ctx = QueryContext::new(operation, &format!("{operation} {table}"), 0);
        if !table.is_empty() {
            ctx = ctx.with_table(table);
        }
        if let Some(tag) = self.context.tag() {
            ctx = ctx.with_tag(tag);
        }
        ctx.settings = self.settings.clone();
        if !self.skip_callbacks {
            self.shared.callbacks.run_before(&mut ctx)?;
        }

        let result = f();
        let summary = match &result {
            Ok(r) => r.tally(),
            Err(e) if e.is_not_found() => QueryResult::NotFound,
            Err(e) => QueryResult::error(e.to_string()),
        };
        tracing::trace!(target: "pgseam.fake", %operation, table, result = %summary, "fake statement");
        if !self.skip_callbacks {
            self.shared.callbacks.run_after(&ctx, Duration::ZERO, &summary);
        }
        let logged = match self.log_mode {
            LogMode::Detailed => true,
            LogMode::Default => summary.is_error(),
            LogMode::Silent => false,
        };
        if logged {
            self.logger().on_query_complete(&ctx, Duration::ZERO, &summary);
        }
        result
    }

    // -- reads --

    fn scripted_rows(&self) -> OrmResult<Vec<Record>> {
        lock(&self.shared.script).raw_results.pop_front().ok_or_else(|| {
            OrmError::Unsupported("raw query without a scripted result (push_raw_result)".into())
        })
    }

    fn matching(&self, table: &str) -> OrmResult<Vec<Record>> {
        let target = self.target(table);
        let store = lock(&self.shared.store);
        let mut out = Vec::new();
        for record in store.tables.get(table).into_iter().flatten() {
            if eval::matches(&self.search, &target, record)? {
                out.push(record.clone());
            }
        }
        Ok(out)
    }

    fn unsupported_parts(&self) -> OrmResult<()> {
        if !self.search.joins.is_empty() || !self.search.havings.is_empty() {
            return Err(OrmError::Unsupported("FakeDb cannot evaluate joins or having".into()));
        }
        Ok(())
    }

    /// Rows a reader returns: scripted rows for raw SQL, otherwise the
    /// filtered, sorted and paginated table.
    fn select_rows(&self, table: &str) -> OrmResult<Vec<Record>> {
        let mut rows = if self.search.raw.is_some() {
            self.scripted_rows()?
        } else {
            self.unsupported_parts()?;
            if self.search.group.is_some() {
                return Err(OrmError::Unsupported("FakeDb cannot group rows".into()));
            }
            let mut rows = self.matching(table)?;
            eval::sort(&mut rows, &self.search.orders)?;
            rows
        };
        let offset = self.search.offset.unwrap_or(0).max(0) as usize;
        let limit = self.search.limit.map_or(usize::MAX, |n| n.max(0) as usize);
        rows = rows.into_iter().skip(offset).take(limit).collect();
        if let (Some(select), None) = (&self.search.select, &self.search.raw) {
            eval::project(&mut rows, select)?;
        }
        Ok(rows)
    }

    fn fetch_children(&self, query: ChildQuery) -> OrmResult<Vec<Record>> {
        let mut search = Search::default();
        search.wheres.push(Clause::in_list(&query.column, query.keys));
        search.wheres.extend(query.conditions);
        let target = Target {
            table: &query.table,
            primary_key: "id",
            soft_delete: false,
            key: None,
        };
        let store = lock(&self.shared.store);
        let mut out = Vec::new();
        for record in store.tables.get(&query.table).into_iter().flatten() {
            if eval::matches(&search, &target, record)? {
                out.push(record.clone());
            }
        }
        Ok(out)
    }

    async fn apply_preloads(&self, records: &mut [Record]) -> OrmResult<()> {
        if self.search.preloads.is_empty() || records.is_empty() {
            return Ok(());
        }
        let owner = self
            .meta
            .clone()
            .ok_or_else(|| OrmError::validation("preload needs a model destination"))?;
        let preloads: Vec<Preload> = self.search.preloads.clone();
        for preload in &preloads {
            let handler = self.join_table_handler(&owner.name, &preload.column);
            let relation = Relation::resolve(&owner, records.first(), &preload.column, None, handler);
            preload_records(records, &owner, preload, relation, |query| {
                std::future::ready(self.fetch_children(query))
            })
            .await?;
        }
        Ok(())
    }

    async fn fill<D: Destination>(&mut self, out: &mut D) {
        let operation = if self.search.raw.is_some() {
            Operation::RowQuery
        } else {
            Operation::Query
        };
        let loaded = match self.table_name() {
            Ok(table) => self.run(operation, &table, || self.select_rows(&table)),
            Err(e) => Err(e),
        };
        let mut records = match loaded {
            Ok(records) => records,
            Err(e) => return self.push_error(e),
        };
        if let Err(e) = self.apply_preloads(&mut records).await {
            return self.push_error(e);
        }
        self.rows_affected = records.len() as u64;
        if D::SINGLE && records.is_empty() {
            return self.push_error(OrmError::RecordNotFound);
        }
        if let Err(e) = out.fill(records) {
            self.push_error(e);
        }
    }

    async fn find_one<T: Model>(&self, out: &mut T, conditions: &[Clause], direction: Option<&str>) -> Self {
        let mut s = self.derive();
        if !s.gate() {
            return s;
        }
        if let Some(schema) = schema_of::<T>() {
            s.meta = Some(schema);
        }
        match model_record(&*out) {
            Ok(record) => s.value = Some(record),
            Err(e) => {
                s.push_error(e);
                return s;
            }
        }
        s.add_conditions(conditions);
        s.search.set_limit(1);
        if let Some(direction) = direction {
            let order = format!("{} {direction}", s.primary_key());
            s.search.orders.push(Clause::raw(order));
        }
        s.fill(out).await;
        s
    }

    fn only_not_found(&self) -> bool {
        !self.errors.is_empty() && self.errors.iter().all(OrmError::is_not_found)
    }

    // -- writes --

    fn unique_columns(&self) -> Vec<String> {
        self.meta
            .iter()
            .flat_map(|m| m.fields.iter())
            .filter(|f| f.unique || f.unique_index)
            .map(|f| f.name.clone())
            .collect()
    }

    /// Store a new row, generating a blank primary key.
    fn insert_row(&self, table: &str, mut record: Record) -> OrmResult<Record> {
        let pk = self.primary_key().to_string();
        let unique = self.unique_columns();
        let mut store = lock(&self.shared.store);
        let rows = store.tables.entry(table.to_string()).or_default();
        match record.get(&pk).cloned() {
            Some(Value::String(key)) if key.is_empty() => {
                record.insert(pk.clone(), Value::String(uuid::Uuid::new_v4().to_string()));
            }
            Some(key) if !is_blank(&key) => {}
            _ => {
                let next = rows
                    .iter()
                    .filter_map(|r| r.get(&pk).and_then(Value::as_i64))
                    .max()
                    .unwrap_or(0)
                    + 1;
                record.insert(pk.clone(), json!(next));
            }
        }
        for column in std::iter::once(&pk).chain(&unique) {
            let Some(value) = record.get(column).filter(|v| !v.is_null()) else {
                continue;
            };
            if rows.iter().any(|r| r.get(column).is_some_and(|v| eval::loose_eq(v, value))) {
                return Err(OrmError::UniqueViolation(format!(
                    "duplicate key value ({column})=({value}) in {table}"
                )));
            }
        }
        rows.push(record.clone());
        Ok(record)
    }

    fn insert<T: Model>(&mut self, value: &mut T) -> OrmResult<()> {
        let mut record = self.target_model(value)?;
        let now = now_value();
        for column in [CREATED_AT, UPDATED_AT] {
            if self.has_column(&record, column) && record.get(column).is_none_or(is_blank) {
                record.insert(column.to_string(), now.clone());
            }
        }
        for column in &self.search.omits {
            if record.contains_key(column) {
                record.insert(column.clone(), Value::Null);
            }
        }
        let table = self.table_name()?;
        let stored = self.run(Operation::Create, &table, || self.insert_row(&table, record))?;
        self.rows_affected = 1;
        merge_into(value, stored)?;
        self.value = Some(model_record(value)?);
        Ok(())
    }

    /// Overwrite the row with the record's key; `None` when no row matched.
    fn replace_row(&self, table: &str, record: &Record) -> OrmResult<Vec<Record>> {
        let pk = self.primary_key();
        let target = self.target(table);
        let mut store = lock(&self.shared.store);
        let rows = store.tables.entry(table.to_string()).or_default();
        for row in rows.iter_mut() {
            if eval::matches(&self.search, &target, row)? {
                for (column, v) in record {
                    if column != pk && !self.search.is_omitted(column) {
                        row.insert(column.clone(), v.clone());
                    }
                }
                return Ok(vec![row.clone()]);
            }
        }
        Ok(Vec::new())
    }

    fn save_existing<T: Model>(&mut self, value: &mut T, mut record: Record) -> OrmResult<bool> {
        let table = self.table_name()?;
        if self.has_column(&record, UPDATED_AT) {
            record.insert(UPDATED_AT.to_string(), now_value());
        }
        let replaced = self.run(Operation::Update, &table, || self.replace_row(&table, &record))?;
        let Some(row) = replaced.into_iter().next() else {
            return Ok(false);
        };
        self.rows_affected = 1;
        merge_into(value, row)?;
        self.value = Some(model_record(value)?);
        Ok(true)
    }

    fn update_rows(&self, table: &str, record: &Record) -> OrmResult<u64> {
        self.check_global(table, "update")?;
        let target = self.target(table);
        let mut store = lock(&self.shared.store);
        let mut n = 0;
        for row in store.tables.entry(table.to_string()).or_default().iter_mut() {
            if eval::matches(&self.search, &target, row)? {
                row.extend(record.clone());
                n += 1;
            }
        }
        Ok(n)
    }

    fn apply_updates(&mut self, mut record: Record, protect: bool, keep_nulls: bool) {
        if !self.gate() {
            return;
        }
        let pk = self.primary_key().to_string();
        record.retain(|k, v| !self.search.is_omitted(k) && (keep_nulls || !v.is_null()));
        if protect {
            record.remove(&pk);
            record.remove(CREATED_AT);
        }
        if record.is_empty() {
            return;
        }
        let stamped = self.value.as_ref().is_some_and(|v| v.contains_key(UPDATED_AT))
            || self.meta.as_ref().is_some_and(|m| m.has_column(UPDATED_AT));
        if !self.skip_callbacks && stamped && !record.contains_key(UPDATED_AT) {
            record.insert(UPDATED_AT.to_string(), now_value());
        }
        let result = self
            .table_name()
            .and_then(|table| self.run(Operation::Update, &table, || self.update_rows(&table, &record)));
        match result {
            Ok(n) => {
                self.rows_affected = n;
                if let Some(value) = &mut self.value {
                    value.extend(record);
                }
            }
            Err(e) => self.push_error(e),
        }
    }

    fn delete_rows(&self, table: &str) -> OrmResult<u64> {
        self.check_global(table, "delete")?;
        let target = self.target(table);
        let soft = target.soft_delete && !self.search.unscoped;
        let mut store = lock(&self.shared.store);
        let rows = store.tables.entry(table.to_string()).or_default();
        let mut n = 0;
        if soft {
            let now = now_value();
            for row in rows.iter_mut() {
                if eval::matches(&self.search, &target, row)? {
                    row.insert(DELETED_AT.to_string(), now.clone());
                    n += 1;
                }
            }
        } else {
            let mut kept = Vec::with_capacity(rows.len());
            for row in rows.drain(..) {
                if eval::matches(&self.search, &target, &row)? {
                    n += 1;
                } else {
                    kept.push(row);
                }
            }
            *rows = kept;
        }
        Ok(n)
    }

    // -- schema --

    fn schema_step(&self, table: &str, f: impl FnOnce(&mut Store) -> OrmResult<()>) -> OrmResult<()> {
        self.run(Operation::Schema, table, || {
            f(&mut lock(&self.shared.store))?;
            Ok(0u64)
        })
        .map(|_| ())
    }

    fn finish_schema(mut self, result: OrmResult<()>) -> Self {
        if let Err(e) = result {
            self.push_error(e);
        }
        self
    }

    fn end_transaction(&self, method: &'static str, rollback: bool) -> Self {
        self.journal(method, Value::Null);
        let mut s = self.derive();
        let Some(tx) = self.tx.clone() else {
            s.push_error(OrmError::InvalidTransaction(format!(
                "{} outside a transaction",
                method.to_ascii_uppercase()
            )));
            return s;
        };
        if tx.finished.load(Ordering::Acquire) {
            s.push_error(OrmError::InvalidTransaction(
                "transaction already committed or rolled back".into(),
            ));
            return s;
        }
        if let Some(err) = lock(&self.shared.script).failures.pop_front() {
            s.push_error(err);
            return s;
        }
        let result = self.run(Operation::Transaction, "", || {
            if rollback {
                *lock(&self.shared.store) = tx.snapshot.clone();
            }
            Ok(0u64)
        });
        match result {
            Ok(_) => {
                tx.finished.store(true, Ordering::Release);
                s.tx = None;
            }
            Err(e) => s.push_error(e),
        }
        s
    }
}

fn column_types(records: &[Record]) -> Vec<ColumnType> {
    let Some(first) = records.first() else {
        return Vec::new();
    };
    first
        .iter()
        .map(|(name, value)| ColumnType {
            name: name.clone(),
            type_name: match value {
                Value::Null => "unknown",
                Value::Bool(_) => "bool",
                Value::Number(n) if n.is_i64() || n.is_u64() => "int8",
                Value::Number(_) => "float8",
                Value::String(_) => "text",
                Value::Array(_) | Value::Object(_) => "jsonb",
            }
            .to_string(),
        })
        .collect()
}

fn describe_all(clauses: &[Clause]) -> Value {
    Value::Array(clauses.iter().map(Clause::describe).collect())
}

fn describe<T: Serialize + ?Sized>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

impl Scope for FakeDb {
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
        self.shared.singular_table.load(Ordering::Relaxed)
    }

    fn blocks_global_update(&self) -> bool {
        self.block_global_update
    }

    fn push_error(&mut self, err: OrmError) {
        match err {
            OrmError::Multiple(errors) => self.errors.extend(errors),
            err => self.errors.push(err),
        }
    }
}

#[async_trait]
impl Orm for FakeDb {
    fn with_context(&self, context: Context) -> Self {
        let tag = context.tag().map(str::to_string);
        self.with("with_context", json!({ "tag": tag }), |s| s.context = context)
    }

    fn value(&self) -> Option<Record> {
        self.value.clone()
    }

    fn error(&self) -> Option<OrmError> {
        OrmError::combine(&self.errors)
    }

    fn rows_affected(&self) -> u64 {
        self.rows_affected
    }

    fn get_errors(&self) -> Vec<OrmError> {
        self.errors.clone()
    }

    fn add_error(&mut self, err: OrmError) -> OrmError {
        self.push_error(err.clone());
        err
    }

    fn record_not_found(&self) -> bool {
        self.errors.iter().any(OrmError::is_not_found)
    }

    fn new_record<T: Model>(&self, value: &T) -> bool {
        model_record(value)
            .map(|r| r.get(T::PRIMARY_KEY).is_none_or(is_blank))
            .unwrap_or(true)
    }

    fn new_session(&self) -> Self {
        self.journal("new_session", Value::Null);
        let mut s = self.clone();
        s.search = Search::default();
        s.errors.clear();
        s.rows_affected = 0;
        s.settings.clear();
        s.value = None;
        s.meta = None;
        s.skip_callbacks = false;
        s
    }

    fn close(&self) -> OrmResult<()> {
        self.journal("close", Value::Null);
        Ok(())
    }

    fn db(&self) -> Option<Pool> {
        None
    }

    fn common_db(&self) -> Option<Connection> {
        None
    }

    fn dialect(&self) -> Arc<dyn Dialect> {
        Arc::new(Postgres)
    }

    fn callback(&self) -> Arc<Callbacks> {
        self.shared.callbacks.clone()
    }

    fn set_logger(&self, logger: Arc<dyn QueryMonitor>) {
        self.journal("set_logger", Value::Null);
        *self.shared.logger.write().unwrap_or_else(PoisonError::into_inner) = logger;
    }

    fn log_mode(&self, enable: bool) -> Self {
        self.with("log_mode", json!(enable), |s| s.log_mode = LogMode::from_flag(enable))
    }

    fn block_global_update(&self, enable: bool) -> Self {
        self.with("block_global_update", json!(enable), |s| s.block_global_update = enable)
    }

    fn has_block_global_update(&self) -> bool {
        self.block_global_update
    }

    fn singular_table(&self, enable: bool) {
        self.journal("singular_table", json!(enable));
        self.shared.singular_table.store(enable, Ordering::Relaxed);
    }

    fn where_<C: Into<Clause>>(&self, query: C) -> Self {
        self.checked("where", query.into(), |search, c| search.wheres.push(c))
    }

    fn or<C: Into<Clause>>(&self, query: C) -> Self {
        self.checked("or", query.into(), |search, c| search.ors.push(c))
    }

    fn not<C: Into<Clause>>(&self, query: C) -> Self {
        self.checked("not", query.into(), |search, c| search.nots.push(c))
    }

    fn limit(&self, limit: i64) -> Self {
        self.with("limit", json!(limit), |s| s.search.set_limit(limit))
    }

    fn offset(&self, offset: i64) -> Self {
        self.with("offset", json!(offset), |s| s.search.set_offset(offset))
    }

    fn order<C: Into<Clause>>(&self, value: C, reorder: bool) -> Self {
        self.checked("order", value.into(), |search, c| {
            if reorder {
                search.orders.clear();
            }
            search.orders.push(c);
        })
    }

    fn select<C: Into<Clause>>(&self, query: C) -> Self {
        self.checked("select", query.into(), |search, c| search.select = Some(c))
    }

    fn omit(&self, columns: &[&str]) -> Self {
        self.with("omit", json!(columns), |s| {
            s.search.omits.extend(columns.iter().map(|c| c.to_string()))
        })
    }

    fn group(&self, query: &str) -> Self {
        self.with("group", json!(query), |s| s.search.group = Some(query.to_string()))
    }

    fn having<C: Into<Clause>>(&self, query: C) -> Self {
        self.checked("having", query.into(), |search, c| search.havings.push(c))
    }

    fn joins<C: Into<Clause>>(&self, query: C) -> Self {
        self.checked("joins", query.into(), |search, c| search.joins.push(c))
    }

    fn unscoped(&self) -> Self {
        self.with("unscoped", Value::Null, |s| s.search.unscoped = true)
    }

    fn assign<T: Serialize + ?Sized>(&self, attrs: &T) -> Self {
        self.with("assign", describe(attrs), |s| match to_record(attrs) {
            Ok(record) => s.search.assign_attrs.push(record),
            Err(e) => s.push_error(e),
        })
    }

    fn attrs<T: Serialize + ?Sized>(&self, attrs: &T) -> Self {
        self.with("attrs", describe(attrs), |s| match to_record(attrs) {
            Ok(record) => s.search.init_attrs.push(record),
            Err(e) => s.push_error(e),
        })
    }

    fn raw<C: Into<Clause>>(&self, sql: C) -> Self {
        self.checked("raw", sql.into(), |search, c| search.raw = Some(c))
    }

    fn model<T: Model>(&self, value: &T) -> Self {
        self.with("model", describe(value), |s| {
            match model_record(value) {
                Ok(record) => s.value = Some(record),
                Err(e) => s.push_error(e),
            }
            if let Some(schema) = schema_of::<T>() {
                s.meta = Some(schema);
            }
        })
    }

    fn table(&self, name: &str) -> Self {
        self.with("table", json!(name), |s| {
            s.search.table = Some(name.to_string());
            s.value = None;
            s.meta = None;
        })
    }

    fn preload(&self, column: &str, conditions: &[Clause]) -> Self {
        let args = json!({ "column": column, "conditions": describe_all(conditions) });
        self.with("preload", args, |s| {
            for c in conditions {
                if let Some(e) = c.error() {
                    s.push_error(e.clone());
                }
            }
            s.search.preloads.push(Preload {
                column: column.to_string(),
                conditions: conditions.to_vec(),
            });
        })
    }

    fn set(&self, name: &str, value: Value) -> Self {
        self.with("set", json!({ "name": name, "value": value }), |s| {
            s.settings.insert(name.to_string(), value);
        })
    }

    fn instant_set(&mut self, name: &str, value: Value) -> &mut Self {
        self.journal("instant_set", json!({ "name": name, "value": value }));
        self.settings.insert(name.to_string(), value);
        self
    }

    fn get(&self, name: &str) -> Option<Value> {
        self.settings.get(name).cloned()
    }

    async fn first<T: Model>(&self, out: &mut T, conditions: &[Clause]) -> Self {
        self.journal("first", describe_all(conditions));
        self.find_one(out, conditions, Some("ASC")).await
    }

    async fn take<T: Model>(&self, out: &mut T, conditions: &[Clause]) -> Self {
        self.journal("take", describe_all(conditions));
        self.find_one(out, conditions, None).await
    }

    async fn last<T: Model>(&self, out: &mut T, conditions: &[Clause]) -> Self {
        self.journal("last", describe_all(conditions));
        self.find_one(out, conditions, Some("DESC")).await
    }

    async fn find<D: Destination>(&self, out: &mut D, conditions: &[Clause]) -> Self {
        self.journal("find", describe_all(conditions));
        let mut s = self.derive();
        if !s.gate() {
            return s;
        }
        if let Some(schema) = D::schema() {
            s.meta = Some(schema);
            s.value = None;
        }
        s.add_conditions(conditions);
        s.fill(out).await;
        s
    }

    async fn scan<D: Destination>(&self, out: &mut D) -> Self {
        self.journal("scan", Value::Null);
        let mut s = self.derive();
        if !s.gate() {
            return s;
        }
        if s.meta.is_none() {
            s.meta = D::schema();
        }
        s.fill(out).await;
        s
    }

    async fn row(&self) -> Row {
        self.journal("row", Value::Null);
        let mut s = self.derive();
        if !s.gate() {
            return Row::from_error(s.error().unwrap_or(OrmError::RecordNotFound));
        }
        s.search.set_limit(1);
        let result = s
            .table_name()
            .and_then(|table| s.run(Operation::RowQuery, &table, || s.select_rows(&table)));
        Row::new(result.map(|records| records.into_iter().next()))
    }

    async fn rows(&self) -> OrmResult<Rows> {
        self.journal("rows", Value::Null);
        let mut s = self.derive();
        if !s.gate() {
            return Err(s.error().unwrap_or(OrmError::RecordNotFound));
        }
        let table = s.table_name()?;
        let records = s.run(Operation::RowQuery, &table, || s.select_rows(&table))?;
        Ok(Rows::from_records(column_types(&records), records))
    }

    async fn pluck<T: DeserializeOwned + Send>(&self, column: &str, out: &mut Vec<T>) -> Self {
        self.journal("pluck", json!(column));
        let mut s = self.derive();
        if !s.gate() {
            return s;
        }
        let result = (|| -> OrmResult<Vec<T>> {
            let table = s.table_name()?;
            let records = if s.search.raw.is_some() {
                s.run(Operation::RowQuery, &table, || s.select_rows(&table))?
            } else {
                let name = eval::plain_column(column)
                    .ok_or_else(|| OrmError::Unsupported(format!("FakeDb cannot pluck {column:?}")))?;
                let mut plucked = s.clone();
                plucked.search.select = Some(Clause::raw(name));
                s.run(Operation::RowQuery, &table, || plucked.select_rows(&table))?
            };
            records
                .into_iter()
                .map(|record| {
                    let value = record.into_iter().next().map_or(Value::Null, |(_, v)| v);
                    serde_json::from_value(value).map_err(OrmError::from)
                })
                .collect()
        })();
        match result {
            Ok(values) => {
                s.rows_affected = values.len() as u64;
                *out = values;
            }
            Err(e) => s.push_error(e),
        }
        s
    }

    async fn count(&self, out: &mut i64) -> Self {
        self.journal("count", Value::Null);
        let mut s = self.derive();
        if !s.gate() {
            return s;
        }
        let mut counted = s.clone();
        counted.search.orders.clear();
        counted.search.limit = None;
        counted.search.offset = None;
        counted.search.select = None;
        let result = s.table_name().and_then(|table| {
            s.run(Operation::RowQuery, &table, || counted.select_rows(&table))
        });
        match result {
            Ok(rows) => *out = rows.len() as i64,
            Err(e) => s.push_error(e),
        }
        s
    }

    async fn first_or_init<T: Model>(&self, out: &mut T, conditions: &[Clause]) -> Self {
        self.journal("first_or_init", describe_all(conditions));
        if self.has_errors() {
            return self.derive();
        }
        let found = self.first(out, conditions).await;
        if found.has_errors() && !found.only_not_found() {
            return found;
        }
        let mut s = self.derive();
        if let Err(e) = s.assign_into(out, found.only_not_found(), conditions) {
            s.push_error(e);
        }
        s
    }

    async fn first_or_create<T: Model>(&self, out: &mut T, conditions: &[Clause]) -> Self {
        self.journal("first_or_create", describe_all(conditions));
        if self.has_errors() {
            return self.derive();
        }
        let found = self.first(out, conditions).await;
        if found.only_not_found() {
            let mut s = self.derive();
            if let Err(e) = s.assign_into(out, true, conditions) {
                s.push_error(e);
                return s;
            }
            return s.create(out).await;
        }
        if found.has_errors() || self.search.assign_attrs.is_empty() {
            return found;
        }
        let mut assigned = Record::new();
        for attrs in &self.search.assign_attrs {
            assigned.extend(attrs.clone());
        }
        let mut updated = self.model(&*out).updates(&assigned, false).await;
        if !updated.has_errors() {
            let merged = to_record(out).and_then(|mut record| {
                record.extend(assigned);
                from_record(record)
            });
            match merged {
                Ok(value) => *out = value,
                Err(e) => updated.push_error(e),
            }
        }
        updated
    }

    async fn create<T: Model>(&self, value: &mut T) -> Self {
        self.journal("create", describe(&*value));
        let mut s = self.derive();
        if !s.gate() {
            return s;
        }
        if let Err(e) = s.insert(value) {
            s.push_error(e);
        }
        s
    }

    async fn save<T: Model>(&self, value: &mut T) -> Self {
        self.journal("save", describe(&*value));
        let mut s = self.derive();
        if !s.gate() {
            return s;
        }
        let record = match s.target_model(value) {
            Ok(record) => record,
            Err(e) => {
                s.push_error(e);
                return s;
            }
        };
        let result = if record.get(s.primary_key()).is_none_or(is_blank) {
            s.insert(value)
        } else {
            match s.save_existing(value, record) {
                Ok(true) => Ok(()),
                Ok(false) => s.insert(value),
                Err(e) => Err(e),
            }
        };
        if let Err(e) = result {
            s.push_error(e);
        }
        s
    }

    async fn update<V: Serialize + Send>(&self, column: &str, value: V) -> Self {
        let value = describe(&value);
        self.journal("update", json!({ "column": column, "value": value }));
        let mut s = self.derive();
        let mut record = Record::new();
        record.insert(column.to_string(), value);
        s.apply_updates(record, true, true);
        s
    }

    async fn updates<V: Serialize + ?Sized + Sync>(&self, values: &V, ignore_protected_attrs: bool) -> Self {
        self.journal("updates", json!({ "values": describe(values), "ignore_protected_attrs": ignore_protected_attrs }));
        let mut s = self.derive();
        match to_record(values) {
            Ok(record) => s.apply_updates(record, !ignore_protected_attrs, false),
            Err(e) => s.push_error(e),
        }
        s
    }

    async fn update_column<V: Serialize + Send>(&self, column: &str, value: V) -> Self {
        let value = describe(&value);
        self.journal("update_column", json!({ "column": column, "value": value }));
        let mut s = self.derive();
        s.skip_callbacks = true;
        let mut record = Record::new();
        record.insert(column.to_string(), value);
        s.apply_updates(record, false, true);
        s.skip_callbacks = false;
        s
    }

    async fn update_columns<V: Serialize + ?Sized + Sync>(&self, values: &V) -> Self {
        self.journal("update_columns", describe(values));
        let mut s = self.derive();
        s.skip_callbacks = true;
        match to_record(values) {
            Ok(record) => s.apply_updates(record, false, false),
            Err(e) => s.push_error(e),
        }
        s.skip_callbacks = false;
        s
    }

    async fn delete<T: Model>(&self, value: &T, conditions: &[Clause]) -> Self {
        self.journal("delete", json!({ "value": describe(value), "conditions": describe_all(conditions) }));
        let mut s = self.derive();
        if !s.gate() {
            return s;
        }
        s.add_conditions(conditions);
        let result = s.target_model(value).and_then(|_| {
            let table = s.table_name()?;
            s.run(Operation::Delete, &table, || s.delete_rows(&table))
        });
        match result {
            Ok(n) => s.rows_affected = n,
            Err(e) => s.push_error(e),
        }
        s
    }

    async fn exec<C: Into<Clause> + Send>(&self, sql: C) -> Self {
        let clause = sql.into();
        self.journal("exec", clause.describe());
        let mut s = self.derive();
        if let Some(e) = clause.error() {
            s.push_error(e.clone());
        }
        if !s.gate() {
            return s;
        }
        let result = s.run(Operation::Raw, "", || {
            Ok(lock(&s.shared.script).exec_results.pop_front().unwrap_or(0))
        });
        match result {
            Ok(n) => s.rows_affected = n,
            Err(e) => s.push_error(e),
        }
        s
    }

    async fn begin(&self) -> Self {
        self.journal("begin", Value::Null);
        let mut s = self.derive();
        if !s.gate() {
            return s;
        }
        if s.tx.as_ref().is_some_and(|tx| !tx.finished.load(Ordering::Acquire)) {
            s.push_error(OrmError::InvalidTransaction("already in a transaction".into()));
            return s;
        }
        let snapshot = lock(&s.shared.store).clone();
        match s.run(Operation::Transaction, "", || Ok(0u64)) {
            Ok(_) => {
                s.tx = Some(Arc::new(FakeTx {
                    snapshot,
                    finished: AtomicBool::new(false),
                }))
            }
            Err(e) => s.push_error(e),
        }
        s
    }

    async fn commit(&self) -> Self {
        self.end_transaction("commit", false)
    }

    async fn rollback(&self) -> Self {
        self.end_transaction("rollback", true)
    }

    async fn create_table(&self, schemas: &[TableSchema]) -> Self {
        let names: Vec<String> = schemas.iter().map(|m| m.table_name(self.singular())).collect();
        self.journal("create_table", json!(names));
        let mut s = self.derive();
        if !s.gate() {
            return s;
        }
        for table in &names {
            let result = s.schema_step(table, |store| {
                if store.tables.contains_key(table) {
                    return Err(OrmError::validation(format!("table {table} already exists")));
                }
                store.tables.insert(table.clone(), Vec::new());
                Ok(())
            });
            if let Err(e) = result {
                s.push_error(e);
                break;
            }
        }
        s
    }

    async fn drop_table(&self, tables: &[TableRef]) -> Self {
        let names: Vec<String> = tables.iter().map(|t| t.table_name(self.singular())).collect();
        self.journal("drop_table", json!(names));
        let mut s = self.derive();
        if !s.gate() {
            return s;
        }
        for table in &names {
            let result = s.schema_step(table, |store| {
                store
                    .tables
                    .remove(table)
                    .map(|_| ())
                    .ok_or_else(|| OrmError::validation(format!("table {table} does not exist")))
            });
            if let Err(e) = result {
                s.push_error(e);
                break;
            }
        }
        s
    }

    async fn drop_table_if_exists(&self, tables: &[TableRef]) -> Self {
        let names: Vec<String> = tables.iter().map(|t| t.table_name(self.singular())).collect();
        self.journal("drop_table_if_exists", json!(names));
        let mut s = self.derive();
        if !s.gate() {
            return s;
        }
        for table in &names {
            if let Err(e) = s.schema_step(table, |store| {
                store.tables.remove(table);
                Ok(())
            }) {
                s.push_error(e);
                break;
            }
        }
        s
    }

    async fn has_table(&self, table: TableRef) -> bool {
        let name = table.table_name(self.singular());
        self.journal("has_table", json!(name));
        lock(&self.shared.store).tables.contains_key(&name)
    }

    async fn auto_migrate(&self, schemas: &[TableSchema]) -> Self {
        let names: Vec<String> = schemas.iter().map(|m| m.table_name(self.singular())).collect();
        self.journal("auto_migrate", json!(names));
        let mut s = self.derive();
        if !s.gate() {
            return s;
        }
        for (schema, table) in schemas.iter().zip(&names) {
            let result = s.schema_step(table, |store| {
                let rows = store.tables.entry(table.clone()).or_default();
                for row in rows.iter_mut() {
                    for column in schema.column_names() {
                        row.entry(column.to_string()).or_insert(Value::Null);
                    }
                }
                Ok(())
            });
            if let Err(e) = result {
                s.push_error(e);
                break;
            }
        }
        s
    }

    async fn modify_column(&self, column: &str, sql_type: &str) -> Self {
        self.journal("modify_column", json!({ "column": column, "type": sql_type }));
        let mut s = self.derive();
        if !s.gate() {
            return s;
        }
        let result = s.table_name().and_then(|table| s.schema_step(&table, |_| Ok(())));
        s.finish_schema(result)
    }

    async fn drop_column(&self, column: &str) -> Self {
        self.journal("drop_column", json!(column));
        let mut s = self.derive();
        if !s.gate() {
            return s;
        }
        let result = s.table_name().and_then(|table| {
            s.schema_step(&table, |store| {
                for row in store.tables.entry(table.clone()).or_default() {
                    row.remove(column);
                }
                Ok(())
            })
        });
        s.finish_schema(result)
    }

    async fn add_index(&self, name: &str, columns: &[&str]) -> Self {
        self.journal("add_index", json!({ "name": name, "columns": columns }));
        let mut s = self.derive();
        if !s.gate() {
            return s;
        }
        let result = s.table_name().and_then(|table| {
            s.search.argless_where_sql(&s.target(&table))?;
            s.schema_step(&table, |_| Ok(()))
        });
        s.finish_schema(result)
    }

    async fn add_unique_index(&self, name: &str, columns: &[&str]) -> Self {
        self.journal("add_unique_index", json!({ "name": name, "columns": columns }));
        let mut s = self.derive();
        if !s.gate() {
            return s;
        }
        let result = s.table_name().and_then(|table| {
            s.search.argless_where_sql(&s.target(&table))?;
            s.schema_step(&table, |_| Ok(()))
        });
        s.finish_schema(result)
    }

    async fn remove_index(&self, name: &str) -> Self {
        self.journal("remove_index", json!(name));
        let mut s = self.derive();
        if !s.gate() {
            return s;
        }
        let result = s.table_name().and_then(|table| s.schema_step(&table, |_| Ok(())));
        s.finish_schema(result)
    }

    async fn add_foreign_key(&self, field: &str, dest: &str, on_delete: &str, on_update: &str) -> Self {
        self.journal(
            "add_foreign_key",
            json!({ "field": field, "dest": dest, "on_delete": on_delete, "on_update": on_update }),
        );
        let mut s = self.derive();
        if !s.gate() {
            return s;
        }
        let result = s.table_name().and_then(|table| s.schema_step(&table, |_| Ok(())));
        s.finish_schema(result)
    }

    async fn remove_foreign_key(&self, field: &str, dest: &str) -> Self {
        self.journal("remove_foreign_key", json!({ "field": field, "dest": dest }));
        let mut s = self.derive();
        if !s.gate() {
            return s;
        }
        let result = s.table_name().and_then(|table| s.schema_step(&table, |_| Ok(())));
        s.finish_schema(result)
    }

    fn set_join_table_handler<T: Model>(&self, column: &str, handler: Arc<dyn JoinTableHandler>) {
        self.journal("set_join_table_handler", json!({ "owner": T::NAME, "column": column }));
        self.shared
            .join_tables
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((T::NAME.to_string(), column.to_string()), handler);
    }

    fn join_table_handler(&self, owner: &str, column: &str) -> Option<Arc<dyn JoinTableHandler>> {
        self.shared
            .join_tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(owner.to_string(), column.to_string()))
            .cloned()
    }

    fn model_meta(&self) -> Option<TableSchema> {
        self.meta.clone()
    }
}
