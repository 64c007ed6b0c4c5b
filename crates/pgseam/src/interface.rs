//! The `Orm` contract.
//!
//! Application code depends on `Orm` instead of a concrete handle, so the
//! same code runs against [`Db`](crate::Db) in production and against
//! `FakeDb` (feature `test-utils`) in unit tests:
//!
//! ```ignore
//! async fn rename<D: Orm>(db: &D, id: i64, name: &str) -> OrmResult<()> {
//!     let updated = db.table("users").where_(Clause::primary_key(id)).update("name", name).await;
//!     match updated.error() {
//!         Some(e) => Err(e),
//!         None => Ok(()),
//!     }
//! }
//! ```
//!
//! Builders return a new handle and never modify the receiver (`instant_set`
//! is the one exception). Terminal operations are async and return a handle
//! whose `error()`, `record_not_found()` and `rows_affected()` describe the
//! outcome.

use crate::association::{Association, JoinTableHandler, find_related, related_column};
use crate::callbacks::Callbacks;
use crate::clause::Clause;
use crate::client::Connection;
use crate::context::Context;
use crate::cursor::{Row, Rows};
use crate::dialect::Dialect;
use crate::error::{OrmError, OrmResult};
use crate::model::{Destination, Model, TableRef, TableSchema};
use crate::monitor::QueryMonitor;
use crate::value::Record;
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;

#[async_trait]
pub trait Orm: Clone + Send + Sync + Sized + 'static {
    // -- handle and outcome --

    /// Attach a tracing span, timeout and tag to every statement of the chain.
    fn with_context(&self, context: Context) -> Self;
    fn value(&self) -> Option<Record>;
    fn error(&self) -> Option<OrmError>;
    fn rows_affected(&self) -> u64;
    fn get_errors(&self) -> Vec<OrmError>;
    /// Record an error on this handle and hand it back.
    fn add_error(&mut self, err: OrmError) -> OrmError;
    fn record_not_found(&self) -> bool;
    fn new_record<T: Model>(&self, value: &T) -> bool;
    /// No conditions, settings, value or errors.
    fn new_session(&self) -> Self;
    fn close(&self) -> OrmResult<()>;
    fn db(&self) -> Option<deadpool_postgres::Pool>;
    /// `None` for handles without a database behind them.
    fn common_db(&self) -> Option<Connection>;
    fn dialect(&self) -> Arc<dyn Dialect>;
    fn callback(&self) -> Arc<Callbacks>;
    fn set_logger(&self, logger: Arc<dyn QueryMonitor>);
    fn log_mode(&self, enable: bool) -> Self;
    fn debug(&self) -> Self {
        self.log_mode(true)
    }
    fn block_global_update(&self, enable: bool) -> Self;
    fn has_block_global_update(&self) -> bool;
    fn singular_table(&self, enable: bool);

    // -- conditions --

    fn where_<C: Into<Clause>>(&self, query: C) -> Self;
    fn or<C: Into<Clause>>(&self, query: C) -> Self;
    fn not<C: Into<Clause>>(&self, query: C) -> Self;
    fn limit(&self, limit: i64) -> Self;
    fn offset(&self, offset: i64) -> Self;
    fn order<C: Into<Clause>>(&self, value: C, reorder: bool) -> Self;
    fn select<C: Into<Clause>>(&self, query: C) -> Self;
    fn omit(&self, columns: &[&str]) -> Self;
    fn group(&self, query: &str) -> Self;
    fn having<C: Into<Clause>>(&self, query: C) -> Self;
    fn joins<C: Into<Clause>>(&self, query: C) -> Self;

    /// Apply reusable query functions in order.
    fn scopes<I, F>(&self, funcs: I) -> Self
    where
        I: IntoIterator<Item = F>,
        F: FnOnce(Self) -> Self,
    {
        funcs.into_iter().fold(self.clone(), |s, f| f(s))
    }

    fn unscoped(&self) -> Self;
    fn assign<T: Serialize + ?Sized>(&self, attrs: &T) -> Self;
    fn attrs<T: Serialize + ?Sized>(&self, attrs: &T) -> Self;
    fn raw<C: Into<Clause>>(&self, sql: C) -> Self;
    fn model<T: Model>(&self, value: &T) -> Self;
    fn table(&self, name: &str) -> Self;
    fn preload(&self, column: &str, conditions: &[Clause]) -> Self;

    // -- settings --

    fn set(&self, name: &str, value: Value) -> Self;
    /// Set `name` on this handle in place; unlike every other builder it
    /// mutates the receiver.
    fn instant_set(&mut self, name: &str, value: Value) -> &mut Self;
    fn get(&self, name: &str) -> Option<Value>;

    // -- readers --

    async fn first<T: Model>(&self, out: &mut T, conditions: &[Clause]) -> Self;
    async fn take<T: Model>(&self, out: &mut T, conditions: &[Clause]) -> Self;
    async fn last<T: Model>(&self, out: &mut T, conditions: &[Clause]) -> Self;
    async fn find<D: Destination>(&self, out: &mut D, conditions: &[Clause]) -> Self;
    async fn scan<D: Destination>(&self, out: &mut D) -> Self;
    async fn row(&self) -> Row;
    async fn rows(&self) -> OrmResult<Rows>;
    fn scan_rows<D: Destination>(&self, rows: &Rows, out: &mut D) -> OrmResult<()> {
        rows.scan_into(out)
    }
    async fn pluck<T: DeserializeOwned + Send>(&self, column: &str, out: &mut Vec<T>) -> Self;
    async fn count(&self, out: &mut i64) -> Self;

    /// Rows related to the model value; the relation is inferred from `T`.
    async fn related<T: Model>(&self, out: &mut Vec<T>, foreign_keys: &[&str]) -> Self {
        let column = related_column::<Self, T>(self);
        find_related(self, out, &column, foreign_keys.first().copied()).await
    }

    async fn first_or_init<T: Model>(&self, out: &mut T, conditions: &[Clause]) -> Self;
    async fn first_or_create<T: Model>(&self, out: &mut T, conditions: &[Clause]) -> Self;

    // -- writers --

    async fn create<T: Model>(&self, value: &mut T) -> Self;
    async fn save<T: Model>(&self, value: &mut T) -> Self;
    async fn update<V: Serialize + Send>(&self, column: &str, value: V) -> Self;
    async fn updates<V: Serialize + ?Sized + Sync>(&self, values: &V, ignore_protected_attrs: bool) -> Self;
    async fn update_column<V: Serialize + Send>(&self, column: &str, value: V) -> Self;
    async fn update_columns<V: Serialize + ?Sized + Sync>(&self, values: &V) -> Self;
    async fn delete<T: Model>(&self, value: &T, conditions: &[Clause]) -> Self;
    async fn exec<C: Into<Clause> + Send>(&self, sql: C) -> Self;

    // -- transactions --

    async fn begin(&self) -> Self;
    async fn commit(&self) -> Self;
    async fn rollback(&self) -> Self;

    // -- schema --

    async fn create_table(&self, schemas: &[TableSchema]) -> Self;
    async fn drop_table(&self, tables: &[TableRef]) -> Self;
    async fn drop_table_if_exists(&self, tables: &[TableRef]) -> Self;
    async fn has_table(&self, table: TableRef) -> bool;
    async fn auto_migrate(&self, schemas: &[TableSchema]) -> Self;
    async fn modify_column(&self, column: &str, sql_type: &str) -> Self;
    async fn drop_column(&self, column: &str) -> Self;
    async fn add_index(&self, name: &str, columns: &[&str]) -> Self;
    async fn add_unique_index(&self, name: &str, columns: &[&str]) -> Self;
    async fn remove_index(&self, name: &str) -> Self;
    async fn add_foreign_key(&self, field: &str, dest: &str, on_delete: &str, on_update: &str) -> Self;
    async fn remove_foreign_key(&self, field: &str, dest: &str) -> Self;

    // -- associations --

    fn association(&self, column: &str) -> Association<Self> {
        Association::new(self.clone(), column)
    }
    fn set_join_table_handler<T: Model>(&self, column: &str, handler: Arc<dyn JoinTableHandler>);
    fn join_table_handler(&self, owner: &str, column: &str) -> Option<Arc<dyn JoinTableHandler>>;
    /// Schema of the model set with `model()` or inferred from the last destination.
    fn model_meta(&self) -> Option<TableSchema>;
}
