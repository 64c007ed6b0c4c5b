//! # pgseam
//!
//! A chainable PostgreSQL session with gorm-style semantics, exposed through a
//! mockable [`Orm`] trait.
//!
//! ## Features
//!
//! - **Copy-on-chain sessions**: every builder call returns a new handle; the receiver is never changed
//! - **One contract, two implementations**: [`Db`] runs SQL through tokio-postgres, `FakeDb` (feature `test-utils`) keeps tables in memory
//! - **Outcome on the handle**: terminal calls return a handle carrying `error()`, `record_not_found()` and `rows_affected()`
//! - **Safe defaults**: `block_global_update(true)` refuses UPDATE/DELETE without conditions
//! - **Query monitoring**: callbacks around every statement, pluggable loggers, tracing spans
//!
//! ## Usage
//!
//! ```ignore
//! use pgseam::{Clause, Config, Model, Orm, clause};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Default, Serialize, Deserialize, Model)]
//! struct User {
//!     id: i64,
//!     name: String,
//!     age: i32,
//! }
//!
//! let db = pgseam::open(Config::from_env()?).await?;
//!
//! let mut user = User { name: "jinzhu".into(), age: 18, ..Default::default() };
//! db.create(&mut user).await;
//!
//! let mut adults: Vec<User> = Vec::new();
//! let found = db.where_(clause!("age >= ?", 18)).order("id desc", false).find(&mut adults, &[]).await;
//! if let Some(err) = found.error() {
//!     return Err(err.into());
//! }
//!
//! db.model(&user).update("name", "hello").await;
//! db.delete(&user, &[]).await;
//! ```

pub mod association;
pub mod callbacks;
pub mod clause;
pub mod client;
pub mod config;
pub mod context;
pub mod cursor;
pub mod db;
pub mod dialect;
pub mod error;
pub mod ident;
pub mod interface;
pub mod model;
pub mod monitor;
pub mod pool;
mod scope;
mod search;
pub mod session;
pub mod sql;
pub mod value;

#[cfg(feature = "test-utils")]
pub mod fake;

pub use association::{Association, JoinTable, JoinTableHandler, Relation};
pub use callbacks::{CallbackProcessor, Callbacks, Operation, from_fn};
pub use clause::{Arg, Clause, CmpOp};
pub use client::Connection;
pub use config::{Config, LogMode};
pub use context::Context;
pub use cursor::{ColumnType, Row, Rows};
pub use db::{Db, open};
pub use dialect::{Dialect, Postgres};
pub use error::{OrmError, OrmResult};
pub use interface::Orm;
pub use model::{Destination, Field, Model, PgType, TableRef, TableSchema, fill_model};
pub use monitor::{
    CompositeMonitor, HookAction, LoggingMonitor, NoopMonitor, QueryContext, QueryHook, QueryMonitor,
    QueryResult, QueryStats, QueryType, StatsMonitor,
};
pub use pool::{create_pool, create_pool_with_config};
pub use session::Session;
pub use sql::{Sql, sql};
pub use value::{Record, SqlValue, from_record, to_record};

#[cfg(feature = "test-utils")]
pub use fake::{Call, FakeDb};

#[cfg(feature = "derive")]
pub use pgseam_derive::Model;
