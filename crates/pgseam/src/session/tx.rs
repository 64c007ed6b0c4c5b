//! Transactions.

use super::Session;
use super::exec::Mode;
use crate::callbacks::Operation;
use crate::client::Connection;
use crate::error::OrmError;
use crate::sql::Sql;
use std::sync::Arc;

impl Session {
    /// Start a transaction; the returned session and everything derived from
    /// it run on one pinned connection.
    ///
    /// ```ignore
    /// let tx = db.begin().await;
    /// let created = tx.create(&mut user).await;
    /// if created.error().is_some() {
    ///     tx.rollback().await;
    /// } else {
    ///     tx.commit().await;
    /// }
    /// ```
    pub async fn begin(&self) -> Self {
        let mut s = self.derive();
        if s.has_errors() {
            return s;
        }
        let pinned = match s.conn.pin().await {
            Ok(pinned) => Arc::new(pinned),
            Err(e) => {
                s.push_error(e);
                return s;
            }
        };
        let mut tx = s.clone();
        tx.conn = Connection::Tx(pinned);
        match tx.run(Operation::Transaction, None, Sql::new("BEGIN"), Mode::Batch).await {
            Ok(_) => tx,
            Err(e) => {
                s.push_error(e);
                s
            }
        }
    }

    pub async fn commit(&self) -> Self {
        self.end_transaction("COMMIT").await
    }

    pub async fn rollback(&self) -> Self {
        self.end_transaction("ROLLBACK").await
    }

    /// Runs even when the session carries errors; the returned session is
    /// bound to the root connection again.
    async fn end_transaction(&self, statement: &'static str) -> Self {
        let mut s = self.derive();
        let Connection::Tx(tx) = &self.conn else {
            s.push_error(OrmError::InvalidTransaction(format!(
                "{statement} outside a transaction"
            )));
            return s;
        };
        if tx.is_finished() {
            s.push_error(OrmError::InvalidTransaction(
                "transaction already committed or rolled back".into(),
            ));
            return s;
        }
        match self.run(Operation::Transaction, None, Sql::new(statement), Mode::Batch).await {
            Ok(_) => {
                tx.finish();
                s.conn = self.root.connection.clone();
            }
            Err(e) => s.push_error(e),
        }
        s
    }
}
