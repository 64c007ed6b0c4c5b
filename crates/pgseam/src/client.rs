//! Connections a session runs on.

use crate::error::{OrmError, OrmResult};
use deadpool_postgres::{Object, Pool};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_postgres::{CancelToken, Client};

/// Where a session sends its statements (`common_db()`).
#[derive(Clone)]
pub enum Connection {
    /// A deadpool pool; each statement checks out a connection.
    Pool(Pool),
    /// One client shared by every session.
    Client(Arc<Client>),
    /// A connection pinned to an open transaction.
    Tx(Arc<TxConnection>),
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Connection::Pool(pool) => f.debug_tuple("Pool").field(&pool.status()).finish(),
            Connection::Client(_) => f.write_str("Client"),
            Connection::Tx(tx) => f
                .debug_struct("Tx")
                .field("finished", &tx.is_finished())
                .finish(),
        }
    }
}

impl Connection {
    pub fn is_transaction(&self) -> bool {
        matches!(self, Connection::Tx(_))
    }

    pub fn pool(&self) -> Option<&Pool> {
        match self {
            Connection::Pool(pool) => Some(pool),
            _ => None,
        }
    }

    pub(crate) async fn lease(&self) -> OrmResult<Lease> {
        match self {
            Connection::Pool(pool) => Ok(Lease::Pooled(pool.get().await?)),
            Connection::Client(client) => Ok(Lease::Shared(client.clone())),
            Connection::Tx(tx) => {
                if tx.is_finished() {
                    return Err(OrmError::InvalidTransaction(
                        "transaction already committed or rolled back".into(),
                    ));
                }
                Ok(Lease::Tx(tx.clone()))
            }
        }
    }

    /// Pin a connection and wrap it for a transaction. `BEGIN` is issued by the caller.
    ///
    /// A shared client is refused: every handle on it would run inside the
    /// transaction and a rollback would discard their writes too.
    pub(crate) async fn pin(&self) -> OrmResult<TxConnection> {
        match self {
            Connection::Pool(pool) => Ok(TxConnection::new(pool.get().await?)),
            Connection::Client(_) => Err(OrmError::InvalidTransaction(
                "transactions need a pool; a shared client is used by every handle".into(),
            )),
            Connection::Tx(_) => Err(OrmError::InvalidTransaction(
                "cannot start a transaction inside a transaction".into(),
            )),
        }
    }

    pub(crate) fn close(&self) -> OrmResult<()> {
        match self {
            Connection::Pool(pool) => {
                pool.close();
                Ok(())
            }
            Connection::Client(_) => Err(OrmError::Unsupported(
                "a shared client is closed by dropping it".into(),
            )),
            Connection::Tx(_) => Err(OrmError::InvalidTransaction(
                "commit or roll back the transaction instead of closing it".into(),
            )),
        }
    }
}

/// Connection held by a transaction session and all sessions derived from it.
///
/// Dropped without `commit`/`rollback`, a pooled connection is detached from
/// the pool so it is never recycled with an open transaction.
pub struct TxConnection {
    object: Option<Object>,
    finished: AtomicBool,
}

impl TxConnection {
    fn new(object: Object) -> Self {
        Self {
            object: Some(object),
            finished: AtomicBool::new(false),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Mark the transaction finished. Returns `false` if it already was.
    pub(crate) fn finish(&self) -> bool {
        !self.finished.swap(true, Ordering::AcqRel)
    }

    fn client(&self) -> OrmResult<&Client> {
        match &self.object {
            Some(object) => {
                let client: &Client = object;
                Ok(client)
            }
            None => Err(OrmError::InvalidTransaction(
                "transaction connection was released".into(),
            )),
        }
    }
}

impl Drop for TxConnection {
    fn drop(&mut self) {
        if self.is_finished() {
            return;
        }
        tracing::warn!(
            target: "pgseam",
            "transaction dropped without commit or rollback; discarding its connection"
        );
        if let Some(object) = self.object.take() {
            drop(Object::take(object));
        }
    }
}

/// A connection checked out for one statement (or one open cursor).
pub(crate) enum Lease {
    Pooled(Object),
    Shared(Arc<Client>),
    Tx(Arc<TxConnection>),
}

impl Lease {
    pub(crate) fn client(&self) -> OrmResult<&Client> {
        match self {
            Lease::Pooled(object) => {
                let client: &Client = object;
                Ok(client)
            }
            Lease::Shared(client) => Ok(client.as_ref()),
            Lease::Tx(tx) => tx.client(),
        }
    }

    pub(crate) fn cancel_token(&self) -> Option<CancelToken> {
        self.client().ok().map(Client::cancel_token)
    }
}
