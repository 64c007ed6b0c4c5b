//! Statement execution: callbacks, timeout, driver call, logging.

use super::Session;
use crate::callbacks::Operation;
use crate::client::Lease;
use crate::config::LogMode;
use crate::cursor::{ColumnType, Rows};
use crate::error::{OrmError, OrmResult};
use crate::monitor::{QueryContext, QueryResult};
use crate::sql::Sql;
use crate::value::{Record, SqlValue, record_from_row};
use std::future::Future;
use std::time::{Duration, Instant};
use tokio_postgres::types::ToSql;
use tracing::Instrument;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
    /// Rows come back as records.
    Query,
    /// Like `Query`, but an empty result is reported as not found.
    Single,
    /// Only the affected row count matters.
    Execute,
    /// Simple-protocol statement without parameters (transaction control).
    Batch,
}

pub(crate) enum Reply {
    Records(Vec<Record>),
    Affected(u64),
}

impl Reply {
    fn as_result(&self) -> QueryResult {
        match self {
            Reply::Records(records) => QueryResult::Rows(records.len()),
            Reply::Affected(n) => QueryResult::Affected(*n),
        }
    }
}

fn to_params(params: &[SqlValue]) -> Vec<&(dyn ToSql + Sync)> {
    params.iter().map(|p| p as &(dyn ToSql + Sync)).collect()
}

impl Session {
    pub(super) fn query_context(&self, operation: Operation, sql: &str, param_count: usize, table: Option<&str>) -> QueryContext {
        let mut ctx = QueryContext::new(operation, sql, param_count);
        if let Some(table) = table.filter(|t| !t.is_empty()) {
            ctx = ctx.with_table(table);
        }
        if let Some(tag) = self.context.tag() {
            ctx = ctx.with_tag(tag);
        }
        ctx.settings = self.settings.clone();
        ctx
    }

    fn span(&self, ctx: &QueryContext) -> tracing::Span {
        let parent = self.context.span().cloned().unwrap_or_else(tracing::Span::current);
        tracing::debug_span!(
            target: "pgseam",
            parent: &parent,
            "pgseam.query",
            operation = %ctx.operation,
            table = ctx.table.as_deref().unwrap_or(""),
        )
    }

    fn timeout(&self) -> Option<Duration> {
        self.context.timeout().or(self.root.config.query_timeout)
    }

    /// Run one statement through the full pipeline.
    pub(crate) async fn run(&self, operation: Operation, table: Option<&str>, sql: Sql, mode: Mode) -> OrmResult<Reply> {
        let (text, params) = sql.into_parts();
        let mut ctx = self.query_context(operation, &text, params.len(), table);
        if !self.skip_callbacks {
            self.root.callbacks.run_before(&mut ctx)?;
        }

        let start = Instant::now();
        let span = self.span(&ctx);
        let result = self
            .dispatch(&ctx.sql, &params, mode)
            .instrument(span)
            .await;
        let report = match &result {
            Ok(Reply::Records(records)) if records.is_empty() && mode == Mode::Single => QueryResult::NotFound,
            Ok(reply) => reply.as_result(),
            Err(e) => QueryResult::error(e.to_string()),
        };
        self.report_result(&ctx, start.elapsed(), &report);
        result
    }

    pub(crate) async fn run_query(&self, operation: Operation, table: Option<&str>, sql: Sql) -> OrmResult<Vec<Record>> {
        self.query_records(operation, table, sql, Mode::Query).await
    }

    /// A read expecting one row; monitors see `NotFound` when it comes back empty.
    pub(crate) async fn run_query_single(&self, operation: Operation, table: Option<&str>, sql: Sql) -> OrmResult<Vec<Record>> {
        self.query_records(operation, table, sql, Mode::Single).await
    }

    async fn query_records(&self, operation: Operation, table: Option<&str>, sql: Sql, mode: Mode) -> OrmResult<Vec<Record>> {
        match self.run(operation, table, sql, mode).await? {
            Reply::Records(records) => Ok(records),
            Reply::Affected(_) => Ok(Vec::new()),
        }
    }

    pub(crate) async fn run_exec(&self, operation: Operation, table: Option<&str>, sql: Sql) -> OrmResult<u64> {
        match self.run(operation, table, sql, Mode::Execute).await? {
            Reply::Affected(n) => Ok(n),
            Reply::Records(records) => Ok(records.len() as u64),
        }
    }

    async fn dispatch(&self, sql: &str, params: &[SqlValue], mode: Mode) -> OrmResult<Reply> {
        let lease = self.conn.lease().await?;
        let work = async {
            let client = lease.client()?;
            match mode {
                Mode::Query | Mode::Single => {
                    let rows = client
                        .query(sql, &to_params(params))
                        .await
                        .map_err(OrmError::from_db_error)?;
                    let records = rows.iter().map(record_from_row).collect::<OrmResult<Vec<_>>>()?;
                    Ok(Reply::Records(records))
                }
                Mode::Execute => {
                    let n = client
                        .execute(sql, &to_params(params))
                        .await
                        .map_err(OrmError::from_db_error)?;
                    Ok(Reply::Affected(n))
                }
                Mode::Batch => {
                    client.batch_execute(sql).await.map_err(OrmError::from_db_error)?;
                    Ok(Reply::Affected(0))
                }
            }
        };
        self.with_timeout(&lease, work).await
    }

    /// Open a streaming cursor. The lease stays checked out until the cursor closes.
    pub(crate) async fn run_rows(&self, operation: Operation, table: Option<&str>, sql: Sql) -> OrmResult<Rows> {
        let (text, params) = sql.into_parts();
        let mut ctx = self.query_context(operation, &text, params.len(), table);
        if !self.skip_callbacks {
            self.root.callbacks.run_before(&mut ctx)?;
        }

        let start = Instant::now();
        let span = self.span(&ctx);
        let result = async {
            let lease = self.conn.lease().await?;
            let open = async {
                let client = lease.client()?;
                let statement = client.prepare(&ctx.sql).await.map_err(OrmError::from_db_error)?;
                let stream = client
                    .query_raw(&statement, params.iter())
                    .await
                    .map_err(OrmError::from_db_error)?;
                let columns = statement
                    .columns()
                    .iter()
                    .map(|c| ColumnType {
                        name: c.name().to_string(),
                        type_name: c.type_().name().to_string(),
                    })
                    .collect::<Vec<_>>();
                Ok((columns, stream))
            };
            let (columns, stream) = self.with_timeout(&lease, open).await?;
            Ok::<_, OrmError>(Rows::streaming(columns, stream, lease))
        }
        .instrument(span)
        .await;

        let report = match &result {
            Ok(_) => QueryResult::Rows(0),
            Err(e) => QueryResult::error(e.to_string()),
        };
        self.report_result(&ctx, start.elapsed(), &report);
        result
    }

    async fn with_timeout<T, F>(&self, lease: &Lease, future: F) -> OrmResult<T>
    where
        F: Future<Output = OrmResult<T>> + Send,
    {
        match self.timeout() {
            Some(timeout) => {
                tokio::pin!(future);
                tokio::select! {
                    result = &mut future => result,
                    _ = tokio::time::sleep(timeout) => {
                        if let Some(cancel_token) = lease.cancel_token() {
                            tokio::spawn(async move {
                                let _ = cancel_token.cancel_query(tokio_postgres::NoTls).await;
                            });
                        }
                        Err(OrmError::Timeout(timeout))
                    }
                }
            }
            None => future.await,
        }
    }

    fn report_result(&self, ctx: &QueryContext, duration: Duration, result: &QueryResult) {
        if !self.skip_callbacks {
            self.root.callbacks.run_after(ctx, duration, result);
        }

        let logged = match self.log_mode {
            LogMode::Detailed => true,
            LogMode::Default => result.is_error(),
            LogMode::Silent => false,
        };
        if !logged {
            return;
        }
        let logger = self.root.logger();
        logger.on_query_complete(ctx, duration, result);
        if let Some(threshold) = self.root.config.slow_query_threshold {
            if duration > threshold {
                logger.on_slow_query(ctx, duration);
            }
        }
    }
}
