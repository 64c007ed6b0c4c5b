use super::truncate_sql_bytes;
use super::types::{QueryContext, QueryMonitor, QueryResult};
use crate::callbacks::Operation;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMonitor;

impl QueryMonitor for NoopMonitor {
    fn on_query_complete(&self, _ctx: &QueryContext, _duration: Duration, _result: &QueryResult) {}
}

/// The default logger: `tracing` events on target `pgseam.sql`.
///
/// Failures are logged at `ERROR` and slow statements at `WARN`. Everything
/// else goes out at `DEBUG`, or `INFO` once [`verbose`](Self::verbose) is set.
#[derive(Debug, Clone)]
pub struct LoggingMonitor {
    verbose: bool,
    max_sql_length: Option<usize>,
}

impl Default for LoggingMonitor {
    fn default() -> Self {
        Self {
            verbose: false,
            max_sql_length: Some(1024),
        }
    }
}

impl LoggingMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Cut logged SQL after `len` bytes; `None` logs it whole.
    pub fn max_sql_length(mut self, len: Option<usize>) -> Self {
        self.max_sql_length = len;
        self
    }

    pub(crate) fn truncate_sql(&self, sql: &str) -> String {
        match self.max_sql_length {
            Some(max) if sql.len() > max => format!("{}...", truncate_sql_bytes(sql, max)),
            _ => sql.to_string(),
        }
    }
}

impl QueryMonitor for LoggingMonitor {
    fn on_query_complete(&self, ctx: &QueryContext, duration: Duration, result: &QueryResult) {
        let sql = self.truncate_sql(&ctx.sql);
        let table = ctx.table.as_deref().unwrap_or("-");
        let tag = ctx.tag.as_deref().unwrap_or("-");
        let elapsed_ms = duration.as_secs_f64() * 1000.0;

        if let QueryResult::Error(err) = result {
            tracing::error!(
                target: "pgseam.sql",
                operation = %ctx.operation, table, tag, elapsed_ms, %sql,
                "statement failed: {err}"
            );
        } else if self.verbose {
            tracing::info!(
                target: "pgseam.sql",
                operation = %ctx.operation, table, tag, elapsed_ms, params = ctx.param_count, %sql,
                "{result}"
            );
        } else {
            tracing::debug!(
                target: "pgseam.sql",
                operation = %ctx.operation, table, tag, elapsed_ms, params = ctx.param_count, %sql,
                "{result}"
            );
        }
    }

    fn on_slow_query(&self, ctx: &QueryContext, duration: Duration) {
        tracing::warn!(
            target: "pgseam.sql",
            operation = %ctx.operation,
            elapsed_ms = duration.as_secs_f64() * 1000.0,
            sql = %self.truncate_sql(&ctx.sql),
            "slow query"
        );
    }
}

/// Counters collected by [`StatsMonitor`].
#[derive(Debug, Clone, Default)]
pub struct QueryStats {
    pub total_queries: u64,
    pub failed_queries: u64,
    pub not_found: u64,
    pub slow_queries: u64,
    pub total_duration: Duration,
    pub max_duration: Duration,
    pub slowest_query: Option<String>,
    per_operation: HashMap<Operation, u64>,
}

impl QueryStats {
    /// Statements seen for one engine operation.
    pub fn count(&self, operation: Operation) -> u64 {
        self.per_operation.get(&operation).copied().unwrap_or(0)
    }
}

/// Tallies statements per engine operation.
#[derive(Debug, Default)]
pub struct StatsMonitor {
    stats: Mutex<QueryStats>,
}

impl StatsMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> QueryStats {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn reset(&self) {
        *self.stats.lock().unwrap_or_else(PoisonError::into_inner) = QueryStats::default();
    }
}

impl QueryMonitor for StatsMonitor {
    fn on_query_complete(&self, ctx: &QueryContext, duration: Duration, result: &QueryResult) {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        stats.total_queries += 1;
        *stats.per_operation.entry(ctx.operation).or_default() += 1;
        stats.total_duration = stats.total_duration.saturating_add(duration);
        match result {
            QueryResult::Error(_) => stats.failed_queries += 1,
            QueryResult::NotFound => stats.not_found += 1,
            QueryResult::Rows(_) | QueryResult::Affected(_) => {}
        }
        if duration > stats.max_duration {
            stats.max_duration = duration;
            stats.slowest_query = Some(ctx.sql.clone());
        }
    }

    fn on_slow_query(&self, _ctx: &QueryContext, _duration: Duration) {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).slow_queries += 1;
    }
}

/// Forwards to several monitors in registration order.
#[derive(Default, Clone)]
pub struct CompositeMonitor {
    monitors: Vec<Arc<dyn QueryMonitor>>,
}

impl CompositeMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, monitor: Arc<dyn QueryMonitor>) -> Self {
        self.monitors.push(monitor);
        self
    }
}

impl QueryMonitor for CompositeMonitor {
    fn on_query_complete(&self, ctx: &QueryContext, duration: Duration, result: &QueryResult) {
        self.monitors
            .iter()
            .for_each(|m| m.on_query_complete(ctx, duration, result));
    }

    fn on_slow_query(&self, ctx: &QueryContext, duration: Duration) {
        self.monitors.iter().for_each(|m| m.on_slow_query(ctx, duration));
    }
}
