//! Statement logging, monitoring and hook types.
//!
//! Every statement a session runs is described by a [`QueryContext`]. Hooks
//! ([`QueryHook`], registered through [`Callbacks`](crate::callbacks::Callbacks))
//! may rewrite or abort it; monitors ([`QueryMonitor`], installed with
//! `set_logger`) observe the outcome.
//!
//! ```rust,ignore
//! use pgseam::monitor::{CompositeMonitor, LoggingMonitor, StatsMonitor};
//! use std::sync::Arc;
//!
//! let stats = Arc::new(StatsMonitor::new());
//! db.set_logger(Arc::new(
//!     CompositeMonitor::new()
//!         .with(Arc::new(LoggingMonitor::new().verbose(true)))
//!         .with(stats.clone()),
//! ));
//! let db = db.log_mode(true);
//! ```

mod monitors;
mod types;

#[cfg(test)]
mod tests;

pub use monitors::{CompositeMonitor, LoggingMonitor, NoopMonitor, QueryStats, StatsMonitor};
pub use types::{HookAction, QueryContext, QueryHook, QueryMonitor, QueryResult, QueryType};

pub(crate) fn truncate_sql_bytes(sql: &str, max_bytes: usize) -> &str {
    if sql.len() <= max_bytes {
        return sql;
    }
    let mut end = max_bytes;
    while end > 0 && !sql.is_char_boundary(end) {
        end -= 1;
    }
    &sql[..end]
}
