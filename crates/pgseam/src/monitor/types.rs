use crate::callbacks::Operation;
use crate::sql::leading_keyword;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// The type of SQL statement being executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryType {
    Select,
    Insert,
    Update,
    Delete,
    /// DDL, transaction control and anything else.
    Other,
}

impl QueryType {
    /// Classify a statement by its leading keyword. For `WITH` statements the
    /// first top-level keyword after the CTE bodies decides.
    pub fn from_sql(sql: &str) -> Self {
        match leading_keyword(sql).as_str() {
            "WITH" => Self::after_ctes(sql),
            keyword => Self::from_keyword(keyword),
        }
    }

    fn from_keyword(keyword: &str) -> Self {
        match keyword {
            "SELECT" | "VALUES" | "TABLE" | "SHOW" => QueryType::Select,
            "INSERT" => QueryType::Insert,
            "UPDATE" => QueryType::Update,
            "DELETE" => QueryType::Delete,
            _ => QueryType::Other,
        }
    }

    fn after_ctes(sql: &str) -> Self {
        let mut depth = 0usize;
        let mut word = String::new();
        for c in sql.chars().chain([' ']) {
            if depth == 0 && c.is_ascii_alphabetic() {
                word.push(c.to_ascii_uppercase());
                continue;
            }
            match c {
                '(' => depth += 1,
                ')' => depth = depth.saturating_sub(1),
                _ => {}
            }
            if let kind @ (QueryType::Select | QueryType::Insert | QueryType::Update | QueryType::Delete) =
                Self::from_keyword(&word)
            {
                return kind;
            }
            word.clear();
        }
        QueryType::Select
    }
}

/// What callbacks, monitors and loggers learn about a statement.
#[derive(Debug, Clone)]
pub struct QueryContext {
    /// SQL sent to PostgreSQL (after callback rewrites).
    pub sql: String,
    pub param_count: usize,
    pub query_type: QueryType,
    /// Engine operation that produced the statement.
    pub operation: Operation,
    /// Main table, when known.
    pub table: Option<String>,
    /// Tag attached with `with_context`.
    pub tag: Option<String>,
    /// Snapshot of the session settings (`set`/`instant_set`).
    pub settings: BTreeMap<String, Value>,
}

impl QueryContext {
    pub fn new(operation: Operation, sql: &str, param_count: usize) -> Self {
        Self {
            sql: sql.to_string(),
            param_count,
            query_type: QueryType::from_sql(sql),
            operation,
            table: None,
            tag: None,
            settings: BTreeMap::new(),
        }
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// Look up a session setting.
    pub fn setting(&self, key: &str) -> Option<&Value> {
        self.settings.get(key)
    }
}

/// Maximum length for error messages in `QueryResult::Error`.
const MAX_ERROR_LEN: usize = 512;

/// Result of a statement for monitoring purposes.
#[derive(Debug, Clone)]
pub enum QueryResult {
    /// Statement returned rows.
    Rows(usize),
    /// Statement affected rows.
    Affected(u64),
    /// A single-valued read found nothing.
    NotFound,
    /// Statement failed (message truncated to 512 bytes).
    Error(String),
}

impl QueryResult {
    /// An error outcome; messages over 512 bytes are cut and marked with `...`.
    pub fn error(mut msg: String) -> Self {
        if msg.len() > MAX_ERROR_LEN {
            let kept = super::truncate_sql_bytes(&msg, MAX_ERROR_LEN).len();
            msg.truncate(kept);
            msg.push_str("...");
        }
        Self::Error(msg)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, QueryResult::Error(_))
    }
}

impl fmt::Display for QueryResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryResult::Rows(n) => write!(f, "{n} rows"),
            QueryResult::Affected(n) => write!(f, "{n} affected"),
            QueryResult::NotFound => f.write_str("record not found"),
            QueryResult::Error(e) => write!(f, "error: {e}"),
        }
    }
}

/// Receives completed statements; installed with `set_logger`.
///
/// Which statements reach the monitor depends on the session log mode:
/// failures only by default, everything with `log_mode(true)`, nothing with
/// `log_mode(false)`.
pub trait QueryMonitor: Send + Sync {
    /// Called after a statement completes (success or failure).
    fn on_query_complete(&self, ctx: &QueryContext, duration: Duration, result: &QueryResult);

    /// Called when a statement exceeds the slow query threshold.
    fn on_slow_query(&self, _ctx: &QueryContext, _duration: Duration) {}
}

/// Action a callback asks for before a statement runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookAction {
    Continue,
    /// Run different SQL (same parameters).
    ModifySql(String),
    /// Do not run the statement; the session records the reason as an error.
    Abort(String),
}

/// A callback around statement execution, registered per operation in
/// [`Callbacks`](crate::callbacks::Callbacks).
pub trait QueryHook: Send + Sync {
    fn before_query(&self, ctx: &QueryContext) -> HookAction {
        let _ = ctx;
        HookAction::Continue
    }

    fn after_query(&self, _ctx: &QueryContext, _duration: Duration, _result: &QueryResult) {}
}
