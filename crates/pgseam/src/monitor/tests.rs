use super::*;
use crate::callbacks::Operation;
use std::time::Duration;

fn ctx(sql: &str) -> QueryContext {
    QueryContext::new(Operation::Query, sql, 0)
}

#[test]
fn test_query_type_detection() {
    assert_eq!(QueryType::from_sql("SELECT * FROM users"), QueryType::Select);
    assert_eq!(QueryType::from_sql("  select * FROM users"), QueryType::Select);
    assert_eq!(
        QueryType::from_sql("WITH cte AS (SELECT 1) SELECT * FROM cte"),
        QueryType::Select
    );
    assert_eq!(
        QueryType::from_sql("WITH moved AS (SELECT 1) DELETE FROM users"),
        QueryType::Delete
    );
    assert_eq!(
        QueryType::from_sql(r#"INSERT INTO "users" ("name") VALUES ($1)"#),
        QueryType::Insert
    );
    assert_eq!(QueryType::from_sql("UPDATE users SET name = $1"), QueryType::Update);
    assert_eq!(QueryType::from_sql("CREATE TABLE users (id INT)"), QueryType::Other);
    assert_eq!(QueryType::from_sql("BEGIN"), QueryType::Other);
}

#[test]
fn test_logging_monitor_truncation() {
    let monitor = LoggingMonitor::new().max_sql_length(Some(10));
    assert_eq!(monitor.truncate_sql("SELECT * FROM users"), "SELECT * F...");
    assert_eq!(monitor.truncate_sql("SELECT 1"), "SELECT 1");
    let whole = LoggingMonitor::new().max_sql_length(None);
    assert_eq!(whole.truncate_sql(&"x".repeat(4096)).len(), 4096);
}

#[test]
fn test_truncate_respects_char_boundaries() {
    assert_eq!(truncate_sql_bytes("héllo", 2), "h");
}

#[test]
fn test_stats_monitor() {
    let monitor = StatsMonitor::new();
    let select = ctx("SELECT * FROM users");
    let delete = QueryContext::new(Operation::Delete, "DELETE FROM users", 0);

    monitor.on_query_complete(&select, Duration::from_millis(10), &QueryResult::Rows(5));
    monitor.on_query_complete(&select, Duration::from_millis(20), &QueryResult::NotFound);
    monitor.on_query_complete(
        &delete,
        Duration::from_millis(5),
        &QueryResult::error("boom".into()),
    );
    monitor.on_slow_query(&select, Duration::from_millis(20));

    let stats = monitor.stats();
    assert_eq!(stats.total_queries, 3);
    assert_eq!(stats.count(Operation::Query), 2);
    assert_eq!(stats.count(Operation::Delete), 1);
    assert_eq!(stats.count(Operation::Create), 0);
    assert_eq!(stats.failed_queries, 1);
    assert_eq!(stats.not_found, 1);
    assert_eq!(stats.slow_queries, 1);
    assert_eq!(stats.total_duration, Duration::from_millis(35));
    assert_eq!(stats.max_duration, Duration::from_millis(20));
    assert_eq!(stats.slowest_query.as_deref(), Some("SELECT * FROM users"));

    monitor.reset();
    assert_eq!(monitor.stats().total_queries, 0);
    assert!(monitor.stats().slowest_query.is_none());
}

#[test]
fn test_error_result_is_truncated() {
    let long = "x".repeat(2000);
    match QueryResult::error(long) {
        QueryResult::Error(msg) => assert_eq!(msg.len(), 515),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn test_composite_monitor_fans_out() {
    let a = std::sync::Arc::new(StatsMonitor::new());
    let b = std::sync::Arc::new(StatsMonitor::new());
    let composite = CompositeMonitor::new().with(a.clone()).with(b.clone());
    composite.on_query_complete(&ctx("SELECT 1"), Duration::from_millis(1), &QueryResult::Rows(1));
    assert_eq!(a.stats().total_queries, 1);
    assert_eq!(b.stats().total_queries, 1);
}
