//! Compile-only tests for the public API.
//!
//! These check types and signatures; nothing here talks to a database.

#![allow(dead_code)]

use pgseam::{
    Clause, Config, Context, Db, FakeDb, JoinTable, Model, Orm, OrmResult, Record, Rows, TableRef,
    TableSchema, clause,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Default, Clone, Serialize, Deserialize, Model)]
struct CompileUser {
    id: i64,
    name: String,
    deleted_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize, Model)]
struct CompileLanguage {
    id: i64,
    name: String,
}

fn assert_orm<D: Orm>() {}
fn assert_send<T: Send>(_: &T) {}

#[test]
fn both_handles_implement_the_contract() {
    assert_orm::<Db>();
    assert_orm::<FakeDb>();
}

// Every terminal call is usable from a spawned task.
async fn terminal_calls<D: Orm>(db: D) -> OrmResult<()> {
    let mut user = CompileUser::default();
    let mut users: Vec<CompileUser> = Vec::new();
    let mut maybe: Option<CompileUser> = None;
    let mut record = Record::new();
    let mut names: Vec<String> = Vec::new();
    let mut n = 0i64;

    let scoped = db
        .with_context(Context::new().with_timeout(Duration::from_secs(1)).with_tag("compile"))
        .where_(clause!("name = ?", "jinzhu"))
        .or(Clause::in_list("id", [1, 2]))
        .not(Clause::is_null("name"))
        .order("id desc", true)
        .limit(10)
        .offset(5)
        .select("id, name")
        .omit(&["deleted_at"])
        .group("name")
        .having(clause!("count(*) > ?", 1))
        .joins("JOIN emails ON emails.user_id = users.id")
        .scopes([|s: D| s.unscoped()])
        .set("tenant", serde_json::json!(1))
        .preload("emails", &[]);

    scoped.first(&mut user, &[]).await;
    scoped.take(&mut user, &[Clause::primary_key(1)]).await;
    scoped.last(&mut user, &[]).await;
    scoped.find(&mut users, &[]).await;
    scoped.find(&mut maybe, &[]).await;
    scoped.scan(&mut record).await;
    scoped.row().await.record()?;
    let rows: Rows = scoped.rows().await?;
    scoped.scan_rows(&rows, &mut users)?;
    scoped.pluck("name", &mut names).await;
    scoped.count(&mut n).await;
    scoped.attrs(&serde_json::json!({ "name": "x" })).first_or_init(&mut user, &[]).await;
    scoped.assign(&serde_json::json!({ "name": "y" })).first_or_create(&mut user, &[]).await;
    scoped.related(&mut users, &["user_id"]).await;

    db.create(&mut user).await;
    db.save(&mut user).await;
    db.model(&user).update("name", "hello").await;
    db.model(&user).updates(&serde_json::json!({ "name": "hello" }), true).await;
    db.model(&user).update_column("name", "hello").await;
    db.model(&user).update_columns(&serde_json::json!({ "name": "hello" })).await;
    db.delete(&user, &[Clause::eq("name", "hello")]).await;
    db.exec(clause!("UPDATE users SET name = ?", "x")).await;

    let tx = db.begin().await;
    tx.commit().await;
    tx.rollback().await;

    let schema = TableSchema::of::<CompileUser>();
    db.create_table(std::slice::from_ref(&schema)).await;
    db.auto_migrate(&[schema]).await;
    db.has_table(TableRef::of::<CompileUser>()).await;
    db.drop_table(&["users".into()]).await;
    db.drop_table_if_exists(&[TableRef::of::<CompileUser>()]).await;
    let users_table = db.model(&user);
    users_table.modify_column("name", "text").await;
    users_table.drop_column("name").await;
    users_table.add_index("idx_name", &["name"]).await;
    users_table.add_unique_index("uix_name", &["name"]).await;
    users_table.remove_index("idx_name").await;
    users_table.add_foreign_key("user_id", "users(id)", "CASCADE", "RESTRICT").await;
    users_table.remove_foreign_key("user_id", "users(id)").await;

    db.set_join_table_handler::<CompileUser>(
        "languages",
        Arc::new(JoinTable::between::<CompileUser, CompileLanguage>()),
    );
    let mut languages: Vec<CompileLanguage> = Vec::new();
    let mut association = db.model(&user).association("languages");
    association.find(&mut languages).await;
    let _ = association.count().await;

    let mut handle = db.new_session();
    handle.instant_set("tenant", serde_json::json!(2));
    let _ = handle.get("tenant");
    let _ = handle.add_error(pgseam::OrmError::validation("x"));
    let _ = (handle.error(), handle.get_errors(), handle.record_not_found(), handle.rows_affected());
    let _ = (handle.value(), handle.model_meta(), handle.new_record(&user));
    let _ = (handle.db(), handle.common_db(), handle.dialect(), handle.callback());
    let _ = handle.debug().log_mode(false).block_global_update(true).has_block_global_update();
    handle.singular_table(false);
    handle.close()
}

#[test]
fn terminal_futures_are_send() {
    let fut = terminal_calls(FakeDb::new());
    assert_send(&fut);
}

fn config_builder() -> Config {
    Config::new("postgres://localhost/app")
        .max_connections(4)
        .log_mode(pgseam::LogMode::Detailed)
        .singular_table(true)
        .block_global_update(true)
        .query_timeout(Duration::from_secs(5))
        .slow_query_threshold(Duration::from_millis(200))
}
