//! Round trips against a live PostgreSQL; skipped when `DATABASE_URL` is unset.

use pgseam::{
    Clause, Config, Db, JoinTable, Model, Operation, Orm, OrmError, OrmResult, Record, StatsMonitor, TableRef,
    TableSchema, clause,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize, Model)]
struct PgseamUser {
    id: i64,
    #[orm(unique_index)]
    name: String,
    age: i32,
    created_at: Option<chrono::DateTime<chrono::Utc>>,
    updated_at: Option<chrono::DateTime<chrono::Utc>>,
    deleted_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize, Model)]
struct PgseamEmail {
    id: i64,
    pgseam_user_id: i64,
    email: String,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize, Model)]
struct PgseamPrice {
    id: i64,
    amount: Decimal,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize, Model)]
struct PgseamLanguage {
    id: i64,
    name: String,
}

async fn connect(test: &str) -> OrmResult<Option<Db>> {
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;
    if config.database_url.is_none() {
        eprintln!("DATABASE_URL is not set; skipping {test}");
        return Ok(None);
    }
    let db = pgseam::open(config).await?;
    let tables = [
        TableRef::of::<PgseamUser>(),
        TableRef::of::<PgseamEmail>(),
        TableRef::of::<PgseamLanguage>(),
        TableRef::from("pgseam_user_pgseam_languages"),
        TableRef::of::<PgseamPrice>(),
    ];
    check(db.drop_table_if_exists(&tables).await)?;
    check(
        db.create_table(&[
            TableSchema::of::<PgseamUser>(),
            TableSchema::of::<PgseamEmail>(),
            TableSchema::of::<PgseamLanguage>(),
        ])
        .await,
    )?;
    check(
        db.exec("CREATE TABLE pgseam_user_pgseam_languages (pgseam_user_id bigint, pgseam_language_id bigint)")
            .await,
    )?;
    check(db.exec("CREATE TABLE pgseam_prices (id bigserial PRIMARY KEY, amount numeric(30, 2))").await)?;
    Ok(Some(db))
}

fn check(db: Db) -> OrmResult<Db> {
    match db.error() {
        Some(err) => Err(err),
        None => Ok(db),
    }
}

fn unique(prefix: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock before UNIX_EPOCH")
        .as_nanos();
    format!("{prefix}_{}_{nanos}", std::process::id())
}

// Tests share tables; run them one at a time.
static SERIAL: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

#[tokio::test]
async fn crud_round_trip() -> OrmResult<()> {
    let _guard = SERIAL.lock().await;
    let Some(db) = connect("crud_round_trip").await? else {
        return Ok(());
    };

    let name = unique("jinzhu");
    let mut user = PgseamUser {
        name: name.clone(),
        age: 18,
        ..Default::default()
    };
    let created = check(db.create(&mut user).await)?;
    assert_eq!(created.rows_affected(), 1);
    assert!(user.id > 0);
    assert!(user.created_at.is_some());

    let mut found = PgseamUser::default();
    check(db.where_(Clause::eq("name", &name)).first(&mut found, &[]).await)?;
    assert_eq!(found.id, user.id);

    check(db.model(&user).update("age", 19).await)?;
    let mut ages: Vec<i32> = Vec::new();
    check(db.model(&PgseamUser::default()).where_(Clause::primary_key(user.id)).pluck("age", &mut ages).await)?;
    assert_eq!(ages, vec![19]);

    let mut clash = PgseamUser {
        name: name.clone(),
        ..Default::default()
    };
    let err = db.create(&mut clash).await.error().unwrap();
    assert!(matches!(err, OrmError::UniqueViolation(_)));

    check(db.delete(&user, &[]).await)?;
    let mut gone = PgseamUser::default();
    assert!(db.first(&mut gone, &[Clause::primary_key(user.id)]).await.record_not_found());
    let mut n = 0;
    check(db.unscoped().model(&PgseamUser::default()).where_(Clause::primary_key(user.id)).count(&mut n).await)?;
    assert_eq!(n, 1);
    Ok(())
}

#[tokio::test]
async fn transactions_commit_and_roll_back() -> OrmResult<()> {
    let _guard = SERIAL.lock().await;
    let Some(db) = connect("transactions_commit_and_roll_back").await? else {
        return Ok(());
    };

    let tx = check(db.begin().await)?;
    let mut kept = PgseamUser {
        name: unique("kept"),
        ..Default::default()
    };
    check(tx.create(&mut kept).await)?;
    check(tx.commit().await)?;

    let tx = check(db.begin().await)?;
    let mut dropped = PgseamUser {
        name: unique("dropped"),
        ..Default::default()
    };
    check(tx.create(&mut dropped).await)?;
    check(tx.rollback().await)?;

    let mut n = 0;
    check(db.model(&PgseamUser::default()).count(&mut n).await)?;
    assert_eq!(n, 1);
    assert!(matches!(tx.commit().await.error(), Some(OrmError::InvalidTransaction(_))));
    Ok(())
}

#[tokio::test]
async fn preload_and_associations() -> OrmResult<()> {
    let _guard = SERIAL.lock().await;
    let Some(db) = connect("preload_and_associations").await? else {
        return Ok(());
    };

    let mut user = PgseamUser {
        name: unique("owner"),
        ..Default::default()
    };
    check(db.create(&mut user).await)?;
    for email in ["a@example.com", "b@example.com"] {
        let mut row = PgseamEmail {
            pgseam_user_id: user.id,
            email: email.into(),
            ..Default::default()
        };
        check(db.create(&mut row).await)?;
    }

    let mut out: Vec<pgseam::Record> = Vec::new();
    check(db.model(&PgseamUser::default()).preload("pgseam_emails", &[]).find(&mut out, &[]).await)?;
    assert_eq!(out[0]["pgseam_emails"].as_array().map(Vec::len), Some(2));

    let mut emails: Vec<PgseamEmail> = Vec::new();
    check(db.model(&user).related(&mut emails, &[]).await)?;
    assert_eq!(emails.len(), 2);

    db.set_join_table_handler::<PgseamUser>(
        "pgseam_languages",
        Arc::new(JoinTable::between::<PgseamUser, PgseamLanguage>()),
    );
    let mut languages = vec![PgseamLanguage {
        name: "EN".into(),
        ..Default::default()
    }];
    let mut association = db.model(&user).association("pgseam_languages");
    association.append(&mut languages).await;
    assert!(association.error().is_none(), "{:?}", association.error());
    assert_eq!(association.count().await, 1);
    Ok(())
}

#[tokio::test]
async fn query_timeout_cancels_the_statement() -> OrmResult<()> {
    let _guard = SERIAL.lock().await;
    let Some(db) = connect("query_timeout_cancels_the_statement").await? else {
        return Ok(());
    };

    let ctx = pgseam::Context::new().with_timeout(Duration::from_millis(100));
    let slow = db.with_context(ctx).exec("SELECT pg_sleep(5)").await;
    assert!(matches!(slow.error(), Some(OrmError::Timeout(_))));

    let mut rows: Vec<pgseam::Record> = Vec::new();
    check(db.raw(clause!("SELECT ?::bigint AS n", 7)).scan(&mut rows).await)?;
    assert_eq!(rows[0]["n"], serde_json::json!(7));
    Ok(())
}

#[tokio::test]
async fn numeric_columns_keep_every_digit() -> OrmResult<()> {
    let _guard = SERIAL.lock().await;
    let Some(db) = connect("numeric_columns_keep_every_digit").await? else {
        return Ok(());
    };

    let amount = Decimal::from_str("12345678901234567.89").unwrap();
    let mut price = PgseamPrice {
        amount,
        ..Default::default()
    };
    check(db.create(&mut price).await)?;

    let mut found = PgseamPrice::default();
    check(db.first(&mut found, &[Clause::primary_key(price.id)]).await)?;
    assert_eq!(found.amount, amount);

    let mut rows: Vec<Record> = Vec::new();
    check(
        db.raw(clause!("SELECT amount, ?::numeric AS big, 'NaN'::numeric AS nan FROM pgseam_prices", "98765432109876543210"))
            .scan(&mut rows)
            .await,
    )?;
    assert_eq!(rows[0]["amount"], serde_json::json!("12345678901234567.89"));
    assert_eq!(rows[0]["big"], serde_json::json!("98765432109876543210"));
    assert_eq!(rows[0]["nan"], serde_json::json!("NaN"));
    Ok(())
}

#[tokio::test]
async fn malformed_raw_sql_only_marks_the_outcome() -> OrmResult<()> {
    let _guard = SERIAL.lock().await;
    let Some(db) = connect("malformed_raw_sql_only_marks_the_outcome").await? else {
        return Ok(());
    };

    let broken = db.exec("SELEC 1 FROM nowhere").await;
    assert!(matches!(broken.error(), Some(OrmError::Query(_))), "{:?}", broken.error());
    assert_eq!(broken.get_errors().len(), 1);

    let mut rows: Vec<Record> = Vec::new();
    let skipped = broken.raw("SELECT 1 AS n").scan(&mut rows).await;
    assert!(skipped.error().is_some());
    assert!(rows.is_empty());

    check(db.raw("SELECT 1 AS n").scan(&mut rows).await)?;
    assert_eq!(rows[0]["n"], serde_json::json!(1));
    Ok(())
}

#[tokio::test]
async fn rows_cursor_runs_to_the_end_and_closes() -> OrmResult<()> {
    let _guard = SERIAL.lock().await;
    let Some(db) = connect("rows_cursor_runs_to_the_end_and_closes").await? else {
        return Ok(());
    };

    for name in ["first", "second", "third"] {
        let mut user = PgseamUser {
            name: unique(name),
            age: 30,
            ..Default::default()
        };
        check(db.create(&mut user).await)?;
    }

    let mut rows = db.model(&PgseamUser::default()).select("name, age").rows().await?;
    assert_eq!(rows.columns()?, vec!["name".to_string(), "age".to_string()]);
    let mut seen = 0;
    while rows.next().await {
        let record = rows.record()?;
        assert_eq!(record["age"], serde_json::json!(30));
        seen += 1;
    }
    rows.err()?;
    assert_eq!(seen, 3);
    assert!(rows.is_closed());
    assert!(!rows.next().await);

    let mut open = db.model(&PgseamUser::default()).rows().await?;
    assert!(open.next().await);
    open.close();
    open.close();
    assert!(open.columns().is_err());
    assert!(!open.next().await);
    Ok(())
}

#[tokio::test]
async fn row_without_a_match_is_not_found() -> OrmResult<()> {
    let _guard = SERIAL.lock().await;
    let Some(db) = connect("row_without_a_match_is_not_found").await? else {
        return Ok(());
    };

    let stats = Arc::new(StatsMonitor::new());
    db.set_logger(stats.clone());
    let traced = db.debug();

    let row = traced
        .model(&PgseamUser::default())
        .where_(Clause::eq("name", unique("nobody")))
        .row()
        .await;
    assert!(matches!(row.record(), Err(OrmError::RecordNotFound)));

    let mut missing = PgseamUser::default();
    assert!(traced.first(&mut missing, &[Clause::primary_key(-1)]).await.record_not_found());

    let mut none: Vec<PgseamUser> = Vec::new();
    check(traced.find(&mut none, &[Clause::primary_key(-1)]).await)?;

    let counted = stats.stats();
    assert_eq!(counted.not_found, 2);
    assert_eq!(counted.count(Operation::RowQuery), 1);
    assert_eq!(counted.count(Operation::Query), 2);
    Ok(())
}

#[tokio::test]
async fn shared_clients_refuse_transactions() -> OrmResult<()> {
    let _guard = SERIAL.lock().await;
    if connect("shared_clients_refuse_transactions").await?.is_none() {
        return Ok(());
    }
    let url = Config::from_env()?.database_url.unwrap_or_default();
    let (client, connection) = tokio_postgres::connect(&url, tokio_postgres::NoTls).await?;
    tokio::spawn(connection);
    let db = Db::from_client(Arc::new(client));

    let tx = db.begin().await;
    assert!(matches!(tx.error(), Some(OrmError::InvalidTransaction(_))));

    // Writes on the shared client stay outside any transaction.
    let mut user = PgseamUser {
        name: unique("shared"),
        ..Default::default()
    };
    check(db.create(&mut user).await)?;
    assert!(matches!(tx.rollback().await.error(), Some(OrmError::InvalidTransaction(_))));
    let mut n = 0;
    check(db.model(&PgseamUser::default()).where_(Clause::primary_key(user.id)).count(&mut n).await)?;
    assert_eq!(n, 1);
    Ok(())
}
