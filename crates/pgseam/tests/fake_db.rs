//! Application code written against `Orm`, exercised with `FakeDb`.

use pgseam::{Clause, FakeDb, Model, Orm, OrmError, OrmResult, clause};
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize, Model)]
struct Account {
    id: i64,
    #[orm(unique_index)]
    email: String,
    balance: i64,
    created_at: Option<String>,
    updated_at: Option<String>,
}

// -- code under test: only knows the trait --

async fn register<D: Orm>(db: &D, email: &str) -> OrmResult<Account> {
    let mut account = Account {
        email: email.to_string(),
        ..Default::default()
    };
    match db.create(&mut account).await.error() {
        Some(err) => Err(err),
        None => Ok(account),
    }
}

async fn transfer<D: Orm>(db: &D, from: i64, to: i64, amount: i64) -> OrmResult<()> {
    let tx = db.begin().await;
    if let Some(err) = tx.error() {
        return Err(err);
    }
    for (id, delta) in [(from, -amount), (to, amount)] {
        let mut account = Account::default();
        let found = tx.first(&mut account, &[Clause::primary_key(id)]).await;
        if let Some(err) = found.error() {
            tx.rollback().await;
            return Err(err);
        }
        if account.balance + delta < 0 {
            tx.rollback().await;
            return Err(OrmError::validation("insufficient funds"));
        }
        let updated = tx.model(&account).update("balance", account.balance + delta).await;
        if let Some(err) = updated.error() {
            tx.rollback().await;
            return Err(err);
        }
    }
    match tx.commit().await.error() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

async fn richest<D: Orm>(db: &D, n: i64) -> OrmResult<Vec<String>> {
    let mut emails = Vec::new();
    let plucked = db
        .model(&Account::default())
        .where_(clause!("balance > ?", 0))
        .order("balance desc", false)
        .limit(n)
        .pluck("email", &mut emails)
        .await;
    match plucked.error() {
        Some(err) => Err(err),
        None => Ok(emails),
    }
}

fn seeded() -> FakeDb {
    let db = FakeDb::new();
    db.seed(
        "accounts",
        [
            json!({ "id": 1, "email": "a@example.com", "balance": 100 }),
            json!({ "id": 2, "email": "b@example.com", "balance": 0 }),
            json!({ "id": 3, "email": "c@example.com", "balance": 250 }),
        ],
    )
    .unwrap();
    db
}

#[tokio::test]
async fn register_creates_and_stamps() {
    let db = FakeDb::new();

    let account = register(&db, "new@example.com").await.unwrap();
    assert_eq!(account.id, 1);
    assert!(account.created_at.is_some());
    assert!(account.updated_at.is_some());

    let err = register(&db, "new@example.com").await.unwrap_err();
    assert!(matches!(err, OrmError::UniqueViolation(_)));
    assert_eq!(db.calls_to("create").len(), 2);
}

#[tokio::test]
async fn transfer_moves_balance_atomically() {
    let db = seeded();

    transfer(&db, 1, 2, 40).await.unwrap();
    let balances: Vec<_> = db.table_rows("accounts").iter().map(|r| r["balance"].clone()).collect();
    assert_eq!(balances, vec![json!(60), json!(40), json!(250)]);

    let err = transfer(&db, 2, 3, 1000).await.unwrap_err();
    assert!(matches!(err, OrmError::Validation(_)));
    assert_eq!(db.table_rows("accounts")[1]["balance"], json!(40));
    assert_eq!(db.calls_to("rollback").len(), 1);
}

#[tokio::test]
async fn transfer_rolls_back_when_the_second_leg_fails() {
    let db = seeded();

    let err = transfer(&db, 1, 99, 10).await.unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(db.table_rows("accounts")[0]["balance"], json!(100));
}

#[tokio::test]
async fn transfer_runs_on_spawned_tasks_and_surfaces_failures() {
    let db = seeded();
    db.clear_calls();

    let handle = db.clone();
    tokio::spawn(async move { transfer(&handle, 1, 2, 5).await })
        .await
        .unwrap()
        .unwrap();
    let terminal: Vec<_> = db
        .calls()
        .into_iter()
        .map(|c| c.method)
        .filter(|m| ["begin", "first", "update", "commit"].contains(m))
        .collect();
    assert_eq!(terminal, vec!["begin", "first", "update", "first", "update", "commit"]);

    db.fail_next(OrmError::Connection("connection reset".into()));
    let err = transfer(&db, 1, 2, 5).await.unwrap_err();
    assert!(matches!(err, OrmError::Connection(_)));
    assert_eq!(db.table_rows("accounts")[0]["balance"], json!(95));
}

#[tokio::test]
async fn richest_filters_sorts_and_limits() {
    let db = seeded();
    assert_eq!(richest(&db, 1).await.unwrap(), vec!["c@example.com"]);
    assert_eq!(richest(&db, 5).await.unwrap(), vec!["c@example.com", "a@example.com"]);
}

#[tokio::test]
async fn unsupported_sql_is_reported_not_guessed() {
    let db = seeded();

    let mut out: Vec<Account> = Vec::new();
    let joined = db
        .joins("JOIN orders ON orders.account_id = accounts.id")
        .find(&mut out, &[])
        .await;
    assert!(matches!(joined.error(), Some(OrmError::Unsupported(_))));

    let functions = db.where_("lower(email) = 'a@example.com'").find(&mut out, &[]).await;
    assert!(matches!(functions.error(), Some(OrmError::Unsupported(_))));
}

#[tokio::test]
async fn handles_share_storage_but_not_conditions() {
    let db = seeded();
    let scoped = db.where_(clause!("balance >= ?", 100));

    let mut all: Vec<Account> = Vec::new();
    db.find(&mut all, &[]).await;
    let mut rich: Vec<Account> = Vec::new();
    scoped.find(&mut rich, &[]).await;
    assert_eq!((all.len(), rich.len()), (3, 2));

    scoped.delete(&Account::default(), &[]).await;
    assert_eq!(db.table_rows("accounts").len(), 1);
}
