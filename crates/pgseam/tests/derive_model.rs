#![allow(dead_code)]

use pgseam::{Destination, Field, Model, TableSchema};
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Serialize, Deserialize, Model)]
struct CreditCard {
    id: i64,
    number: String,
    user_id: Option<i64>,
}

#[derive(Debug, Default, Serialize, Deserialize, Model)]
#[orm(table = "accounts")]
struct User {
    #[orm(id)]
    user_id: i64,
    #[orm(unique_index)]
    email: String,
    #[orm(type = "varchar(64)", default = "'anonymous'")]
    name: String,
    #[serde(rename = "birth")]
    birthday: Option<chrono::NaiveDate>,
    #[orm(index)]
    age: i32,
    #[orm(skip)]
    #[serde(skip)]
    cached: Vec<String>,
    tags: Vec<String>,
}

#[derive(Debug, Default, Serialize, Deserialize, Model)]
#[orm(primary_key = "code")]
struct Language {
    code: String,
    #[orm(unique)]
    name: String,
}

#[test]
fn names_and_defaults() {
    assert_eq!(CreditCard::NAME, "credit_card");
    assert_eq!(CreditCard::TABLE, None);
    assert_eq!(CreditCard::PRIMARY_KEY, "id");
    assert_eq!(TableSchema::of::<CreditCard>().table_name(false), "credit_cards");
    assert_eq!(TableSchema::of::<CreditCard>().table_name(true), "credit_card");

    assert_eq!(User::TABLE, Some("accounts"));
    assert_eq!(User::PRIMARY_KEY, "user_id");
    assert_eq!(Language::PRIMARY_KEY, "code");
}

#[test]
fn field_definitions() {
    let fields = User::fields();
    let names: Vec<&str> = fields.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, vec!["user_id", "email", "name", "birth", "age", "tags"]);

    assert_eq!(fields[0], Field::of::<i64>("user_id").primary_key());
    assert!(fields[1].unique_index);
    assert_eq!(fields[2].sql_type, "varchar(64)");
    assert_eq!(fields[2].default.as_deref(), Some("'anonymous'"));
    assert!(!fields[2].nullable);
    assert!(fields[3].nullable);
    assert_eq!(fields[3].sql_type, "date");
    assert!(fields[4].index);
    assert_eq!(fields[5].sql_type, "text[]");

    let language = Language::fields();
    assert!(language[0].primary_key);
    assert!(language[1].unique);
}

#[test]
fn derived_models_are_single_destinations() {
    assert!(<User as Destination>::SINGLE);
    assert_eq!(User::schema(), Some(TableSchema::of::<User>()));

    let mut card = CreditCard::default();
    let record = serde_json::json!({ "id": 9, "number": "4242", "user_id": null });
    let serde_json::Value::Object(record) = record else {
        unreachable!()
    };
    card.fill(vec![record]).unwrap();
    assert_eq!(card.id, 9);
    assert_eq!(card.user_id, None);
}
