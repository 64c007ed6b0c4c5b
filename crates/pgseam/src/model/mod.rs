//! Model metadata: tables, columns and the destinations readers fill.

mod destination;
mod inflection;
mod pg_type;

pub use destination::{Destination, fill_model};
pub use inflection::pluralize;
pub use pg_type::PgType;

use crate::error::OrmResult;
use crate::value::{Record, from_record, to_record};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::any::TypeId;

/// Column used for soft deletes.
pub const DELETED_AT: &str = "deleted_at";
/// Column filled on create.
pub const CREATED_AT: &str = "created_at";
/// Column refreshed on every update that runs callbacks.
pub const UPDATED_AT: &str = "updated_at";

/// A persisted struct.
///
/// Usually derived:
///
/// ```ignore
/// #[derive(Debug, Default, Serialize, Deserialize, Model)]
/// #[orm(table = "accounts")]
/// struct User {
///     #[orm(id)]
///     id: i64,
///     #[orm(unique_index)]
///     email: String,
///     deleted_at: Option<chrono::DateTime<chrono::Utc>>,
/// }
/// ```
pub trait Model: Destination + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Snake-case singular type name (`CreditCard` -> `credit_card`).
    const NAME: &'static str;
    /// Explicit table name.
    const TABLE: Option<&'static str> = None;
    /// Primary key column.
    const PRIMARY_KEY: &'static str = "id";

    /// Column definitions, in declaration order.
    fn fields() -> Vec<Field>;
}

/// One column of a table schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub sql_type: String,
    pub nullable: bool,
    pub primary_key: bool,
    pub unique: bool,
    pub index: bool,
    pub unique_index: bool,
    pub default: Option<String>,
}

impl Field {
    pub fn new(name: impl Into<String>, sql_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql_type: sql_type.into(),
            nullable: false,
            primary_key: false,
            unique: false,
            index: false,
            unique_index: false,
            default: None,
        }
    }

    /// Column definition derived from a Rust type.
    pub fn of<T: PgType>(name: impl Into<String>) -> Self {
        Self::new(name, T::pg_type()).nullable(T::nullable())
    }

    pub fn nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn index(mut self) -> Self {
        self.index = true;
        self
    }

    pub fn unique_index(mut self) -> Self {
        self.unique_index = true;
        self
    }

    pub fn default_value(mut self, expr: impl Into<String>) -> Self {
        self.default = Some(expr.into());
        self
    }

    /// Integer primary keys become `serial`/`bigserial`.
    pub fn is_auto_increment(&self) -> bool {
        self.primary_key
            && self.default.is_none()
            && matches!(self.sql_type.as_str(), "integer" | "bigint" | "smallint")
    }
}

/// Table definition used by schema operations and by the engine to resolve
/// table names, primary keys, timestamps and soft deletes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    /// Snake-case singular model name.
    pub name: String,
    /// Explicit table name, bypassing pluralisation.
    pub table: Option<String>,
    pub primary_key: String,
    pub fields: Vec<Field>,
}

impl TableSchema {
    /// A schema for an explicitly named table.
    pub fn new(table: impl Into<String>) -> Self {
        let table = table.into();
        Self {
            name: table.clone(),
            table: Some(table),
            primary_key: "id".to_string(),
            fields: Vec::new(),
        }
    }

    /// Schema of a model type.
    pub fn of<T: Model>() -> Self {
        Self {
            name: T::NAME.to_string(),
            table: T::TABLE.map(str::to_string),
            primary_key: T::PRIMARY_KEY.to_string(),
            fields: T::fields(),
        }
    }

    pub fn field(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }

    pub fn with_primary_key(mut self, column: impl Into<String>) -> Self {
        self.primary_key = column.into();
        self
    }

    /// Table name: explicit name, else the model name (singular tables) or its plural.
    pub fn table_name(&self, singular: bool) -> String {
        match &self.table {
            Some(table) => table.clone(),
            None if singular => self.name.clone(),
            None => pluralize(&self.name),
        }
    }

    pub fn column(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    /// Whether deletes set `deleted_at` instead of removing rows.
    pub fn soft_delete(&self) -> bool {
        self.has_column(DELETED_AT)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }
}

/// A table named directly or through its schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableRef {
    Name(String),
    Schema(TableSchema),
}

impl TableRef {
    pub fn of<T: Model>() -> Self {
        Self::Schema(TableSchema::of::<T>())
    }

    pub fn table_name(&self, singular: bool) -> String {
        match self {
            TableRef::Name(name) => name.clone(),
            TableRef::Schema(schema) => schema.table_name(singular),
        }
    }
}

impl From<&str> for TableRef {
    fn from(name: &str) -> Self {
        TableRef::Name(name.to_string())
    }
}

impl From<String> for TableRef {
    fn from(name: String) -> Self {
        TableRef::Name(name)
    }
}

impl From<TableSchema> for TableRef {
    fn from(schema: TableSchema) -> Self {
        TableRef::Schema(schema)
    }
}

/// A bare record is a model without declared columns; pair it with
/// `table(name)` to write rows of any table.
impl Model for Record {
    const NAME: &'static str = "record";

    fn fields() -> Vec<Field> {
        Vec::new()
    }
}

/// Schema of a model type; `None` for bare records, whose table comes from
/// the session.
pub(crate) fn schema_of<T: Model>() -> Option<TableSchema> {
    (TypeId::of::<T>() != TypeId::of::<Record>()).then(TableSchema::of::<T>)
}

/// Merge a stored row into the caller's value, keeping fields that are not columns.
pub(crate) fn merge_into<T: Model>(value: &mut T, returned: Record) -> OrmResult<()> {
    let mut full = to_record(value)?;
    full.extend(returned);
    *value = from_record(full)?;
    Ok(())
}

/// Serialise a model, keeping only its declared columns.
pub(crate) fn model_record<T: Model>(value: &T) -> OrmResult<Record> {
    let mut record = to_record(value)?;
    let fields = T::fields();
    if !fields.is_empty() {
        record.retain(|k, _| fields.iter().any(|f| &f.name == k));
    }
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_name_resolution() {
        let mut schema = TableSchema::new("ignored");
        schema.table = None;
        schema.name = "credit_card".into();
        assert_eq!(schema.table_name(false), "credit_cards");
        assert_eq!(schema.table_name(true), "credit_card");

        schema.table = Some("cards".into());
        assert_eq!(schema.table_name(false), "cards");
    }

    #[test]
    fn integer_primary_keys_auto_increment() {
        assert!(Field::of::<i64>("id").primary_key().is_auto_increment());
        assert!(!Field::of::<uuid::Uuid>("id").primary_key().is_auto_increment());
        assert!(
            !Field::of::<i64>("id")
                .primary_key()
                .default_value("nextval('ids')")
                .is_auto_increment()
        );
    }

    #[test]
    fn soft_delete_follows_deleted_at_column() {
        let schema = TableSchema::new("users").field(Field::of::<Option<String>>(DELETED_AT));
        assert!(schema.soft_delete());
        assert!(!TableSchema::new("users").soft_delete());
    }
}
