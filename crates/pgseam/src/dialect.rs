//! SQL dialect: column types, key names and schema introspection queries.

use crate::error::OrmResult;
use crate::ident;
use crate::model::Field;
use crate::sql::Sql;
use std::fmt;
use std::sync::OnceLock;

/// PostgreSQL limits identifiers to 63 bytes.
pub const MAX_IDENT_LEN: usize = 63;

/// Dialect-specific SQL used by schema operations.
///
/// Introspection methods return statements yielding a single `count`.
pub trait Dialect: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn quote(&self, name: &str) -> OrmResult<String> {
        ident::quote(name)
    }

    /// Column type used in `CREATE TABLE` / `ADD COLUMN`.
    fn data_type_of(&self, field: &Field) -> String;

    fn has_table(&self, table: &str) -> Sql;

    fn has_column(&self, table: &str, column: &str) -> Sql;

    fn has_index(&self, table: &str, index: &str) -> Sql;

    fn has_foreign_key(&self, table: &str, key: &str) -> Sql;

    fn remove_index(&self, table: &str, index: &str) -> OrmResult<Sql>;

    /// Sanitised constraint/index name from its parts.
    fn build_key_name(&self, parts: &[&str]) -> String;

    fn current_database(&self) -> Sql;
}

/// The PostgreSQL dialect.
#[derive(Debug, Clone, Copy, Default)]
pub struct Postgres;

impl Dialect for Postgres {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn data_type_of(&self, field: &Field) -> String {
        if field.is_auto_increment() {
            return match field.sql_type.as_str() {
                "smallint" => "smallserial",
                "integer" => "serial",
                _ => "bigserial",
            }
            .to_string();
        }
        field.sql_type.clone()
    }

    fn has_table(&self, table: &str) -> Sql {
        let mut q = Sql::new(
            "SELECT count(*) FROM INFORMATION_SCHEMA.tables WHERE table_schema = CURRENT_SCHEMA() \
             AND table_type = 'BASE TABLE' AND table_name = ",
        );
        q.push_bind(table_value(table));
        q
    }

    fn has_column(&self, table: &str, column: &str) -> Sql {
        let mut q = Sql::new(
            "SELECT count(*) FROM INFORMATION_SCHEMA.columns WHERE table_schema = CURRENT_SCHEMA() \
             AND table_name = ",
        );
        q.push_bind(table_value(table))
            .push(" AND column_name = ")
            .push_bind(column.to_string());
        q
    }

    fn has_index(&self, table: &str, index: &str) -> Sql {
        let mut q = Sql::new(
            "SELECT count(*) FROM pg_indexes WHERE schemaname = CURRENT_SCHEMA() AND tablename = ",
        );
        q.push_bind(table_value(table))
            .push(" AND indexname = ")
            .push_bind(index.to_string());
        q
    }

    fn has_foreign_key(&self, table: &str, key: &str) -> Sql {
        let mut q = Sql::new(
            "SELECT count(con.conname) FROM pg_constraint con \
             WHERE con.contype = 'f' AND con.conrelid = to_regclass(",
        );
        q.push_bind(table.to_string())
            .push("::text) AND con.conname = ")
            .push_bind(key.to_string());
        q
    }

    fn remove_index(&self, _table: &str, index: &str) -> OrmResult<Sql> {
        let mut q = Sql::new("DROP INDEX ");
        q.push_ident(index)?;
        Ok(q)
    }

    fn build_key_name(&self, parts: &[&str]) -> String {
        static NON_WORD: OnceLock<regex::Regex> = OnceLock::new();
        let re = NON_WORD.get_or_init(|| {
            regex::Regex::new(r"[^a-zA-Z0-9]+").expect("invalid built-in key name regex")
        });
        let name = re.replace_all(&parts.join("_"), "_").into_owned();
        truncate_ident(name)
    }

    fn current_database(&self) -> Sql {
        Sql::new("SELECT CURRENT_DATABASE()")
    }
}

/// Introspection compares against the unqualified table name.
fn table_value(table: &str) -> String {
    table.rsplit('.').next().unwrap_or(table).to_string()
}

fn truncate_ident(mut name: String) -> String {
    if name.len() > MAX_IDENT_LEN {
        let mut end = MAX_IDENT_LEN;
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        name.truncate(end);
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn foreign_key_names_are_sanitised() {
        let name = Postgres.build_key_name(&["orders", "user_id", "users(id)", "foreign"]);
        assert_eq!(name, "orders_user_id_users_id_foreign");
    }

    #[test]
    fn key_names_are_truncated() {
        let long = "x".repeat(80);
        let name = Postgres.build_key_name(&["idx", &long]);
        assert_eq!(name.len(), MAX_IDENT_LEN);
        assert!(name.starts_with("idx_x"));
    }

    #[test]
    fn integer_primary_keys_become_serial() {
        let id = Field::new("id", "bigint").primary_key();
        assert_eq!(Postgres.data_type_of(&id), "bigserial");
        let small = Field::new("id", "integer").primary_key();
        assert_eq!(Postgres.data_type_of(&small), "serial");
        let uuid = Field::new("id", "uuid").primary_key();
        assert_eq!(Postgres.data_type_of(&uuid), "uuid");
        let with_default = Field::new("id", "bigint").primary_key().default_value("42");
        assert_eq!(Postgres.data_type_of(&with_default), "bigint");
    }

    #[test]
    fn introspection_binds_names() {
        let q = Postgres.has_column("public.users", "email");
        assert!(q.to_sql().contains("table_name = $1 AND column_name = $2"));
        assert_eq!(q.params()[0].as_json(), "users");
        assert_eq!(q.params()[1].as_json(), "email");

        let q = Postgres.remove_index("users", "idx_users_email").unwrap();
        assert_eq!(q.to_sql(), r#"DROP INDEX "idx_users_email""#);
    }

    #[test]
    fn foreign_key_lookup_casts_the_table_to_text() {
        let q = Postgres.has_foreign_key("orders", "orders_user_id_fkey");
        assert!(q.to_sql().contains("to_regclass($1::text) AND con.conname = $2"));
        assert_eq!(q.params()[0].as_json(), "orders");
    }
}
