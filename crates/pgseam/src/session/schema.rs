//! Schema operations: tables, columns, indexes and foreign keys.

use super::Session;
use crate::callbacks::Operation;
use crate::dialect::Dialect;
use crate::error::{OrmError, OrmResult};
use crate::ident;
use crate::model::{Field, TableRef, TableSchema};
use crate::scope::Scope;
use crate::sql::Sql;
use std::sync::OnceLock;

const REFERENTIAL_ACTIONS: &[&str] = &["CASCADE", "RESTRICT", "SET NULL", "SET DEFAULT", "NO ACTION"];

fn column_definition(dialect: &dyn Dialect, field: &Field) -> OrmResult<String> {
    let mut def = format!("{} {}", dialect.quote(&field.name)?, dialect.data_type_of(field));
    if !field.nullable || field.primary_key {
        def.push_str(" NOT NULL");
    }
    if field.unique {
        def.push_str(" UNIQUE");
    }
    if let Some(default) = &field.default {
        def.push_str(" DEFAULT ");
        def.push_str(default);
    }
    Ok(def)
}

/// `CREATE TABLE` for `schema`.
pub(crate) fn create_table_sql(
    dialect: &dyn Dialect,
    table: &str,
    schema: &TableSchema,
    table_options: Option<&str>,
) -> OrmResult<Sql> {
    let mut defs = schema
        .fields
        .iter()
        .map(|f| column_definition(dialect, f))
        .collect::<OrmResult<Vec<_>>>()?;
    let keys = schema
        .fields
        .iter()
        .filter(|f| f.primary_key)
        .map(|f| dialect.quote(&f.name))
        .collect::<OrmResult<Vec<_>>>()?;
    if !keys.is_empty() {
        defs.push(format!("PRIMARY KEY ({})", keys.join(", ")));
    }
    let mut sql = Sql::new("CREATE TABLE ");
    sql.push_ident(table)?.push(" (").push(&defs.join(", ")).push(")");
    if let Some(options) = table_options.filter(|o| !o.trim().is_empty()) {
        sql.push(" ").push(options);
    }
    Ok(sql)
}

/// `(name, unique, column)` of every declared index.
fn declared_indexes(dialect: &dyn Dialect, table: &str, schema: &TableSchema) -> Vec<(String, bool, String)> {
    schema
        .fields
        .iter()
        .filter(|f| f.index || f.unique_index)
        .map(|f| {
            let prefix = if f.unique_index { "uix" } else { "idx" };
            let name = dialect.build_key_name(&[prefix, table, &f.name]);
            (name, f.unique_index, f.name.clone())
        })
        .collect()
}

/// `CREATE [UNIQUE] INDEX`; columns that are not plain identifiers are used as expressions.
pub(crate) fn create_index_sql(
    dialect: &dyn Dialect,
    table: &str,
    name: &str,
    unique: bool,
    columns: &[&str],
    predicate: Sql,
) -> OrmResult<Sql> {
    if columns.is_empty() {
        return Err(OrmError::validation(format!("index {name} has no columns")));
    }
    let mut sql = Sql::new(if unique { "CREATE UNIQUE INDEX " } else { "CREATE INDEX " });
    sql.push(&dialect.quote(name)?).push(" ON ").push_ident(table)?.push(" (");
    for (i, column) in columns.iter().enumerate() {
        if i > 0 {
            sql.push(", ");
        }
        match dialect.quote(column) {
            Ok(quoted) => sql.push(&quoted),
            Err(_) => sql.push(column),
        };
    }
    sql.push(")").push_sql(predicate);
    Ok(sql)
}

/// Split `table(column)` into its parts.
fn parse_reference(dest: &str) -> OrmResult<(String, String)> {
    static REFERENCE: OnceLock<regex::Regex> = OnceLock::new();
    let re = REFERENCE.get_or_init(|| {
        regex::Regex::new(r#"^\s*([\w."]+)\s*\(\s*([\w"]+)\s*\)\s*$"#).expect("invalid built-in reference regex")
    });
    let caps = re
        .captures(dest)
        .ok_or_else(|| OrmError::validation(format!("foreign key reference {dest:?} is not `table(column)`")))?;
    Ok((caps[1].to_string(), caps[2].trim_matches('"').to_string()))
}

fn referential_action(action: &str) -> OrmResult<&'static str> {
    let upper = action.trim().to_ascii_uppercase();
    REFERENTIAL_ACTIONS
        .iter()
        .copied()
        .find(|a| *a == upper)
        .ok_or_else(|| OrmError::validation(format!("unknown referential action {action:?}")))
}

pub(crate) fn add_foreign_key_sql(
    dialect: &dyn Dialect,
    table: &str,
    key: &str,
    field: &str,
    dest: &str,
    on_delete: &str,
    on_update: &str,
) -> OrmResult<Sql> {
    let (dest_table, dest_column) = parse_reference(dest)?;
    let mut sql = Sql::new("ALTER TABLE ");
    sql.push_ident(table)?
        .push(" ADD CONSTRAINT ")
        .push(&dialect.quote(key)?)
        .push(" FOREIGN KEY (")
        .push_ident(field)?
        .push(") REFERENCES ")
        .push_ident(&dest_table)?
        .push(" (")
        .push_ident(&dest_column)?
        .push(")");
    if !on_delete.trim().is_empty() {
        sql.push(" ON DELETE ").push(referential_action(on_delete)?);
    }
    if !on_update.trim().is_empty() {
        sql.push(" ON UPDATE ").push(referential_action(on_update)?);
    }
    Ok(sql)
}

impl Session {
    async fn ddl(&self, table: &str, sql: Sql) -> OrmResult<()> {
        self.run_exec(Operation::Schema, Some(table), sql).await?;
        Ok(())
    }

    async fn exists(&self, table: &str, sql: Sql) -> OrmResult<bool> {
        let records = self.run_query(Operation::Schema, Some(table), sql).await?;
        let n = records
            .into_iter()
            .next()
            .and_then(|r| r.into_iter().next())
            .and_then(|(_, v)| v.as_i64())
            .unwrap_or(0);
        Ok(n > 0)
    }

    /// Run a schema step on a derived session, recording its error.
    async fn schema_step<F, Fut>(&self, step: F) -> Self
    where
        F: FnOnce(Session) -> Fut,
        Fut: Future<Output = OrmResult<()>>,
    {
        let mut s = self.derive();
        if s.has_errors() {
            return s;
        }
        if let Err(e) = step(s.clone()).await {
            s.push_error(e);
        }
        s
    }

    fn table_of(&self, table: &TableRef) -> String {
        table.table_name(self.root.singular())
    }

    pub async fn create_table(&self, schemas: &[TableSchema]) -> Self {
        self.schema_step(|s| async move {
            for schema in schemas {
                s.create_one(schema).await?;
            }
            Ok(())
        })
        .await
    }

    async fn create_one(&self, schema: &TableSchema) -> OrmResult<()> {
        let dialect = self.root.dialect.clone();
        let table = schema.table_name(self.root.singular());
        let sql = create_table_sql(dialect.as_ref(), &table, schema, self.setting_str("orm:table_options"))?;
        self.ddl(&table, sql).await?;
        for (name, unique, column) in declared_indexes(dialect.as_ref(), &table, schema) {
            let sql = create_index_sql(dialect.as_ref(), &table, &name, unique, &[&column], Sql::empty())?;
            self.ddl(&table, sql).await?;
        }
        Ok(())
    }

    pub async fn drop_table(&self, tables: &[TableRef]) -> Self {
        self.schema_step(|s| async move {
            for table in tables {
                let name = s.table_of(table);
                let mut sql = Sql::new("DROP TABLE ");
                sql.push_ident(&name)?;
                s.ddl(&name, sql).await?;
            }
            Ok(())
        })
        .await
    }

    pub async fn drop_table_if_exists(&self, tables: &[TableRef]) -> Self {
        self.schema_step(|s| async move {
            for table in tables {
                let name = s.table_of(table);
                let mut sql = Sql::new("DROP TABLE IF EXISTS ");
                sql.push_ident(&name)?;
                s.ddl(&name, sql).await?;
            }
            Ok(())
        })
        .await
    }

    /// Whether the table exists in the current schema; `false` on errors.
    pub async fn has_table(&self, table: TableRef) -> bool {
        let name = self.table_of(&table);
        let sql = self.root.dialect.has_table(&name);
        self.exists(&name, sql).await.unwrap_or(false)
    }

    /// Create missing tables, columns and indexes. Existing columns are never changed.
    pub async fn auto_migrate(&self, schemas: &[TableSchema]) -> Self {
        self.schema_step(|s| async move {
            for schema in schemas {
                s.migrate_one(schema).await?;
            }
            Ok(())
        })
        .await
    }

    async fn migrate_one(&self, schema: &TableSchema) -> OrmResult<()> {
        let dialect = self.root.dialect.clone();
        let table = schema.table_name(self.root.singular());
        if !self.exists(&table, dialect.has_table(&table)).await? {
            return self.create_one(schema).await;
        }
        for field in &schema.fields {
            if self.exists(&table, dialect.has_column(&table, &field.name)).await? {
                continue;
            }
            let mut sql = Sql::new("ALTER TABLE ");
            sql.push_ident(&table)?
                .push(" ADD ")
                .push(&column_definition(dialect.as_ref(), field)?);
            self.ddl(&table, sql).await?;
        }
        for (name, unique, column) in declared_indexes(dialect.as_ref(), &table, schema) {
            if self.exists(&table, dialect.has_index(&table, &name)).await? {
                continue;
            }
            let sql = create_index_sql(dialect.as_ref(), &table, &name, unique, &[&column], Sql::empty())?;
            self.ddl(&table, sql).await?;
        }
        Ok(())
    }

    /// `ALTER TABLE ... ALTER COLUMN ... TYPE ...` on the session's table.
    pub async fn modify_column(&self, column: &str, sql_type: &str) -> Self {
        self.schema_step(|s| async move {
            let table = s.table_name()?;
            let mut sql = Sql::new("ALTER TABLE ");
            sql.push_ident(&table)?
                .push(" ALTER COLUMN ")
                .push_ident(column)?
                .push(" TYPE ")
                .push(sql_type);
            s.ddl(&table, sql).await
        })
        .await
    }

    pub async fn drop_column(&self, column: &str) -> Self {
        self.schema_step(|s| async move {
            let table = s.table_name()?;
            let mut sql = Sql::new("ALTER TABLE ");
            sql.push_ident(&table)?.push(" DROP COLUMN ").push_ident(column)?;
            s.ddl(&table, sql).await
        })
        .await
    }

    /// Create an index unless it exists. Argument-free where conditions of
    /// the session make it a partial index.
    pub async fn add_index(&self, name: &str, columns: &[&str]) -> Self {
        self.index_step(name, columns, false).await
    }

    pub async fn add_unique_index(&self, name: &str, columns: &[&str]) -> Self {
        self.index_step(name, columns, true).await
    }

    async fn index_step(&self, name: &str, columns: &[&str], unique: bool) -> Self {
        self.schema_step(|s| async move {
            let table = s.table_name()?;
            let dialect = s.root.dialect.clone();
            if s.exists(&table, dialect.has_index(&table, name)).await? {
                return Ok(());
            }
            let predicate = s.search.argless_where_sql(&s.target(&table))?;
            let sql = create_index_sql(dialect.as_ref(), &table, name, unique, columns, predicate)?;
            s.ddl(&table, sql).await
        })
        .await
    }

    pub async fn remove_index(&self, name: &str) -> Self {
        self.schema_step(|s| async move {
            let table = s.table_name()?;
            let sql = s.root.dialect.remove_index(&table, name)?;
            s.ddl(&table, sql).await
        })
        .await
    }

    /// Add `FOREIGN KEY (field) REFERENCES dest` unless it exists.
    /// `dest` is `table(column)`; actions are `CASCADE`, `RESTRICT`,
    /// `SET NULL`, `SET DEFAULT`, `NO ACTION` or empty.
    pub async fn add_foreign_key(&self, field: &str, dest: &str, on_delete: &str, on_update: &str) -> Self {
        self.schema_step(|s| async move {
            let table = s.table_name()?;
            let dialect = s.root.dialect.clone();
            let key = dialect.build_key_name(&[&table, field, dest, "foreign"]);
            let sql = add_foreign_key_sql(dialect.as_ref(), &table, &key, field, dest, on_delete, on_update)?;
            if s.exists(&table, dialect.has_foreign_key(&table, &key)).await? {
                return Ok(());
            }
            s.ddl(&table, sql).await
        })
        .await
    }

    pub async fn remove_foreign_key(&self, field: &str, dest: &str) -> Self {
        self.schema_step(|s| async move {
            let table = s.table_name()?;
            let dialect = s.root.dialect.clone();
            let key = dialect.build_key_name(&[&table, field, dest, "foreign"]);
            if !s.exists(&table, dialect.has_foreign_key(&table, &key)).await? {
                return Ok(());
            }
            let mut sql = Sql::new("ALTER TABLE ");
            sql.push_ident(&table)?.push(" DROP CONSTRAINT ").push(&ident::quote(&key)?);
            s.ddl(&table, sql).await
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::Postgres;

    fn users() -> TableSchema {
        TableSchema::new("users")
            .field(Field::of::<i64>("id").primary_key())
            .field(Field::of::<String>("email").unique_index())
            .field(Field::of::<Option<String>>("nickname").default_value("'anon'"))
            .field(Field::of::<i32>("age").index())
    }

    #[test]
    fn create_table_renders_columns_and_key() {
        let sql = create_table_sql(&Postgres, "users", &users(), Some("WITH (fillfactor = 70)")).unwrap();
        assert_eq!(
            sql.to_sql(),
            r#"CREATE TABLE "users" ("id" bigserial NOT NULL, "email" text NOT NULL, "nickname" text DEFAULT 'anon', "age" integer NOT NULL, PRIMARY KEY ("id")) WITH (fillfactor = 70)"#
        );
    }

    #[test]
    fn declared_indexes_are_named_per_table() {
        let indexes = declared_indexes(&Postgres, "users", &users());
        assert_eq!(
            indexes,
            vec![
                ("uix_users_email".to_string(), true, "email".to_string()),
                ("idx_users_age".to_string(), false, "age".to_string()),
            ]
        );
    }

    #[test]
    fn index_columns_may_be_expressions() {
        let mut predicate = Sql::empty();
        predicate.push(" WHERE (deleted_at IS NULL)");
        let sql = create_index_sql(&Postgres, "users", "idx_lower_email", false, &["lower(email)", "age"], predicate)
            .unwrap();
        assert_eq!(
            sql.to_sql(),
            r#"CREATE INDEX "idx_lower_email" ON "users" (lower(email), "age") WHERE (deleted_at IS NULL)"#
        );
    }

    #[test]
    fn foreign_keys_validate_actions_and_reference() {
        let sql = add_foreign_key_sql(
            &Postgres,
            "orders",
            "orders_user_id_users_id_foreign",
            "user_id",
            "users(id)",
            "cascade",
            "",
        )
        .unwrap();
        assert_eq!(
            sql.to_sql(),
            r#"ALTER TABLE "orders" ADD CONSTRAINT "orders_user_id_users_id_foreign" FOREIGN KEY ("user_id") REFERENCES "users" ("id") ON DELETE CASCADE"#
        );
        assert!(add_foreign_key_sql(&Postgres, "orders", "k", "user_id", "users", "", "").is_err());
        assert!(add_foreign_key_sql(&Postgres, "orders", "k", "user_id", "users(id)", "DROP", "").is_err());
    }
}
