//! Writers: `create`, `save`, `update*`, `delete`, `exec`.

use super::Session;
use crate::callbacks::Operation;
use crate::clause::Clause;
use crate::error::OrmResult;
use crate::model::{CREATED_AT, DELETED_AT, Model, UPDATED_AT, merge_into, model_record};
use crate::scope::Scope;
use crate::sql::Sql;
use crate::value::{Record, is_blank, now_value, to_record};
use serde::Serialize;
use serde_json::Value;

impl Session {
    fn has_default(&self, column: &str) -> bool {
        self.meta
            .as_ref()
            .and_then(|m| m.column(column))
            .is_some_and(|f| f.default.is_some())
    }

    fn option_suffix(&self, sql: &mut Sql, name: &str) {
        if let Some(option) = self.setting_str(name).filter(|o| !o.trim().is_empty()) {
            sql.push(" ").push(option);
        }
    }

    /// Insert `value` and fill it with the stored row (generated keys, defaults).
    pub async fn create<T: Model>(&self, value: &mut T) -> Self {
        let mut s = self.derive();
        if s.has_errors() {
            return s;
        }
        if let Err(e) = s.insert(value).await {
            s.push_error(e);
        }
        s
    }

    async fn insert<T: Model>(&mut self, value: &mut T) -> OrmResult<()> {
        let mut record = self.target_model(value)?;
        let now = now_value();
        for column in [CREATED_AT, UPDATED_AT] {
            if self.has_column(&record, column) && record.get(column).is_none_or(is_blank) {
                record.insert(column.to_string(), now.clone());
            }
        }

        let table = self.table_name()?;
        let pk = self.primary_key().to_string();
        let mut sql = Sql::new("INSERT INTO ");
        sql.push_ident(&table)?;
        let columns: Vec<(&String, &Value)> = record
            .iter()
            .filter(|(k, v)| {
                !v.is_null()
                    && !self.search.is_omitted(k)
                    && !((**k == pk || self.has_default(k)) && is_blank(v))
            })
            .collect();
        if columns.is_empty() {
            sql.push(" DEFAULT VALUES");
        } else {
            sql.push(" (");
            for (i, (column, _)) in columns.iter().enumerate() {
                if i > 0 {
                    sql.push(", ");
                }
                sql.push_ident(column)?;
            }
            sql.push(") VALUES (");
            for (i, (_, v)) in columns.iter().enumerate() {
                if i > 0 {
                    sql.push(", ");
                }
                sql.push_bind((*v).clone());
            }
            sql.push(")");
        }
        self.option_suffix(&mut sql, "orm:insert_option");
        sql.push(" RETURNING *");

        let returned = self.run_query(Operation::Create, Some(&table), sql).await?;
        self.outcome.rows_affected = returned.len() as u64;
        if let Some(row) = returned.into_iter().next() {
            merge_into(value, row)?;
        } else {
            merge_into(value, record)?;
        }
        self.value = Some(model_record(value)?);
        Ok(())
    }

    /// Update every column of `value` by primary key; a new record (blank
    /// key, or no row updated) is created instead.
    pub async fn save<T: Model>(&self, value: &mut T) -> Self {
        let mut s = self.derive();
        if s.has_errors() {
            return s;
        }
        let record = match s.target_model(value) {
            Ok(record) => record,
            Err(e) => {
                s.push_error(e);
                return s;
            }
        };
        if record.get(s.primary_key()).is_none_or(is_blank) {
            return s.create(value).await;
        }
        match s.save_existing(value, record).await {
            Ok(true) => s,
            Ok(false) => s.create(value).await,
            Err(e) => {
                s.push_error(e);
                s
            }
        }
    }

    async fn save_existing<T: Model>(&mut self, value: &mut T, mut record: Record) -> OrmResult<bool> {
        let table = self.table_name()?;
        let pk = self.primary_key().to_string();
        if self.has_column(&record, UPDATED_AT) {
            record.insert(UPDATED_AT.to_string(), now_value());
        }
        let mut sql = Sql::new("UPDATE ");
        sql.push_ident(&table)?.push(" SET ");
        let mut first = true;
        for (column, v) in &record {
            if *column == pk || self.search.is_omitted(column) {
                continue;
            }
            if !first {
                sql.push(", ");
            }
            first = false;
            sql.push_ident(column)?.push(" = ").push_bind(v.clone());
        }
        if first {
            return Ok(true);
        }
        sql.push_sql(self.search.where_sql(&self.target(&table))?);
        self.option_suffix(&mut sql, "orm:update_option");
        sql.push(" RETURNING *");

        let returned = self.run_query(Operation::Update, Some(&table), sql).await?;
        let Some(row) = returned.into_iter().next() else {
            return Ok(false);
        };
        self.outcome.rows_affected = 1;
        merge_into(value, row)?;
        self.value = Some(model_record(value)?);
        Ok(true)
    }

    /// Set one column on the matching rows (runs callbacks, refreshes `updated_at`).
    pub async fn update<V: Serialize + Send>(&self, column: &str, value: V) -> Self {
        let mut s = self.derive();
        match serde_json::to_value(value) {
            Ok(v) => {
                let mut record = Record::new();
                record.insert(column.to_string(), v);
                s.apply_updates(record, true, true).await;
            }
            Err(e) => s.push_error(e.into()),
        }
        s
    }

    /// Set several columns; null fields are skipped. Unless
    /// `ignore_protected_attrs`, the primary key and `created_at` are left alone.
    pub async fn updates<V: Serialize + ?Sized + Sync>(&self, values: &V, ignore_protected_attrs: bool) -> Self {
        let mut s = self.derive();
        match to_record(values) {
            Ok(record) => s.apply_updates(record, !ignore_protected_attrs, false).await,
            Err(e) => s.push_error(e),
        }
        s
    }

    /// Like `update` without callbacks and without touching `updated_at`.
    pub async fn update_column<V: Serialize + Send>(&self, column: &str, value: V) -> Self {
        let mut s = self.derive();
        s.skip_callbacks = true;
        match serde_json::to_value(value) {
            Ok(v) => {
                let mut record = Record::new();
                record.insert(column.to_string(), v);
                s.apply_updates(record, false, true).await;
            }
            Err(e) => s.push_error(e.into()),
        }
        s.skip_callbacks = false;
        s
    }

    /// Like `updates` without callbacks and without touching `updated_at`.
    pub async fn update_columns<V: Serialize + ?Sized + Sync>(&self, values: &V) -> Self {
        let mut s = self.derive();
        s.skip_callbacks = true;
        match to_record(values) {
            Ok(record) => s.apply_updates(record, false, false).await,
            Err(e) => s.push_error(e),
        }
        s.skip_callbacks = false;
        s
    }

    async fn apply_updates(&mut self, mut record: Record, protect: bool, keep_nulls: bool) {
        if self.has_errors() {
            return;
        }
        let pk = self.primary_key().to_string();
        record.retain(|k, v| !self.search.is_omitted(k) && (keep_nulls || !v.is_null()));
        if protect {
            record.remove(&pk);
            record.remove(CREATED_AT);
        }
        if record.is_empty() {
            return;
        }
        let stamped = self.value.as_ref().is_some_and(|v| v.contains_key(UPDATED_AT))
            || self.meta.as_ref().is_some_and(|m| m.has_column(UPDATED_AT));
        if !self.skip_callbacks && stamped && !record.contains_key(UPDATED_AT) {
            record.insert(UPDATED_AT.to_string(), now_value());
        }
        match self.update_rows(&record).await {
            Ok(n) => {
                self.outcome.rows_affected = n;
                if let Some(value) = &mut self.value {
                    value.extend(record);
                }
            }
            Err(e) => self.push_error(e),
        }
    }

    async fn update_rows(&self, record: &Record) -> OrmResult<u64> {
        let table = self.table_name()?;
        self.check_global(&table, "update")?;
        let mut sql = Sql::new("UPDATE ");
        sql.push_ident(&table)?.push(" SET ");
        for (i, (column, v)) in record.iter().enumerate() {
            if i > 0 {
                sql.push(", ");
            }
            sql.push_ident(column)?.push(" = ").push_bind(v.clone());
        }
        sql.push_sql(self.search.where_sql(&self.target(&table))?);
        self.option_suffix(&mut sql, "orm:update_option");
        self.run_exec(Operation::Update, Some(&table), sql).await
    }

    /// Delete `value` (by primary key) and the rows matching the conditions.
    /// Models with `deleted_at` are soft-deleted unless `unscoped()`.
    pub async fn delete<T: Model>(&self, value: &T, conditions: &[Clause]) -> Self {
        let mut s = self.derive();
        if s.has_errors() {
            return s;
        }
        for clause in conditions {
            if let Some(e) = clause.error() {
                s.push_error(e.clone());
            }
            s.search.wheres.push(clause.clone());
        }
        let result = async {
            s.target_model(value)?;
            let table = s.table_name()?;
            s.check_global(&table, "delete")?;
            let target = s.target(&table);
            let mut sql = if target.soft_delete && !s.search.unscoped {
                let mut sql = Sql::new("UPDATE ");
                sql.push_ident(&table)?
                    .push(" SET ")
                    .push_ident(DELETED_AT)?
                    .push(" = ")
                    .push_bind(now_value());
                sql
            } else {
                let mut sql = Sql::new("DELETE FROM ");
                sql.push_ident(&table)?;
                sql
            };
            sql.push_sql(s.search.where_sql(&target)?);
            s.option_suffix(&mut sql, "orm:delete_option");
            s.run_exec(Operation::Delete, Some(&table), sql).await
        }
        .await;
        match result {
            Ok(n) => s.outcome.rows_affected = n,
            Err(e) => s.push_error(e),
        }
        s
    }

    /// Run a raw statement.
    pub async fn exec(&self, sql: impl Into<Clause>) -> Self {
        let mut s = self.derive();
        if s.has_errors() {
            return s;
        }
        let clause = sql.into();
        let result = async {
            let mut statement = Sql::empty();
            clause.write_fragment(&mut statement)?;
            s.run_exec(Operation::Raw, None, statement).await
        }
        .await;
        match result {
            Ok(n) => s.outcome.rows_affected = n,
            Err(e) => s.push_error(e),
        }
        s
    }
}
