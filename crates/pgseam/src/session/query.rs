//! Readers: `first`, `find`, `scan`, `pluck`, `count`, cursors and preloading.

use super::Session;
use crate::association::{ChildQuery, Relation, preload_records};
use crate::callbacks::Operation;
use crate::clause::Clause;
use crate::cursor::{Row, Rows};
use crate::error::{OrmError, OrmResult};
use crate::ident;
use crate::model::{Destination, Model, model_record, schema_of};
use crate::scope::Scope;
use crate::value::{Record, from_record, to_record};
use serde::de::DeserializeOwned;
use serde_json::Value;

impl Session {
    /// First row ordered by primary key.
    pub async fn first<T: Model>(&self, out: &mut T, conditions: &[Clause]) -> Self {
        self.find_one(out, conditions, Some("ASC")).await
    }

    /// First row in database order.
    pub async fn take<T: Model>(&self, out: &mut T, conditions: &[Clause]) -> Self {
        self.find_one(out, conditions, None).await
    }

    /// Last row ordered by primary key.
    pub async fn last<T: Model>(&self, out: &mut T, conditions: &[Clause]) -> Self {
        self.find_one(out, conditions, Some("DESC")).await
    }

    async fn find_one<T: Model>(&self, out: &mut T, conditions: &[Clause], key_order: Option<&str>) -> Self {
        let mut s = self.derive();
        if s.has_errors() {
            return s;
        }
        if let Some(schema) = schema_of::<T>() {
            s.meta = Some(schema);
        }
        // A destination that already has a primary key is looked up by it.
        match model_record(out) {
            Ok(record) => s.value = Some(record),
            Err(e) => {
                s.push_error(e);
                return s;
            }
        }
        s.add_conditions(conditions);
        s.search.set_limit(1);
        if let Some(direction) = key_order {
            let order = s
                .table_name()
                .and_then(|table| ident::quote_column(&table, s.primary_key()));
            match order {
                Ok(column) => s.search.orders.push(Clause::raw(format!("{column} {direction}"))),
                Err(e) => {
                    s.push_error(e);
                    return s;
                }
            }
        }
        s.fill(out).await;
        s
    }

    /// Every matching row.
    pub async fn find<D: Destination>(&self, out: &mut D, conditions: &[Clause]) -> Self {
        let mut s = self.derive();
        if s.has_errors() {
            return s;
        }
        if let Some(schema) = D::schema() {
            s.meta = Some(schema);
            s.value = None;
        }
        s.add_conditions(conditions);
        s.fill(out).await;
        s
    }

    /// Run the query built so far (or `raw`) into any destination.
    pub async fn scan<D: Destination>(&self, out: &mut D) -> Self {
        let mut s = self.derive();
        if s.has_errors() {
            return s;
        }
        if s.meta.is_none() {
            s.meta = D::schema();
        }
        s.fill(out).await;
        s
    }

    async fn fill<D: Destination>(&mut self, out: &mut D) {
        let records = match self.load(D::SINGLE).await {
            Ok(records) => records,
            Err(e) => {
                self.push_error(e);
                return;
            }
        };
        self.outcome.rows_affected = records.len() as u64;
        if D::SINGLE && records.is_empty() {
            self.push_error(OrmError::RecordNotFound);
            return;
        }
        if let Err(e) = out.fill(records) {
            self.push_error(e);
        }
    }

    async fn load(&self, single: bool) -> OrmResult<Vec<Record>> {
        let table = self.table_name()?;
        let sql = self
            .search
            .select_sql(&self.target(&table), self.setting_str("orm:query_option"))?;
        let operation = if self.search.raw.is_some() {
            Operation::RowQuery
        } else {
            Operation::Query
        };
        let mut records = if single {
            self.run_query_single(operation, Some(&table), sql).await?
        } else {
            self.run_query(operation, Some(&table), sql).await?
        };
        self.apply_preloads(&mut records).await?;
        Ok(records)
    }

    async fn apply_preloads(&self, records: &mut [Record]) -> OrmResult<()> {
        if self.search.preloads.is_empty() || records.is_empty() {
            return Ok(());
        }
        let owner = self
            .meta
            .clone()
            .ok_or_else(|| OrmError::validation("preload needs a model destination"))?;
        for preload in &self.search.preloads {
            let handler = self.join_table_handler(&owner.name, &preload.column);
            let relation = Relation::resolve(&owner, records.first(), &preload.column, None, handler);
            preload_records(records, &owner, preload, relation, |query| self.fetch_children(query)).await?;
        }
        Ok(())
    }

    fn fetch_children(&self, query: ChildQuery) -> impl Future<Output = OrmResult<Vec<Record>>> + Send + 'static {
        let mut child = self
            .new_session()
            .table(&query.table)
            .where_(Clause::in_list(&query.column, query.keys));
        for condition in query.conditions {
            child = child.where_(condition);
        }
        async move {
            if let Some(e) = child.error() {
                return Err(e);
            }
            let sql = child.search.select_sql(&child.target(&query.table), None)?;
            child.run_query(Operation::Query, Some(&query.table), sql).await
        }
    }

    /// First row of the query as a [`Row`].
    pub async fn row(&self) -> Row {
        if let Some(e) = self.error() {
            return Row::from_error(e);
        }
        let mut s = self.derive();
        s.search.set_limit(1);
        let result = async {
            let table = s.table_name()?;
            let sql = s.search.select_sql(&s.target(&table), s.setting_str("orm:query_option"))?;
            s.run_query_single(Operation::RowQuery, Some(&table), sql).await
        }
        .await;
        Row::new(result.map(|records| records.into_iter().next()))
    }

    /// A streaming cursor over the query.
    pub async fn rows(&self) -> OrmResult<Rows> {
        if let Some(e) = self.error() {
            return Err(e);
        }
        let table = self.table_name()?;
        let sql = self
            .search
            .select_sql(&self.target(&table), self.setting_str("orm:query_option"))?;
        self.run_rows(Operation::RowQuery, Some(&table), sql).await
    }

    /// Fill `out` from the current row of `rows`.
    pub fn scan_rows<D: Destination>(&self, rows: &Rows, out: &mut D) -> OrmResult<()> {
        rows.scan_into(out)
    }

    /// One column of every matching row.
    pub async fn pluck<T: DeserializeOwned + Send>(&self, column: &str, out: &mut Vec<T>) -> Self {
        let mut s = self.derive();
        if s.has_errors() {
            return s;
        }
        let result = async {
            let table = s.table_name()?;
            let sql = s
                .search
                .pluck_sql(&s.target(&table), column, s.setting_str("orm:query_option"))?;
            let records = s.run_query(Operation::RowQuery, Some(&table), sql).await?;
            records
                .into_iter()
                .map(|record| {
                    let value = record.into_iter().next().map_or(Value::Null, |(_, v)| v);
                    serde_json::from_value(value).map_err(OrmError::from)
                })
                .collect::<OrmResult<Vec<T>>>()
        }
        .await;
        match result {
            Ok(values) => {
                s.outcome.rows_affected = values.len() as u64;
                *out = values;
            }
            Err(e) => s.push_error(e),
        }
        s
    }

    /// `count(*)` of the matching rows; order, limit and offset are ignored.
    pub async fn count(&self, out: &mut i64) -> Self {
        let mut s = self.derive();
        if s.has_errors() {
            return s;
        }
        let result = async {
            let table = s.table_name()?;
            let sql = s.search.count_sql(&s.target(&table))?;
            let records = s.run_query(Operation::RowQuery, Some(&table), sql).await?;
            let n = records
                .into_iter()
                .next()
                .and_then(|r| r.into_iter().next())
                .and_then(|(_, v)| v.as_i64())
                .unwrap_or(0);
            Ok::<_, OrmError>(n)
        }
        .await;
        match result {
            Ok(n) => *out = n,
            Err(e) => s.push_error(e),
        }
        s
    }

    /// First matching row, or `out` initialised from the conditions and
    /// `attrs`. `assign` attributes are applied either way; nothing is saved.
    pub async fn first_or_init<T: Model>(&self, out: &mut T, conditions: &[Clause]) -> Self {
        if self.has_errors() {
            return self.derive();
        }
        let found = self.first(out, conditions).await;
        if !found.only_not_found() {
            if found.has_errors() {
                return found;
            }
            let mut s = self.derive();
            if let Err(e) = s.assign_into(out, false, conditions) {
                s.push_error(e);
            }
            return s;
        }
        let mut s = self.derive();
        if let Err(e) = s.assign_into(out, true, conditions) {
            s.push_error(e);
        }
        s
    }

    /// First matching row, or a new row created from the conditions and
    /// `attrs`. A found row is updated with the `assign` attributes.
    pub async fn first_or_create<T: Model>(&self, out: &mut T, conditions: &[Clause]) -> Self {
        if self.has_errors() {
            return self.derive();
        }
        let found = self.first(out, conditions).await;
        if found.only_not_found() {
            let mut s = self.derive();
            if let Err(e) = s.assign_into(out, true, conditions) {
                s.push_error(e);
                return s;
            }
            return s.create(out).await;
        }
        if found.has_errors() || self.search.assign_attrs.is_empty() {
            return found;
        }
        let mut assigned = Record::new();
        for attrs in &self.search.assign_attrs {
            assigned.extend(attrs.clone());
        }
        let updated = self.model(out).updates(&assigned, false).await;
        if !updated.has_errors() {
            let merged = to_record(out).and_then(|mut record| {
                record.extend(assigned);
                from_record(record)
            });
            match merged {
                Ok(value) => *out = value,
                Err(e) => return self.derive().with_error(e),
            }
        }
        updated
    }

    fn only_not_found(&self) -> bool {
        !self.outcome.errors.is_empty() && self.outcome.errors.iter().all(OrmError::is_not_found)
    }

    fn with_error(mut self, err: OrmError) -> Self {
        self.push_error(err);
        self
    }
}
