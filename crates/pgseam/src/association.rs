//! Relations between models: resolution, preloading and `Association`.
//!
//! Relations are inferred from names, the way the columns are laid out:
//!
//! - `preload("emails")` on users: has-many, `emails.user_id = users.id`;
//! - `preload("profile")`: has-one, `profiles.user_id = users.id`, unless
//!   users carry a `profile_id` column, which makes it belongs-to;
//! - any column with a registered [`JoinTableHandler`]: many-to-many.

use crate::clause::Clause;
use crate::error::{OrmError, OrmResult};
use crate::interface::Orm;
use crate::model::{Model, TableSchema, pluralize};
use crate::search::Preload;
use crate::value::{Record, from_record, is_blank, to_record};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Join table of a many-to-many relation.
pub trait JoinTableHandler: Send + Sync + fmt::Debug {
    fn table(&self) -> &str;
    /// Join table column referencing the owner's primary key.
    fn source_key(&self) -> &str;
    /// Join table column referencing the destination's primary key.
    fn destination_key(&self) -> &str;
    fn destination_table(&self) -> &str;
    fn destination_primary_key(&self) -> &str {
        "id"
    }
}

/// The default [`JoinTableHandler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinTable {
    pub table: String,
    pub source_key: String,
    pub destination_key: String,
    pub destination_table: String,
    pub destination_primary_key: String,
}

impl JoinTable {
    pub fn new(
        table: impl Into<String>,
        source_key: impl Into<String>,
        destination_key: impl Into<String>,
        destination_table: impl Into<String>,
    ) -> Self {
        Self {
            table: table.into(),
            source_key: source_key.into(),
            destination_key: destination_key.into(),
            destination_table: destination_table.into(),
            destination_primary_key: "id".into(),
        }
    }

    /// `user_languages(user_id, language_id)` for `between::<User, Language>()`.
    pub fn between<A: Model, B: Model>() -> Self {
        let mut join = Self::new(
            format!("{}_{}", A::NAME, pluralize(B::NAME)),
            format!("{}_id", A::NAME),
            format!("{}_id", B::NAME),
            TableSchema::of::<B>().table_name(false),
        );
        join.destination_primary_key = B::PRIMARY_KEY.to_string();
        join
    }
}

impl JoinTableHandler for JoinTable {
    fn table(&self) -> &str {
        &self.table
    }

    fn source_key(&self) -> &str {
        &self.source_key
    }

    fn destination_key(&self) -> &str {
        &self.destination_key
    }

    fn destination_table(&self) -> &str {
        &self.destination_table
    }

    fn destination_primary_key(&self) -> &str {
        &self.destination_primary_key
    }
}

/// How an owner row relates to the rows behind one of its columns.
#[derive(Debug, Clone)]
pub enum Relation {
    /// `table.foreign_key` references the owner's primary key.
    HasMany { table: String, foreign_key: String },
    /// Like has-many, holding at most one row.
    HasOne { table: String, foreign_key: String },
    /// The owner's `foreign_key` references `table`'s primary key.
    BelongsTo { table: String, foreign_key: String },
    ManyToMany(Arc<dyn JoinTableHandler>),
}

impl Relation {
    /// Resolve `column` of `owner`. An explicit foreign key on the owner makes
    /// the relation belongs-to; otherwise it names the child's column.
    pub fn resolve(
        owner: &TableSchema,
        owner_record: Option<&Record>,
        column: &str,
        foreign_key: Option<&str>,
        handler: Option<Arc<dyn JoinTableHandler>>,
    ) -> Self {
        if let Some(handler) = handler {
            return Relation::ManyToMany(handler);
        }
        let owner_has = |key: &str| owner.has_column(key) || owner_record.is_some_and(|r| r.contains_key(key));
        let plural = pluralize(column);
        let is_plural = plural == column;

        let default_key = format!("{}_id", owner.name);
        match foreign_key {
            Some(key) if owner_has(key) => Relation::BelongsTo {
                table: plural,
                foreign_key: key.to_string(),
            },
            Some(key) if is_plural => Relation::HasMany {
                table: column.to_string(),
                foreign_key: key.to_string(),
            },
            Some(key) => Relation::HasOne {
                table: plural,
                foreign_key: key.to_string(),
            },
            None if is_plural => Relation::HasMany {
                table: column.to_string(),
                foreign_key: default_key,
            },
            None => {
                let belongs_key = format!("{column}_id");
                if owner_has(&belongs_key) {
                    Relation::BelongsTo {
                        table: plural,
                        foreign_key: belongs_key,
                    }
                } else {
                    Relation::HasOne {
                        table: plural,
                        foreign_key: default_key,
                    }
                }
            }
        }
    }
}

/// One lookup issued while preloading: rows of `table` whose `column` is in `keys`.
#[derive(Debug, Clone)]
pub(crate) struct ChildQuery {
    pub table: String,
    pub column: String,
    pub keys: Vec<Value>,
    pub conditions: Vec<Clause>,
}

fn distinct_keys<'a>(values: impl Iterator<Item = Option<&'a Value>>) -> Vec<Value> {
    let mut keys: Vec<Value> = Vec::new();
    for value in values.flatten() {
        if !is_blank(value) && !keys.contains(value) {
            keys.push(value.clone());
        }
    }
    keys
}

/// Load `preload.column` for every owner record and store it under that key.
///
/// `fetch` runs one [`ChildQuery`]; the engine turns it into SQL, the test
/// double filters its in-memory tables.
pub(crate) async fn preload_records<F, Fut>(
    records: &mut [Record],
    owner: &TableSchema,
    preload: &Preload,
    relation: Relation,
    mut fetch: F,
) -> OrmResult<()>
where
    F: FnMut(ChildQuery) -> Fut,
    Fut: Future<Output = OrmResult<Vec<Record>>>,
{
    if preload.column.contains('.') {
        return Err(OrmError::Unsupported(format!(
            "nested preload {:?}",
            preload.column
        )));
    }
    if records.is_empty() {
        return Ok(());
    }
    let column = preload.column.as_str();
    let pk = owner.primary_key.as_str();
    let owner_keys = distinct_keys(records.iter().map(|r| r.get(pk)));

    match relation {
        Relation::HasMany { table, foreign_key } => {
            let children = fetch(ChildQuery {
                table,
                column: foreign_key.clone(),
                keys: owner_keys,
                conditions: preload.conditions.clone(),
            })
            .await?;
            for record in records.iter_mut() {
                let matched: Vec<Value> = children
                    .iter()
                    .filter(|c| record.get(pk).is_some_and(|k| c.get(&foreign_key) == Some(k)))
                    .cloned()
                    .map(Value::Object)
                    .collect();
                record.insert(column.to_string(), Value::Array(matched));
            }
        }
        Relation::HasOne { table, foreign_key } => {
            let children = fetch(ChildQuery {
                table,
                column: foreign_key.clone(),
                keys: owner_keys,
                conditions: preload.conditions.clone(),
            })
            .await?;
            for record in records.iter_mut() {
                let matched = children
                    .iter()
                    .find(|c| record.get(pk).is_some_and(|k| c.get(&foreign_key) == Some(k)))
                    .cloned()
                    .map_or(Value::Null, Value::Object);
                record.insert(column.to_string(), matched);
            }
        }
        Relation::BelongsTo { table, foreign_key } => {
            let keys = distinct_keys(records.iter().map(|r| r.get(&foreign_key)));
            let parents = if keys.is_empty() {
                Vec::new()
            } else {
                fetch(ChildQuery {
                    table,
                    column: "id".into(),
                    keys,
                    conditions: preload.conditions.clone(),
                })
                .await?
            };
            for record in records.iter_mut() {
                let matched = parents
                    .iter()
                    .find(|p| record.get(&foreign_key).is_some_and(|k| p.get("id") == Some(k)))
                    .cloned()
                    .map_or(Value::Null, Value::Object);
                record.insert(column.to_string(), matched);
            }
        }
        Relation::ManyToMany(handler) => {
            let links = fetch(ChildQuery {
                table: handler.table().to_string(),
                column: handler.source_key().to_string(),
                keys: owner_keys,
                conditions: Vec::new(),
            })
            .await?;
            let dest_pk = handler.destination_primary_key();
            let dest_keys = distinct_keys(links.iter().map(|l| l.get(handler.destination_key())));
            let children = if dest_keys.is_empty() {
                Vec::new()
            } else {
                fetch(ChildQuery {
                    table: handler.destination_table().to_string(),
                    column: dest_pk.to_string(),
                    keys: dest_keys,
                    conditions: preload.conditions.clone(),
                })
                .await?
            };
            for record in records.iter_mut() {
                let Some(owner_key) = record.get(pk) else {
                    record.insert(column.to_string(), Value::Array(Vec::new()));
                    continue;
                };
                let linked: Vec<&Value> = links
                    .iter()
                    .filter(|l| l.get(handler.source_key()) == Some(owner_key))
                    .filter_map(|l| l.get(handler.destination_key()))
                    .collect();
                let matched: Vec<Value> = children
                    .iter()
                    .filter(|c| c.get(dest_pk).is_some_and(|k| linked.contains(&k)))
                    .cloned()
                    .map(Value::Object)
                    .collect();
                record.insert(column.to_string(), Value::Array(matched));
            }
        }
    }
    Ok(())
}

/// Rows related to the session's model value, for `related` and
/// `Association::find`. Composed from contract operations only.
pub(crate) async fn find_related<S: Orm, T: Model>(
    scope: &S,
    out: &mut Vec<T>,
    column: &str,
    foreign_key: Option<&str>,
) -> S {
    let mut scope = scope.clone();
    let (owner, record) = match owner_of(&scope) {
        Ok(found) => found,
        Err(e) => {
            scope.add_error(e);
            return scope;
        }
    };
    let handler = scope.join_table_handler(&owner.name, column);
    let owner_key = record.get(&owner.primary_key).cloned().unwrap_or(Value::Null);
    let fresh = scope.new_session();

    match Relation::resolve(&owner, Some(&record), column, foreign_key, handler) {
        Relation::HasMany { foreign_key, .. } | Relation::HasOne { foreign_key, .. } => {
            fresh.where_(Clause::eq(&foreign_key, owner_key)).find(out, &[]).await
        }
        Relation::BelongsTo { foreign_key, .. } => {
            let key = record.get(&foreign_key).cloned().unwrap_or(Value::Null);
            fresh.where_(Clause::eq(T::PRIMARY_KEY, key)).find(out, &[]).await
        }
        Relation::ManyToMany(handler) => {
            let mut links: Vec<Record> = Vec::new();
            let linked = fresh
                .table(handler.table())
                .where_(Clause::eq(handler.source_key(), owner_key))
                .find(&mut links, &[])
                .await;
            if linked.error().is_some() {
                return linked;
            }
            let keys = distinct_keys(links.iter().map(|l| l.get(handler.destination_key())));
            fresh
                .where_(Clause::in_list(handler.destination_primary_key(), keys))
                .find(out, &[])
                .await
        }
    }
}

/// Owner column behind `related::<T>()`: `{T}` when the owner carries
/// `{T}_id` (belongs-to), the plural otherwise.
pub(crate) fn related_column<S: Orm, T: Model>(scope: &S) -> String {
    let plural = pluralize(T::NAME);
    let Some(owner) = scope.model_meta() else {
        return plural;
    };
    if scope.join_table_handler(&owner.name, &plural).is_some() {
        return plural;
    }
    let key = format!("{}_id", T::NAME);
    let has_key = owner.has_column(&key) || scope.value().is_some_and(|r| r.contains_key(&key));
    if has_key { T::NAME.to_string() } else { plural }
}

fn owner_of<S: Orm>(scope: &S) -> OrmResult<(TableSchema, Record)> {
    let owner = scope
        .model_meta()
        .ok_or_else(|| OrmError::validation("associations need model() to be set"))?;
    let record = scope
        .value()
        .ok_or_else(|| OrmError::validation("associations need model() to be set"))?;
    if record.get(&owner.primary_key).is_none_or(is_blank) {
        return Err(OrmError::validation(
            "the association owner has no primary key; save it first",
        ));
    }
    Ok((owner, record))
}

/// Mode for changing the relation behind one column of a model value.
///
/// ```ignore
/// let mut languages = db.model(&user).association("languages");
/// languages.append(&mut [Language { name: "EN".into(), ..Default::default() }]).await;
/// assert_eq!(languages.count().await, 1);
/// ```
pub struct Association<S: Orm> {
    scope: S,
    column: String,
    owner: Option<(TableSchema, Record)>,
    error: Option<OrmError>,
}

impl<S: Orm> fmt::Debug for Association<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Association")
            .field("column", &self.column)
            .field("error", &self.error)
            .finish()
    }
}

impl<S: Orm> Association<S> {
    pub(crate) fn new(scope: S, column: &str) -> Self {
        let (owner, error) = match owner_of(&scope) {
            Ok(owner) => (Some(owner), None),
            Err(e) => (None, Some(e)),
        };
        Self {
            scope,
            column: column.to_string(),
            owner,
            error,
        }
    }

    /// The first error met by any operation.
    pub fn error(&self) -> Option<&OrmError> {
        self.error.as_ref()
    }

    fn record(&mut self, result: &S) -> bool {
        if self.error.is_none() {
            self.error = result.error();
        }
        self.error.is_none()
    }

    fn relation(&self) -> Option<(Relation, TableSchema, Record)> {
        if self.error.is_some() {
            return None;
        }
        let (owner, record) = self.owner.clone()?;
        let handler = self.scope.join_table_handler(&owner.name, &self.column);
        let relation = Relation::resolve(&owner, Some(&record), &self.column, None, handler);
        Some((relation, owner, record))
    }

    pub async fn find<T: Model>(&mut self, out: &mut Vec<T>) -> &mut Self {
        if self.error.is_none() {
            let result = find_related(&self.scope, out, &self.column, None).await;
            self.record(&result);
        }
        self
    }

    pub async fn count(&mut self) -> i64 {
        let Some((relation, owner, record)) = self.relation() else {
            return 0;
        };
        let owner_key = record.get(&owner.primary_key).cloned().unwrap_or(Value::Null);
        let fresh = self.scope.new_session();
        let query = match relation {
            Relation::HasMany { table, foreign_key } | Relation::HasOne { table, foreign_key } => {
                fresh.table(&table).where_(Clause::eq(&foreign_key, owner_key))
            }
            Relation::BelongsTo { table, foreign_key } => {
                match record.get(&foreign_key).filter(|k| !is_blank(k)) {
                    Some(key) => fresh.table(&table).where_(Clause::eq("id", key.clone())),
                    None => return 0,
                }
            }
            Relation::ManyToMany(handler) => fresh
                .table(handler.table())
                .where_(Clause::eq(handler.source_key(), owner_key)),
        };
        let mut n = 0;
        let result = query.count(&mut n).await;
        self.record(&result);
        n
    }

    /// Save `values` (creating new ones) and link them to the owner.
    pub async fn append<T: Model>(&mut self, values: &mut [T]) -> &mut Self {
        let Some((relation, owner, record)) = self.relation() else {
            return self;
        };
        let owner_key = record.get(&owner.primary_key).cloned().unwrap_or(Value::Null);
        for value in values.iter_mut() {
            let fresh = self.scope.new_session();
            match &relation {
                Relation::HasMany { foreign_key, .. } | Relation::HasOne { foreign_key, .. } => {
                    if let Err(e) = set_field(value, foreign_key, owner_key.clone()) {
                        self.error = Some(e);
                        break;
                    }
                    let saved = fresh.save(value).await;
                    if !self.record(&saved) {
                        break;
                    }
                }
                Relation::BelongsTo { foreign_key, .. } => {
                    let saved = fresh.save(value).await;
                    if !self.record(&saved) {
                        break;
                    }
                    let key = model_key(value);
                    let linked = self.scope.update_column(foreign_key, key.clone()).await;
                    if !self.record(&linked) {
                        break;
                    }
                    let mut owner_record = record.clone();
                    owner_record.insert(foreign_key.clone(), key);
                    self.scope = self.scope.model(&owner_record);
                    self.owner = Some((owner.clone(), owner_record));
                }
                Relation::ManyToMany(handler) => {
                    let saved = fresh.save(value).await;
                    if !self.record(&saved) {
                        break;
                    }
                    let mut link = Record::new();
                    link.insert(handler.source_key().to_string(), owner_key.clone());
                    link.insert(handler.destination_key().to_string(), model_key(value));
                    let mut existing = 0;
                    let counted = fresh
                        .table(handler.table())
                        .where_(Clause::map(&link))
                        .count(&mut existing)
                        .await;
                    if !self.record(&counted) {
                        break;
                    }
                    if existing == 0 {
                        let created = fresh.table(handler.table()).create(&mut link).await;
                        if !self.record(&created) {
                            break;
                        }
                    }
                }
            }
        }
        self
    }

    /// Unlink `values` from the owner; the rows themselves are kept.
    pub async fn delete<T: Model>(&mut self, values: &[T]) -> &mut Self {
        let Some((relation, owner, record)) = self.relation() else {
            return self;
        };
        let owner_key = record.get(&owner.primary_key).cloned().unwrap_or(Value::Null);
        let keys: Vec<Value> = values.iter().map(model_key).collect();
        let fresh = self.scope.new_session();
        let result = match relation {
            Relation::HasMany { table, foreign_key } | Relation::HasOne { table, foreign_key } => {
                fresh
                    .table(&table)
                    .where_(Clause::eq(&foreign_key, owner_key))
                    .where_(Clause::in_list(T::PRIMARY_KEY, keys))
                    .update_column(&foreign_key, Value::Null)
                    .await
            }
            Relation::BelongsTo { foreign_key, .. } => {
                match record.get(&foreign_key) {
                    Some(current) if keys.contains(current) => {
                        self.scope.update_column(&foreign_key, Value::Null).await
                    }
                    _ => return self,
                }
            }
            Relation::ManyToMany(handler) => {
                fresh
                    .table(handler.table())
                    .where_(Clause::eq(handler.source_key(), owner_key))
                    .where_(Clause::in_list(handler.destination_key(), keys))
                    .delete(&Record::new(), &[])
                    .await
            }
        };
        self.record(&result);
        self
    }

    /// Replace the linked rows with `values`.
    pub async fn replace<T: Model>(&mut self, values: &mut [T]) -> &mut Self {
        self.clear().await;
        self.append(values).await
    }

    /// Unlink every row from the owner.
    pub async fn clear(&mut self) -> &mut Self {
        let Some((relation, owner, record)) = self.relation() else {
            return self;
        };
        let owner_key = record.get(&owner.primary_key).cloned().unwrap_or(Value::Null);
        let fresh = self.scope.new_session();
        let result = match relation {
            Relation::HasMany { table, foreign_key } | Relation::HasOne { table, foreign_key } => {
                fresh
                    .table(&table)
                    .where_(Clause::eq(&foreign_key, owner_key))
                    .update_column(&foreign_key, Value::Null)
                    .await
            }
            Relation::BelongsTo { foreign_key, .. } => {
                self.scope.update_column(&foreign_key, Value::Null).await
            }
            Relation::ManyToMany(handler) => {
                fresh
                    .table(handler.table())
                    .where_(Clause::eq(handler.source_key(), owner_key))
                    .delete(&Record::new(), &[])
                    .await
            }
        };
        self.record(&result);
        self
    }
}

fn model_key<T: Model>(value: &T) -> Value {
    to_record(value)
        .ok()
        .and_then(|mut r| r.remove(T::PRIMARY_KEY))
        .unwrap_or(Value::Null)
}

fn set_field<T: Model>(value: &mut T, column: &str, field: Value) -> OrmResult<()> {
    let mut record = to_record(value)?;
    record.insert(column.to_string(), field);
    *value = from_record(record)?;
    Ok(())
}
