//! Query conditions and SQL fragments.
//!
//! A [`Clause`] is one argument to `where_`, `or`, `not`, `order`, `select`,
//! `having`, `joins`, `raw` or `exec`. It is either raw SQL with `?`
//! placeholders or a structured condition built from a column and a value.
//!
//! ```ignore
//! use pgseam::{Clause, clause};
//!
//! Clause::raw("name = ? AND age >= ?").bind("jinzhu").bind(20);
//! clause!("name IN (?)", vec!["jinzhu", "jinzhu 2"]);
//! Clause::eq("name", "jinzhu");
//! Clause::fields(&User { name: "jinzhu".into(), ..Default::default() });
//! Clause::map(serde_json::json!({ "name": "jinzhu", "age": null }));
//! Clause::primary_key(10);
//! ```

use crate::error::{OrmError, OrmResult};
use crate::sql::Sql;
use crate::value::{Record, SqlValue, is_blank, to_record};
use serde::Serialize;
use serde_json::Value;
use std::fmt;

/// One bound argument of a raw clause.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    /// A single parameter.
    Value(Value),
    /// A list that expands into `$1, $2, ...` (`NULL` when empty).
    List(Vec<Value>),
}

impl Arg {
    /// Serialise a value; sequences become lists.
    pub fn value<T: Serialize + ?Sized>(value: &T) -> OrmResult<Self> {
        Ok(Self::from_json(serde_json::to_value(value)?))
    }

    /// Serialise a sequence as a list argument.
    pub fn list<T: Serialize>(values: impl IntoIterator<Item = T>) -> OrmResult<Self> {
        let values = values
            .into_iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::List(values))
    }

    pub(crate) fn from_json(value: Value) -> Self {
        match value {
            Value::Array(items) => Self::List(items),
            other => Self::Value(other),
        }
    }
}

/// Comparison operator of a structured condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Like,
}

impl CmpOp {
    pub fn as_sql(self) -> &'static str {
        match self {
            CmpOp::Eq => "=",
            CmpOp::Ne => "<>",
            CmpOp::Gt => ">",
            CmpOp::Gte => ">=",
            CmpOp::Lt => "<",
            CmpOp::Lte => "<=",
            CmpOp::Like => "LIKE",
        }
    }

    /// Parse the operator of a raw `col OP ?` clause.
    pub fn parse(op: &str) -> Option<Self> {
        Some(match op.to_ascii_uppercase().as_str() {
            "=" => CmpOp::Eq,
            "<>" | "!=" => CmpOp::Ne,
            ">" => CmpOp::Gt,
            ">=" => CmpOp::Gte,
            "<" => CmpOp::Lt,
            "<=" => CmpOp::Lte,
            "LIKE" => CmpOp::Like,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone)]
pub(crate) enum ClauseKind {
    Raw { sql: String, args: Vec<Arg> },
    Compare { column: String, op: CmpOp, value: Value },
    In { column: String, values: Vec<Value>, negated: bool },
    Null { column: String, negated: bool },
    Fields(Record),
    Map(Record),
    PrimaryKey(Vec<Value>),
    Invalid(OrmError),
}

/// A condition or SQL fragment passed to a session builder.
#[derive(Debug, Clone)]
pub struct Clause {
    pub(crate) kind: ClauseKind,
}

impl Clause {
    fn new(kind: ClauseKind) -> Self {
        Self { kind }
    }

    fn invalid(err: impl Into<OrmError>) -> Self {
        Self::new(ClauseKind::Invalid(err.into()))
    }

    /// Raw SQL with `?` placeholders; bind arguments with [`Clause::bind`].
    pub fn raw(sql: impl Into<String>) -> Self {
        Self::new(ClauseKind::Raw {
            sql: sql.into(),
            args: Vec::new(),
        })
    }

    /// Bind the next `?` of a raw clause. Sequences expand into lists.
    pub fn bind<T: Serialize>(self, value: T) -> Self {
        match serde_json::to_value(value) {
            Ok(v) => self.push_arg(Arg::from_json(v)),
            Err(e) => Self::invalid(e),
        }
    }

    /// Bind the next `?` as one parameter even if it is a sequence (json columns).
    pub fn bind_single<T: Serialize>(self, value: T) -> Self {
        match serde_json::to_value(value) {
            Ok(v) => self.push_arg(Arg::Value(v)),
            Err(e) => Self::invalid(e),
        }
    }

    fn push_arg(mut self, arg: Arg) -> Self {
        match &mut self.kind {
            ClauseKind::Raw { args, .. } => args.push(arg),
            ClauseKind::Invalid(_) => {}
            _ => {
                return Self::invalid(OrmError::InvalidSql(
                    "bind() is only valid on raw clauses".into(),
                ));
            }
        }
        self
    }

    fn compare<T: Serialize>(column: &str, op: CmpOp, value: T) -> Self {
        match serde_json::to_value(value) {
            Ok(value) => Self::new(ClauseKind::Compare {
                column: column.to_string(),
                op,
                value,
            }),
            Err(e) => Self::invalid(e),
        }
    }

    /// `column = value`
    pub fn eq<T: Serialize>(column: &str, value: T) -> Self {
        Self::compare(column, CmpOp::Eq, value)
    }

    /// `column <> value`
    pub fn ne<T: Serialize>(column: &str, value: T) -> Self {
        Self::compare(column, CmpOp::Ne, value)
    }

    /// `column > value`
    pub fn gt<T: Serialize>(column: &str, value: T) -> Self {
        Self::compare(column, CmpOp::Gt, value)
    }

    /// `column >= value`
    pub fn gte<T: Serialize>(column: &str, value: T) -> Self {
        Self::compare(column, CmpOp::Gte, value)
    }

    /// `column < value`
    pub fn lt<T: Serialize>(column: &str, value: T) -> Self {
        Self::compare(column, CmpOp::Lt, value)
    }

    /// `column <= value`
    pub fn lte<T: Serialize>(column: &str, value: T) -> Self {
        Self::compare(column, CmpOp::Lte, value)
    }

    /// `column LIKE pattern`
    pub fn like(column: &str, pattern: impl Into<String>) -> Self {
        Self::compare(column, CmpOp::Like, pattern.into())
    }

    fn in_kind<T: Serialize>(column: &str, values: impl IntoIterator<Item = T>, negated: bool) -> Self {
        let values: Result<Vec<Value>, _> = values.into_iter().map(serde_json::to_value).collect();
        match values {
            Ok(values) => Self::new(ClauseKind::In {
                column: column.to_string(),
                values,
                negated,
            }),
            Err(e) => Self::invalid(e),
        }
    }

    /// `column IN (values)`; an empty list matches nothing.
    pub fn in_list<T: Serialize>(column: &str, values: impl IntoIterator<Item = T>) -> Self {
        Self::in_kind(column, values, false)
    }

    /// `column NOT IN (values)`
    pub fn not_in<T: Serialize>(column: &str, values: impl IntoIterator<Item = T>) -> Self {
        Self::in_kind(column, values, true)
    }

    /// `column IS NULL`
    pub fn is_null(column: &str) -> Self {
        Self::new(ClauseKind::Null {
            column: column.to_string(),
            negated: false,
        })
    }

    /// `column IS NOT NULL`
    pub fn is_not_null(column: &str) -> Self {
        Self::new(ClauseKind::Null {
            column: column.to_string(),
            negated: true,
        })
    }

    /// Struct condition: every field that is not zero-valued must match.
    pub fn fields<T: Serialize + ?Sized>(value: &T) -> Self {
        match to_record(value) {
            Ok(record) => Self::new(ClauseKind::Fields(record)),
            Err(e) => Self::invalid(e),
        }
    }

    /// Map condition: every entry must match; `null` entries become `IS NULL`.
    pub fn map(value: impl Serialize) -> Self {
        match to_record(&value) {
            Ok(record) => Self::new(ClauseKind::Map(record)),
            Err(e) => Self::invalid(e),
        }
    }

    /// Inline primary key condition; a sequence becomes `IN`.
    pub fn primary_key<T: Serialize>(value: T) -> Self {
        match serde_json::to_value(value) {
            Ok(Value::Array(items)) => Self::new(ClauseKind::PrimaryKey(items)),
            Ok(v) => Self::new(ClauseKind::PrimaryKey(vec![v])),
            Err(e) => Self::invalid(e),
        }
    }

    /// The serialisation error captured when the clause was built, if any.
    pub fn error(&self) -> Option<&OrmError> {
        match &self.kind {
            ClauseKind::Invalid(e) => Some(e),
            _ => None,
        }
    }

    /// Raw SQL text, for raw clauses.
    pub fn raw_sql(&self) -> Option<&str> {
        match &self.kind {
            ClauseKind::Raw { sql, .. } => Some(sql),
            _ => None,
        }
    }

    /// Whether this clause carries bound arguments.
    pub fn has_args(&self) -> bool {
        match &self.kind {
            ClauseKind::Raw { args, .. } => !args.is_empty(),
            ClauseKind::Invalid(_) => false,
            _ => true,
        }
    }

    /// JSON description used by call journals and log lines.
    pub fn describe(&self) -> Value {
        match &self.kind {
            ClauseKind::Raw { sql, args } => {
                let args: Vec<Value> = args
                    .iter()
                    .map(|a| match a {
                        Arg::Value(v) => v.clone(),
                        Arg::List(vs) => Value::Array(vs.clone()),
                    })
                    .collect();
                serde_json::json!({ "sql": sql, "args": args })
            }
            ClauseKind::Compare { column, op, value } => {
                serde_json::json!({ "column": column, "op": op.as_sql(), "value": value })
            }
            ClauseKind::In {
                column,
                values,
                negated,
            } => serde_json::json!({
                "column": column,
                "op": if *negated { "NOT IN" } else { "IN" },
                "value": values,
            }),
            ClauseKind::Null { column, negated } => serde_json::json!({
                "column": column,
                "op": if *negated { "IS NOT NULL" } else { "IS NULL" },
            }),
            ClauseKind::Fields(record) => serde_json::json!({ "fields": record }),
            ClauseKind::Map(record) => serde_json::json!({ "map": record }),
            ClauseKind::PrimaryKey(values) => serde_json::json!({ "primary_key": values }),
            ClauseKind::Invalid(e) => serde_json::json!({ "error": e.to_string() }),
        }
    }

    /// Column values this condition pins down, used to initialise a record
    /// in `first_or_init`.
    pub(crate) fn equalities(&self, primary_key: &str) -> Vec<(String, Value)> {
        match &self.kind {
            ClauseKind::Compare {
                column,
                op: CmpOp::Eq,
                value,
            } if !value.is_null() => vec![(column.clone(), value.clone())],
            ClauseKind::Fields(record) => record
                .iter()
                .filter(|(_, v)| !is_zero(v) && !v.is_array())
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            ClauseKind::Map(record) => record
                .iter()
                .filter(|(_, v)| !v.is_array())
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            ClauseKind::PrimaryKey(values) if values.len() == 1 => {
                vec![(primary_key.to_string(), values[0].clone())]
            }
            ClauseKind::Raw { sql, args } => match (split_simple_condition(sql), args.as_slice()) {
                (Some((column, CmpOp::Eq)), [Arg::Value(v)]) => vec![(column, v.clone())],
                _ => Vec::new(),
            },
            _ => Vec::new(),
        }
    }

    /// Render as a fragment (select list, order, joins): raw text only.
    pub(crate) fn write_fragment(&self, out: &mut Sql) -> OrmResult<()> {
        match &self.kind {
            ClauseKind::Raw { sql, args } => {
                out.push_raw(sql, args)?;
                Ok(())
            }
            ClauseKind::Invalid(e) => Err(e.clone()),
            _ => Err(OrmError::InvalidSql(
                "expected a raw SQL fragment".to_string(),
            )),
        }
    }

    /// Render as a condition on `table`. Returns `false` when the clause
    /// contributes nothing (an all-zero struct condition).
    pub(crate) fn write_condition(
        &self,
        out: &mut Sql,
        table: &str,
        primary_key: &str,
    ) -> OrmResult<bool> {
        match &self.kind {
            ClauseKind::Raw { sql, args } if args.is_empty() && is_number(sql) => {
                write_primary_key(out, table, primary_key, &[Value::String(sql.trim().into())])?;
            }
            ClauseKind::Raw { sql, args } => {
                if sql.trim().is_empty() {
                    return Ok(false);
                }
                out.push("(");
                out.push_raw(sql, args)?;
                out.push(")");
            }
            ClauseKind::Compare { column, op, value } => {
                out.push("(");
                out.push_column(table, column)?;
                if value.is_null() {
                    out.push(if *op == CmpOp::Ne { " IS NOT NULL" } else { " IS NULL" });
                } else {
                    out.push(" ").push(op.as_sql()).push(" ").push_bind(value.clone());
                }
                out.push(")");
            }
            ClauseKind::In {
                column,
                values,
                negated,
            } => {
                out.push("(");
                out.push_column(table, column)?;
                out.push(if *negated { " NOT IN (" } else { " IN (" });
                out.push_bind_list(values.iter().cloned().map(SqlValue));
                out.push("))");
            }
            ClauseKind::Null { column, negated } => {
                out.push("(");
                out.push_column(table, column)?;
                out.push(if *negated { " IS NOT NULL)" } else { " IS NULL)" });
            }
            ClauseKind::Fields(record) => {
                let entries: Vec<_> = record.iter().filter(|(_, v)| !is_zero(v)).collect();
                if entries.is_empty() {
                    return Ok(false);
                }
                write_entries(out, table, entries)?;
            }
            ClauseKind::Map(record) => {
                if record.is_empty() {
                    return Ok(false);
                }
                write_entries(out, table, record.iter().collect())?;
            }
            ClauseKind::PrimaryKey(values) => write_primary_key(out, table, primary_key, values)?,
            ClauseKind::Invalid(e) => return Err(e.clone()),
        }
        Ok(true)
    }
}

/// `column OP ?` with a plain column name, as written in simple raw conditions.
pub(crate) fn split_simple_condition(sql: &str) -> Option<(String, CmpOp)> {
    let mut words = sql.split_whitespace();
    let (column, op, placeholder) = (words.next()?, words.next()?, words.next()?);
    if placeholder != "?" || words.next().is_some() {
        return None;
    }
    let column = column.rsplit('.').next()?.trim_matches('"');
    if column.is_empty() || !column.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_') {
        return None;
    }
    Some((column.to_string(), CmpOp::parse(op)?))
}

fn is_number(s: &str) -> bool {
    let s = s.trim();
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// Zero values skipped by struct conditions.
pub(crate) fn is_zero(value: &Value) -> bool {
    is_blank(value) || *value == Value::Bool(false)
}

fn write_entries(out: &mut Sql, table: &str, entries: Vec<(&String, &Value)>) -> OrmResult<()> {
    for (i, (column, value)) in entries.into_iter().enumerate() {
        if i > 0 {
            out.push(" AND ");
        }
        out.push("(");
        out.push_column(table, column)?;
        match value {
            Value::Null => {
                out.push(" IS NULL");
            }
            Value::Array(items) => {
                out.push(" IN (");
                out.push_bind_list(items.iter().cloned().map(SqlValue));
                out.push(")");
            }
            v => {
                out.push(" = ").push_bind(v.clone());
            }
        }
        out.push(")");
    }
    Ok(())
}

fn write_primary_key(out: &mut Sql, table: &str, primary_key: &str, values: &[Value]) -> OrmResult<()> {
    out.push("(");
    out.push_column(table, primary_key)?;
    match values {
        [single] => {
            out.push(" = ").push_bind(single.clone());
        }
        many => {
            out.push(" IN (");
            out.push_bind_list(many.iter().cloned().map(SqlValue));
            out.push(")");
        }
    }
    out.push(")");
    Ok(())
}

impl fmt::Display for Clause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ClauseKind::Raw { sql, .. } => f.write_str(sql),
            _ => write!(f, "{}", self.describe()),
        }
    }
}

impl From<&str> for Clause {
    fn from(sql: &str) -> Self {
        Clause::raw(sql)
    }
}

impl From<String> for Clause {
    fn from(sql: String) -> Self {
        Clause::raw(sql)
    }
}

impl From<&Clause> for Clause {
    fn from(clause: &Clause) -> Self {
        clause.clone()
    }
}

macro_rules! primary_key_from {
    ($($t:ty),*) => {
        $(
            impl From<$t> for Clause {
                fn from(id: $t) -> Self {
                    Clause::primary_key(id)
                }
            }
        )*
    };
}

primary_key_from!(i16, i32, i64, u32, u64, uuid::Uuid);

/// Raw clause with `?` placeholders and bound arguments.
///
/// ```ignore
/// let c = clause!("name = ? AND age > ?", "jinzhu", 20);
/// ```
#[macro_export]
macro_rules! clause {
    ($sql:expr $(,)?) => {
        $crate::Clause::raw($sql)
    };
    ($sql:expr, $($arg:expr),+ $(,)?) => {
        $crate::Clause::raw($sql)$(.bind($arg))+
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn render(clause: &Clause) -> (String, Vec<SqlValue>) {
        let mut out = Sql::empty();
        clause.write_condition(&mut out, "users", "id").unwrap();
        out.into_parts()
    }

    #[test]
    fn raw_clause_is_parenthesised() {
        let (sql, params) = render(&crate::clause!("name = ? AND age > ?", "jinzhu", 20));
        assert_eq!(sql, "(name = $1 AND age > $2)");
        assert_eq!(params, vec![SqlValue(json!("jinzhu")), SqlValue(json!(20))]);
    }

    #[test]
    fn numeric_string_is_a_primary_key_lookup() {
        let (sql, _) = render(&Clause::from("10"));
        assert_eq!(sql, r#"("users"."id" = $1)"#);
        let (sql, _) = render(&Clause::from(10i64));
        assert_eq!(sql, r#"("users"."id" = $1)"#);
    }

    #[test]
    fn primary_key_list_uses_in() {
        let (sql, params) = render(&Clause::primary_key(vec![1, 2, 3]));
        assert_eq!(sql, r#"("users"."id" IN ($1, $2, $3))"#);
        assert_eq!(params.len(), 3);
    }

    #[test]
    fn struct_condition_skips_zero_values() {
        #[derive(Serialize)]
        struct Filter {
            name: String,
            age: i32,
            email: Option<String>,
        }
        let (sql, _) = render(&Clause::fields(&Filter {
            name: "jinzhu".into(),
            age: 0,
            email: None,
        }));
        assert_eq!(sql, r#"("users"."name" = $1)"#);
    }

    #[test]
    fn map_condition_keeps_nulls() {
        let (sql, params) = render(&Clause::map(json!({ "age": 20, "deleted_at": null })));
        assert_eq!(
            sql,
            r#"("users"."age" = $1) AND ("users"."deleted_at" IS NULL)"#
        );
        assert_eq!(params.len(), 1);
    }

    #[test]
    fn empty_in_list_matches_nothing() {
        let (sql, params) = render(&Clause::in_list("id", Vec::<i64>::new()));
        assert_eq!(sql, r#"("users"."id" IN (NULL))"#);
        assert!(params.is_empty());
    }

    #[test]
    fn serialisation_failure_is_captured() {
        let mut bad = std::collections::HashMap::new();
        bad.insert((1, 2), "tuple keys are not JSON");
        let clause = Clause::map(bad);
        assert!(clause.error().is_some());
        assert!(
            clause
                .write_condition(&mut Sql::empty(), "users", "id")
                .is_err()
        );
    }

    #[test]
    fn binding_on_structured_clause_is_an_error() {
        assert!(Clause::eq("a", 1).bind(2).error().is_some());
    }

    #[test]
    fn fragments_reject_structured_clauses() {
        let mut out = Sql::empty();
        Clause::from("age desc").write_fragment(&mut out).unwrap();
        assert_eq!(out.to_sql(), "age desc");
        assert!(Clause::eq("a", 1).write_fragment(&mut Sql::empty()).is_err());
    }

    #[test]
    fn equalities_from_simple_conditions() {
        assert_eq!(
            crate::clause!("name = ?", "jinzhu").equalities("id"),
            vec![("name".to_string(), json!("jinzhu"))]
        );
        assert!(crate::clause!("age > ?", 3).equalities("id").is_empty());
        assert_eq!(
            Clause::from(7i64).equalities("id"),
            vec![("id".to_string(), json!(7))]
        );
        assert_eq!(split_simple_condition(r#""users"."name" LIKE ?"#), Some(("name".into(), CmpOp::Like)));
        assert_eq!(split_simple_condition("lower(name) = ?"), None);
    }
}
