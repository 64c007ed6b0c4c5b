//! Statement builder.
//!
//! `Sql` stores SQL pieces and [`SqlValue`] parameters separately and generates
//! `$1, $2, ...` placeholders when rendered, so fragments produced by different
//! clauses can be composed without tracking placeholder indices.
//!
//! Raw clause text uses `?` placeholders (see [`Sql::push_raw`]):
//!
//! ```ignore
//! use pgseam::sql::sql;
//! use pgseam::clause::Arg;
//!
//! let mut q = sql("SELECT * FROM \"users\" WHERE ");
//! q.push_raw("age > ? AND id IN (?)", &[Arg::value(18)?, Arg::list(vec![1, 2])?])?;
//! assert_eq!(q.to_sql(), "SELECT * FROM \"users\" WHERE age > $1 AND id IN ($2, $3)");
//! # Ok::<(), pgseam::OrmError>(())
//! ```

use crate::clause::Arg;
use crate::error::{OrmError, OrmResult};
use crate::ident;
use crate::value::SqlValue;
use std::fmt::Write;
use tokio_postgres::types::ToSql;

#[derive(Debug, Clone)]
enum SqlPart {
    Raw(String),
    Param,
}

/// A parameter-safe SQL statement under construction.
#[derive(Debug, Clone, Default)]
pub struct Sql {
    parts: Vec<SqlPart>,
    params: Vec<SqlValue>,
}

/// Start building a SQL statement.
pub fn sql(initial_sql: impl Into<String>) -> Sql {
    Sql::new(initial_sql)
}

/// The first keyword of a statement, uppercased; leading comments and
/// parentheses are skipped.
pub(crate) fn leading_keyword(sql: &str) -> String {
    let mut rest = sql;
    loop {
        rest = rest.trim_start_matches(|c: char| c.is_whitespace() || c == '(');
        if let Some(comment) = rest.strip_prefix("--") {
            rest = comment.split_once('\n').map_or("", |(_, tail)| tail);
        } else if let Some(comment) = rest.strip_prefix("/*") {
            rest = comment.split_once("*/").map_or("", |(_, tail)| tail);
        } else {
            break;
        }
    }
    rest.chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

impl Sql {
    /// Create a new builder with an initial SQL fragment.
    pub fn new(initial_sql: impl Into<String>) -> Self {
        let mut out = Self::empty();
        out.push(&initial_sql.into());
        out
    }

    /// Create an empty builder.
    pub fn empty() -> Self {
        Self {
            parts: Vec::new(),
            params: Vec::new(),
        }
    }

    /// Whether nothing has been pushed yet.
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Append raw SQL (no parameters).
    pub fn push(&mut self, sql: &str) -> &mut Self {
        if sql.is_empty() {
            return self;
        }
        match self.parts.last_mut() {
            Some(SqlPart::Raw(last)) => last.push_str(sql),
            _ => self.parts.push(SqlPart::Raw(sql.to_string())),
        }
        self
    }

    /// Append a parameter placeholder and bind its value.
    pub fn push_bind(&mut self, value: impl Into<SqlValue>) -> &mut Self {
        self.parts.push(SqlPart::Param);
        self.params.push(value.into());
        self
    }

    /// Append a comma-separated list of placeholders and bind all values.
    ///
    /// If `values` is empty, this appends `NULL` (so `IN (NULL)` is valid SQL).
    pub fn push_bind_list<T: Into<SqlValue>>(
        &mut self,
        values: impl IntoIterator<Item = T>,
    ) -> &mut Self {
        let mut iter = values.into_iter();
        let Some(first) = iter.next() else {
            return self.push("NULL");
        };
        self.push_bind(first);
        for v in iter {
            self.push(", ");
            self.push_bind(v);
        }
        self
    }

    /// Append another `Sql` fragment, consuming it.
    pub fn push_sql(&mut self, other: Sql) -> &mut Self {
        for part in other.parts {
            match part {
                SqlPart::Raw(s) => {
                    self.push(&s);
                }
                SqlPart::Param => self.parts.push(SqlPart::Param),
            }
        }
        self.params.extend(other.params);
        self
    }

    /// Append a validated, double-quoted identifier.
    pub fn push_ident(&mut self, name: &str) -> OrmResult<&mut Self> {
        let quoted = ident::quote(name)?;
        Ok(self.push(&quoted))
    }

    /// Append `"table"."column"` (or the column as given when already qualified).
    pub fn push_column(&mut self, table: &str, column: &str) -> OrmResult<&mut Self> {
        let quoted = ident::quote_column(table, column)?;
        Ok(self.push(&quoted))
    }

    /// Append raw SQL written with `?` placeholders, binding `args` in order.
    ///
    /// - `??` renders a literal `?` (for jsonb operators)
    /// - `?` inside single-quoted literals or double-quoted identifiers is text
    /// - list arguments expand into `$1, $2, ...`; an empty list renders `NULL`
    pub fn push_raw(&mut self, raw: &str, args: &[Arg]) -> OrmResult<&mut Self> {
        let mut args = args.iter();
        let mut chunk = String::with_capacity(raw.len());
        let mut quote: Option<char> = None;
        let mut chars = raw.chars().peekable();

        while let Some(c) = chars.next() {
            match (quote, c) {
                (Some(q), c) if c == q => {
                    quote = None;
                    chunk.push(c);
                }
                (Some(_), c) => chunk.push(c),
                (None, '\'' | '"') => {
                    quote = Some(c);
                    chunk.push(c);
                }
                (None, '?') if chars.peek() == Some(&'?') => {
                    chars.next();
                    chunk.push('?');
                }
                (None, '?') => {
                    let arg = args.next().ok_or_else(|| {
                        OrmError::InvalidSql(format!("not enough arguments for {raw:?}"))
                    })?;
                    self.push(&chunk);
                    chunk.clear();
                    match arg {
                        Arg::Value(v) => self.push_bind(v.clone()),
                        Arg::List(vs) => self.push_bind_list(vs.iter().cloned().map(SqlValue)),
                    };
                }
                (None, c) => chunk.push(c),
            }
        }
        if quote.is_some() {
            return Err(OrmError::InvalidSql(format!("unterminated quote in {raw:?}")));
        }
        if args.next().is_some() {
            return Err(OrmError::InvalidSql(format!("too many arguments for {raw:?}")));
        }
        self.push(&chunk);
        Ok(self)
    }

    /// Render SQL with `$1, $2, ...` placeholders.
    pub fn to_sql(&self) -> String {
        let mut out = String::new();
        let mut idx: usize = 0;
        for part in &self.parts {
            match part {
                SqlPart::Raw(s) => out.push_str(s),
                SqlPart::Param => {
                    idx += 1;
                    let _ = write!(&mut out, "${idx}");
                }
            }
        }
        out
    }

    /// Bound parameters in placeholder order.
    pub fn params(&self) -> &[SqlValue] {
        &self.params
    }

    /// Parameter refs compatible with `tokio-postgres`.
    pub fn params_ref(&self) -> Vec<&(dyn ToSql + Sync)> {
        self.params
            .iter()
            .map(|p| p as &(dyn ToSql + Sync))
            .collect()
    }

    /// Render and split into statement text and parameters.
    pub fn into_parts(self) -> (String, Vec<SqlValue>) {
        let text = self.to_sql();
        (text, self.params)
    }

    /// Append `LIMIT n`.
    pub fn limit(&mut self, n: i64) -> &mut Self {
        self.push(&format!(" LIMIT {n}"))
    }

    /// Append `OFFSET n`.
    pub fn offset(&mut self, n: i64) -> &mut Self {
        self.push(&format!(" OFFSET {n}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(values: &[serde_json::Value]) -> Vec<Arg> {
        values.iter().cloned().map(Arg::from_json).collect()
    }

    #[test]
    fn builds_placeholders_in_order() {
        let mut q = sql("SELECT * FROM users WHERE a = ");
        q.push_bind(json!(1)).push(" AND b = ").push_bind(json!("x"));

        assert_eq!(q.to_sql(), "SELECT * FROM users WHERE a = $1 AND b = $2");
        assert_eq!(q.params_ref().len(), 2);
    }

    #[test]
    fn can_compose_fragments() {
        let mut w = Sql::empty();
        w.push(" AND id = ").push_bind(json!(42));

        let mut q = sql("SELECT * FROM users WHERE a = ");
        q.push_bind(json!(1));
        q.push_sql(w);

        assert_eq!(q.to_sql(), "SELECT * FROM users WHERE a = $1 AND id = $2");
        assert_eq!(q.params(), &[SqlValue(json!(1)), SqlValue(json!(42))]);
    }

    #[test]
    fn bind_list_empty_is_valid_sql() {
        let mut q = sql("SELECT * FROM users WHERE id IN (");
        q.push_bind_list(Vec::<SqlValue>::new()).push(")");
        assert_eq!(q.to_sql(), "SELECT * FROM users WHERE id IN (NULL)");
        assert!(q.params().is_empty());
    }

    #[test]
    fn raw_placeholders_become_numbered() {
        let mut q = sql("SELECT 1 WHERE ");
        q.push_raw("name = ? AND age > ?", &args(&[json!("jinzhu"), json!(20)]))
            .unwrap();
        assert_eq!(q.to_sql(), "SELECT 1 WHERE name = $1 AND age > $2");
    }

    #[test]
    fn raw_list_argument_expands() {
        let mut q = Sql::empty();
        q.push_raw("id IN (?)", &args(&[json!([1, 2, 3])])).unwrap();
        assert_eq!(q.to_sql(), "id IN ($1, $2, $3)");

        let mut q = Sql::empty();
        q.push_raw("id IN (?)", &args(&[json!([])])).unwrap();
        assert_eq!(q.to_sql(), "id IN (NULL)");
    }

    #[test]
    fn raw_question_marks_in_literals_and_escapes_are_text() {
        let mut q = Sql::empty();
        q.push_raw("note = 'why?' AND tags ?? 'a' AND x = ?", &args(&[json!(1)]))
            .unwrap();
        assert_eq!(q.to_sql(), "note = 'why?' AND tags ? 'a' AND x = $1");
    }

    #[test]
    fn raw_argument_count_must_match() {
        assert!(Sql::empty().push_raw("a = ? AND b = ?", &args(&[json!(1)])).is_err());
        assert!(Sql::empty().push_raw("a = 1", &args(&[json!(1)])).is_err());
    }

    #[test]
    fn push_ident_quotes_and_validates() {
        let mut q = Sql::empty();
        q.push_ident("public.users").unwrap();
        assert_eq!(q.to_sql(), r#""public"."users""#);
        assert!(Sql::empty().push_ident("users; DROP TABLE x").is_err());
    }

    #[test]
    fn limit_and_offset_are_inlined() {
        let mut q = sql("SELECT * FROM users");
        q.limit(10).offset(20);
        assert_eq!(q.to_sql(), "SELECT * FROM users LIMIT 10 OFFSET 20");
    }

    #[test]
    fn keyword_detection_skips_comments() {
        assert_eq!(leading_keyword("-- c\n (select 1)"), "SELECT");
        assert_eq!(leading_keyword("/* hint */ delete from users"), "DELETE");
        assert_eq!(leading_keyword("selection"), "SELECTION");
        assert_eq!(leading_keyword("-- only a comment"), "");
    }
}
