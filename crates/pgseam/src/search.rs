//! Accumulated query conditions and their SQL rendering.

use crate::clause::Clause;
use crate::error::{OrmError, OrmResult};
use crate::ident;
use crate::model::DELETED_AT;
use crate::sql::Sql;
use crate::value::{Record, is_blank};
use serde_json::Value;

/// A `preload(column, conditions)` request.
#[derive(Debug, Clone)]
pub(crate) struct Preload {
    pub column: String,
    pub conditions: Vec<Clause>,
}

/// Conditions collected by builder calls. Cloned on every chain step.
#[derive(Debug, Clone, Default)]
pub(crate) struct Search {
    pub wheres: Vec<Clause>,
    pub ors: Vec<Clause>,
    pub nots: Vec<Clause>,
    pub havings: Vec<Clause>,
    pub joins: Vec<Clause>,
    pub orders: Vec<Clause>,
    pub select: Option<Clause>,
    pub omits: Vec<String>,
    pub group: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub table: Option<String>,
    pub raw: Option<Clause>,
    pub preloads: Vec<Preload>,
    pub init_attrs: Vec<Record>,
    pub assign_attrs: Vec<Record>,
    pub unscoped: bool,
}

/// What the renderer needs to know about the target table.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Target<'a> {
    pub table: &'a str,
    pub primary_key: &'a str,
    pub soft_delete: bool,
    /// Primary key of the session value; a non-blank key becomes a condition.
    pub key: Option<&'a Value>,
}

impl Search {
    pub(crate) fn set_limit(&mut self, n: i64) {
        self.limit = (n >= 0).then_some(n);
    }

    pub(crate) fn set_offset(&mut self, n: i64) {
        self.offset = (n >= 0).then_some(n);
    }

    /// Whether any where/or/not condition is present.
    pub(crate) fn has_conditions(&self) -> bool {
        !(self.wheres.is_empty() && self.ors.is_empty() && self.nots.is_empty())
    }

    pub(crate) fn is_omitted(&self, column: &str) -> bool {
        self.omits.iter().any(|c| c == column)
    }

    /// `WHERE ...` (with a leading space), or nothing.
    ///
    /// Primary conditions (soft delete, model key) are AND-ed; where and not
    /// conditions are AND-ed; or conditions join that set with OR; the
    /// combined set is parenthesised after primary conditions.
    pub(crate) fn where_sql(&self, target: &Target<'_>) -> OrmResult<Sql> {
        let mut primary = Vec::new();
        if target.soft_delete && !self.unscoped {
            let mut s = Sql::empty();
            s.push_column(target.table, DELETED_AT)?.push(" IS NULL");
            primary.push(s);
        }
        if let Some(key) = target.key.filter(|k| !is_blank(k)) {
            let mut s = Sql::empty();
            s.push_column(target.table, target.primary_key)?
                .push(" = ")
                .push_bind(key.clone());
            primary.push(s);
        }

        let mut and = self.conditions(&self.wheres, target)?;
        for not in self.conditions(&self.nots, target)? {
            let mut s = Sql::new("NOT ");
            s.push_sql(not);
            and.push(s);
        }
        let or = self.conditions(&self.ors, target)?;

        let mut combined = Sql::empty();
        push_joined(&mut combined, and, " AND ");
        if !or.is_empty() {
            if !combined.is_empty() {
                combined.push(" OR ");
            }
            push_joined(&mut combined, or, " OR ");
        }

        let mut out = Sql::empty();
        if !primary.is_empty() {
            out.push(" WHERE ");
            push_joined(&mut out, primary, " AND ");
            if !combined.is_empty() {
                out.push(" AND (").push_sql(combined).push(")");
            }
        } else if !combined.is_empty() {
            out.push(" WHERE ").push_sql(combined);
        }
        Ok(out)
    }

    fn conditions(&self, clauses: &[Clause], target: &Target<'_>) -> OrmResult<Vec<Sql>> {
        let mut out = Vec::with_capacity(clauses.len());
        for clause in clauses {
            let mut s = Sql::empty();
            if clause.write_condition(&mut s, target.table, target.primary_key)? {
                out.push(s);
            }
        }
        Ok(out)
    }

    /// Joins, where, group, having, order, limit and offset.
    pub(crate) fn combined_sql(&self, target: &Target<'_>, with_order: bool) -> OrmResult<Sql> {
        let mut out = Sql::empty();
        for join in &self.joins {
            out.push(" ");
            join.write_fragment(&mut out)?;
        }
        out.push_sql(self.where_sql(target)?);
        if let Some(group) = &self.group {
            out.push(" GROUP BY ").push(group);
        }
        if !self.havings.is_empty() {
            out.push(" HAVING ");
            let havings = self.conditions(&self.havings, target)?;
            push_joined(&mut out, havings, " AND ");
        }
        if with_order {
            self.push_order(&mut out)?;
            if let Some(limit) = self.limit {
                out.limit(limit);
            }
            if let Some(offset) = self.offset {
                out.offset(offset);
            }
        }
        Ok(out)
    }

    fn push_order(&self, out: &mut Sql) -> OrmResult<()> {
        for (i, order) in self.orders.iter().enumerate() {
            out.push(if i == 0 { " ORDER BY " } else { ", " });
            order.write_fragment(out)?;
        }
        Ok(())
    }

    fn select_list(&self, target: &Target<'_>, out: &mut Sql) -> OrmResult<()> {
        match &self.select {
            Some(select) => select.write_fragment(out),
            None if !self.joins.is_empty() => {
                out.push(&ident::quote(target.table)?).push(".*");
                Ok(())
            }
            None => {
                out.push("*");
                Ok(())
            }
        }
    }

    /// The statement run by `find`, `first`, `scan`, `rows`, `pluck`...
    pub(crate) fn select_sql(&self, target: &Target<'_>, query_option: Option<&str>) -> OrmResult<Sql> {
        let mut out = Sql::empty();
        if let Some(raw) = &self.raw {
            raw.write_fragment(&mut out)?;
            self.push_order(&mut out)?;
            if let Some(limit) = self.limit {
                out.limit(limit);
            }
            if let Some(offset) = self.offset {
                out.offset(offset);
            }
            return Ok(out);
        }

        out.push("SELECT ");
        self.select_list(target, &mut out)?;
        out.push(" FROM ").push_ident(target.table)?;
        out.push_sql(self.combined_sql(target, true)?);
        if let Some(option) = query_option.filter(|o| !o.trim().is_empty()) {
            out.push(" ").push(option);
        }
        Ok(out)
    }

    /// `count(*)`, ignoring order, limit and offset. Grouped queries are
    /// counted through a sub-select.
    pub(crate) fn count_sql(&self, target: &Target<'_>) -> OrmResult<Sql> {
        let mut out = Sql::new("SELECT count(*) FROM ");
        if let Some(raw) = &self.raw {
            out.push("(");
            raw.write_fragment(&mut out)?;
            out.push(") AS count_table");
            return Ok(out);
        }
        if self.group.is_some() {
            out.push("(SELECT ");
            match &self.select {
                Some(select) => select.write_fragment(&mut out)?,
                None => {
                    out.push("1");
                }
            }
            out.push(" FROM ").push_ident(target.table)?;
            out.push_sql(self.combined_sql(target, false)?);
            out.push(") AS count_table");
            return Ok(out);
        }
        out.push_ident(target.table)?;
        out.push_sql(self.combined_sql(target, false)?);
        Ok(out)
    }

    /// `pluck(column)`: the select list replaced by one column, or by an
    /// expression when `column` is not an identifier.
    pub(crate) fn pluck_sql(
        &self,
        target: &Target<'_>,
        column: &str,
        query_option: Option<&str>,
    ) -> OrmResult<Sql> {
        let mut search = self.clone();
        let select = ident::quote_column(target.table, column).unwrap_or_else(|_| column.to_string());
        search.select = Some(Clause::raw(select));
        search.select_sql(target, query_option)
    }

    /// Conditions without bound arguments only (partial index predicates).
    pub(crate) fn argless_where_sql(&self, target: &Target<'_>) -> OrmResult<Sql> {
        if self.wheres.iter().chain(&self.ors).chain(&self.nots).any(Clause::has_args) {
            return Err(OrmError::InvalidSql(
                "index conditions cannot have bound arguments".into(),
            ));
        }
        let mut plain = self.clone();
        plain.unscoped = true;
        plain.where_sql(&Target { key: None, soft_delete: false, ..*target })
    }
}

fn push_joined(out: &mut Sql, parts: Vec<Sql>, sep: &str) {
    for (i, part) in parts.into_iter().enumerate() {
        if i > 0 {
            out.push(sep);
        }
        out.push_sql(part);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clause;
    use serde_json::json;

    fn users() -> Target<'static> {
        Target {
            table: "users",
            primary_key: "id",
            soft_delete: false,
            key: None,
        }
    }

    #[test]
    fn and_or_not_follow_precedence() {
        let search = Search {
            wheres: vec![clause!("name = ?", "jinzhu"), Clause::gt("age", 20)],
            ors: vec![clause!("role = ?", "admin")],
            nots: vec![Clause::eq("banned", true)],
            ..Search::default()
        };
        let mut target = users();
        target.soft_delete = true;
        let q = search.select_sql(&target, None).unwrap();
        assert_eq!(
            q.to_sql(),
            r#"SELECT * FROM "users" WHERE "users"."deleted_at" IS NULL AND ((name = $1) AND ("users"."age" > $2) AND NOT ("users"."banned" = $3) OR (role = $4))"#
        );
        assert_eq!(q.params().len(), 4);
    }

    #[test]
    fn unscoped_skips_soft_delete() {
        let search = Search {
            unscoped: true,
            ..Search::default()
        };
        let mut target = users();
        target.soft_delete = true;
        assert_eq!(
            search.select_sql(&target, None).unwrap().to_sql(),
            r#"SELECT * FROM "users""#
        );
    }

    #[test]
    fn model_key_is_a_primary_condition() {
        let key = json!(7);
        let search = Search {
            wheres: vec![Clause::eq("name", "x")],
            ..Search::default()
        };
        let target = Target {
            key: Some(&key),
            ..users()
        };
        assert_eq!(
            search.where_sql(&target).unwrap().to_sql(),
            r#" WHERE "users"."id" = $1 AND (("users"."name" = $2))"#
        );

        let blank = json!(0);
        let target = Target {
            key: Some(&blank),
            ..users()
        };
        assert_eq!(Search::default().where_sql(&target).unwrap().to_sql(), "");
    }

    #[test]
    fn full_select_with_every_part() {
        let mut search = Search {
            joins: vec![Clause::raw(r#"JOIN emails ON emails.user_id = users.id"#)],
            group: Some("users.name".into()),
            havings: vec![clause!("count(*) > ?", 1)],
            orders: vec![Clause::raw("users.name DESC")],
            ..Search::default()
        };
        search.set_limit(10);
        search.set_offset(5);
        assert_eq!(
            search.select_sql(&users(), Some("FOR UPDATE")).unwrap().to_sql(),
            r#"SELECT "users".* FROM "users" JOIN emails ON emails.user_id = users.id GROUP BY users.name HAVING (count(*) > $1) ORDER BY users.name DESC LIMIT 10 OFFSET 5 FOR UPDATE"#
        );

        search.set_limit(-1);
        assert!(search.limit.is_none());
    }

    #[test]
    fn count_drops_order_limit_and_offset() {
        let mut search = Search {
            wheres: vec![Clause::eq("active", true)],
            orders: vec![Clause::raw("id")],
            ..Search::default()
        };
        search.set_limit(1);
        assert_eq!(
            search.count_sql(&users()).unwrap().to_sql(),
            r#"SELECT count(*) FROM "users" WHERE ("users"."active" = $1)"#
        );

        search.group = Some("name".into());
        assert_eq!(
            search.count_sql(&users()).unwrap().to_sql(),
            r#"SELECT count(*) FROM (SELECT 1 FROM "users" WHERE ("users"."active" = $1) GROUP BY name) AS count_table"#
        );
    }

    #[test]
    fn raw_statements_are_used_verbatim() {
        let search = Search {
            raw: Some(clause!("SELECT name FROM users WHERE id = ?", 3)),
            ..Search::default()
        };
        assert_eq!(
            search.select_sql(&users(), None).unwrap().to_sql(),
            "SELECT name FROM users WHERE id = $1"
        );
        assert_eq!(
            search.count_sql(&users()).unwrap().to_sql(),
            "SELECT count(*) FROM (SELECT name FROM users WHERE id = $1) AS count_table"
        );
    }

    #[test]
    fn pluck_selects_one_column() {
        let q = Search::default().pluck_sql(&users(), "email", None).unwrap();
        assert_eq!(q.to_sql(), r#"SELECT "users"."email" FROM "users""#);

        let q = Search::default().pluck_sql(&users(), "max(age)", None).unwrap();
        assert_eq!(q.to_sql(), r#"SELECT max(age) FROM "users""#);
    }

    #[test]
    fn index_conditions_reject_arguments() {
        let plain = Search {
            wheres: vec![Clause::raw("deleted_at IS NULL")],
            ..Search::default()
        };
        assert_eq!(
            plain.argless_where_sql(&users()).unwrap().to_sql(),
            " WHERE (deleted_at IS NULL)"
        );
        let bound = Search {
            wheres: vec![Clause::eq("a", 1)],
            ..Search::default()
        };
        assert!(bound.argless_where_sql(&users()).is_err());
    }
}
