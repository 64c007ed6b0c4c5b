//! In-memory evaluation of clauses against records.

use crate::clause::{Arg, Clause, ClauseKind, CmpOp, is_zero, split_simple_condition};
use crate::error::{OrmError, OrmResult};
use crate::model::DELETED_AT;
use crate::search::{Search, Target};
use crate::value::{Record, is_blank};
use serde_json::Value;
use std::cmp::Ordering;

/// Whether `record` passes the search's where/or/not conditions and the
/// target's soft-delete and key conditions, combined the way the engine
/// renders them.
pub(crate) fn matches(search: &Search, target: &Target<'_>, record: &Record) -> OrmResult<bool> {
    if target.soft_delete && !search.unscoped && record.get(DELETED_AT).is_some_and(|v| !v.is_null()) {
        return Ok(false);
    }
    if let Some(key) = target.key.filter(|k| !is_blank(k)) {
        if !record.get(target.primary_key).is_some_and(|v| loose_eq(v, key)) {
            return Ok(false);
        }
    }

    let mut and = Vec::new();
    for clause in &search.wheres {
        if let Some(hit) = condition(clause, record, target.primary_key)? {
            and.push(hit);
        }
    }
    for clause in &search.nots {
        if let Some(hit) = condition(clause, record, target.primary_key)? {
            and.push(!hit);
        }
    }
    let mut or = Vec::new();
    for clause in &search.ors {
        if let Some(hit) = condition(clause, record, target.primary_key)? {
            or.push(hit);
        }
    }
    if and.is_empty() && or.is_empty() {
        return Ok(true);
    }
    let and_hit = !and.is_empty() && and.iter().all(|h| *h);
    Ok(and_hit || or.iter().any(|h| *h))
}

/// `None` when the clause contributes nothing (empty raw SQL, all-zero struct).
fn condition(clause: &Clause, record: &Record, primary_key: &str) -> OrmResult<Option<bool>> {
    let field = |column: &str| record.get(column).unwrap_or(&Value::Null);
    let hit = match &clause.kind {
        ClauseKind::Raw { sql, args } => return raw_condition(sql, args, record, primary_key),
        ClauseKind::Compare { column, op, value } => {
            let actual = field(column);
            match (value.is_null(), op) {
                (true, CmpOp::Ne) => !actual.is_null(),
                (true, _) => actual.is_null(),
                (false, op) => compare(actual, *op, value),
            }
        }
        ClauseKind::In { column, values, negated } => {
            let actual = field(column);
            values.iter().any(|v| loose_eq(actual, v)) != *negated
        }
        ClauseKind::Null { column, negated } => field(column).is_null() == !*negated,
        ClauseKind::Fields(fields) => {
            let entries: Vec<_> = fields.iter().filter(|(_, v)| !is_zero(v)).collect();
            if entries.is_empty() {
                return Ok(None);
            }
            entries.into_iter().all(|(k, v)| entry_matches(field(k), v))
        }
        ClauseKind::Map(map) => {
            if map.is_empty() {
                return Ok(None);
            }
            map.iter().all(|(k, v)| entry_matches(field(k), v))
        }
        ClauseKind::PrimaryKey(keys) => {
            let actual = field(primary_key);
            keys.iter().any(|k| loose_eq(actual, k))
        }
        ClauseKind::Invalid(e) => return Err(e.clone()),
    };
    Ok(Some(hit))
}

fn entry_matches(actual: &Value, expected: &Value) -> bool {
    match expected {
        Value::Null => actual.is_null(),
        Value::Array(items) => items.iter().any(|v| loose_eq(actual, v)),
        v => loose_eq(actual, v),
    }
}

/// Raw conditions the double understands: a bare key, `col OP ?`,
/// `col IN (?)`, `col NOT IN (?)`, `col IS [NOT] NULL`.
fn raw_condition(sql: &str, args: &[Arg], record: &Record, primary_key: &str) -> OrmResult<Option<bool>> {
    let trimmed = sql.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let field = |column: &str| record.get(column).unwrap_or(&Value::Null);
    if args.is_empty() && trimmed.bytes().all(|b| b.is_ascii_digit()) {
        let key = Value::String(trimmed.to_string());
        return Ok(Some(loose_eq(field(primary_key), &key)));
    }
    if let (Some((column, op)), [Arg::Value(value)]) = (split_simple_condition(trimmed), args) {
        return Ok(Some(compare(field(&column), op, value)));
    }

    let words: Vec<&str> = trimmed.split_whitespace().collect();
    let upper: Vec<String> = words.iter().map(|w| w.to_ascii_uppercase()).collect();
    let upper: Vec<&str> = upper.iter().map(String::as_str).collect();
    let hit = match (upper.as_slice(), args) {
        ([_, "IN", "(?)"], [arg]) => in_list(field(column_of(words[0])), arg),
        ([_, "NOT", "IN", "(?)"], [arg]) => !in_list(field(column_of(words[0])), arg),
        ([_, "IS", "NULL"], []) => field(column_of(words[0])).is_null(),
        ([_, "IS", "NOT", "NULL"], []) => !field(column_of(words[0])).is_null(),
        _ => {
            return Err(OrmError::Unsupported(format!(
                "FakeDb cannot evaluate condition {trimmed:?}"
            )));
        }
    };
    Ok(Some(hit))
}

fn column_of(word: &str) -> &str {
    word.rsplit('.').next().unwrap_or(word).trim_matches('"')
}

/// The bare column named by `users.name`, `"users"."name"` or `name`.
pub(crate) fn plain_column(expr: &str) -> Option<&str> {
    let column = column_of(expr.trim());
    let plain = !column.is_empty() && column.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_');
    plain.then_some(column)
}

/// Keep the columns of a plain select list such as `id, name`.
pub(crate) fn project(records: &mut [Record], select: &Clause) -> OrmResult<()> {
    let Some(sql) = select.raw_sql() else {
        return Err(OrmError::InvalidSql("expected a raw SQL fragment".into()));
    };
    let mut columns = Vec::new();
    for term in sql.split(',') {
        let term = term.trim();
        if term == "*" || term.ends_with(".*") {
            return Ok(());
        }
        let column = plain_column(term)
            .ok_or_else(|| OrmError::Unsupported(format!("FakeDb cannot select {term:?}")))?;
        columns.push(column.to_string());
    }
    for record in records {
        record.retain(|k, _| columns.contains(k));
    }
    Ok(())
}

fn in_list(actual: &Value, arg: &Arg) -> bool {
    match arg {
        Arg::List(values) => values.iter().any(|v| loose_eq(actual, v)),
        Arg::Value(v) => loose_eq(actual, v),
    }
}

fn compare(actual: &Value, op: CmpOp, expected: &Value) -> bool {
    if actual.is_null() {
        return false;
    }
    match op {
        CmpOp::Eq => loose_eq(actual, expected),
        CmpOp::Ne => !loose_eq(actual, expected),
        CmpOp::Like => match (actual.as_str(), expected.as_str()) {
            (Some(text), Some(pattern)) => like(text, pattern),
            _ => false,
        },
        CmpOp::Gt => order(actual, expected) == Some(Ordering::Greater),
        CmpOp::Gte => matches!(order(actual, expected), Some(Ordering::Greater | Ordering::Equal)),
        CmpOp::Lt => order(actual, expected) == Some(Ordering::Less),
        CmpOp::Lte => matches!(order(actual, expected), Some(Ordering::Less | Ordering::Equal)),
    }
}

/// Equality that treats `1`, `1.0` and `"1"` alike, as PostgreSQL would
/// after coercing a parameter to the column type.
pub(crate) fn loose_eq(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    match (number(a), number(b)) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

fn number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Ordering used by comparisons and `ORDER BY`; nulls sort last.
pub(crate) fn order(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Null, _) => Some(Ordering::Greater),
        (_, Value::Null) => Some(Ordering::Less),
        (Value::Number(_), _) | (_, Value::Number(_)) => number(a)?.partial_cmp(&number(b)?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// SQL `LIKE` with `%` and `_`.
fn like(text: &str, pattern: &str) -> bool {
    let text: Vec<char> = text.chars().collect();
    let pattern: Vec<char> = pattern.chars().collect();
    let (mut t, mut p) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while t < text.len() {
        match pattern.get(p) {
            Some('%') => {
                star = Some((p, t));
                p += 1;
            }
            Some(&c) if c == '_' || c == text[t] => {
                t += 1;
                p += 1;
            }
            _ => match star {
                Some((sp, st)) => {
                    p = sp + 1;
                    t = st + 1;
                    star = Some((sp, st + 1));
                }
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(|c| *c == '%')
}

/// Sort by raw order fragments such as `age DESC, "users"."name"`.
pub(crate) fn sort(records: &mut [Record], orders: &[Clause]) -> OrmResult<()> {
    let mut keys: Vec<(String, bool)> = Vec::new();
    for clause in orders {
        let Some(sql) = clause.raw_sql() else {
            return Err(OrmError::InvalidSql("expected a raw SQL fragment".into()));
        };
        for term in sql.split(',') {
            let words: Vec<&str> = term.split_whitespace().collect();
            let (column, descending) = match words.as_slice() {
                [column] => (*column, false),
                [column, dir] if dir.eq_ignore_ascii_case("asc") => (*column, false),
                [column, dir] if dir.eq_ignore_ascii_case("desc") => (*column, true),
                _ => {
                    return Err(OrmError::Unsupported(format!(
                        "FakeDb cannot order by {:?}",
                        term.trim()
                    )));
                }
            };
            keys.push((column_of(column).to_string(), descending));
        }
    }
    if keys.is_empty() {
        return Ok(());
    }
    records.sort_by(|a, b| {
        for (column, descending) in &keys {
            let x = a.get(column).unwrap_or(&Value::Null);
            let y = b.get(column).unwrap_or(&Value::Null);
            let ord = order(x, y).unwrap_or(Ordering::Equal);
            let ord = if *descending { ord.reverse() } else { ord };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clause;
    use serde_json::json;

    fn record(v: Value) -> Record {
        match v {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    fn target() -> Target<'static> {
        Target {
            table: "users",
            primary_key: "id",
            soft_delete: true,
            key: None,
        }
    }

    #[test]
    fn combines_where_not_and_or() {
        let row = record(json!({ "id": 1, "name": "jinzhu", "age": 20, "deleted_at": null }));
        let mut search = Search::default();
        search.wheres.push(Clause::eq("name", "jinzhu"));
        search.nots.push(clause!("age > ?", 30));
        assert!(matches(&search, &target(), &row).unwrap());

        search.wheres.push(Clause::eq("age", 21));
        assert!(!matches(&search, &target(), &row).unwrap());
        search.ors.push(Clause::in_list("id", [1, 2]));
        assert!(matches(&search, &target(), &row).unwrap());
    }

    #[test]
    fn soft_deleted_rows_need_unscoped() {
        let row = record(json!({ "id": 1, "deleted_at": "2024-01-01T00:00:00Z" }));
        let mut search = Search::default();
        assert!(!matches(&search, &target(), &row).unwrap());
        search.unscoped = true;
        assert!(matches(&search, &target(), &row).unwrap());
    }

    #[test]
    fn raw_forms_and_unsupported_sql() {
        let row = record(json!({ "id": 3, "name": "jinzhu", "email": null }));
        let hit = |c: Clause| condition(&c, &row, "id").unwrap();
        assert_eq!(hit(clause!("name LIKE ?", "jin%")), Some(true));
        assert_eq!(hit(clause!("users.id IN (?)", vec![1, 3])), Some(true));
        assert_eq!(hit(clause!("email IS NULL")), Some(true));
        assert_eq!(hit(clause!("3")), Some(true));
        assert_eq!(hit(clause!("")), None);
        assert!(matches!(
            condition(&clause!("lower(name) = ?", "x"), &row, "id"),
            Err(OrmError::Unsupported(_))
        ));
    }

    #[test]
    fn sorts_by_order_fragments() {
        let mut rows = vec![
            record(json!({ "id": 1, "age": 30 })),
            record(json!({ "id": 2, "age": null })),
            record(json!({ "id": 3, "age": 18 })),
        ];
        sort(&mut rows, &[Clause::raw(r#""users"."age" DESC"#)]).unwrap();
        let ids: Vec<_> = rows.iter().map(|r| r["id"].clone()).collect();
        assert_eq!(ids, vec![json!(2), json!(1), json!(3)]);
    }

    #[test]
    fn projects_plain_select_lists() {
        let mut rows = vec![record(json!({ "id": 1, "name": "a", "age": 3 }))];
        project(&mut rows, &Clause::raw("users.id, name")).unwrap();
        assert_eq!(rows[0], record(json!({ "id": 1, "name": "a" })));
        assert!(matches!(
            project(&mut rows, &Clause::raw("count(*)")),
            Err(OrmError::Unsupported(_))
        ));
    }

    #[test]
    fn like_wildcards() {
        assert!(like("jinzhu", "jin%"));
        assert!(like("jinzhu", "%zh_"));
        assert!(!like("jinzhu", "zhu%"));
    }
}
