//! SQL identifier handling.
//!
//! Every table and column name the engine writes into SQL goes through [`Ident`]:
//! names are validated on the way in and always rendered double-quoted, so
//! mixed-case model names and reserved words are safe.
//!
//! Unquoted parts must match `[A-Za-z_][A-Za-z0-9_$]*`; quoted parts may hold
//! anything but NUL, with `""` standing for a literal quote.
//!
//! ```ignore
//! use pgseam::ident::quote;
//!
//! assert_eq!(quote("public.users")?, r#""public"."users""#);
//! # Ok::<(), pgseam::OrmError>(())
//! ```

use crate::error::{OrmError, OrmResult};

/// A validated, possibly dotted identifier; parts are stored unquoted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ident(Vec<String>);

impl Ident {
    /// Accepts `users`, `public.users`, `"CamelCase"` and mixes such as
    /// `public."UserTable".id`.
    pub fn parse(s: &str) -> OrmResult<Self> {
        if s.is_empty() {
            return Err(invalid(s, "empty"));
        }
        if s.contains('\0') {
            return Err(invalid(s, "NUL character"));
        }
        let mut parts = Vec::new();
        let mut rest = s;
        loop {
            let (part, tail) = match rest.strip_prefix('"') {
                Some(body) => quoted_segment(s, body)?,
                None => bare_segment(s, rest)?,
            };
            parts.push(part);
            match tail.strip_prefix('.') {
                Some("") => return Err(invalid(s, "trailing '.'")),
                Some(next) => rest = next,
                None if tail.is_empty() => return Ok(Self(parts)),
                None => return Err(invalid(s, &format!("unexpected {tail:?}"))),
            }
        }
    }

    /// The last part (column name of `table.column`).
    pub fn last(&self) -> &str {
        self.0.last().map(String::as_str).unwrap_or_default()
    }

    pub fn is_qualified(&self) -> bool {
        self.0.len() > 1
    }

    /// Render with every part double-quoted.
    pub fn to_sql(&self) -> String {
        let mut out = String::new();
        self.write_sql(&mut out);
        out
    }

    pub(crate) fn write_sql(&self, out: &mut String) {
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                out.push('.');
            }
            push_quoted(out, part);
        }
    }
}

/// `body` starts right after the opening quote; `""` is an escaped quote.
fn quoted_segment<'a>(ident: &str, body: &'a str) -> OrmResult<(String, &'a str)> {
    let mut name = String::new();
    let mut chars = body.char_indices();
    while let Some((i, c)) = chars.next() {
        if c != '"' {
            name.push(c);
        } else if body[i + 1..].starts_with('"') {
            chars.next();
            name.push('"');
        } else if name.is_empty() {
            return Err(invalid(ident, "empty quoted part"));
        } else {
            return Ok((name, &body[i + 1..]));
        }
    }
    Err(invalid(ident, "unclosed quote"))
}

fn bare_segment<'a>(ident: &str, rest: &'a str) -> OrmResult<(String, &'a str)> {
    let (name, tail) = rest.split_at(rest.find('.').unwrap_or(rest.len()));
    let mut chars = name.chars();
    let bad = match chars.next() {
        None => return Err(invalid(ident, "empty segment")),
        Some(first) if first != '_' && !first.is_ascii_alphabetic() => Some(first),
        Some(_) => chars.find(|&c| c != '_' && c != '$' && !c.is_ascii_alphanumeric()),
    };
    match bad {
        Some(c) => Err(invalid(ident, &format!("unexpected character '{c}'"))),
        None => Ok((name.to_string(), tail)),
    }
}

fn invalid(ident: &str, reason: &str) -> OrmError {
    OrmError::InvalidSql(format!("invalid identifier {ident:?}: {reason}"))
}

fn push_quoted(out: &mut String, name: &str) {
    out.push('"');
    for ch in name.chars() {
        if ch == '"' {
            out.push('"');
        }
        out.push(ch);
    }
    out.push('"');
}

/// Validate and quote a (possibly dotted) identifier.
pub fn quote(name: &str) -> OrmResult<String> {
    Ok(Ident::parse(name)?.to_sql())
}

/// Quote a column, qualifying it with `table` unless it is already qualified.
pub fn quote_column(table: &str, column: &str) -> OrmResult<String> {
    let column = Ident::parse(column)?;
    if column.is_qualified() {
        return Ok(column.to_sql());
    }
    let mut out = quote(table)?;
    out.push('.');
    column.write_sql(&mut out);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quotes_simple_and_dotted_names() {
        assert_eq!(quote("users").unwrap(), r#""users""#);
        assert_eq!(quote("public.users").unwrap(), r#""public"."users""#);
    }

    #[test]
    fn keeps_quoted_parts_and_escapes_quotes() {
        assert_eq!(quote(r#""has""quote""#).unwrap(), r#""has""quote""#);
        assert_eq!(
            quote(r#"public."UserTable".id"#).unwrap(),
            r#""public"."UserTable"."id""#
        );
    }

    #[test]
    fn qualifies_bare_columns_only() {
        assert_eq!(
            quote_column("users", "name").unwrap(),
            r#""users"."name""#
        );
        assert_eq!(
            quote_column("users", "profiles.name").unwrap(),
            r#""profiles"."name""#
        );
    }

    #[test]
    fn rejects_malformed_identifiers() {
        for bad in ["", "1table", "my table", "schema..table", "schema.", r#""unclosed"#] {
            assert!(Ident::parse(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn dollar_allowed_after_first_char() {
        assert_eq!(Ident::parse("my_var$1").unwrap().last(), "my_var$1");
    }
}
