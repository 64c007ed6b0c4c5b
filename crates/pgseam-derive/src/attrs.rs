//! `#[orm(...)]` and `#[serde(...)]` attribute parsing.

use syn::{Attribute, DeriveInput, LitStr, Result};

#[derive(Default)]
pub(crate) struct StructAttrs {
    pub table: Option<String>,
    pub primary_key: Option<String>,
}

#[derive(Default)]
pub(crate) struct FieldAttrs {
    pub is_id: bool,
    pub skip: bool,
    pub sql_type: Option<String>,
    pub unique: bool,
    pub index: bool,
    pub unique_index: bool,
    pub default: Option<String>,
    /// `#[serde(rename = "...")]`
    pub rename: Option<String>,
}

pub(crate) fn struct_attrs(input: &DeriveInput) -> Result<StructAttrs> {
    let mut out = StructAttrs::default();
    for attr in input.attrs.iter().filter(|a| a.path().is_ident("orm")) {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("table") {
                out.table = Some(meta.value()?.parse::<LitStr>()?.value());
            } else if meta.path.is_ident("primary_key") {
                out.primary_key = Some(meta.value()?.parse::<LitStr>()?.value());
            } else {
                return Err(meta.error("unknown struct attribute; expected `table` or `primary_key`"));
            }
            Ok(())
        })?;
    }
    Ok(out)
}

pub(crate) fn field_attrs(attrs: &[Attribute]) -> Result<FieldAttrs> {
    let mut out = FieldAttrs::default();
    for attr in attrs {
        if attr.path().is_ident("orm") {
            attr.parse_nested_meta(|meta| {
                let path = &meta.path;
                if path.is_ident("id") {
                    out.is_id = true;
                } else if path.is_ident("skip") {
                    out.skip = true;
                } else if path.is_ident("unique") {
                    out.unique = true;
                } else if path.is_ident("index") {
                    out.index = true;
                } else if path.is_ident("unique_index") {
                    out.unique_index = true;
                } else if path.is_ident("type") {
                    out.sql_type = Some(meta.value()?.parse::<LitStr>()?.value());
                } else if path.is_ident("default") {
                    out.default = Some(meta.value()?.parse::<LitStr>()?.value());
                } else {
                    return Err(meta.error("unknown field attribute"));
                }
                Ok(())
            })?;
        } else if attr.path().is_ident("serde") {
            serde_field(attr, &mut out)?;
        }
    }
    Ok(out)
}

// Only `rename` and `skip` matter here; other serde options are skipped over.
fn serde_field(attr: &Attribute, out: &mut FieldAttrs) -> Result<()> {
    attr.parse_nested_meta(|meta| {
        if meta.input.peek(syn::Token![=]) {
            let value = meta.value()?;
            if meta.path.is_ident("rename") {
                out.rename = Some(value.parse::<LitStr>()?.value());
            } else {
                let _: syn::Expr = value.parse()?;
            }
        } else if meta.input.peek(syn::token::Paren) {
            let _content;
            syn::parenthesized!(_content in meta.input);
        } else if meta.path.is_ident("skip") {
            out.skip = true;
        }
        Ok(())
    })
}
