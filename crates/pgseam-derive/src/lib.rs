//! Derive macros for pgseam
//!
//! Provides `#[derive(Model)]`.

use proc_macro::TokenStream;
use syn::{DeriveInput, parse_macro_input};

mod attrs;
mod model;

/// Derive `Model` and `Destination` for a struct with named fields.
///
/// # Example
///
/// ```ignore
/// use pgseam::Model;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Default, Serialize, Deserialize, Model)]
/// #[orm(table = "accounts")]
/// struct User {
///     #[orm(id)]
///     user_id: i64,
///     #[orm(unique_index)]
///     email: String,
///     #[orm(type = "varchar(64)", default = "'anonymous'")]
///     name: String,
///     #[serde(rename = "birth")]
///     birthday: Option<chrono::NaiveDate>,
/// }
/// ```
///
/// # Attributes
///
/// Struct:
/// - `#[orm(table = "name")]` - explicit table name (default: plural of the snake-case type name)
/// - `#[orm(primary_key = "column")]` - primary key column (default: `id`)
///
/// Field:
/// - `#[orm(id)]` - mark the field as primary key
/// - `#[orm(skip)]` - not a column
/// - `#[orm(type = "sql type")]` - column type for `create_table`/`auto_migrate`
/// - `#[orm(unique)]`, `#[orm(index)]`, `#[orm(unique_index)]`
/// - `#[orm(default = "sql expression")]`
///
/// Column names follow `#[serde(rename = "...")]`; `#[serde(skip)]` fields are
/// not columns.
#[proc_macro_derive(Model, attributes(orm))]
pub fn derive_model(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    model::expand(input)
        .unwrap_or_else(|e| e.to_compile_error())
        .into()
}
