//! Model derive macro implementation

use crate::attrs::{field_attrs, struct_attrs};
use heck::ToSnakeCase;
use proc_macro2::TokenStream;
use quote::quote;
use syn::ext::IdentExt;
use syn::{Data, DeriveInput, Fields, Result};

pub fn expand(input: DeriveInput) -> Result<TokenStream> {
    let name = &input.ident;
    let model_name = name.unraw().to_string().to_snake_case();
    let attrs = struct_attrs(&input)?;

    let fields = match &input.data {
        Data::Struct(data) => match &data.fields {
            Fields::Named(fields) => &fields.named,
            _ => {
                return Err(syn::Error::new_spanned(
                    &input,
                    "Model can only be derived for structs with named fields",
                ));
            }
        },
        _ => {
            return Err(syn::Error::new_spanned(
                &input,
                "Model can only be derived for structs",
            ));
        }
    };

    let mut primary_key = attrs.primary_key.clone();
    let mut columns = Vec::new();
    for field in fields {
        let field_attrs = field_attrs(&field.attrs)?;
        if field_attrs.skip {
            continue;
        }
        let ident = field
            .ident
            .as_ref()
            .ok_or_else(|| syn::Error::new_spanned(field, "expected a named field"))?;
        let column = field_attrs
            .rename
            .clone()
            .unwrap_or_else(|| ident.unraw().to_string());

        if field_attrs.is_id {
            match &primary_key {
                Some(pk) if *pk != column => {
                    return Err(syn::Error::new_spanned(
                        field,
                        format!("primary key already set to `{pk}`"),
                    ));
                }
                _ => primary_key = Some(column.clone()),
            }
        }

        let ty = &field.ty;
        let mut def = match &field_attrs.sql_type {
            Some(sql_type) => quote! {
                ::pgseam::Field::new(#column, #sql_type)
                    .nullable(<#ty as ::pgseam::PgType>::nullable())
            },
            None => quote! { ::pgseam::Field::of::<#ty>(#column) },
        };
        for (enabled, method) in [
            (field_attrs.unique, quote!(unique)),
            (field_attrs.index, quote!(index)),
            (field_attrs.unique_index, quote!(unique_index)),
        ] {
            if enabled {
                def = quote! { #def.#method() };
            }
        }
        if let Some(default) = &field_attrs.default {
            def = quote! { #def.default_value(#default) };
        }
        columns.push((column, def));
    }

    let primary_key = primary_key.unwrap_or_else(|| "id".to_string());
    let field_defs = columns.iter().map(|(column, def)| {
        if *column == primary_key {
            quote! { #def.primary_key() }
        } else {
            def.clone()
        }
    });
    let table = match &attrs.table {
        Some(table) => quote! { ::std::option::Option::Some(#table) },
        None => quote! { ::std::option::Option::None },
    };
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    Ok(quote! {
        impl #impl_generics ::pgseam::Model for #name #ty_generics #where_clause {
            const NAME: &'static str = #model_name;
            const TABLE: ::std::option::Option<&'static str> = #table;
            const PRIMARY_KEY: &'static str = #primary_key;

            fn fields() -> ::std::vec::Vec<::pgseam::Field> {
                ::std::vec![#(#field_defs),*]
            }
        }

        impl #impl_generics ::pgseam::Destination for #name #ty_generics #where_clause {
            const SINGLE: bool = true;

            fn schema() -> ::std::option::Option<::pgseam::TableSchema> {
                ::std::option::Option::Some(::pgseam::TableSchema::of::<Self>())
            }

            fn fill(
                &mut self,
                records: ::std::vec::Vec<::pgseam::Record>,
            ) -> ::pgseam::OrmResult<()> {
                ::pgseam::fill_model(self, records)
            }
        }
    })
}
