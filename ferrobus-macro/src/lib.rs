/*
 * Copyright (c) 2024. Govcraft
 *
 * Licensed under either of
 *   * Apache License, Version 2.0 (the "License");
 *     you may not use this file except in compliance with the License.
 *     You may obtain a copy of the License at http://www.apache.org/licenses/LICENSE-2.0
 *   * MIT license: http://opensource.org/licenses/MIT
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the applicable License for the specific language governing permissions and
 * limitations under that License.
 */
#![forbid(unsafe_code)]

//! Ferrobus Macro Library
//!
//! Procedural macros for the ferrobus message bus.
//!
//! # Wire Structs
//!
//! [`WireStruct`] maps a struct with named fields onto a wire struct whose
//! members follow the declared field order:
//!
//! ```ignore
//! use ferrobus_macro::WireStruct;
//!
//! #[derive(WireStruct)]
//! pub struct Reading {
//!     pub sensor: String,
//!     pub value: f64,
//!     pub tags: Vec<String>,
//! }
//!
//! // Reading::signature() == "(sdas)"
//! ```

use proc_macro::TokenStream;

use quote::quote;
use syn::{parse_macro_input, Data, DeriveInput, Fields, LitStr, Path};

/// Options parsed from `#[wire(...)]` attributes.
struct WireConfig {
    /// Path of the crate providing the conversion traits.
    krate: Path,
}

impl WireConfig {
    /// Parse configuration from the container attributes.
    fn parse(input: &DeriveInput) -> syn::Result<Self> {
        let mut krate: Path = syn::parse_quote!(::ferrobus_core);
        for attr in input.attrs.iter().filter(|attr| attr.path().is_ident("wire")) {
            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("crate") {
                    let value: LitStr = meta.value()?.parse()?;
                    krate = value.parse()?;
                    Ok(())
                } else {
                    Err(meta.error("unsupported wire option"))
                }
            })?;
        }
        Ok(Self { krate })
    }
}

/// Derive the wire conversion traits for a struct with named fields.
///
/// Generates `WireType`, `IntoValue`, `FromValue` and `FromReply`. Every
/// field type must implement the same traits. The struct is converted to a
/// wire struct `(...)` with one member per field, in declaration order.
///
/// # Options
///
/// `#[wire(crate = "path")]` names the crate that provides the traits when
/// `ferrobus_core` is not a direct dependency:
///
/// ```ignore
/// #[derive(WireStruct)]
/// #[wire(crate = "ferrobus::core")]
/// struct Point {
///     x: i32,
///     y: i32,
/// }
/// ```
#[proc_macro_derive(WireStruct, attributes(wire))]
pub fn wire_struct(item: TokenStream) -> TokenStream {
    let input = parse_macro_input!(item as DeriveInput);
    match expand_wire_struct(&input) {
        Ok(tokens) => TokenStream::from(tokens),
        Err(error) => TokenStream::from(error.to_compile_error()),
    }
}

fn expand_wire_struct(input: &DeriveInput) -> syn::Result<proc_macro2::TokenStream> {
    let config = WireConfig::parse(input)?;
    let krate = &config.krate;

    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let fields = match &input.data {
        Data::Struct(data) => match &data.fields {
            Fields::Named(named) if !named.named.is_empty() => &named.named,
            _ => {
                return Err(syn::Error::new_spanned(
                    name,
                    "WireStruct needs a struct with at least one named field",
                ))
            }
        },
        _ => {
            return Err(syn::Error::new_spanned(
                name,
                "WireStruct can only be derived for structs",
            ))
        }
    };

    let idents: Vec<_> = fields.iter().filter_map(|f| f.ident.as_ref()).collect();
    let types: Vec<_> = fields.iter().map(|f| &f.ty).collect();
    let arity = idents.len();

    let expanded = quote! {
        impl #impl_generics #krate::convert::WireType for #name #ty_generics #where_clause {
            fn wire_type() -> #krate::signature::Type {
                #krate::signature::Type::Struct(vec![
                    #(<#types as #krate::convert::WireType>::wire_type()),*
                ])
            }
        }

        impl #impl_generics #krate::convert::IntoValue for #name #ty_generics #where_clause {
            fn into_value(self) -> #krate::value::Value {
                #krate::value::Value::Struct(vec![
                    #(#krate::convert::IntoValue::into_value(self.#idents)),*
                ])
            }
        }

        impl #impl_generics #krate::convert::FromValue for #name #ty_generics #where_clause {
            fn from_value(
                value: #krate::value::Value,
            ) -> ::core::result::Result<Self, #krate::error::BusError> {
                let mut fields = #krate::convert::struct_fields(
                    value,
                    #arity,
                    &<Self as #krate::convert::WireType>::wire_type(),
                )?;
                ::core::result::Result::Ok(Self {
                    #(#idents: #krate::convert::next_field::<#types>(&mut fields)?),*
                })
            }
        }

        impl #impl_generics #krate::convert::FromReply for #name #ty_generics #where_clause {
            fn from_reply(
                body: ::std::vec::Vec<#krate::value::Value>,
            ) -> ::core::result::Result<Self, #krate::error::BusError> {
                #krate::convert::single_reply(body)
            }
        }
    };

    Ok(expanded)
}
