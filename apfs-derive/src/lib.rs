// Copyright 2023 Gregory Szorc.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Derive macros for APFS on-disk data structures.
//!
//! `#[derive(DiskLayout)]` turns a plain struct declaration into an explicit
//! field table (`name`, `offset`, `width`) plus a decoder and encoder that
//! both walk that table. The struct declaration order is the on-disk order
//! and there is no implicit padding.

use indoc::formatdoc;
use proc_macro2::{Span, TokenStream};
use quote::quote;
use syn::{
    meta::ParseNestedMeta, parse_macro_input, spanned::Spanned, Attribute, Data, DataStruct,
    DeriveInput, Fields, Ident, LitStr, Type,
};

/// Holds parsed `#[apfs]` attributes for a struct.
#[derive(Default, Debug)]
struct StructAttributes {
    /// The type is a bitflags type using the specified identifier as its backing type.
    bitflags: Option<Ident>,
}

impl StructAttributes {
    fn parse(&mut self, meta: ParseNestedMeta) -> Result<(), syn::Error> {
        for (name, ty) in [
            ("bitflags_u8", "u8"),
            ("bitflags_u16", "u16"),
            ("bitflags_u32", "u32"),
            ("bitflags_u64", "u64"),
        ] {
            if meta.path.is_ident(name) {
                self.bitflags = Some(Ident::new(ty, meta.path.span()));
                return Ok(());
            }
        }

        Err(meta.error(format_args!(
            "unknown apfs() attribute: {:?}",
            meta.path.get_ident()
        )))
    }
}

/// A single field of a [DiskLayoutStruct].
struct LayoutField {
    /// How the field is addressed on `self`: an identifier or a tuple index.
    access: TokenStream,
    /// Name recorded in the field table.
    name: String,
    ty: Type,
}

/// Represents a struct deriving `DiskLayout`.
struct DiskLayoutStruct {
    ident: Ident,
    attrs: StructAttributes,
    fields: Vec<LayoutField>,
    tuple: bool,
}

impl DiskLayoutStruct {
    fn new(ident: Ident, strukt: DataStruct, attributes: &[Attribute]) -> syn::Result<Self> {
        let mut attrs = StructAttributes::default();

        for attr in attributes {
            if attr.path().is_ident("apfs") {
                attr.parse_nested_meta(|meta| attrs.parse(meta))?;
            }
        }

        let tuple = matches!(strukt.fields, Fields::Unnamed(_));

        let fields = strukt
            .fields
            .iter()
            .enumerate()
            .map(|(index, field)| match &field.ident {
                Some(ident) => LayoutField {
                    access: quote! { #ident },
                    name: ident.to_string(),
                    ty: field.ty.clone(),
                },
                None => {
                    let index = syn::Index::from(index);
                    LayoutField {
                        access: quote! { #index },
                        name: format!("{}", index.index),
                        ty: field.ty.clone(),
                    }
                }
            })
            .collect::<Vec<_>>();

        if fields.is_empty() && attrs.bitflags.is_none() {
            return Err(syn::Error::new(
                ident.span(),
                "DiskLayout structs must have at least one field",
            ));
        }

        Ok(Self {
            ident,
            attrs,
            fields,
            tuple,
        })
    }

    /// Expression for the byte offset of the field at `index`.
    fn offset_expr(&self, index: usize) -> TokenStream {
        let previous = self.fields[..index].iter().map(|f| {
            let ty = &f.ty;
            quote! { + <#ty as crate::DiskStruct>::SIZE }
        });

        quote! { 0usize #(#previous)* }
    }
}

/// Macro for `#[derive(DiskLayout)]`.
#[proc_macro_derive(DiskLayout, attributes(apfs))]
pub fn derive_disk_layout(input: proc_macro::TokenStream) -> proc_macro::TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let span = input.ident.span();

    let res = match input.data {
        Data::Struct(s) => DiskLayoutStruct::new(input.ident, s, &input.attrs).map(|strukt| {
            if let Some(backing) = &strukt.attrs.bitflags {
                disk_layout_flags(&strukt.ident, backing)
            } else {
                disk_layout_struct(&strukt)
            }
        }),
        Data::Enum(_) => Err(syn::Error::new(
            span,
            "derive(DiskLayout) not supported on enums",
        )),
        Data::Union(_) => Err(syn::Error::new(
            span,
            "derive(DiskLayout) not supported on unions",
        )),
    };

    match res {
        Ok(ts) => ts.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

/// Emit `DiskStruct` and `DiskStructEncode` for a regular struct.
fn disk_layout_struct(strukt: &DiskLayoutStruct) -> TokenStream {
    let ident = &strukt.ident;

    let sizes = strukt.fields.iter().map(|f| {
        let ty = &f.ty;
        quote! { + <#ty as crate::DiskStruct>::SIZE }
    });

    let table = strukt.fields.iter().enumerate().map(|(index, f)| {
        let ty = &f.ty;
        let name = LitStr::new(&f.name, Span::call_site());
        let offset = strukt.offset_expr(index);

        quote! {
            crate::FieldSpec::new(#name, #offset, <#ty as crate::DiskStruct>::SIZE)
        }
    });

    let decoders = strukt
        .fields
        .iter()
        .enumerate()
        .map(|(index, f)| {
            let ty = &f.ty;
            quote! {
                <#ty as crate::DiskStruct>::decode(<Self as crate::DiskStruct>::FIELDS[#index].slice(data)?)?
            }
        })
        .collect::<Vec<_>>();

    let construct = if strukt.tuple {
        quote! { Self(#(#decoders),*) }
    } else {
        let names = strukt.fields.iter().map(|f| &f.access);
        quote! { Self { #(#names: #decoders),* } }
    };

    let encoders = strukt.fields.iter().enumerate().map(|(index, f)| {
        let ty = &f.ty;
        let access = &f.access;
        quote! {
            <#ty as crate::DiskStructEncode>::encode(&self.#access, <Self as crate::DiskStruct>::FIELDS[#index].slice_mut(out)?)?;
        }
    });

    let doc = formatdoc! {"
        On-disk layout of [{ident}].

        Fields are stored back to back in declaration order, little-endian,
        without padding.
        ",
        ident = ident,
    };

    quote! {
        #[doc = #doc]
        impl crate::DiskStruct for #ident {
            const SIZE: usize = 0usize #(#sizes)*;

            const FIELDS: &'static [crate::FieldSpec] = &[
                #(#table),*
            ];

            fn decode(data: &[u8]) -> Result<Self, crate::ParseError> {
                crate::ensure_len(data.len(), <Self as crate::DiskStruct>::SIZE)?;

                Ok(#construct)
            }
        }

        #[cfg(any(test, feature = "encode"))]
        impl crate::DiskStructEncode for #ident {
            fn encode(&self, out: &mut [u8]) -> Result<(), crate::ParseError> {
                crate::ensure_len(out.len(), <Self as crate::DiskStruct>::SIZE)?;

                #(#encoders)*

                Ok(())
            }
        }
    }
}

/// Emit `DiskStruct` and `DiskStructEncode` for a bitflags struct.
fn disk_layout_flags(ident: &Ident, backing: &Ident) -> TokenStream {
    quote! {
        impl crate::DiskStruct for #ident {
            const SIZE: usize = <#backing as crate::DiskStruct>::SIZE;

            const FIELDS: &'static [crate::FieldSpec] = &[
                crate::FieldSpec::new("bits", 0, <#backing as crate::DiskStruct>::SIZE)
            ];

            fn decode(data: &[u8]) -> Result<Self, crate::ParseError> {
                let v = <#backing as crate::DiskStruct>::decode(<Self as crate::DiskStruct>::FIELDS[0].slice(data)?)?;

                Ok(Self::from_bits_retain(v))
            }
        }

        #[cfg(any(test, feature = "encode"))]
        impl crate::DiskStructEncode for #ident {
            fn encode(&self, out: &mut [u8]) -> Result<(), crate::ParseError> {
                <#backing as crate::DiskStructEncode>::encode(&self.bits(), <Self as crate::DiskStruct>::FIELDS[0].slice_mut(out)?)
            }
        }
    }
}
