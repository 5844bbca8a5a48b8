//! # Bamcode Derive Macros
//!
//! This crate provides `#[derive(BamObject)]` for `bamcode`. It implements
//! `BamFields`, `TypedWritable` and `WritableType` for a struct with named
//! fields, writing the fields in declaration order.
//!
//! Compatible with `syn 2.0`.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{Attribute, Data, DeriveInput, Fields, LitInt, LitStr, parse_macro_input};

/// Derives the BAM persistence traits.
///
/// Struct attributes, inside `#[bam(...)]`:
/// * `name = "..."`: the type name written to streams (defaults to the
///   struct's name).
/// * `fully_complete`: wait for pointer targets to complete first.
/// * `fields_only`: skip `TypedWritable`, for types that implement it by
///   hand (for example to add a `finalize` hook).
///
/// Field attributes:
/// * `base`: an embedded base type, written before the remaining fields and
///   registered as a parent type. Bases must come first.
/// * `pointer`: a `Ptr<T>`, `Vec<Ptr<T>>`, `WeakPtr<T>` or
///   `Option<WritableRef>`.
/// * `serde`: stored as a length-prefixed `bincode` blob.
/// * `skip`: not stored; left at its default when read.
/// * `since = N`: only present from minor version `N` on.
#[proc_macro_derive(BamObject, attributes(bam))]
pub fn derive_bam_object(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    match expand(&input) {
        Ok(tokens) => tokens.into(),
        Err(e) => e.to_compile_error().into(),
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum FieldKind {
    Value,
    Base,
    Pointer,
    Serde,
    Skip,
}

struct FieldSpec {
    ident: syn::Ident,
    ty: syn::Type,
    kind: FieldKind,
    since: Option<u16>,
}

struct StructOptions {
    name: Option<String>,
    fully_complete: bool,
    fields_only: bool,
}

fn expand(input: &DeriveInput) -> syn::Result<TokenStream2> {
    let name = &input.ident;
    if !input.generics.params.is_empty() {
        return Err(syn::Error::new_spanned(
            &input.generics,
            "BamObject does not support generic structs",
        ));
    }

    let data_struct = match &input.data {
        Data::Struct(ds) => ds,
        _ => {
            return Err(syn::Error::new(
                name.span(),
                "BamObject only supports structs",
            ));
        }
    };
    let named: Vec<&syn::Field> = match &data_struct.fields {
        Fields::Named(named) => named.named.iter().collect(),
        Fields::Unit => Vec::new(),
        Fields::Unnamed(_) => {
            return Err(syn::Error::new(
                name.span(),
                "BamObject only supports structs with named fields",
            ));
        }
    };

    let options = parse_struct_attributes(&input.attrs)?;
    let mut fields = Vec::new();
    let mut seen_serialized = false;
    for field in named {
        let (kind, since) = parse_field_attributes(&field.attrs)?;
        let Some(ident) = field.ident.clone() else {
            return Err(syn::Error::new_spanned(field, "expected a named field"));
        };
        if kind == FieldKind::Base && seen_serialized {
            return Err(syn::Error::new_spanned(
                field,
                "`base` fields must come before other serialized fields",
            ));
        }
        if !matches!(kind, FieldKind::Base | FieldKind::Skip) {
            seen_serialized = true;
        }
        fields.push(FieldSpec {
            ident,
            ty: field.ty.clone(),
            kind,
            since,
        });
    }

    let type_name = options.name.clone().unwrap_or_else(|| name.to_string());
    let impl_fields = generate_fields(name, &fields);
    let impl_writable = if options.fields_only {
        quote! {}
    } else {
        generate_writable(name, &type_name, options.fully_complete)
    };
    let impl_type = generate_type(name, &type_name, &fields);

    Ok(quote! {
        #impl_fields
        #impl_writable
        #impl_type
    })
}

fn parse_struct_attributes(attrs: &[Attribute]) -> syn::Result<StructOptions> {
    let mut options = StructOptions {
        name: None,
        fully_complete: false,
        fields_only: false,
    };
    for attr in attrs {
        if attr.path().is_ident("bam") {
            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("name") {
                    let s: LitStr = meta.value()?.parse()?;
                    if s.value().is_empty() {
                        return Err(meta.error("type name must not be empty"));
                    }
                    options.name = Some(s.value());
                    return Ok(());
                }
                if meta.path.is_ident("fully_complete") {
                    options.fully_complete = true;
                    return Ok(());
                }
                if meta.path.is_ident("fields_only") {
                    options.fields_only = true;
                    return Ok(());
                }
                Err(meta.error(
                    "Unknown bam struct attribute. Supported: name, fully_complete, fields_only",
                ))
            })?;
        }
    }
    Ok(options)
}

fn parse_field_attributes(attrs: &[Attribute]) -> syn::Result<(FieldKind, Option<u16>)> {
    let mut kind = FieldKind::Value;
    let mut since = None;
    for attr in attrs {
        if attr.path().is_ident("bam") {
            attr.parse_nested_meta(|meta| {
                let chosen = if meta.path.is_ident("base") {
                    FieldKind::Base
                } else if meta.path.is_ident("pointer") {
                    FieldKind::Pointer
                } else if meta.path.is_ident("serde") {
                    FieldKind::Serde
                } else if meta.path.is_ident("skip") {
                    FieldKind::Skip
                } else if meta.path.is_ident("since") {
                    let lit: LitInt = meta.value()?.parse()?;
                    since = Some(lit.base10_parse::<u16>()?);
                    return Ok(());
                } else {
                    return Err(meta.error(
                        "Unknown bam field attribute. Supported: base, pointer, serde, skip, since",
                    ));
                };
                if kind != FieldKind::Value {
                    return Err(meta.error("a field takes at most one of base, pointer, serde, skip"));
                }
                kind = chosen;
                Ok(())
            })?;
        }
    }
    if since.is_some() && matches!(kind, FieldKind::Base | FieldKind::Skip) {
        return Err(syn::Error::new(
            proc_macro2::Span::call_site(),
            "`since` cannot be combined with `base` or `skip`",
        ));
    }
    Ok((kind, since))
}

// --- Generator: BamFields ---

fn gate(since: Option<u16>, version: TokenStream2, body: TokenStream2) -> TokenStream2 {
    match since {
        Some(minor) => quote! {
            if #version >= #minor {
                #body
            }
        },
        None => body,
    }
}

fn generate_fields(name: &syn::Ident, fields: &[FieldSpec]) -> TokenStream2 {
    let writes = fields.iter().map(|f| {
        let ident = &f.ident;
        let body = match f.kind {
            FieldKind::Value => quote! { bamcode::BamValue::write_value(&self.#ident, dg)?; },
            FieldKind::Base => {
                quote! { bamcode::BamFields::write_fields(&self.#ident, writer, dg)?; }
            }
            FieldKind::Pointer => {
                quote! { bamcode::PointerField::write_pointers(&self.#ident, writer, dg)?; }
            }
            FieldKind::Serde => quote! { dg.add_serde(&self.#ident)?; },
            FieldKind::Skip => return quote! {},
        };
        gate(f.since, quote! { writer.file_minor_ver() }, body)
    });

    let reads = fields.iter().map(|f| {
        let ident = &f.ident;
        let ty = &f.ty;
        let body = match f.kind {
            FieldKind::Value => {
                quote! { self.#ident = <#ty as bamcode::BamValue>::read_value(scan)?; }
            }
            FieldKind::Base => {
                quote! { bamcode::BamFields::fillin_fields(&mut self.#ident, scan, reader)?; }
            }
            FieldKind::Pointer => {
                quote! { bamcode::PointerField::read_pointers(&mut self.#ident, scan, reader)?; }
            }
            FieldKind::Serde => quote! { self.#ident = scan.get_serde()?; },
            FieldKind::Skip => return quote! {},
        };
        gate(f.since, quote! { reader.file_minor_ver() }, body)
    });

    let completes = fields.iter().map(|f| {
        let ident = &f.ident;
        let body = match f.kind {
            FieldKind::Base => {
                quote! { bamcode::BamFields::complete_fields(&mut self.#ident, cursor, reader)?; }
            }
            FieldKind::Pointer => {
                quote! { bamcode::PointerField::complete_pointers(&mut self.#ident, cursor)?; }
            }
            _ => return quote! {},
        };
        gate(f.since, quote! { reader.file_minor_ver() }, body)
    });

    quote! {
        impl bamcode::BamFields for #name {
            fn write_fields(
                &self,
                writer: &mut bamcode::BamWriter<'_>,
                dg: &mut bamcode::Datagram,
            ) -> bamcode::Result<()> {
                let _ = (&writer, &dg);
                #(#writes)*
                Ok(())
            }

            fn fillin_fields(
                &mut self,
                scan: &mut bamcode::DatagramIterator<'_>,
                reader: &mut bamcode::BamReader,
            ) -> bamcode::Result<()> {
                let _ = (&scan, &reader);
                #(#reads)*
                Ok(())
            }

            fn complete_fields(
                &mut self,
                cursor: &mut bamcode::PointerCursor<'_>,
                reader: &mut bamcode::BamReader,
            ) -> bamcode::Result<()> {
                let _ = (&cursor, &reader);
                #(#completes)*
                Ok(())
            }
        }
    }
}

// --- Generator: TypedWritable ---

fn generate_writable(name: &syn::Ident, type_name: &str, fully_complete: bool) -> TokenStream2 {
    quote! {
        impl bamcode::TypedWritable for #name {
            fn type_name(&self) -> &'static str {
                #type_name
            }

            fn write_datagram(
                &self,
                writer: &mut bamcode::BamWriter<'_>,
                dg: &mut bamcode::Datagram,
            ) -> bamcode::Result<()> {
                bamcode::BamFields::write_fields(self, writer, dg)
            }

            fn fillin(
                &mut self,
                scan: &mut bamcode::DatagramIterator<'_>,
                reader: &mut bamcode::BamReader,
            ) -> bamcode::Result<()> {
                bamcode::BamFields::fillin_fields(self, scan, reader)
            }

            fn complete_pointers(
                &mut self,
                pointers: &[Option<bamcode::WritableRef>],
                reader: &mut bamcode::BamReader,
            ) -> bamcode::Result<usize> {
                bamcode::rt::complete_fields(self, pointers, reader)
            }

            fn require_fully_complete(&self) -> bool {
                #fully_complete
            }
        }
    }
}

// --- Generator: WritableType ---

fn generate_type(name: &syn::Ident, type_name: &str, fields: &[FieldSpec]) -> TokenStream2 {
    let bases = fields
        .iter()
        .filter(|f| f.kind == FieldKind::Base)
        .map(|f| {
            let ty = &f.ty;
            quote! { <#ty as bamcode::WritableType>::init_type(types) }
        });

    quote! {
        impl bamcode::WritableType for #name {
            const TYPE_NAME: &'static str = #type_name;

            fn init_type(types: &mut bamcode::TypeRegistry) -> bamcode::TypeHandle {
                let bases: &[bamcode::TypeHandle] = &[#(#bases),*];
                bamcode::rt::register_derived(types, #type_name, bases)
            }
        }
    }
}
