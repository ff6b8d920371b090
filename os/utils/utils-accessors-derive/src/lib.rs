//! # Accessor Derive
//!
//! `#[derive(Accessors)]` generates builder-style setters and, on request,
//! by-value getters for the named fields of plain-data structs such as the
//! process image descriptor and the network interface configuration.

use proc_macro::TokenStream;
use quote::{format_ident, quote};
use syn::{Attribute, Data, DeriveInput, Fields, LitBool, parse_macro_input, spanned::Spanned};

/// Derive accessors for each **named** field:
///
/// - `.set_<field>(&mut self, value: Ty) -> &mut Self`
/// - `const .with_<field>(mut self, value: Ty) -> Self`
/// - `const .<field>(&self) -> Ty` when the field (or the whole struct) is
///   marked `#[accessors(get)]`; the field type must be `Copy`.
///
/// A field marked `#[accessors(skip)]` (or `skip = true`) gets nothing.
///
/// # Example
///
/// ```
/// use utils_accessors_derive::Accessors;
///
/// #[derive(Default, Accessors)]
/// #[accessors(get)]
/// struct Image {
///     entry: u32,
///     size: u32,
///     #[accessors(skip)]
///     cookie: u8,
/// }
///
/// let mut img = Image::default().with_entry(0x40_0000);
/// img.set_size(0x2000).set_size(0x3000);
/// assert_eq!(img.entry(), 0x40_0000);
/// assert_eq!(img.size(), 0x3000);
/// assert_eq!(img.cookie, 0);
/// ```
#[proc_macro_derive(Accessors, attributes(accessors))]
pub fn derive_accessors(input: TokenStream) -> TokenStream {
    let DeriveInput {
        ident,
        generics,
        data,
        attrs,
        ..
    } = parse_macro_input!(input as DeriveInput);

    let fields = match data {
        Data::Struct(s) => match s.fields {
            Fields::Named(n) => n.named,
            Fields::Unnamed(u) => {
                return syn::Error::new(u.span(), "Accessors only supports named fields")
                    .to_compile_error()
                    .into();
            }
            Fields::Unit => {
                return syn::Error::new(ident.span(), "Accessors does not apply to unit structs")
                    .to_compile_error()
                    .into();
            }
        },
        _ => {
            return syn::Error::new(ident.span(), "Accessors can only be derived for structs")
                .to_compile_error()
                .into();
        }
    };

    let struct_opts = match Options::parse(&attrs) {
        Ok(o) => o,
        Err(e) => return e.to_compile_error().into(),
    };

    let (impl_generics, ty_generics, where_clause) = generics.split_for_impl();

    let mut methods = Vec::new();

    for field in fields {
        let Some(fname) = &field.ident else { continue };
        let opts = match Options::parse(&field.attrs) {
            Ok(o) => o,
            Err(e) => return e.to_compile_error().into(),
        };
        if opts.skip {
            continue;
        }

        let ty = &field.ty;
        let set_name = format_ident!("set_{}", fname);
        let with_name = format_ident!("with_{}", fname);

        methods.push(quote! {
            #[inline]
            pub fn #set_name(&mut self, value: #ty) -> &mut Self {
                self.#fname = value;
                self
            }

            #[inline]
            #[must_use]
            pub const fn #with_name(mut self, value: #ty) -> Self {
                self.#fname = value;
                self
            }
        });

        if opts.get || struct_opts.get {
            methods.push(quote! {
                #[inline]
                #[must_use]
                pub const fn #fname(&self) -> #ty {
                    self.#fname
                }
            });
        }
    }

    let expanded = quote! {
        impl #impl_generics #ident #ty_generics #where_clause {
            #(#methods)*
        }
    };

    TokenStream::from(expanded)
}

#[derive(Default)]
struct Options {
    skip: bool,
    get: bool,
}

impl Options {
    /// Collect `#[accessors(skip)]`, `#[accessors(skip = true)]` and `#[accessors(get)]`.
    fn parse(attrs: &[Attribute]) -> syn::Result<Self> {
        let mut opts = Self::default();
        for attr in attrs {
            if !attr.path().is_ident("accessors") {
                continue;
            }

            attr.parse_nested_meta(|meta| {
                let flag = if meta.input.is_empty() {
                    true
                } else {
                    meta.value()?.parse::<LitBool>()?.value
                };

                if meta.path.is_ident("skip") {
                    opts.skip = flag;
                    Ok(())
                } else if meta.path.is_ident("get") {
                    opts.get = flag;
                    Ok(())
                } else {
                    Err(meta.error("expected `skip` or `get`"))
                }
            })?;
        }
        Ok(opts)
    }
}
