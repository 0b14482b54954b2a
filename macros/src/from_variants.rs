use proc_macro2::TokenStream;
use quote::quote;
use syn::{Data, DeriveInput, Fields};

/// For every single-field tuple variant `Cmd::V(T)`, emits `From<T> for Cmd`
/// and `TryFrom<Cmd> for T`. The failed conversion hands the command back.
pub fn derive_from_variants_on(input: &DeriveInput) -> syn::Result<TokenStream> {
    let Data::Enum(data) = &input.data else {
        return Err(syn::Error::new_spanned(
            &input.ident,
            "FromVariants can only be derived for enums",
        ));
    };
    let cmd = &input.ident;

    let impls = data.variants.iter().filter_map(|variant| {
        let Fields::Unnamed(fields) = &variant.fields else {
            return None;
        };
        let [field] = fields.unnamed.iter().collect::<Vec<_>>()[..] else {
            return None;
        };
        let ty = &field.ty;
        let ident = &variant.ident;
        Some(quote! {
            impl ::core::convert::From<#ty> for #cmd {
                fn from(value: #ty) -> Self {
                    Self::#ident(value)
                }
            }

            impl ::core::convert::TryFrom<#cmd> for #ty {
                type Error = #cmd;

                fn try_from(cmd: #cmd) -> ::core::result::Result<Self, #cmd> {
                    match cmd {
                        #cmd::#ident(value) => ::core::result::Result::Ok(value),
                        other => ::core::result::Result::Err(other),
                    }
                }
            }
        })
    });

    Ok(quote! {
        #(#impls)*
    })
}
