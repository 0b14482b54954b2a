//! Derives for the wire types of `mt-multiproxy`.
//!
//! `Encode` and `Decode` read `#[encoding(...)]` attributes: on enums the
//! discriminant width and per-variant `id` or `other`, on fields the length
//! prefix of lists and byte blobs.

use proc_macro2::TokenStream;
use syn::DeriveInput;

mod from_variants;
mod protocol;

fn expand(
    input: proc_macro::TokenStream,
    derive: fn(&DeriveInput) -> syn::Result<TokenStream>,
) -> proc_macro::TokenStream {
    let input = syn::parse_macro_input!(input as DeriveInput);
    derive(&input)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

#[proc_macro_derive(Encode, attributes(encoding))]
pub fn derive_encode(input: proc_macro::TokenStream) -> proc_macro::TokenStream {
    expand(input, protocol::derive_encode_on)
}

#[proc_macro_derive(Decode, attributes(encoding))]
pub fn derive_decode(input: proc_macro::TokenStream) -> proc_macro::TokenStream {
    expand(input, protocol::derive_decode_on)
}

/// Conversions between a command enum and its payload types.
#[proc_macro_derive(FromVariants)]
pub fn derive_from_variants(input: proc_macro::TokenStream) -> proc_macro::TokenStream {
    expand(input, from_variants::derive_from_variants_on)
}
