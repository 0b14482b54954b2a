//! Code generation for `Encode` and `Decode`.
//!
//! Integers are big-endian. A struct or variant is its fields in declaration
//! order. Enums start with a u8 or u16 tag; the `other` variant takes every
//! tag without an `id` and writes its own.

use darling::{FromDeriveInput, FromField, FromMeta, FromVariant};
use proc_macro2::TokenStream;
use quote::{format_ident, quote};
use syn::{Data, DeriveInput, Fields, Ident};

/// Width of a length prefix, or the end of the message.
#[derive(Debug, Clone, Copy, FromMeta)]
enum Extent {
    #[darling(rename = "u16")]
    U16,
    #[darling(rename = "u32")]
    U32,
    #[darling(rename = "rest")]
    Rest,
    #[darling(rename = "inferred")]
    Inferred,
}

impl Extent {
    fn is_open(self) -> bool {
        matches!(self, Self::Rest | Self::Inferred)
    }
}

#[derive(Debug, Default, FromField)]
#[darling(attributes(encoding), default)]
struct FieldAttrs {
    /// Element count prefix of a list.
    length_prefix: Option<Extent>,
    /// Byte count prefix of a blob.
    bytes: Option<Extent>,
}

#[derive(Debug, Clone, Copy, FromMeta)]
enum Tag {
    #[darling(rename = "u8")]
    U8,
    #[darling(rename = "u16")]
    U16,
}

#[derive(Debug, FromDeriveInput)]
#[darling(attributes(encoding))]
struct EnumAttrs {
    discriminant: Tag,
}

#[derive(Debug, FromVariant)]
#[darling(attributes(encoding))]
struct VariantAttrs {
    #[darling(default)]
    id: Option<i64>,
    #[darling(default)]
    other: bool,
}

/// How one field is laid out on the wire.
#[derive(Debug, Clone, Copy)]
enum Layout {
    Value,
    Blob(Extent),
    List(Extent),
}

impl Layout {
    fn of(field: &syn::Field) -> syn::Result<Self> {
        let attrs = FieldAttrs::from_field(field)?;
        match (attrs.length_prefix, attrs.bytes) {
            (None, None) => Ok(Self::Value),
            (None, Some(extent)) => Ok(Self::Blob(extent)),
            (Some(extent), None) => Ok(Self::List(extent)),
            (Some(_), Some(_)) => Err(syn::Error::new_spanned(
                field,
                "`length_prefix` and `bytes` are mutually exclusive",
            )),
        }
    }

    /// Statements writing `value`, a reference to the field.
    fn encode(self, value: &Ident) -> TokenStream {
        match self {
            Self::Value => quote! {
                crate::protocol::Encode::encode(#value, encoder);
            },
            Self::Blob(Extent::U16) => quote! { encoder.write_bytes16(#value); },
            Self::Blob(Extent::U32) => quote! { encoder.write_bytes32(#value); },
            Self::Blob(_) => quote! { encoder.write_slice(#value); },
            Self::List(extent) => {
                let (prefix, take) = match extent {
                    Extent::U16 => (
                        quote! {
                            let count = u16::try_from(#value.len()).unwrap_or(u16::MAX);
                            encoder.write_u16(count);
                        },
                        quote! { usize::from(count) },
                    ),
                    Extent::U32 => (
                        quote! {
                            let count = u32::try_from(#value.len()).unwrap_or(u32::MAX);
                            encoder.write_u32(count);
                        },
                        quote! { count as usize },
                    ),
                    _ => (quote! {}, quote! { usize::MAX }),
                };
                quote! {
                    {
                        #prefix
                        for item in #value.iter().take(#take) {
                            crate::protocol::Encode::encode(item, encoder);
                        }
                    }
                }
            }
        }
    }

    /// Expression reading the field.
    fn decode(self) -> TokenStream {
        match self {
            Self::Value => quote! { crate::protocol::Decode::decode(decoder)? },
            Self::Blob(Extent::U16) => quote! { decoder.read_bytes16()?.to_vec().into() },
            Self::Blob(Extent::U32) => quote! { decoder.read_bytes32()?.to_vec().into() },
            Self::Blob(_) => quote! { decoder.consume_rest().to_vec().into() },
            Self::List(extent) if extent.is_open() => quote! {
                {
                    let mut items = Vec::new();
                    while !decoder.is_finished() {
                        items.push(crate::protocol::Decode::decode(decoder)?);
                    }
                    items
                }
            },
            Self::List(extent) => {
                let count = match extent {
                    Extent::U16 => quote! { usize::from(decoder.read_u16()?) },
                    _ => quote! { decoder.read_u32()? as usize },
                };
                quote! {
                    {
                        let count = #count;
                        let mut items = Vec::with_capacity(count.min(1024));
                        for _ in 0..count {
                            items.push(crate::protocol::Decode::decode(decoder)?);
                        }
                        items
                    }
                }
            }
        }
    }
}

struct Member {
    binding: Ident,
    layout: Layout,
}

/// The fields of a struct or of one enum variant.
struct Shape {
    fields: Fields,
    members: Vec<Member>,
}

impl Shape {
    fn new(fields: &Fields) -> syn::Result<Self> {
        let members = fields
            .iter()
            .enumerate()
            .map(|(i, field)| {
                Ok(Member {
                    binding: field
                        .ident
                        .clone()
                        .unwrap_or_else(|| format_ident!("__field{}", i)),
                    layout: Layout::of(field)?,
                })
            })
            .collect::<syn::Result<_>>()?;
        Ok(Self {
            fields: fields.clone(),
            members,
        })
    }

    /// `path {a, b}`, `path(__field0)` or `path`. Serves both as a pattern
    /// binding every field and as a constructor from those bindings.
    fn bind(&self, path: TokenStream) -> TokenStream {
        let bindings = self.members.iter().map(|m| &m.binding);
        match &self.fields {
            Fields::Named(_) => quote! { #path { #(#bindings),* } },
            Fields::Unnamed(_) => quote! { #path ( #(#bindings),* ) },
            Fields::Unit => path,
        }
    }

    fn encode(&self) -> TokenStream {
        let writes = self.members.iter().map(|m| m.layout.encode(&m.binding));
        quote! { #(#writes)* }
    }

    fn decode(&self, path: TokenStream) -> TokenStream {
        let reads = self.members.iter().map(|Member { binding, layout }| {
            let read = layout.decode();
            quote! { let #binding = #read; }
        });
        let construct = self.bind(path);
        quote! {
            #(#reads)*
            Ok(#construct)
        }
    }
}

enum Kind {
    Tagged(i64),
    Other,
}

struct Variant {
    ident: Ident,
    kind: Kind,
    shape: Shape,
}

enum Input {
    Struct(Shape),
    Enum { tag: Tag, variants: Vec<Variant> },
}

impl Input {
    fn parse(input: &DeriveInput) -> syn::Result<Self> {
        match &input.data {
            Data::Struct(data) => Shape::new(&data.fields).map(Self::Struct),
            Data::Enum(data) => {
                let tag = EnumAttrs::from_derive_input(input)?.discriminant;
                let variants = data
                    .variants
                    .iter()
                    .map(|variant| {
                        let attrs = VariantAttrs::from_variant(variant)?;
                        let shape = Shape::new(&variant.fields)?;
                        let kind = match (attrs.id, attrs.other) {
                            (Some(id), false) => Kind::Tagged(id),
                            (None, true) => {
                                if !matches!(variant.fields, Fields::Unnamed(_))
                                    || shape.members.len() != 1
                                {
                                    return Err(syn::Error::new_spanned(
                                        &variant.ident,
                                        "the `other` variant must wrap exactly one unnamed field",
                                    ));
                                }
                                Kind::Other
                            }
                            _ => {
                                return Err(syn::Error::new_spanned(
                                    &variant.ident,
                                    "variant needs exactly one of `id` or `other`",
                                ))
                            }
                        };
                        Ok(Variant {
                            ident: variant.ident.clone(),
                            kind,
                            shape,
                        })
                    })
                    .collect::<syn::Result<_>>()?;
                Ok(Self::Enum { tag, variants })
            }
            Data::Union(data) => Err(syn::Error::new_spanned(
                data.union_token,
                "unions have no wire format",
            )),
        }
    }
}

fn write_tag(tag: Tag, id: i64, variant: &Ident) -> syn::Result<TokenStream> {
    let overflow = || syn::Error::new_spanned(variant, "id does not fit the discriminant");
    Ok(match tag {
        Tag::U8 => {
            let id = u8::try_from(id).map_err(|_| overflow())?;
            quote! { encoder.write_u8(#id); }
        }
        Tag::U16 => {
            let id = u16::try_from(id).map_err(|_| overflow())?;
            quote! { encoder.write_u16(#id); }
        }
    })
}

pub fn derive_encode_on(input: &DeriveInput) -> syn::Result<TokenStream> {
    let body = match Input::parse(input)? {
        Input::Struct(shape) => {
            if shape.members.is_empty() {
                quote! {}
            } else {
                let pattern = shape.bind(quote! { Self });
                let writes = shape.encode();
                quote! {
                    let #pattern = self;
                    #writes
                }
            }
        }
        Input::Enum { tag, variants } => {
            let arms = variants
                .iter()
                .map(|variant| {
                    let ident = &variant.ident;
                    let pattern = variant.shape.bind(quote! { Self::#ident });
                    let tag = match variant.kind {
                        Kind::Tagged(id) => write_tag(tag, id, ident)?,
                        Kind::Other => quote! {},
                    };
                    let writes = variant.shape.encode();
                    Ok(quote! {
                        #pattern => {
                            #tag
                            #writes
                        }
                    })
                })
                .collect::<syn::Result<Vec<_>>>()?;
            quote! {
                match self {
                    #(#arms)*
                }
            }
        }
    };

    let ident = &input.ident;
    Ok(quote! {
        impl crate::protocol::Encode for #ident {
            #[allow(unused_variables)]
            fn encode(&self, encoder: &mut crate::protocol::Encoder) {
                #body
            }
        }
    })
}

pub fn derive_decode_on(input: &DeriveInput) -> syn::Result<TokenStream> {
    let body = match Input::parse(input)? {
        Input::Struct(shape) => shape.decode(quote! { Self }),
        Input::Enum { tag, variants } => {
            let read_tag = match tag {
                Tag::U8 => quote! { decoder.read_u8()? },
                Tag::U16 => quote! { decoder.read_u16()? },
            };
            let mut fallback = quote! {
                _ => Err(crate::protocol::DecodeError::InvalidDiscriminant(discriminant)),
            };
            let mut arms = Vec::new();
            for variant in &variants {
                let ident = &variant.ident;
                match variant.kind {
                    Kind::Tagged(id) => {
                        let decode = variant.shape.decode(quote! { Self::#ident });
                        arms.push(quote! { #id => { #decode } });
                    }
                    Kind::Other => {
                        fallback = quote! {
                            _ => Ok(Self::#ident(crate::protocol::Unknown::from_unknown(
                                discriminant,
                                decoder,
                            )?)),
                        };
                    }
                }
            }
            quote! {
                let discriminant = i64::from(#read_tag);
                match discriminant {
                    #(#arms)*
                    #fallback
                }
            }
        }
    };

    let ident = &input.ident;
    Ok(quote! {
        impl crate::protocol::Decode for #ident {
            #[allow(unused_variables)]
            fn decode(
                decoder: &mut crate::protocol::Decoder,
            ) -> ::std::result::Result<Self, crate::protocol::DecodeError> {
                #body
            }
        }
    })
}
