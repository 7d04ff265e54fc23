extern crate proc_macro;

use parallax_macro_utils::ParallaxManifest;
use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, DeriveInput, LitInt, LitStr};

struct LayerAttr {
    kind: Option<LitStr>,
    inputs: usize,
    outputs: usize,
    params: syn::Type,
}

fn parse_layer_attr(ast: &DeriveInput) -> syn::Result<LayerAttr> {
    let mut attr = LayerAttr {
        kind: None,
        inputs: 1,
        outputs: 1,
        params: syn::parse_quote!(()),
    };

    for a in ast.attrs.iter().filter(|a| a.path().is_ident("layer")) {
        a.parse_nested_meta(|meta| {
            if meta.path.is_ident("kind") {
                attr.kind = Some(meta.value()?.parse::<LitStr>()?);
            } else if meta.path.is_ident("inputs") {
                attr.inputs = meta.value()?.parse::<LitInt>()?.base10_parse()?;
            } else if meta.path.is_ident("outputs") {
                attr.outputs = meta.value()?.parse::<LitInt>()?.base10_parse()?;
            } else if meta.path.is_ident("params") {
                attr.params = meta.value()?.parse::<syn::Type>()?;
            } else {
                return Err(meta.error("expected `kind`, `inputs`, `outputs` or `params`"));
            }
            Ok(())
        })?;
    }

    if attr.kind.is_none() {
        return Err(syn::Error::new_spanned(
            &ast.ident,
            "missing #[layer(kind = \"...\")] attribute",
        ));
    }

    Ok(attr)
}

/// Implements `LayerKind` by forwarding `from_params` to the type's inherent
/// `new(params) -> Result<Self>`.
///
/// ```ignore
/// #[derive(LayerKind, Clone)]
/// #[layer(kind = "add", inputs = 2, outputs = 1)]
/// pub struct Add;
/// ```
#[proc_macro_derive(LayerKind, attributes(layer))]
pub fn derive_layer_kind(input: TokenStream) -> TokenStream {
    let ast = parse_macro_input!(input as DeriveInput);
    let name = &ast.ident;
    let (impl_generics, ty_generics, where_clause) = ast.generics.split_for_impl();
    let manifest = ParallaxManifest::default();
    let parallax_core_path = manifest.get_path("parallax_core");
    let parallax_graph_path = manifest.get_path("parallax_graph");

    let attr = match parse_layer_attr(&ast) {
        Ok(attr) => attr,
        Err(e) => return e.to_compile_error().into(),
    };
    let kind = attr.kind;
    let inputs = attr.inputs;
    let outputs = attr.outputs;
    let params = attr.params;

    let expanded = quote! {
        impl #impl_generics #parallax_graph_path::layer::LayerKind for #name #ty_generics #where_clause {
            const KIND: &'static str = #kind;
            const INPUTS: usize = #inputs;
            const OUTPUTS: usize = #outputs;
            type Params = #params;

            fn from_params(params: Self::Params) -> #parallax_core_path::error::Result<Self> {
                Self::new(params)
            }
        }
    };
    TokenStream::from(expanded)
}
