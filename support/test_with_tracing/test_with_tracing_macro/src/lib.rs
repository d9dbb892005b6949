// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The `#[test]` attribute re-exported by `test_with_tracing`.

use proc_macro::TokenStream;
use quote::quote;
use syn::ItemFn;
use syn::parse_macro_input;

/// Marks a function as a test, initializing tracing before the body runs.
#[proc_macro_attribute]
pub fn test(attr: TokenStream, item: TokenStream) -> TokenStream {
    if !attr.is_empty() {
        let attr = proc_macro2::TokenStream::from(attr);
        return syn::Error::new_spanned(attr, "test attribute takes no arguments")
            .to_compile_error()
            .into();
    }
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = parse_macro_input!(item as ItemFn);
    quote! {
        #[::core::prelude::v1::test]
        #(#attrs)*
        #vis #sig {
            ::test_with_tracing::init();
            #block
        }
    }
    .into()
}
