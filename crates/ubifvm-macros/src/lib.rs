use proc_macro::TokenStream;
use quote::quote;
use syn::{
    parse::Parser, parse_macro_input, parse_quote, punctuated::Punctuated, Expr, ItemFn, Token,
};

/// Wraps a function returning `crate::Result` so that any error it produces
/// gets a context frame pointing at the caller.
///
/// The attribute accepts a message expression, or a format string with
/// optional arguments (inline captures work too):
///
/// ```ignore
/// #[error_context("failed to load metadata")]
/// #[error_context("failed to extend partition {}", index)]
/// #[error_context("growing volume to {device_size} bytes")]
/// ```
#[proc_macro_attribute]
pub fn error_context(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = match Punctuated::<Expr, Token![,]>::parse_terminated.parse(attr) {
        Ok(args) => args,
        Err(e) => return e.to_compile_error().into(),
    };
    let mut function = parse_macro_input!(item as ItemFn);
    let block = function.block;

    let literal_only = matches!(
        args.first(),
        Some(Expr::Lit(syn::ExprLit { lit: syn::Lit::Str(_), .. }))
    );
    let message: Expr = if args.len() == 1 && !literal_only {
        let only = &args[0];
        parse_quote!(#only)
    } else {
        let args = args.iter();
        parse_quote!(format!(#(#args),*))
    };

    function.attrs.push(parse_quote!(#[track_caller]));
    function.block = Box::new(parse_quote!({
        let __ubifvm_location = std::panic::Location::caller();
        let __ubifvm_result: crate::Result<_> = (|| #block)();
        __ubifvm_result.map_err(|__ubifvm_error| {
            __ubifvm_error.context_at(#message, __ubifvm_location)
        })
    }));

    TokenStream::from(quote!(#function))
}
