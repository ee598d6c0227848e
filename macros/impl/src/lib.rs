//! Procedural macros re-exported by `quadtrail-macros`.

use proc_macro::TokenStream;
use quote::{format_ident, quote};
use syn::{parse_macro_input, ItemFn, Lit, LitStr, MetaNameValue};

/// Levels accepted by [macro@test_traced].
const LEVELS: [&str; 5] = ["TRACE", "DEBUG", "INFO", "WARN", "ERROR"];

/// Run a test function with a `tracing` subscriber capturing events at the given level (`DEBUG` if
/// none is provided). The level is written either as `#[test_traced("INFO")]` or as
/// `#[test_traced(level = "INFO")]`.
///
/// Output is routed through the test harness, so it is only printed for failing tests (or when
/// running with `--nocapture`).
///
/// # Example
/// ```rust,ignore
/// use quadtrail_macros::test_traced;
/// use tracing::{debug, info};
///
/// #[test_traced(level = "INFO")]
/// fn test_info_level() {
///     info!("This is an info log");
///     debug!("This is a debug log (won't be shown)");
///     assert_eq!(2 + 2, 4);
/// }
/// ```
#[proc_macro_attribute]
pub fn test_traced(attr: TokenStream, item: TokenStream) -> TokenStream {
    let input = parse_macro_input!(item as ItemFn);

    // Parse the level (`"INFO"` or `level = "INFO"`)
    let level = if attr.is_empty() {
        "DEBUG".to_string()
    } else {
        let literal = match syn::parse::<LitStr>(attr.clone()) {
            Ok(literal) => literal,
            Err(_) => {
                let meta = parse_macro_input!(attr as MetaNameValue);
                if !meta.path.is_ident("level") {
                    return syn::Error::new_spanned(
                        &meta.path,
                        "unknown argument: expected `level`",
                    )
                    .to_compile_error()
                    .into();
                }
                match meta.lit {
                    Lit::Str(literal) => literal,
                    other => {
                        return syn::Error::new_spanned(other, "level must be a string literal")
                            .to_compile_error()
                            .into();
                    }
                }
            }
        };
        let level = literal.value().to_uppercase();
        if !LEVELS.contains(&level.as_str()) {
            return syn::Error::new(
                literal.span(),
                "invalid level: expected one of TRACE, DEBUG, INFO, WARN, ERROR",
            )
            .to_compile_error()
            .into();
        }
        level
    };
    let level = format_ident!("{}", level);

    // Rebuild the test around a scoped subscriber
    let attrs = &input.attrs;
    let vis = &input.vis;
    let sig = &input.sig;
    let block = &input.block;
    let expanded = quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let subscriber = ::quadtrail_macros::tracing_subscriber::fmt()
                .with_test_writer()
                .with_max_level(::quadtrail_macros::tracing::Level::#level)
                .with_line_number(true)
                .finish();
            let dispatch = ::quadtrail_macros::tracing::Dispatch::new(subscriber);
            ::quadtrail_macros::tracing::dispatcher::with_default(&dispatch, || #block)
        }
    };
    TokenStream::from(expanded)
}
