//! Test attributes that run the body on a watchdog thread and fail the test
//! if it does not finish in time.
//!
//! `#[tokio_timeout_test]` drives an async body on a fresh current-thread
//! runtime; `#[timeout]` wraps a synchronous body. Both take an optional
//! limit in seconds, e.g. `#[tokio_timeout_test(30)]`, defaulting to 60.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{parse_macro_input, Attribute, ItemFn, LitInt};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let function = parse_macro_input!(item as ItemFn);
    expand(attr.into(), function, Flavor::Async).into()
}

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let function = parse_macro_input!(item as ItemFn);
    expand(attr.into(), function, Flavor::Sync).into()
}

#[derive(Clone, Copy)]
enum Flavor {
    Async,
    Sync,
}

fn expand(attr: TokenStream2, function: ItemFn, flavor: Flavor) -> TokenStream2 {
    match try_expand(attr, function, flavor) {
        Ok(tokens) => tokens,
        Err(err) => err.to_compile_error(),
    }
}

fn try_expand(attr: TokenStream2, function: ItemFn, flavor: Flavor) -> syn::Result<TokenStream2> {
    let timeout_secs = parse_timeout(attr)?;
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = function;

    let run = match flavor {
        Flavor::Async => {
            if sig.asyncness.is_none() {
                return Err(syn::Error::new_spanned(
                    &sig.ident,
                    "tokio_timeout_test can only be applied to async functions",
                ));
            }
            sig.asyncness = None;
            quote! {
                || {
                    let runtime = tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                        .expect("failed to build Tokio runtime");
                    runtime.block_on(async {
                        tokio::time::timeout(__watchdog_limit, async move #block)
                            .await
                            .expect("test timed out");
                    });
                }
            }
        }
        Flavor::Sync => {
            if sig.asyncness.is_some() {
                return Err(syn::Error::new_spanned(
                    &sig.ident,
                    "timeout attribute expects a synchronous test function",
                ));
            }
            quote! { || #block }
        }
    };

    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_test_marker(attr))
        .collect();

    Ok(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let __watchdog_limit = std::time::Duration::from_secs(#timeout_secs);
            let (__watchdog_tx, __watchdog_rx) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(#run));
                let _ = __watchdog_tx.send(outcome);
            });
            match __watchdog_rx.recv_timeout(__watchdog_limit) {
                Ok(Ok(_)) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => panic!("test timed out"),
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread failed before reporting result")
                }
            }
        }
    })
}

fn parse_timeout(attr: TokenStream2) -> syn::Result<u64> {
    if attr.is_empty() {
        return Ok(DEFAULT_TIMEOUT_SECS);
    }
    let lit: LitInt = syn::parse2(attr)?;
    let secs: u64 = lit.base10_parse()?;
    if secs == 0 {
        return Err(syn::Error::new_spanned(lit, "timeout must be greater than zero"));
    }
    Ok(secs)
}

/// `#[test]` and `#[tokio::test]` are dropped; the expansion adds its own.
fn is_test_marker(attr: &Attribute) -> bool {
    let segments: Vec<String> = attr
        .path()
        .segments
        .iter()
        .map(|segment| segment.ident.to_string())
        .collect();
    matches!(
        segments.iter().map(String::as_str).collect::<Vec<_>>().as_slice(),
        ["test"] | ["tokio", "test"]
    )
}
