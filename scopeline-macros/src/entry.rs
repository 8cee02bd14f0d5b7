//! Expansion of `#[scopeline::main]` and `#[scopeline::test]`.
//!
//! Both turn an `async fn` into a plain `fn` that builds a runtime and drives
//! the original body as its root task:
//!
//! ```ignore
//! #[scopeline::main(flavor = "pool", worker_threads = 2)]
//! async fn main() -> scopeline::Result<()> {
//!     scopeline::time::sleep(Duration::from_millis(10)).await
//! }
//!
//! // becomes
//!
//! fn main() -> scopeline::Result<()> {
//!     let body = async { scopeline::time::sleep(Duration::from_millis(10)).await };
//!     let runtime = scopeline::runtime::Builder::new_pool()
//!         .worker_threads(2)
//!         .try_build()
//!         .expect("failed to build the scopeline runtime");
//!     let root = runtime.block_on(async move { Ok::<_, scopeline::Error>(body.await) });
//!     match root {
//!         Ok(ret) => ret,
//!         Err(err) => Err(From::from(err)),
//!     }
//! }
//! ```
use crate::parse::{EntryArgs, Flavor};
use proc_macro2::TokenStream;
use quote::quote;
use syn::{ItemFn, ReturnType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Entry {
    Main,
    Test,
}

impl Entry {
    fn attr(self) -> &'static str {
        match self {
            Entry::Main => "#[scopeline::main]",
            Entry::Test => "#[scopeline::test]",
        }
    }

    /// Tests get a deterministic single threaded runtime unless they ask.
    fn default_flavor(self) -> Flavor {
        match self {
            Entry::Main => Flavor::Pool,
            Entry::Test => Flavor::Local,
        }
    }
}

struct RuntimeSetup {
    flavor: Flavor,
    worker_threads: Option<usize>,
}

pub(crate) fn main(args: TokenStream, item: TokenStream) -> TokenStream {
    expand(Entry::Main, args, item)
}

pub(crate) fn test(args: TokenStream, item: TokenStream) -> TokenStream {
    expand(Entry::Test, args, item)
}

fn expand(entry: Entry, args: TokenStream, item: TokenStream) -> TokenStream {
    let input: ItemFn = match syn::parse2(item.clone()) {
        Ok(input) => input,
        Err(err) => return with_error(item, err),
    };

    let setup = check_signature(entry, &input)
        .and_then(|()| syn::parse2::<EntryArgs>(args))
        .and_then(|args| runtime_setup(entry, args));

    match setup {
        Ok(setup) => generate(entry, input, &setup),
        // Still expand the function so the error is the only one reported.
        Err(err) => {
            let fallback = RuntimeSetup {
                flavor: entry.default_flavor(),
                worker_threads: None,
            };
            with_error(generate(entry, input, &fallback), err)
        }
    }
}

fn check_signature(entry: Entry, input: &ItemFn) -> syn::Result<()> {
    let sig = &input.sig;

    if sig.asyncness.is_none() {
        let msg = format!("{} only applies to an `async fn`", entry.attr());
        return Err(syn::Error::new_spanned(sig.fn_token, msg));
    }

    if !sig.inputs.is_empty() {
        return Err(syn::Error::new_spanned(
            &sig.inputs,
            "the root task cannot take arguments",
        ));
    }

    if !sig.generics.params.is_empty() {
        return Err(syn::Error::new_spanned(
            &sig.generics,
            "the root task cannot be generic",
        ));
    }

    if entry == Entry::Test {
        if let Some(attr) = input.attrs.iter().find(|attr| attr.path().is_ident("test")) {
            return Err(syn::Error::new_spanned(
                attr,
                "#[scopeline::test] already adds `#[test]`, remove this one",
            ));
        }
    }

    Ok(())
}

fn runtime_setup(entry: Entry, args: EntryArgs) -> syn::Result<RuntimeSetup> {
    let flavor = args.flavor.unwrap_or(entry.default_flavor());

    let worker_threads = match (flavor, args.worker_threads) {
        (Flavor::Pool, threads) => threads.map(|(n, _)| n),
        (_, None) => None,
        (other, Some((_, span))) => {
            let msg = format!(
                "the {} runtime has no thread pool, `worker_threads` needs flavor = \"pool\"",
                other.name()
            );
            return Err(syn::Error::new(span, msg));
        }
    };

    Ok(RuntimeSetup {
        flavor,
        worker_threads,
    })
}

fn generate(entry: Entry, mut input: ItemFn, setup: &RuntimeSetup) -> TokenStream {
    input.sig.asyncness = None;

    let builder = match setup.flavor {
        Flavor::Local => quote!(new_local()),
        Flavor::Pool => quote!(new_pool()),
        Flavor::Virtual => quote!(new_virtual()),
    };
    let worker_threads = setup.worker_threads.map(|n| quote!(.worker_threads(#n)));

    // A unit entry point has nowhere to put the root's error. One returning a
    // `Result` gets it converted into its own error type.
    let finish = match &input.sig.output {
        ReturnType::Default => quote! {
            if let ::core::result::Result::Err(err) = root {
                ::core::panic!("root task did not complete: {}", err);
            }
        },
        ReturnType::Type(..) => quote! {
            match root {
                ::core::result::Result::Ok(ret) => ret,
                ::core::result::Result::Err(err) => {
                    ::core::result::Result::Err(::core::convert::From::from(err))
                }
            }
        },
    };

    let block = &input.block;
    let body = quote! {
        {
            let body = async #block;

            #[allow(clippy::expect_used)]
            let runtime = scopeline::runtime::Builder::#builder #worker_threads
                .try_build()
                .expect("failed to build the scopeline runtime");

            let root = runtime.block_on(async move {
                ::core::result::Result::Ok::<_, scopeline::Error>(body.await)
            });

            #finish
        }
    };

    input.block = match syn::parse2(body) {
        Ok(block) => Box::new(block),
        Err(err) => return with_error(quote!(#input), err),
    };

    let test_attr = (entry == Entry::Test).then(|| quote!(#[::core::prelude::v1::test]));

    quote! {
        #test_attr
        #input
    }
}

fn with_error(mut tokens: TokenStream, err: syn::Error) -> TokenStream {
    tokens.extend(err.into_compile_error());
    tokens
}
