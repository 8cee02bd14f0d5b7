//! Arguments of the entry point attributes.
use proc_macro2::Span;
use syn::parse::{Parse, ParseStream};
use syn::punctuated::Punctuated;
use syn::spanned::Spanned;
use syn::{Expr, ExprLit, Lit, MetaNameValue, Token};

/// Which runtime the entry point builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flavor {
    Local,
    Pool,
    Virtual,
}

impl Flavor {
    pub(crate) fn name(self) -> &'static str {
        match self {
            Flavor::Local => "local",
            Flavor::Pool => "pool",
            Flavor::Virtual => "virtual",
        }
    }

    fn from_lit(lit: &Lit) -> syn::Result<Self> {
        let Lit::Str(s) = lit else {
            return Err(syn::Error::new_spanned(
                lit,
                "`flavor` takes a string: \"local\", \"pool\" or \"virtual\"",
            ));
        };

        match s.value().as_str() {
            "local" => Ok(Flavor::Local),
            "pool" => Ok(Flavor::Pool),
            "virtual" => Ok(Flavor::Virtual),
            other => Err(syn::Error::new_spanned(
                s,
                format!("unknown runtime flavor `{other}`, expected \"local\", \"pool\" or \"virtual\""),
            )),
        }
    }
}

/// Arguments as written. Whether they fit together is checked by the caller,
/// which knows the default flavor.
#[derive(Debug, Default)]
pub(crate) struct EntryArgs {
    pub(crate) flavor: Option<Flavor>,
    pub(crate) worker_threads: Option<(usize, Span)>,
}

impl Parse for EntryArgs {
    fn parse(input: ParseStream<'_>) -> syn::Result<Self> {
        let mut args = EntryArgs::default();

        for arg in Punctuated::<MetaNameValue, Token![,]>::parse_terminated(input)? {
            let span = arg.span();
            let lit = match &arg.value {
                Expr::Lit(ExprLit { lit, .. }) => lit,
                other => return Err(syn::Error::new_spanned(other, "expected a literal")),
            };

            if arg.path.is_ident("flavor") {
                if args.flavor.is_some() {
                    return Err(syn::Error::new(span, "`flavor` is set more than once"));
                }
                args.flavor = Some(Flavor::from_lit(lit)?);
            } else if arg.path.is_ident("worker_threads") {
                if args.worker_threads.is_some() {
                    return Err(syn::Error::new(span, "`worker_threads` is set more than once"));
                }
                args.worker_threads = Some((worker_threads(lit)?, span));
            } else {
                return Err(syn::Error::new_spanned(
                    &arg.path,
                    "unknown argument, expected `flavor` or `worker_threads`",
                ));
            }
        }

        Ok(args)
    }
}

fn worker_threads(lit: &Lit) -> syn::Result<usize> {
    let Lit::Int(int) = lit else {
        return Err(syn::Error::new_spanned(lit, "`worker_threads` takes an integer"));
    };

    match int.base10_parse::<usize>()? {
        0 => Err(syn::Error::new_spanned(
            int,
            "a pool needs at least one worker thread",
        )),
        n => Ok(n),
    }
}
