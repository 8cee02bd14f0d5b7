#![allow(clippy::needless_doctest_main)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub
)]
#![doc(test(
    no_crate_inject,
    attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables))
))]

//! Entry point attributes for the scopeline runtime.

mod entry;
mod parse;

/// Runs an async `main` as the root task of a freshly built runtime.
///
/// The function body becomes the root task: everything it spawns is its
/// child, and `main` only returns once all of them are terminal.
///
/// When `main` returns a `Result`, a root task that fails, is cancelled or
/// panics makes `main` return that error, converted with `From` from
/// `scopeline::Error`. A `main` returning `()` panics with it instead.
///
/// # Runtime flavors
///
/// - `pool` (default): a pool of worker threads with work stealing. The
///   `worker_threads` option sets its size, it defaults to the number of
///   CPUs.
/// - `local`: every task runs on the thread calling `main`.
/// - `virtual`: single thread, the clock only moves when the test scheduler
///   advances it.
///
/// ```no_run
/// #[scopeline::main(flavor = "pool", worker_threads = 4)]
/// async fn main() {
///     println!("Hello world");
/// }
/// ```
///
/// Equivalent code not using `#[scopeline::main]`
///
/// ```no_run
/// fn main() {
///     let root = scopeline::runtime::Builder::new_pool()
///         .worker_threads(4)
///         .try_build()
///         .expect("failed to build the scopeline runtime")
///         .block_on(async {
///             println!("Hello world");
///             Ok(())
///         });
///
///     if let Err(err) = root {
///         panic!("root task did not complete: {}", err);
///     }
/// }
/// ```
///
/// Function arguments are not allowed.
#[proc_macro_attribute]
pub fn main(
    args: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    entry::main(args.into(), item.into()).into()
}

/// Runs an async test as the root task of its own runtime.
///
/// The default flavor is `local`. `pool` and `virtual` are available as for
/// [`macro@main`], `worker_threads` only applies to `pool`. A test returning
/// a `Result` reports a failed root task as its error.
///
/// ```no_run
/// # #[allow(unused_imports)]
/// # use std::time::Duration;
/// #[scopeline::test(flavor = "virtual")]
/// async fn timeout_fires() {
///     let res = scopeline::time::with_timeout(Duration::from_secs(1), async {
///         scopeline::time::sleep(Duration::from_secs(5)).await
///     })
///     .await;
///
///     assert!(res.unwrap_err().is_timeout());
/// }
/// ```
///
/// Equivalent code not using `#[scopeline::test]`
///
/// ```no_run
/// #[test]
/// fn my_test() {
///     let root = scopeline::runtime::Builder::new_local()
///         .try_build()
///         .expect("failed to build the scopeline runtime")
///         .block_on(async {
///             assert!(true);
///             Ok(())
///         });
///
///     if let Err(err) = root {
///         panic!("root task did not complete: {}", err);
///     }
/// }
/// ```
#[proc_macro_attribute]
pub fn test(
    args: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    entry::test(args.into(), item.into()).into()
}
