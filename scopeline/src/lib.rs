//! Structured concurrency: every task belongs to a scope, scopes only finish
//! once their children did, and cancellation flows down the tree while
//! failures flow up.
//!
//! ```no_run
//! use scopeline::scope;
//! use std::time::Duration;
//!
//! #[scopeline::main]
//! async fn main() -> scopeline::Result<()> {
//!     let report = scope::scope(|group| async move {
//!         let users = group.spawn(async { Ok(vec!["ada", "grace"]) })?;
//!         let quota = group.spawn(async {
//!             scopeline::time::with_timeout(Duration::from_secs(1), async { Ok(42) }).await
//!         })?;
//!
//!         Ok(format!("{} users, quota {}", users.await?.len(), quota.await?))
//!     })
//!     .await?;
//!
//!     println!("{report}");
//!     Ok(())
//! }
//! ```
#[doc(inline)]
pub use scopeline_macros::main;

#[doc(inline)]
pub use scopeline_macros::test;

mod context;

pub mod error;
pub use error::{Error, Result};

pub mod runtime;
pub use runtime::{run_root, spawn, spawn_builder};

pub mod scope;

pub mod sync;

pub mod task;

pub mod time;

mod utils;

#[cfg(test)]
mod test_utils;
