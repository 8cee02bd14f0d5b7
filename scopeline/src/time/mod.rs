//! Utilities for tracking time.
//!
//! Every runtime owns a clock. On a pool or local runtime it follows the wall
//! clock; on a virtual runtime it only moves when nothing else can run, or
//! when a [`TestScheduler`](crate::runtime::TestScheduler) advances it. Code
//! written against this module behaves the same on both.
//!
//! - [`sleep`] and [`sleep_until`] suspend the current task;
//! - [`with_timeout`] and [`with_timeout_or_none`] bound the duration of a
//!   piece of work and cancel it when it runs over.
use crate::runtime::Handle;
use std::time::Duration;

pub(crate) mod clock;
pub(crate) use clock::{Clock, VirtualClock};

mod sleep;
pub use sleep::{Sleep, sleep, sleep_until};

mod timeout;
pub use timeout::{with_timeout, with_timeout_or_none};

/// Time elapsed since the current runtime started, on its clock.
///
/// # Panics
///
/// Panics when no runtime is active on this thread.
#[track_caller]
pub fn now() -> Duration {
    Handle::current().now()
}
