//! Synchronization primitives for tasks.
//!
//! Tasks of a pool run in parallel, and even on a single thread every
//! suspension point lets another task run: a read-modify-write spanning an
//! `.await` loses updates without exclusion. Either hold a [`Mutex`] across
//! it, or confine the state to one thread by only touching it from tasks
//! dispatched on a [`Dispatcher::single_thread`].
//!
//! [`Dispatcher::single_thread`]: crate::runtime::Dispatcher::single_thread
mod mutex;
pub use mutex::{Lock, Mutex, MutexGuard};
