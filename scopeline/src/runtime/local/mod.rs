//! Scheduler that polls its tasks on the thread blocked in `block_on`.
//!
//! Tasks are run one at a time in the order they were woken, so tasks spawned
//! in program order also start in program order. Wakes may come from any
//! thread (timer driver, pool workers), the loop parks on a condition variable
//! while there is nothing to run.

pub(crate) mod scheduler;
pub(crate) use scheduler::{Handle, Scheduler};
