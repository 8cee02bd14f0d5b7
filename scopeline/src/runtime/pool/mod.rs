//! Thread pools with work stealing.
//!
//! A fixed pool starts all of its workers up front. Each worker owns a FIFO
//! queue that other workers steal from, and tasks injected from outside of the
//! pool land in a shared injector queue. An elastic pool starts threads on
//! demand up to a cap and retires them after they sat idle for a while; it
//! only uses the injector.

pub(crate) mod scheduler;
pub(crate) use scheduler::{Config, Handle};

pub(crate) mod worker;

#[cfg(test)]
mod tests;
