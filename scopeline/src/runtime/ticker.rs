use bitflags::bitflags;

#[derive(Debug)]
pub(crate) struct Ticker {
    tick: u32,
}

impl Ticker {
    pub(crate) fn new() -> Self {
        Self { tick: 0 }
    }

    pub(crate) fn tick<T: TickerData>(&mut self, ctx: &T::Context, data: &mut T) -> TickerEvents {
        self.tick = self.tick.wrapping_add(1);
        data.update_and_check(ctx, self.tick)
    }
}

/// Implemented by each event loop that runs periodic housekeeping. The event
/// loop turns the tick into `TickerEvents`, the worker acts on them. This way
/// we decouple the policy from the loop.
pub(crate) trait TickerData {
    type Context;

    // Events are checked in order of importance, shutdown always wins.
    fn update_and_check(&mut self, ctx: &Self::Context, tick: u32) -> TickerEvents;
}

bitflags! {
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub(crate) struct TickerEvents: u16 {
        /// Look at the global queue before the local one, so tasks injected
        /// from outside of the pool are not starved by busy workers.
        const POP_GLOBAL_QUEUE = 1;

        /// The pool is shutting down, the worker must exit its loop.
        const SHUTDOWN = 1 << 1;
    }
}
