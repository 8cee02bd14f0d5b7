/// Runs a closure when it goes out of scope, on normal exit, early return or
/// unwinding alike.
///
/// The guard is armed on creation. [`disarm`](ScopeGuard::disarm) turns it
/// into a no-op.
pub(crate) struct ScopeGuard<F: FnOnce()> {
    // Taken on drop or disarm, so the closure runs at most once.
    closure: Option<F>,
}

impl<F: FnOnce()> ScopeGuard<F> {
    /// ```ignore
    /// let running = AtomicBool::new(true);
    /// {
    ///     let _guard = ScopeGuard::new(|| running.store(false, Ordering::Release));
    /// }
    /// assert!(!running.load(Ordering::Acquire));
    /// ```
    pub(crate) fn new(closure: F) -> Self {
        ScopeGuard {
            closure: Some(closure),
        }
    }

    pub(crate) fn disarm(&mut self) {
        self.closure.take();
    }
}

impl<F: FnOnce()> Drop for ScopeGuard<F> {
    fn drop(&mut self) {
        if let Some(closure) = self.closure.take() {
            closure();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::panic::{self, AssertUnwindSafe};

    #[test]
    fn test_runs_on_drop_and_unwind() {
        let count = Cell::new(0);

        {
            let _guard = ScopeGuard::new(|| count.set(count.get() + 1));
        }
        assert_eq!(count.get(), 1);

        let res = panic::catch_unwind(AssertUnwindSafe(|| {
            let _guard = ScopeGuard::new(|| count.set(count.get() + 1));
            panic!("unwinding");
        }));
        assert!(res.is_err());
        assert_eq!(count.get(), 2);
    }

    #[test]
    fn test_disarm() {
        let count = Cell::new(0);

        {
            let mut guard = ScopeGuard::new(|| count.set(count.get() + 1));
            guard.disarm();
        }
        assert_eq!(count.get(), 0);
    }
}
