pub(crate) mod scope_guard;
pub(crate) use scope_guard::ScopeGuard;

#[cfg_attr(not(test), allow(dead_code))]
pub(crate) mod tracker;
