use crate::task::Id;
use dashmap::DashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Method {
    Schedule,
    Poll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Call {
    Schedule { id: Id },
    Poll { id: Id },
}

// Records the calls a scheduler receives. Tests assert on the *real* scheduler
// this way instead of a mock.
#[derive(Debug, Clone)]
pub(crate) struct Tracker {
    calls: Arc<DashMap<Method, Vec<Call>>>,
}

impl Tracker {
    pub(crate) fn new() -> Self {
        let map = DashMap::new();
        map.insert(Method::Schedule, Vec::new());
        map.insert(Method::Poll, Vec::new());

        Self {
            calls: Arc::new(map),
        }
    }

    pub(crate) fn record(&self, method: Method, call: Call) {
        if let Some(mut calls) = self.calls.get_mut(&method) {
            calls.push(call);
        }
    }

    pub(crate) fn get_calls(&self, method: &Method) -> Vec<Call> {
        self.calls
            .get(method)
            .map(|calls| calls.value().clone())
            .unwrap_or_default()
    }

    /// Ids of the polled tasks, in poll order.
    pub(crate) fn polled_ids(&self) -> Vec<Id> {
        self.get_calls(&Method::Poll)
            .into_iter()
            .filter_map(|call| match call {
                Call::Poll { id } => Some(id),
                Call::Schedule { .. } => None,
            })
            .collect()
    }

    pub(crate) fn num_calls(&self, method: &Method) -> usize {
        self.calls.get(method).map_or(0, |calls| calls.len())
    }
}
