//! Predicate chains for list operations.
//!
//! A CRI list filter is a handful of independent criteria (id, owning
//! sandbox, label selector, state). Each criterion that is actually set
//! becomes one predicate in the chain; an unset criterion contributes
//! nothing, so an empty filter passes everything. A record survives only if
//! every predicate accepts it, which makes chains monotone: adding a
//! predicate can never grow the result.

/// An ordered conjunction of predicates over `T`.
pub struct FilterChain<T> {
    predicates: Vec<Box<dyn Fn(&T) -> bool + Send + Sync>>,
}

impl<T> FilterChain<T> {
    pub fn new() -> Self {
        FilterChain {
            predicates: Vec::new(),
        }
    }

    /// Append a predicate when its criterion is set; pass-through otherwise.
    pub fn when<F>(mut self, enabled: bool, predicate: F) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        if enabled {
            self.predicates.push(Box::new(predicate));
        }
        self
    }

    /// Keep the items every predicate accepts.
    pub fn apply(&self, items: Vec<T>) -> Vec<T> {
        items
            .into_iter()
            .filter(|item| self.predicates.iter().all(|predicate| predicate(item)))
            .collect()
    }
}

impl<T> Default for FilterChain<T> {
    fn default() -> Self {
        Self::new()
    }
}
