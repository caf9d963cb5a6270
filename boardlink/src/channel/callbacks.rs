//! Push-callback registry and skip list for decoded lines.
//!
//! Both are guarded by their own lock. Dispatch snapshots the matching
//! callbacks and releases the lock before running them, so a callback may
//! register or unregister others without deadlocking. A registration added
//! while a line is being dispatched does not see that line.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};

use log::{debug, error};

use super::patterns::PatternSet;
use crate::callback::{CallbackHandle, lock};

/// Handler invoked with every line passing its filter.
pub type LineCallback = Arc<dyn Fn(&str) + Send + Sync>;

struct Registration {
    handle: CallbackHandle,
    filter: PatternSet,
    callback: LineCallback,
}

/// Ordered set of line callbacks with per-callback filters.
#[derive(Default)]
pub struct CallbackRegistry {
    entries: Mutex<Vec<Registration>>,
}

impl CallbackRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a callback and return its handle.
    pub fn register(&self, callback: LineCallback, filter: PatternSet) -> CallbackHandle {
        let handle = CallbackHandle::next();
        debug!("registered {} with filter {:?}", handle, filter);
        lock(&self.entries).push(Registration {
            handle,
            filter,
            callback,
        });
        handle
    }

    /// Widen the filter of an existing registration.
    ///
    /// Returns false if the handle is not registered.
    pub fn extend(&self, handle: CallbackHandle, filter: &PatternSet) -> bool {
        let mut entries = lock(&self.entries);
        match entries.iter_mut().find(|r| r.handle == handle) {
            Some(registration) => {
                registration.filter.union(filter);
                true
            }
            None => false,
        }
    }

    /// Remove a registration, or only part of its filter.
    ///
    /// With `None` the registration is dropped. With a filter, those patterns
    /// are removed and the registration is dropped once nothing is left.
    /// Returns false if the handle is not registered.
    pub fn unregister(&self, handle: CallbackHandle, filter: Option<&PatternSet>) -> bool {
        let mut entries = lock(&self.entries);
        let Some(index) = entries.iter().position(|r| r.handle == handle) else {
            return false;
        };

        if let Some(filter) = filter {
            entries[index].filter.difference(filter);
            if !entries[index].filter.is_empty() {
                return true;
            }
        }

        entries.remove(index);
        debug!("unregistered {}", handle);
        true
    }

    /// Remove every registration.
    pub fn clear(&self) {
        lock(&self.entries).clear();
    }

    /// Number of registrations.
    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    /// Check whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Filter of a registration.
    pub fn filter(&self, handle: CallbackHandle) -> Option<PatternSet> {
        lock(&self.entries)
            .iter()
            .find(|r| r.handle == handle)
            .map(|r| r.filter.clone())
    }

    /// Run every callback whose filter accepts `line`, in registration order.
    ///
    /// A panicking callback is logged and skipped. Returns how many callbacks
    /// were invoked.
    pub fn dispatch(&self, line: &str) -> usize {
        let matching: Vec<(CallbackHandle, LineCallback)> = lock(&self.entries)
            .iter()
            .filter(|r| r.filter.is_match(line))
            .map(|r| (r.handle, r.callback.clone()))
            .collect();

        for (handle, callback) in &matching {
            if catch_unwind(AssertUnwindSafe(|| callback(line))).is_err() {
                error!("{} panicked on line {:?}", handle, line);
            }
        }
        matching.len()
    }
}

/// Patterns of lines to suppress entirely.
#[derive(Debug)]
pub struct SkipSet {
    patterns: Mutex<PatternSet>,
}

impl SkipSet {
    /// Create an empty skip list.
    pub fn new() -> Self {
        Self {
            patterns: Mutex::new(PatternSet::empty()),
        }
    }

    /// Skip lines matching any of `patterns`.
    pub fn add(&self, patterns: &PatternSet) {
        lock(&self.patterns).union(patterns);
    }

    /// Stop skipping lines matching `patterns`.
    pub fn remove(&self, patterns: &PatternSet) {
        lock(&self.patterns).difference(patterns);
    }

    /// Stop skipping anything.
    pub fn clear(&self) {
        *lock(&self.patterns) = PatternSet::empty();
    }

    /// Check whether a line is suppressed.
    pub fn is_skipped(&self, line: &str) -> bool {
        let patterns = lock(&self.patterns);
        !patterns.is_empty() && patterns.is_match(line)
    }
}

impl Default for SkipSet {
    fn default() -> Self {
        Self::new()
    }
}
