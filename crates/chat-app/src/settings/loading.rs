use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::state::{StateStore, SubscriptionId};

use super::model::ModelLoadingKey;

/// Which configuration fields are currently being saved or validated.
///
/// Keys not present are not loading.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelLoadingState {
    loading: BTreeSet<ModelLoadingKey>,
}

impl ModelLoadingState {
    pub fn is_loading(&self, key: ModelLoadingKey) -> bool {
        self.loading.contains(&key)
    }

    pub fn any(&self) -> bool {
        !self.loading.is_empty()
    }

    fn with(&self, key: ModelLoadingKey, loading: bool) -> Self {
        let mut next = self.clone();
        if loading {
            next.loading.insert(key);
        } else {
            next.loading.remove(&key);
        }
        next
    }
}

/// Per-field in-flight flags for configuration edits.
///
/// Begins nest: a key stays loading until every `begin_load` has a matching
/// `end_load`, so queued edits to one field keep it flagged until the last
/// settles. Subscribers only hear about flag flips. Reads never block.
/// Prefer [`LoadingTracker::begin`], whose guard ends the load on every exit
/// path.
#[derive(Default)]
pub struct LoadingTracker {
    state: StateStore<ModelLoadingState>,
    pending: Mutex<BTreeMap<ModelLoadingKey, usize>>,
}

impl LoadingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_load(&self, key: ModelLoadingKey) {
        let mut pending = self.pending.lock();
        let count = pending.entry(key).or_default();
        *count += 1;
        if *count == 1 {
            self.state.update(|state| state.with(key, true));
            tracing::debug!(key = %key, "config field loading");
        }
    }

    /// Ends one load of `key`. Unmatched calls are ignored.
    pub fn end_load(&self, key: ModelLoadingKey) {
        let mut pending = self.pending.lock();
        let Some(count) = pending.get_mut(&key) else {
            return;
        };
        *count -= 1;
        if *count == 0 {
            pending.remove(&key);
            self.state.update(|state| state.with(key, false));
            tracing::debug!(key = %key, "config field settled");
        }
    }

    pub fn is_loading(&self, key: ModelLoadingKey) -> bool {
        self.state.get().is_loading(key)
    }

    pub fn snapshot(&self) -> Arc<ModelLoadingState> {
        self.state.get()
    }

    /// Marks `key` as loading until the returned guard is dropped.
    pub fn begin(&self, key: ModelLoadingKey) -> LoadGuard<'_> {
        self.begin_load(key);
        LoadGuard { tracker: self, key }
    }

    pub fn subscribe<F>(&self, subscriber: F) -> SubscriptionId
    where
        F: Fn(&ModelLoadingState) + Send + Sync + 'static,
    {
        self.state.subscribe(subscriber)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.state.unsubscribe(id)
    }

    pub fn shutdown(&self) {
        self.state.shutdown();
    }
}

#[must_use = "dropping the guard ends the load immediately"]
pub struct LoadGuard<'a> {
    tracker: &'a LoadingTracker,
    key: ModelLoadingKey,
}

impl LoadGuard<'_> {
    pub fn key(&self) -> ModelLoadingKey {
        self.key
    }
}

impl Drop for LoadGuard<'_> {
    fn drop(&mut self) {
        self.tracker.end_load(self.key);
    }
}
