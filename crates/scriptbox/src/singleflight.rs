//! Duplicate call suppression.
//!
//! Concurrent callers that ask for the same key share one computation. The
//! first caller runs it; everyone else awaits the same cell and receives a
//! clone of the outcome. Once a round completes the key is forgotten, so the
//! next call starts a fresh round whether the last one succeeded or failed.

use std::{future::Future, hash::Hash, sync::Arc};

use dashmap::DashMap;
use tokio::sync::OnceCell;

pub struct Group<K, V> {
    calls: DashMap<K, Arc<OnceCell<V>>>,
}

impl<K, V> Default for Group<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self {
            calls: DashMap::new(),
        }
    }
}

impl<K, V> Group<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` for `key` unless a call for the same key is already in flight,
    /// in which case wait for that call and return its result.
    ///
    /// If the running caller is dropped before finishing, one of the waiters
    /// takes over with its own `f`.
    pub async fn work<F, Fut>(&self, key: K, f: F) -> V
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V>,
    {
        let cell = Arc::clone(self.calls.entry(key.clone()).or_default().value());
        let value = cell.get_or_init(f).await.clone();
        self.calls
            .remove_if(&key, |_, current| Arc::ptr_eq(current, &cell));
        value
    }

    /// Number of keys with a round in progress.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.calls.len()
    }
}
