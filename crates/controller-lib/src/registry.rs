//! Process-wide registry of live stores, keyed by the owning RMM's UID.
//!
//! The event handler writes entries, reflectors mutate the stores inside
//! them, and the exposition writer reads whatever is live at scrape time.
//! Each entry owns the cancellation token scoping its reflectors, so
//! dropping an entry terminates the watches feeding it.

use std::sync::Arc;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::store::Store;

struct RegisteredStores {
    stores: Vec<Arc<Store>>,
    cancel: CancellationToken,
}

#[derive(Default)]
pub struct StoreRegistry {
    entries: DashMap<String, RegisteredStores>,
}

impl StoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the stores for an RMM, replacing (and cancelling) any
    /// previous generation.
    pub fn insert(&self, uid: &str, stores: Vec<Arc<Store>>, cancel: CancellationToken) {
        self.drop_stores(uid);
        self.entries
            .insert(uid.to_owned(), RegisteredStores { stores, cancel });
    }

    /// Drops the registry entry and cancels the reflectors bound to it.
    /// Returns whether an entry existed.
    pub fn drop_stores(&self, uid: &str) -> bool {
        match self.entries.remove(uid) {
            Some((_, entry)) => {
                debug!(uid, stores = entry.stores.len(), "dropping stores");
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Snapshot of every live store, for a single scrape pass.
    pub fn stores(&self) -> Vec<Arc<Store>> {
        self.entries
            .iter()
            .flat_map(|entry| entry.stores.clone())
            .collect()
    }

    pub fn contains(&self, uid: &str) -> bool {
        self.entries.contains_key(uid)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FragmentMap;

    fn fixture_store() -> Arc<Store> {
        Arc::new(Store::fixture(vec!["header".into()], FragmentMap::new()))
    }

    #[test]
    fn insert_replaces_and_cancels_the_previous_generation() {
        let registry = StoreRegistry::new();
        let first = CancellationToken::new();
        let second = CancellationToken::new();

        registry.insert("uid-1", vec![fixture_store()], first.clone());
        registry.insert("uid-1", vec![fixture_store(), fixture_store()], second.clone());

        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.stores().len(), 2);
    }

    #[test]
    fn drop_stores_cancels_reflectors() {
        let registry = StoreRegistry::new();
        let token = CancellationToken::new();
        registry.insert("uid-1", vec![fixture_store()], token.clone());

        assert!(registry.drop_stores("uid-1"));
        assert!(token.is_cancelled());
        assert!(registry.is_empty());
        assert!(!registry.drop_stores("uid-1"));
    }
}
