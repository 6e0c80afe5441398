//! Per-entity-type store registry.
//!
//! One `UnaryStore` instance must exist per entity type so every query reads
//! and writes the same cache. The registry hands that instance out, keyed by
//! the concrete `(K, V)` type pair, and is itself passed around explicitly:
//! stores are dependencies, not globals, and tests get isolation by building
//! a fresh registry.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use log::debug;

use crate::core::unary::UnaryStore;
use crate::entities::change::EntityKey;

/// Type-keyed collection of unary stores. Cheap to clone; clones share the
/// same stores.
#[derive(Clone, Default)]
pub struct StoreRegistry {
    stores: Arc<RwLock<HashMap<TypeId, Box<dyn Any + Send + Sync>>>>,
}

impl StoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The store for entity type `(K, V)`, created lazily on first request.
    /// Every call with the same type pair returns a handle to the same
    /// store.
    pub fn unary<K, V>(&self) -> UnaryStore<K, V>
    where
        K: EntityKey,
        V: Clone + Send + Sync + 'static,
    {
        let type_id = TypeId::of::<UnaryStore<K, V>>();
        {
            let stores = self.stores.read().expect("lock");
            if let Some(store) = stores.get(&type_id) {
                return store
                    .downcast_ref::<UnaryStore<K, V>>()
                    .expect("registry entry type matches its key")
                    .clone();
            }
        }

        let mut stores = self.stores.write().expect("lock");
        // Double-check: another thread may have created it between locks
        if let Some(store) = stores.get(&type_id) {
            return store
                .downcast_ref::<UnaryStore<K, V>>()
                .expect("registry entry type matches its key")
                .clone();
        }
        debug!("creating store for {}", std::any::type_name::<UnaryStore<K, V>>());
        let store = UnaryStore::<K, V>::new();
        stores.insert(type_id, Box::new(store.clone()));
        store
    }

    /// Number of distinct entity-type stores created so far.
    pub fn len(&self) -> usize {
        self.stores.read().expect("lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.read().expect("lock").is_empty()
    }
}

impl std::fmt::Debug for StoreRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreRegistry").field("stores", &self.len()).finish()
    }
}
