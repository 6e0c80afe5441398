//! Unary Store: authoritative local cache for one entity type.
//!
//! **Why**: Every reactive query for an entity type reads and writes the same
//! store instance, so a change applied once (from a mutation or a bus event)
//! re-renders every dependent without refetching.
//!
//! Listener contract: per-key and wildcard listeners are invoked
//! synchronously *after* the value is stored, so a listener never observes a
//! stale value for the key it is being told about. Deletes notify with an
//! absence signal. Values are always replaced, never mutated in place.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use log::debug;
use serde::de::DeserializeOwned;

use crate::core::bus::ChannelBus;
use crate::core::disposer::Disposer;
use crate::entities::change::{
    Change, EntityKey, Keyed, decode_json_delete, decode_json_set, delete_channel, set_channel,
};
use crate::error::SyncError;

/// Listener invoked with the key and the new value (`None` = deleted).
type ChangeListener<K, V> = Arc<dyn Fn(&K, Option<&V>) + Send + Sync>;

struct ListenerEntry<K, V> {
    id: u64,
    /// `None` subscribes to every mutation in the store.
    key: Option<K>,
    callback: ChangeListener<K, V>,
}

/// Key -> value cache with change listeners. Cheap to clone; all clones
/// share state. One instance per entity type, passed around explicitly via
/// the store registry rather than held as a global.
pub struct UnaryStore<K, V> {
    values: Arc<RwLock<HashMap<K, V>>>,
    listeners: Arc<RwLock<Vec<ListenerEntry<K, V>>>>,
    next_id: Arc<AtomicU64>,
}

impl<K, V> Clone for UnaryStore<K, V> {
    fn clone(&self) -> Self {
        Self {
            values: Arc::clone(&self.values),
            listeners: Arc::clone(&self.listeners),
            next_id: Arc::clone(&self.next_id),
        }
    }
}

impl<K, V> Default for UnaryStore<K, V>
where
    K: EntityKey,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> UnaryStore<K, V>
where
    K: EntityKey,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            values: Arc::new(RwLock::new(HashMap::new())),
            listeners: Arc::new(RwLock::new(Vec::new())),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.values.read().expect("lock").get(key).cloned()
    }

    /// Values for the given keys, skipping absent ones.
    pub fn get_many(&self, keys: &[K]) -> Vec<V> {
        let values = self.values.read().expect("lock");
        keys.iter().filter_map(|k| values.get(k).cloned()).collect()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.values.read().expect("lock").contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.read().expect("lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.read().expect("lock").is_empty()
    }

    /// Store a value, overwriting any previous one, then notify matching
    /// listeners.
    pub fn set(&self, key: K, value: V) {
        {
            let mut values = self.values.write().expect("lock");
            values.insert(key.clone(), value.clone());
        }
        self.notify(&key, Some(&value));
    }

    /// Store a batch of values, notifying per entry.
    pub fn set_many<I: IntoIterator<Item = (K, V)>>(&self, entries: I) {
        for (k, v) in entries {
            self.set(k, v);
        }
    }

    /// Apply one decoded change event: `Set` stores, `Delete` removes.
    pub fn apply(&self, change: Change<K, V>) {
        match change {
            Change::Set { key, value } => self.set(key, value),
            Change::Delete { key } => self.delete(&key),
        }
    }

    /// Remove a value, then notify matching listeners with an absence
    /// signal. Deleting an absent key notifies nobody.
    pub fn delete(&self, key: &K) {
        let removed = {
            let mut values = self.values.write().expect("lock");
            values.remove(key).is_some()
        };
        if removed {
            self.notify(key, None);
        }
    }

    /// Subscribe to mutations. `Some(key)` scopes the listener to one key;
    /// `None` hears every mutation in the store.
    pub fn subscribe<F>(&self, key: Option<K>, listener: F) -> Disposer
    where
        F: Fn(&K, Option<&V>) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.write().expect("lock").push(ListenerEntry {
            id,
            key,
            callback: Arc::new(listener),
        });
        let listeners = Arc::clone(&self.listeners);
        Disposer::new(move || {
            listeners.write().expect("lock").retain(|e| e.id != id);
        })
    }

    fn notify(&self, key: &K, value: Option<&V>) {
        // Snapshot matching callbacks, invoke outside the lock: listeners
        // may subscribe or dispose from within their callback.
        let matching: Vec<ChangeListener<K, V>> = {
            let listeners = self.listeners.read().expect("lock");
            listeners
                .iter()
                .filter(|e| match &e.key {
                    Some(k) => k == key,
                    None => true,
                })
                .map(|e| Arc::clone(&e.callback))
                .collect()
        };
        for callback in matching {
            callback(key, value);
        }
    }
}

/// One declarative wiring entry pairing a channel name with a decode
/// function producing change events. Evaluated by `wire_to_bus`, so
/// per-entity-type wiring is configuration, not imperative glue.
pub struct ChannelBinding<K, V> {
    pub channel: String,
    pub decode: Arc<dyn Fn(&[u8]) -> Result<Vec<Change<K, V>>, SyncError> + Send + Sync>,
}

/// The standard `<entity>_set` / `<entity>_delete` JSON bindings for an
/// entity type whose values know their own key.
pub fn json_bindings<E>(entity: &str) -> Vec<ChannelBinding<E::Key, E>>
where
    E: Keyed + DeserializeOwned + 'static,
    E::Key: DeserializeOwned,
{
    vec![
        ChannelBinding {
            channel: set_channel(entity),
            decode: Arc::new(|payload| {
                Ok(decode_json_set::<E>(payload)?
                    .into_iter()
                    .map(|(key, value)| Change::Set { key, value })
                    .collect())
            }),
        },
        ChannelBinding {
            channel: delete_channel(entity),
            decode: Arc::new(|payload| {
                Ok(decode_json_delete::<E::Key>(payload)?
                    .into_iter()
                    .map(|key| Change::Delete { key })
                    .collect())
            }),
        },
    ]
}

/// Wire a store to the bus from a binding list: each decoded change event
/// flows through `UnaryStore::apply`. Returns one disposer per binding;
/// dropping them detaches the store.
pub fn wire_to_bus<K, V>(
    store: &UnaryStore<K, V>,
    bus: &ChannelBus,
    bindings: Vec<ChannelBinding<K, V>>,
) -> Vec<Disposer>
where
    K: EntityKey,
    V: Clone + Send + Sync + 'static,
{
    bindings
        .into_iter()
        .map(|binding| {
            debug!("wiring channel '{}'", binding.channel);
            let store = store.clone();
            let decode = binding.decode;
            bus.add_listener(
                &[binding.channel.as_str()],
                move |payload| decode(payload),
                move |_, changes| {
                    for change in changes {
                        store.apply(change);
                    }
                },
            )
        })
        .collect()
}
