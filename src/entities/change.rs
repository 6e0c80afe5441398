//! Change events and the set/delete channel naming convention.
//!
//! Every synchronized entity type exposes two well-known channels: one
//! carrying the entity's canonical serialized form on create/update, and one
//! carrying bare keys on removal. The bus and store wiring are generic over
//! this convention.

use std::hash::Hash;

use log::warn;
use serde::de::DeserializeOwned;

use crate::error::SyncError;

/// Bound for entity keys: opaque, comparable, unique within one entity
/// type's namespace. Blanket-implemented; never implement manually.
pub trait EntityKey: Clone + Eq + Hash + Send + Sync + 'static {}

impl<T: Clone + Eq + Hash + Send + Sync + 'static> EntityKey for T {}

/// An entity value that knows its own key.
pub trait Keyed {
    type Key: EntityKey;

    fn key(&self) -> Self::Key;
}

/// A single change notification for one entity. Immutable once constructed.
#[derive(Debug, Clone, PartialEq)]
pub enum Change<K, V> {
    /// Entity created or updated.
    Set { key: K, value: V },
    /// Entity removed.
    Delete { key: K },
}

impl<K, V> Change<K, V> {
    pub fn key(&self) -> &K {
        match self {
            Change::Set { key, .. } => key,
            Change::Delete { key } => key,
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, Change::Delete { .. })
    }
}

/// Well-known channel name carrying serialized entities on create/update.
pub fn set_channel(entity: &str) -> String {
    format!("{entity}_set")
}

/// Well-known channel name carrying bare keys on removal.
pub fn delete_channel(entity: &str) -> String {
    format!("{entity}_delete")
}

/// Decode a JSON batch into typed items, dropping malformed elements.
///
/// The batch must be a JSON array; a batch that is not an array is a decode
/// error for the whole registration. Individual elements that fail schema
/// validation are dropped with a warning so one bad message never poisons the
/// rest of the batch.
pub fn decode_json_items<T: DeserializeOwned>(payload: &[u8]) -> Result<Vec<T>, SyncError> {
    let raw: Vec<serde_json::Value> = serde_json::from_slice(payload)?;
    let mut items = Vec::with_capacity(raw.len());
    for value in raw {
        match serde_json::from_value::<T>(value) {
            Ok(item) => items.push(item),
            Err(e) => warn!("dropping malformed channel item: {}", e),
        }
    }
    Ok(items)
}

/// Decode a set-channel batch into `(key, value)` pairs for store wiring.
pub fn decode_json_set<E>(payload: &[u8]) -> Result<Vec<(E::Key, E)>, SyncError>
where
    E: Keyed + DeserializeOwned,
{
    Ok(decode_json_items::<E>(payload)?
        .into_iter()
        .map(|e| (e.key(), e))
        .collect())
}

/// Decode a delete-channel batch into bare keys.
pub fn decode_json_delete<K: DeserializeOwned>(payload: &[u8]) -> Result<Vec<K>, SyncError> {
    decode_json_items::<K>(payload)
}
