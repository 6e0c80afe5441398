//! TELESYNC - Reactive synchronization and caching layer for telemetry
//! consoles.
//!
//! Sits between an RPC transport and console views: change notifications
//! fan out through the [`core::ChannelBus`] into per-entity-type
//! [`core::UnaryStore`]s and ordered [`core::ListQuery`] views, reactive
//! queries ([`core::Retrieve`] / [`core::Update`]) keep consumers fresh
//! without duplicate network calls, and the [`core::FrameCache`] holds
//! historical telemetry segments under a byte budget.

// Sync engine (bus, stores, queries, frame cache, workers)
pub mod core;

pub mod entities;
pub mod error;
pub mod transport;

// Re-export commonly used types from core
pub use core::{
    CacheResult, ChannelBus, Disposer, FrameCache, ListConfig, ListQuery, PageParams,
    QueryObserver, QueryResult, QueryState, Retrieve, RetrieveConfig, StoreRegistry, UnaryStore,
    Update, UpdateConfig, Workers, json_bindings, wire_to_bus,
};

// Re-export entities and the transport seam
pub use entities::{Change, Frame, Keyed, Series, TimeRange};
pub use error::SyncError;
pub use transport::{RawBatch, StreamReader, Transport};
