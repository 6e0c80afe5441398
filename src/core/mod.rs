//! Core sync modules - bus, stores, queries, frame cache, workers
//!
//! These modules form the synchronization engine, independent of any UI.

pub mod bus;
pub mod disposer;
pub mod frame_cache;
pub mod list;
pub mod query;
pub mod registry;
pub mod unary;
pub mod workers;

// Re-exports for convenience
pub use bus::ChannelBus;
pub use disposer::Disposer;
pub use frame_cache::{CacheResult, FrameCache};
pub use list::{ListConfig, ListQuery, PageParams};
pub use query::{
    QueryObserver, QueryResult, QueryState, Retrieve, RetrieveConfig, Update, UpdateConfig,
};
pub use registry::StoreRegistry;
pub use unary::{ChannelBinding, UnaryStore, json_bindings, wire_to_bus};
pub use workers::Workers;
