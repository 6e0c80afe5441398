//! Entity and telemetry types shared across stores and caches.

pub mod change;
pub mod telem;

pub use change::{Change, EntityKey, Keyed, delete_channel, set_channel};
pub use telem::{Frame, Series, TimeRange};
