//! Tier Coordination
//!
//! The public store façade over the memory and disk tiers, its background
//! workers and its statistics.

mod accounting;
mod async_store;
mod coordinator;
mod workers;

use std::fmt::Debug;
use std::hash::Hash;

use serde::de::DeserializeOwned;
use serde::Serialize;

pub use accounting::{StoreCounters, StoreStatistics};
pub use async_store::AsyncTieredStore;
pub use coordinator::TieredStore;

/// Bounds a key type needs to live in a [`TieredStore`]
pub trait StoreKey:
    Eq + Hash + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<K> StoreKey for K where
    K: Eq + Hash + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}
